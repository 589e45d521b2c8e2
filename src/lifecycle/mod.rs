//! Lifecycle management.
//!
//! # Data Flow
//! ```text
//! Context startup:
//!     Load config → Validate → Build registry, breakers, routers
//!     → Spawn timing, sweeper, health and watcher tasks
//!
//! Shutdown (shutdown.rs):
//!     ctrl-c or Context drop → broadcast → every task leaves its loop
//! ```
//!
//! # Design Decisions
//! - One broadcast channel reaches every background task
//! - Tasks exit at their next select point; nothing is cancelled mid-pass

pub mod shutdown;

pub use shutdown::Shutdown;
