//! Local service-data registry.
//!
//! # Data Flow
//! ```text
//! ServiceDataSource (static config, remote sync)
//!     → ServiceDataRegistry::update (atomic pointer swap per key)
//!     → DataNotify::notify_all (first synced snapshot wakes waiters)
//!
//! Consumer call
//!     → wait_for(key, type, timeout)
//!         → load_with_notify (subscribes on first use)
//!         → DataNotify::wait(timeout)
//!     → Arc<ServiceData> pinned for the whole call
//! ```
//!
//! # Design Decisions
//! - Snapshots are immutable; an update replaces, never mutates
//! - Per-service runtime state (`Service`) lives beside the snapshots and
//!   survives their replacement
//! - Waiting is the only blocking point of the consumer path

pub mod local;
pub mod notify;
pub mod source;

pub use local::ServiceDataRegistry;
pub use notify::DataNotify;
pub use source::{ServiceDataSource, StaticDataSource};
