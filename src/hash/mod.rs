//! Hashing used by the consistent-hash selectors.
//!
//! # Data Flow
//! ```text
//! config hashFunc ("murmur3" | "fnv")
//!     → registry.rs (name → Hash64Fn)
//!     → ring hash / maglev build and key derivation
//!
//! l5 cst hash ring → murmur.rs murmur3_32 directly
//! ```
//!
//! # Design Decisions
//! - Functions are plain `fn` pointers; no allocation per hash
//! - The registry is owned by the context and passed by reference
//! - murmur3 is the default; it matches the other client implementations

pub mod murmur;
pub mod registry;

pub use murmur::{murmur3_32, murmur3_64};
pub use registry::{Hash64Fn, HashRegistry, DEFAULT_HASH_FUNC};
