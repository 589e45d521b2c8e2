//! Shared caches.
//!
//! # Data Flow
//! ```text
//! balancer / router request
//!     → RefCountedCache::create_or_get(key, builder)
//!         hit  → Arc<V> (access time refreshed)
//!         miss → per-key build lock → builder() → publish → Arc<V>
//!
//! CacheSweeper tick (every clear interval)
//!     → Sweepable::sweep(idle threshold) on every registered cache
//! ```
//!
//! # Design Decisions
//! - Values are handed out as `Arc`; the cache never invalidates a held value
//! - Builds serialize per key only, lookups never block
//! - Sweeping is a background task, not part of the request path

pub mod ref_counted;
pub mod sweeper;

pub use ref_counted::{RefCountedCache, Sweepable};
pub use sweeper::CacheSweeper;
