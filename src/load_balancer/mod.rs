//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! routed ServiceInstances + Criteria
//!     → manager.rs (half-open first refusal, selector cache lookup)
//!     → selector built once per (instance set, breaker version):
//!         - weighted_random.rs (cumulative weights, upper bound)
//!         - ring_hash.rs (sorted virtual-node ring)
//!         - maglev.rs (prime-sized lookup table)
//!         - l5_cst_hash.rs (murmur3_32 ring, brpc compatible variant)
//!         - simple_hash.rs (hash key modulo)
//!     → index into the instance set → Arc<Instance>
//! ```
//!
//! # Design Decisions
//! - Selectors are immutable once built and shared through `RefCountedCache`
//! - The balancer kinds form a closed enum instead of a plugin registry
//! - Half-open instances are kept out of hash structures so that trial
//!   traffic is governed by the quota alone

pub mod l5_cst_hash;
pub mod maglev;
pub mod manager;
pub mod ring_hash;
pub mod simple_hash;
pub mod weighted_random;

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::PolarisError;
use crate::hash::Hash64Fn;
use crate::model::Criteria;

pub use l5_cst_hash::CstHashRing;
pub use maglev::MaglevTable;
pub use manager::LoadBalancer;
pub use ring_hash::HashRing;
pub use simple_hash::SimpleHashSelector;
pub use weighted_random::WeightedRandomSelector;

/// Supported balancing strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoadBalanceType {
    #[default]
    WeightedRandom,
    RingHash,
    Maglev,
    L5CstHash,
    /// L5 cst hash with brpc-compatible virtual node keys.
    CMurmurHash,
    SimpleHash,
}

impl LoadBalanceType {
    pub const ALL: [LoadBalanceType; 6] = [
        LoadBalanceType::WeightedRandom,
        LoadBalanceType::RingHash,
        LoadBalanceType::Maglev,
        LoadBalanceType::L5CstHash,
        LoadBalanceType::CMurmurHash,
        LoadBalanceType::SimpleHash,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalanceType::WeightedRandom => "weightedRandom",
            LoadBalanceType::RingHash => "ringHash",
            LoadBalanceType::Maglev => "maglev",
            LoadBalanceType::L5CstHash => "l5CstHash",
            LoadBalanceType::CMurmurHash => "cMurmurHash",
            LoadBalanceType::SimpleHash => "simpleHash",
        }
    }

    /// Whether a half-open instance may take this request before the
    /// selector runs. Ring hash and Maglev only offer it to primaries.
    fn offers_half_open(&self, criteria: &Criteria) -> bool {
        if criteria.ignore_half_open {
            return false;
        }
        match self {
            LoadBalanceType::RingHash | LoadBalanceType::Maglev => criteria.replicate_index == 0,
            _ => true,
        }
    }
}

impl fmt::Display for LoadBalanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalanceType {
    type Err = PolarisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LoadBalanceType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| PolarisError::InvalidConfig(format!("unknown load balancer type '{}'", s)))
    }
}

/// A built selector. Every variant answers with an index into the instance
/// set it was built from.
#[derive(Debug)]
pub enum Selector {
    WeightedRandom(WeightedRandomSelector),
    RingHash(HashRing),
    Maglev(MaglevTable),
    CstHash(CstHashRing),
    SimpleHash(SimpleHashSelector),
}

impl Selector {
    /// Whether nothing can be selected.
    pub fn is_empty(&self) -> bool {
        match self {
            Selector::WeightedRandom(s) => s.total_weight() == 0,
            Selector::RingHash(s) => s.is_empty(),
            Selector::Maglev(s) => s.is_empty(),
            Selector::CstHash(s) => s.is_empty(),
            Selector::SimpleHash(s) => s.is_empty(),
        }
    }

    pub fn select(&self, criteria: &Criteria) -> Option<usize> {
        match self {
            Selector::WeightedRandom(s) => s.select(),
            Selector::RingHash(s) => s.select(criteria),
            Selector::Maglev(s) => s.select(criteria),
            Selector::CstHash(s) => s.select(criteria),
            Selector::SimpleHash(s) => s.select(criteria),
        }
    }
}

/// 64-bit key a hash selector looks up.
///
/// `hash_string` wins, then a non-zero `hash_key`; without either a random
/// key is drawn so that keyless calls still spread.
pub(crate) fn criteria_hash(criteria: &Criteria, hash_func: Hash64Fn, prefix: &str) -> u64 {
    if !criteria.hash_string.is_empty() {
        return hash_func(criteria.hash_string.as_bytes(), 0);
    }
    if criteria.hash_key != 0 {
        return hash_func(&criteria.hash_key.to_le_bytes(), 0);
    }
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let random_key = format!("{}-{}-{}", prefix, secs, rand::random::<u32>());
    hash_func(random_key.as_bytes(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::murmur3_64;

    #[test]
    fn test_type_names_round_trip() {
        for t in LoadBalanceType::ALL {
            assert_eq!(t.as_str().parse::<LoadBalanceType>().unwrap(), t);
        }
        assert!(matches!(
            "roundRobin".parse::<LoadBalanceType>(),
            Err(PolarisError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_criteria_hash_prefers_string() {
        let by_string = Criteria::with_hash_string("user-1");
        assert_eq!(criteria_hash(&by_string, murmur3_64, "t"), murmur3_64(b"user-1", 0));
        let by_key = Criteria::with_hash_key(42);
        assert_eq!(criteria_hash(&by_key, murmur3_64, "t"), murmur3_64(&42u64.to_le_bytes(), 0));
    }
}
