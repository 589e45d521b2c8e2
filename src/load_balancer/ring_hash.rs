//! Consistent-hash ring of weighted virtual nodes.
//!
//! # Responsibilities
//! - Place `weight`-proportional virtual nodes per instance on a sorted ring
//! - Resolve hash collisions with a bounded rehash, dropping what still collides
//! - Answer the first node at or after a key, or the k-th distinct backup
//!
//! # Design Decisions
//! - Compatible mode keys vnodes `"{id}{k}"` and scales by the maximum weight,
//!   matching the Go client placement
//! - Fast mode scales by the average share and reuses each instance's cached
//!   vnode hashes across rebuilds; only the delta is hashed

use std::collections::HashSet;
use std::sync::Arc;

use crate::hash::Hash64Fn;
use crate::load_balancer::criteria_hash;
use crate::model::{Criteria, Instance};

/// Attempts per virtual node before a colliding node is dropped.
const MAX_REHASH_ITERATION: u32 = 5;

pub const DEFAULT_VNODE_COUNT: u32 = 1024;
pub const DEFAULT_COMPATIBLE_VNODE_COUNT: u32 = 10;

/// Build parameters of a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingOptions {
    pub vnode_count: u32,
    /// Weight that maps to exactly `vnode_count` nodes; 0 derives it.
    pub base_weight: u32,
    pub compatible: bool,
}

impl Default for RingOptions {
    fn default() -> Self {
        Self {
            vnode_count: DEFAULT_VNODE_COUNT,
            base_weight: 0,
            compatible: false,
        }
    }
}

/// Immutable sorted ring of `(hash, instance index)` points.
#[derive(Debug)]
pub struct HashRing {
    points: Vec<(u64, usize)>,
    hash_func: Hash64Fn,
}

impl HashRing {
    /// Build a ring over `instances`, skipping ids in `half_open`.
    ///
    /// Indexes in the ring refer to positions in `instances`. The ring is
    /// empty when every instance was skipped or weighs nothing.
    pub fn setup(
        instances: &[Arc<Instance>],
        half_open: &HashSet<String>,
        options: RingOptions,
        hash_func: Hash64Fn,
    ) -> Self {
        let eligible: Vec<(usize, &Arc<Instance>)> = instances
            .iter()
            .enumerate()
            .filter(|(_, inst)| !half_open.contains(&inst.id))
            .collect();

        let mut ring = Self {
            points: Vec::new(),
            hash_func,
        };
        if eligible.is_empty() || options.vnode_count == 0 {
            return ring;
        }
        if options.compatible {
            ring.build_compatible(&eligible, options);
        } else {
            ring.build_fast(&eligible, options);
        }
        ring.points.sort_unstable();
        tracing::trace!(
            instances = eligible.len(),
            points = ring.points.len(),
            compatible = options.compatible,
            "Hash ring built"
        );
        ring
    }

    fn build_compatible(&mut self, eligible: &[(usize, &Arc<Instance>)], options: RingOptions) {
        let max_weight = if options.base_weight > 0 {
            options.base_weight
        } else {
            eligible.iter().map(|(_, inst)| inst.weight).max().unwrap_or(0)
        };
        if max_weight == 0 {
            return;
        }
        let hash = self.hash_func;
        let mut seen: HashSet<u64> = HashSet::with_capacity(eligible.len() * options.vnode_count as usize);
        self.points.reserve(eligible.len() * options.vnode_count as usize);

        for &(index, inst) in eligible {
            let share = inst.weight as f64 / max_weight as f64;
            let limit = (share * options.vnode_count as f64).floor() as u64;
            for k in 0..limit {
                let key = format!("{}{}", inst.id, k);
                let mut value = hash(key.as_bytes(), 0);
                if seen.insert(value) {
                    self.points.push((value, index));
                    continue;
                }
                tracing::warn!(instance = %inst.id, vnode = %key, hash = value, "Virtual node hash conflict");
                let mut placed = false;
                for _ in 0..MAX_REHASH_ITERATION {
                    value = hash(value.to_string().as_bytes(), 0);
                    if seen.insert(value) {
                        self.points.push((value, index));
                        placed = true;
                        break;
                    }
                }
                if !placed {
                    tracing::error!(
                        instance = %inst.id,
                        address = %inst.address(),
                        vnode = k,
                        tries = MAX_REHASH_ITERATION,
                        "Dropped virtual node after repeated hash conflicts"
                    );
                }
            }
        }
    }

    fn build_fast(&mut self, eligible: &[(usize, &Arc<Instance>)], options: RingOptions) {
        let hash = self.hash_func;
        let ring_len = eligible.len() as u64 * options.vnode_count as u64;
        let total_weight: u64 = eligible.iter().map(|(_, inst)| inst.weight as u64).sum();
        if total_weight == 0 && options.base_weight == 0 {
            return;
        }
        let mut seen: HashSet<u64> = HashSet::with_capacity(ring_len as usize);
        self.points.reserve(ring_len as usize);

        for &(index, inst) in eligible {
            let nodes = if options.base_weight > 0 {
                (inst.weight as f64 * options.vnode_count as f64 / options.base_weight as f64).floor() as u64
            } else {
                (ring_len as f64 * inst.weight as f64 / total_weight as f64).floor() as u64
            };
            if nodes == 0 {
                continue;
            }
            let real_node = hash(inst.id.as_bytes(), 0);
            if seen.insert(real_node) {
                self.points.push((real_node, index));
            }
            let limit = (nodes - 1) as usize;

            let mut cached = inst.lock_vnode_hashes();
            let mut next_key = cached.len() as u64 + 1;
            for k in 0..limit {
                let mut placed = false;
                for attempt in 1..=MAX_REHASH_ITERATION {
                    let value = if attempt == 1 && k < cached.len() {
                        cached[k]
                    } else {
                        let key = format!("{}:{}", inst.id, next_key);
                        next_key += 1;
                        hash(key.as_bytes(), 0)
                    };
                    if seen.insert(value) {
                        self.points.push((value, index));
                        if k >= cached.len() {
                            cached.push(value);
                        } else if attempt > 1 {
                            cached[k] = value;
                        }
                        placed = true;
                        break;
                    }
                    tracing::warn!(instance = %inst.id, vnode = k, hash = value, "Virtual node hash conflict");
                }
                if !placed {
                    tracing::error!(
                        instance = %inst.id,
                        address = %inst.address(),
                        vnode = k,
                        tries = MAX_REHASH_ITERATION,
                        "Dropped virtual node after repeated hash conflicts"
                    );
                }
            }
            // keep the cache when it is not far above what this build needed
            if options.vnode_count as usize * 2 >= limit * 3 {
                cached.truncate(limit);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Instance index owning `criteria`'s key, or its `replicate_index`-th
    /// distinct successor. Falls back to the primary when the ring holds
    /// too few distinct instances.
    pub fn select(&self, criteria: &Criteria) -> Option<usize> {
        match self.points.len() {
            0 => return None,
            1 => return Some(self.points[0].1),
            _ => {}
        }
        let key = criteria_hash(criteria, self.hash_func, "ringhash");
        Some(self.locate(key, criteria.replicate_index))
    }

    fn locate(&self, key: u64, replicate_index: u32) -> usize {
        let len = self.points.len();
        let position = self.points.partition_point(|(hash, _)| *hash < key) % len;
        let primary = self.points[position].1;
        if replicate_index == 0 {
            return primary;
        }

        let wanted = replicate_index as usize + 1;
        let mut distinct = vec![primary];
        for step in 1..len {
            let index = self.points[(position + step) % len].1;
            if !distinct.contains(&index) {
                distinct.push(index);
                if distinct.len() == wanted {
                    return index;
                }
            }
        }
        primary
    }
}
