//! Maglev lookup table.
//!
//! Each instance walks its own permutation of the table (`offset`, `skip`
//! derived from `host:port`) and claims free slots in weighted turns until the
//! table is full. Lookup is one modulo.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{PolarisError, PolarisResult};
use crate::hash::Hash64Fn;
use crate::load_balancer::criteria_hash;
use crate::model::{Criteria, Instance};

pub const DEFAULT_TABLE_SIZE: u32 = 65_537;
pub const LARGE_TABLE_SIZE: u32 = 655_373;

const EMPTY_SLOT: u32 = u32::MAX;

pub fn is_prime(n: u32) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3u64;
    while d * d <= n as u64 {
        if n as u64 % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

#[derive(Debug)]
struct Permutation {
    index: u32,
    offset: u64,
    skip: u64,
    next: u64,
    normalized_weight: f64,
    target_weight: f64,
    claimed: u32,
}

impl Permutation {
    fn slot(&self, table_size: u64) -> usize {
        ((self.offset + self.skip * self.next) % table_size) as usize
    }
}

#[derive(Debug)]
pub struct MaglevTable {
    entries: Vec<u32>,
    hash_func: Hash64Fn,
}

impl MaglevTable {
    /// Fill a table of `table_size` slots over `instances`, leaving out the
    /// ids in `half_open`. Entries are positions in `instances`.
    ///
    /// A table smaller than the instance count is promoted to 65537 or
    /// 655373; more than 655373 instances cannot be placed.
    pub fn setup(
        instances: &[Arc<Instance>],
        half_open: &HashSet<String>,
        table_size: u32,
        hash_func: Hash64Fn,
    ) -> PolarisResult<Self> {
        let eligible: Vec<(usize, &Arc<Instance>)> = instances
            .iter()
            .enumerate()
            .filter(|(_, inst)| !half_open.contains(&inst.id))
            .collect();
        let count = eligible.len();
        if count == 0 || table_size == 0 {
            return Ok(Self {
                entries: Vec::new(),
                hash_func,
            });
        }
        let table_size = match table_size {
            size if (size as usize) >= count => size,
            _ if count > LARGE_TABLE_SIZE as usize => {
                return Err(PolarisError::InvalidConfig(format!(
                    "{} instances exceed the largest maglev table ({})",
                    count, LARGE_TABLE_SIZE
                )));
            }
            _ if count > DEFAULT_TABLE_SIZE as usize => LARGE_TABLE_SIZE,
            _ => DEFAULT_TABLE_SIZE,
        };
        let m = table_size as u64;

        let total_weight: u64 = eligible.iter().map(|(_, inst)| inst.weight as u64).sum();
        if total_weight == 0 {
            return Ok(Self {
                entries: Vec::new(),
                hash_func,
            });
        }
        let mut max_weight = 0f64;
        let mut permutations: Vec<Permutation> = eligible
            .iter()
            .map(|&(i, inst)| {
                let address = inst.address();
                let normalized_weight = inst.weight as f64 / total_weight as f64;
                max_weight = max_weight.max(normalized_weight);
                Permutation {
                    index: i as u32,
                    offset: hash_func(address.as_bytes(), 1) % m,
                    skip: hash_func(address.as_bytes(), 2) % (m - 1).max(1) + 1,
                    next: 0,
                    normalized_weight,
                    target_weight: 0.0,
                    claimed: 0,
                }
            })
            .collect();

        let mut entries = vec![EMPTY_SLOT; table_size as usize];
        let mut filled = 0u64;
        let mut iteration = 1u64;
        while filled < m {
            for perm in permutations.iter_mut() {
                if filled >= m {
                    break;
                }
                if (iteration as f64) * perm.normalized_weight < perm.target_weight {
                    continue;
                }
                perm.target_weight += max_weight;
                let mut slot = perm.slot(m);
                while entries[slot] != EMPTY_SLOT {
                    perm.next += 1;
                    slot = perm.slot(m);
                }
                entries[slot] = perm.index;
                perm.next += 1;
                perm.claimed += 1;
                filled += 1;
            }
            iteration += 1;
        }

        let min = permutations.iter().map(|p| p.claimed).min().unwrap_or(0);
        let max = permutations.iter().map(|p| p.claimed).max().unwrap_or(0);
        tracing::debug!(instances = count, table_size, min_entries = min, max_entries = max, "Maglev table built");
        Ok(Self { entries, hash_func })
    }

    pub fn table_size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn select(&self, criteria: &Criteria) -> Option<usize> {
        match self.entries.len() {
            0 => None,
            1 => Some(self.entries[0] as usize),
            len => {
                let key = criteria_hash(criteria, self.hash_func, "maglev");
                Some(self.entries[(key % len as u64) as usize] as usize)
            }
        }
    }

    /// Slots owned by each instance index.
    pub fn slot_counts(&self, instance_count: usize) -> Vec<u32> {
        let mut counts = vec![0u32; instance_count];
        for &entry in &self.entries {
            if let Some(c) = counts.get_mut(entry as usize) {
                *c += 1;
            }
        }
        counts
    }
}
