//! Legacy L5 consistent-hash ring on murmur3_32.

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::hash::murmur3_32;
use crate::model::{Criteria, Instance};

const L5_SEED: u32 = 16;

/// Ring with one point per unit of weight.
#[derive(Debug)]
pub struct CstHashRing {
    ring: BTreeMap<u32, usize>,
    instance_count: usize,
    brpc_compatible: bool,
}

fn host_order(host: &str) -> u32 {
    host.parse::<Ipv4Addr>().map(u32::from).unwrap_or(0)
}

/// Whether `current` keeps a point both claim: heavier wins, then the lower
/// address, then the lower port.
fn keeps_point(current: &Instance, challenger: &Instance) -> bool {
    if current.weight != challenger.weight {
        return current.weight > challenger.weight;
    }
    let (a, b) = (host_order(&current.host), host_order(&challenger.host));
    if a != b {
        return a < b;
    }
    current.port < challenger.port
}

impl CstHashRing {
    /// Build over `instances`, leaving out `half_open` ids unless that would
    /// leave the ring empty.
    pub fn setup(instances: &[Arc<Instance>], half_open: &HashSet<String>, brpc_compatible: bool) -> Self {
        let mut ring = Self::build(instances, half_open, brpc_compatible);
        if ring.ring.is_empty() && !half_open.is_empty() {
            ring = Self::build(instances, &HashSet::new(), brpc_compatible);
        }
        ring
    }

    fn build(instances: &[Arc<Instance>], half_open: &HashSet<String>, brpc_compatible: bool) -> Self {
        let mut ring: BTreeMap<u32, usize> = BTreeMap::new();
        for (index, inst) in instances.iter().enumerate() {
            if half_open.contains(&inst.id) {
                continue;
            }
            for vnode in 0..inst.weight {
                let hash = if brpc_compatible {
                    let key = format!("{}:{}-{}", inst.host, inst.port, vnode);
                    murmur3_32(key.as_bytes(), 0)
                } else {
                    let key = format!("{}:{}:{}", inst.host, vnode, inst.port);
                    murmur3_32(key.as_bytes(), L5_SEED)
                };
                match ring.get_mut(&hash) {
                    Some(owner) => {
                        if !keeps_point(&instances[*owner], inst) {
                            *owner = index;
                        }
                    }
                    None => {
                        ring.insert(hash, index);
                    }
                }
            }
        }
        Self {
            ring,
            instance_count: instances.len(),
            brpc_compatible,
        }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    fn key(&self, criteria: &Criteria) -> u32 {
        if self.brpc_compatible {
            if criteria.hash_key != 0 || criteria.hash_string.is_empty() {
                criteria.hash_key as u32
            } else {
                murmur3_32(criteria.hash_string.as_bytes(), 0)
            }
        } else {
            murmur3_32(&criteria.hash_key.to_le_bytes(), L5_SEED)
        }
    }

    pub fn select(&self, criteria: &Criteria) -> Option<usize> {
        let key = self.key(criteria);
        let mut walk = self.ring.range(key..).chain(self.ring.range(..key)).map(|(_, idx)| *idx);
        let primary = walk.next()?;
        if criteria.replicate_index == 0 || self.instance_count == 0 {
            return Some(primary);
        }
        let replicate = criteria.replicate_index as usize % self.instance_count;
        if replicate == 0 {
            return Some(primary);
        }

        let mut seen = vec![primary];
        for index in walk {
            if !seen.contains(&index) {
                seen.push(index);
                if seen.len() > replicate {
                    return Some(index);
                }
            }
        }
        Some(primary)
    }
}
