//! Named hash function registry.

use std::collections::HashMap;
use std::hash::Hasher;

use fnv::FnvHasher;

use crate::error::{PolarisError, PolarisResult};
use crate::hash::murmur::murmur3_64;

/// A seeded 64-bit hash over raw bytes.
pub type Hash64Fn = fn(&[u8], u32) -> u64;

pub const MURMUR3: &str = "murmur3";
pub const FNV: &str = "fnv";
pub const DEFAULT_HASH_FUNC: &str = MURMUR3;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a 64 with the seed folded into the offset basis.
pub fn fnv_64(data: &[u8], seed: u32) -> u64 {
    let mut hasher = FnvHasher::with_key(FNV_OFFSET_BASIS ^ seed as u64);
    hasher.write(data);
    hasher.finish()
}

/// Hash functions selectable by name from configuration.
///
/// Owned by the runtime context; there is no process-wide instance.
#[derive(Debug, Clone)]
pub struct HashRegistry {
    funcs: HashMap<String, Hash64Fn>,
}

impl HashRegistry {
    /// Registry holding the built-in `murmur3` and `fnv` functions.
    pub fn new() -> Self {
        let mut funcs: HashMap<String, Hash64Fn> = HashMap::new();
        funcs.insert(MURMUR3.to_string(), murmur3_64);
        funcs.insert(FNV.to_string(), fnv_64);
        Self { funcs }
    }

    /// Add or replace a function. Returns true when a previous entry was replaced.
    pub fn register(&mut self, name: &str, func: Hash64Fn) -> bool {
        let replaced = self.funcs.insert(name.to_string(), func).is_some();
        tracing::debug!(hash_func = name, replaced, "Hash function registered");
        replaced
    }

    pub fn get(&self, name: &str) -> PolarisResult<Hash64Fn> {
        self.funcs
            .get(name)
            .copied()
            .ok_or_else(|| PolarisError::InvalidConfig(format!("unknown hash function '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.funcs.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.funcs.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for HashRegistry {
    fn default() -> Self {
        Self::new()
    }
}
