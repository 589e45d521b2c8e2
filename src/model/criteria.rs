//! Selection criteria passed to the load balancers.

/// Per-request input of a selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Criteria {
    /// Consistent-hash key used as is.
    pub hash_key: u64,
    /// Consistent-hash key hashed first; wins over `hash_key` when set.
    pub hash_string: String,
    /// Skip the half-open first-refusal check.
    pub ignore_half_open: bool,
    /// 0 is the primary; k > 0 asks for the k-th distinct backup.
    pub replicate_index: u32,
}

impl Criteria {
    pub fn with_hash_key(hash_key: u64) -> Self {
        Self {
            hash_key,
            ..Default::default()
        }
    }

    pub fn with_hash_string(hash_string: impl Into<String>) -> Self {
        Self {
            hash_string: hash_string.into(),
            ..Default::default()
        }
    }

    pub fn replicate(mut self, index: u32) -> Self {
        self.replicate_index = index;
        self
    }

    pub fn ignoring_half_open(mut self) -> Self {
        self.ignore_half_open = true;
        self
    }
}
