//! `hash_key % n` selection.

use std::collections::HashSet;
use std::sync::Arc;

use crate::model::{Criteria, Instance};

#[derive(Debug)]
pub struct SimpleHashSelector {
    /// Per set position: whether that instance is half open.
    half_open: Vec<bool>,
}

impl SimpleHashSelector {
    pub fn setup(instances: &[Arc<Instance>], half_open: &HashSet<String>) -> Self {
        Self {
            half_open: instances.iter().map(|inst| half_open.contains(&inst.id)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.half_open.is_empty()
    }

    /// The instance at `hash_key % n`. A half-open pick moves forward to the
    /// next normal instance when one exists.
    pub fn select(&self, criteria: &Criteria) -> Option<usize> {
        let n = self.half_open.len() as u64;
        if n == 0 {
            return None;
        }
        let start = criteria.hash_key % n;
        if !self.half_open[start as usize] {
            return Some(start as usize);
        }
        (1..n)
            .map(|step| ((criteria.hash_key.wrapping_add(step)) % n) as usize)
            .find(|&index| !self.half_open[index])
            .or(Some(start as usize))
    }
}
