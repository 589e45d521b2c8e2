//! Weighted random selection over cumulative weights.

use std::collections::HashSet;
use std::sync::Arc;

use rand::Rng;

use crate::model::Instance;

/// Cumulative weight table. Half-open instances stay in with weight 1 so
/// that a set made only of them can still serve.
#[derive(Debug)]
pub struct WeightedRandomSelector {
    cumulative: Vec<(u64, usize)>,
    total: u64,
}

impl WeightedRandomSelector {
    pub fn setup(instances: &[Arc<Instance>], half_open: &HashSet<String>, dynamic_weight: bool) -> Self {
        let mut cumulative = Vec::with_capacity(instances.len());
        let mut total = 0u64;
        for (index, inst) in instances.iter().enumerate() {
            let weight = if half_open.contains(&inst.id) {
                1
            } else if dynamic_weight {
                inst.dynamic_weight.unwrap_or(inst.weight)
            } else {
                inst.weight
            };
            if weight > 0 {
                total += weight as u64;
                cumulative.push((total, index));
            }
        }
        Self { cumulative, total }
    }

    pub fn total_weight(&self) -> u64 {
        self.total
    }

    pub fn select(&self) -> Option<usize> {
        if self.total == 0 {
            return None;
        }
        let point = rand::thread_rng().gen_range(0..self.total);
        self.pick(point)
    }

    /// First entry whose cumulative weight is above `point`.
    fn pick(&self, point: u64) -> Option<usize> {
        let position = self.cumulative.partition_point(|(upper, _)| *upper <= point);
        self.cumulative.get(position).map(|(_, index)| *index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instances() -> Vec<Arc<Instance>> {
        vec![
            Arc::new(Instance::new("a", "10.0.0.1", 80).with_weight(10)),
            Arc::new(Instance::new("z", "10.0.0.2", 80).with_weight(0)),
            Arc::new(Instance::new("b", "10.0.0.3", 80).with_weight(30).with_dynamic_weight(5)),
        ]
    }

    #[test]
    fn test_upper_bound_pick() {
        let s = WeightedRandomSelector::setup(&instances(), &HashSet::new(), false);
        assert_eq!(s.total_weight(), 40);
        assert_eq!(s.pick(0), Some(0));
        assert_eq!(s.pick(9), Some(0));
        assert_eq!(s.pick(10), Some(2));
        assert_eq!(s.pick(39), Some(2));
    }

    #[test]
    fn test_half_open_and_dynamic_weight() {
        let half_open: HashSet<String> = ["a".to_string()].into_iter().collect();
        let s = WeightedRandomSelector::setup(&instances(), &half_open, true);
        assert_eq!(s.total_weight(), 6);
        assert!(s.select().is_some());
    }

    #[test]
    fn test_no_weight_no_pick() {
        let only_zero = vec![Arc::new(Instance::new("z", "10.0.0.2", 80).with_weight(0))];
        assert_eq!(WeightedRandomSelector::setup(&only_zero, &HashSet::new(), false).select(), None);
    }
}
