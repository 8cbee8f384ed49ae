use std::cmp::Ordering;
use std::collections::BinaryHeap;

use ordered_float::OrderedFloat;

use crate::vector::Metric;

/// Ordered by `(distance, seq)`, so the heap top is the current worst hit.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate<T> {
    dist: OrderedFloat<f32>,
    seq: u64,
    item: T,
}

impl<T: Eq> Ord for Candidate<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .cmp(&other.dist)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl<T: Eq> PartialOrd for Candidate<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Exact k-nearest selection over a stream of `(seq, vector, item)` entries.
///
/// Keeps a max-heap bounded at `k`, so memory stays O(k) regardless of the
/// collection size. Equal distances resolve by `seq`, lower (older) first.
pub struct TopK<T> {
    k: usize,
    metric: Metric,
    heap: BinaryHeap<Candidate<T>>,
}

impl<T: Eq> TopK<T> {
    pub fn new(k: usize, metric: Metric) -> Self {
        Self {
            k,
            metric,
            heap: BinaryHeap::with_capacity(k.saturating_add(1).min(1024)),
        }
    }

    pub fn offer(&mut self, query: &[f32], seq: u64, vector: &[f32], item: T) {
        if self.k == 0 {
            return;
        }
        let candidate = Candidate {
            dist: OrderedFloat(self.metric.distance(query, vector)),
            seq,
            item,
        };

        if self.heap.len() < self.k {
            self.heap.push(candidate);
        } else if let Some(worst) = self.heap.peek() {
            if candidate < *worst {
                self.heap.pop();
                self.heap.push(candidate);
            }
        }
    }

    /// Hits sorted by ascending distance.
    pub fn into_sorted(self) -> Vec<(T, f32)> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|c| (c.item, c.dist.into_inner()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_k_nearest_in_order() {
        let mut top = TopK::new(2, Metric::Cosine);
        let q = [1.0, 0.0, 0.0];
        top.offer(&q, 0, &[0.0, 1.0, 0.0], "far");
        top.offer(&q, 1, &[1.0, 0.0, 0.0], "exact");
        top.offer(&q, 2, &[0.9, 0.1, 0.0], "close");

        let hits = top.into_sorted();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "exact");
        assert!(hits[0].1.abs() < 1e-6);
        assert_eq!(hits[1].0, "close");
    }

    #[test]
    fn ties_prefer_earlier_insertions() {
        let mut top = TopK::new(3, Metric::Euclidean);
        let q = [0.0, 0.0];
        for (seq, name) in [(5, "e"), (1, "b"), (3, "c"), (0, "a")] {
            top.offer(&q, seq, &[1.0, 0.0], name);
        }
        let names: Vec<&str> = top.into_sorted().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn zero_k_returns_nothing() {
        let mut top = TopK::new(0, Metric::Cosine);
        top.offer(&[1.0], 0, &[1.0], 1u8);
        assert!(top.into_sorted().is_empty());
    }
}
