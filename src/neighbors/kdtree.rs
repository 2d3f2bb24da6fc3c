//! KD-tree for exact and budgeted kNN queries.
//!
//! Nodes live in a flat arena. Each split cuts the widest axis of the node's
//! bounding box at the median point, so the tree is balanced and its depth is
//! `O(log N)`. Leaves hold at most `leaf_size` points.
//!
//! Queries descend to the nearer child first and visit the farther child only
//! when the splitting plane is within the current k-th distance. A leaf budget
//! turns the exact search into a cheap approximate one, used to seed NNDescent.

use super::{brute_force, check_neighbor_count, Candidate, NeighborGraph, NeighborIndex};
use crate::error::Result;
use crate::metric::{euclidean, Metric, PointSet};
use log::debug;
use ndarray::{ArrayView1, ArrayView2};
use rayon::prelude::*;
use std::collections::BinaryHeap;

const DEFAULT_LEAF_SIZE: usize = 16;

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        start: usize,
        end: usize,
    },
    Split {
        axis: usize,
        value: f32,
        left: usize,
        right: usize,
    },
}

/// Balanced KD-tree over the rows of a matrix.
#[derive(Debug, Clone)]
pub struct KdTree<'a> {
    data: ArrayView2<'a, f32>,
    nodes: Vec<Node>,
    order: Vec<usize>,
}

impl<'a> KdTree<'a> {
    /// Build a tree with the default leaf size.
    pub fn new(data: ArrayView2<'a, f32>) -> Self {
        Self::with_leaf_size(data, DEFAULT_LEAF_SIZE)
    }

    /// Build a tree whose leaves hold at most `leaf_size` points.
    pub fn with_leaf_size(data: ArrayView2<'a, f32>, leaf_size: usize) -> Self {
        let mut tree = Self {
            data,
            nodes: Vec::new(),
            order: (0..data.nrows()).collect(),
        };
        if data.nrows() > 0 {
            tree.build(0, data.nrows(), leaf_size.max(1));
        }
        tree
    }

    /// Number of arena nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn build(&mut self, start: usize, end: usize, leaf_size: usize) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { start, end });
        if end - start <= leaf_size {
            return id;
        }

        let (axis, spread) = self.widest_axis(start, end);
        if spread <= 0.0 {
            // All points coincide; splitting would not terminate.
            return id;
        }

        let mid = start + (end - start) / 2;
        let data = self.data;
        self.order[start..end].select_nth_unstable_by(mid - start, |&a, &b| {
            data[[a, axis]]
                .total_cmp(&data[[b, axis]])
                .then(a.cmp(&b))
        });
        let value = data[[self.order[mid], axis]];

        let left = self.build(start, mid, leaf_size);
        let right = self.build(mid, end, leaf_size);
        self.nodes[id] = Node::Split {
            axis,
            value,
            left,
            right,
        };
        id
    }

    fn widest_axis(&self, start: usize, end: usize) -> (usize, f32) {
        let mut best = (0, f32::NEG_INFINITY);
        for axis in 0..self.data.ncols() {
            let mut lo = f32::INFINITY;
            let mut hi = f32::NEG_INFINITY;
            for &p in &self.order[start..end] {
                let v = self.data[[p, axis]];
                lo = lo.min(v);
                hi = hi.max(v);
            }
            if hi - lo > best.1 {
                best = (axis, hi - lo);
            }
        }
        best
    }

    /// Exact `k` nearest rows to `query`, skipping `exclude`.
    pub fn query(
        &self,
        query: ArrayView1<'_, f32>,
        k: usize,
        exclude: Option<usize>,
    ) -> Vec<(usize, f32)> {
        self.search(query, k, exclude, usize::MAX)
            .into_iter()
            .map(|c| (c.index, c.dist))
            .collect()
    }

    /// Nearest rows found while visiting at most `max_leaves` leaves.
    pub(crate) fn search(
        &self,
        query: ArrayView1<'_, f32>,
        k: usize,
        exclude: Option<usize>,
        max_leaves: usize,
    ) -> Vec<Candidate> {
        let mut heap = BinaryHeap::with_capacity(k + 1);
        if k == 0 || self.nodes.is_empty() {
            return Vec::new();
        }
        let mut budget = max_leaves;
        self.visit(0, query, k, exclude, &mut heap, &mut budget);
        heap.into_sorted_vec()
    }

    fn visit(
        &self,
        node: usize,
        query: ArrayView1<'_, f32>,
        k: usize,
        exclude: Option<usize>,
        heap: &mut BinaryHeap<Candidate>,
        budget: &mut usize,
    ) {
        if *budget == 0 {
            return;
        }
        match self.nodes[node] {
            Node::Leaf { start, end } => {
                *budget -= 1;
                for &p in &self.order[start..end] {
                    if Some(p) == exclude {
                        continue;
                    }
                    let c = Candidate::new(euclidean(query, self.data.row(p)), p);
                    if heap.len() < k {
                        heap.push(c);
                    } else if heap.peek().is_some_and(|worst| c < *worst) {
                        heap.pop();
                        heap.push(c);
                    }
                }
            }
            Node::Split {
                axis,
                value,
                left,
                right,
            } => {
                let diff = query[axis] - value;
                let (near, far) = if diff < 0.0 {
                    (left, right)
                } else {
                    (right, left)
                };
                self.visit(near, query, k, exclude, heap, budget);
                let within = heap.len() < k || heap.peek().is_some_and(|w| diff.abs() <= w.dist);
                if within {
                    self.visit(far, query, k, exclude, heap, budget);
                }
            }
        }
    }
}

/// Exact kNN graph via a KD-tree.
#[derive(Debug, Clone)]
pub struct ExactKdTree {
    leaf_size: usize,
}

impl Default for ExactKdTree {
    fn default() -> Self {
        Self {
            leaf_size: DEFAULT_LEAF_SIZE,
        }
    }
}

impl ExactKdTree {
    /// Set the leaf size.
    pub fn with_leaf_size(mut self, leaf_size: usize) -> Self {
        self.leaf_size = leaf_size.max(1);
        self
    }
}

impl NeighborIndex for ExactKdTree {
    fn build(&self, points: &PointSet, k: usize, _seed: u64) -> Result<NeighborGraph> {
        check_neighbor_count(points.len(), k)?;
        if points.metric() == Metric::Precomputed || points.len() <= self.leaf_size {
            return brute_force(points, k);
        }
        let tree = KdTree::with_leaf_size(points.data(), self.leaf_size);
        debug!(
            "kd-tree over {} points: {} nodes",
            points.len(),
            tree.node_count()
        );
        let rows: Vec<Vec<Candidate>> = (0..points.len())
            .into_par_iter()
            .map(|i| tree.search(points.row(i), k, Some(i), usize::MAX))
            .collect();
        NeighborGraph::from_rows(k, rows)
    }

    fn name(&self) -> &'static str {
        "exact"
    }
}
