//! Random-projection forests for seeding neighbor searches.
//!
//! A split picks two random points of a node and cuts along the hyperplane
//! equidistant from them, so every tree partitions space along different
//! directions. A single axis-aligned tree with a leaf budget leaves points
//! near its top-level planes cut off from their true neighbors; leaves of
//! several independently oriented trees overlap across those planes.

use crate::rng::substream_rng;
use ndarray::ArrayView2;
use rand::prelude::*;
use rayon::prelude::*;

/// Leaves of several random-projection trees over the same rows.
#[derive(Debug, Clone)]
pub(crate) struct RpForest {
    leaves: Vec<Vec<usize>>,
}

impl RpForest {
    /// Build `n_trees` trees whose leaves hold at most `leaf_size` rows.
    pub(crate) fn build(
        data: ArrayView2<'_, f32>,
        n_trees: usize,
        leaf_size: usize,
        seed: u64,
    ) -> Self {
        let leaf_size = leaf_size.max(1);
        let leaves = (0..n_trees as u64)
            .into_par_iter()
            .map(|tree| {
                let mut rng = substream_rng(seed, tree);
                grow(data, leaf_size, &mut rng)
            })
            .collect::<Vec<_>>()
            .concat();
        Self { leaves }
    }

    pub(crate) fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// For every row, the other rows sharing a leaf with it in any tree.
    pub(crate) fn co_members(&self, n: usize) -> Vec<Vec<usize>> {
        let mut shared: Vec<Vec<usize>> = vec![Vec::new(); n];
        for leaf in &self.leaves {
            for &p in leaf {
                shared[p].extend(leaf.iter().copied().filter(|&q| q != p));
            }
        }
        shared.par_iter_mut().for_each(|row| {
            row.sort_unstable();
            row.dedup();
        });
        shared
    }
}

fn grow(data: ArrayView2<'_, f32>, leaf_size: usize, rng: &mut StdRng) -> Vec<Vec<usize>> {
    let mut leaves = Vec::new();
    let mut stack = vec![(0..data.nrows()).collect::<Vec<usize>>()];
    while let Some(node) = stack.pop() {
        if node.len() <= leaf_size {
            if !node.is_empty() {
                leaves.push(node);
            }
            continue;
        }
        let (left, right) = split(data, node, rng);
        stack.push(right);
        stack.push(left);
    }
    leaves
}

fn split(data: ArrayView2<'_, f32>, mut node: Vec<usize>, rng: &mut StdRng) -> (Vec<usize>, Vec<usize>) {
    let i = rng.random_range(0..node.len());
    let mut j = rng.random_range(0..node.len() - 1);
    if j >= i {
        j += 1;
    }
    let (a, b) = (data.row(node[i]), data.row(node[j]));
    let normal = &a - &b;
    let offset = normal.dot(&((&a + &b) * 0.5));

    let mut left = Vec::with_capacity(node.len() / 2 + 1);
    let mut right = Vec::with_capacity(node.len() / 2 + 1);
    for &p in &node {
        let margin = normal.dot(&data.row(p)) - offset;
        let go_left = if margin == 0.0 {
            rng.random_bool(0.5)
        } else {
            margin > 0.0
        };
        if go_left {
            left.push(p);
        } else {
            right.push(p);
        }
    }

    if left.is_empty() || right.is_empty() {
        // Coincident pivots or duplicate rows: fall back to a random halving.
        node.shuffle(rng);
        let right = node.split_off(node.len() / 2);
        return (node, right);
    }
    (left, right)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neighbors::tests::random_points;
    use ndarray::Array2;

    #[test]
    fn test_every_tree_covers_every_row() {
        let points = random_points(400, 3, 2);
        let forest = RpForest::build(points.data(), 3, 10, 9);
        let mut seen = vec![0usize; 400];
        for leaf in &forest.leaves {
            assert!(!leaf.is_empty() && leaf.len() <= 10);
            for &p in leaf {
                seen[p] += 1;
            }
        }
        assert!(seen.iter().all(|&c| c == 3));
    }

    #[test]
    fn test_duplicate_rows_terminate() {
        let data = Array2::from_elem((50, 2), 0.25f32);
        let forest = RpForest::build(data.view(), 2, 4, 1);
        assert!(forest.leaves.iter().all(|leaf| leaf.len() <= 4));
        let shared = forest.co_members(50);
        assert!(shared.iter().enumerate().all(|(i, row)| !row.contains(&i)));
    }

    #[test]
    fn test_seeded_forest_is_deterministic() {
        let points = random_points(200, 4, 6);
        let a = RpForest::build(points.data(), 4, 8, 33).co_members(200);
        let b = RpForest::build(points.data(), 4, 8, 33).co_members(200);
        assert_eq!(a, b);
    }
}
