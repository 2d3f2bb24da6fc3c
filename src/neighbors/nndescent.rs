//! NNDescent refinement of an approximate kNN graph.
//!
//! "A neighbor of a neighbor is likely a neighbor" (Dong, Charikar & Li, 2011).
//! Starting from a rough graph, every round compares each point with the
//! neighbors of its neighbors and keeps the `k` closest seen so far.
//!
//! # Rounds
//!
//! ```text
//! 1. split each list into "new" (added last round) and "old" entries
//! 2. add reverse links (j lists i  ⇒  i is a reverse neighbor of j)
//! 3. local join: for every point u, candidates are reached through a
//!    u–v–c path in which at least one hop is new
//! 4. merge candidates into both endpoints' lists, count replacements
//! ```
//!
//! Each round reads a frozen graph and materialises a new one (the `collect`
//! is the barrier), so rounds are parallel per point yet deterministic.
//! Refinement stops when fewer than `delta · N · k` entries changed or after
//! `max_rounds`.
//!
//! The initial graph merges two cheap guesses: a KD-tree search restricted to
//! a few leaves per point, and the leaf co-members of a small random-projection
//! forest. The KD-tree alone confines every list to one box of space, and the
//! neighbors of those neighbors stay in the same box, so the join never
//! crosses the tree's upper split planes. The forest's leaves straddle them.
//! Rows that still hold fewer than `k` candidates are padded with seeded
//! random points.

use super::kdtree::KdTree;
use super::rptree::RpForest;
use super::{brute_force, check_neighbor_count, Candidate, NeighborGraph, NeighborIndex};
use crate::error::{Error, Result};
use crate::metric::{Metric, PointSet};
use crate::rng::{substream, substream_rng};
use log::{debug, trace};
use rand::prelude::*;
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// NNDescent tuning.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NnDescentParams {
    /// Maximum refinement rounds.
    pub max_rounds: usize,
    /// Stop when the fraction of replaced entries per round falls below this.
    pub delta: f32,
    /// Cap on new (and on old) join participants per point per round.
    pub max_candidates: usize,
    /// Leaves visited per point by the seeding KD-tree search.
    pub leaf_budget: usize,
    /// Leaf size of the seeding KD-tree and random-projection trees.
    pub leaf_size: usize,
    /// Random-projection trees merged into the seed lists.
    pub n_trees: usize,
}

impl Default for NnDescentParams {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            delta: 0.001,
            max_candidates: 20,
            leaf_budget: 3,
            leaf_size: 16,
            n_trees: 4,
        }
    }
}

impl NnDescentParams {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_candidates == 0 {
            return Err(Error::config("nndescent.max_candidates", "must be positive"));
        }
        if self.leaf_budget == 0 || self.leaf_size == 0 {
            return Err(Error::config(
                "nndescent.leaf_budget",
                "leaf budget and leaf size must be positive",
            ));
        }
        if self.n_trees == 0 {
            return Err(Error::config("nndescent.n_trees", "must be positive"));
        }
        if !(self.delta.is_finite() && self.delta >= 0.0) {
            return Err(Error::config("nndescent.delta", "must be finite and >= 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    cand: Candidate,
    fresh: bool,
}

/// Tree-seeded NNDescent.
#[derive(Debug, Clone, Default)]
pub struct NnDescent {
    params: NnDescentParams,
}

impl NnDescent {
    /// Create with explicit parameters.
    pub fn new(params: NnDescentParams) -> Self {
        Self { params }
    }

    /// Parameters in use.
    pub fn params(&self) -> &NnDescentParams {
        &self.params
    }

    /// Refine an initial guess. Rows may hold fewer than `k` entries; they are
    /// padded with seeded random points first.
    pub(crate) fn refine(
        &self,
        points: &PointSet,
        initial: Vec<Vec<Candidate>>,
        k: usize,
        seed: u64,
    ) -> Result<NeighborGraph> {
        check_neighbor_count(points.len(), k)?;
        let n = points.len();
        let rows = pad_random(points, initial, k, seed);
        let mut graph: Vec<Vec<Entry>> = rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|cand| Entry { cand, fresh: true })
                    .collect()
            })
            .collect();

        let threshold = (self.params.delta as f64 * (n * k) as f64).max(0.0);
        for round in 0..self.params.max_rounds {
            let (next, updates) = self.round(points, &mut graph, k, seed, round as u64);
            graph = next;
            trace!("nndescent round {round}: {updates} updates");
            if (updates as f64) <= threshold {
                debug!("nndescent converged after {} rounds", round + 1);
                break;
            }
        }

        let rows = graph
            .into_iter()
            .map(|row| row.into_iter().map(|e| e.cand).collect())
            .collect();
        NeighborGraph::from_rows(k, rows)
    }

    fn round(
        &self,
        points: &PointSet,
        graph: &mut [Vec<Entry>],
        k: usize,
        seed: u64,
        round: u64,
    ) -> (Vec<Vec<Entry>>, usize) {
        let n = graph.len();
        let cap = self.params.max_candidates;
        let mut rng = substream_rng(seed, round);

        let mut new_fwd: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut old_fwd: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, row) in graph.iter().enumerate() {
            for e in row {
                if e.fresh {
                    new_fwd[i].push(e.cand.index);
                } else {
                    old_fwd[i].push(e.cand.index);
                }
            }
        }
        let mut new_rev: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut old_rev: Vec<Vec<usize>> = vec![Vec::new(); n];
        for i in 0..n {
            for &j in &new_fwd[i] {
                new_rev[j].push(i);
            }
            for &j in &old_fwd[i] {
                old_rev[j].push(i);
            }
        }

        // Join participants: forward plus sampled reverse links.
        let mut new_all: Vec<Vec<usize>> = Vec::with_capacity(n);
        let mut old_all: Vec<Vec<usize>> = Vec::with_capacity(n);
        for i in 0..n {
            new_all.push(sample_union(&new_fwd[i], &mut new_rev[i], cap, &mut rng));
            old_all.push(sample_union(&old_fwd[i], &mut old_rev[i], cap, &mut rng));
        }
        for row in graph.iter_mut() {
            for e in row.iter_mut() {
                e.fresh = false;
            }
        }
        let graph: &[Vec<Entry>] = graph;

        let proposals: Vec<Vec<Candidate>> = (0..n)
            .into_par_iter()
            .map(|u| {
                let mut ids: Vec<usize> = Vec::new();
                for &v in &new_all[u] {
                    ids.extend_from_slice(&new_all[v]);
                    ids.extend_from_slice(&old_all[v]);
                }
                for &v in &old_all[u] {
                    ids.extend_from_slice(&new_all[v]);
                }
                ids.sort_unstable();
                ids.dedup();

                let worst_u = worst(&graph[u]);
                ids.into_iter()
                    .filter(|&c| c != u)
                    .filter_map(|c| {
                        let d = points.distance(u, c);
                        (d < worst_u || d < worst(&graph[c])).then(|| Candidate::new(d, c))
                    })
                    .collect()
            })
            .collect();

        let mut incoming: Vec<Vec<Candidate>> = vec![Vec::new(); n];
        for (u, cands) in proposals.iter().enumerate() {
            for c in cands {
                incoming[u].push(*c);
                incoming[c.index].push(Candidate::new(c.dist, u));
            }
        }

        let updates = AtomicUsize::new(0);
        let next: Vec<Vec<Entry>> = (0..n)
            .into_par_iter()
            .map(|u| merge(&graph[u], &incoming[u], k, &updates))
            .collect();
        (next, updates.load(Ordering::Relaxed))
    }
}

const FOREST_STREAM: u64 = u64::MAX;

fn worst(row: &[Entry]) -> f32 {
    row.last().map_or(f32::INFINITY, |e| e.cand.dist)
}

fn sample_union(fwd: &[usize], rev: &mut Vec<usize>, cap: usize, rng: &mut StdRng) -> Vec<usize> {
    if rev.len() > cap {
        rev.shuffle(rng);
        rev.truncate(cap);
    }
    let mut out: Vec<usize> = fwd.iter().copied().take(cap).collect();
    out.extend_from_slice(rev);
    out.sort_unstable();
    out.dedup();
    out
}

fn merge(current: &[Entry], incoming: &[Candidate], k: usize, updates: &AtomicUsize) -> Vec<Entry> {
    let mut pool: Vec<Candidate> = current.iter().map(|e| e.cand).collect();
    pool.extend_from_slice(incoming);
    pool.sort_unstable();
    pool.dedup_by_key(|c| c.index);
    pool.truncate(k);

    let mut changed = 0usize;
    let merged = pool
        .into_iter()
        .map(|cand| {
            let fresh = !current.iter().any(|e| e.cand.index == cand.index);
            changed += usize::from(fresh);
            Entry { cand, fresh }
        })
        .collect();
    updates.fetch_add(changed, Ordering::Relaxed);
    merged
}

/// Fill rows up to `k` distinct non-self entries with seeded random points.
pub(crate) fn pad_random(
    points: &PointSet,
    rows: Vec<Vec<Candidate>>,
    k: usize,
    seed: u64,
) -> Vec<Vec<Candidate>> {
    let n = points.len();
    rows.into_par_iter()
        .enumerate()
        .map(|(i, mut row)| {
            row.retain(|c| c.index != i);
            row.sort_unstable();
            row.dedup_by_key(|c| c.index);
            row.truncate(k);
            if row.len() < k {
                let mut rng = substream_rng(seed ^ 0x5EED, i as u64);
                let mut attempts = 0;
                while row.len() < k && attempts < 8 * k {
                    attempts += 1;
                    let j = rng.random_range(0..n);
                    if j != i && !row.iter().any(|c| c.index == j) {
                        row.push(Candidate::new(points.distance(i, j), j));
                    }
                }
                for j in 0..n {
                    if row.len() >= k {
                        break;
                    }
                    if j != i && !row.iter().any(|c| c.index == j) {
                        row.push(Candidate::new(points.distance(i, j), j));
                    }
                }
                row.sort_unstable();
            }
            row
        })
        .collect()
}

impl NeighborIndex for NnDescent {
    fn build(&self, points: &PointSet, k: usize, seed: u64) -> Result<NeighborGraph> {
        check_neighbor_count(points.len(), k)?;
        let n = points.len();
        if points.metric() == Metric::Precomputed || n <= 4 * self.params.leaf_size.max(k + 1) {
            return brute_force(points, k);
        }

        let tree = KdTree::with_leaf_size(points.data(), self.params.leaf_size);
        let forest = RpForest::build(
            points.data(),
            self.params.n_trees,
            self.params.leaf_size,
            substream(seed, FOREST_STREAM),
        );
        let shared = forest.co_members(n);
        let seeds: Vec<Vec<Candidate>> = shared
            .into_par_iter()
            .enumerate()
            .map(|(i, others)| {
                let mut row = tree.search(points.row(i), k, Some(i), self.params.leaf_budget);
                row.extend(others.into_iter().map(|j| Candidate::new(points.distance(i, j), j)));
                row.sort_unstable();
                row.dedup_by_key(|c| c.index);
                row.truncate(k);
                row
            })
            .collect();
        debug!(
            "nndescent seeded {n} points from {} kd-tree nodes and {} forest leaves",
            tree.node_count(),
            forest.leaf_count()
        );
        self.refine(points, seeds, k, seed)
    }

    fn name(&self) -> &'static str {
        "kdtree-nndescent"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neighbors::tests::{random_points, recall};

    #[test]
    fn test_recall_on_random_data() {
        let points = random_points(1500, 4, 21);
        let exact = brute_force(&points, 10).unwrap();
        let approx = NnDescent::default().build(&points, 10, 5).unwrap();
        let r = recall(&exact, &approx);
        assert!(r > 0.9, "recall {r} too low");
    }

    #[test]
    fn test_recall_on_larger_higher_dimensional_data() {
        let points = random_points(3000, 8, 13);
        let exact = brute_force(&points, 15).unwrap();
        let approx = NnDescent::default().build(&points, 15, 2).unwrap();
        let r = recall(&exact, &approx);
        assert!(r > 0.9, "recall {r} too low");
    }

    #[test]
    fn test_forest_seed_beats_budgeted_tree_alone() {
        let points = random_points(1500, 4, 21);
        let exact = brute_force(&points, 10).unwrap();
        let tree = KdTree::with_leaf_size(points.data(), 16);
        let budgeted: Vec<Vec<Candidate>> = (0..points.len())
            .map(|i| tree.search(points.row(i), 10, Some(i), 3))
            .collect();
        let tree_only = NeighborGraph::from_rows(10, pad_random(&points, budgeted, 10, 0)).unwrap();
        let seeded = NnDescent::default().build(&points, 10, 5).unwrap();
        assert!(recall(&exact, &seeded) > recall(&exact, &tree_only));
    }

    #[test]
    fn test_refine_from_random_start() {
        let points = random_points(300, 3, 4);
        let exact = brute_force(&points, 8).unwrap();
        let empty = vec![Vec::new(); 300];
        let g = NnDescent::new(NnDescentParams {
            max_rounds: 30,
            ..Default::default()
        })
        .refine(&points, empty, 8, 99)
        .unwrap();
        assert!(recall(&exact, &g) > 0.9);
    }

    #[test]
    fn test_deterministic_given_seed() {
        let points = random_points(800, 3, 8);
        let a = NnDescent::default().build(&points, 6, 17).unwrap();
        let b = NnDescent::default().build(&points, 6, 17).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_pad_random_fills_rows() {
        let points = random_points(12, 2, 1);
        let rows = pad_random(&points, vec![Vec::new(); 12], 11, 3);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row.len(), 11);
            assert!(row.iter().all(|c| c.index != i));
        }
    }

    #[test]
    fn test_rejects_zero_candidates() {
        let params = NnDescentParams {
            max_candidates: 0,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_forest() {
        let params = NnDescentParams {
            n_trees: 0,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }
}
