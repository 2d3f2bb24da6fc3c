//! Fuzzy similarity graphs.
//!
//! A kNN graph is turned into a symmetric weighted graph in two steps:
//!
//! 1. **Directed memberships.** Each point fits a local scale σᵢ (see
//!    [`smooth_knn`]) and assigns its neighbors
//!    `a_ij = exp(−max(0, d_ij − ρᵢ) / σᵢ)`, so the nearest neighbor always
//!    has membership 1.
//! 2. **Fuzzy union.** The two directions are combined with the probabilistic
//!    OR `a + b(1 − a)`, optionally blended with the fuzzy intersection `ab`
//!    through `set_op_mix_ratio`. Both keep weights in `[0, 1]`.
//!
//! Each unordered pair is combined once and written to both directions, so
//! `weight(i, j) == weight(j, i)` holds bit for bit.

mod sigma;

pub use sigma::{local_connectivity, smooth_knn, SigmaFit, SIGMA_ITERATIONS, SIGMA_TOLERANCE};

use crate::error::{Error, Result, Stage};
use crate::neighbors::NeighborGraph;
use log::{debug, warn};
use petgraph::graph::UnGraph;
use petgraph::unionfind::UnionFind;
use rayon::prelude::*;

/// Edges at or below this weight are dropped.
pub const MIN_EDGE_WEIGHT: f32 = 1e-8;

/// Symmetric sparse graph in CSR form with sorted column indices.
#[derive(Debug, Clone, PartialEq)]
pub struct FuzzyGraph {
    indptr: Vec<usize>,
    indices: Vec<usize>,
    weights: Vec<f32>,
}

/// Per-point scales produced alongside a fuzzy graph.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalScales {
    /// Fitted σ per point.
    pub sigmas: Vec<f32>,
    /// Connectivity floor ρ per point.
    pub rhos: Vec<f32>,
    /// Points that needed the fallback σ.
    pub fallbacks: usize,
}

impl FuzzyGraph {
    /// Build from a kNN graph.
    ///
    /// `set_op_mix_ratio` of 1 gives the pure fuzzy union.
    pub fn from_neighbors(
        knn: &NeighborGraph,
        set_op_mix_ratio: f32,
    ) -> Result<(FuzzyGraph, LocalScales)> {
        let n = knn.len();
        let k = knn.k();
        let target = (k as f32).log2();

        let fits: Vec<(f32, SigmaFit)> = (0..n)
            .into_par_iter()
            .map(|i| smooth_knn(knn.distances(i), target))
            .collect();

        let mut sigmas = Vec::with_capacity(n);
        let mut rhos = Vec::with_capacity(n);
        let mut fallbacks = 0;
        for (i, (rho, fit)) in fits.into_iter().enumerate() {
            let sigma = match fit.sigma() {
                Some(s) if s.is_finite() && s > 0.0 => s,
                _ => {
                    return Err(Error::numeric(
                        Stage::FuzzyGraph,
                        format!("no finite sigma for point {i}"),
                    ))
                }
            };
            fallbacks += usize::from(fit.is_fallback());
            sigmas.push(sigma);
            rhos.push(rho);
        }
        if fallbacks > 0 {
            warn!("sigma fallback used for {fallbacks} of {n} points");
        }

        // Directed memberships keyed by unordered pair; `forward` is i < j.
        let mut directed: Vec<(usize, usize, bool, f32)> = Vec::with_capacity(n * k);
        for i in 0..n {
            for (j, d) in knn.row(i) {
                let gap = d - rhos[i];
                let a = if gap <= 0.0 {
                    1.0
                } else {
                    (-gap / sigmas[i]).exp()
                };
                if i < j {
                    directed.push((i, j, true, a));
                } else {
                    directed.push((j, i, false, a));
                }
            }
        }
        directed.sort_unstable_by(|x, y| (x.0, x.1, x.2).cmp(&(y.0, y.1, y.2)));

        let mut triplets: Vec<(usize, usize, f32)> = Vec::with_capacity(2 * directed.len());
        let mut idx = 0;
        while idx < directed.len() {
            let (lo, hi, _, _) = directed[idx];
            let (mut fwd, mut bwd) = (0.0f32, 0.0f32);
            while idx < directed.len() && directed[idx].0 == lo && directed[idx].1 == hi {
                if directed[idx].2 {
                    fwd = directed[idx].3;
                } else {
                    bwd = directed[idx].3;
                }
                idx += 1;
            }
            let union = fuzzy_union(fwd, bwd);
            let intersection = fwd * bwd;
            let w = (set_op_mix_ratio * union + (1.0 - set_op_mix_ratio) * intersection)
                .clamp(0.0, 1.0);
            if w > MIN_EDGE_WEIGHT {
                triplets.push((lo, hi, w));
                triplets.push((hi, lo, w));
            }
        }

        let graph = FuzzyGraph::from_triplets(n, triplets);
        debug!(
            "fuzzy graph: {n} points, {} directed edges",
            graph.indices.len()
        );
        Ok((
            graph,
            LocalScales {
                sigmas,
                rhos,
                fallbacks,
            },
        ))
    }

    /// Assemble CSR storage from `(row, col, weight)` triplets without duplicates.
    pub(crate) fn from_triplets(n: usize, mut triplets: Vec<(usize, usize, f32)>) -> Self {
        triplets.sort_unstable_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        let mut indptr = vec![0usize; n + 1];
        for &(r, _, _) in &triplets {
            indptr[r + 1] += 1;
        }
        for r in 0..n {
            indptr[r + 1] += indptr[r];
        }
        let (indices, weights) = triplets.into_iter().map(|(_, c, w)| (c, w)).unzip();
        Self {
            indptr,
            indices,
            weights,
        }
    }

    /// Number of vertices.
    pub fn len(&self) -> usize {
        self.indptr.len() - 1
    }

    /// True when the graph has no vertices.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored directed entries (twice the number of undirected edges).
    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    /// Neighbors of `i` (ascending) and their weights.
    pub fn row(&self, i: usize) -> (&[usize], &[f32]) {
        let range = self.indptr[i]..self.indptr[i + 1];
        (&self.indices[range.clone()], &self.weights[range])
    }

    /// Weight of edge `(i, j)`, 0 when absent.
    pub fn weight(&self, i: usize, j: usize) -> f32 {
        let (cols, ws) = self.row(i);
        cols.binary_search(&j).map_or(0.0, |p| ws[p])
    }

    /// True when `j` is adjacent to `i`.
    pub fn contains(&self, i: usize, j: usize) -> bool {
        self.row(i).0.binary_search(&j).is_ok()
    }

    /// Sum of edge weights at `i`.
    pub fn degree(&self, i: usize) -> f32 {
        self.row(i).1.iter().sum()
    }

    /// Largest edge weight (0 for an edgeless graph).
    pub fn max_weight(&self) -> f32 {
        self.weights.iter().copied().fold(0.0, f32::max)
    }

    /// All directed entries `(i, j, w)` in row-major order.
    pub fn edges(&self) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
        (0..self.len()).flat_map(move |i| {
            let (cols, ws) = self.row(i);
            cols.iter().zip(ws.iter()).map(move |(&j, &w)| (i, j, w))
        })
    }

    /// True when every entry has an identical mirror entry.
    pub fn is_symmetric(&self) -> bool {
        self.edges().all(|(i, j, w)| self.weight(j, i) == w && self.contains(j, i))
    }

    /// Undirected petgraph view (one edge per unordered pair).
    pub fn to_petgraph(&self) -> UnGraph<(), f32> {
        let n = self.len();
        let edges: Vec<(u32, u32, f32)> = self
            .edges()
            .filter(|&(i, j, _)| i < j)
            .map(|(i, j, w)| (i as u32, j as u32, w))
            .collect();
        let mut g = UnGraph::with_capacity(n, edges.len());
        for _ in 0..n {
            g.add_node(());
        }
        g.extend_with_edges(edges);
        g
    }

    /// Number of connected components.
    pub fn connected_components(&self) -> usize {
        petgraph::algo::connected_components(&self.to_petgraph())
    }

    /// Component of each vertex, numbered in order of each component's
    /// lowest vertex.
    pub fn component_labels(&self) -> Vec<usize> {
        let n = self.len();
        let mut sets = UnionFind::<usize>::new(n);
        for (i, j, _) in self.edges().filter(|&(i, j, _)| i < j) {
            sets.union(i, j);
        }
        let mut number: Vec<Option<usize>> = vec![None; n];
        let mut next = 0;
        (0..n)
            .map(|i| {
                let root = sets.find(i);
                *number[root].get_or_insert_with(|| {
                    next += 1;
                    next - 1
                })
            })
            .collect()
    }

    /// Induced subgraph on `members`, renumbered by position in `members`.
    pub(crate) fn subgraph(&self, members: &[usize]) -> FuzzyGraph {
        let mut position = vec![None; self.len()];
        for (p, &i) in members.iter().enumerate() {
            position[i] = Some(p);
        }
        let mut triplets = Vec::new();
        for (p, &i) in members.iter().enumerate() {
            let (cols, ws) = self.row(i);
            for (&j, &w) in cols.iter().zip(ws) {
                if let Some(q) = position[j] {
                    triplets.push((p, q, w));
                }
            }
        }
        FuzzyGraph::from_triplets(members.len(), triplets)
    }
}

/// Probabilistic OR, evaluated as `a + b(1 − a)` with `a` the larger
/// operand. A membership of exactly 1 on either side stays exactly 1, which
/// `a + b − ab` loses to rounding.
fn fuzzy_union(fwd: f32, bwd: f32) -> f32 {
    let (a, b) = if fwd >= bwd { (fwd, bwd) } else { (bwd, fwd) };
    a + b * (1.0 - a)
}
