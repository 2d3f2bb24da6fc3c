//! Inverted-file (IVF) neighbor search.
//!
//! Points are bucketed by their nearest k-means centroid. A query ranks the
//! cells by centroid distance and scans only the `nprobe` closest, continuing
//! to further cells until at least `k` candidates were seen. Recall grows with
//! `nprobe`; with `nprobe == n_cells` the search is exact.

use super::{brute_force, check_neighbor_count, Candidate, NeighborGraph, NeighborIndex};
use crate::cluster::Kmeans;
use crate::error::{Error, Result};
use crate::metric::{squared_euclidean, Metric, PointSet};
use log::debug;
use rayon::prelude::*;

/// IVF tuning.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IvfParams {
    /// Number of cells; `None` uses ⌈√N⌉.
    pub n_cells: Option<usize>,
    /// Cells scanned per query.
    pub nprobe: usize,
    /// Lloyd iterations for the quantizer.
    pub max_iter: usize,
}

impl Default for IvfParams {
    fn default() -> Self {
        Self {
            n_cells: None,
            nprobe: 8,
            max_iter: 25,
        }
    }
}

impl IvfParams {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.nprobe == 0 {
            return Err(Error::config("ivf.nprobe", "must be positive"));
        }
        if self.n_cells == Some(0) {
            return Err(Error::config("ivf.n_cells", "must be positive"));
        }
        Ok(())
    }

    fn cells_for(&self, n: usize) -> usize {
        self.n_cells
            .unwrap_or_else(|| (n as f64).sqrt().ceil() as usize)
            .clamp(1, n)
    }
}

/// Inverted-file index over k-means cells.
#[derive(Debug, Clone, Default)]
pub struct Ivf {
    params: IvfParams,
}

impl Ivf {
    /// Create with explicit parameters.
    pub fn new(params: IvfParams) -> Self {
        Self { params }
    }
}

impl NeighborIndex for Ivf {
    fn build(&self, points: &PointSet, k: usize, seed: u64) -> Result<NeighborGraph> {
        check_neighbor_count(points.len(), k)?;
        let n = points.len();
        let n_cells = self.params.cells_for(n);
        if points.metric() == Metric::Precomputed || n_cells <= self.params.nprobe {
            return brute_force(points, k);
        }

        let fit = Kmeans::new(n_cells)
            .with_max_iter(self.params.max_iter)
            .with_seed(seed)
            .fit(points.data())?;
        let mut lists: Vec<Vec<usize>> = vec![Vec::new(); n_cells];
        for (i, &c) in fit.labels.iter().enumerate() {
            lists[c].push(i);
        }
        debug!(
            "ivf: {n_cells} cells, largest {}, nprobe {}",
            lists.iter().map(Vec::len).max().unwrap_or(0),
            self.params.nprobe
        );

        let centroids = fit.centroids.view();
        let rows: Vec<Vec<Candidate>> = (0..n)
            .into_par_iter()
            .map(|i| {
                let q = points.row(i);
                let mut order: Vec<Candidate> = centroids
                    .rows()
                    .into_iter()
                    .enumerate()
                    .map(|(c, centroid)| Candidate::new(squared_euclidean(q, centroid), c))
                    .collect();
                order.sort_unstable();

                let mut found: Vec<Candidate> = Vec::new();
                for (probed, cell) in order.iter().enumerate() {
                    if probed >= self.params.nprobe && found.len() >= k {
                        break;
                    }
                    found.extend(
                        lists[cell.index]
                            .iter()
                            .filter(|&&j| j != i)
                            .map(|&j| Candidate::new(points.distance(i, j), j)),
                    );
                }
                if found.len() > k {
                    found.select_nth_unstable(k - 1);
                    found.truncate(k);
                }
                found
            })
            .collect();
        NeighborGraph::from_rows(k, rows)
    }

    fn name(&self) -> &'static str {
        "ivf"
    }
}
