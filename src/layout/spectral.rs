//! Spectral initialisation.
//!
//! The smallest non-trivial eigenvectors of the normalized Laplacian
//! `L = I − D^-1/2 W D^-1/2` are the largest non-trivial eigenvectors of
//!
//! ```text
//! M = (I + D^-1/2 W D^-1/2) / 2        spectrum in [0, 1]
//! ```
//!
//! The trivial eigenvector `D^1/2 · 1` (eigenvalue 1) is projected out, and
//! orthogonal iteration on `M` converges to the next `dim` eigenvectors.
//! Disconnected graphs have a repeated eigenvalue 1 and no meaningful
//! spectral layout, so callers lay out each component on its own.

use crate::fuzzy::FuzzyGraph;
use crate::rng::substream_rng;
use log::{debug, trace};
use ndarray::{Array2, Axis};
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;

const MAX_ITER: usize = 300;
const TOL: f64 = 1e-7;

/// Spectral coordinates, or `None` when the graph is unsuitable.
pub fn spectral_layout(graph: &FuzzyGraph, dim: usize, seed: u64) -> Option<Array2<f32>> {
    let n = graph.len();
    if n <= dim + 1 {
        return None;
    }
    let degrees: Vec<f64> = (0..n).map(|i| graph.degree(i) as f64).collect();
    if degrees.iter().any(|&d| d <= 0.0) || graph.connected_components() != 1 {
        return None;
    }
    let inv_sqrt: Vec<f64> = degrees.iter().map(|d| 1.0 / d.sqrt()).collect();
    let mut trivial: Vec<f64> = degrees.iter().map(|d| d.sqrt()).collect();
    let norm = trivial.iter().map(|v| v * v).sum::<f64>().sqrt();
    trivial.iter_mut().for_each(|v| *v /= norm);

    let mut rng = substream_rng(seed, 0);
    let mut q = Array2::<f64>::from_shape_fn((n, dim), |_| StandardNormal.sample(&mut rng));
    deflate(&mut q, &trivial);
    if !orthonormalize(&mut q) {
        return None;
    }

    let mut converged = false;
    for iter in 0..MAX_ITER {
        let mut z = apply(graph, &inv_sqrt, &q);
        deflate(&mut z, &trivial);
        if !orthonormalize(&mut z) {
            return None;
        }
        // Distance between successive subspaces: ‖Z − Q(QᵀZ)‖_F.
        let overlap = q.t().dot(&z);
        let residual = (&z - &q.dot(&overlap)).mapv(|v| v * v).sum().sqrt();
        q = z;
        if residual < TOL {
            trace!("spectral iteration converged after {} steps", iter + 1);
            converged = true;
            break;
        }
    }
    if !converged {
        debug!("spectral iteration stopped at {MAX_ITER} steps");
    }

    if q.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some(q.mapv(|v| v as f32))
}

/// `M · Q` with `M = (I + D^-1/2 W D^-1/2) / 2`.
fn apply(graph: &FuzzyGraph, inv_sqrt: &[f64], q: &Array2<f64>) -> Array2<f64> {
    let (n, dim) = q.dim();
    let rows: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let (cols, ws) = graph.row(i);
            let mut acc = vec![0.0f64; dim];
            for (&j, &w) in cols.iter().zip(ws) {
                let scale = w as f64 * inv_sqrt[i] * inv_sqrt[j];
                for (c, a) in acc.iter_mut().enumerate() {
                    *a += scale * q[[j, c]];
                }
            }
            acc.iter()
                .enumerate()
                .map(|(c, a)| 0.5 * (q[[i, c]] + a))
                .collect()
        })
        .collect();
    Array2::from_shape_fn((n, dim), |(i, c)| rows[i][c])
}

fn deflate(q: &mut Array2<f64>, unit: &[f64]) {
    for mut col in q.axis_iter_mut(Axis(1)) {
        let proj: f64 = col.iter().zip(unit).map(|(a, b)| a * b).sum();
        col.iter_mut().zip(unit).for_each(|(a, b)| *a -= proj * b);
    }
}

/// Modified Gram–Schmidt on the columns; false when the columns are dependent.
fn orthonormalize(q: &mut Array2<f64>) -> bool {
    let dim = q.ncols();
    for c in 0..dim {
        for p in 0..c {
            let proj = q.column(c).dot(&q.column(p));
            let prev = q.column(p).to_owned();
            q.column_mut(c).scaled_add(-proj, &prev);
        }
        let norm = q.column(c).dot(&q.column(c)).sqrt();
        if !(norm.is_finite() && norm > 1e-12) {
            return false;
        }
        q.column_mut(c).mapv_inplace(|v| v / norm);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuzzy::FuzzyGraph;

    fn ring(n: usize) -> FuzzyGraph {
        let mut triplets = Vec::new();
        for i in 0..n {
            let j = (i + 1) % n;
            triplets.push((i, j, 1.0));
            triplets.push((j, i, 1.0));
        }
        FuzzyGraph::from_triplets(n, triplets)
    }

    #[test]
    fn test_ring_embeds_as_circle() {
        let n = 24;
        let y = spectral_layout(&ring(n), 2, 3).unwrap();
        // The two leading non-trivial eigenvectors of a ring are cos/sin
        // waves, so every point ends up at the same radius.
        let radii: Vec<f32> = y
            .rows()
            .into_iter()
            .map(|r| (r[0] * r[0] + r[1] * r[1]).sqrt())
            .collect();
        let mean = radii.iter().sum::<f32>() / n as f32;
        assert!(radii.iter().all(|r| (r - mean).abs() < 0.05 * mean));
    }

    #[test]
    fn test_columns_orthonormal_and_deflated() {
        let g = ring(24);
        let y = spectral_layout(&g, 2, 1).unwrap();
        let c0 = y.column(0);
        let c1 = y.column(1);
        assert!((c0.dot(&c0) - 1.0).abs() < 1e-4);
        assert!(c0.dot(&c1).abs() < 1e-4);
        // Regular graph: the trivial vector is constant.
        assert!(c0.sum().abs() < 1e-3);
    }

    #[test]
    fn test_disconnected_graph_is_rejected() {
        let mut triplets = Vec::new();
        for (a, b) in [(0, 1), (1, 2), (3, 4), (4, 5)] {
            triplets.push((a, b, 1.0));
            triplets.push((b, a, 1.0));
        }
        let g = FuzzyGraph::from_triplets(6, triplets);
        assert!(spectral_layout(&g, 2, 0).is_none());
    }

    #[test]
    fn test_too_small_graph_is_rejected() {
        assert!(spectral_layout(&ring(3), 2, 0).is_none());
    }
}
