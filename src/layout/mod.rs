//! Low-dimensional layout of a fuzzy graph.
//!
//! [`initialize`] places points spectrally and [`optimize`] refines the
//! placement with sampled attractive and repulsive updates. Disconnected
//! graphs are initialised one component at a time, each component in its own
//! cell of a grid, so separate components start apart.

mod curve;
mod optimize;
mod spectral;

pub use curve::CurveParams;
pub use optimize::{optimize, EpochEvent, EpochObserver, LayoutParams};
pub use spectral::spectral_layout;

use crate::fuzzy::FuzzyGraph;
use crate::rng::{substream, substream_rng};
use log::{debug, warn};
use ndarray::{Array2, Axis};
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Side length of the box initial coordinates are scaled into.
pub const INIT_EXTENT: f32 = 10.0;

const JITTER: f32 = 1e-4;

/// Share of a grid cell a component occupies.
const CELL_FILL: f32 = 0.8;

/// Initial coordinates: spectral per connected component, uniform random
/// where the spectral layout is unavailable.
///
/// The result is mapped into `[0, 10]` per axis and lightly jittered so that
/// no two points start at the same location.
pub fn initialize(graph: &FuzzyGraph, dim: usize, seed: u64) -> Array2<f32> {
    let labels = graph.component_labels();
    let count = labels.iter().copied().max().map_or(0, |m| m + 1);
    let mut y = if count <= 1 {
        place(graph, dim, seed)
    } else {
        debug!("initialising {count} components separately");
        component_layout(graph, &labels, count, dim, seed)
    };

    rescale(&mut y, INIT_EXTENT);
    let mut rng = substream_rng(seed, 2);
    if let Ok(noise) = Normal::new(0.0f32, JITTER) {
        y.mapv_inplace(|v| v + noise.sample(&mut rng));
    }
    y
}

/// Layout of one connected graph.
fn place(graph: &FuzzyGraph, dim: usize, seed: u64) -> Array2<f32> {
    let n = graph.len();
    match spectral_layout(graph, dim, substream(seed, 0)) {
        Some(y) => y,
        None => {
            if n > dim + 1 {
                warn!("spectral initialisation unavailable for {n} points, using random placement");
            }
            let mut rng = substream_rng(seed, 1);
            Array2::from_shape_fn((n, dim), |_| rng.random_range(0.0..INIT_EXTENT))
        }
    }
}

/// Lay out each component in a unit cell of a `⌈√count⌉`-wide grid.
fn component_layout(
    graph: &FuzzyGraph,
    labels: &[usize],
    count: usize,
    dim: usize,
    seed: u64,
) -> Array2<f32> {
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (i, &c) in labels.iter().enumerate() {
        members[c].push(i);
    }
    let side = (count as f64).sqrt().ceil() as usize;
    let mut y = Array2::<f32>::zeros((graph.len(), dim));
    for (c, points) in members.iter().enumerate() {
        let sub = graph.subgraph(points);
        let mut local = place(&sub, dim, substream(seed, 3 + c as u64));
        rescale(&mut local, CELL_FILL);
        let offset = if dim == 1 {
            [c as f32, 0.0]
        } else {
            [(c % side) as f32, (c / side) as f32]
        };
        for (row, &i) in points.iter().enumerate() {
            let mut target = y.row_mut(i);
            target.assign(&local.row(row));
            for (axis, shift) in offset.iter().enumerate().take(dim) {
                target[axis] += shift;
            }
        }
    }
    y
}

/// Map each column affinely onto `[0, extent]`; constant columns go to the middle.
fn rescale(y: &mut Array2<f32>, extent: f32) {
    for mut col in y.axis_iter_mut(Axis(1)) {
        let lo = col.iter().copied().fold(f32::INFINITY, f32::min);
        let hi = col.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let span = hi - lo;
        if span > 0.0 && span.is_finite() {
            col.mapv_inplace(|v| extent * (v - lo) / span);
        } else {
            col.fill(extent / 2.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_within_box() {
        let mut triplets = Vec::new();
        for i in 0..20 {
            let j = (i + 1) % 20;
            triplets.push((i, j, 0.8));
            triplets.push((j, i, 0.8));
        }
        let g = FuzzyGraph::from_triplets(20, triplets);
        let y = initialize(&g, 2, 5);
        assert_eq!(y.dim(), (20, 2));
        assert!(y.iter().all(|&v| (-0.01..=10.01).contains(&v)));
    }

    #[test]
    fn test_initialize_edgeless_graph_is_random() {
        let g = FuzzyGraph::from_triplets(8, Vec::new());
        let a = initialize(&g, 2, 1);
        let b = initialize(&g, 2, 1);
        assert_eq!(a, b);
        assert!(a.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_components_start_apart() {
        let mut triplets = Vec::new();
        for offset in [0, 12] {
            for i in 0..12 {
                let (a, b) = (offset + i, offset + (i + 1) % 12);
                triplets.push((a, b, 0.9));
                triplets.push((b, a, 0.9));
            }
        }
        let g = FuzzyGraph::from_triplets(24, triplets);
        let y = initialize(&g, 2, 7);
        let max_first = (0..12).map(|i| y[[i, 0]]).fold(f32::MIN, f32::max);
        let min_second = (12..24).map(|i| y[[i, 0]]).fold(f32::MAX, f32::min);
        assert!(max_first < min_second);
    }
}
