//! Stochastic layout optimisation.
//!
//! Each epoch visits the edges of the fuzzy graph in a fresh random order.
//! An edge of weight `w` is sampled once every `max_w / w` epochs; sampling
//! it pulls both endpoints together and then pushes the head away from a few
//! random points (negative samples). Gradients are clipped to ±4 per
//! coordinate and scaled by a learning rate that decays linearly to zero.
//!
//! # Consistency
//!
//! The parallel path splits the shuffled edges into chunks processed
//! concurrently. Coordinates live in a shared buffer of `AtomicU32` holding
//! `f32` bits, read and written with `Relaxed` ordering. Two chunks touching
//! the same point may overwrite each other's update; this is accepted as part
//! of the stochastic scheme. Results are reproducible in distribution only.
//! The sequential path is bit-reproducible for a given seed.

use super::curve::CurveParams;
use crate::error::{Error, Result, Stage};
use crate::fuzzy::FuzzyGraph;
use crate::rng::{substream, substream_rng};
use log::trace;
use ndarray::{Array2, ArrayView2};
use rand::prelude::*;
use rayon::prelude::*;
use std::cell::Cell;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU32, Ordering};

const GRADIENT_CLIP: f32 = 4.0;
const EDGE_CHUNK: usize = 2048;

/// Optimiser settings for one level.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutParams {
    /// Epochs to run.
    pub n_epochs: usize,
    /// Negative samples per positive sample.
    pub negative_sample_rate: usize,
    /// Initial learning rate.
    pub learning_rate: f32,
    /// Weight of the repulsive term.
    pub repulsion_strength: f32,
    /// Kernel parameters.
    pub curve: CurveParams,
    /// Process edges on the calling thread only.
    pub sequential: bool,
}

/// Progress report sent after every epoch.
#[derive(Debug, Clone)]
pub struct EpochEvent<'a> {
    /// Level being optimised.
    pub level: usize,
    /// Completed epoch, zero-based.
    pub epoch: usize,
    /// Total epochs for this level.
    pub n_epochs: usize,
    /// Current coordinates.
    pub embedding: ArrayView2<'a, f32>,
}

/// Receives [`EpochEvent`]s; returning `Break` cancels the fit.
pub trait EpochObserver {
    /// Called after each epoch.
    fn on_epoch(&mut self, event: &EpochEvent<'_>) -> ControlFlow<()>;
}

impl<F> EpochObserver for F
where
    F: FnMut(&EpochEvent<'_>) -> ControlFlow<()>,
{
    fn on_epoch(&mut self, event: &EpochEvent<'_>) -> ControlFlow<()> {
        self(event)
    }
}

#[derive(Debug, Clone)]
struct EdgeState {
    head: usize,
    tail: usize,
    epochs_per_sample: f32,
    epochs_per_negative: f32,
    next_sample: f32,
    next_negative: f32,
}

/// Read/write access to a flat `n × dim` coordinate buffer.
trait Coordinates {
    fn get(&self, idx: usize) -> f32;
    fn set(&self, idx: usize, value: f32);
}

struct Exclusive<'a>(&'a [Cell<f32>]);

impl Coordinates for Exclusive<'_> {
    #[inline]
    fn get(&self, idx: usize) -> f32 {
        self.0[idx].get()
    }

    #[inline]
    fn set(&self, idx: usize, value: f32) {
        self.0[idx].set(value);
    }
}

struct Shared<'a>(&'a [AtomicU32]);

impl Coordinates for Shared<'_> {
    #[inline]
    fn get(&self, idx: usize) -> f32 {
        f32::from_bits(self.0[idx].load(Ordering::Relaxed))
    }

    #[inline]
    fn set(&self, idx: usize, value: f32) {
        self.0[idx].store(value.to_bits(), Ordering::Relaxed);
    }
}

struct Step<'a> {
    graph: &'a FuzzyGraph,
    n: usize,
    dim: usize,
    a: f32,
    b: f32,
    gamma: f32,
    alpha: f32,
    clock: f32,
}

impl Step<'_> {
    fn squared_distance<C: Coordinates>(&self, coords: &C, i: usize, j: usize) -> f32 {
        (0..self.dim)
            .map(|c| {
                let d = coords.get(i * self.dim + c) - coords.get(j * self.dim + c);
                d * d
            })
            .sum()
    }

    fn run<C: Coordinates>(&self, coords: &C, edge: &mut EdgeState, rng: &mut StdRng) {
        if edge.next_sample > self.clock {
            return;
        }
        let (i, j) = (edge.head, edge.tail);
        let (a, b) = (self.a, self.b);

        let d2 = self.squared_distance(coords, i, j);
        let attract = if d2 > 0.0 {
            -2.0 * a * b * d2.powf(b - 1.0) / (a * d2.powf(b) + 1.0)
        } else {
            0.0
        };
        for c in 0..self.dim {
            let (yi, yj) = (coords.get(i * self.dim + c), coords.get(j * self.dim + c));
            let grad = clip(attract * (yi - yj)) * self.alpha;
            coords.set(i * self.dim + c, yi + grad);
            coords.set(j * self.dim + c, yj - grad);
        }
        edge.next_sample += edge.epochs_per_sample;

        let n_neg = ((self.clock - edge.next_negative) / edge.epochs_per_negative).max(0.0) as usize;
        for _ in 0..n_neg {
            let k = rng.random_range(0..self.n);
            if k == i || self.graph.contains(i, k) {
                continue;
            }
            let d2 = self.squared_distance(coords, i, k);
            let repel = if d2 > 0.0 {
                2.0 * self.gamma * b / ((0.001 + d2) * (a * d2.powf(b) + 1.0))
            } else {
                0.0
            };
            for c in 0..self.dim {
                let yi = coords.get(i * self.dim + c);
                let grad = if repel > 0.0 {
                    clip(repel * (yi - coords.get(k * self.dim + c)))
                } else {
                    GRADIENT_CLIP
                };
                coords.set(i * self.dim + c, yi + grad * self.alpha);
            }
        }
        edge.next_negative += n_neg as f32 * edge.epochs_per_negative;
    }
}

#[inline]
fn clip(v: f32) -> f32 {
    v.clamp(-GRADIENT_CLIP, GRADIENT_CLIP)
}

fn schedule(graph: &FuzzyGraph, n_epochs: usize, negative_sample_rate: usize) -> Vec<EdgeState> {
    let max_w = graph.max_weight();
    if max_w <= 0.0 {
        return Vec::new();
    }
    let cutoff = max_w / n_epochs.max(1) as f32;
    let neg_rate = negative_sample_rate.max(1) as f32;
    graph
        .edges()
        .filter(|&(_, _, w)| w >= cutoff)
        .map(|(head, tail, w)| {
            let eps = max_w / w;
            EdgeState {
                head,
                tail,
                epochs_per_sample: eps,
                epochs_per_negative: eps / neg_rate,
                next_sample: eps,
                next_negative: eps / neg_rate,
            }
        })
        .collect()
}

/// Optimise `initial` against `graph`, reporting each epoch to `observer`.
pub fn optimize(
    graph: &FuzzyGraph,
    initial: Array2<f32>,
    params: &LayoutParams,
    level: usize,
    seed: u64,
    observer: &mut dyn EpochObserver,
) -> Result<Array2<f32>> {
    let (n, dim) = initial.dim();
    if n != graph.len() {
        return Err(Error::Shape {
            expected: format!("{} initial coordinates", graph.len()),
            actual: format!("{n}"),
        });
    }
    let mut edges = schedule(graph, params.n_epochs, params.negative_sample_rate);
    let mut flat: Vec<f32> = initial.iter().copied().collect();
    let shared: Vec<AtomicU32> = if params.sequential {
        Vec::new()
    } else {
        flat.iter().map(|v| AtomicU32::new(v.to_bits())).collect()
    };

    for epoch in 0..params.n_epochs {
        let step = Step {
            graph,
            n,
            dim,
            a: params.curve.a,
            b: params.curve.b,
            gamma: params.repulsion_strength,
            alpha: params.learning_rate * (1.0 - epoch as f32 / params.n_epochs as f32),
            clock: (epoch + 1) as f32,
        };
        let epoch_seed = substream(seed, epoch as u64);
        let mut rng = substream_rng(epoch_seed, u64::MAX);
        edges.shuffle(&mut rng);

        if params.sequential {
            let coords = Exclusive(Cell::from_mut(flat.as_mut_slice()).as_slice_of_cells());
            for edge in edges.iter_mut() {
                step.run(&coords, edge, &mut rng);
            }
        } else {
            let coords = Shared(&shared);
            edges
                .par_chunks_mut(EDGE_CHUNK)
                .enumerate()
                .for_each(|(chunk, part)| {
                    let mut rng = substream_rng(epoch_seed, chunk as u64);
                    for edge in part.iter_mut() {
                        step.run(&coords, edge, &mut rng);
                    }
                });
            for (dst, src) in flat.iter_mut().zip(&shared) {
                *dst = f32::from_bits(src.load(Ordering::Relaxed));
            }
        }

        let view = ArrayView2::from_shape((n, dim), flat.as_slice())
            .map_err(|e| Error::numeric(Stage::Layout, e.to_string()))?;
        let event = EpochEvent {
            level,
            epoch,
            n_epochs: params.n_epochs,
            embedding: view,
        };
        if observer.on_epoch(&event).is_break() {
            return Err(Error::Cancelled { level, epoch });
        }
        if epoch % 50 == 0 {
            trace!("level {level} epoch {epoch}/{}", params.n_epochs);
        }
    }

    if flat.iter().any(|v| !v.is_finite()) {
        return Err(Error::numeric(Stage::Layout, "embedding diverged to non-finite values"));
    }
    Array2::from_shape_vec((n, dim), flat).map_err(|e| Error::numeric(Stage::Layout, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{Metric, PointSet};
    use crate::neighbors::{ExactKdTree, NeighborIndex};

    fn params(sequential: bool, n_epochs: usize) -> LayoutParams {
        LayoutParams {
            n_epochs,
            negative_sample_rate: 5,
            learning_rate: 1.0,
            repulsion_strength: 1.0,
            curve: CurveParams::fit(1.0, 0.1),
            sequential,
        }
    }

    fn two_clusters() -> FuzzyGraph {
        let data = Array2::from_shape_fn((60, 2), |(i, j)| {
            let offset = if i < 30 { 0.0 } else { 50.0 };
            offset + ((i * 13 + j * 7) % 30) as f32 * 0.05
        });
        let points = PointSet::new(data, Metric::Euclidean).unwrap();
        let knn = ExactKdTree::default().build(&points, 8, 0).unwrap();
        FuzzyGraph::from_neighbors(&knn, 1.0).unwrap().0
    }

    fn continue_all(_: &EpochEvent<'_>) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    fn random_init(n: usize, seed: u64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((n, 2), |_| rng.random_range(0.0f32..10.0))
    }

    #[test]
    fn test_sequential_is_reproducible() {
        let g = two_clusters();
        let a = optimize(&g, random_init(60, 1), &params(true, 100), 0, 7, &mut continue_all)
            .unwrap();
        let b = optimize(&g, random_init(60, 1), &params(true, 100), 0, 7, &mut continue_all)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_parallel_stays_finite() {
        let g = two_clusters();
        let y = optimize(&g, random_init(60, 2), &params(false, 100), 0, 3, &mut continue_all)
            .unwrap();
        assert!(y.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_pulls_neighbors_together() {
        let g = two_clusters();
        let init = random_init(60, 4);
        let y = optimize(&g, init.clone(), &params(true, 200), 0, 1, &mut continue_all).unwrap();
        let mean_edge = |emb: &Array2<f32>| -> f32 {
            let total: f32 = g
                .edges()
                .map(|(i, j, _)| {
                    let d = &emb.row(i) - &emb.row(j);
                    d.dot(&d).sqrt()
                })
                .sum();
            total / g.nnz() as f32
        };
        assert!(mean_edge(&y) < mean_edge(&init));
    }

    #[test]
    fn test_observer_sees_every_epoch_and_can_cancel() {
        let g = two_clusters();
        let mut seen = Vec::new();
        let mut record = |e: &EpochEvent<'_>| {
            seen.push(e.epoch);
            assert_eq!(e.embedding.dim(), (60, 2));
            ControlFlow::Continue(())
        };
        optimize(&g, random_init(60, 5), &params(true, 20), 2, 0, &mut record).unwrap();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());

        let mut stop = |e: &EpochEvent<'_>| {
            if e.epoch == 4 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        };
        let err = optimize(&g, random_init(60, 5), &params(false, 20), 3, 0, &mut stop).unwrap_err();
        assert_eq!(err, Error::Cancelled { level: 3, epoch: 4 });
    }

    #[test]
    fn test_shape_mismatch() {
        let g = two_clusters();
        let err = optimize(&g, random_init(10, 0), &params(true, 5), 0, 0, &mut continue_all)
            .unwrap_err();
        assert!(matches!(err, Error::Shape { .. }));
    }
}
