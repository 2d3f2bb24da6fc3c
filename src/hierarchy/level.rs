//! One resolution layer of a fitted hierarchy.

use super::coarsen::Coarsening;
use crate::fuzzy::{FuzzyGraph, LocalScales};
use crate::metric::PointSet;
use ndarray::Array2;

/// Everything retained for a level once it is built.
///
/// The neighbor graph is not kept: only the fuzzy graph and the local scales
/// fitted from it survive. `coarsening` is filled in when the next level is
/// built from this one, so the top level never has it.
#[derive(Debug, Clone)]
pub(crate) struct Level<L> {
    pub(crate) points: PointSet,
    pub(crate) labels: Vec<L>,
    pub(crate) graph: FuzzyGraph,
    pub(crate) scales: LocalScales,
    pub(crate) embedding: Array2<f32>,
    pub(crate) influence: Vec<f32>,
    pub(crate) coverage: Vec<f32>,
    pub(crate) origin: Vec<usize>,
    pub(crate) coarsening: Option<Coarsening>,
}

/// Per-point data a level starts from, before any graph is built.
#[derive(Debug)]
pub(crate) struct Seedling<L> {
    pub(crate) points: PointSet,
    pub(crate) labels: Vec<L>,
    pub(crate) influence: Vec<f32>,
    pub(crate) coverage: Vec<f32>,
    pub(crate) origin: Vec<usize>,
}

impl<L: Clone> Seedling<L> {
    /// Full-resolution level: unit influence and coverage.
    pub(crate) fn base(points: PointSet, labels: Vec<L>) -> Self {
        let n = points.len();
        Self {
            points,
            labels,
            influence: vec![1.0; n],
            coverage: vec![1.0; n],
            origin: (0..n).collect(),
        }
    }

    /// The level above `below`, holding `points` for its representatives.
    pub(crate) fn coarser(below: &Level<L>, coarsening: &Coarsening, points: PointSet) -> Self {
        let reps = &coarsening.representatives;
        let mut coverage = vec![0.0f32; reps.len()];
        for (i, &owner) in coarsening.absorption.iter().enumerate() {
            coverage[owner] += below.coverage[i];
        }
        Self {
            points,
            labels: reps.iter().map(|&r| below.labels[r].clone()).collect(),
            influence: coarsening.influence.clone(),
            coverage,
            origin: reps.iter().map(|&r| below.origin[r]).collect(),
        }
    }
}
