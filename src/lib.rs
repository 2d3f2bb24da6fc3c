//! # tiermap
//!
//! Hierarchical, multi-resolution manifold embeddings.
//!
//! A [`Hierarchy`] embeds a point set at level 0, then repeatedly keeps the
//! most central points as representatives, absorbs the rest into them and
//! embeds the smaller set again. Each level exposes its embedding, labels,
//! influence weights and fitted local scales through read-only accessors.
//!
//! The building blocks are usable on their own:
//!
//! | Module | Provides |
//! |---|---|
//! | [`metric`] | [`PointSet`], [`Metric`] |
//! | [`neighbors`] | exact KD-tree, KD-tree + NNDescent and inverted-file kNN graphs |
//! | [`fuzzy`] | local scale fitting and the symmetric fuzzy graph |
//! | [`layout`] | spectral initialisation and negative-sampling layout |
//! | [`hierarchy`] | coarsening, the level-by-level fit, health checks |
//! | [`cluster`] | k-means, used as the inverted-file quantizer |
//!
//! Randomness is never global: every stage draws from a stream derived from
//! one root seed by [`SeedSequence`]. With `threads = Some(1)` a seeded fit is
//! bit-reproducible.

pub mod cluster;
/// Error types used across `tiermap`.
pub mod error;
pub mod fuzzy;
pub mod hierarchy;
pub mod layout;
pub mod metric;
pub mod neighbors;
pub mod rng;


pub use cluster::{Clustering, Kmeans, KmeansFit};
pub use error::{Error, Result, Stage};
pub use fuzzy::{smooth_knn, FuzzyGraph, LocalScales, SigmaFit};
pub use hierarchy::{
    CoarseGeometry, Coarsening, HealthCheck, HealthReport, Hierarchy, HierarchyConfig,
    ValidationReport,
};
pub use layout::{CurveParams, EpochEvent, EpochObserver, LayoutParams};
pub use metric::{Metric, PointSet};
pub use neighbors::{AnnStrategy, IvfParams, NeighborGraph, NeighborIndex, NnDescentParams};
pub use rng::SeedSequence;

/// Route `log` output through the test harness.
#[cfg(test)]
pub(crate) fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}
