//! Clustering used by the neighbor index and by hierarchy checks.
//!
//! Only hard partitioning is needed: [`Kmeans`] provides the coarse cells of
//! the inverted-file index, and any [`Clustering`] can be run on a level's
//! embedding to check that group structure survives coarsening.

mod kmeans;

use crate::error::Result;
use ndarray::ArrayView2;

pub use kmeans::{Kmeans, KmeansFit};
pub(crate) use kmeans::nearest_centroid;

/// Hard clustering of matrix rows.
pub trait Clustering {
    /// Fit the model to data and return one cluster label per row.
    fn fit_predict(&self, data: ArrayView2<'_, f32>) -> Result<Vec<usize>>;

    /// Number of clusters produced.
    fn n_clusters(&self) -> usize;
}
