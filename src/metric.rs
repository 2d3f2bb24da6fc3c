//! Distance strategies and the immutable point set of a level.
//!
//! Two metrics are supported:
//!
//! ```text
//! Metric       │ Input matrix           │ distance(i, j)
//! ─────────────┼────────────────────────┼──────────────────────────
//! Euclidean    │ N × D feature rows     │ ‖x_i − x_j‖₂
//! Precomputed  │ N × N distance matrix  │ M[i, j]
//! ```
//!
//! Euclidean distances are always computed by [`euclidean`], so a precomputed
//! matrix built with the same function reproduces the Euclidean pipeline
//! bit for bit.

use crate::error::{Error, Result, Stage};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use std::fmt;
use std::str::FromStr;

/// Distance strategy over row vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Metric {
    /// L2 distance between feature rows.
    #[default]
    Euclidean,
    /// Rows of the input are rows of a square distance matrix.
    Precomputed,
}

impl FromStr for Metric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            "precomputed" => Ok(Metric::Precomputed),
            other => Err(Error::config(
                "metric",
                format!("unknown metric '{other}' (expected euclidean or precomputed)"),
            )),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Euclidean => f.write_str("euclidean"),
            Metric::Precomputed => f.write_str("precomputed"),
        }
    }
}

/// Squared Euclidean distance.
#[inline]
pub fn squared_euclidean(a: ArrayView1<'_, f32>, b: ArrayView1<'_, f32>) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Euclidean distance.
#[inline]
pub fn euclidean(a: ArrayView1<'_, f32>, b: ArrayView1<'_, f32>) -> f32 {
    squared_euclidean(a, b).sqrt()
}

/// Pairwise Euclidean distance matrix of the rows of `data`.
pub fn pairwise_euclidean(data: ArrayView2<'_, f32>) -> Array2<f32> {
    let n = data.nrows();
    let mut out = Array2::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let d = euclidean(data.row(i), data.row(j));
            out[[i, j]] = d;
            out[[j, i]] = d;
        }
    }
    out
}

/// The points of one level: a matrix plus the metric that interprets it.
#[derive(Debug, Clone)]
pub struct PointSet {
    data: Array2<f32>,
    metric: Metric,
}

impl PointSet {
    /// Wrap an input matrix, checking its shape and values.
    ///
    /// Precomputed matrices must be square with a zero diagonal, non-negative
    /// entries and exact symmetry.
    pub fn new(data: Array2<f32>, metric: Metric) -> Result<Self> {
        let (n, d) = data.dim();
        if n == 0 || d == 0 {
            return Err(Error::Shape {
                expected: "a non-empty matrix".into(),
                actual: format!("{n} x {d}"),
            });
        }
        if metric == Metric::Precomputed && n != d {
            return Err(Error::Shape {
                expected: format!("a square {n} x {n} distance matrix"),
                actual: format!("{n} x {d}"),
            });
        }
        if let Some(pos) = data.iter().position(|v| !v.is_finite()) {
            return Err(Error::numeric(
                Stage::Input,
                format!("non-finite input value at row {}, column {}", pos / d, pos % d),
            ));
        }
        if metric == Metric::Precomputed {
            for i in 0..n {
                if data[[i, i]] != 0.0 {
                    return Err(Error::numeric(
                        Stage::Input,
                        format!("distance matrix diagonal is non-zero at {i}"),
                    ));
                }
                for j in (i + 1)..n {
                    let (a, b) = (data[[i, j]], data[[j, i]]);
                    if a < 0.0 || a != b {
                        return Err(Error::numeric(
                            Stage::Input,
                            format!("distance matrix entry ({i}, {j}) is negative or asymmetric"),
                        ));
                    }
                }
            }
        }
        Ok(Self { data, metric })
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    /// True when the set holds no points.
    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }

    /// Feature dimension (`None` for precomputed distances).
    pub fn dim(&self) -> Option<usize> {
        match self.metric {
            Metric::Euclidean => Some(self.data.ncols()),
            Metric::Precomputed => None,
        }
    }

    /// Metric interpreting the matrix.
    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Underlying matrix.
    pub fn data(&self) -> ArrayView2<'_, f32> {
        self.data.view()
    }

    /// Row `i` of the underlying matrix.
    pub fn row(&self, i: usize) -> ArrayView1<'_, f32> {
        self.data.row(i)
    }

    /// Distance between points `i` and `j`.
    #[inline]
    pub fn distance(&self, i: usize, j: usize) -> f32 {
        match self.metric {
            Metric::Euclidean => euclidean(self.data.row(i), self.data.row(j)),
            Metric::Precomputed => self.data[[i, j]],
        }
    }

    /// Subset of points, in the given order.
    ///
    /// For precomputed distances both rows and columns are restricted.
    pub fn select(&self, indices: &[usize]) -> PointSet {
        let rows = self.data.select(Axis(0), indices);
        let data = match self.metric {
            Metric::Euclidean => rows,
            Metric::Precomputed => rows.select(Axis(1), indices),
        };
        PointSet {
            data,
            metric: self.metric,
        }
    }

    /// Replace the feature rows, keeping the metric.
    pub(crate) fn with_data(&self, data: Array2<f32>) -> PointSet {
        PointSet {
            data,
            metric: self.metric,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_metric_from_str() {
        assert_eq!("euclidean".parse::<Metric>().unwrap(), Metric::Euclidean);
        assert_eq!(" Precomputed ".parse::<Metric>().unwrap(), Metric::Precomputed);
        assert!(matches!(
            "cosine".parse::<Metric>(),
            Err(Error::Configuration { name: "metric", .. })
        ));
    }

    #[test]
    fn test_precomputed_matches_euclidean() {
        let x = array![[0.0f32, 0.0], [3.0, 4.0], [1.0, 1.0]];
        let m = pairwise_euclidean(x.view());
        let e = PointSet::new(x, Metric::Euclidean).unwrap();
        let p = PointSet::new(m, Metric::Precomputed).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                assert_eq!(e.distance(i, j), p.distance(i, j));
            }
        }
        assert_eq!(e.distance(0, 1), 5.0);
    }

    #[test]
    fn test_precomputed_must_be_square() {
        let err = PointSet::new(Array2::zeros((3, 2)), Metric::Precomputed).unwrap_err();
        assert!(matches!(err, Error::Shape { .. }));
    }

    #[test]
    fn test_rejects_non_finite() {
        let x = array![[0.0f32, f32::NAN], [1.0, 1.0]];
        let err = PointSet::new(x, Metric::Euclidean).unwrap_err();
        assert!(matches!(
            err,
            Error::Numeric {
                stage: Stage::Input,
                ..
            }
        ));
    }

    #[test]
    fn test_select_precomputed_restricts_columns() {
        let x = array![[0.0f32], [1.0], [3.0], [6.0]];
        let p = PointSet::new(pairwise_euclidean(x.view()), Metric::Precomputed).unwrap();
        let sub = p.select(&[1, 3]);
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.data().ncols(), 2);
        assert_eq!(sub.distance(0, 1), 5.0);
    }
}
