//! K-means clustering.
//!
//! Partitions rows into k cells by minimizing the within-cluster sum of
//! squares:
//!
//! ```text
//! WCSS = Σₖ Σᵢ∈Cₖ ||xᵢ - μₖ||²
//! ```
//!
//! Lloyd iterations (assign, then recompute means) from a k-means++ start.
//! WCSS never increases, so the loop stops once centroids move less than
//! `tol` or after `max_iter` rounds.
//!
//! Here k-means is the coarse quantizer of the inverted-file neighbor index:
//! points are bucketed by nearest centroid and queries probe only the cells
//! whose centroids are closest.

use super::Clustering;
use crate::error::{Error, Result};
use crate::metric::squared_euclidean;
use ndarray::{Array2, ArrayView1, ArrayView2};
use rand::prelude::*;
use rayon::prelude::*;

/// K-means clustering algorithm.
#[derive(Debug, Clone)]
pub struct Kmeans {
    k: usize,
    max_iter: usize,
    tol: f32,
    seed: Option<u64>,
}

/// Result of a k-means fit.
#[derive(Debug, Clone)]
pub struct KmeansFit {
    /// `k × d` centroid matrix.
    pub centroids: Array2<f32>,
    /// Cell of each row.
    pub labels: Vec<usize>,
    /// Final within-cluster sum of squares.
    pub inertia: f32,
    /// Lloyd iterations run.
    pub iterations: usize,
}

impl Kmeans {
    /// Create a new K-means clusterer.
    pub fn new(k: usize) -> Self {
        Self {
            k,
            max_iter: 100,
            tol: 1e-4,
            seed: None,
        }
    }

    /// Set maximum iterations.
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Set convergence tolerance on total squared centroid shift.
    pub fn with_tol(mut self, tol: f32) -> Self {
        self.tol = tol;
        self
    }

    /// Set random seed for reproducibility.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// k-means++: each new centroid is drawn with probability ∝ D(x)².
    fn init_centroids(&self, data: ArrayView2<'_, f32>, rng: &mut impl Rng) -> Array2<f32> {
        let n = data.nrows();
        let mut centroids = Array2::zeros((self.k, data.ncols()));

        let first = rng.random_range(0..n);
        centroids.row_mut(0).assign(&data.row(first));
        let mut nearest: Vec<f32> = (0..n)
            .map(|j| squared_euclidean(data.row(j), centroids.row(0)))
            .collect();

        for i in 1..self.k {
            let total: f32 = nearest.iter().sum();
            let selected = if total > 0.0 {
                let threshold = rng.random::<f32>() * total;
                let mut cumsum = 0.0;
                let mut selected = n - 1;
                for (j, &d) in nearest.iter().enumerate() {
                    cumsum += d;
                    if cumsum >= threshold {
                        selected = j;
                        break;
                    }
                }
                selected
            } else {
                rng.random_range(0..n)
            };
            centroids.row_mut(i).assign(&data.row(selected));

            let c = centroids.row(i);
            nearest
                .par_iter_mut()
                .enumerate()
                .for_each(|(j, d)| *d = d.min(squared_euclidean(data.row(j), c)));
        }

        centroids
    }

    /// Run Lloyd iterations on the rows of `data`.
    pub fn fit(&self, data: ArrayView2<'_, f32>) -> Result<KmeansFit> {
        let (n, d) = data.dim();
        if n == 0 {
            return Err(Error::Shape {
                expected: "at least one row".into(),
                actual: "0 rows".into(),
            });
        }
        if self.k == 0 || self.k > n {
            return Err(Error::config(
                "k",
                format!("need 1 <= k <= {n} clusters, got {}", self.k),
            ));
        }

        let mut rng = StdRng::seed_from_u64(self.seed.unwrap_or_else(|| rand::rng().random()));
        let mut centroids = self.init_centroids(data, &mut rng);
        let mut labels = vec![0usize; n];
        let mut iterations = 0;

        for _ in 0..self.max_iter {
            iterations += 1;
            let centroids_ref = &centroids;
            labels.par_iter_mut().enumerate().for_each(|(i, label)| {
                *label = nearest_centroid(data.row(i), centroids_ref.view()).0;
            });

            let mut new_centroids = Array2::<f32>::zeros((self.k, d));
            let mut counts = vec![0usize; self.k];
            for (i, &c) in labels.iter().enumerate() {
                let mut row = new_centroids.row_mut(c);
                row += &data.row(i);
                counts[c] += 1;
            }
            for (c, &count) in counts.iter().enumerate() {
                if count > 0 {
                    new_centroids.row_mut(c).mapv_inplace(|v| v / count as f32);
                } else {
                    // Empty cell: reseed from a random row.
                    let idx = rng.random_range(0..n);
                    new_centroids.row_mut(c).assign(&data.row(idx));
                }
            }

            let shift: f32 = centroids
                .iter()
                .zip(new_centroids.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            centroids = new_centroids;
            if shift < self.tol {
                break;
            }
        }

        let centroids_ref = &centroids;
        labels.par_iter_mut().enumerate().for_each(|(i, label)| {
            *label = nearest_centroid(data.row(i), centroids_ref.view()).0;
        });
        let inertia = labels
            .iter()
            .enumerate()
            .map(|(i, &c)| squared_euclidean(data.row(i), centroids.row(c)))
            .sum();

        Ok(KmeansFit {
            centroids,
            labels,
            inertia,
            iterations,
        })
    }
}

/// Index and squared distance of the closest centroid.
pub(crate) fn nearest_centroid(
    point: ArrayView1<'_, f32>,
    centroids: ArrayView2<'_, f32>,
) -> (usize, f32) {
    let mut best = (0, f32::INFINITY);
    for (c, centroid) in centroids.rows().into_iter().enumerate() {
        let d = squared_euclidean(point, centroid);
        if d < best.1 {
            best = (c, d);
        }
    }
    best
}

impl Clustering for Kmeans {
    fn fit_predict(&self, data: ArrayView2<'_, f32>) -> Result<Vec<usize>> {
        self.fit(data).map(|fit| fit.labels)
    }

    fn n_clusters(&self) -> usize {
        self.k
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_kmeans_basic() {
        let data = array![[0.0f32, 0.0], [0.1, 0.1], [10.0, 10.0], [10.1, 10.1]];

        let labels = Kmeans::new(2).with_seed(42).fit_predict(data.view()).unwrap();

        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[2], labels[3]);
        assert_ne!(labels[0], labels[2]);
    }

    #[test]
    fn test_kmeans_all_points_assigned() {
        let data = Array2::from_shape_fn((50, 2), |(i, j)| {
            if j == 0 {
                i as f32 * 0.1
            } else {
                (i % 5) as f32
            }
        });

        let fit = Kmeans::new(5).with_seed(123).fit(data.view()).unwrap();

        assert_eq!(fit.labels.len(), 50);
        assert!(fit.labels.iter().all(|&l| l < 5));
        assert_eq!(fit.centroids.dim(), (5, 2));
        assert!(fit.inertia.is_finite());
    }

    #[test]
    fn test_kmeans_k_equals_n() {
        let data = array![[0.0f32, 0.0], [1.0, 0.0], [0.0, 1.0]];

        let labels = Kmeans::new(3).with_seed(42).fit_predict(data.view()).unwrap();

        let unique: std::collections::HashSet<_> = labels.iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn test_kmeans_deterministic_with_seed() {
        let data = Array2::from_shape_fn((40, 3), |(i, j)| ((i * 7 + j * 3) % 11) as f32);
        let a = Kmeans::new(4).with_seed(9).fit(data.view()).unwrap();
        let b = Kmeans::new(4).with_seed(9).fit(data.view()).unwrap();
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.centroids, b.centroids);
    }

    #[test]
    fn test_kmeans_invalid_k() {
        let data = array![[0.0f32, 0.0], [1.0, 1.0]];
        assert!(Kmeans::new(5).fit(data.view()).is_err());
        assert!(Kmeans::new(0).fit(data.view()).is_err());
        let empty = Array2::<f32>::zeros((0, 2));
        assert!(matches!(
            Kmeans::new(1).fit(empty.view()),
            Err(Error::Shape { .. })
        ));
    }
}
