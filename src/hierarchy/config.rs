//! Hierarchy configuration.

use crate::error::{Error, Result};
use crate::layout::{CurveParams, LayoutParams};
use crate::metric::Metric;
use crate::neighbors::{AnnStrategy, IvfParams, NnDescentParams};
use std::fmt;
use std::str::FromStr;

/// Geometry given to the points of a coarser level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum CoarseGeometry {
    /// Representatives keep their original coordinates.
    #[default]
    Subset,
    /// Representatives move by the membership-weighted mean offset to their
    /// `k` nearest neighbors (feature input only).
    NeighborhoodMean,
    /// Representatives keep their coordinates, but the coarser level's
    /// neighbor graph comes from the neighbors they share in the level below
    /// instead of a fresh search.
    SharedNeighbors,
}

impl FromStr for CoarseGeometry {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "subset" => Ok(CoarseGeometry::Subset),
            "neighborhood-mean" | "similarity" => Ok(CoarseGeometry::NeighborhoodMean),
            "shared-neighbors" | "precomputed" => Ok(CoarseGeometry::SharedNeighbors),
            other => Err(Error::config(
                "coarse_geometry",
                format!(
                    "unknown geometry '{other}' (expected subset, neighborhood-mean or shared-neighbors)"
                ),
            )),
        }
    }
}

impl fmt::Display for CoarseGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoarseGeometry::Subset => f.write_str("subset"),
            CoarseGeometry::NeighborhoodMean => f.write_str("neighborhood-mean"),
            CoarseGeometry::SharedNeighbors => f.write_str("shared-neighbors"),
        }
    }
}

/// Configuration of a hierarchical embedding.
///
/// The number of levels is `sampling_ratios.len() + 1`; level `l + 1` keeps
/// `⌈sampling_ratios[l] · N_l⌉` points of level `l`.
///
/// # Example
///
/// ```rust
/// use tiermap::{AnnStrategy, HierarchyConfig};
///
/// let config = HierarchyConfig::default()
///     .with_sampling_ratios(vec![0.3, 0.3])
///     .with_neighbor_count(10)
///     .with_ann_strategy(AnnStrategy::Exact)
///     .with_seed(7);
/// assert_eq!(config.plan(1000).unwrap(), vec![1000, 300, 90]);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct HierarchyConfig {
    /// Distance strategy for the input matrix.
    pub metric: Metric,
    /// One ratio in (0, 1) per level transition.
    pub sampling_ratios: Vec<f64>,
    /// Neighbors per point (k).
    pub neighbor_count: usize,
    /// Neighbor search strategy, applied at every level.
    pub ann_strategy: AnnStrategy,
    /// Seed level 1's neighbor graph from level 0's instead of a fresh search.
    /// Has no effect with [`CoarseGeometry::SharedNeighbors`].
    pub reuse_base_level_graph: bool,
    /// Coordinates of representatives at coarser levels.
    pub coarse_geometry: CoarseGeometry,
    /// Output dimension.
    pub n_components: usize,
    /// Epochs per level; `None` uses 500 up to 10 000 points, 200 above.
    pub n_epochs: Option<usize>,
    /// Negative samples per positive sample.
    pub negative_sample_rate: usize,
    /// Initial learning rate.
    pub learning_rate: f32,
    /// Minimum embedded distance between close points.
    pub min_dist: f32,
    /// Scale of embedded clusters.
    pub spread: f32,
    /// Weight of the repulsive term.
    pub repulsion_strength: f32,
    /// Blend between fuzzy union (1) and intersection (0).
    pub set_op_mix_ratio: f32,
    /// PageRank damping for influence scoring.
    pub damping: f64,
    /// Root seed; `None` draws one from entropy.
    pub seed: Option<u64>,
    /// Worker threads; `None` uses the global rayon pool. `Some(1)` also
    /// makes the optimizer sequential and the fit bit-reproducible.
    pub threads: Option<usize>,
    /// NNDescent tuning.
    pub nndescent: NnDescentParams,
    /// IVF tuning.
    pub ivf: IvfParams,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            metric: Metric::Euclidean,
            sampling_ratios: vec![0.3],
            neighbor_count: 15,
            ann_strategy: AnnStrategy::KdTreeNnDescent,
            reuse_base_level_graph: false,
            coarse_geometry: CoarseGeometry::Subset,
            n_components: 2,
            n_epochs: None,
            negative_sample_rate: 5,
            learning_rate: 1.0,
            min_dist: 0.1,
            spread: 1.0,
            repulsion_strength: 1.0,
            set_op_mix_ratio: 1.0,
            damping: 0.85,
            seed: None,
            threads: None,
            nndescent: NnDescentParams::default(),
            ivf: IvfParams::default(),
        }
    }
}

impl HierarchyConfig {
    /// Set the metric.
    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    /// Set the per-transition sampling ratios.
    pub fn with_sampling_ratios(mut self, ratios: Vec<f64>) -> Self {
        self.sampling_ratios = ratios;
        self
    }

    /// Set k.
    pub fn with_neighbor_count(mut self, k: usize) -> Self {
        self.neighbor_count = k;
        self
    }

    /// Set the neighbor search strategy.
    pub fn with_ann_strategy(mut self, strategy: AnnStrategy) -> Self {
        self.ann_strategy = strategy;
        self
    }

    /// Reuse level 0's neighbor graph for level 1.
    pub fn with_reuse_base_level_graph(mut self, reuse: bool) -> Self {
        self.reuse_base_level_graph = reuse;
        self
    }

    /// Set the coarse-level geometry.
    pub fn with_coarse_geometry(mut self, geometry: CoarseGeometry) -> Self {
        self.coarse_geometry = geometry;
        self
    }

    /// Set the output dimension.
    pub fn with_n_components(mut self, n_components: usize) -> Self {
        self.n_components = n_components;
        self
    }

    /// Fix the number of epochs at every level.
    pub fn with_n_epochs(mut self, n_epochs: usize) -> Self {
        self.n_epochs = Some(n_epochs);
        self
    }

    /// Set the negative sampling rate.
    pub fn with_negative_sample_rate(mut self, rate: usize) -> Self {
        self.negative_sample_rate = rate;
        self
    }

    /// Set the initial learning rate.
    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Set `min_dist` and `spread`.
    pub fn with_min_dist(mut self, min_dist: f32, spread: f32) -> Self {
        self.min_dist = min_dist;
        self.spread = spread;
        self
    }

    /// Set the repulsion strength.
    pub fn with_repulsion_strength(mut self, gamma: f32) -> Self {
        self.repulsion_strength = gamma;
        self
    }

    /// Set the fuzzy union/intersection mix.
    pub fn with_set_op_mix_ratio(mut self, mix: f32) -> Self {
        self.set_op_mix_ratio = mix;
        self
    }

    /// Set the influence damping factor.
    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    /// Set the root seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the worker thread count.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Set NNDescent tuning.
    pub fn with_nndescent(mut self, params: NnDescentParams) -> Self {
        self.nndescent = params;
        self
    }

    /// Set IVF tuning.
    pub fn with_ivf(mut self, params: IvfParams) -> Self {
        self.ivf = params;
        self
    }

    /// Number of levels this configuration produces.
    pub fn level_count(&self) -> usize {
        self.sampling_ratios.len() + 1
    }

    /// Check every field that does not depend on the input size.
    pub fn validate(&self) -> Result<()> {
        if self.neighbor_count == 0 {
            return Err(Error::config("neighbor_count", "must be at least 1"));
        }
        for (l, &r) in self.sampling_ratios.iter().enumerate() {
            if !(r.is_finite() && r > 0.0 && r < 1.0) {
                return Err(Error::config(
                    "sampling_ratios",
                    format!("ratio {r} for transition {l} is not in (0, 1)"),
                ));
            }
        }
        if self.n_components == 0 {
            return Err(Error::config("n_components", "must be at least 1"));
        }
        if self.n_epochs == Some(0) {
            return Err(Error::config("n_epochs", "must be at least 1"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::config("learning_rate", "must be positive"));
        }
        if !(self.spread.is_finite() && self.spread > 0.0) {
            return Err(Error::config("spread", "must be positive"));
        }
        if !(self.min_dist.is_finite() && self.min_dist >= 0.0 && self.min_dist <= self.spread) {
            return Err(Error::config("min_dist", "must lie in [0, spread]"));
        }
        if !(self.repulsion_strength.is_finite() && self.repulsion_strength >= 0.0) {
            return Err(Error::config("repulsion_strength", "must be non-negative"));
        }
        if !(0.0..=1.0).contains(&self.set_op_mix_ratio) {
            return Err(Error::config("set_op_mix_ratio", "must lie in [0, 1]"));
        }
        if !(self.damping > 0.0 && self.damping < 1.0) {
            return Err(Error::config("damping", "must lie in (0, 1)"));
        }
        if self.threads == Some(0) {
            return Err(Error::config("threads", "must be at least 1"));
        }
        if self.metric == Metric::Precomputed
            && self.coarse_geometry == CoarseGeometry::NeighborhoodMean
        {
            return Err(Error::config(
                "coarse_geometry",
                "neighborhood means need feature rows, not precomputed distances",
            ));
        }
        self.nndescent.validate()?;
        self.ivf.validate()
    }

    /// Level sizes for `n` input points.
    ///
    /// Fails when a level would keep fewer than 2 points, would not shrink,
    /// or would be too small for `neighbor_count`.
    pub fn plan(&self, n: usize) -> Result<Vec<usize>> {
        self.validate()?;
        let k = self.neighbor_count;
        if k >= n {
            return Err(Error::config(
                "neighbor_count",
                format!("k = {k} requires at least {} points, got {n}", k + 1),
            ));
        }
        let mut sizes = vec![n];
        let mut current = n;
        for (l, &r) in self.sampling_ratios.iter().enumerate() {
            let next = sample_size(r, current);
            if next < 2 || next >= current {
                return Err(Error::config(
                    "sampling_ratios",
                    format!(
                        "ratio {r} turns level {l} ({current} points) into {next} points; \
                         need 2 <= size < {current}"
                    ),
                ));
            }
            if k >= next {
                return Err(Error::config(
                    "neighbor_count",
                    format!("level {} would have {next} points, too few for k = {k}", l + 1),
                ));
            }
            sizes.push(next);
            current = next;
        }
        Ok(sizes)
    }

    /// Epochs for a level of `n` points.
    pub fn epochs_for(&self, n: usize) -> usize {
        self.n_epochs
            .unwrap_or(if n <= 10_000 { 500 } else { 200 })
    }

    /// Optimizer settings for a level of `n` points.
    pub(crate) fn layout_params(&self, n: usize, curve: CurveParams) -> LayoutParams {
        LayoutParams {
            n_epochs: self.epochs_for(n),
            negative_sample_rate: self.negative_sample_rate,
            learning_rate: self.learning_rate,
            repulsion_strength: self.repulsion_strength,
            curve,
            sequential: self.threads == Some(1),
        }
    }
}

/// `⌈r · n⌉`, treating products within 1e-9 of an integer as that integer.
pub fn sample_size(ratio: f64, n: usize) -> usize {
    let exact = ratio * n as f64;
    let nearest = exact.round();
    if (exact - nearest).abs() <= 1e-9 * exact.abs().max(1.0) {
        nearest as usize
    } else {
        exact.ceil() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_size_decimal_ratios() {
        assert_eq!(sample_size(0.3, 200), 60);
        assert_eq!(sample_size(0.1, 1000), 100);
        assert_eq!(sample_size(0.3, 7), 3);
        assert_eq!(sample_size(0.5, 3), 2);
    }

    #[test]
    fn test_plan_sizes() {
        let cfg = HierarchyConfig::default()
            .with_sampling_ratios(vec![0.5, 0.5])
            .with_neighbor_count(5);
        assert_eq!(cfg.plan(100).unwrap(), vec![100, 50, 25]);
        assert_eq!(cfg.level_count(), 3);
    }

    #[test]
    fn test_plan_rejects_tiny_levels() {
        let cfg = HierarchyConfig::default()
            .with_sampling_ratios(vec![0.001])
            .with_neighbor_count(1);
        assert!(matches!(
            cfg.plan(100),
            Err(Error::Configuration {
                name: "sampling_ratios",
                ..
            })
        ));
    }

    #[test]
    fn test_plan_rejects_k_too_large_for_coarse_level() {
        let cfg = HierarchyConfig::default()
            .with_sampling_ratios(vec![0.1])
            .with_neighbor_count(15);
        assert!(matches!(
            cfg.plan(100),
            Err(Error::Configuration {
                name: "neighbor_count",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_ratio_bounds() {
        for r in [0.0, 1.0, -0.5, f64::NAN] {
            let cfg = HierarchyConfig::default().with_sampling_ratios(vec![r]);
            assert!(cfg.validate().is_err(), "ratio {r} accepted");
        }
    }

    #[test]
    fn test_neighborhood_mean_needs_features() {
        let cfg = HierarchyConfig::default()
            .with_metric(Metric::Precomputed)
            .with_coarse_geometry(CoarseGeometry::NeighborhoodMean);
        assert!(matches!(
            cfg.validate(),
            Err(Error::Configuration {
                name: "coarse_geometry",
                ..
            })
        ));
    }

    #[test]
    fn test_epochs_default_by_size() {
        let cfg = HierarchyConfig::default();
        assert_eq!(cfg.epochs_for(10_000), 500);
        assert_eq!(cfg.epochs_for(10_001), 200);
        assert_eq!(cfg.with_n_epochs(42).epochs_for(10), 42);
    }

    #[test]
    fn test_geometry_from_str() {
        assert_eq!(
            "neighborhood-mean".parse::<CoarseGeometry>().unwrap(),
            CoarseGeometry::NeighborhoodMean
        );
        assert_eq!(
            "precomputed".parse::<CoarseGeometry>().unwrap(),
            CoarseGeometry::SharedNeighbors
        );
        assert_eq!(CoarseGeometry::SharedNeighbors.to_string(), "shared-neighbors");
        assert!("median".parse::<CoarseGeometry>().is_err());
    }

    #[test]
    fn test_shared_neighbors_accepts_distances() {
        let cfg = HierarchyConfig::default()
            .with_metric(Metric::Precomputed)
            .with_coarse_geometry(CoarseGeometry::SharedNeighbors);
        assert!(cfg.validate().is_ok());
    }
}
