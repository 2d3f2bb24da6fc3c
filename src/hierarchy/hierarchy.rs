//! The level-by-level fit and the read-only accessors over its result.

use std::ops::ControlFlow;

use super::coarsen::{coarsen, neighborhood_means, shared_neighbor_graph, Coarsening};
use super::config::{CoarseGeometry, HierarchyConfig};
use super::level::{Level, Seedling};
use crate::error::{Error, Result, Stage};
use crate::fuzzy::FuzzyGraph;
use crate::layout::{self, CurveParams, EpochEvent, EpochObserver};
use crate::metric::{Metric, PointSet};
use crate::neighbors::{reuse_graph, NeighborGraph, NeighborIndex};
use crate::rng::{substream, SeedSequence};
use log::{debug, info};
use ndarray::{Array2, ArrayView2};

/// A multi-resolution embedding of one point set.
///
/// Level 0 holds every input point; each following level keeps the
/// representatives selected from the level below. Every level carries its own
/// fuzzy graph and low-dimensional embedding.
///
/// ```text
/// level 2   ●           ●                 indices(1) ⊂ level 1
///           │╲          │╲
/// level 1   ●  ●    ●   ●  ●              indices(0) ⊂ level 0
///          ╱│   ╲   │╲  │   ╲
/// level 0 ● ● ●  ● ● ● ● ● ●  ●  ...      all N points
/// ```
///
/// `L` is the per-point label type. Labels ride along with their points and
/// are never looked at by the fit.
#[derive(Debug, Clone)]
pub struct Hierarchy<L> {
    config: HierarchyConfig,
    pub(super) levels: Vec<Level<L>>,
}

/// Observer that never interrupts.
struct Silent;

impl EpochObserver for Silent {
    fn on_epoch(&mut self, _event: &EpochEvent<'_>) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

/// Shared, read-only state of one fit.
struct FitContext<'a> {
    config: &'a HierarchyConfig,
    seeds: SeedSequence,
    curve: CurveParams,
    index: &'a dyn NeighborIndex,
}

impl<L: Clone + Send + Sync> Hierarchy<L> {
    /// Create an empty, unfitted hierarchy.
    pub fn new(config: HierarchyConfig) -> Self {
        Self {
            config,
            levels: Vec::new(),
        }
    }

    /// Build every configured level from `points`.
    ///
    /// `points` is `N × D` coordinates, or `N × N` distances when the metric is
    /// [`Metric::Precomputed`]. `labels` must have `N` entries.
    ///
    /// On error the hierarchy keeps whatever it held before the call.
    pub fn fit(&mut self, points: ArrayView2<'_, f32>, labels: &[L]) -> Result<()> {
        self.fit_with_observer(points, labels, &mut Silent)
    }

    /// Like [`fit`](Self::fit), reporting every optimisation epoch to `observer`.
    ///
    /// Returning `Break` from the observer aborts with [`Error::Cancelled`].
    pub fn fit_with_observer<O>(
        &mut self,
        points: ArrayView2<'_, f32>,
        labels: &[L],
        observer: &mut O,
    ) -> Result<()>
    where
        O: EpochObserver + Send,
    {
        let n = points.nrows();
        if labels.len() != n {
            return Err(Error::Shape {
                expected: format!("{n} labels"),
                actual: format!("{}", labels.len()),
            });
        }
        if self.config.metric == Metric::Precomputed && points.ncols() != n {
            return Err(Error::Shape {
                expected: format!("{n} x {n} distance matrix"),
                actual: format!("{} x {}", n, points.ncols()),
            });
        }
        let sizes = self.config.plan(n)?;
        let input = PointSet::new(points.to_owned(), self.config.metric)?;

        let config = &self.config;
        let levels = match config.threads {
            Some(threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .map_err(|e| Error::config("threads", e.to_string()))?;
                pool.install(|| build_levels(config, input, labels, &sizes, observer))
            }
            None => build_levels(config, input, labels, &sizes, observer),
        }?;

        self.levels = levels;
        Ok(())
    }
}

fn build_levels<L: Clone>(
    config: &HierarchyConfig,
    input: PointSet,
    labels: &[L],
    sizes: &[usize],
    observer: &mut dyn EpochObserver,
) -> Result<Vec<Level<L>>> {
    let index = config.ann_strategy.index(&config.nndescent, &config.ivf);
    let cx = FitContext {
        config,
        seeds: SeedSequence::from_option(config.seed),
        curve: CurveParams::fit(config.spread, config.min_dist),
        index: index.as_ref(),
    };
    info!(
        "fitting {} levels {:?} with {} neighbors ({} index, seed {})",
        sizes.len(),
        sizes,
        config.neighbor_count,
        index.name(),
        cx.seeds.root()
    );
    debug!("curve parameters a = {:.4}, b = {:.4}", cx.curve.a, cx.curve.b);

    let mut levels: Vec<Level<L>> = Vec::with_capacity(sizes.len());
    let base = Seedling::base(input, labels.to_vec());
    let mut knn = cx.neighbors(&base.points, 0)?;
    levels.push(cx.build_level(0, base, &knn, observer)?);

    for (l, &ratio) in config.sampling_ratios.iter().enumerate() {
        let level = l + 1;
        let below = &levels[l];
        let coarsening =
            coarsen(&below.graph, ratio, config.damping).map_err(|e| e.at_level(l))?;
        debug!(
            "level {l}: kept {} of {} points, {} fallback absorptions",
            coarsening.representatives.len(),
            below.points.len(),
            coarsening.fallbacks
        );

        let points = match config.coarse_geometry {
            CoarseGeometry::Subset | CoarseGeometry::SharedNeighbors => {
                below.points.select(&coarsening.representatives)
            }
            CoarseGeometry::NeighborhoodMean => neighborhood_means(
                &below.points,
                &knn,
                &below.graph,
                &coarsening.representatives,
            ),
        };
        let seedling = Seedling::coarser(below, &coarsening, points);
        let next = if config.coarse_geometry == CoarseGeometry::SharedNeighbors {
            cx.shared_neighbors(&knn, &below.graph, &coarsening, level)?
        } else if config.reuse_base_level_graph && l == 0 {
            cx.reused_neighbors(&knn, &coarsening, &seedling.points, level)?
        } else {
            cx.neighbors(&seedling.points, level)?
        };

        levels[l].coarsening = Some(coarsening);
        let built = cx.build_level(level, seedling, &next, observer)?;
        levels.push(built);
        knn = next;
    }

    info!("hierarchy complete: {} levels", levels.len());
    Ok(levels)
}

impl FitContext<'_> {
    fn neighbors(&self, points: &PointSet, level: usize) -> Result<NeighborGraph> {
        let seed = self.seeds.derive(Stage::NeighborGraph, level);
        self.index
            .build(points, self.config.neighbor_count, seed)
            .map_err(|e| e.at_level(level))
    }

    fn reused_neighbors(
        &self,
        base: &NeighborGraph,
        coarsening: &Coarsening,
        points: &PointSet,
        level: usize,
    ) -> Result<NeighborGraph> {
        debug!("level {level}: refining the level-0 neighbor graph");
        reuse_graph(
            base,
            &coarsening.representatives,
            points,
            self.config.neighbor_count,
            &self.config.nndescent,
            self.seeds.derive(Stage::NeighborGraph, level),
        )
        .map_err(|e| e.at_level(level))
    }

    fn shared_neighbors(
        &self,
        below: &NeighborGraph,
        graph: &FuzzyGraph,
        coarsening: &Coarsening,
        level: usize,
    ) -> Result<NeighborGraph> {
        debug!("level {level}: neighbor graph from shared neighbors of level {}", level - 1);
        shared_neighbor_graph(below, graph, &coarsening.representatives)
            .map_err(|e| e.at_level(level))
    }

    fn build_level<L>(
        &self,
        level: usize,
        seedling: Seedling<L>,
        knn: &NeighborGraph,
        observer: &mut dyn EpochObserver,
    ) -> Result<Level<L>> {
        let n = seedling.points.len();
        let (graph, scales) = FuzzyGraph::from_neighbors(knn, self.config.set_op_mix_ratio)
            .map_err(|e| e.at_level(level))?;
        info!(
            "level {level}: {n} points, {} fuzzy edges, {} components",
            graph.nnz() / 2,
            graph.connected_components()
        );

        let layout_seed = self.seeds.derive(Stage::Layout, level);
        let initial = layout::initialize(&graph, self.config.n_components, layout_seed);
        let params = self.config.layout_params(n, self.curve);
        debug!("level {level}: optimising for {} epochs", params.n_epochs);
        let embedding = layout::optimize(
            &graph,
            initial,
            &params,
            level,
            substream(layout_seed, 1),
            observer,
        )
        .map_err(|e| e.at_level(level))?;

        Ok(Level {
            points: seedling.points,
            labels: seedling.labels,
            graph,
            scales,
            embedding,
            influence: seedling.influence,
            coverage: seedling.coverage,
            origin: seedling.origin,
            coarsening: None,
        })
    }
}

impl<L> Hierarchy<L> {
    /// Configuration the hierarchy was created with.
    pub fn config(&self) -> &HierarchyConfig {
        &self.config
    }

    /// Whether [`fit`](Self::fit) has completed.
    pub fn is_fitted(&self) -> bool {
        !self.levels.is_empty()
    }

    /// Number of levels; 0 before the first successful fit.
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    fn level(&self, level: usize) -> Result<&Level<L>> {
        self.levels.get(level).ok_or(Error::Range {
            level,
            level_count: self.levels.len(),
        })
    }

    fn coarsening(&self, level: usize) -> Result<&Coarsening> {
        self.levels
            .get(level)
            .and_then(|l| l.coarsening.as_ref())
            .ok_or(Error::Range {
                level,
                level_count: self.levels.len().saturating_sub(1),
            })
    }

    /// Number of points at `level`.
    pub fn level_size(&self, level: usize) -> Result<usize> {
        Ok(self.level(level)?.points.len())
    }

    /// Positions of the points of `level` that survive to `level + 1`,
    /// ascending. Not defined for the top level.
    pub fn indices(&self, level: usize) -> Result<&[usize]> {
        Ok(&self.coarsening(level)?.representatives)
    }

    /// Position at `level + 1` of the representative absorbing each point.
    pub fn absorption(&self, level: usize) -> Result<&[usize]> {
        Ok(&self.coarsening(level)?.absorption)
    }

    /// Random-walk centrality used to select the representatives of `level`.
    pub fn centrality(&self, level: usize) -> Result<&[f32]> {
        Ok(&self.coarsening(level)?.centrality)
    }

    /// Labels of the points at `level`.
    pub fn labels(&self, level: usize) -> Result<&[L]> {
        Ok(&self.level(level)?.labels)
    }

    /// `N_level × n_components` coordinates.
    pub fn embedding(&self, level: usize) -> Result<ArrayView2<'_, f32>> {
        Ok(self.level(level)?.embedding.view())
    }

    /// Owned copy of [`embedding`](Self::embedding).
    pub fn embedding_owned(&self, level: usize) -> Result<Array2<f32>> {
        Ok(self.level(level)?.embedding.clone())
    }

    /// Points of the level below absorbed by each point, counting itself.
    /// All ones at level 0.
    pub fn influence(&self, level: usize) -> Result<&[f32]> {
        Ok(&self.level(level)?.influence)
    }

    /// Level-0 points each point stands for. Sums to `N` at every level.
    pub fn coverage(&self, level: usize) -> Result<&[f32]> {
        Ok(&self.level(level)?.coverage)
    }

    /// Fitted local distance scale of each point.
    pub fn sigmas(&self, level: usize) -> Result<&[f32]> {
        Ok(&self.level(level)?.scales.sigmas)
    }

    /// Distance to the nearest distinct neighbor of each point.
    pub fn rhos(&self, level: usize) -> Result<&[f32]> {
        Ok(&self.level(level)?.scales.rhos)
    }

    /// Row in the input matrix of each point at `level`.
    pub fn original_indices(&self, level: usize) -> Result<&[usize]> {
        Ok(&self.level(level)?.origin)
    }

    /// Points that were indexed at `level`.
    pub fn points(&self, level: usize) -> Result<&PointSet> {
        Ok(&self.level(level)?.points)
    }

    pub(crate) fn fuzzy_graph(&self, level: usize) -> Result<&FuzzyGraph> {
        Ok(&self.level(level)?.graph)
    }
}
