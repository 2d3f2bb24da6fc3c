//! Multi-resolution hierarchies of embeddings.
//!
//! # The Core Insight
//!
//! A single embedding of a large dataset shows either the fine structure or
//! the overall shape, rarely both. A hierarchy keeps several resolutions of
//! the same data, each with its own layout, tied together by explicit
//! representative/absorption relations:
//!
//! ```text
//! Level │ Points        │ Shows
//! ──────┼───────────────┼──────────────────────────────
//!   0   │ N             │ every point, local detail
//!   1   │ ⌈r₀·N⌉        │ neighborhoods, one point each
//!   2   │ ⌈r₁·⌈r₀·N⌉⌉   │ clusters and their relations
//! ```
//!
//! # Building one level
//!
//! ```text
//! points ──► kNN graph ──► fuzzy graph ──► spectral init ──► SGD layout
//!                               │
//!                               ▼
//!                  centrality ──► representatives ──► next level's points
//!                               │
//!                               └──► absorption map, influence
//! ```
//!
//! 1. [`neighbors`](crate::neighbors) finds the `k` nearest neighbors.
//! 2. [`fuzzy`](crate::fuzzy) turns them into a symmetric membership graph.
//! 3. [`layout`](crate::layout) embeds that graph in `n_components` dimensions.
//! 4. [`coarsen`] keeps the most central points and assigns every other point
//!    to one of them.
//!
//! Levels are built strictly in order; nothing from level `k + 1` is needed
//! to build level `k`.
//!
//! # Influence
//!
//! Representatives are chosen by the stationary mass of a damped random walk
//! on the fuzzy graph (see [`centrality`]). Once chosen, a representative's
//! influence is `1 + absorbed`: the number of points of the level below it
//! stands for. Influence therefore sums to the size of the level below, and
//! the transitive [`coverage`](Hierarchy::coverage) sums to `N` at every level.
//!
//! # Example
//!
//! ```rust,no_run
//! use ndarray::Array2;
//! use tiermap::{Hierarchy, HierarchyConfig};
//!
//! let points = Array2::<f32>::zeros((1000, 16));
//! let labels = vec![0u32; 1000];
//!
//! let config = HierarchyConfig::default()
//!     .with_sampling_ratios(vec![0.3, 0.3])
//!     .with_seed(42);
//! let mut hierarchy = Hierarchy::new(config);
//! hierarchy.fit(points.view(), &labels)?;
//!
//! for level in 0..hierarchy.level_count() {
//!     let embedding = hierarchy.embedding(level)?;
//!     let weights = hierarchy.influence(level)?;
//!     println!("level {level}: {} points, max influence {}",
//!         embedding.nrows(),
//!         weights.iter().copied().fold(0.0, f32::max));
//! }
//! # Ok::<(), tiermap::Error>(())
//! ```

mod coarsen;
mod config;
#[allow(clippy::module_inception)]
mod hierarchy;
mod influence;
mod level;
mod validate;

pub use coarsen::{coarsen, neighborhood_means, shared_neighbor_graph, Coarsening, MAX_HOPS};
pub use config::{sample_size, CoarseGeometry, HierarchyConfig};
pub use hierarchy::Hierarchy;
pub use influence::centrality;
pub use validate::{HealthCheck, HealthReport, Severity, ValidationIssue, ValidationReport};
