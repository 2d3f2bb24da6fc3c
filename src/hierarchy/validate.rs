//! Structural checks over a fitted [`Hierarchy`].
//!
//! A health check walks every level and records what it finds:
//!
//! ```text
//! per level     shapes agree, fuzzy graph symmetric with weights in [0, 1],
//!               embedding finite, sigmas positive
//! per pair      level shrinks, representatives ascending and self-absorbed,
//!               absorption total, influence sums to the size below
//! ```
//!
//! ```rust,ignore
//! use tiermap::{HealthCheck, Hierarchy};
//!
//! let report = hierarchy.health_check();
//! if !report.is_healthy() {
//!     eprintln!("{report}");
//! }
//! ```

use std::fmt;

use super::level::Level;
use super::Hierarchy;
use crate::fuzzy::FuzzyGraph;

/// Relative tolerance for influence mass conservation.
const MASS_TOLERANCE: f32 = 1e-4;

/// How bad a finding is. Anything at [`Severity::Error`] or above makes a
/// hierarchy unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
    /// The level's arrays cannot be trusted at all.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        })
    }
}

/// One finding, optionally pinned to a level and a point of that level.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub message: String,
    pub level: Option<usize>,
    pub point: Option<usize>,
}

impl ValidationIssue {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            level: None,
            point: None,
        }
    }

    pub fn at_level(mut self, level: usize) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_point(mut self, point: usize) -> Self {
        self.point = Some(point);
        self
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)?;
        if let Some(l) = self.level {
            write!(f, " at level {l}")?;
        }
        if let Some(p) = self.point {
            write!(f, ", point {p}")?;
        }
        Ok(())
    }
}

/// Findings of one check, in the order they were found.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn add(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    /// No finding at [`Severity::Error`] or above.
    pub fn is_healthy(&self) -> bool {
        self.issues.iter().all(|i| i.severity < Severity::Error)
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.issues.is_empty() {
            return writeln!(f, "no issues");
        }
        for issue in &self.issues {
            writeln!(f, "{issue}")?;
        }
        Ok(())
    }
}

/// Findings plus per-level graph statistics.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub validation: ValidationReport,
    /// Points per level, finest first.
    pub level_sizes: Vec<usize>,
    /// Undirected fuzzy edges per level.
    pub edge_counts: Vec<usize>,
    /// Connected components of each level's fuzzy graph.
    pub components: Vec<usize>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.validation.is_healthy()
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (l, size) in self.level_sizes.iter().enumerate() {
            writeln!(
                f,
                "level {l}: {size} points, {} edges, {} components",
                self.edge_counts[l], self.components[l]
            )?;
        }
        write!(f, "{}", self.validation)
    }
}

/// Anything that can report on its own structural guarantees.
pub trait HealthCheck {
    fn health_check(&self) -> HealthReport;

    fn is_healthy(&self) -> bool {
        self.health_check().is_healthy()
    }
}

impl<L> HealthCheck for Hierarchy<L> {
    fn health_check(&self) -> HealthReport {
        let mut validation = ValidationReport::default();
        let mut level_sizes = Vec::with_capacity(self.level_count());
        let mut edge_counts = Vec::with_capacity(self.level_count());
        let mut components = Vec::with_capacity(self.level_count());

        if !self.is_fitted() {
            validation.add(ValidationIssue::new(Severity::Info, "hierarchy is not fitted"));
        }

        for (l, level) in self.levels.iter().enumerate() {
            let n = level.points.len();
            level_sizes.push(n);
            edge_counts.push(level.graph.nnz() / 2);
            components.push(level.graph.connected_components());

            check_level_shapes(&mut validation, l, level);
            check_graph(&mut validation, l, &level.graph);

            if let Some(p) = level.embedding.iter().position(|v| !v.is_finite()) {
                validation.add(
                    ValidationIssue::new(Severity::Critical, "non-finite embedding coordinate")
                        .at_level(l)
                        .with_point(p / level.embedding.ncols().max(1)),
                );
            }
            for (i, &s) in level.scales.sigmas.iter().enumerate() {
                if !(s.is_finite() && s > 0.0) {
                    validation.add(
                        ValidationIssue::new(Severity::Error, format!("sigma {s} is not positive"))
                            .at_level(l)
                            .with_point(i),
                    );
                }
            }
            if level.scales.fallbacks > 0 {
                validation.add(
                    ValidationIssue::new(
                        Severity::Info,
                        format!("{} sigma fits used the fallback", level.scales.fallbacks),
                    )
                    .at_level(l),
                );
            }
        }

        for l in 1..self.levels.len() {
            let below = &self.levels[l - 1];
            let above = &self.levels[l];
            let (n_below, n_above) = (below.points.len(), above.points.len());
            if n_above >= n_below {
                validation.add(
                    ValidationIssue::new(
                        Severity::Error,
                        format!("level does not shrink ({n_below} -> {n_above} points)"),
                    )
                    .at_level(l),
                );
            }

            let Some(c) = below.coarsening.as_ref() else {
                validation.add(
                    ValidationIssue::new(Severity::Critical, "missing coarsening record")
                        .at_level(l - 1),
                );
                continue;
            };
            if c.representatives.len() != n_above {
                validation.add(
                    ValidationIssue::new(
                        Severity::Error,
                        format!(
                            "{} representatives for {n_above} points",
                            c.representatives.len()
                        ),
                    )
                    .at_level(l - 1),
                );
            }
            if !c.representatives.windows(2).all(|w| w[0] < w[1])
                || c.representatives.iter().any(|&r| r >= n_below)
            {
                validation.add(
                    ValidationIssue::new(
                        Severity::Error,
                        "representatives are not ascending positions in range",
                    )
                    .at_level(l - 1),
                );
            }
            if c.absorption.len() != n_below {
                validation.add(
                    ValidationIssue::new(
                        Severity::Error,
                        format!("absorption covers {} of {n_below} points", c.absorption.len()),
                    )
                    .at_level(l - 1),
                );
            }
            for (i, &owner) in c.absorption.iter().enumerate() {
                if owner >= n_above {
                    validation.add(
                        ValidationIssue::new(Severity::Error, "absorbed by a missing representative")
                            .at_level(l - 1)
                            .with_point(i),
                    );
                }
            }
            for (pos, &r) in c.representatives.iter().enumerate() {
                if c.absorption.get(r) != Some(&pos) {
                    validation.add(
                        ValidationIssue::new(Severity::Error, "representative not absorbed by itself")
                            .at_level(l - 1)
                            .with_point(r),
                    );
                }
            }

            let mass: f32 = above.influence.iter().sum();
            if above.influence.iter().any(|&w| w < 0.0)
                || (mass - n_below as f32).abs() > MASS_TOLERANCE * n_below as f32
            {
                validation.add(
                    ValidationIssue::new(
                        Severity::Error,
                        format!("influence mass {mass} does not match {n_below} points below"),
                    )
                    .at_level(l),
                );
            }
        }

        HealthReport {
            validation,
            level_sizes,
            edge_counts,
            components,
        }
    }
}

fn check_level_shapes<L>(report: &mut ValidationReport, l: usize, level: &Level<L>) {
    let n = level.points.len();
    let lengths = [
        ("labels", level.labels.len()),
        ("graph", level.graph.len()),
        ("embedding", level.embedding.nrows()),
        ("influence", level.influence.len()),
        ("coverage", level.coverage.len()),
        ("sigmas", level.scales.sigmas.len()),
    ];
    for (what, len) in lengths {
        if len != n {
            report.add(
                ValidationIssue::new(
                    Severity::Critical,
                    format!("{what} has {len} entries for {n} points"),
                )
                .at_level(l),
            );
        }
    }
}

fn check_graph(report: &mut ValidationReport, l: usize, graph: &FuzzyGraph) {
    if !graph.is_symmetric() {
        report.add(ValidationIssue::new(Severity::Error, "fuzzy graph is not symmetric").at_level(l));
    }
    if let Some((i, _, w)) = graph
        .edges()
        .find(|&(_, _, w)| !(w.is_finite() && (0.0..=1.0).contains(&w)))
    {
        report.add(
            ValidationIssue::new(Severity::Error, format!("edge weight {w} outside [0, 1]"))
                .at_level(l)
                .with_point(i),
        );
    }
    if let Some(i) = (0..graph.len()).find(|&i| graph.degree(i) == 0.0) {
        report.add(
            ValidationIssue::new(Severity::Warning, "point has no fuzzy edges")
                .at_level(l)
                .with_point(i),
        );
    }
}
