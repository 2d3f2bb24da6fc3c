use core::fmt;

/// Result alias for `tiermap`.
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline stage an error or a random stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Input validation (before any level is built).
    Input,
    /// Neighbor graph construction.
    NeighborGraph,
    /// Sigma fitting and fuzzy graph construction.
    FuzzyGraph,
    /// Initialisation and stochastic layout optimisation.
    Layout,
    /// Influence scoring, representative selection and absorption.
    Coarsen,
}

impl Stage {
    /// Stable numeric tag, used when deriving per-stage seeds.
    pub(crate) fn tag(self) -> u64 {
        match self {
            Stage::Input => 0,
            Stage::NeighborGraph => 1,
            Stage::FuzzyGraph => 2,
            Stage::Layout => 3,
            Stage::Coarsen => 4,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Input => "input",
            Stage::NeighborGraph => "neighbor graph",
            Stage::FuzzyGraph => "fuzzy graph",
            Stage::Layout => "layout",
            Stage::Coarsen => "coarsening",
        };
        f.write_str(name)
    }
}

/// Errors returned while configuring, fitting or reading a hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Invalid configuration: unknown strategy, degenerate sampling ratio, k ≥ N.
    Configuration {
        /// Offending parameter.
        name: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// Input shapes disagree (points vs labels, non-square distance matrix).
    Shape {
        /// Expected shape description.
        expected: String,
        /// Actual shape description.
        actual: String,
    },

    /// A non-finite value was produced or detected.
    Numeric {
        /// Stage that failed.
        stage: Stage,
        /// Level being built, when known.
        level: Option<usize>,
        /// Error message.
        message: String,
    },

    /// Accessor called with a level that does not exist.
    Range {
        /// Requested level.
        level: usize,
        /// Number of levels available for this accessor.
        level_count: usize,
    },

    /// An epoch observer stopped the fit.
    Cancelled {
        /// Level being optimised.
        level: usize,
        /// Last completed epoch.
        epoch: usize,
    },
}

impl Error {
    pub(crate) fn config(name: &'static str, message: impl Into<String>) -> Self {
        Error::Configuration {
            name,
            message: message.into(),
        }
    }

    pub(crate) fn numeric(stage: Stage, message: impl Into<String>) -> Self {
        Error::Numeric {
            stage,
            level: None,
            message: message.into(),
        }
    }

    /// Attach the level being built to stage errors that do not carry one yet.
    pub fn at_level(self, level: usize) -> Self {
        match self {
            Error::Numeric {
                stage,
                level: None,
                message,
            } => Error::Numeric {
                stage,
                level: Some(level),
                message,
            },
            Error::Cancelled { epoch, .. } => Error::Cancelled { level, epoch },
            other => other,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Configuration { name, message } => {
                write!(f, "invalid configuration '{name}': {message}")
            }
            Error::Shape { expected, actual } => {
                write!(f, "shape mismatch: expected {expected}, actual {actual}")
            }
            Error::Numeric {
                stage,
                level: Some(level),
                message,
            } => write!(f, "numeric failure in {stage} at level {level}: {message}"),
            Error::Numeric {
                stage,
                level: None,
                message,
            } => write!(f, "numeric failure in {stage}: {message}"),
            Error::Range { level, level_count } => {
                write!(f, "level {level} out of range (valid: 0..{level_count})")
            }
            Error::Cancelled { level, epoch } => {
                write!(f, "fit cancelled at level {level} after epoch {epoch}")
            }
        }
    }
}

impl std::error::Error for Error {}
