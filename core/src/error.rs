//! Error type shared by the localization crate.
//!
//! Only conditions that must abort a run are represented here. Recoverable conditions such as an
//! exhausted perturbation retry budget or a population that empties out during a step are absorbed by
//! the filter and reported through the `log` facade instead.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MclError>;

#[derive(Debug, Error)]
pub enum MclError {
    /// A logged record could not be parsed or has the wrong shape; the log is considered corrupt.
    /// `line` is the one-based line of the log, or the one-based step when the filter rejects it.
    #[error("malformed observation on line {line}: {reason}")]
    MalformedObservation { line: usize, reason: String },

    /// The expected range cache is missing, corrupt, or does not match the grid/bin configuration.
    #[error("expected range cache unavailable: {reason}")]
    CacheUnavailable { reason: String },

    /// The occupancy grid text could not be interpreted.
    #[error("invalid occupancy grid: {reason}")]
    InvalidGrid { reason: String },

    /// No cell of the grid satisfies the pose validity predicate, so no particle can be placed.
    #[error("occupancy grid has no cell with occupancy above {threshold}")]
    NoFreeSpace { threshold: f64 },

    /// The population could not be rebuilt after a step left no particle alive.
    #[error("particle population is empty after repair at step {step}")]
    EmptyPopulation { step: usize },

    /// A configuration value is out of its admissible range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl MclError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        MclError::Io {
            path: path.into(),
            source,
        }
    }
}
