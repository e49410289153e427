//! Error types shared by the measurement algorithms.
//!
//! Failures fall into four strata. The first three are represented here;
//! the fourth (partial failures such as a truncated aperture) travels
//! exclusively through result flags and never raises.
//!
//! 1. [`MeasureError::Logic`] — the schema or configuration was wired up
//!    incorrectly at construction time; measurement setup cannot proceed.
//! 2. [`MeasureError::FatalAlgorithm`] — the algorithm cannot run for this
//!    source at all; the caller must stop measuring it.
//! 3. [`MeasureError::Measurement`] — a structured per-source failure
//!    carrying the flag index to set on the output record; an algorithm's
//!    `fail` entry point translates it into record flags and returns.

use thiserror::Error;

/// Errors raised by measurement construction and per-source entry points.
#[derive(Error, Debug)]
pub enum MeasureError {
    /// Schema or configuration misuse detected at construction time.
    #[error("logic error: {0}")]
    Logic(String),

    /// The algorithm cannot measure this source; stop measuring it.
    #[error("fatal algorithm error: {0}")]
    FatalAlgorithm(String),

    /// A collaborator was used outside its contract at measurement time.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Structured measurement failure with the flag index to record.
    #[error("{message}")]
    Measurement {
        /// Human-readable description of what went wrong.
        message: String,
        /// Index of the flag (within the algorithm's flag set) to raise.
        flag: usize,
    },

    /// A numerical precondition failed (e.g. a singular Fisher matrix).
    ///
    /// Measurement entry points catch this stratum and downgrade it to the
    /// general failure flag rather than propagating.
    #[error("domain error: {0}")]
    Domain(String),
}
