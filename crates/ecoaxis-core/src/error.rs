//! Error taxonomy for fitting, blending and simulation.
//!
//! Recoverable conditions (insufficient data, PSD correction, missing phylogeny
//! reference) are usually handled locally and recorded in diagnostics; the
//! variants below exist for the cases where a caller must decide.

use thiserror::Error;

use crate::axis::Axis;

/// Result type alias using [`EcoaxisError`].
pub type Result<T> = std::result::Result<T, EcoaxisError>;

/// Unified error type for ecoaxis operations.
#[derive(Debug, Error)]
pub enum EcoaxisError {
    #[error("Insufficient data: need {needed} observations, got {got} ({context})")]
    InsufficientData {
        needed: usize,
        got: usize,
        context: String,
    },

    #[error("Numerical instability: {0}")]
    NumericalInstability(String),

    #[error("Missing reference: {0}")]
    MissingReference(String),

    #[error("Malformed artifact: {0}")]
    MalformedArtifact(String),

    #[error("Missing axis {axis} in {context}")]
    MissingAxis { axis: Axis, context: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Parse error at {location}: {message}")]
    Parse { location: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl EcoaxisError {
    /// Shorthand for a parse error with a location hint.
    pub fn parse(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            location: location.into(),
            message: message.into(),
        }
    }

    /// Whether this error should fail only the row that hit it.
    pub fn is_row_local(&self) -> bool {
        matches!(
            self,
            Self::MalformedArtifact(_)
                | Self::MissingAxis { .. }
                | Self::NumericalInstability(_)
                | Self::InsufficientData { .. }
        )
    }
}
