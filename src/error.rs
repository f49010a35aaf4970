//! Error types for model construction, serialization and training sessions.
//!
//! Errors fall into three groups:
//!
//! - **Structural**: malformed topologies, unresolved glue cycles, shape
//!   mismatches and invalid options. Detected before any worker thread starts.
//! - **Resource**: file I/O and (de)serialization failures while loading or
//!   saving models, configurations and corpora.
//! - **Session**: failures reported by a running training session.
//!
//! Data problems (out-of-vocabulary words, empty sentences) are not errors;
//! readers count them and carry on.

use thiserror::Error;

/// Errors produced by this crate.
#[derive(Debug, Error)]
pub enum LmError {
    /// The network topology is malformed.
    #[error("Topology error: {0}")]
    Topology(String),

    /// The glue graph of a component still contains a cycle after removing
    /// every declared cycle head.
    #[error("Unresolved glue cycle in component '{component}': {detail}")]
    Cycle {
        /// Component whose graph failed validation
        component: String,
        /// What the validator found
        detail: String,
    },

    /// Two connected pieces disagree on a dimension.
    #[error("Shape mismatch for {what}: expected {expected}, actual {actual}")]
    ShapeMismatch {
        /// Name of the object being checked
        what: String,
        /// Expected dimension
        expected: usize,
        /// Actual dimension
        actual: usize,
    },

    /// A training or topology option is out of range.
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary model image (de)serialization failure.
    #[error("Model encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// A model image has the wrong magic number, version or layout.
    #[error("Model format error: {0}")]
    Format(String),

    /// The training session was used out of order or failed while running.
    #[error("Session error: {0}")]
    Session(String),

    /// A worker thread panicked.
    #[error("Worker thread '{0}' panicked")]
    WorkerPanic(String),
}

impl LmError {
    /// Create a Topology error.
    pub fn topology(message: impl Into<String>) -> Self {
        Self::Topology(message.into())
    }

    /// Create a Cycle error.
    pub fn cycle(component: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Cycle {
            component: component.into(),
            detail: detail.into(),
        }
    }

    /// Create a ShapeMismatch error.
    pub fn shape_mismatch(what: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            expected,
            actual,
        }
    }

    /// Create an InvalidOption error.
    pub fn invalid_option(message: impl Into<String>) -> Self {
        Self::InvalidOption(message.into())
    }

    /// Create a Format error.
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format(message.into())
    }

    /// Create a Session error.
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session(message.into())
    }

    /// True for errors that are detected at construction or setup time.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Topology(_)
                | Self::Cycle { .. }
                | Self::ShapeMismatch { .. }
                | Self::InvalidOption(_)
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_classification() {
        assert!(LmError::topology("no glues").is_structural());
        assert!(LmError::cycle("rnn", "hidden -> hidden").is_structural());
        assert!(LmError::shape_mismatch("fc", 3, 4).is_structural());
        assert!(LmError::invalid_option("bptt must be positive").is_structural());

        let io = LmError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(!io.is_structural());
        assert!(!LmError::session("not running").is_structural());
    }

    #[test]
    fn test_error_messages() {
        let err = LmError::shape_mismatch("glue 'emb'", 16, 8);
        assert_eq!(
            err.to_string(),
            "Shape mismatch for glue 'emb': expected 16, actual 8"
        );

        let err = LmError::cycle("main", "glue 'g2' still cyclic");
        assert_eq!(
            err.to_string(),
            "Unresolved glue cycle in component 'main': glue 'g2' still cyclic"
        );
    }
}
