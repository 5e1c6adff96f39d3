//! Error taxonomy for calibration, persistence and replay.
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AjdcError {
    /// Band out of range, sampling-rate or layout mismatch, window too short.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("channel mismatch: expected {expected}, found {found}")]
    ChannelMismatch { expected: String, found: String },

    #[error("source index {index} out of range for {n_sources} sources")]
    Index { index: usize, n_sources: usize },

    /// The decomposition could not be computed. Relaxing the
    /// dimensionality reduction and refitting usually helps.
    #[error("numerical error: {0}")]
    Numerical(String),

    #[error("no decomposition parameters at {}", path.display())]
    NotFound { path: PathBuf },

    #[error("malformed file: {0}")]
    Format(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AjdcError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn numerical(msg: impl Into<String>) -> Self {
        Self::Numerical(msg.into())
    }

    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }
}

impl From<ndarray::ShapeError> for AjdcError {
    fn from(e: ndarray::ShapeError) -> Self {
        Self::Format(format!("shape error: {e}"))
    }
}

impl From<serde_json::Error> for AjdcError {
    fn from(e: serde_json::Error) -> Self {
        Self::Format(format!("json: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, AjdcError>;
