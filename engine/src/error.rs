//! Error taxonomy for the detection engine.
//!
//! Every variant is recovered locally by the caller that sees it; none of
//! them is fatal to the process. See `analysis` and `coordinator` for where
//! each one degrades into a non-violating verdict.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Remote media could not be fetched into scratch space.
    #[error("download failed for {remote_ref}: {reason}")]
    DownloadFailed { remote_ref: String, reason: String },

    /// A single frame (or every frame of a video) could not be produced.
    #[error("frame extraction failed for {}: {reason}", .path.display())]
    ExtractionFailed { path: PathBuf, reason: String },

    /// Classification service errored or timed out.
    #[error("classification unavailable: {0}")]
    ClassificationUnavailable(String),

    /// No policy exists for the chat. Treated as "feature disabled".
    #[error("no media policy for chat {0}")]
    PolicyMissing(i64),

    #[error("declared size {size_bytes} bytes exceeds limit of {limit_bytes} bytes")]
    TooLarge { size_bytes: u64, limit_bytes: u64 },

    #[error("declared duration {duration_secs:.1}s exceeds limit of {limit_secs:.0}s")]
    TooLong { duration_secs: f64, limit_secs: f64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn download(remote_ref: &str, reason: impl ToString) -> Self {
        EngineError::DownloadFailed {
            remote_ref: remote_ref.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn extraction(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        EngineError::ExtractionFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Short machine-friendly label used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::DownloadFailed { .. } => "download_failed",
            EngineError::ExtractionFailed { .. } => "extraction_failed",
            EngineError::ClassificationUnavailable(_) => "classification_unavailable",
            EngineError::PolicyMissing(_) => "policy_missing",
            EngineError::TooLarge { .. } => "too_large",
            EngineError::TooLong { .. } => "too_long",
            EngineError::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
