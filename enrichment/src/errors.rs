use crate::config::ValidationError;
use crate::derive::DeriveError;
use http::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Errors that terminate a pipeline run
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),

    #[error(transparent)]
    Derive(#[from] DeriveError),

    #[error("section `{section}` failed: {reason}")]
    Upstream { section: String, reason: String },

    #[error("pipeline deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::MissingParameter(_) | PipelineError::Derive(_) => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::Upstream { .. } | PipelineError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            PipelineError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Message safe to return to the caller. Internal faults stay server-side.
    pub fn public_message(&self) -> String {
        match self {
            PipelineError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Errors raised while starting or serving the enrichment service
#[derive(Error, Debug)]
pub enum EnrichmentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}
