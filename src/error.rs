//! Error types for the conversion gateway

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, ConvertError>;

/// Every way a conversion request can end without a PDF.
///
/// Each variant maps to exactly one HTTP status (see [`ConvertError::status_code`]).
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    UnsupportedFormat(String),

    #[error("File too large (max: {max} bytes)")]
    PayloadTooLarge { max: u64 },

    #[error("Conversion timeout (>{}s)", .limit.as_secs_f64())]
    ConversionTimeout { backend: &'static str, limit: Duration },

    #[error("{backend} conversion failed ({status})")]
    ConversionFailed {
        backend: &'static str,
        status: String,
        stderr: String,
    },

    #[error("{backend} reported success but {expected} was not generated")]
    ArtifactMissing {
        backend: &'static str,
        expected: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConvertError {
    /// Stable kind name reported to clients in the `kind` field
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BadRequest",
            Self::UnsupportedFormat(_) => "UnsupportedFormat",
            Self::PayloadTooLarge { .. } => "PayloadTooLarge",
            Self::ConversionTimeout { .. } => "ConversionTimeout",
            Self::ConversionFailed { .. } => "ConversionFailed",
            Self::ArtifactMissing { .. } => "ArtifactMissing",
            Self::Internal(_) | Self::Io(_) => "InternalError",
        }
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::UnsupportedFormat(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ConversionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::ConversionFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ArtifactMissing { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for ConvertError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let kind = self.kind();

        let (message, details) = match &self {
            ConvertError::ConversionFailed { stderr, .. } => {
                let details = (!stderr.is_empty()).then(|| stderr.clone());
                (self.to_string(), details)
            }
            ConvertError::ConversionTimeout { limit, .. } => (
                self.to_string(),
                Some(format!("backend exceeded its {}s limit and was terminated", limit.as_secs_f64())),
            ),
            ConvertError::Internal(_) | ConvertError::Io(_) => {
                tracing::error!("Internal error: {}", self);
                (
                    "An internal error occurred".to_string(),
                    if cfg!(debug_assertions) {
                        Some(self.to_string())
                    } else {
                        None
                    },
                )
            }
            _ => (self.to_string(), None),
        };

        let body = Json(ErrorResponse {
            error: message,
            kind,
            details,
        });

        (status, body).into_response()
    }
}
