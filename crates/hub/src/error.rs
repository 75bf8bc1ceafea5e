//! Error taxonomy shared by the ingestion path and the HTTP API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use thiserror::Error;

/// Why a topic was not accepted as a soil-moisture status topic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("malformed topic '{0}': expected <namespace>/<device>/<metric>")]
    MalformedTopic(String),
    #[error("unrecognized namespace '{0}'")]
    UnrecognizedNamespace(String),
    #[error("unsupported metric '{0}'")]
    UnsupportedMetric(String),
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] sqlx::Error),

    #[error("publish rejected by transport: {0}")]
    TransportUnavailable(String),
}

pub type HubResult<T> = Result<T, HubError>;

impl HubError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Malformed topics, payloads and request fields are client mistakes.
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            Self::Topic(_) | Self::InvalidPayload(_) | Self::InvalidArgument(_)
        )
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Topic(_) | Self::InvalidPayload(_) | Self::InvalidArgument(_) => {
                "invalid_argument"
            }
            Self::NotFound(_) => "not_found",
            Self::StorageUnavailable(_) | Self::TransportUnavailable(_) => "unavailable",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::StorageUnavailable(_) | Self::TransportUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_input_maps_to_bad_request() {
        let errs = [
            HubError::Topic(TopicError::MalformedTopic("a/b".into())),
            HubError::InvalidPayload("x".into()),
            HubError::invalid_argument("durationMs is required"),
        ];
        for e in errs {
            assert!(e.is_malformed_input());
            assert_eq!(e.status(), StatusCode::BAD_REQUEST);
            assert_eq!(e.code(), "invalid_argument");
        }
    }

    #[test]
    fn not_found_maps_to_404() {
        let e = HubError::NotFound("device 'x'".into());
        assert!(!e.is_malformed_input());
        assert_eq!(e.status(), StatusCode::NOT_FOUND);
        assert_eq!(e.to_string(), "device 'x' not found");
    }

    #[test]
    fn storage_failure_is_server_side() {
        let e = HubError::from(sqlx::Error::PoolTimedOut);
        assert_eq!(e.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(e.code(), "unavailable");
    }
}
