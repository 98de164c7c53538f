use axum::{
    response::{IntoResponse, Response},
    Json,
};
use http::StatusCode;

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Every failure a query or tool call can report to the caller.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Caller input is invalid; nothing was encoded or queried.
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("embedding model error: {0}")]
    Model(String),
    /// Datastore unreachable, rejected the credentials, or timed out.
    /// Safe to retry with backoff.
    #[error("datastore connection error: {0}")]
    Connection(String),
    /// Schema or dimension defect. Retrying will not help.
    #[error("query error: {0}")]
    Query(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation_error",
            ServiceError::Model(_) => "model_error",
            ServiceError::Connection(_) => "connection_error",
            ServiceError::Query(_) => "query_error",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Io(_) => "io_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Model(_) | ServiceError::Query(_) | ServiceError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("{}: {}", self.kind(), self);
        } else {
            log::debug!("{}: {}", self.kind(), self);
        }
        let body = ErrorBody {
            error: self.kind().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[test]
fn test_error_kinds_are_distinct() {
    let errors = [
        ServiceError::Validation("k".into()),
        ServiceError::Model("m".into()),
        ServiceError::Connection("c".into()),
        ServiceError::Query("q".into()),
        ServiceError::NotFound("n".into()),
        ServiceError::Io(std::io::Error::other("io")),
    ];
    let kinds: std::collections::HashSet<_> = errors.iter().map(|e| e.kind()).collect();
    assert_eq!(kinds.len(), errors.len());
    assert_eq!(errors[0].status(), StatusCode::BAD_REQUEST);
    assert_eq!(errors[2].status(), StatusCode::SERVICE_UNAVAILABLE);
}
