use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use coordinator::{ClusterError, ErrorKind};
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Cluster(e) => e.kind(),
            ApiError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ApiError::InternalError(_) => ErrorKind::Internal,
        }
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::QuotaExceeded => StatusCode::INSUFFICIENT_STORAGE,
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = status_for(kind);

        if status.is_server_error() {
            tracing::warn!("Request failed with {}: {}", status, self);
        } else {
            tracing::debug!("Request rejected with {}: {}", status, self);
        }

        let body = serde_json::json!({
            "error": kind,
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ApiError::from(ClusterError::NotFound("f".into())), StatusCode::NOT_FOUND),
            (ApiError::from(ClusterError::Unavailable("x".into())), StatusCode::SERVICE_UNAVAILABLE),
            (ApiError::from(ClusterError::NodeConnectionLost("n".into())), StatusCode::SERVICE_UNAVAILABLE),
            (
                ApiError::from(ClusterError::QuotaExceeded { used: 1, requested: 2, quota: 2 }),
                StatusCode::INSUFFICIENT_STORAGE,
            ),
            (ApiError::InvalidRequest("bad".into()), StatusCode::BAD_REQUEST),
            (ApiError::from(ClusterError::Snapshot("disk".into())), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }
}
