//! Cache error types.
//!
//! Every variant maps to one HTTP status.  The enum implements
//! [`axum::response::IntoResponse`] so handlers can simply return
//! `Err(CacheError::NotFound)`.  Response bodies carry only the status
//! reason; store errors are logged, never echoed to the client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Errors surfaced by the cache's HTTP operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Missing credential headers or a credential that does not match.
    #[error("Unauthorized")]
    Unauthenticated,

    /// Unrecognized route, or a GET for a key with no stored blob.
    #[error("Not Found")]
    NotFound,

    /// The request body exceeded `server.max_object_size`.
    #[error("Payload Too Large")]
    PayloadTooLarge,

    /// Writing the blob failed after the index row was upserted.
    #[error("Upload failed")]
    UploadFailed(#[source] anyhow::Error),

    /// Catch-all for store and other unexpected failures.
    #[error("Internal Server Error")]
    Internal(#[from] anyhow::Error),
}

impl CacheError {
    /// Return the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            CacheError::Unauthenticated => StatusCode::UNAUTHORIZED,
            CacheError::NotFound => StatusCode::NOT_FOUND,
            CacheError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            CacheError::UploadFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CacheError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        match &self {
            CacheError::UploadFailed(e) => error!("Upload failed: {e:#}"),
            CacheError::Internal(e) => error!("Internal error: {e:#}"),
            _ => {}
        }

        (
            self.status_code(),
            [("content-type", "text/plain; charset=utf-8")],
            self.to_string(),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            CacheError::Unauthenticated.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(CacheError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            CacheError::PayloadTooLarge.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            CacheError::UploadFailed(anyhow::anyhow!("disk full")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            CacheError::Internal(anyhow::anyhow!("boom")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_internal_error_body_hides_detail() {
        let err = CacheError::Internal(anyhow::anyhow!("sqlite: database is locked"));
        assert_eq!(err.to_string(), "Internal Server Error");
    }

    #[test]
    fn test_request_id_format() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }
}
