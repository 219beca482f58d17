// ============================================================================
// Error Handling - Outward error responses for protected-data failures
// ============================================================================
//
// 🔒 SECURITY: Services embedding this crate behind HTTP return AppError.
//
// 1. **Information Disclosure Prevention**
//    - Key versions, tenant ids, store paths and database errors are logged
//      server-side only
//    - Clients receive generic messages ("Unable to process protected data")
//    - Plaintext and key material never appear in either
//
// 2. **Retry Semantics**
//    - A key store outage (EncryptionError::is_retryable) maps to 503 so
//      clients back off and retry
//    - Every other encryption failure maps to 500 or 4xx and must not be
//      retried blindly
//
// ============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::services::encryption_service::EncryptionError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Encryption(err) => encryption_status(err),
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn encryption_status(err: &EncryptionError) -> StatusCode {
    match err {
        e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        EncryptionError::InvalidTenant(_) | EncryptionError::MalformedEnvelope(_) => {
            StatusCode::BAD_REQUEST
        }
        EncryptionError::RotationInProgress(_) | EncryptionError::ArchiveConflict { .. } => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_message = match self {
            AppError::Encryption(err) => {
                // 🔒 SECURITY: Log detailed error server-side, but don't expose details to client
                tracing::error!("Encryption error: {:?}", err);
                match status {
                    StatusCode::SERVICE_UNAVAILABLE => "Key service temporarily unavailable".to_string(),
                    StatusCode::CONFLICT => "Key rotation in progress".to_string(),
                    _ => "Unable to process protected data".to_string(),
                }
            }
            AppError::Internal(err) => {
                tracing::error!("Internal error: {:?}", err);
                "Internal server error".to_string()
            }
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
