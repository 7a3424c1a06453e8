use crate::error::{ErrorClass, PaymentError};
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: &'static str,
    pub message: String,
}

/// HTTP status for an error, chosen by its class.
pub fn status_for(error: &PaymentError) -> StatusCode {
    match error.class() {
        ErrorClass::Validation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorClass::NotFound => StatusCode::NOT_FOUND,
        ErrorClass::Conflict => StatusCode::CONFLICT,
        ErrorClass::Security => StatusCode::BAD_REQUEST,
        ErrorClass::Transient => match error {
            PaymentError::GatewayUnreachable { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        },
        ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for PaymentError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        let message = match self.class() {
            ErrorClass::Internal => {
                tracing::error!(error = %self, "internal error");
                "Internal server error".to_string()
            }
            ErrorClass::Transient => {
                tracing::warn!(error = %self, "transient failure");
                self.to_string()
            }
            _ => self.to_string(),
        };
        let body = ErrorBody {
            success: false,
            error: self.code(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
