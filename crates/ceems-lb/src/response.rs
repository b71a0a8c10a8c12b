//! Error responses in the CEEMS API wire format

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Error categories surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Missing or unknown cluster ID, malformed parameters
    BadRequest,
    /// Missing user header
    Unauthorized,
    /// Resource not allowed or ownership verification failed
    Forbidden,
    /// Reserved for downstream API responses
    UserError,
    /// Malformed query parameters such as unparseable timestamps
    DataError,
    /// Transport error contacting a backend
    BadGateway,
    /// All backends for the cluster are dead
    NoBackend,
}

impl ErrorType {
    /// HTTP status code for this error category.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorType::BadRequest => StatusCode::BAD_REQUEST,
            ErrorType::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorType::Forbidden => StatusCode::FORBIDDEN,
            ErrorType::UserError => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorType::DataError => StatusCode::BAD_REQUEST,
            ErrorType::BadGateway => StatusCode::BAD_GATEWAY,
            ErrorType::NoBackend => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// An error reply in the CEEMS API envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    /// Error category
    pub error_type: ErrorType,

    /// Human-readable message
    pub message: String,
}

/// Serialized body of an error reply.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: String,

    #[serde(rename = "errorType")]
    pub error_type: ErrorType,

    pub error: String,
}

impl ApiError {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorType::BadRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Forbidden, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(ErrorType::BadGateway, message)
    }

    pub fn no_backend(message: impl Into<String>) -> Self {
        Self::new(ErrorType::NoBackend, message)
    }

    /// HTTP status code of the reply.
    pub fn status_code(&self) -> StatusCode {
        self.error_type.status_code()
    }

    /// Label used for request metrics.
    pub fn status_label(&self) -> String {
        self.status_code().as_u16().to_string()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let body = ErrorBody {
            status: "error".to_string(),
            error_type: self.error_type,
            error: self.message,
        };
        (status_code, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_types_map_to_status_codes() {
        assert_eq!(ErrorType::BadRequest.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ErrorType::Unauthorized.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ErrorType::Forbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorType::BadGateway.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ErrorType::NoBackend.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn error_body_uses_wire_names() {
        let body = ErrorBody {
            status: "error".to_string(),
            error_type: ErrorType::NoBackend,
            error: "all backends are down".to_string(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["errorType"], "no_backend");
        assert_eq!(json["error"], "all backends are down");
    }
}
