//! HTTP error mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chatminds_core::error::{Error, StoreError, ValidationError};
use serde::Serialize;
use tracing::error;

/// An error that renders as `{"success": false, "error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    /// Store could not be reached or a query failed.
    Unavailable(String),
    /// The completion backend failed.
    BadGateway(String),
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn message(self) -> String {
        match self {
            Self::BadRequest(m)
            | Self::NotFound(m)
            | Self::Unavailable(m)
            | Self::BadGateway(m) => m,
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::Validation(ValidationError::DocumentNotFound(id)) => {
                Self::NotFound(format!("Document not found: {id}"))
            }
            Error::Validation(v) => Self::BadRequest(v.to_string()),
            Error::Store(s) => s.into(),
            Error::Backend(b) => Self::BadGateway(b.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Error::from(e).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = ?self, "Request failed");
        }
        let body = ErrorBody {
            success: false,
            error: self.message(),
        };
        (status, Json(body)).into_response()
    }
}
