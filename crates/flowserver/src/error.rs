use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use flowcore::FlowError;
use serde::Serialize;
use std::fmt;

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// `FlowError` rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub FlowError);

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<FlowError> for ApiError {
    fn from(error: FlowError) -> Self {
        Self(error)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            FlowError::FlowNotFound(_) | FlowError::ExecutionNotFound(_) => StatusCode::NOT_FOUND,
            FlowError::Validation(_)
            | FlowError::UnknownNodeType(_)
            | FlowError::FlowInactive(_)
            | FlowError::NotRetryable { .. }
            | FlowError::Serialization(_) => StatusCode::BAD_REQUEST,
            FlowError::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.0.to_string(),
        })
    }
}
