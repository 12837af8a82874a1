use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Parameter \"{0}\" is missing")]
    MissingParameter(String),
    #[error("{0}")]
    InvalidParameter(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    CommandError(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("GPIO error: {0}")]
    Gpio(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl AppError {
    /// `Parameter "name" is invalid (specified="value")`
    pub fn invalid_value(param: &str, specified: &str) -> Self {
        AppError::InvalidParameter(format!(
            "Parameter \"{param}\" is invalid (specified=\"{specified}\")"
        ))
    }

    pub fn invalid_type(param: &str, expected: &str) -> Self {
        AppError::InvalidParameter(format!(
            "Parameter \"{param}\" must be of type \"{expected}\""
        ))
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::MissingParameter(_) | AppError::InvalidParameter(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Unauthorized(_) => StatusCode::FORBIDDEN,
            AppError::CommandError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Config(_) | AppError::Gpio(_) | AppError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
