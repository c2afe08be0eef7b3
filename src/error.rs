use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    response::{IntoResponse, Response},
    Json,
};
use http::{header, HeaderValue, StatusCode};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::ordering::OrderingError;
use crate::store::StoreError;
use crate::validation::ValidationErrors;
use crate::visibility::Withheld;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("the requested resource could not be found")]
    NotFound,

    #[error("validation failed")]
    Validation(ValidationErrors),

    #[error("you have already voted on this poll")]
    AlreadyVoted,

    #[error("poll has expired")]
    Expired,

    #[error("results will be available {}", .0.reason())]
    ResultsWithheld(Withheld),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("invalid or missing token")]
    Unauthorized,

    #[error("token not valid for this poll")]
    WrongPoll,

    #[error("{0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl AppError {
    pub fn internal(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        AppError::Internal(err.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::AlreadyVoted => StatusCode::CONFLICT,
            AppError::Expired => StatusCode::FORBIDDEN,
            AppError::ResultsWithheld(_) => StatusCode::FORBIDDEN,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::WrongPoll => StatusCode::BAD_REQUEST,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ValidationErrors> for AppError {
    fn from(errors: ValidationErrors) -> Self {
        AppError::Validation(errors)
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => AppError::NotFound,
            StoreError::AlreadyVoted => AppError::AlreadyVoted,
            other => AppError::internal(other),
        }
    }
}

impl From<OrderingError> for AppError {
    fn from(err: OrderingError) -> Self {
        match err {
            OrderingError::UnknownOption => AppError::NotFound,
            OrderingError::InvalidMapping => AppError::BadRequest(err.to_string()),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            AppError::Validation(errors) => json!({ "error": errors }),
            AppError::Internal(source) => {
                error!(error = %source, "Request failed");
                json!({ "error": "the server encountered a problem and could not process your request" })
            }
            other => json!({ "error": other.to_string() }),
        };

        let mut response = (status, Json(body)).into_response();
        if matches!(self, AppError::Unauthorized) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

pub type AppResult<T> = Result<T, AppError>;
