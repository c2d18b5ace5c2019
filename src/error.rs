use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use thiserror::Error;

use crate::skiplist::QueryError;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("{0}")]
    BadPath(String),
    #[error("{0}")]
    InvalidQuery(String),
    #[error("content type must be application/json")]
    ContentType,
    #[error("{0}")]
    BadRequest(String),
    #[error("schema violation: {0}")]
    SchemaViolation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    AlreadyExists(String),
    #[error("{0}")]
    Conflict(String),
    #[error("deadline elapsed during query")]
    DeadlineElapsed,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<toml::de::Error> for DbError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for DbError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<QueryError> for DbError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::DeadlineElapsed => Self::DeadlineElapsed,
            QueryError::Copy => Self::Internal("couldn't copy value in query".to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
}

impl IntoResponse for DbError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Config(_)
            | Self::BadPath(_)
            | Self::InvalidQuery(_)
            | Self::ContentType
            | Self::BadRequest(_)
            | Self::SchemaViolation(_)
            | Self::AlreadyExists(_)
            | Self::DeadlineElapsed => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::PRECONDITION_FAILED,
            Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = self.to_string();
        (status, Json(ErrorBody { message: &message })).into_response()
    }
}
