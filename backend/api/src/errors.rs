//! Application-wide error types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use foodshare_lifecycle::{ErrorKind, LifecycleError};
use thiserror::Error;
use tracing::error;

use crate::api::ErrorResponse;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing or malformed caller identity headers.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Webhook error: {0}")]
    Webhook(String),

    /// A stored row failed to decode into a typed record.
    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::Lifecycle(e) => match e.kind() {
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::InvalidStateTransition => StatusCode::UNPROCESSABLE_ENTITY,
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::Conflict | ErrorKind::ConcurrentModification => StatusCode::CONFLICT,
                ErrorKind::NotAuthorized => StatusCode::FORBIDDEN,
                ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ServerError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Database(_)
            | ServerError::Migrate(_)
            | ServerError::Http(_)
            | ServerError::Json(_)
            | ServerError::Config(_)
            | ServerError::Webhook(_)
            | ServerError::CorruptRow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("request failed: {self}");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Lets the SQLite collaborator surface driver failures through the engine.
pub(crate) fn storage(err: ServerError) -> LifecycleError {
    match err {
        ServerError::Lifecycle(inner) => inner,
        other => LifecycleError::storage(other),
    }
}
