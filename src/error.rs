use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ChatError {
    /// The caller's role does not own the channel or operation.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// Rejected before publish; nothing was changed.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The persistence collaborator failed. Live fan-out is not rolled back.
    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("connection lost: {0}")]
    Transport(String),

    #[error("catalog lookup failed: {0}")]
    Catalog(String),

    #[error("missing or invalid bearer token")]
    Unauthenticated,
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Authorization(_) => "authorization",
            ChatError::Validation(_) => "validation",
            ChatError::Persistence(_) => "persistence",
            ChatError::Transport(_) => "transport",
            ChatError::Catalog(_) => "catalog",
            ChatError::Unauthenticated => "unauthenticated",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Authorization(_) => StatusCode::FORBIDDEN,
            ChatError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ChatError::Persistence(_) | ChatError::Catalog(_) => StatusCode::BAD_GATEWAY,
            ChatError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::Unauthenticated => StatusCode::UNAUTHORIZED,
        }
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        ChatError::Authorization(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ChatError::Validation(message.into())
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        ChatError::Persistence(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for ChatError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        ChatError::Persistence(err.to_string())
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        ChatError::Catalog(err.to_string())
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status(),
            Json(json!({ "error": self.to_string(), "code": self.code() })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses_line_up() {
        let err = ChatError::authorization("support may not join consultant_c1");
        assert_eq!(err.code(), "authorization");
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            err.to_string(),
            "not authorized: support may not join consultant_c1"
        );

        assert_eq!(ChatError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ChatError::validation("empty").status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
