use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("switchover failed: {0}")]
    Switchover(String),

    #[error("stop failed: {0}")]
    Stop(String),
}

impl ApiError {
    pub fn switchover(msg: impl Into<String>) -> Self {
        Self::Switchover(msg.into())
    }

    pub fn stop(msg: impl Into<String>) -> Self {
        Self::Stop(msg.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!("admin request failed: {}", self);
        let body = Json(json!({
            "error": self.to_string()
        }));
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
