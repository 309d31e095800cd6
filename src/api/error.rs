use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::error::PipelineError;

/// Failures of the control surface, mapped onto HTTP status codes.
#[derive(Debug, Error)]
pub(crate) enum ControlError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unprocessable(String),
    #[error("channel {0} has a stage attempt running")]
    AttemptRunning(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl ControlError {
    fn status(&self) -> StatusCode {
        match self {
            ControlError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ControlError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ControlError::AttemptRunning(_) => StatusCode::CONFLICT,
            ControlError::Pipeline(PipelineError::ChannelNotFound(_)) => StatusCode::NOT_FOUND,
            ControlError::Pipeline(_) | ControlError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = ?self, "control request failed");
        }
        let body = Json(ErrorResponse {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}
