use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{error, warn};

use snackngo_core::OrderError;

/// Errors a REST handler can answer with.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Order(#[from] OrderError),

    #[error("missing or invalid token")]
    Unauthorized,

    #[error("not allowed")]
    Forbidden,

    #[error("{0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Order(e) => match e {
                OrderError::NotFound { .. } => StatusCode::NOT_FOUND,
                OrderError::DuplicateChannel { .. }
                | OrderError::UsernameTaken { .. }
                | OrderError::InvalidTransition { .. }
                | OrderError::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
                OrderError::MissingValue { .. }
                | OrderError::InvalidValue { .. }
                | OrderError::Extraction { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                OrderError::UserInactive { .. } => StatusCode::FORBIDDEN,
                OrderError::Transport { .. } | OrderError::Storage(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("{}", self);
        } else {
            warn!("request refused ({}): {}", status.as_u16(), self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
