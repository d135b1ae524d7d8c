use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use slotwise_core::CoreError;

#[derive(Debug)]
pub enum AppError {
    AuthenticationError(String),
    AuthorizationError(String),
    ValidationError(String),
    Anyhow(anyhow::Error),
}

/// HTTP status for each domain failure class.
pub fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::Conflict { .. } | CoreError::StateGuard(_) => StatusCode::CONFLICT,
        CoreError::QuotaExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
        CoreError::TransientDownstream(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn core_response(err: &CoreError) -> Response {
    let status = status_for(err);
    let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("Internal Server Error: {}", err);
        "Internal Server Error".to_string()
    } else {
        err.to_string()
    };

    let mut body = json!({
        "error": err.code(),
        "message": message,
    });
    if let Some(retry_after) = err.retry_after() {
        body["retryAfter"] = json!(retry_after);
    }
    (status, Json(body)).into_response()
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::AuthenticationError(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            AppError::AuthorizationError(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::Anyhow(err) => {
                if let Some(core) = err.downcast_ref::<CoreError>() {
                    return core_response(core);
                }
                tracing::error!("Internal Server Error: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal Server Error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": code,
            "message": message,
        }));

        (status, body).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Anyhow(err.into())
    }
}
