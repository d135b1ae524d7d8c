use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use slotwise_core::RetryJob;
use slotwise_sessions::RetryOutcome;

use crate::{
    error::AppError,
    middleware::signature::SIGNATURE_HEADER,
    state::AppState,
};

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/retry/callback", post(retry_callback))
}

/// POST /v1/retry/callback
///
/// Delivery endpoint for external at-least-once queues. Authenticated by
/// the HMAC signature header, not by JWT.
async fn retry_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RetryOutcome>, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::AuthenticationError("missing signature".to_string()))?;

    state
        .verifier
        .verify(&body, signature, state.clock.now().timestamp())
        .map_err(|e| {
            tracing::warn!("Rejected retry callback: {}", e);
            AppError::AuthenticationError(e.to_string())
        })?;

    let job: RetryJob = serde_json::from_slice(&body)
        .map_err(|e| AppError::ValidationError(format!("invalid retry job: {}", e)))?;

    Ok(Json(state.retry.process_retry(job).await))
}
