use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub mod error;
pub mod health;
pub mod holds;
pub mod middleware;
pub mod retry;
pub mod sessions;
pub mod state;
pub mod worker;

pub use state::AppState;

const RATE_LIMIT_WINDOW_SECONDS: i64 = 60;

#[derive(Clone)]
struct XRequestId;

impl MakeRequestId for XRequestId {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::USER_AGENT]);

    let request_id = HeaderName::from_static(sessions::REQUEST_ID_HEADER);

    // Everything except health and the signed retry callback needs a JWT.
    let protected = Router::new()
        .merge(holds::routes())
        .merge(sessions::routes())
        .merge(sessions::privileged_routes())
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::caller_auth_middleware,
        ));

    Router::new()
        .merge(health::routes())
        .merge(retry::routes())
        .merge(protected)
        .layer(cors)
        .layer(axum::middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id, XRequestId))
        .with_state(state)
}

/// Fixed-window limit per client IP. Skipped without Redis or a peer
/// address, and fails open when Redis errors.
async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let Some(redis) = state.redis.as_ref() else {
        return next.run(req).await;
    };
    let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>().cloned() else {
        return next.run(req).await;
    };

    let key = format!("ratelimit:{}", addr.ip());
    match redis
        .check_rate_limit(&key, state.settings.rate_limit_per_minute, RATE_LIMIT_WINDOW_SECONDS)
        .await
    {
        Ok(false) => (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response(),
        Ok(true) => next.run(req).await,
        Err(e) => {
            tracing::warn!("Rate limiter unavailable: {}", e);
            next.run(req).await
        }
    }
}
