use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use slotwise_core::{HoldStatus, SessionType, SlotKey};
use slotwise_sessions::{HoldLookup, HoldRequest};
use uuid::Uuid;

use crate::{error::AppError, middleware::CallerClaims, state::AppState};

fn default_duration() -> i32 {
    45
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateHoldBody {
    pub resource: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    #[serde(default = "default_duration")]
    pub duration_minutes: i32,
    pub purpose: SessionType,
    /// Admin and service callers may hold on behalf of someone else.
    #[serde(default)]
    pub owner: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HoldView {
    id: Uuid,
    resource: String,
    date: NaiveDate,
    time: NaiveTime,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct HoldResponse {
    hold: HoldView,
    extended: bool,
}

#[derive(Debug, Serialize)]
struct ReleaseResponse {
    released: bool,
}

#[derive(Debug, Deserialize)]
pub struct SlotQuery {
    pub resource: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/holds", post(create_hold).get(slot_status))
        .route("/v1/holds/{id}", get(hold_status).delete(release_hold))
}

fn owner_for(claims: &CallerClaims, requested: Option<String>) -> Result<String, AppError> {
    match requested {
        Some(owner) if owner != claims.sub && !claims.is_privileged() => Err(AppError::AuthorizationError(
            "cannot hold on behalf of another owner".to_string(),
        )),
        Some(owner) => Ok(owner),
        None => Ok(claims.sub.clone()),
    }
}

/// POST /v1/holds
async fn create_hold(
    State(state): State<AppState>,
    Extension(claims): Extension<CallerClaims>,
    Json(body): Json<CreateHoldBody>,
) -> Result<Json<HoldResponse>, AppError> {
    let owner = owner_for(&claims, body.owner)?;

    let grant = state
        .holds
        .create_or_extend(HoldRequest {
            resource_id: body.resource,
            slot_date: body.date,
            slot_time: body.time,
            duration_minutes: body.duration_minutes,
            purpose: body.purpose,
            owner,
        })
        .await?;

    let hold = grant.hold;
    Ok(Json(HoldResponse {
        hold: HoldView {
            id: hold.id,
            resource: hold.resource_id,
            date: hold.slot_date,
            time: hold.slot_time,
            expires_at: hold.expires_at,
        },
        extended: grant.extended,
    }))
}

/// DELETE /v1/holds/{id}
async fn release_hold(
    State(state): State<AppState>,
    Extension(claims): Extension<CallerClaims>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReleaseResponse>, AppError> {
    let owner = if claims.is_privileged() { None } else { Some(claims.sub.as_str()) };
    state.holds.release(id, owner).await?;
    Ok(Json(ReleaseResponse { released: true }))
}

/// GET /v1/holds/{id}
async fn hold_status(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<HoldStatus>, AppError> {
    Ok(Json(state.holds.status(HoldLookup::Id(id)).await?))
}

/// GET /v1/holds?resource=..&date=..&time=..
async fn slot_status(
    State(state): State<AppState>,
    Query(query): Query<SlotQuery>,
) -> Result<Json<HoldStatus>, AppError> {
    let slot = SlotKey::new(query.resource, query.date, query.time);
    Ok(Json(state.holds.status(HoldLookup::Slot(slot)).await?))
}
