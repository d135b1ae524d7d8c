use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;
use serde_json::json;
use slotwise_core::change_request::ChangeType;
use slotwise_core::repository::SessionRepository;
use slotwise_core::{CoreError, Session};
use slotwise_sessions::{
    CancelCommand, ChangeRequestDraft, DispatchOutcome, RescheduleCommand, ScheduleCommand, SessionCommand,
};
use uuid::Uuid;

use crate::{
    error::{status_for, AppError},
    middleware::{privileged_middleware, CallerClaims},
    state::AppState,
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Deserialize)]
pub struct CancelRequestBody {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RescheduleRequestBody {
    pub reason: String,
    #[serde(default)]
    pub new_date: Option<NaiveDate>,
    #[serde(default)]
    pub new_time: Option<NaiveTime>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveBody {
    #[serde(default)]
    pub new_date: Option<NaiveDate>,
    #[serde(default)]
    pub new_time: Option<NaiveTime>,
}

#[derive(Debug, Deserialize)]
pub struct DeclineBody {
    pub reason: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/sessions/{id}", get(get_session))
        .route("/v1/sessions/{id}/change-requests", get(list_change_requests))
        .route("/v1/sessions/{id}/cancel-request", post(cancel_request))
        .route("/v1/sessions/{id}/reschedule-request", post(reschedule_request))
}

/// Admin and service routes.
pub fn privileged_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/sessions/schedule", post(schedule_session))
        .route("/v1/change-requests/{id}/approve", post(approve_request))
        .route("/v1/change-requests/{id}/decline", post(decline_request))
        .route_layer(axum::middleware::from_fn(privileged_middleware))
}

fn correlation_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn outcome_response(outcome: DispatchOutcome, request_id: Option<Uuid>) -> Response {
    let status = outcome
        .error
        .as_ref()
        .map(|failure| status_for(&failure.cause))
        .unwrap_or(StatusCode::OK);

    let mut body = json!({ "orchestratorResult": outcome });
    if let Some(request_id) = request_id {
        body["requestId"] = json!(request_id);
    }
    (status, Json(body)).into_response()
}

async fn load_for_caller(state: &AppState, claims: &CallerClaims, id: Uuid) -> Result<Session, AppError> {
    let session = state
        .sessions
        .get_session(id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("session {}", id)))?;

    if !claims.can_act_on(&session) {
        return Err(AppError::AuthorizationError(format!("no access to session {}", id)));
    }
    Ok(session)
}

/// GET /v1/sessions/{id}
async fn get_session(
    State(state): State<AppState>,
    Extension(claims): Extension<CallerClaims>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let session = load_for_caller(&state, &claims, id).await?;
    let pending = state.ledger.pending_for(id).await?;
    Ok(Json(json!({
        "session": session,
        "pendingRequest": pending,
    })))
}

/// GET /v1/sessions/{id}/change-requests
async fn list_change_requests(
    State(state): State<AppState>,
    Extension(claims): Extension<CallerClaims>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    load_for_caller(&state, &claims, id).await?;
    let history = state.ledger.history(id).await?;
    Ok(Json(json!({ "changeRequests": history })))
}

/// POST /v1/sessions/{id}/cancel-request
async fn cancel_request(
    State(state): State<AppState>,
    Extension(claims): Extension<CallerClaims>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<CancelRequestBody>,
) -> Result<Response, AppError> {
    let session = load_for_caller(&state, &claims, id).await?;

    let request = state
        .ledger
        .create(ChangeRequestDraft {
            session_id: session.id,
            change_type: ChangeType::Cancel,
            reason: body.reason.clone(),
            requested_date: None,
            requested_time: None,
            initiated_by: claims.initiator(),
        })
        .await?;

    let command = SessionCommand::Cancel(CancelCommand {
        session_id: session.id,
        reason: body.reason,
        cancelled_by: claims.sub.clone(),
        request_id: Some(request.id),
    });
    let outcome = state.orchestrator.dispatch(command, correlation_id(&headers)).await;
    Ok(outcome_response(outcome, Some(request.id)))
}

/// POST /v1/sessions/{id}/reschedule-request
///
/// With a target slot the reschedule runs immediately; without one the
/// request stays pending for an admin.
async fn reschedule_request(
    State(state): State<AppState>,
    Extension(claims): Extension<CallerClaims>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<RescheduleRequestBody>,
) -> Result<Response, AppError> {
    let session = load_for_caller(&state, &claims, id).await?;

    let request = state
        .ledger
        .create(ChangeRequestDraft {
            session_id: session.id,
            change_type: ChangeType::Reschedule,
            reason: body.reason.clone(),
            requested_date: body.new_date,
            requested_time: body.new_time,
            initiated_by: claims.initiator(),
        })
        .await?;

    let (Some(new_date), Some(new_time)) = (body.new_date, body.new_time) else {
        return Ok((StatusCode::ACCEPTED, Json(json!({ "requestId": request.id }))).into_response());
    };

    let command = SessionCommand::Reschedule(RescheduleCommand {
        session_id: session.id,
        new_date,
        new_time,
        reason: body.reason,
        request_id: Some(request.id),
        hold_owner: Some(claims.sub.clone()),
    });
    let outcome = state.orchestrator.dispatch(command, correlation_id(&headers)).await;
    Ok(outcome_response(outcome, Some(request.id)))
}

/// POST /v1/sessions/schedule
///
/// Called once payment completes; turns the payer's hold into a booking.
async fn schedule_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(command): Json<ScheduleCommand>,
) -> Response {
    let outcome = state
        .orchestrator
        .dispatch(SessionCommand::Schedule(command), correlation_id(&headers))
        .await;
    outcome_response(outcome, None)
}

/// POST /v1/change-requests/{id}/approve
async fn approve_request(
    State(state): State<AppState>,
    Extension(claims): Extension<CallerClaims>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<ApproveBody>,
) -> Result<Response, AppError> {
    let request = state.ledger.get(id).await?;
    if !request.is_pending() {
        return Err(CoreError::StateGuard(format!("change request {} is {}", id, request.status.as_str())).into());
    }

    let command = match request.change_type {
        ChangeType::Cancel => SessionCommand::Cancel(CancelCommand {
            session_id: request.session_id,
            reason: request.reason,
            cancelled_by: claims.sub.clone(),
            request_id: Some(request.id),
        }),
        ChangeType::Reschedule => {
            let new_date = body.new_date.or(request.requested_date);
            let new_time = body.new_time.or(request.requested_time);
            let (Some(new_date), Some(new_time)) = (new_date, new_time) else {
                return Err(AppError::ValidationError("a new date and time are required".to_string()));
            };
            SessionCommand::Reschedule(RescheduleCommand {
                session_id: request.session_id,
                new_date,
                new_time,
                reason: request.reason,
                request_id: Some(request.id),
                hold_owner: None,
            })
        }
    };

    let outcome = state.orchestrator.dispatch(command, correlation_id(&headers)).await;
    Ok(outcome_response(outcome, Some(id)))
}

/// POST /v1/change-requests/{id}/decline
async fn decline_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<DeclineBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let request = state.orchestrator.decline(id, &body.reason).await?;
    Ok(Json(json!({ "changeRequest": request })))
}
