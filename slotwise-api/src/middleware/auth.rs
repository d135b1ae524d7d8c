use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{authorization::Bearer, Authorization, HeaderMapExt};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use slotwise_core::change_request::{Initiator, InitiatorRole};
use slotwise_core::Session;

use crate::state::AppState;

// ============================================================================
// JWT Claims
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallerRole {
    Parent,
    Coach,
    Admin,
    /// Trusted internal callers such as the payment flow.
    Service,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CallerClaims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    pub role: CallerRole,
    /// Children a parent may act for.
    #[serde(default)]
    pub child_ids: Vec<String>,
    pub exp: usize,
}

impl CallerClaims {
    pub fn is_privileged(&self) -> bool {
        matches!(self.role, CallerRole::Admin | CallerRole::Service)
    }

    /// Parents act for their own children, coaches for their own sessions.
    pub fn can_act_on(&self, session: &Session) -> bool {
        match self.role {
            CallerRole::Admin | CallerRole::Service => true,
            CallerRole::Parent => self.child_ids.iter().any(|c| c == &session.child_id),
            CallerRole::Coach => self.sub == session.coach_id,
        }
    }

    pub fn initiator(&self) -> Initiator {
        let role = match self.role {
            CallerRole::Parent => InitiatorRole::Parent,
            CallerRole::Coach => InitiatorRole::Coach,
            CallerRole::Admin => InitiatorRole::Admin,
            CallerRole::Service => InitiatorRole::System,
        };
        Initiator::new(self.sub.clone(), role)
    }
}

// ============================================================================
// Authentication Middleware
// ============================================================================

pub async fn caller_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let bearer = req
        .headers()
        .typed_get::<Authorization<Bearer>>()
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token_data = decode::<CallerClaims>(
        bearer.token(),
        &DecodingKey::from_secret(state.settings.auth.secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| {
        tracing::debug!("Rejected token: {}", e);
        StatusCode::UNAUTHORIZED
    })?;

    req.extensions_mut().insert(token_data.claims);

    Ok(next.run(req).await)
}

/// Admin and service callers only. Must run after `caller_auth_middleware`.
pub async fn privileged_middleware(req: Request, next: Next) -> Result<Response, StatusCode> {
    let claims = req
        .extensions()
        .get::<CallerClaims>()
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !claims.is_privileged() {
        return Err(StatusCode::FORBIDDEN);
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime, Utc};
    use slotwise_core::{NewSession, SessionType};

    fn claims(role: CallerRole, sub: &str, children: &[&str]) -> CallerClaims {
        CallerClaims {
            sub: sub.to_string(),
            email: None,
            role,
            child_ids: children.iter().map(|c| c.to_string()).collect(),
            exp: 0,
        }
    }

    #[test]
    fn test_parent_scope_is_limited_to_their_children() {
        let session = Session::scheduled(
            NewSession {
                enrollment_id: uuid::Uuid::new_v4(),
                coach_id: "coachA".to_string(),
                child_id: "child-1".to_string(),
                session_number: 1,
                session_type: SessionType::Coaching,
                scheduled_date: NaiveDate::from_ymd_opt(2031, 1, 1).unwrap(),
                scheduled_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                duration_minutes: 30,
            },
            Utc::now(),
        );

        assert!(claims(CallerRole::Parent, "p1", &["child-1"]).can_act_on(&session));
        assert!(!claims(CallerRole::Parent, "p2", &["child-9"]).can_act_on(&session));
        assert!(claims(CallerRole::Coach, "coachA", &[]).can_act_on(&session));
        assert!(!claims(CallerRole::Coach, "coachB", &[]).can_act_on(&session));
        assert!(claims(CallerRole::Service, "payments", &[]).can_act_on(&session));
    }
}
