use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::Deserialize;

use crate::AppState;
use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::models::log::{LocationPoint, LogType};
use crate::tracking::{ActionEvent, ExternalPushRequest};

/// The mobile client sends either one fix or a batch.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum LocationBody {
    Batch { points: Vec<LocationPoint> },
    Single(LocationPoint),
}

pub async fn post_location(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<LocationBody>,
) -> Result<impl IntoResponse, ApiError> {
    let points = match body {
        LocationBody::Single(point) => vec![point],
        LocationBody::Batch { points } => points,
    };
    let total = points.len();
    let mut inserted = 0usize;
    for point in &points {
        if state
            .tracking
            .record_location(&user.user_id, &user.username, point)
        {
            inserted += 1;
        }
    }
    Ok(Json(serde_json::json!({
        "received": total,
        "inserted": inserted,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ActionsBody {
    pub actions: Vec<ActionEvent>,
}

pub async fn post_actions(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<ActionsBody>,
) -> Result<impl IntoResponse, ApiError> {
    let mut inserted = 0usize;
    for event in &body.actions {
        // session events also feed the auth audit log
        if event.kind == Some(LogType::Session) {
            state.writer.enqueue_auth(vec![
                user.username.clone(),
                event.timestamp_ms.to_string(),
                event.action.clone(),
            ]);
        }
        if state
            .tracking
            .record_action(&user.user_id, &user.username, event)
        {
            inserted += 1;
        }
    }
    Ok(Json(serde_json::json!({
        "received": body.actions.len(),
        "inserted": inserted,
    })))
}

/// Bulk push from the external tracking app, gated by a shared API key
/// instead of a user identity.
pub async fn external_push(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ExternalPushRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(expected) = &state.external_push_key else {
        return Err(ApiError::Forbidden(
            "Externe Übermittlung ist nicht konfiguriert".to_string(),
        ));
    };
    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if provided != expected {
        return Err(ApiError::Forbidden("Ungültiger API-Schlüssel".to_string()));
    }
    let summary = state.tracking.external_push(req).await;
    Ok((StatusCode::ACCEPTED, Json(summary)))
}
