use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::NaiveDate;

use crate::AppState;
use crate::error::ApiError;

pub async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn geocode_queue(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.geocode.status())
}

pub async fn writer(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.writer.status())
}

pub async fn day_store_stats(
    State(state): State<AppState>,
    Path(date): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .map_err(|_| ApiError::Validation(format!("Ungültiges Datum: {date}")))?;
    let stats = state.day_store.stats(date).map_err(ApiError::Internal)?;
    Ok(Json(stats))
}
