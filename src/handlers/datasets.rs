use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::NaiveDate;
use serde::Deserialize;

use crate::AppState;
use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::models::address::Address;
use crate::models::dataset::{BulkUpdateRequest, CreateDatasetRequest, UpdateResidentRequest};
use crate::overlay;

pub async fn create_dataset(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CreateDatasetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let created = state.engine.create_dataset(&user.username, req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(Debug, Deserialize)]
pub struct AddressQuery {
    #[serde(default)]
    pub street: String,
    #[serde(default)]
    pub number: String,
    #[serde(default)]
    pub postal: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// Normalizing lookup; each hit carries its winback candidates.
pub async fn lookup(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<AddressQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let address = Address {
        street: query.street,
        number: query.number,
        postal: query.postal,
        city: query.city,
    };
    let mut datasets = state
        .engine
        .get_by_address(&user.username, &address, query.limit)
        .await?;

    match state.customers.at_address(&address).await {
        Ok(current) => {
            for response in &mut datasets {
                response.winback_candidates =
                    overlay::winback_candidates(&response.dataset, &current);
            }
        }
        Err(e) => tracing::warn!("winback lookup skipped, customer list unavailable: {e}"),
    }

    Ok(Json(serde_json::json!({ "datasets": datasets })))
}

#[derive(Debug, Deserialize)]
pub struct LocalQuery {
    #[serde(default)]
    pub street: String,
    #[serde(default)]
    pub number: String,
    #[serde(default)]
    pub postal: String,
}

/// Cache-only lookup without geocoder normalization.
pub async fn search_local(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<LocalQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let datasets =
        state
            .engine
            .search_local(&user.username, &query.street, &query.number, &query.postal);
    Ok(Json(serde_json::json!({ "datasets": datasets })))
}

pub async fn get_by_id(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let dataset = state.engine.get_by_id(&user.username, &id)?;
    Ok(Json(dataset))
}

pub async fn streets_overview(
    State(state): State<AppState>,
    user: AuthUser,
    Path(street): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let datasets = state.engine.streets_overview(&user.username, &street);
    Ok(Json(serde_json::json!({ "datasets": datasets })))
}

#[derive(Debug, Deserialize)]
pub struct SuggestionQuery {
    #[serde(default)]
    pub query: String,
}

pub async fn street_suggestions(
    State(state): State<AppState>,
    Query(query): Query<SuggestionQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let streets = state.engine.street_suggestions(&query.query);
    Ok(Json(serde_json::json!({ "streets": streets })))
}

pub async fn update_resident(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<UpdateResidentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let updated = state.engine.update_resident(&user.username, req)?;
    Ok(Json(updated))
}

pub async fn bulk_update_residents(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<BulkUpdateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let updated = state.engine.bulk_update_residents(&user.username, req)?;
    Ok(Json(updated))
}

/// A user may only read their own per-day history.
pub async fn history(
    State(state): State<AppState>,
    user: AuthUser,
    Path((username, date)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    if username != user.username {
        return Err(ApiError::Forbidden(
            "Die Tageshistorie ist nur für den eigenen Benutzer einsehbar".to_string(),
        ));
    }
    let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .map_err(|_| ApiError::Validation(format!("Ungültiges Datum: {date}")))?;
    let datasets = state.engine.user_datasets_by_date(&user.username, date);
    Ok(Json(serde_json::json!({ "datasets": datasets })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanPreviewRequest {
    pub address: Address,
    #[serde(default)]
    pub names: Vec<String>,
}

/// Overlay a fresh nameplate scan with the master list and the newest
/// historical dataset for the address.
pub async fn scan_preview(
    State(state): State<AppState>,
    _user: AuthUser,
    Json(req): Json<ScanPreviewRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let current = state
        .customers
        .at_address(&req.address)
        .await
        .map_err(ApiError::Internal)?;
    let historical = state.engine.latest_for_address(
        &req.address.street,
        &req.address.postal,
        &req.address.number,
    );
    let result = overlay::compute_overlay(&req.names, &current, historical.as_deref());
    Ok(Json(result))
}
