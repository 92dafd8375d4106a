use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;

use crate::AppState;
use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::models::address::Address;
use crate::models::customer::{CreateCustomerRequest, CustomerSearchQuery};

pub async fn search(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<CustomerSearchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let address = match (&query.street, &query.postal) {
        (Some(street), Some(postal)) => Some(Address {
            street: street.clone(),
            number: query.number.clone().unwrap_or_default(),
            postal: postal.clone(),
            city: None,
        }),
        _ => None,
    };
    let customers = state
        .customers
        .search(&query.name, address.as_ref())
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(serde_json::json!({ "customers": customers })))
}

pub async fn create(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CreateCustomerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() || req.street.trim().is_empty() || req.postal.trim().is_empty() {
        return Err(ApiError::Validation(
            "Name, Straße und PLZ sind erforderlich".to_string(),
        ));
    }
    let customer = state
        .customers
        .create(&req)
        .await
        .map_err(ApiError::Internal)?;
    // audit trail for the category change behind this creation
    state.writer.enqueue_category_change(vec![
        Utc::now().to_rfc3339(),
        user.username.clone(),
        customer.id.clone(),
        customer.name.clone(),
        format!("{} {}", customer.street, customer.house_number),
        customer.postal.clone(),
    ]);
    Ok((StatusCode::CREATED, Json(customer)))
}
