use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::models::dataset::DatasetResponse;

/// Conflict payload returned with every 409 on dataset creation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressConflict {
    pub existing_creator: String,
    pub is_own_dataset: bool,
    pub days_since_creation: i64,
    pub days_until_new_allowed: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_dataset: Option<DatasetResponse>,
}

/// Request-visible error taxonomy. Messages are user-facing German;
/// the `error` code is stable for clients.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{message}")]
    InvalidAddress {
        message: String,
        missing_fields: Vec<&'static str>,
    },
    #[error("{message}")]
    AddressConflict {
        message: String,
        conflict: Box<AddressConflict>,
    },
    #[error("Für diese Adresse läuft bereits eine Erfassung")]
    LockHeld,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("Geocoding-Dienst überlastet, bitte in wenigen Sekunden erneut versuchen")]
    RateLimited,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn incomplete_address(missing: Vec<&'static str>) -> Self {
        Self::InvalidAddress {
            message: format!(
                "Adresse unvollständig: {} erforderlich",
                missing.join(", ")
            ),
            missing_fields: missing,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::InvalidAddress { .. } => "INVALID_ADDRESS",
            Self::AddressConflict { .. } => "ADDRESS_CONFLICT",
            Self::LockHeld => "LOCK_HELD",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION",
            Self::RateLimited => "RATE_LIMITED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidAddress { .. } | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::AddressConflict { .. } | Self::LockHeld => StatusCode::CONFLICT,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        });

        match &self {
            ApiError::InvalidAddress { missing_fields, .. } => {
                body["missingFields"] = serde_json::json!(missing_fields);
            }
            ApiError::AddressConflict { conflict, .. } => {
                let extra = serde_json::to_value(conflict.as_ref()).unwrap_or_default();
                if let (Some(obj), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
                    for (k, v) in extra {
                        obj.insert(k.clone(), v.clone());
                    }
                }
            }
            ApiError::RateLimited => {
                body["retryAfterSecs"] = serde_json::json!(2);
            }
            ApiError::Internal(e) => {
                tracing::error!("internal error on request: {e:#}");
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}
