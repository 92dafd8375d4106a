use chrono::{DateTime, Utc};
use chrono_tz::Europe::Berlin;
use rand::{Rng, distr::Alphanumeric};
use serde::{Deserialize, Serialize};

use crate::models::address::{Address, NormalizedAddress};
use crate::models::resident::Resident;

/// Authoritative per-address record. Owned by `created_by` for the edit
/// window, then frozen forever. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressDataset {
    pub id: String,
    pub normalized_address: NormalizedAddress,
    pub street: String,
    pub house_number: String,
    pub postal: String,
    pub city: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    /// Raw OCR frame, preserved for audit.
    pub raw_resident_data: serde_json::Value,
    pub editable_residents: Vec<Resident>,
    pub fixed_customers: Vec<Resident>,
}

impl AddressDataset {
    /// `<epoch-ms>-<6 alnum>`: sortable by creation time, unique under
    /// concurrent creates.
    pub fn new_id(now: DateTime<Utc>) -> String {
        let suffix: String = rand::rng()
            .sample_iter(Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();
        format!("{}-{}", now.timestamp_millis(), suffix)
    }
}

/// Wire form of a dataset: adds the derived edit flag and, on flexible
/// house-number lookups, the non-exact marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetResponse {
    #[serde(flatten)]
    pub dataset: AddressDataset,
    pub can_edit: bool,
    /// Berlin-local display form of `created_at`.
    pub created_at_local: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_non_exact_match: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub winback_candidates: Vec<String>,
}

impl DatasetResponse {
    pub fn new(dataset: AddressDataset, can_edit: bool) -> Self {
        let local = dataset
            .created_at
            .with_timezone(&Berlin)
            .format("%d.%m.%Y %H:%M")
            .to_string();
        Self {
            dataset,
            can_edit,
            created_at_local: local,
            is_non_exact_match: None,
            winback_candidates: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDatasetRequest {
    pub address: Address,
    #[serde(default)]
    pub editable_residents: Vec<Resident>,
    #[serde(default)]
    pub raw_resident_data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResidentRequest {
    pub dataset_id: String,
    pub index: usize,
    /// None deletes the resident at `index`.
    pub resident: Option<Resident>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkUpdateRequest {
    pub dataset_id: String,
    pub residents: Vec<Resident>,
}
