use chrono::{DateTime, Utc};
use serde::Serialize;

/// Classification of one scanned nameplate against the customer master
/// list and the most recent historical dataset for the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// In the current customer list and historically an existing customer.
    ConfirmedExisting,
    /// In the current list but recorded as a prospect back then.
    ListVsDatasetConflict,
    /// Not in the current list but historically an existing customer.
    DatasetOnlyExisting,
    /// Not in the current list, historically a prospect.
    HistoricalProspect,
    /// No historical dataset covers the address.
    NoHistoricalData,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NameMatch {
    pub name: String,
    pub kind: MatchKind,
    /// Status carried over from the historical prospect entry, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub historical_status: Option<crate::models::resident::ResidentStatus>,
    /// Name of the resident this one appears to have replaced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_tenant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moved_in_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayResult {
    pub matches: Vec<NameMatch>,
    /// Historical existing customers no longer on the current master list.
    pub winback_candidates: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub historical_dataset_id: Option<String>,
}
