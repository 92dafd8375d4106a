use serde::{Deserialize, Serialize};

/// One master-list entry from the customer worksheet. Normalized fields
/// are attached at load time by the customer cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub street: String,
    pub house_number: String,
    pub postal: String,
    pub is_existing: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCustomerRequest {
    pub name: String,
    pub street: String,
    pub house_number: String,
    pub postal: String,
    #[serde(default)]
    pub is_existing: bool,
}

#[derive(Debug, Deserialize)]
pub struct CustomerSearchQuery {
    pub name: String,
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub postal: Option<String>,
}
