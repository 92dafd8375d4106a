use serde::{Deserialize, Serialize};

/// Raw address as entered in the field. Street, number and postal code are
/// required for dataset writes; `number` may be a range or list
/// ("1-5", "1,2,3", "23/24").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    #[serde(default)]
    pub street: String,
    #[serde(default)]
    pub number: String,
    #[serde(default)]
    pub postal: String,
    #[serde(default)]
    pub city: Option<String>,
}

impl Address {
    /// Names of the required components that are missing or blank.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.street.trim().is_empty() {
            missing.push("Straße");
        }
        if self.number.trim().is_empty() {
            missing.push("Hausnummer");
        }
        if self.postal.trim().is_empty() {
            missing.push("PLZ");
        }
        missing
    }
}

/// Canonical address produced by the geocode queue. Two normalized
/// addresses denote the same building iff `formatted` is byte-equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedAddress {
    pub formatted: String,
    pub street: String,
    pub house_number: String,
    pub postal: String,
    pub city: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    /// False when the geocoder was unavailable and the formatted string is
    /// a plain concatenation of the caller input.
    pub validated: bool,
}

impl NormalizedAddress {
    /// Fallback used when no geocoder result is available. Upstream
    /// comparisons still work on the concatenated form.
    pub fn unvalidated(street: &str, number: &str, postal: &str, city: &str) -> Self {
        Self {
            formatted: format!("{} {}, {} {}", street.trim(), number.trim(), postal.trim(), city.trim())
                .trim()
                .trim_end_matches(',')
                .to_string(),
            street: street.trim().to_string(),
            house_number: number.trim().to_string(),
            postal: postal.trim().to_string(),
            city: city.trim().to_string(),
            lat: None,
            lon: None,
            validated: false,
        }
    }
}
