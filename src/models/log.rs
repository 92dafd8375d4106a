use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    Gps,
    Session,
    Action,
    Device,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gps => "gps",
            Self::Session => "session",
            Self::Action => "action",
            Self::Device => "device",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gps" => Some(Self::Gps),
            "session" => Some(Self::Session),
            "action" => Some(Self::Action),
            "device" => Some(Self::Device),
            _ => None,
        }
    }
}

/// One row of a per-day store. `timestamp_ms` is the event time (GPS fix
/// time / action time), never the ingest time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub user_id: String,
    pub username: String,
    pub timestamp_ms: i64,
    pub log_type: LogType,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationSource {
    Native,
    ExternalApp,
    Followmee,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationPoint {
    pub timestamp_ms: i64,
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default = "default_source")]
    pub source: LocationSource,
}

fn default_source() -> LocationSource {
    LocationSource::Native
}

impl LocationPoint {
    /// GPS-not-ready sentinels sent by mobile devices before the first fix.
    pub fn is_plausible(&self) -> bool {
        self.lat != 0.0 && self.lon.abs() >= 0.001
    }
}
