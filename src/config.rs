use serde::Deserialize;
use std::path::Path;

/// Top-level config loaded from `canvass.toml`.
///
/// Secrets (backing-store credentials, API keys, SMTP) are env-only and
/// never live in the file; see [`Secrets::from_env`].
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CanvassConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub datasets: DatasetConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: default_port() }
    }
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory for local per-day log databases. The `user-logs`
    /// subdirectory is created under it.
    #[serde(default = "default_data_root")]
    pub data_root: String,
    /// Per-day databases older than this many days are deleted locally.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_data_root() -> String {
    "./data".to_string()
}

fn default_retention_days() -> u32 {
    7
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    /// Days during which the creator may still edit a dataset.
    #[serde(default = "default_edit_window_days")]
    pub edit_window_days: i64,
    /// Dirty-cache flush interval towards the backing store.
    #[serde(default = "default_dataset_flush_ms")]
    pub flush_interval_ms: u64,
    /// Creation locks older than this are presumed abandoned.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            edit_window_days: default_edit_window_days(),
            flush_interval_ms: default_dataset_flush_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

fn default_edit_window_days() -> i64 {
    30
}

fn default_dataset_flush_ms() -> u64 {
    60_000
}

fn default_lock_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    #[serde(default = "default_writer_flush_ms")]
    pub flush_interval_ms: u64,
    /// Backoff cap when the backing store rejects writes for quota.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Entries that failed with a non-quota error land here.
    #[serde(default = "default_fallback_file")]
    pub fallback_file: String,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_writer_flush_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            fallback_file: default_fallback_file(),
        }
    }
}

fn default_writer_flush_ms() -> u64 {
    30_000
}

fn default_max_backoff_ms() -> u64 {
    240_000
}

fn default_fallback_file() -> String {
    "./data/failed-writes.ndjson".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// FollowMee pull cadence.
    #[serde(default = "default_pull_interval_secs")]
    pub pull_interval_secs: u64,
    /// How far back each pull looks.
    #[serde(default = "default_lookback_mins")]
    pub lookback_minutes: i64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            pull_interval_secs: default_pull_interval_secs(),
            lookback_minutes: default_lookback_mins(),
        }
    }
}

fn default_pull_interval_secs() -> u64 {
    300
}

fn default_lookback_mins() -> i64 {
    60
}

impl CanvassConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            tracing::info!("no config file at {path}, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let cfg = toml::from_str(&raw)?;
        Ok(cfg)
    }
}

/// Env-sourced secrets, read once at startup.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    /// Bearer token for the tabular backing store API.
    pub backing_store_token: Option<String>,
    /// Spreadsheet/document id holding all worksheets.
    pub backing_store_document: Option<String>,
    pub backing_store_url: Option<String>,
    pub geocode_api_key: Option<String>,
    pub geocode_url: Option<String>,
    pub tracker_api_key: Option<String>,
    pub tracker_username: Option<String>,
    /// Shared key the external tracking app sends on bulk pushes.
    pub external_push_key: Option<String>,
    pub smtp: SmtpConfig,
}

#[derive(Debug, Clone, Default)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub from: String,
    pub alert_to: Option<String>,
}


impl Secrets {
    pub fn from_env() -> Self {
        Self {
            backing_store_token: std::env::var("CANVASS_SHEETS_TOKEN").ok(),
            backing_store_document: std::env::var("CANVASS_SHEETS_DOCUMENT").ok(),
            backing_store_url: std::env::var("CANVASS_SHEETS_URL").ok(),
            geocode_api_key: std::env::var("CANVASS_GEOCODE_KEY").ok(),
            geocode_url: std::env::var("CANVASS_GEOCODE_URL").ok(),
            tracker_api_key: std::env::var("CANVASS_FOLLOWMEE_KEY").ok(),
            tracker_username: std::env::var("CANVASS_FOLLOWMEE_USER").ok(),
            external_push_key: std::env::var("CANVASS_EXTERNAL_PUSH_KEY").ok(),
            smtp: SmtpConfig {
                host: std::env::var("CANVASS_SMTP_HOST").ok(),
                port: std::env::var("CANVASS_SMTP_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(587),
                user: std::env::var("CANVASS_SMTP_USER").ok(),
                pass: std::env::var("CANVASS_SMTP_PASS").ok(),
                from: std::env::var("CANVASS_SMTP_FROM")
                    .unwrap_or_else(|_| "canvass@localhost".to_string()),
                alert_to: std::env::var("CANVASS_ALERT_TO").ok(),
            },
        }
    }
}
