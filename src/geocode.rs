//! Serial, rate-limited address normalization.
//!
//! All geocoding funnels through one queue: a single in-flight request,
//! at least 1000 ms between provider calls (provider limit). Callers that
//! give up still hold their slot; the turn executes and its result is
//! dropped with the reply channel.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::models::address::{Address, NormalizedAddress};
use crate::streets;

const MIN_SPACING: Duration = Duration::from_millis(1000);

#[derive(Debug, thiserror::Error)]
pub enum GeocodeError {
    #[error("geocode provider rate limit")]
    RateLimited,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One provider result, already decomposed.
#[derive(Debug, Clone)]
pub struct GeocodeHit {
    pub road: Option<String>,
    pub house_number: Option<String>,
    pub postal: Option<String>,
    pub city: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub country_code: String,
    /// Provider classification, e.g. "building", "residential", "road".
    pub result_type: String,
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, query: &str) -> Result<Option<GeocodeHit>, GeocodeError>;
    async fn reverse_geocode(&self, lat: f64, lon: f64)
    -> Result<Option<GeocodeHit>, GeocodeError>;
}

/// Nominatim-compatible provider (hosted, keyed).
pub struct PrimaryGeocoder {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct ProviderRow {
    lat: String,
    lon: String,
    #[serde(default, rename = "type")]
    result_type: String,
    #[serde(default)]
    address: ProviderAddress,
}

#[derive(Deserialize, Default)]
struct ProviderAddress {
    road: Option<String>,
    house_number: Option<String>,
    postcode: Option<String>,
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    country_code: Option<String>,
}

impl PrimaryGeocoder {
    pub fn new(base_url: &str, api_key: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn hit_from_row(row: ProviderRow) -> Option<GeocodeHit> {
        let lat = row.lat.parse().ok()?;
        let lon = row.lon.parse().ok()?;
        let city = row
            .address
            .city
            .or(row.address.town)
            .or(row.address.village);
        Some(GeocodeHit {
            road: row.address.road,
            house_number: row.address.house_number,
            postal: row.address.postcode,
            city,
            lat,
            lon,
            country_code: row.address.country_code.unwrap_or_default(),
            result_type: row.result_type,
        })
    }

    async fn search(
        &self,
        params: &[(&str, &str)],
        path: &str,
    ) -> Result<Option<GeocodeHit>, GeocodeError> {
        let resp = self
            .http
            .get(format!("{}/{}", self.base_url, path))
            .query(&[("key", self.api_key.as_str()), ("format", "json"), ("addressdetails", "1")])
            .query(params)
            .send()
            .await
            .map_err(anyhow::Error::from)?;
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GeocodeError::RateLimited);
        }
        if !resp.status().is_success() {
            return Err(GeocodeError::Other(anyhow::anyhow!(
                "geocoder returned {}",
                resp.status()
            )));
        }
        let rows: Vec<ProviderRow> = resp.json().await.map_err(anyhow::Error::from)?;
        Ok(rows.into_iter().next().and_then(Self::hit_from_row))
    }
}

#[async_trait]
impl Geocoder for PrimaryGeocoder {
    async fn geocode(&self, query: &str) -> Result<Option<GeocodeHit>, GeocodeError> {
        self.search(&[("q", query), ("limit", "1")], "search").await
    }

    async fn reverse_geocode(
        &self,
        lat: f64,
        lon: f64,
    ) -> Result<Option<GeocodeHit>, GeocodeError> {
        let lat = lat.to_string();
        let lon = lon.to_string();
        self.search(&[("lat", lat.as_str()), ("lon", lon.as_str())], "reverse")
            .await
    }
}

/// Stand-in when no geocoder key is configured: every request takes the
/// concatenation fallback, so address identity still works locally.
pub struct DisabledGeocoder;

#[async_trait]
impl Geocoder for DisabledGeocoder {
    async fn geocode(&self, _query: &str) -> Result<Option<GeocodeHit>, GeocodeError> {
        Ok(None)
    }

    async fn reverse_geocode(
        &self,
        _lat: f64,
        _lon: f64,
    ) -> Result<Option<GeocodeHit>, GeocodeError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queue_length: usize,
    pub processing: bool,
    pub last_request_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct StatusInner {
    queue_length: usize,
    processing: bool,
    last_request_at: Option<DateTime<Utc>>,
}

struct Job {
    address: Address,
    reply: oneshot::Sender<Result<NormalizedAddress, GeocodeError>>,
}

/// Cloneable handle to the serial geocode worker.
#[derive(Clone)]
pub struct GeocodeQueue {
    tx: mpsc::UnboundedSender<Job>,
    status: Arc<Mutex<StatusInner>>,
}

impl GeocodeQueue {
    pub fn spawn(geocoder: Arc<dyn Geocoder>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let status = Arc::new(Mutex::new(StatusInner::default()));
        tokio::spawn(worker(rx, geocoder, status.clone()));
        Self { tx, status }
    }

    /// Queue the address for normalization and await its turn. The result
    /// is always usable; `validated=false` marks the concatenation
    /// fallback.
    pub async fn normalize(
        &self,
        address: &Address,
    ) -> Result<NormalizedAddress, GeocodeError> {
        let (reply, rx) = oneshot::channel();
        {
            let mut s = self.status.lock().unwrap();
            s.queue_length += 1;
        }
        let sent = self.tx.send(Job {
            address: address.clone(),
            reply,
        });
        if sent.is_err() {
            self.status.lock().unwrap().queue_length -= 1;
            return Err(GeocodeError::Other(anyhow::anyhow!(
                "geocode worker is gone"
            )));
        }
        rx.await
            .map_err(|_| GeocodeError::Other(anyhow::anyhow!("geocode worker dropped job")))?
    }

    pub fn status(&self) -> QueueStatus {
        let s = self.status.lock().unwrap();
        QueueStatus {
            queue_length: s.queue_length,
            processing: s.processing,
            last_request_at: s.last_request_at,
        }
    }
}

async fn worker(
    mut rx: mpsc::UnboundedReceiver<Job>,
    geocoder: Arc<dyn Geocoder>,
    status: Arc<Mutex<StatusInner>>,
) {
    let mut last_call: Option<Instant> = None;

    while let Some(job) = rx.recv().await {
        {
            let mut s = status.lock().unwrap();
            s.queue_length = s.queue_length.saturating_sub(1);
            s.processing = true;
        }

        let result = execute(geocoder.as_ref(), &job.address, &mut last_call, &status).await;

        status.lock().unwrap().processing = false;
        // Caller may have timed out; its result is discarded with the channel.
        let _ = job.reply.send(result);
    }
}

async fn pace(last_call: &mut Option<Instant>, status: &Arc<Mutex<StatusInner>>) {
    if let Some(prev) = *last_call {
        let elapsed = prev.elapsed();
        if elapsed < MIN_SPACING {
            tokio::time::sleep(MIN_SPACING - elapsed).await;
        }
    }
    *last_call = Some(Instant::now());
    status.lock().unwrap().last_request_at = Some(Utc::now());
}

/// Two-phase lookup: full address first, then street-only with the
/// caller-supplied number. Non-German hits are rejected.
async fn execute(
    geocoder: &dyn Geocoder,
    address: &Address,
    last_call: &mut Option<Instant>,
    status: &Arc<Mutex<StatusInner>>,
) -> Result<NormalizedAddress, GeocodeError> {
    let street = address.street.trim();
    let number = address.number.trim();
    let postal = address.postal.trim();
    let city = address.city.as_deref().unwrap_or("").trim();

    let full = format!("{street} {number}, {postal} {city}, Deutschland");
    pace(last_call, status).await;
    match geocoder.geocode(&full).await {
        Ok(Some(hit)) if accepts_full(&hit, street) => {
            return Ok(normalized_from_hit(&hit, street, number, postal, city, true));
        }
        Ok(_) => {}
        Err(GeocodeError::RateLimited) => return Err(GeocodeError::RateLimited),
        Err(e) => {
            tracing::warn!("geocoder failed for {full}: {e}");
            return Ok(NormalizedAddress::unvalidated(street, number, postal, city));
        }
    }

    // Street-level retry without the number.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let street_query = format!("{street}, {postal} {city}, Deutschland");
    pace(last_call, status).await;
    match geocoder.geocode(&street_query).await {
        Ok(Some(hit)) if hit.country_code.eq_ignore_ascii_case("de") && hit.road.is_some() => {
            Ok(normalized_from_hit(&hit, street, number, postal, city, true))
        }
        Err(GeocodeError::RateLimited) => Err(GeocodeError::RateLimited),
        Ok(_) | Err(_) => Ok(NormalizedAddress::unvalidated(street, number, postal, city)),
    }
}

fn accepts_full(hit: &GeocodeHit, requested_street: &str) -> bool {
    if !hit.country_code.eq_ignore_ascii_case("de") {
        return false;
    }
    if !matches!(hit.result_type.as_str(), "building" | "residential" | "house") {
        return false;
    }
    match &hit.road {
        Some(road) => streets::streets_match(road, requested_street),
        None => false,
    }
}

/// The canonical formatted string is composed, not taken from the
/// provider, so identical buildings always compare byte-equal.
fn normalized_from_hit(
    hit: &GeocodeHit,
    street: &str,
    number: &str,
    postal: &str,
    city: &str,
    validated: bool,
) -> NormalizedAddress {
    let road = hit.road.as_deref().unwrap_or(street);
    let number = hit.house_number.as_deref().filter(|n| !n.is_empty()).unwrap_or(number);
    let postal = hit.postal.as_deref().filter(|p| !p.is_empty()).unwrap_or(postal);
    let city = hit.city.as_deref().filter(|c| !c.is_empty()).unwrap_or(city);
    NormalizedAddress {
        formatted: format!("{road} {number}, {postal} {city}"),
        street: road.to_string(),
        house_number: number.to_string(),
        postal: postal.to_string(),
        city: city.to_string(),
        lat: Some(hit.lat),
        lon: Some(hit.lon),
        validated,
    }
}
