//! Background pull from the FollowMee tracking provider.
//!
//! Every five minutes the scheduler fetches the last hour for all mapped
//! devices. Points are deduplicated for the process lifetime on
//! `deviceId|dateYMD|lat|lon` and fed through the normal ingest with
//! `source=followmee`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Europe::Berlin;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::day_store::berlin_date_of_ms;
use crate::models::log::{LocationPoint, LocationSource};
use crate::tracking::TrackingIngest;
use crate::users::UserDirectory;

#[async_trait]
pub trait TrackerProvider: Send + Sync {
    async fn recent_points(
        &self,
        device_id: &str,
        lookback_minutes: i64,
    ) -> anyhow::Result<Vec<LocationPoint>>;
}

pub struct FollowMeeClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    username: String,
}

#[derive(Deserialize)]
struct TrackResponse {
    #[serde(rename = "Data", default)]
    data: Vec<TrackRow>,
}

#[derive(Deserialize)]
struct TrackRow {
    #[serde(rename = "Date")]
    date: String,
    #[serde(rename = "Latitude")]
    latitude: f64,
    #[serde(rename = "Longitude")]
    longitude: f64,
    #[serde(rename = "Accuracy", default)]
    accuracy: Option<f64>,
    #[serde(rename = "Altitude(m)", default)]
    altitude: Option<f64>,
    #[serde(rename = "Direction", default)]
    heading: Option<f64>,
    #[serde(rename = "Speed(km/h)", default)]
    speed: Option<f64>,
}

impl FollowMeeClient {
    pub fn new(base_url: &str, api_key: &str, username: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            username: username.to_string(),
        })
    }

    /// Provider timestamps come either with an offset or as naive Berlin
    /// local time.
    fn parse_timestamp(raw: &str) -> Option<i64> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc).timestamp_millis());
        }
        let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
            .ok()?;
        match Berlin.from_local_datetime(&naive) {
            chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
                Some(dt.with_timezone(&Utc).timestamp_millis())
            }
            chrono::LocalResult::None => None,
        }
    }
}

#[async_trait]
impl TrackerProvider for FollowMeeClient {
    async fn recent_points(
        &self,
        device_id: &str,
        lookback_minutes: i64,
    ) -> anyhow::Result<Vec<LocationPoint>> {
        let hours = (lookback_minutes as f64 / 60.0).ceil().max(1.0) as i64;
        let resp = self
            .http
            .get(format!("{}/tracks.aspx", self.base_url))
            .query(&[
                ("key", self.api_key.as_str()),
                ("username", self.username.as_str()),
                ("output", "json"),
                ("function", "historyfordevice"),
                ("deviceid", device_id),
            ])
            .query(&[("history", hours)])
            .send()
            .await?
            .error_for_status()?;
        let body: TrackResponse = resp.json().await?;
        let cutoff_ms = (Utc::now() - chrono::Duration::minutes(lookback_minutes))
            .timestamp_millis();
        Ok(body
            .data
            .into_iter()
            .filter_map(|row| {
                let timestamp_ms = Self::parse_timestamp(&row.date)?;
                if timestamp_ms < cutoff_ms {
                    return None;
                }
                Some(LocationPoint {
                    timestamp_ms,
                    lat: row.latitude,
                    lon: row.longitude,
                    accuracy: row.accuracy,
                    altitude: row.altitude,
                    heading: row.heading,
                    speed: row.speed,
                    source: LocationSource::Followmee,
                })
            })
            .collect())
    }
}

fn dedup_key(device_id: &str, point: &LocationPoint) -> String {
    let ymd = berlin_date_of_ms(point.timestamp_ms).format("%Y%m%d");
    format!("{device_id}|{ymd}|{}|{}", point.lat, point.lon)
}

/// One pull over all mapped devices. `seen` carries the process-lifetime
/// dedup set. Returns the number of newly ingested points.
pub async fn pull_once(
    provider: &dyn TrackerProvider,
    users: &UserDirectory,
    ingest: &TrackingIngest,
    seen: &mut HashSet<String>,
    lookback_minutes: i64,
) -> usize {
    let mapped = match users.device_mappings().await {
        Ok(mapped) => mapped,
        Err(e) => {
            tracing::warn!("tracker pull: user directory unavailable: {e}");
            return 0;
        }
    };
    let mut ingested = 0usize;
    for user in mapped {
        let device_id = user.device_id.as_deref().unwrap_or_default();
        let points = match provider.recent_points(device_id, lookback_minutes).await {
            Ok(points) => points,
            Err(e) => {
                tracing::warn!("tracker pull failed for device {device_id}: {e}");
                continue;
            }
        };
        for mut point in points {
            if !seen.insert(dedup_key(device_id, &point)) {
                continue;
            }
            point.source = LocationSource::Followmee;
            if ingest.record_location(&user.user_id, &user.username, &point) {
                ingested += 1;
            }
        }
    }
    ingested
}

/// Five-minute pull scheduler with a one-hour lookback.
pub fn spawn_pull_scheduler(
    provider: Arc<dyn TrackerProvider>,
    users: Arc<UserDirectory>,
    ingest: Arc<TrackingIngest>,
    interval_secs: u64,
    lookback_minutes: i64,
) {
    tokio::spawn(async move {
        let mut seen: HashSet<String> = HashSet::new();
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            let ingested =
                pull_once(provider.as_ref(), &users, &ingest, &mut seen, lookback_minutes).await;
            if ingested > 0 {
                tracing::debug!("tracker pull ingested {ingested} new points");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_writer::BatchWriter;
    use crate::config::SmtpConfig;
    use crate::day_store::{DayStore, berlin_today};
    use crate::sheet_store::USERS_SHEET;
    use crate::sheet_store::memory::MemorySheets;
    use std::sync::Mutex;

    struct ScriptedProvider {
        batches: Mutex<Vec<Vec<LocationPoint>>>,
    }

    #[async_trait]
    impl TrackerProvider for ScriptedProvider {
        async fn recent_points(
            &self,
            _device_id: &str,
            _lookback_minutes: i64,
        ) -> anyhow::Result<Vec<LocationPoint>> {
            let mut batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(batches.remove(0))
            }
        }
    }

    fn point(ts: i64, lat: f64, lon: f64) -> LocationPoint {
        LocationPoint {
            timestamp_ms: ts,
            lat,
            lon,
            accuracy: None,
            altitude: None,
            heading: None,
            speed: None,
            source: LocationSource::Followmee,
        }
    }

    #[tokio::test]
    async fn repeated_pulls_skip_seen_points() {
        let store = Arc::new(MemorySheets::new().with_sheet(
            USERS_SHEET,
            vec![vec![
                "u1".to_string(),
                "damian".to_string(),
                "Damian Kudla".to_string(),
                "dev-17".to_string(),
            ]],
        ));
        let dir = tempfile::tempdir().unwrap();
        let day_store = Arc::new(DayStore::open(dir.path().to_str().unwrap()).unwrap());
        let writer = Arc::new(BatchWriter::new(
            store.clone(),
            240_000,
            dir.path().join("failed.ndjson"),
            &SmtpConfig::default(),
        ));
        let users = Arc::new(UserDirectory::new(store.clone()));
        let ingest = Arc::new(TrackingIngest::new(
            day_store.clone(),
            writer,
            users.clone(),
            store,
        ));

        let now_ms = Utc::now().timestamp_millis();
        let provider = ScriptedProvider {
            batches: Mutex::new(vec![
                vec![point(now_ms, 50.9, 6.9), point(now_ms + 1000, 50.91, 6.91)],
                // second pull returns an overlap plus one new fix
                vec![point(now_ms, 50.9, 6.9), point(now_ms + 2000, 50.92, 6.92)],
            ]),
        };

        let mut seen = HashSet::new();
        assert_eq!(pull_once(&provider, &users, &ingest, &mut seen, 60).await, 2);
        assert_eq!(pull_once(&provider, &users, &ingest, &mut seen, 60).await, 1);

        let rows = day_store.get_by_user(berlin_today(), "u1").unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn timestamps_parse_with_and_without_offset() {
        assert!(FollowMeeClient::parse_timestamp("2024-03-07T11:30:00+01:00").is_some());
        assert!(FollowMeeClient::parse_timestamp("2024-03-07T11:30:00").is_some());
        assert!(FollowMeeClient::parse_timestamp("kaputt").is_none());
    }
}
