//! Live tracking ingest and the in-memory daily aggregates.
//!
//! Every event is written to the per-day store (authoritative) and
//! buffered for batched export to the backing store; the aggregate is a
//! best-effort live view. External-app pushes from unknown senders are
//! parked in per-name worksheets until the reconciler can claim them.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::batch_writer::BatchWriter;
use crate::day_store::{DayStore, berlin_date_of_ms};
use crate::models::log::{LocationPoint, LocationSource, LogEntry, LogType};
use crate::sheet_store::{StoreError, TabularStore, UNASSIGNED_PREFIX};
use crate::users::UserDirectory;

/// Header of the per-name worksheets holding unassigned tracker rows.
pub const UNASSIGNED_HEADER: [&str; 7] = [
    "timestampMs",
    "lat",
    "lon",
    "accuracy",
    "altitude",
    "heading",
    "speed",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEvent {
    pub timestamp_ms: i64,
    pub action: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
    /// "device" routes the event into the device-status log.
    #[serde(default, rename = "type")]
    pub kind: Option<LogType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalPushRequest {
    pub user_name: String,
    pub points: Vec<LocationPoint>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalPushSummary {
    pub accepted: usize,
    pub dropped: usize,
    pub unknown_user: bool,
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyAggregate {
    pub gps_points: u64,
    pub distance_m: f64,
    pub actions: HashMap<String, u32>,
    pub unique_addresses: HashSet<String>,
    #[serde(skip)]
    last_fix: Option<(f64, f64)>,
}

pub struct TrackingIngest {
    day_store: Arc<DayStore>,
    writer: Arc<BatchWriter>,
    users: Arc<UserDirectory>,
    store: Arc<dyn TabularStore>,
    daily: Mutex<HashMap<(NaiveDate, String), DailyAggregate>>,
    unknown: Mutex<HashMap<String, Vec<LocationPoint>>>,
}

impl TrackingIngest {
    pub fn new(
        day_store: Arc<DayStore>,
        writer: Arc<BatchWriter>,
        users: Arc<UserDirectory>,
        store: Arc<dyn TabularStore>,
    ) -> Self {
        Self {
            day_store,
            writer,
            users,
            store,
            daily: Mutex::new(HashMap::new()),
            unknown: Mutex::new(HashMap::new()),
        }
    }

    /// Ingest one GPS fix. Implausible fixes (GPS-not-ready sentinels)
    /// are silently dropped. Returns whether a new row was stored.
    pub fn record_location(
        &self,
        user_id: &str,
        username: &str,
        point: &LocationPoint,
    ) -> bool {
        if !point.is_plausible() {
            tracing::debug!("dropping implausible fix from {username}");
            return false;
        }
        let date = berlin_date_of_ms(point.timestamp_ms);
        let data = match serde_json::to_value(point) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("unserializable location point from {username}: {e}");
                return false;
            }
        };
        let entry = LogEntry {
            user_id: user_id.to_string(),
            username: username.to_string(),
            timestamp_ms: point.timestamp_ms,
            log_type: LogType::Gps,
            data: data.clone(),
        };
        let inserted = match self.day_store.insert(date, &entry) {
            Ok(inserted) => inserted,
            Err(e) => {
                // day store is authoritative; losing this write is worth a warning
                tracing::warn!("day store write failed for {username}: {e}");
                false
            }
        };
        if inserted {
            self.writer.enqueue_user(
                username,
                vec![
                    user_id.to_string(),
                    point.timestamp_ms.to_string(),
                    LogType::Gps.as_str().to_string(),
                    data.to_string(),
                ],
            );
            let mut daily = self.daily.lock().unwrap();
            let agg = daily.entry((date, user_id.to_string())).or_default();
            agg.gps_points += 1;
            if let Some((lat, lon)) = agg.last_fix {
                agg.distance_m += haversine_m(lat, lon, point.lat, point.lon);
            }
            agg.last_fix = Some((point.lat, point.lon));
        }
        inserted
    }

    /// Ingest an action or device-status event.
    pub fn record_action(&self, user_id: &str, username: &str, event: &ActionEvent) -> bool {
        let log_type = match event.kind {
            Some(LogType::Device) => LogType::Device,
            Some(LogType::Session) => LogType::Session,
            _ => LogType::Action,
        };
        let date = berlin_date_of_ms(event.timestamp_ms);
        let data = serde_json::json!({
            "action": event.action,
            "address": event.address,
            "details": event.details,
        });
        let entry = LogEntry {
            user_id: user_id.to_string(),
            username: username.to_string(),
            timestamp_ms: event.timestamp_ms,
            log_type,
            data: data.clone(),
        };
        let inserted = match self.day_store.insert(date, &entry) {
            Ok(inserted) => inserted,
            Err(e) => {
                tracing::warn!("day store write failed for {username}: {e}");
                false
            }
        };
        if inserted {
            self.writer.enqueue_user(
                username,
                vec![
                    user_id.to_string(),
                    event.timestamp_ms.to_string(),
                    log_type.as_str().to_string(),
                    data.to_string(),
                ],
            );
            if log_type == LogType::Action {
                let mut daily = self.daily.lock().unwrap();
                let agg = daily.entry((date, user_id.to_string())).or_default();
                *agg.actions.entry(event.action.clone()).or_default() += 1;
                if let Some(address) = &event.address {
                    agg.unique_addresses.insert(address.clone());
                }
            }
        }
        inserted
    }

    /// Bulk push from the external tracking app. Known senders flow into
    /// the normal ingest with `source=external_app`; unknown senders are
    /// buffered and parked in a per-name worksheet.
    pub async fn external_push(&self, req: ExternalPushRequest) -> ExternalPushSummary {
        let total = req.points.len();
        let plausible: Vec<LocationPoint> = req
            .points
            .into_iter()
            .filter(LocationPoint::is_plausible)
            .collect();
        let dropped = total - plausible.len();

        let resolved = match self.users.resolve_name(&req.user_name).await {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!("user directory unavailable, buffering push: {e}");
                None
            }
        };

        match resolved {
            Some(user) => {
                let mut accepted = 0;
                for mut point in plausible {
                    point.source = LocationSource::ExternalApp;
                    if self.record_location(&user.user_id, &user.username, &point) {
                        accepted += 1;
                    }
                }
                ExternalPushSummary {
                    accepted,
                    dropped,
                    unknown_user: false,
                }
            }
            None => {
                let accepted = plausible.len();
                self.unknown
                    .lock()
                    .unwrap()
                    .entry(req.user_name.trim().to_string())
                    .or_default()
                    .extend(plausible);
                ExternalPushSummary {
                    accepted,
                    dropped,
                    unknown_user: true,
                }
            }
        }
    }

    /// Drain the unknown-sender buffer into per-name worksheets.
    /// Called every minute; failed names stay buffered.
    pub async fn flush_unknown(&self) {
        let pending: Vec<(String, Vec<LocationPoint>)> = {
            let mut unknown = self.unknown.lock().unwrap();
            unknown.drain().collect()
        };
        for (name, points) in pending {
            let worksheet = format!("{UNASSIGNED_PREFIX}{name}");
            if let Err(e) = self.park_points(&worksheet, &points).await {
                tracing::warn!("parking {} points for '{name}' failed: {e}", points.len());
                self.unknown
                    .lock()
                    .unwrap()
                    .entry(name)
                    .or_default()
                    .extend(points);
            }
        }
    }

    async fn park_points(
        &self,
        worksheet: &str,
        points: &[LocationPoint],
    ) -> Result<(), StoreError> {
        let known = self.store.list_worksheets().await?;
        if !known.iter().any(|w| w == worksheet) {
            self.store
                .add_worksheet(
                    worksheet,
                    UNASSIGNED_HEADER.iter().map(|s| s.to_string()).collect(),
                )
                .await?;
        }
        let rows: Vec<Vec<String>> = points.iter().map(point_to_row).collect();
        self.store.batch_append(worksheet, rows).await
    }

    /// Live aggregate snapshot for one user and day.
    pub fn stats_for(&self, user_id: &str, date: NaiveDate) -> Option<DailyAggregate> {
        self.daily
            .lock()
            .unwrap()
            .get(&(date, user_id.to_string()))
            .cloned()
    }
}

fn point_to_row(point: &LocationPoint) -> Vec<String> {
    let opt = |v: Option<f64>| v.map(|x| x.to_string()).unwrap_or_default();
    vec![
        point.timestamp_ms.to_string(),
        point.lat.to_string(),
        point.lon.to_string(),
        opt(point.accuracy),
        opt(point.altitude),
        opt(point.heading),
        opt(point.speed),
    ]
}

/// Great-circle distance in meters.
fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Minute-cadence flusher for the unknown-sender buffer.
pub fn spawn_unknown_flusher(ingest: Arc<TrackingIngest>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            ingest.flush_unknown().await;
        }
    });
}
