//! Claims unassigned tracker worksheets once their name resolves to a
//! known user. Runs at startup and at every Berlin midnight.

use chrono::{TimeZone, Utc};
use chrono_tz::Europe::Berlin;
use std::sync::Arc;
use std::time::Duration;

use crate::batch_writer::BatchWriter;
use crate::day_store::{DayStore, berlin_date_of_ms, berlin_today};
use crate::models::log::{LocationPoint, LocationSource, LogEntry, LogType};
use crate::sheet_store::{TabularStore, UNASSIGNED_PREFIX};
use crate::users::UserDirectory;

/// Sweep all unassigned worksheets. Historical days go straight into the
/// per-day stores, today's rows into the batched writer; the worksheet
/// is deleted once claimed. Returns the number of claimed worksheets.
pub async fn reconcile_unassigned(
    store: &dyn TabularStore,
    users: &UserDirectory,
    day_store: &DayStore,
    writer: &BatchWriter,
) -> anyhow::Result<usize> {
    // pause the flusher so its 1-row/s pacing budget is ours
    writer.set_suspended(true);
    let result = sweep(store, users, day_store, writer).await;
    writer.set_suspended(false);
    result
}

async fn sweep(
    store: &dyn TabularStore,
    users: &UserDirectory,
    day_store: &DayStore,
    writer: &BatchWriter,
) -> anyhow::Result<usize> {
    let worksheets = store.list_worksheets().await.map_err(anyhow::Error::from)?;
    let mut claimed = 0usize;

    for worksheet in worksheets {
        let Some(name) = worksheet.strip_prefix(UNASSIGNED_PREFIX) else {
            continue;
        };
        let user = match users.resolve_name(name).await? {
            Some(user) => user,
            None => continue, // still unknown, try again tomorrow
        };

        let rows = store.read_all(&worksheet).await.map_err(anyhow::Error::from)?;
        let today = berlin_today();
        let mut historical: std::collections::HashMap<chrono::NaiveDate, Vec<LogEntry>> =
            std::collections::HashMap::new();

        for row in &rows {
            let Some(point) = row_to_point(row) else {
                continue;
            };
            let date = berlin_date_of_ms(point.timestamp_ms);
            let data = match serde_json::to_value(&point) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if date == today {
                writer.enqueue_user(
                    &user.username,
                    vec![
                        user.user_id.clone(),
                        point.timestamp_ms.to_string(),
                        LogType::Gps.as_str().to_string(),
                        data.to_string(),
                    ],
                );
            } else {
                historical.entry(date).or_default().push(LogEntry {
                    user_id: user.user_id.clone(),
                    username: user.username.clone(),
                    timestamp_ms: point.timestamp_ms,
                    log_type: LogType::Gps,
                    data,
                });
            }
        }

        for (date, entries) in historical {
            match day_store.insert_batch(date, &entries) {
                Ok(n) => tracing::debug!("reconciler: {n} rows for {} on {date}", user.username),
                Err(e) => {
                    // leave the worksheet in place so no data is lost
                    tracing::error!("reconciler: day store write failed for {date}: {e}");
                    return Ok(claimed);
                }
            }
        }

        store
            .delete_worksheet(&worksheet)
            .await
            .map_err(anyhow::Error::from)?;
        claimed += 1;
        tracing::info!("reconciler: claimed '{worksheet}' for {}", user.username);
    }

    Ok(claimed)
}

/// Rows written by mobile exports sometimes carry comma decimals.
fn parse_decimal(raw: &str) -> Option<f64> {
    raw.trim().replace(',', ".").parse().ok()
}

fn row_to_point(row: &[String]) -> Option<LocationPoint> {
    let get = |i: usize| row.get(i).map(String::as_str).unwrap_or("");
    if get(0) == "timestampMs" {
        return None; // header
    }
    let timestamp_ms: i64 = get(0).trim().parse().ok()?;
    let point = LocationPoint {
        timestamp_ms,
        lat: parse_decimal(get(1))?,
        lon: parse_decimal(get(2))?,
        accuracy: parse_decimal(get(3)),
        altitude: parse_decimal(get(4)),
        heading: parse_decimal(get(5)),
        speed: parse_decimal(get(6)),
        source: LocationSource::ExternalApp,
    };
    point.is_plausible().then_some(point)
}

/// Startup run plus one run at every Berlin midnight.
pub fn spawn_reconciler(
    store: Arc<dyn TabularStore>,
    users: Arc<UserDirectory>,
    day_store: Arc<DayStore>,
    writer: Arc<BatchWriter>,
) {
    tokio::spawn(async move {
        if let Err(e) = reconcile_unassigned(store.as_ref(), &users, &day_store, &writer).await {
            tracing::error!("startup reconciliation failed: {e}");
        }
        loop {
            tokio::time::sleep(until_berlin_midnight()).await;
            if let Err(e) =
                reconcile_unassigned(store.as_ref(), &users, &day_store, &writer).await
            {
                tracing::error!("midnight reconciliation failed: {e}");
            }
        }
    });
}

fn until_berlin_midnight() -> Duration {
    let now = Utc::now().with_timezone(&Berlin);
    let next_day = now.date_naive() + chrono::Duration::days(1);
    let midnight = Berlin
        .from_local_datetime(&next_day.and_hms_opt(0, 0, 0).unwrap_or_default())
        .earliest()
        .unwrap_or_else(|| now + chrono::Duration::days(1));
    (midnight - now)
        .to_std()
        .unwrap_or(Duration::from_secs(3600))
}
