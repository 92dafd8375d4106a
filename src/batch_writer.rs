//! Back-pressured batch writer for the tabular backing store.
//!
//! One queue per user worksheet plus the auth and category-change
//! queues. Flushes run sequentially with a second of spacing to stay
//! under the provider write quota; quota rejections back off
//! exponentially with the batch left in place, all other failures divert
//! the entries to a local fallback file and raise an operator alert.

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::SmtpConfig;
use crate::sheet_store::{AUTH_SHEET, StoreError, TabularStore};

pub const CATEGORY_CHANGE_SHEET: &str = "category-changes";

const INITIAL_BACKOFF_MS: u64 = 30_000;
const QUEUE_SPACING: Duration = Duration::from_secs(1);

pub fn user_log_sheet(username: &str) -> String {
    format!("log-{username}")
}

#[derive(Default)]
struct BackoffState {
    current_ms: u64,
    next_attempt: Option<Instant>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriterStatus {
    pub queued_rows: usize,
    pub queues: usize,
    pub backoff_ms: u64,
    pub suspended: bool,
}

pub struct BatchWriter {
    store: std::sync::Arc<dyn TabularStore>,
    queues: Mutex<BTreeMap<String, VecDeque<Vec<String>>>>,
    suspended: AtomicBool,
    backoff: Mutex<BackoffState>,
    max_backoff_ms: u64,
    fallback_file: PathBuf,
    mailer: Option<AlertMailer>,
}

struct AlertMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
    to: String,
}

fn build_mailer(cfg: &SmtpConfig) -> Option<AlertMailer> {
    let host = cfg.host.as_deref()?;
    let to = cfg.alert_to.clone()?;
    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(host).ok()?;
    builder = builder.port(cfg.port);
    if let (Some(user), Some(pass)) = (&cfg.user, &cfg.pass) {
        builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
    }
    Some(AlertMailer {
        transport: builder.build(),
        from: cfg.from.clone(),
        to,
    })
}

impl BatchWriter {
    pub fn new(
        store: std::sync::Arc<dyn TabularStore>,
        max_backoff_ms: u64,
        fallback_file: impl Into<PathBuf>,
        smtp: &SmtpConfig,
    ) -> Self {
        Self {
            store,
            queues: Mutex::new(BTreeMap::new()),
            suspended: AtomicBool::new(false),
            backoff: Mutex::new(BackoffState::default()),
            max_backoff_ms,
            fallback_file: fallback_file.into(),
            mailer: build_mailer(smtp),
        }
    }

    pub fn enqueue_user(&self, username: &str, row: Vec<String>) {
        self.enqueue(&user_log_sheet(username), row);
    }

    pub fn enqueue_auth(&self, row: Vec<String>) {
        self.enqueue(AUTH_SHEET, row);
    }

    pub fn enqueue_category_change(&self, row: Vec<String>) {
        self.enqueue(CATEGORY_CHANGE_SHEET, row);
    }

    pub fn enqueue(&self, worksheet: &str, row: Vec<String>) {
        self.queues
            .lock()
            .unwrap()
            .entry(worksheet.to_string())
            .or_default()
            .push_back(row);
    }

    /// Pause flushes while another subsystem (the reconciler) writes.
    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }

    pub fn status(&self) -> WriterStatus {
        let queues = self.queues.lock().unwrap();
        WriterStatus {
            queued_rows: queues.values().map(VecDeque::len).sum(),
            queues: queues.values().filter(|q| !q.is_empty()).count(),
            backoff_ms: self.backoff.lock().unwrap().current_ms,
            suspended: self.suspended.load(Ordering::Acquire),
        }
    }

    pub fn backoff_ms(&self) -> u64 {
        self.backoff.lock().unwrap().current_ms
    }

    pub fn queued_rows(&self) -> usize {
        self.queues.lock().unwrap().values().map(VecDeque::len).sum()
    }

    /// One flush pass over all queues, sequential with spacing.
    pub async fn flush_once(&self) {
        if self.suspended.load(Ordering::Acquire) {
            return;
        }
        {
            let backoff = self.backoff.lock().unwrap();
            if let Some(next) = backoff.next_attempt {
                if Instant::now() < next {
                    return;
                }
            }
        }

        let worksheets: Vec<String> = {
            let queues = self.queues.lock().unwrap();
            queues
                .iter()
                .filter(|(_, q)| !q.is_empty())
                .map(|(k, _)| k.clone())
                .collect()
        };

        let mut first = true;
        for worksheet in worksheets {
            if !first {
                tokio::time::sleep(QUEUE_SPACING).await;
            }
            first = false;

            let batch: Vec<Vec<String>> = {
                let queues = self.queues.lock().unwrap();
                match queues.get(&worksheet) {
                    Some(q) if !q.is_empty() => q.iter().cloned().collect(),
                    _ => continue,
                }
            };
            let batch_len = batch.len();

            match self.store.batch_append(&worksheet, batch).await {
                Ok(()) => {
                    let mut queues = self.queues.lock().unwrap();
                    if let Some(q) = queues.get_mut(&worksheet) {
                        q.drain(..batch_len.min(q.len()));
                    }
                    let mut backoff = self.backoff.lock().unwrap();
                    backoff.current_ms = 0;
                    backoff.next_attempt = None;
                }
                Err(StoreError::QuotaExceeded) => {
                    // batch stays queued; quota is provider-wide, so stop
                    // touching the other queues this round too
                    let mut backoff = self.backoff.lock().unwrap();
                    backoff.current_ms = if backoff.current_ms == 0 {
                        INITIAL_BACKOFF_MS
                    } else {
                        (backoff.current_ms * 2).min(self.max_backoff_ms)
                    };
                    backoff.next_attempt =
                        Some(Instant::now() + Duration::from_millis(backoff.current_ms));
                    tracing::warn!(
                        "backing store quota hit on {worksheet}; backing off {}ms with {batch_len} rows queued",
                        backoff.current_ms
                    );
                    return;
                }
                Err(StoreError::Other(e)) => {
                    tracing::error!("flush of {worksheet} failed hard: {e:#}");
                    let dropped: Vec<Vec<String>> = {
                        let mut queues = self.queues.lock().unwrap();
                        match queues.get_mut(&worksheet) {
                            Some(q) => q.drain(..batch_len.min(q.len())).collect(),
                            None => Vec::new(),
                        }
                    };
                    self.write_fallback(&worksheet, &dropped);
                    self.alert(&format!(
                        "{} Zeilen für '{worksheet}' konnten nicht geschrieben werden: {e}",
                        dropped.len()
                    ));
                }
            }
        }
    }

    fn write_fallback(&self, worksheet: &str, rows: &[Vec<String>]) {
        if let Some(parent) = self.fallback_file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.fallback_file);
        let mut file = match file {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(
                    "cannot open fallback file {}: {e}; {} rows lost",
                    self.fallback_file.display(),
                    rows.len()
                );
                return;
            }
        };
        for row in rows {
            let line = serde_json::json!({
                "worksheet": worksheet,
                "row": row,
                "failedAt": chrono::Utc::now().to_rfc3339(),
            });
            if let Err(e) = writeln!(file, "{line}") {
                tracing::error!("fallback write failed: {e}");
                return;
            }
        }
        tracing::warn!(
            "{} rows for '{worksheet}' diverted to {}",
            rows.len(),
            self.fallback_file.display()
        );
    }

    fn alert(&self, body: &str) {
        let Some(mailer) = &self.mailer else {
            return;
        };
        let email = Message::builder()
            .from(match mailer.from.parse() {
                Ok(m) => m,
                Err(_) => return,
            })
            .to(match mailer.to.parse() {
                Ok(m) => m,
                Err(_) => return,
            })
            .subject("canvass-api: Schreibfehler zum Backing Store")
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string());
        let Ok(email) = email else { return };
        let transport = mailer.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.send(email).await {
                tracing::warn!("operator alert mail failed: {e}");
            }
        });
    }
}

/// 30-second writer flusher.
pub fn spawn_writer_flusher(writer: std::sync::Arc<BatchWriter>, interval_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            interval.tick().await;
            writer.flush_once().await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheet_store::memory::MemorySheets;
    use std::sync::Arc;

    fn writer_with(store: Arc<MemorySheets>) -> (tempfile::TempDir, BatchWriter) {
        let dir = tempfile::tempdir().unwrap();
        let writer = BatchWriter::new(
            store,
            240_000,
            dir.path().join("failed.ndjson"),
            &SmtpConfig::default(),
        );
        (dir, writer)
    }

    fn row(i: usize) -> Vec<String> {
        vec!["u1".to_string(), i.to_string(), "gps".to_string()]
    }

    #[tokio::test(start_paused = true)]
    async fn successful_flush_drains_queue() {
        let store = Arc::new(MemorySheets::new());
        let (_dir, writer) = writer_with(store.clone());
        for i in 0..5 {
            writer.enqueue_user("damian", row(i));
        }
        writer.flush_once().await;
        assert_eq!(writer.queued_rows(), 0);
        assert_eq!(store.rows(&user_log_sheet("damian")).len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn quota_backoff_doubles_and_keeps_batch() {
        let store = Arc::new(MemorySheets::new());
        let (_dir, writer) = writer_with(store.clone());
        for i in 0..100 {
            writer.enqueue_user("damian", row(i));
        }
        for _ in 0..3 {
            store.push_failure(StoreError::QuotaExceeded);
        }

        writer.flush_once().await;
        assert_eq!(writer.backoff_ms(), 30_000);
        assert_eq!(writer.queued_rows(), 100);

        // still in backoff: no attempt happens
        writer.flush_once().await;
        assert_eq!(*store.write_count.lock().unwrap(), 1);

        tokio::time::advance(Duration::from_millis(30_000)).await;
        writer.flush_once().await;
        assert_eq!(writer.backoff_ms(), 60_000);

        tokio::time::advance(Duration::from_millis(60_000)).await;
        writer.flush_once().await;
        assert_eq!(writer.backoff_ms(), 120_000);
        assert_eq!(writer.queued_rows(), 100);

        // store recovers: everything lands, backoff resets
        tokio::time::advance(Duration::from_millis(120_000)).await;
        writer.flush_once().await;
        assert_eq!(writer.queued_rows(), 0);
        assert_eq!(writer.backoff_ms(), 0);
        assert_eq!(store.rows(&user_log_sheet("damian")).len(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_capped() {
        let store = Arc::new(MemorySheets::new());
        let (_dir, writer) = writer_with(store.clone());
        writer.enqueue_user("damian", row(0));
        for _ in 0..6 {
            store.push_failure(StoreError::QuotaExceeded);
        }
        for _ in 0..6 {
            tokio::time::advance(Duration::from_millis(240_000)).await;
            writer.flush_once().await;
        }
        assert_eq!(writer.backoff_ms(), 240_000);
    }

    #[tokio::test(start_paused = true)]
    async fn hard_failure_diverts_to_fallback_file() {
        let store = Arc::new(MemorySheets::new());
        let (dir, writer) = writer_with(store.clone());
        for i in 0..3 {
            writer.enqueue_user("damian", row(i));
        }
        store.push_failure(StoreError::Other(anyhow::anyhow!("schema mismatch")));
        writer.flush_once().await;

        assert_eq!(writer.queued_rows(), 0);
        let contents = std::fs::read_to_string(dir.path().join("failed.ndjson")).unwrap();
        assert_eq!(contents.lines().count(), 3);
        assert!(contents.contains("log-damian"));
    }

    #[tokio::test(start_paused = true)]
    async fn suspension_skips_flush() {
        let store = Arc::new(MemorySheets::new());
        let (_dir, writer) = writer_with(store.clone());
        writer.enqueue_auth(row(0));
        writer.set_suspended(true);
        writer.flush_once().await;
        assert_eq!(writer.queued_rows(), 1);
        writer.set_suspended(false);
        writer.flush_once().await;
        assert_eq!(writer.queued_rows(), 0);
        assert_eq!(store.rows(AUTH_SHEET).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queues_flush_independently_after_hard_failure() {
        let store = Arc::new(MemorySheets::new());
        let (_dir, writer) = writer_with(store.clone());
        writer.enqueue_category_change(row(0));
        writer.enqueue_user("damian", row(1));
        // first queue (category-changes sorts before log-damian) fails hard
        store.push_failure(StoreError::Other(anyhow::anyhow!("bad sheet")));
        writer.flush_once().await;
        assert_eq!(writer.queued_rows(), 0);
        assert_eq!(store.rows(&user_log_sheet("damian")).len(), 1);
    }
}
