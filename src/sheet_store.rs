//! Adapter for the spreadsheet-backed tabular store.
//!
//! The store is modeled as named worksheets of ordered string rows with
//! append / single-row update / batch append. The concrete provider sits
//! behind [`TabularStore`] so engines and tests never see HTTP.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Worksheet holding one dataset per row.
pub const DATASETS_SHEET: &str = "datasets";
/// Customer master list.
pub const CUSTOMERS_SHEET: &str = "customers";
/// Known field users (name resolution for external pushes).
pub const USERS_SHEET: &str = "users";
/// Login/session audit rows.
pub const AUTH_SHEET: &str = "auth-log";
/// Prefix of tracker worksheets not yet mapped to a user.
pub const UNASSIGNED_PREFIX: &str = "unassigned-";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Provider write-quota rejection; the caller must back off and retry
    /// with the same batch.
    #[error("backing store quota exceeded")]
    QuotaExceeded,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait TabularStore: Send + Sync {
    async fn read_all(&self, worksheet: &str) -> Result<Vec<Vec<String>>, StoreError>;
    async fn append_row(&self, worksheet: &str, row: Vec<String>) -> Result<(), StoreError>;
    async fn batch_append(&self, worksheet: &str, rows: Vec<Vec<String>>)
    -> Result<(), StoreError>;
    /// Overwrite one row in place. `row_index` is zero-based over data
    /// rows (header excluded).
    async fn update_row(
        &self,
        worksheet: &str,
        row_index: usize,
        row: Vec<String>,
    ) -> Result<(), StoreError>;
    async fn list_worksheets(&self) -> Result<Vec<String>, StoreError>;
    async fn add_worksheet(&self, title: &str, header: Vec<String>) -> Result<(), StoreError>;
    async fn delete_worksheet(&self, title: &str) -> Result<(), StoreError>;
}

/// HTTP client for the hosted spreadsheet API.
pub struct SheetsClient {
    http: reqwest::Client,
    base_url: String,
    document: String,
    token: String,
}

#[derive(Deserialize)]
struct ValuesBody {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

#[derive(Deserialize)]
struct WorksheetsBody {
    #[serde(default)]
    sheets: Vec<String>,
}

impl SheetsClient {
    pub fn new(base_url: &str, document: &str, token: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            document: document.to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, tail: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.document, tail)
    }

    /// Quota rejections come back as 429 or as a 403 with a quota message.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(StoreError::QuotaExceeded);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if body.to_lowercase().contains("quota exceeded") {
                return Err(StoreError::QuotaExceeded);
            }
            return Err(StoreError::Other(anyhow::anyhow!(
                "backing store returned {status}: {body}"
            )));
        }
        Ok(resp)
    }
}

#[async_trait]
impl TabularStore for SheetsClient {
    async fn read_all(&self, worksheet: &str) -> Result<Vec<Vec<String>>, StoreError> {
        let resp = self
            .http
            .get(self.url(&format!("values/{worksheet}")))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(anyhow::Error::from)?;
        let body: ValuesBody = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(anyhow::Error::from)?;
        Ok(body.values)
    }

    async fn append_row(&self, worksheet: &str, row: Vec<String>) -> Result<(), StoreError> {
        self.batch_append(worksheet, vec![row]).await
    }

    async fn batch_append(
        &self,
        worksheet: &str,
        rows: Vec<Vec<String>>,
    ) -> Result<(), StoreError> {
        let resp = self
            .http
            .post(self.url(&format!("values/{worksheet}:append")))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "values": rows }))
            .send()
            .await
            .map_err(anyhow::Error::from)?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn update_row(
        &self,
        worksheet: &str,
        row_index: usize,
        row: Vec<String>,
    ) -> Result<(), StoreError> {
        let resp = self
            .http
            .put(self.url(&format!("values/{worksheet}/{row_index}")))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "values": [row] }))
            .send()
            .await
            .map_err(anyhow::Error::from)?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn list_worksheets(&self) -> Result<Vec<String>, StoreError> {
        let resp = self
            .http
            .get(self.url("worksheets"))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(anyhow::Error::from)?;
        let body: WorksheetsBody = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(anyhow::Error::from)?;
        Ok(body.sheets)
    }

    async fn add_worksheet(&self, title: &str, header: Vec<String>) -> Result<(), StoreError> {
        let resp = self
            .http
            .post(self.url("worksheets"))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "title": title, "header": header }))
            .send()
            .await
            .map_err(anyhow::Error::from)?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn delete_worksheet(&self, title: &str) -> Result<(), StoreError> {
        let resp = self
            .http
            .delete(self.url(&format!("worksheets/{title}")))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(anyhow::Error::from)?;
        Self::check(resp).await?;
        Ok(())
    }
}

/// In-memory store used by engine and writer tests.
#[cfg(test)]
pub mod memory {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemorySheets {
        pub sheets: Mutex<HashMap<String, Vec<Vec<String>>>>,
        /// Errors popped one per write call, for failure scripting.
        pub fail_script: Mutex<VecDeque<StoreError>>,
        pub write_count: Mutex<usize>,
    }

    impl MemorySheets {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_sheet(self, name: &str, rows: Vec<Vec<String>>) -> Self {
            self.sheets.lock().unwrap().insert(name.to_string(), rows);
            self
        }

        pub fn push_failure(&self, err: StoreError) {
            self.fail_script.lock().unwrap().push_back(err);
        }

        pub fn rows(&self, name: &str) -> Vec<Vec<String>> {
            self.sheets
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .unwrap_or_default()
        }

        fn take_failure(&self) -> Option<StoreError> {
            self.fail_script.lock().unwrap().pop_front()
        }
    }

    #[async_trait]
    impl TabularStore for MemorySheets {
        async fn read_all(&self, worksheet: &str) -> Result<Vec<Vec<String>>, StoreError> {
            Ok(self.rows(worksheet))
        }

        async fn append_row(&self, worksheet: &str, row: Vec<String>) -> Result<(), StoreError> {
            self.batch_append(worksheet, vec![row]).await
        }

        async fn batch_append(
            &self,
            worksheet: &str,
            rows: Vec<Vec<String>>,
        ) -> Result<(), StoreError> {
            *self.write_count.lock().unwrap() += 1;
            if let Some(err) = self.take_failure() {
                return Err(err);
            }
            self.sheets
                .lock()
                .unwrap()
                .entry(worksheet.to_string())
                .or_default()
                .extend(rows);
            Ok(())
        }

        async fn update_row(
            &self,
            worksheet: &str,
            row_index: usize,
            row: Vec<String>,
        ) -> Result<(), StoreError> {
            *self.write_count.lock().unwrap() += 1;
            if let Some(err) = self.take_failure() {
                return Err(err);
            }
            let mut sheets = self.sheets.lock().unwrap();
            let rows = sheets
                .get_mut(worksheet)
                .ok_or_else(|| anyhow::anyhow!("no worksheet {worksheet}"))?;
            if row_index >= rows.len() {
                return Err(StoreError::Other(anyhow::anyhow!(
                    "row {row_index} out of range in {worksheet}"
                )));
            }
            rows[row_index] = row;
            Ok(())
        }

        async fn list_worksheets(&self) -> Result<Vec<String>, StoreError> {
            Ok(self.sheets.lock().unwrap().keys().cloned().collect())
        }

        async fn add_worksheet(
            &self,
            title: &str,
            header: Vec<String>,
        ) -> Result<(), StoreError> {
            self.sheets
                .lock()
                .unwrap()
                .entry(title.to_string())
                .or_insert_with(|| vec![header]);
            Ok(())
        }

        async fn delete_worksheet(&self, title: &str) -> Result<(), StoreError> {
            self.sheets.lock().unwrap().remove(title);
            Ok(())
        }
    }
}
