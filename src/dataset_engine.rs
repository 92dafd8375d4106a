//! Authoritative handler for per-address resident records.
//!
//! All reads are served from the in-memory cache; writes land in the
//! cache, are marked dirty and reach the backing store through the
//! 60-second flusher. The backing store is only read once, at startup.

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use chrono_tz::Europe::Berlin;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::customers::CustomerDirectory;
use crate::dataset_cache::{DatasetCache, LockAttempt};
use crate::error::{AddressConflict, ApiError};
use crate::geocode::{GeocodeError, GeocodeQueue};
use crate::house_number;
use crate::models::address::{Address, NormalizedAddress};
use crate::models::dataset::{
    AddressDataset, BulkUpdateRequest, CreateDatasetRequest, DatasetResponse,
    UpdateResidentRequest,
};
use crate::models::resident::Resident;
use crate::sheet_store::{DATASETS_SHEET, TabularStore};
use crate::streets;

/// Tracks which dataset ids already have a backing-store row, and where.
/// Row indices are zero-based over data rows.
#[derive(Default)]
struct PersistedIndex {
    rows: HashMap<String, usize>,
    next_row: usize,
}

pub struct DatasetEngine {
    cache: Arc<DatasetCache>,
    store: Arc<dyn TabularStore>,
    geocode: GeocodeQueue,
    customers: Arc<CustomerDirectory>,
    persisted: Mutex<PersistedIndex>,
    edit_window_days: i64,
}

impl DatasetEngine {
    pub fn new(
        cache: Arc<DatasetCache>,
        store: Arc<dyn TabularStore>,
        geocode: GeocodeQueue,
        customers: Arc<CustomerDirectory>,
        edit_window_days: i64,
    ) -> Self {
        Self {
            cache,
            store,
            geocode,
            customers,
            persisted: Mutex::new(PersistedIndex::default()),
            edit_window_days,
        }
    }

    pub fn cache(&self) -> &Arc<DatasetCache> {
        &self.cache
    }

    /// Full startup load. A failure here is fatal: without the cache the
    /// engine would silently report every address as free.
    pub async fn load(&self) -> anyhow::Result<usize> {
        let rows = self
            .store
            .read_all(DATASETS_SHEET)
            .await
            .map_err(anyhow::Error::from)?;
        let mut datasets = Vec::new();
        let mut index = PersistedIndex::default();
        let mut data_idx = 0usize;
        for row in &rows {
            if row.first().map(String::as_str) == Some("id") {
                continue;
            }
            match row_to_dataset(row) {
                Ok(ds) => {
                    index.rows.insert(ds.id.clone(), data_idx);
                    datasets.push(ds);
                }
                Err(e) => {
                    // keep the slot: indices must stay aligned with the sheet
                    tracing::warn!("skipping malformed dataset row {data_idx}: {e}");
                }
            }
            data_idx += 1;
        }
        index.next_row = data_idx;
        let count = datasets.len();
        self.cache.seed(datasets);
        *self.persisted.lock().unwrap() = index;
        self.cache.mark_loaded();
        tracing::info!("dataset cache loaded: {count} datasets");
        Ok(count)
    }

    fn can_edit(&self, ds: &AddressDataset, username: &str, now: DateTime<Utc>) -> bool {
        // two-sided window: legacy rows carry future-skewed timestamps
        ds.created_by == username
            && (now - ds.created_at).abs() <= TimeDelta::days(self.edit_window_days)
    }

    fn response(&self, ds: &AddressDataset, username: &str, now: DateTime<Utc>) -> DatasetResponse {
        DatasetResponse::new(ds.clone(), self.can_edit(ds, username, now))
    }

    /// Newest dataset inside the edit window whose normalized address
    /// overlaps the given one. The stored house-number group is used
    /// as-is: a prior "1-3" blocks 1, 2 and 3.
    fn window_conflict(
        &self,
        normalized: &NormalizedAddress,
        now: DateTime<Utc>,
    ) -> Option<Arc<AddressDataset>> {
        let window = TimeDelta::days(self.edit_window_days);
        self.cache
            .all()
            .into_iter()
            .filter(|ds| (now - ds.created_at).abs() <= window)
            .filter(|ds| same_street(&ds.normalized_address, normalized))
            .filter(|ds| {
                house_number::matches(
                    &ds.normalized_address.house_number,
                    &normalized.house_number,
                )
            })
            .max_by_key(|ds| ds.created_at)
    }

    fn conflict_error(
        &self,
        existing: Arc<AddressDataset>,
        username: &str,
        now: DateTime<Utc>,
    ) -> ApiError {
        let days_since = (now - existing.created_at).abs().num_days();
        let days_until = (self.edit_window_days - days_since).max(0);
        let is_own = existing.created_by == username;
        let message = if is_own {
            format!(
                "Du hast diese Adresse vor {days_since} Tagen erfasst. \
                 Eine Neuerfassung ist in {days_until} Tagen möglich."
            )
        } else {
            format!(
                "Diese Adresse wurde vor {days_since} Tagen von {} erfasst.",
                existing.created_by
            )
        };
        ApiError::AddressConflict {
            message,
            conflict: Box::new(AddressConflict {
                existing_creator: existing.created_by.clone(),
                is_own_dataset: is_own,
                days_since_creation: days_since,
                days_until_new_allowed: days_until,
                existing_dataset: Some(self.response(&existing, username, now)),
            }),
        }
    }

    pub async fn create_dataset(
        &self,
        username: &str,
        req: CreateDatasetRequest,
    ) -> Result<DatasetResponse, ApiError> {
        let missing = req.address.missing_fields();
        if !missing.is_empty() {
            return Err(ApiError::incomplete_address(missing));
        }
        if !house_number_ok(&req.address.number) {
            return Err(ApiError::InvalidAddress {
                message: format!("Ungültige Hausnummer: {}", req.address.number),
                missing_fields: Vec::new(),
            });
        }

        let normalized = self.normalize(&req.address).await?;
        let now = Utc::now();

        if let Some(existing) = self.window_conflict(&normalized, now) {
            return Err(self.conflict_error(existing, username, now));
        }

        // Fetch ahead of the lock so the critical section stays synchronous.
        let fixed = match self.customers.fixed_residents_for(&req.address).await {
            Ok(fixed) => fixed,
            Err(e) => {
                tracing::warn!("customer mirror unavailable on create: {e}");
                Vec::new()
            }
        };

        let mut editable = req.editable_residents;
        for resident in &mut editable {
            resident.is_fixed = false;
            resident.enforce_status_invariant();
        }

        let lock_key = format!("{}:{}", normalized.formatted, username);
        if self.cache.try_lock(&lock_key) == LockAttempt::Held {
            return Err(ApiError::LockHeld);
        }
        // Re-check under the lock: a concurrent create may have landed
        // between the pre-check and lock acquisition.
        if let Some(existing) = self.window_conflict(&normalized, now) {
            self.cache.unlock(&lock_key);
            return Err(self.conflict_error(existing, username, now));
        }

        let dataset = AddressDataset {
            id: AddressDataset::new_id(now),
            street: normalized.street.clone(),
            house_number: normalized.house_number.clone(),
            postal: normalized.postal.clone(),
            city: normalized.city.clone(),
            normalized_address: normalized,
            created_by: username.to_string(),
            created_at: now,
            raw_resident_data: req.raw_resident_data,
            editable_residents: editable,
            fixed_customers: fixed,
        };
        let arc = self.cache.put(dataset);
        // the cache is authoritative from here on; the store write is async
        self.cache.unlock(&lock_key);

        Ok(self.response(&arc, username, now))
    }

    async fn normalize(&self, address: &Address) -> Result<NormalizedAddress, ApiError> {
        self.geocode.normalize(address).await.map_err(|e| match e {
            GeocodeError::RateLimited => ApiError::RateLimited,
            GeocodeError::Other(e) => ApiError::Internal(e),
        })
    }

    /// Normalizing lookup; newest first, flexible house-number match.
    pub async fn get_by_address(
        &self,
        username: &str,
        address: &Address,
        limit: usize,
    ) -> Result<Vec<DatasetResponse>, ApiError> {
        if !self.cache.is_loaded() {
            return Ok(Vec::new());
        }
        let normalized = self.normalize(address).await?;
        let now = Utc::now();
        let mut found: Vec<Arc<AddressDataset>> = self
            .cache
            .all()
            .into_iter()
            .filter(|ds| same_street(&ds.normalized_address, &normalized))
            .filter(|ds| {
                house_number::matches(
                    &ds.normalized_address.house_number,
                    &normalized.house_number,
                )
            })
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found.truncate(limit);
        Ok(found
            .into_iter()
            .map(|ds| {
                let non_exact = !same_number_group(
                    &ds.normalized_address.house_number,
                    &normalized.house_number,
                );
                let mut resp = self.response(&ds, username, now);
                resp.is_non_exact_match = Some(non_exact);
                resp
            })
            .collect())
    }

    /// Cache-only lookup without normalization. Guards: 5-digit postal,
    /// non-empty number; anything else answers empty.
    pub fn search_local(
        &self,
        username: &str,
        street: &str,
        number: &str,
        postal: &str,
    ) -> Vec<DatasetResponse> {
        let postal = postal.trim();
        if postal.len() != 5 || !postal.chars().all(|c| c.is_ascii_digit()) {
            return Vec::new();
        }
        if number.trim().is_empty() || street.trim().is_empty() {
            return Vec::new();
        }
        let now = Utc::now();
        let mut found: Vec<Arc<AddressDataset>> = self
            .cache
            .all()
            .into_iter()
            .filter(|ds| ds.postal.trim() == postal)
            .filter(|ds| streets::streets_match(&ds.street, street))
            .filter(|ds| house_number::matches(&ds.house_number, number))
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found
            .into_iter()
            .map(|ds| self.response(&ds, username, now))
            .collect()
    }

    pub fn get_by_id(&self, username: &str, id: &str) -> Result<DatasetResponse, ApiError> {
        let ds = self
            .cache
            .get(id)
            .ok_or_else(|| ApiError::NotFound(format!("Erfassung {id} nicht gefunden")))?;
        Ok(self.response(&ds, username, Utc::now()))
    }

    /// Newest dataset per house-number group on a street.
    pub fn streets_overview(&self, username: &str, street: &str) -> Vec<DatasetResponse> {
        let now = Utc::now();
        let mut newest: HashMap<String, Arc<AddressDataset>> = HashMap::new();
        for ds in self.cache.all() {
            if !streets::streets_match(&ds.street, street) {
                continue;
            }
            let key = ds.house_number.trim().to_lowercase();
            match newest.get(&key) {
                Some(current) if current.created_at >= ds.created_at => {}
                _ => {
                    newest.insert(key, ds);
                }
            }
        }
        let mut groups: Vec<Arc<AddressDataset>> = newest.into_values().collect();
        groups.sort_by(|a, b| natural_number_key(&a.house_number).cmp(&natural_number_key(&b.house_number)));
        groups
            .into_iter()
            .map(|ds| self.response(&ds, username, now))
            .collect()
    }

    /// Top-10 street-name suggestions by folded prefix.
    pub fn street_suggestions(&self, query: &str) -> Vec<String> {
        let prefix = streets::fold_german(query.trim());
        if prefix.is_empty() {
            return Vec::new();
        }
        let mut names: Vec<String> = self
            .cache
            .all()
            .into_iter()
            .map(|ds| ds.street.clone())
            .filter(|s| streets::fold_german(s).starts_with(&prefix))
            .collect();
        names.sort();
        names.dedup();
        names.truncate(10);
        names
    }

    /// A user's own datasets for one Berlin calendar day, newest first.
    pub fn user_datasets_by_date(&self, username: &str, date: NaiveDate) -> Vec<DatasetResponse> {
        let now = Utc::now();
        let mut found: Vec<Arc<AddressDataset>> = self
            .cache
            .all()
            .into_iter()
            .filter(|ds| ds.created_by == username)
            .filter(|ds| ds.created_at.with_timezone(&Berlin).date_naive() == date)
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found
            .into_iter()
            .map(|ds| self.response(&ds, username, now))
            .collect()
    }

    /// Most recent dataset covering the address, regardless of window.
    /// Backs the historical matching overlay.
    pub fn latest_for_address(
        &self,
        street: &str,
        postal: &str,
        number: &str,
    ) -> Option<Arc<AddressDataset>> {
        self.cache
            .all()
            .into_iter()
            .filter(|ds| ds.postal.trim() == postal.trim())
            .filter(|ds| streets::streets_match(&ds.street, street))
            .filter(|ds| house_number::matches(&ds.house_number, number))
            .max_by_key(|ds| ds.created_at)
    }

    fn editable_dataset(
        &self,
        username: &str,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<AddressDataset, ApiError> {
        let ds = self
            .cache
            .get(id)
            .ok_or_else(|| ApiError::NotFound(format!("Erfassung {id} nicht gefunden")))?;
        if !self.can_edit(&ds, username, now) {
            return Err(ApiError::Forbidden(
                "Bearbeitung nur durch den Ersteller innerhalb von 30 Tagen möglich".to_string(),
            ));
        }
        Ok((*ds).clone())
    }

    /// Upsert at index (append when past the end); `None` deletes.
    /// Deleting past the end is a no-op so retries stay idempotent.
    pub fn update_resident(
        &self,
        username: &str,
        req: UpdateResidentRequest,
    ) -> Result<DatasetResponse, ApiError> {
        let now = Utc::now();
        let mut ds = self.editable_dataset(username, &req.dataset_id, now)?;
        match req.resident {
            None => {
                if req.index < ds.editable_residents.len() {
                    ds.editable_residents.remove(req.index);
                }
            }
            Some(mut resident) => {
                resident.is_fixed = false;
                resident.enforce_status_invariant();
                if req.index < ds.editable_residents.len() {
                    ds.editable_residents[req.index] = resident;
                } else {
                    ds.editable_residents.push(resident);
                }
            }
        }
        let arc = self.cache.put(ds);
        Ok(self.response(&arc, username, now))
    }

    /// Replace the whole editable list atomically.
    pub fn bulk_update_residents(
        &self,
        username: &str,
        req: BulkUpdateRequest,
    ) -> Result<DatasetResponse, ApiError> {
        let now = Utc::now();
        let mut ds = self.editable_dataset(username, &req.dataset_id, now)?;
        let mut residents: Vec<Resident> = req.residents;
        for resident in &mut residents {
            resident.is_fixed = false;
            resident.enforce_status_invariant();
        }
        ds.editable_residents = residents;
        let arc = self.cache.put(ds);
        Ok(self.response(&arc, username, now))
    }

    /// Drain the dirty set into the backing store. First flush of an id
    /// appends; later flushes update the row in place. The dirty bit is
    /// only cleared once the write is acknowledged and the cache still
    /// holds the flushed state.
    pub async fn flush_dirty(&self) {
        for id in self.cache.dirty_ids() {
            let Some(ds) = self.cache.get(&id) else {
                continue;
            };
            let row = dataset_to_row(&ds);
            let existing_idx = self.persisted.lock().unwrap().rows.get(&id).copied();
            let result = match existing_idx {
                Some(idx) => self.store.update_row(DATASETS_SHEET, idx, row).await,
                None => self.store.append_row(DATASETS_SHEET, row).await,
            };
            match result {
                Ok(()) => {
                    if existing_idx.is_none() {
                        let mut persisted = self.persisted.lock().unwrap();
                        let slot = persisted.next_row;
                        persisted.rows.insert(id.clone(), slot);
                        persisted.next_row += 1;
                    }
                    self.cache.ack_flush(&id, &ds);
                }
                Err(e) => {
                    tracing::warn!("dataset flush failed for {id}, staying dirty: {e}");
                }
            }
        }
    }
}

fn same_street(a: &NormalizedAddress, b: &NormalizedAddress) -> bool {
    a.postal.trim() == b.postal.trim()
        && streets::normalize_street(&a.street) == streets::normalize_street(&b.street)
}

/// Exact match means the stored group and the request expand to the same
/// set; anything looser is surfaced as `isNonExactMatch`.
fn same_number_group(stored: &str, requested: &str) -> bool {
    use std::collections::HashSet;
    let a: HashSet<String> = house_number::expand(stored).into_iter().collect();
    let b: HashSet<String> = house_number::expand(requested).into_iter().collect();
    a == b
}

fn house_number_ok(number: &str) -> bool {
    let number = number.trim();
    !number.is_empty()
        && house_number::expand(number)
            .iter()
            .all(|t| t.chars().next().is_some_and(|c| c.is_ascii_digit()))
}

/// Sort key putting "2" before "10" before "10a".
fn natural_number_key(number: &str) -> (u32, String) {
    let leading: String = number
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    (leading.parse().unwrap_or(u32::MAX), number.trim().to_lowercase())
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ResidentColumns {
    editable: Vec<Resident>,
    fixed: Vec<Resident>,
}

/// Worksheet row layout: id, normalizedAddress, street, houseNumber,
/// city, postal, createdBy, createdAt (RFC 3339), raw JSON, residents JSON.
fn dataset_to_row(ds: &AddressDataset) -> Vec<String> {
    let residents = ResidentColumns {
        editable: ds.editable_residents.clone(),
        fixed: ds.fixed_customers.clone(),
    };
    vec![
        ds.id.clone(),
        ds.normalized_address.formatted.clone(),
        ds.street.clone(),
        ds.house_number.clone(),
        ds.city.clone(),
        ds.postal.clone(),
        ds.created_by.clone(),
        ds.created_at.to_rfc3339(),
        ds.raw_resident_data.to_string(),
        serde_json::to_string(&residents).unwrap_or_else(|_| "{}".to_string()),
    ]
}

fn row_to_dataset(row: &[String]) -> anyhow::Result<AddressDataset> {
    let get = |i: usize| row.get(i).map(String::as_str).unwrap_or("").to_string();
    let id = get(0);
    if id.is_empty() {
        anyhow::bail!("empty id column");
    }
    let created_at = DateTime::parse_from_rfc3339(&get(7))
        .map_err(|e| anyhow::anyhow!("bad createdAt for {id}: {e}"))?
        .with_timezone(&Utc);
    let raw: serde_json::Value = serde_json::from_str(&get(8)).unwrap_or(serde_json::Value::Null);
    // legacy rows hold a bare array of editable residents
    let residents: ResidentColumns = serde_json::from_str(&get(9)).or_else(|_| {
        serde_json::from_str::<Vec<Resident>>(&get(9)).map(|editable| ResidentColumns {
            editable,
            fixed: Vec::new(),
        })
    })?;
    Ok(AddressDataset {
        id,
        normalized_address: NormalizedAddress {
            formatted: get(1),
            street: get(2),
            house_number: get(3),
            postal: get(5),
            city: get(4),
            lat: None,
            lon: None,
            validated: true,
        },
        street: get(2),
        house_number: get(3),
        postal: get(5),
        city: get(4),
        created_by: get(6),
        created_at,
        raw_resident_data: raw,
        editable_residents: residents.editable,
        fixed_customers: residents.fixed,
    })
}

/// Dirty-cache flusher: one pass every `interval_ms`.
pub fn spawn_dataset_flusher(engine: Arc<DatasetEngine>, interval_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            interval.tick().await;
            engine.flush_dirty().await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use crate::geocode::{GeocodeHit, Geocoder};
    use crate::models::resident::{ResidentCategory, ResidentStatus};
    use crate::sheet_store::memory::MemorySheets;

    /// Always misses: every address normalizes through the concatenation
    /// fallback, which keeps engine tests deterministic.
    struct OfflineGeocoder;

    #[async_trait]
    impl Geocoder for OfflineGeocoder {
        async fn geocode(&self, _q: &str) -> Result<Option<GeocodeHit>, GeocodeError> {
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

    fn engine_with(store: Arc<MemorySheets>) -> Arc<DatasetEngine> {
        let cache = Arc::new(DatasetCache::new(Duration::from_secs(30)));
        cache.mark_loaded();
        let geocode = GeocodeQueue::spawn(Arc::new(OfflineGeocoder));
        let customers = Arc::new(CustomerDirectory::new(store.clone()));
        Arc::new(DatasetEngine::new(cache, store, geocode, customers, 30))
    }

    fn engine() -> Arc<DatasetEngine> {
        engine_with(Arc::new(MemorySheets::new()))
    }

    fn address() -> Address {
        Address {
            street: "Schnellweider Straße".to_string(),
            number: "12".to_string(),
            postal: "41462".to_string(),
            city: Some("Neuss".to_string()),
        }
    }

    fn create_req(number: &str) -> CreateDatasetRequest {
        CreateDatasetRequest {
            address: Address {
                number: number.to_string(),
                ..address()
            },
            editable_residents: Vec::new(),
            raw_resident_data: serde_json::Value::Null,
        }
    }

    fn seeded(engine: &DatasetEngine, number: &str, user: &str, age: ChronoDuration) -> String {
        let created_at = Utc::now() - age;
        let normalized =
            NormalizedAddress::unvalidated("Schnellweider Straße", number, "41462", "Neuss");
        let ds = AddressDataset {
            id: AddressDataset::new_id(created_at),
            street: normalized.street.clone(),
            house_number: normalized.house_number.clone(),
            postal: normalized.postal.clone(),
            city: normalized.city.clone(),
            normalized_address: normalized,
            created_by: user.to_string(),
            created_at,
            raw_resident_data: serde_json::Value::Null,
            editable_residents: Vec::new(),
            fixed_customers: Vec::new(),
        };
        let id = ds.id.clone();
        engine.cache().seed(vec![ds]);
        id
    }

    fn resident(name: &str) -> Resident {
        Resident {
            name: name.to_string(),
            category: ResidentCategory::PotentialNewCustomer,
            status: None,
            notes: None,
            floor: None,
            door: None,
            is_fixed: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn create_returns_editable_dataset() {
        let engine = engine();
        let created = engine
            .create_dataset("damian", create_req("12"))
            .await
            .unwrap();
        assert!(created.can_edit);
        assert_eq!(created.dataset.created_by, "damian");
        assert_eq!(engine.cache().dirty_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_same_user_creates_yield_one_dataset() {
        let engine = engine();
        let (a, b) = tokio::join!(
            engine.create_dataset("damian", create_req("12")),
            engine.create_dataset("damian", create_req("12")),
        );
        let results = [a, b];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 1);
        let err = results.iter().find(|r| r.is_err()).unwrap();
        match err.as_ref().unwrap_err() {
            ApiError::AddressConflict { conflict, .. } => {
                assert!(conflict.is_own_dataset);
                assert_eq!(conflict.days_since_creation, 0);
                assert_eq!(conflict.days_until_new_allowed, 30);
            }
            ApiError::LockHeld => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_dataset_blocks_with_creator_name() {
        let engine = engine();
        seeded(&engine, "12", "jens", ChronoDuration::days(3));
        let err = engine
            .create_dataset("damian", create_req("12"))
            .await
            .unwrap_err();
        match err {
            ApiError::AddressConflict { conflict, .. } => {
                assert!(!conflict.is_own_dataset);
                assert_eq!(conflict.existing_creator, "jens");
                assert_eq!(conflict.days_since_creation, 3);
                assert_eq!(conflict.days_until_new_allowed, 27);
                assert!(conflict.existing_dataset.is_some());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expired_window_allows_recreation() {
        let engine = engine();
        let old_id = seeded(&engine, "12", "damian", ChronoDuration::days(31));
        let created = engine
            .create_dataset("damian", create_req("12"))
            .await
            .unwrap();
        assert_ne!(created.dataset.id, old_id);

        let found = engine
            .get_by_address("damian", &address(), 50)
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        // newest first; the expired one is read-only
        assert_eq!(found[0].dataset.id, created.dataset.id);
        assert!(found[0].can_edit);
        assert_eq!(found[1].dataset.id, old_id);
        assert!(!found[1].can_edit);
    }

    #[tokio::test(start_paused = true)]
    async fn stored_group_blocks_contained_number() {
        let engine = engine();
        seeded(&engine, "1-3", "jens", ChronoDuration::days(1));
        let err = engine
            .create_dataset("damian", create_req("2"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::AddressConflict { .. }));
        // outside the group is free
        engine
            .create_dataset("damian", create_req("4"))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn flexible_lookup_marks_non_exact() {
        let engine = engine();
        seeded(&engine, "1-3", "jens", ChronoDuration::days(1));
        let found = engine
            .get_by_address(
                "damian",
                &Address {
                    number: "2".to_string(),
                    ..address()
                },
                50,
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].is_non_exact_match, Some(true));

        let exact = engine
            .get_by_address(
                "damian",
                &Address {
                    number: "1-3".to_string(),
                    ..address()
                },
                50,
            )
            .await
            .unwrap();
        assert_eq!(exact[0].is_non_exact_match, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn incomplete_address_lists_missing_fields() {
        let engine = engine();
        let err = engine
            .create_dataset(
                "damian",
                CreateDatasetRequest {
                    address: Address {
                        street: "Schnellweider Straße".to_string(),
                        number: String::new(),
                        postal: String::new(),
                        city: None,
                    },
                    editable_residents: Vec::new(),
                    raw_resident_data: serde_json::Value::Null,
                },
            )
            .await
            .unwrap_err();
        match err {
            ApiError::InvalidAddress { missing_fields, .. } => {
                assert_eq!(missing_fields, vec!["Hausnummer", "PLZ"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn letter_only_house_number_is_rejected() {
        let engine = engine();
        let err = engine
            .create_dataset("damian", create_req("abc"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidAddress { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn edit_window_is_two_sided_around_creation() {
        let engine = engine();
        let inside = seeded(
            &engine,
            "12",
            "damian",
            ChronoDuration::days(30) - ChronoDuration::seconds(5),
        );
        let outside = seeded(
            &engine,
            "14",
            "damian",
            ChronoDuration::days(30) + ChronoDuration::seconds(5),
        );
        // future-skewed timestamps stay editable inside the window
        let skewed = seeded(
            &engine,
            "16",
            "damian",
            ChronoDuration::days(-2),
        );
        assert!(engine.get_by_id("damian", &skewed).unwrap().can_edit);
        assert!(engine.get_by_id("damian", &inside).unwrap().can_edit);
        assert!(!engine.get_by_id("damian", &outside).unwrap().can_edit);
    }

    #[tokio::test(start_paused = true)]
    async fn resident_updates_respect_ownership() {
        let engine = engine();
        let id = seeded(&engine, "12", "damian", ChronoDuration::days(1));

        let err = engine
            .update_resident(
                "jens",
                UpdateResidentRequest {
                    dataset_id: id.clone(),
                    index: 0,
                    resident: Some(resident("Müller")),
                },
            )
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));

        let updated = engine
            .update_resident(
                "damian",
                UpdateResidentRequest {
                    dataset_id: id.clone(),
                    index: 5, // past the end: appended
                    resident: Some(resident("Müller")),
                },
            )
            .unwrap();
        assert_eq!(updated.dataset.editable_residents.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resident_delete_is_idempotent() {
        let engine = engine();
        let id = seeded(&engine, "12", "damian", ChronoDuration::days(1));
        engine
            .bulk_update_residents(
                "damian",
                BulkUpdateRequest {
                    dataset_id: id.clone(),
                    residents: vec![resident("Müller")],
                },
            )
            .unwrap();

        let delete = UpdateResidentRequest {
            dataset_id: id.clone(),
            index: 0,
            resident: None,
        };
        let after_first = engine
            .update_resident(
                "damian",
                UpdateResidentRequest {
                    dataset_id: id.clone(),
                    index: 0,
                    resident: None,
                },
            )
            .unwrap();
        assert!(after_first.dataset.editable_residents.is_empty());
        let after_second = engine.update_resident("damian", delete).unwrap();
        assert!(after_second.dataset.editable_residents.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn bulk_update_round_trips() {
        let engine = engine();
        let id = seeded(&engine, "12", "damian", ChronoDuration::days(1));
        let mut written = resident("Schmidt");
        written.category = ResidentCategory::ExistingCustomer;
        written.status = Some(ResidentStatus::Interested); // must be cleared
        engine
            .bulk_update_residents(
                "damian",
                BulkUpdateRequest {
                    dataset_id: id.clone(),
                    residents: vec![resident("Müller"), written],
                },
            )
            .unwrap();

        let read = engine.get_by_id("damian", &id).unwrap();
        assert_eq!(read.dataset.editable_residents.len(), 2);
        assert_eq!(read.dataset.editable_residents[1].status, None);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_appends_then_updates_in_place() {
        let store = Arc::new(MemorySheets::new());
        let engine = engine_with(store.clone());
        let created = engine
            .create_dataset("damian", create_req("12"))
            .await
            .unwrap();
        let id = created.dataset.id.clone();

        engine.flush_dirty().await;
        assert_eq!(engine.cache().dirty_len(), 0);
        assert_eq!(store.rows(DATASETS_SHEET).len(), 1);

        engine
            .bulk_update_residents(
                "damian",
                BulkUpdateRequest {
                    dataset_id: id.clone(),
                    residents: vec![resident("Müller")],
                },
            )
            .unwrap();
        engine.flush_dirty().await;
        // updated in place, not appended
        let rows = store.rows(DATASETS_SHEET);
        assert_eq!(rows.len(), 1);
        assert!(rows[0][9].contains("Müller"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_keeps_entry_dirty() {
        let store = Arc::new(MemorySheets::new());
        let engine = engine_with(store.clone());
        engine
            .create_dataset("damian", create_req("12"))
            .await
            .unwrap();
        store.push_failure(crate::sheet_store::StoreError::Other(anyhow::anyhow!(
            "backing store down"
        )));
        engine.flush_dirty().await;
        assert_eq!(engine.cache().dirty_len(), 1);
        engine.flush_dirty().await;
        assert_eq!(engine.cache().dirty_len(), 0);
        assert_eq!(store.rows(DATASETS_SHEET).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn load_round_trips_through_worksheet() {
        let store = Arc::new(MemorySheets::new());
        let engine = engine_with(store.clone());
        let created = engine
            .create_dataset("damian", create_req("12"))
            .await
            .unwrap();
        engine.flush_dirty().await;

        let reloaded = engine_with(store);
        let count = reloaded.load().await.unwrap();
        assert_eq!(count, 1);
        let read = reloaded.get_by_id("damian", &created.dataset.id).unwrap();
        assert_eq!(read.dataset.street, "Schnellweider Straße");
        assert!(read.can_edit);
    }

    #[tokio::test(start_paused = true)]
    async fn history_filters_by_user_and_day() {
        let engine = engine();
        let today_id = seeded(&engine, "12", "damian", ChronoDuration::zero());
        seeded(&engine, "14", "jens", ChronoDuration::zero());
        seeded(&engine, "16", "damian", ChronoDuration::days(2));

        let today = Utc::now().with_timezone(&Berlin).date_naive();
        let datasets = engine.user_datasets_by_date("damian", today);
        assert_eq!(datasets.len(), 1);
        assert_eq!(datasets[0].dataset.id, today_id);
    }

    #[tokio::test(start_paused = true)]
    async fn suggestions_are_prefix_matched_and_capped() {
        let engine = engine();
        seeded(&engine, "12", "damian", ChronoDuration::days(1));
        assert_eq!(
            engine.street_suggestions("schnell"),
            vec!["Schnellweider Straße".to_string()]
        );
        assert!(engine.street_suggestions("xyz").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn overview_keeps_newest_per_group() {
        let engine = engine();
        let newer = seeded(&engine, "12", "damian", ChronoDuration::days(1));
        seeded(&engine, "12", "jens", ChronoDuration::days(40));
        seeded(&engine, "2", "jens", ChronoDuration::days(2));

        let overview = engine.streets_overview("damian", "Schnellweider Straße");
        assert_eq!(overview.len(), 2);
        // natural ordering: 2 before 12
        assert_eq!(overview[0].dataset.house_number, "2");
        assert_eq!(overview[1].dataset.id, newer);
    }
}
