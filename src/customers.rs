//! TTL-cached read-only view of the customer master list.
//!
//! The whole worksheet is cached for five minutes; customer creation
//! invalidates explicitly. Street/name normalization happens at load and
//! query time so field input tolerates abbreviations and umlaut variants.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::house_number;
use crate::models::address::Address;
use crate::models::customer::{CreateCustomerRequest, Customer};
use crate::models::resident::{Resident, ResidentCategory};
use crate::sheet_store::{CUSTOMERS_SHEET, TabularStore};
use crate::streets;

const CACHE_TTL: Duration = Duration::from_secs(300);

struct CachedList {
    customers: Arc<Vec<Customer>>,
    fetched_at: Instant,
}

pub struct CustomerDirectory {
    store: Arc<dyn TabularStore>,
    cache: RwLock<Option<CachedList>>,
}

impl CustomerDirectory {
    pub fn new(store: Arc<dyn TabularStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(None),
        }
    }

    pub async fn all(&self) -> anyhow::Result<Arc<Vec<Customer>>> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < CACHE_TTL {
                    return Ok(cached.customers.clone());
                }
            }
        }
        let mut cache = self.cache.write().await;
        // another task may have refreshed while we waited for the lock
        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < CACHE_TTL {
                return Ok(cached.customers.clone());
            }
        }
        let customers = Arc::new(self.fetch().await?);
        *cache = Some(CachedList {
            customers: customers.clone(),
            fetched_at: Instant::now(),
        });
        Ok(customers)
    }

    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    async fn fetch(&self) -> anyhow::Result<Vec<Customer>> {
        let rows = self
            .store
            .read_all(CUSTOMERS_SHEET)
            .await
            .map_err(anyhow::Error::from)?;
        let mut customers = Vec::with_capacity(rows.len());
        for row in rows {
            if row.first().map(String::as_str) == Some("id") {
                continue; // header
            }
            let get = |i: usize| row.get(i).map(String::as_str).unwrap_or("").trim();
            let (street, number) = streets::extract_house_number(get(2), get(3));
            if number.is_empty() {
                tracing::warn!(
                    "customer row {} has no extractable house number ({}), skipped",
                    get(0),
                    get(2)
                );
                continue;
            }
            customers.push(Customer {
                id: get(0).to_string(),
                name: get(1).to_string(),
                street,
                house_number: number,
                postal: get(4).to_string(),
                is_existing: matches!(get(5).to_lowercase().as_str(), "true" | "1" | "ja"),
            });
        }
        tracing::debug!("customer master list loaded: {} rows", customers.len());
        Ok(customers)
    }

    pub async fn create(&self, req: &CreateCustomerRequest) -> anyhow::Result<Customer> {
        let customer = Customer {
            id: uuid::Uuid::new_v4().to_string(),
            name: req.name.trim().to_string(),
            street: req.street.trim().to_string(),
            house_number: req.house_number.trim().to_string(),
            postal: req.postal.trim().to_string(),
            is_existing: req.is_existing,
        };
        self.store
            .append_row(
                CUSTOMERS_SHEET,
                vec![
                    customer.id.clone(),
                    customer.name.clone(),
                    customer.street.clone(),
                    customer.house_number.clone(),
                    customer.postal.clone(),
                    customer.is_existing.to_string(),
                ],
            )
            .await
            .map_err(anyhow::Error::from)?;
        self.invalidate().await;
        Ok(customer)
    }

    /// Customers at the given address: exact postal, fuzzy street,
    /// house-number overlap. Deduplicated by id.
    pub async fn at_address(&self, address: &Address) -> anyhow::Result<Vec<Customer>> {
        let all = self.all().await?;
        Ok(filter_by_address(&all, address))
    }

    /// Name search, optionally narrowed to an address first.
    pub async fn search(
        &self,
        name: &str,
        address: Option<&Address>,
    ) -> anyhow::Result<Vec<Customer>> {
        let all = self.all().await?;
        let scoped: Vec<Customer> = match address {
            Some(addr) => filter_by_address(&all, addr),
            None => all.as_ref().clone(),
        };
        Ok(scoped
            .into_iter()
            .filter(|c| streets::names_match(&c.name, name))
            .collect())
    }

    /// Existing customers at an address, mirrored into immutable
    /// residents for a new dataset.
    pub async fn fixed_residents_for(&self, address: &Address) -> anyhow::Result<Vec<Resident>> {
        let matches = self.at_address(address).await?;
        Ok(matches
            .into_iter()
            .filter(|c| c.is_existing)
            .map(|c| Resident {
                name: c.name,
                category: ResidentCategory::ExistingCustomer,
                status: None,
                notes: None,
                floor: None,
                door: None,
                is_fixed: true,
            })
            .collect())
    }
}

fn filter_by_address(all: &[Customer], address: &Address) -> Vec<Customer> {
    let postal = address.postal.trim().to_lowercase();
    let mut seen = std::collections::HashSet::new();
    all.iter()
        .filter(|c| c.postal.trim().to_lowercase() == postal)
        .filter(|c| streets::streets_match(&c.street, &address.street))
        .filter(|c| {
            address.number.trim().is_empty()
                || house_number::matches(&c.house_number, &address.number)
        })
        .filter(|c| seen.insert(c.id.clone()))
        .cloned()
        .collect()
}
