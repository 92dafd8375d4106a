//! Master user directory: resolves external tracker names and device ids
//! to known field users. Same TTL-cache discipline as the customer list.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::sheet_store::{TabularStore, USERS_SHEET};
use crate::streets::fold_german;

const CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldUser {
    pub user_id: String,
    pub username: String,
    pub display_name: String,
    /// FollowMee device mapped to this user, if any.
    pub device_id: Option<String>,
}

struct CachedUsers {
    users: Arc<Vec<FieldUser>>,
    fetched_at: Instant,
}

pub struct UserDirectory {
    store: Arc<dyn TabularStore>,
    cache: RwLock<Option<CachedUsers>>,
}

impl UserDirectory {
    pub fn new(store: Arc<dyn TabularStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(None),
        }
    }

    pub async fn all(&self) -> anyhow::Result<Arc<Vec<FieldUser>>> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < CACHE_TTL {
                    return Ok(cached.users.clone());
                }
            }
        }
        let mut cache = self.cache.write().await;
        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < CACHE_TTL {
                return Ok(cached.users.clone());
            }
        }
        let rows = self
            .store
            .read_all(USERS_SHEET)
            .await
            .map_err(anyhow::Error::from)?;
        let users: Vec<FieldUser> = rows
            .into_iter()
            .filter(|row| row.first().map(String::as_str) != Some("userId"))
            .filter_map(|row| {
                let get = |i: usize| row.get(i).map(String::as_str).unwrap_or("").trim().to_string();
                let user_id = get(0);
                let username = get(1);
                if user_id.is_empty() || username.is_empty() {
                    return None;
                }
                let device = get(3);
                Some(FieldUser {
                    user_id,
                    username,
                    display_name: get(2),
                    device_id: (!device.is_empty()).then_some(device),
                })
            })
            .collect();
        let users = Arc::new(users);
        *cache = Some(CachedUsers {
            users: users.clone(),
            fetched_at: Instant::now(),
        });
        Ok(users)
    }

    /// Case- and umlaut-insensitive match on username or display name.
    pub async fn resolve_name(&self, name: &str) -> anyhow::Result<Option<FieldUser>> {
        let wanted = fold_german(name.trim());
        if wanted.is_empty() {
            return Ok(None);
        }
        let users = self.all().await?;
        Ok(users
            .iter()
            .find(|u| {
                fold_german(&u.username) == wanted || fold_german(&u.display_name) == wanted
            })
            .cloned())
    }

    pub async fn by_username(&self, username: &str) -> anyhow::Result<Option<FieldUser>> {
        let users = self.all().await?;
        Ok(users.iter().find(|u| u.username == username).cloned())
    }

    /// All users with a tracker device attached.
    pub async fn device_mappings(&self) -> anyhow::Result<Vec<FieldUser>> {
        let users = self.all().await?;
        Ok(users
            .iter()
            .filter(|u| u.device_id.is_some())
            .cloned()
            .collect())
    }
}
