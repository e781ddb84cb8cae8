use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use estate_core::IngestError;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::MIGRATOR;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StorageError> for IngestError {
    fn from(err: StorageError) -> Self {
        IngestError::Persistence(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub data: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    /// An entry exactly `ttl` old is still fresh; one second more and it is expired.
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: ChronoDuration) -> bool {
        now.signed_duration_since(self.created_at) <= ttl
    }
}

/// Key/value persistence for fetched listings with a creation timestamp.
///
/// Entries are returned whether or not they are fresh; freshness is decided by
/// the caller with [`CacheEntry::is_fresh`].
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Provisions or verifies the backing table. `false` means the store must be bypassed.
    async fn ensure_ready(&self) -> bool;

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError>;

    /// Upserts on key and stamps `created_at = now`.
    async fn put(&self, key: &str, data: &JsonValue) -> Result<(), StorageError>;

    /// Deletes entries older than `ttl`, returning how many were removed.
    async fn purge_expired(&self, ttl: ChronoDuration) -> Result<u64, StorageError>;

    /// Entries under `prefix` whose data is not marked inactive, oldest first.
    async fn scan_active(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<CacheEntry>, StorageError>;

    /// Rewrites data for an existing key without touching `created_at`.
    async fn update_data(&self, key: &str, data: &JsonValue) -> Result<bool, StorageError>;
}

fn marked_active(data: &JsonValue) -> bool {
    data.get("isActive").and_then(JsonValue::as_bool).unwrap_or(true)
}

#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    unavailable: AtomicBool,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an entry with an explicit timestamp.
    pub async fn insert_entry(&self, entry: CacheEntry) {
        self.entries.write().await.insert(entry.key.clone(), entry);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Simulates an unreachable backend: readiness fails and every call errors.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("memory cache disabled".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn ensure_ready(&self) -> bool {
        self.check().is_ok()
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        self.check()?;
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, data: &JsonValue) -> Result<(), StorageError> {
        self.check()?;
        let entry = CacheEntry {
            key: key.to_string(),
            data: data.clone(),
            created_at: Utc::now(),
        };
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn purge_expired(&self, ttl: ChronoDuration) -> Result<u64, StorageError> {
        self.check()?;
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(now, ttl));
        Ok((before - entries.len()) as u64)
    }

    async fn scan_active(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<CacheEntry>, StorageError> {
        self.check()?;
        let entries = self.entries.read().await;
        let mut active = entries
            .values()
            .filter(|e| e.key.starts_with(prefix) && marked_active(&e.data))
            .cloned()
            .collect::<Vec<_>>();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.key.cmp(&b.key)));
        active.truncate(limit);
        Ok(active)
    }

    async fn update_data(&self, key: &str, data: &JsonValue) -> Result<bool, StorageError> {
        self.check()?;
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) => {
                entry.data = data.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Cache table in Postgres. Schema comes from the crate migrations.
#[derive(Debug, Clone)]
pub struct PgCacheStore {
    pool: PgPool,
}

impl PgCacheStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn provision(&self) -> Result<(), StorageError> {
        MIGRATOR.run(&self.pool).await?;
        sqlx::query("SELECT 1 FROM property_cache LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(())
    }
}

fn entry_from_row(row: &sqlx::postgres::PgRow) -> Result<CacheEntry, StorageError> {
    Ok(CacheEntry {
        key: row.try_get("key")?,
        data: row.try_get("data")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl CacheStore for PgCacheStore {
    async fn ensure_ready(&self) -> bool {
        match self.provision().await {
            Ok(()) => {
                info!("property cache table ready");
                true
            }
            Err(err) => {
                warn!(error = %err, "property cache unavailable; fetching fresh on every request");
                false
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        let row = sqlx::query("SELECT key, data, created_at FROM property_cache WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn put(&self, key: &str, data: &JsonValue) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO property_cache (key, data, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE
            SET data = EXCLUDED.data, created_at = EXCLUDED.created_at
            "#,
        )
        .bind(key)
        .bind(data)
        .execute(&self.pool)
        .await?;
        debug!(key, "cache entry stored");
        Ok(())
    }

    async fn purge_expired(&self, ttl: ChronoDuration) -> Result<u64, StorageError> {
        let cutoff = Utc::now() - ttl;
        let result = sqlx::query("DELETE FROM property_cache WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn scan_active(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<CacheEntry>, StorageError> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let rows = sqlx::query(
            r#"
            SELECT key, data, created_at FROM property_cache
            WHERE key LIKE $1
              AND COALESCE((data->>'isActive')::boolean, TRUE)
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(pattern)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn update_data(&self, key: &str, data: &JsonValue) -> Result<bool, StorageError> {
        let result = sqlx::query("UPDATE property_cache SET data = $2 WHERE key = $1")
            .bind(key)
            .bind(data)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn aged(key: &str, data: JsonValue, age: ChronoDuration) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            data,
            created_at: Utc::now() - age,
        }
    }

    #[test]
    fn ttl_boundary_is_inclusive() {
        let now = Utc::now();
        let ttl = ChronoDuration::hours(12);
        let entry = CacheEntry {
            key: "k".into(),
            data: json!({}),
            created_at: now - ttl,
        };
        assert!(entry.is_fresh(now, ttl));

        let older = CacheEntry {
            created_at: now - ttl - ChronoDuration::seconds(1),
            ..entry
        };
        assert!(!older.is_fresh(now, ttl));
    }

    #[tokio::test]
    async fn put_is_idempotent_and_restamps() {
        let store = MemoryCacheStore::new();
        store.put("search:a", &json!({"v": 1})).await.unwrap();
        let first = store.get("search:a").await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.put("search:a", &json!({"v": 2})).await.unwrap();
        let second = store.get("search:a").await.unwrap().unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(second.data, json!({"v": 2}));
        assert!(second.created_at > first.created_at);
    }

    #[tokio::test]
    async fn purge_removes_only_expired_rows() {
        let store = MemoryCacheStore::new();
        let ttl = ChronoDuration::hours(12);
        store.insert_entry(aged("a", json!({}), ChronoDuration::hours(1))).await;
        store
            .insert_entry(aged("b", json!({}), ttl + ChronoDuration::seconds(1)))
            .await;
        store.insert_entry(aged("c", json!({}), ChronoDuration::days(3))).await;

        assert_eq!(store.purge_expired(ttl).await.unwrap(), 2);
        assert!(store.get("a").await.unwrap().is_some());
        assert!(store.get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scan_active_skips_inactive_and_other_prefixes() {
        let store = MemoryCacheStore::new();
        store
            .insert_entry(aged("property:1", json!({"isActive": true}), ChronoDuration::hours(2)))
            .await;
        store
            .insert_entry(aged("property:2", json!({"isActive": false}), ChronoDuration::hours(1)))
            .await;
        store
            .insert_entry(aged("property:3", json!({"id": "3"}), ChronoDuration::hours(3)))
            .await;
        store
            .insert_entry(aged("search:x", json!({"properties": []}), ChronoDuration::hours(1)))
            .await;

        let active = store.scan_active("property:", 10).await.unwrap();
        let keys = active.iter().map(|e| e.key.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["property:3", "property:1"]);

        let limited = store.scan_active("property:", 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn update_data_preserves_created_at() {
        let store = MemoryCacheStore::new();
        let entry = aged("property:9", json!({"isActive": true}), ChronoDuration::hours(5));
        let created = entry.created_at;
        store.insert_entry(entry).await;

        assert!(store
            .update_data("property:9", &json!({"isActive": false}))
            .await
            .unwrap());
        let updated = store.get("property:9").await.unwrap().unwrap();
        assert_eq!(updated.created_at, created);
        assert_eq!(updated.data, json!({"isActive": false}));
        assert!(!store.update_data("property:missing", &json!({})).await.unwrap());
    }

    #[tokio::test]
    async fn unavailable_store_reports_not_ready() {
        let store = MemoryCacheStore::new();
        assert!(store.ensure_ready().await);
        store.set_unavailable(true);
        assert!(!store.ensure_ready().await);
        assert!(store.get("k").await.is_err());
    }
}
