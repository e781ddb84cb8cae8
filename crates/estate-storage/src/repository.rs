use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use estate_core::{ImportedProperty, Property};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tokio::sync::RwLock;
use tracing::info;

use crate::cache::StorageError;

/// Postgres bind parameters are capped at 65535 per statement; six per row.
const INSERT_CHUNK: usize = 1000;

/// Persistence for explicitly imported listings.
#[async_trait]
pub trait PropertyRepository: Send + Sync {
    /// Inserts every record or none of them.
    async fn insert_batch(&self, records: &[ImportedProperty]) -> Result<usize, StorageError>;

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<ImportedProperty>, StorageError>;
}

#[derive(Debug, Clone)]
pub struct PgPropertyRepository {
    pool: PgPool,
}

impl PgPropertyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PropertyRepository for PgPropertyRepository {
    async fn insert_batch(&self, records: &[ImportedProperty]) -> Result<usize, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            rows.push((record, serde_json::to_value(&record.property)?));
        }

        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO imported_properties (owner_id, property_id, data, is_synthetic, created_at, updated_at) ",
            );
            builder.push_values(chunk, |mut b, (record, data)| {
                b.push_bind(&record.owner_id)
                    .push_bind(&record.property.id)
                    .push_bind(data)
                    .push_bind(record.property.is_synthetic)
                    .push_bind(record.created_at)
                    .push_bind(record.updated_at);
            });
            builder.push(
                " ON CONFLICT (owner_id, property_id) DO UPDATE \
                 SET data = EXCLUDED.data, is_synthetic = EXCLUDED.is_synthetic, updated_at = EXCLUDED.updated_at",
            );
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        info!(count = records.len(), "imported properties persisted");
        Ok(records.len())
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<ImportedProperty>, StorageError> {
        let rows = sqlx::query(
            "SELECT owner_id, data, created_at, updated_at FROM imported_properties \
             WHERE owner_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let data: serde_json::Value = row.try_get("data")?;
                let created_at: DateTime<Utc> = row.try_get("created_at")?;
                let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
                Ok(ImportedProperty {
                    owner_id: row.try_get("owner_id")?,
                    created_at,
                    updated_at,
                    property: serde_json::from_value::<Property>(data)?,
                })
            })
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct MemoryPropertyRepository {
    rows: RwLock<Vec<ImportedProperty>>,
    failing: AtomicBool,
}

impl MemoryPropertyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next inserts fail as a whole, like an aborted transaction.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl PropertyRepository for MemoryPropertyRepository {
    async fn insert_batch(&self, records: &[ImportedProperty]) -> Result<usize, StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("import transaction aborted".to_string()));
        }
        let mut rows = self.rows.write().await;
        for record in records {
            match rows.iter_mut().find(|r| {
                r.owner_id == record.owner_id && r.property.id == record.property.id
            }) {
                Some(existing) => {
                    existing.property = record.property.clone();
                    existing.updated_at = record.updated_at;
                }
                None => rows.push(record.clone()),
            }
        }
        Ok(records.len())
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<ImportedProperty>, StorageError> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, owner: &str) -> ImportedProperty {
        let property = estate_core::normalize(&json!({"id": id, "address": "1 Test Lane"}));
        ImportedProperty::tag(property, owner, Utc::now())
    }

    #[tokio::test]
    async fn failed_batch_persists_nothing() {
        let repo = MemoryPropertyRepository::new();
        repo.set_failing(true);
        let batch = vec![record("1", "owner-a"), record("2", "owner-a")];
        assert!(repo.insert_batch(&batch).await.is_err());
        assert!(repo.is_empty().await);

        repo.set_failing(false);
        assert_eq!(repo.insert_batch(&batch).await.unwrap(), 2);
        assert_eq!(repo.list_by_owner("owner-a").await.unwrap().len(), 2);
        assert!(repo.list_by_owner("owner-b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reimport_updates_in_place() {
        let repo = MemoryPropertyRepository::new();
        repo.insert_batch(&[record("1", "owner-a")]).await.unwrap();
        let mut again = record("1", "owner-a");
        again.property.price = 300_000;
        repo.insert_batch(&[again]).await.unwrap();

        let rows = repo.list_by_owner("owner-a").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].property.price, 300_000);
    }
}
