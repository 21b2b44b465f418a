//! SQLite persistence of harvest checkpoints

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::domain::{CheckpointStore, HarvestCheckpoint, StoreError};

#[derive(Clone)]
pub struct SqliteCheckpointStore {
    pool: Arc<SqlitePool>,
}

impl SqliteCheckpointStore {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self, site: &str, collection_key: &str) -> Result<Option<HarvestCheckpoint>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT last_completed_page, processed_ids, updated_at
            FROM harvest_checkpoints
            WHERE site = ? AND collection_key = ?
            "#,
        )
        .bind(site)
        .bind(collection_key)
        .fetch_optional(&*self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let last_completed_page: i64 = row.try_get("last_completed_page")?;
        let processed_ids: String = row.try_get("processed_ids")?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

        Ok(Some(HarvestCheckpoint {
            site: site.to_string(),
            collection_key: collection_key.to_string(),
            last_completed_page: u32::try_from(last_completed_page).unwrap_or_default(),
            processed_ids: serde_json::from_str::<BTreeSet<String>>(&processed_ids)?,
            updated_at: Some(updated_at),
        }))
    }

    async fn save(&self, checkpoint: &HarvestCheckpoint) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO harvest_checkpoints (site, collection_key, last_completed_page, processed_ids, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (site, collection_key) DO UPDATE SET
                last_completed_page = excluded.last_completed_page,
                processed_ids = excluded.processed_ids,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&checkpoint.site)
        .bind(&checkpoint.collection_key)
        .bind(i64::from(checkpoint.last_completed_page))
        .bind(serde_json::to_string(&checkpoint.processed_ids)?)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn clear(&self, site: &str, collection_key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM harvest_checkpoints WHERE site = ? AND collection_key = ?")
            .bind(site)
            .bind(collection_key)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestDatabase;

    #[tokio::test]
    async fn test_save_load_clear() {
        let db = TestDatabase::new().await.unwrap();
        let store = SqliteCheckpointStore::new(db.shared_pool());
        assert!(store.load("ctrip", "shenzhen").await.unwrap().is_none());

        let mut checkpoint = HarvestCheckpoint::new("ctrip", "shenzhen");
        checkpoint.mark_processed("h-1");
        checkpoint.complete_page(1);
        store.save(&checkpoint).await.unwrap();

        checkpoint.mark_processed("h-2");
        checkpoint.complete_page(2);
        store.save(&checkpoint).await.unwrap();

        let loaded = store.load("ctrip", "shenzhen").await.unwrap().unwrap();
        assert_eq!(loaded.last_completed_page, 2);
        assert_eq!(loaded.processed_ids, checkpoint.processed_ids);
        assert!(loaded.updated_at.is_some());
        assert!(store.load("ctrip", "guangzhou").await.unwrap().is_none());

        store.clear("ctrip", "shenzhen").await.unwrap();
        assert!(store.load("ctrip", "shenzhen").await.unwrap().is_none());
    }
}
