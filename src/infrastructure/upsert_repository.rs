//! SQLite upsert store for listings, comments and Q&A rows
//!
//! Rows are keyed by `(site, natural_id)`. Every write is one
//! `INSERT .. ON CONFLICT DO UPDATE` statement: supplied fields are merged
//! over the stored ones with `json_patch` (a `null` field removes the key),
//! `created_at` is set once and `updated_at` never moves backwards. Child
//! rows are inserted only when their listing exists.

#![allow(clippy::uninlined_format_args)]

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use std::sync::Arc;
use tracing::debug;

use crate::domain::{Fields, RecordKind, StoreError, StoredRecord, UpsertStore, Written};

#[derive(Clone)]
pub struct SqliteUpsertStore {
    pool: Arc<SqlitePool>,
    site: String,
}

impl SqliteUpsertStore {
    pub fn new(pool: Arc<SqlitePool>, site: impl Into<String>) -> Self {
        Self {
            pool,
            site: site.into(),
        }
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    const fn parent_column(kind: RecordKind) -> &'static str {
        if kind.requires_parent() {
            "listing_id"
        } else {
            "NULL AS listing_id"
        }
    }

    fn row_to_record(kind: RecordKind, row: &SqliteRow) -> Result<StoredRecord, StoreError> {
        let fields: String = row.try_get("fields")?;
        Ok(StoredRecord {
            kind,
            natural_id: row.try_get("natural_id")?,
            parent_id: row.try_get("listing_id")?,
            fields: serde_json::from_str(&fields)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn orphan(kind: RecordKind, natural_id: &str, parent_ref: Option<&str>) -> StoreError {
        StoreError::OrphanRecord {
            kind,
            natural_id: natural_id.to_string(),
            parent_id: parent_ref.map(ToString::to_string),
        }
    }
}

fn listing_upsert_sql(table: &str) -> String {
    format!(
        r#"
        INSERT INTO {t} (site, natural_id, fields, created_at, updated_at)
        VALUES (?, ?, json(?), ?, ?)
        ON CONFLICT (site, natural_id) DO UPDATE SET
            fields = json_patch({t}.fields, excluded.fields),
            updated_at = MAX({t}.updated_at, excluded.updated_at)
        RETURNING created_at = ? AS created
        "#,
        t = table
    )
}

/// The `WHERE EXISTS` guard keeps the parent check and the write in one statement
fn child_upsert_sql(table: &str) -> String {
    format!(
        r#"
        INSERT INTO {t} (site, natural_id, listing_id, fields, created_at, updated_at)
        SELECT ?, ?, ?, json(?), ?, ?
        WHERE EXISTS (SELECT 1 FROM listings WHERE site = ? AND natural_id = ?)
        ON CONFLICT (site, natural_id) DO UPDATE SET
            listing_id = excluded.listing_id,
            fields = json_patch({t}.fields, excluded.fields),
            updated_at = MAX({t}.updated_at, excluded.updated_at)
        RETURNING created_at = ? AS created
        "#,
        t = table
    )
}

#[async_trait]
impl UpsertStore for SqliteUpsertStore {
    async fn upsert(
        &self,
        kind: RecordKind,
        natural_id: &str,
        fields: &Fields,
        parent_ref: Option<&str>,
    ) -> Result<Written, StoreError> {
        let table = kind.table();
        let payload = serde_json::to_string(fields)?;
        let now = Utc::now();

        let row = if kind.requires_parent() {
            let Some(parent_id) = parent_ref else {
                return Err(Self::orphan(kind, natural_id, parent_ref));
            };
            sqlx::query(&child_upsert_sql(table))
                .bind(&self.site)
                .bind(natural_id)
                .bind(parent_id)
                .bind(payload)
                .bind(now)
                .bind(now)
                .bind(&self.site)
                .bind(parent_id)
                .bind(now)
                .fetch_optional(&*self.pool)
                .await?
        } else {
            sqlx::query(&listing_upsert_sql(table))
                .bind(&self.site)
                .bind(natural_id)
                .bind(payload)
                .bind(now)
                .bind(now)
                .bind(now)
                .fetch_optional(&*self.pool)
                .await?
        };

        let Some(row) = row else {
            return Err(Self::orphan(kind, natural_id, parent_ref));
        };
        // an insert stores the stamp bound above, an update keeps the earlier one
        let created: bool = row.try_get("created")?;
        let written = if created { Written::Created } else { Written::Updated };

        debug!(site = %self.site, %kind, natural_id, ?written, "Upserted record");
        Ok(written)
    }

    async fn get(&self, kind: RecordKind, natural_id: &str) -> Result<Option<StoredRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT natural_id, {}, fields, created_at, updated_at FROM {} WHERE site = ? AND natural_id = ?",
            Self::parent_column(kind),
            kind.table()
        ))
        .bind(&self.site)
        .bind(natural_id)
        .fetch_optional(&*self.pool)
        .await?;

        row.map(|row| Self::row_to_record(kind, &row)).transpose()
    }

    async fn count(&self, kind: RecordKind) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {} WHERE site = ?", kind.table()))
            .bind(&self.site)
            .fetch_one(&*self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn children_of(&self, kind: RecordKind, listing_id: &str) -> Result<Vec<StoredRecord>, StoreError> {
        if !kind.requires_parent() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT natural_id, listing_id, fields, created_at, updated_at FROM {} WHERE site = ? AND listing_id = ? ORDER BY natural_id",
            kind.table()
        ))
        .bind(&self.site)
        .bind(listing_id)
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(|row| Self::row_to_record(kind, row)).collect()
    }
}
