// Database connection and pool management
// This module handles SQLite database connections using sqlx

use anyhow::{Context, Result};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::infrastructure::config::{DatabaseConfig, defaults};

pub struct DatabaseConnection {
    pool: Arc<SqlitePool>,
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

fn file_path_of(database_url: &str) -> &str {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);
    path.split('?').next().unwrap_or(path)
}

impl DatabaseConnection {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_max_connections(database_url, defaults::DATABASE_MAX_CONNECTIONS).await
    }

    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        Self::with_max_connections(&config.url, config.max_connections).await
    }

    async fn with_max_connections(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database url: {database_url}"))?
            .foreign_keys(true);

        // Every pooled connection to `:memory:` would get its own empty
        // database, so in-memory pools are pinned to one long-lived connection
        let pool = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            // Create database file directory if it doesn't exist
            if let Some(parent) = Path::new(file_path_of(database_url))
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
            {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create database directory {parent:?}"))?;
            }
            // Pooled writers wait for each other instead of failing with SQLITE_BUSY
            let options = options
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(defaults::DATABASE_BUSY_TIMEOUT_SECS));
            SqlitePoolOptions::new()
                .max_connections(max_connections.max(1))
                .connect_with(options)
                .await?
        };

        Ok(Self { pool: Arc::new(pool) })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn shared_pool(&self) -> Arc<SqlitePool> {
        Arc::clone(&self.pool)
    }

    pub async fn migrate(&self) -> Result<()> {
        let create_listings_sql = r#"
            CREATE TABLE IF NOT EXISTS listings (
                site TEXT NOT NULL,
                natural_id TEXT NOT NULL,
                fields TEXT NOT NULL DEFAULT '{}',
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                PRIMARY KEY (site, natural_id)
            )
        "#;

        let create_comments_sql = r#"
            CREATE TABLE IF NOT EXISTS comments (
                site TEXT NOT NULL,
                natural_id TEXT NOT NULL,
                listing_id TEXT NOT NULL,
                fields TEXT NOT NULL DEFAULT '{}',
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                PRIMARY KEY (site, natural_id),
                FOREIGN KEY (site, listing_id) REFERENCES listings (site, natural_id) ON DELETE CASCADE
            )
        "#;

        let create_qa_sql = r#"
            CREATE TABLE IF NOT EXISTS qa_entries (
                site TEXT NOT NULL,
                natural_id TEXT NOT NULL,
                listing_id TEXT NOT NULL,
                fields TEXT NOT NULL DEFAULT '{}',
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                PRIMARY KEY (site, natural_id),
                FOREIGN KEY (site, listing_id) REFERENCES listings (site, natural_id) ON DELETE CASCADE
            )
        "#;

        let create_checkpoints_sql = r#"
            CREATE TABLE IF NOT EXISTS harvest_checkpoints (
                site TEXT NOT NULL,
                collection_key TEXT NOT NULL,
                last_completed_page INTEGER NOT NULL DEFAULT 0,
                processed_ids TEXT NOT NULL DEFAULT '[]',
                updated_at DATETIME NOT NULL,
                PRIMARY KEY (site, collection_key)
            )
        "#;

        let create_indexes_sql = [
            "CREATE INDEX IF NOT EXISTS idx_comments_listing ON comments (site, listing_id)",
            "CREATE INDEX IF NOT EXISTS idx_qa_entries_listing ON qa_entries (site, listing_id)",
            "CREATE INDEX IF NOT EXISTS idx_listings_updated_at ON listings (updated_at)",
        ];

        sqlx::query(create_listings_sql).execute(&*self.pool).await?;
        sqlx::query(create_comments_sql).execute(&*self.pool).await?;
        sqlx::query(create_qa_sql).execute(&*self.pool).await?;
        sqlx::query(create_checkpoints_sql).execute(&*self.pool).await?;
        for sql in create_indexes_sql {
            sqlx::query(sql).execute(&*self.pool).await?;
        }

        info!("🗄️ Database schema ready");
        Ok(())
    }
}
