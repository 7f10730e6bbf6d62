use super::{CacheEntry, CacheStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePoolOptions, FromRow, Pool, Sqlite};
use std::path::Path;

/// A stored cache row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CacheRow {
    pub hash: String,
    pub entry: String,
    pub created_at: String,
}

/// Cache store in a local SQLite database
#[derive(Clone)]
pub struct SqliteCacheStore {
    pool: Pool<Sqlite>,
}

impl SqliteCacheStore {
    /// Open (or create) the database at `path`
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory: {:?}", parent))?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .with_context(|| format!("Failed to connect to database: {}", database_url))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                hash TEXT PRIMARY KEY,
                entry TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create cache_entries table")?;

        Ok(())
    }

    /// Fetch the entry stored under `hash`
    pub async fn load(&self, hash: &str) -> Result<Option<CacheEntry>> {
        let row = sqlx::query_as::<_, CacheRow>("SELECT * FROM cache_entries WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch cache entry")?;

        row.map(|row| {
            serde_json::from_str(&row.entry)
                .with_context(|| format!("Corrupt cache entry for {}", row.hash))
        })
        .transpose()
    }

    /// Store an entry, replacing any previous one
    pub async fn store(&self, hash: &str, entry: &CacheEntry) -> Result<()> {
        let json = serde_json::to_string(entry).context("Failed to serialize cache entry")?;

        sqlx::query(
            r#"
            INSERT INTO cache_entries (hash, entry) VALUES (?, ?)
            ON CONFLICT(hash) DO UPDATE SET entry = excluded.entry, created_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(hash)
        .bind(json)
        .execute(&self.pool)
        .await
        .context("Failed to store cache entry")?;

        Ok(())
    }

    /// Number of stored entries
    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cache_entries")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count cache entries")?;

        Ok(count)
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn get(&self, hash: &str) -> Option<CacheEntry> {
        match self.load(hash).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Cache lookup failed: {:#}", e);
                None
            }
        }
    }

    async fn put(&self, hash: &str, entry: &CacheEntry) {
        match self.store(hash, entry).await {
            Ok(()) => tracing::info!("Stored result {} in local cache", hash),
            Err(e) => tracing::warn!("Cache store failed: {:#}", e),
        }
    }
}
