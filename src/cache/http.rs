use super::{CacheEntry, CacheStore, Resilience};
use crate::config::CacheConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// Cache store behind a remote HTTP service.
///
/// `GET {url}/{hash}` answers an entry or 404; `POST {url}/{hash}/store`
/// stores one.
pub struct HttpCacheStore {
    client: Client,
    base_url: String,
    timeout: Duration,
    policy: Resilience,
}

impl HttpCacheStore {
    pub fn new(base_url: &str, config: &CacheConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_seconds),
            policy: Resilience::from_config(config),
        }
    }

    async fn fetch(&self, hash: &str) -> Result<Option<CacheEntry>> {
        let url = format!("{}/{}", self.base_url, hash);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .with_context(|| format!("Failed to reach cache at {}", url))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            anyhow::bail!("Cache lookup failed: {}", response.status());
        }

        // Some stores answer an empty body or `null` for unknown keys.
        let body = response.text().await.context("Failed to read cache response")?;
        if body.trim().is_empty() || body.trim() == "null" {
            return Ok(None);
        }
        let entry = serde_json::from_str(&body).context("Failed to parse cache entry")?;
        Ok(Some(entry))
    }

    async fn store(&self, hash: &str, entry: &CacheEntry) -> Result<()> {
        let url = format!("{}/{}/store", self.base_url, hash);
        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(entry)
            .send()
            .await
            .with_context(|| format!("Failed to reach cache at {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Cache store failed: {} - {}", status, body);
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for HttpCacheStore {
    async fn get(&self, hash: &str) -> Option<CacheEntry> {
        self.policy
            .run("Cache lookup", || self.fetch(hash))
            .await
            .flatten()
    }

    async fn put(&self, hash: &str, entry: &CacheEntry) {
        if self
            .policy
            .run("Cache store", || self.store(hash, entry))
            .await
            .is_some()
        {
            tracing::info!("Stored result {} in remote cache", hash);
        }
    }
}
