//! Catalog provider contract and the process-local TTL cache in front of it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub code: String,
    pub name: String,
    pub price: f64,
    pub stock: u32,
}

/// Read contract against the catalog collaborator.
#[async_trait]
pub trait CatalogProvider: Send + Sync {
    async fn fetch(&self) -> Result<Vec<CatalogItem>>;
}

/// HTTP catalog provider: `GET {url}` returning a JSON array of items.
pub struct HttpCatalogProvider {
    http: reqwest::Client,
    url: String,
    auth_token: Option<String>,
}

impl HttpCatalogProvider {
    pub fn new(url: &str, auth_token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("catalog http client build failed")?;
        Ok(Self {
            http,
            url: url.to_string(),
            auth_token,
        })
    }
}

#[async_trait]
impl CatalogProvider for HttpCatalogProvider {
    async fn fetch(&self) -> Result<Vec<CatalogItem>> {
        let mut request = self.http.get(&self.url);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.context("catalog fetch failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("catalog fetch status={status} body={body}");
        }
        let items: Vec<CatalogItem> = response
            .json()
            .await
            .context("catalog payload decode failed")?;
        tracing::info!(items = items.len(), "catalog fetched");
        Ok(items)
    }
}

struct Snapshot {
    items: Arc<Vec<CatalogItem>>,
    fetched_at: Instant,
}

/// TTL cache over a [`CatalogProvider`]. Stale reads within the TTL are
/// tolerated by design; when a refresh fails, the last good snapshot keeps
/// serving so the pipeline degrades instead of stalling.
pub struct CatalogCache {
    provider: Arc<dyn CatalogProvider>,
    ttl: Duration,
    snapshot: RwLock<Option<Snapshot>>,
}

impl CatalogCache {
    pub fn new(provider: Arc<dyn CatalogProvider>, ttl: Duration) -> Self {
        Self {
            provider,
            ttl,
            snapshot: RwLock::new(None),
        }
    }

    pub async fn items(&self) -> Result<Arc<Vec<CatalogItem>>> {
        {
            let guard = self.snapshot.read().await;
            if let Some(snapshot) = guard.as_ref() {
                if snapshot.fetched_at.elapsed() < self.ttl {
                    return Ok(snapshot.items.clone());
                }
            }
        }

        let mut guard = self.snapshot.write().await;
        // Another task may have refreshed while this one waited for the lock.
        if let Some(snapshot) = guard.as_ref() {
            if snapshot.fetched_at.elapsed() < self.ttl {
                return Ok(snapshot.items.clone());
            }
        }

        match self.provider.fetch().await {
            Ok(items) => {
                let items = Arc::new(items);
                *guard = Some(Snapshot {
                    items: items.clone(),
                    fetched_at: Instant::now(),
                });
                Ok(items)
            }
            Err(e) => match guard.as_ref() {
                Some(stale) => {
                    tracing::warn!(%e, "catalog refresh failed, serving stale snapshot");
                    Ok(stale.items.clone())
                }
                None => Err(e.context("catalog unavailable and no cached snapshot")),
            },
        }
    }
}
