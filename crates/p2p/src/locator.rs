//! IP geolocation capability with a bounded cache.

use std::{net::IpAddr, num::NonZeroUsize, time::Duration};

use async_trait::async_trait;
use lru::LruCache;
use serde::Deserialize;
use tokio::sync::Mutex;

/// Entries kept in the locator cache.
pub const DEFAULT_CACHE_SIZE: usize = 4000;

/// Country and city a peer's IP resolves to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Geolocation {
    /// Country name.
    pub country: String,
    /// City name.
    pub city: String,
}

/// Resolves IPs to locations.
#[async_trait]
pub trait IpLocator: Send + Sync + 'static {
    /// Looks up `ip`. `None` means the lookup failed or was inconclusive;
    /// the crawl carries on without location data.
    async fn locate(&self, ip: IpAddr) -> Option<Geolocation>;
}

/// Locator that never answers; used when lookups are disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLocator;

#[async_trait]
impl IpLocator for NoopLocator {
    async fn locate(&self, _ip: IpAddr) -> Option<Geolocation> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    country: String,
    #[serde(default)]
    city: String,
}

/// Locator backed by the ip-api.com JSON endpoint.
#[derive(Debug, Clone)]
pub struct ApiLocator {
    client: reqwest::Client,
    endpoint: String,
}

impl ApiLocator {
    /// Creates a locator against the public ip-api endpoint.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_endpoint("http://ip-api.com/json")
    }

    /// Creates a locator against a custom endpoint; lookups hit
    /// `<endpoint>/<ip>`.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { client, endpoint: endpoint.into() })
    }
}

#[async_trait]
impl IpLocator for ApiLocator {
    async fn locate(&self, ip: IpAddr) -> Option<Geolocation> {
        let url = format!("{}/{}?fields=status,country,city", self.endpoint, ip);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(target: "crawler::locator", %ip, %err, "location lookup failed");
                return None;
            }
        };
        let body: ApiResponse = match response.json().await {
            Ok(body) => body,
            Err(err) => {
                debug!(target: "crawler::locator", %ip, %err, "undecodable location response");
                return None;
            }
        };
        if body.status != "success" {
            return None;
        }
        Some(Geolocation { country: body.country, city: body.city })
    }
}

/// Bounded LRU cache in front of any locator.
///
/// Failed lookups are not cached, so a flaky upstream gets retried the
/// next time the IP shows up.
pub struct CachedLocator<L> {
    inner: L,
    cache: Mutex<LruCache<IpAddr, Geolocation>>,
}

impl<L: std::fmt::Debug> std::fmt::Debug for CachedLocator<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedLocator").field("inner", &self.inner).finish()
    }
}

impl<L: IpLocator> CachedLocator<L> {
    /// Wraps `inner` with the default cache size.
    pub fn new(inner: L) -> Self {
        Self::with_capacity(inner, DEFAULT_CACHE_SIZE)
    }

    /// Wraps `inner` with a cache of `capacity` entries.
    pub fn with_capacity(inner: L, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("clamped to at least 1");
        Self { inner, cache: Mutex::new(LruCache::new(capacity)) }
    }
}

#[async_trait]
impl<L: IpLocator> IpLocator for CachedLocator<L> {
    async fn locate(&self, ip: IpAddr) -> Option<Geolocation> {
        if let Some(hit) = self.cache.lock().await.get(&ip).cloned() {
            return Some(hit);
        }
        let location = self.inner.locate(ip).await?;
        self.cache.lock().await.put(ip, location.clone());
        Some(location)
    }
}
