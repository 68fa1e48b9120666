//! JSON fetching with response caching and single-flight de-duplication.
//!
//! # Request flow (GET with `use_cache`)
//!
//! ```text
//! fetch_json(url)
//!   ├─ cache hit ──────────────────────────────▶ return cached body
//!   ├─ request for url already in flight ──────▶ await the same future
//!   └─ otherwise: register shared future ─▶ transport.send
//!                                            ├─ classify status / parse JSON
//!                                            ├─ store success in cache
//!                                            └─ drop guard removes in-flight entry
//! ```
//!
//! The in-flight entry is removed by a guard owned by the shared future, so
//! it disappears when the request settles regardless of outcome. The next
//! call after a failure therefore issues a fresh request.
//!
//! Non-GET requests and GETs with `use_cache = false` skip both the cache
//! and the in-flight table. Nothing here retries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::cache::TimedLru;
use crate::config::CacheSegmentConfig;
use crate::error::{Error, Result};
use crate::transport::{HttpRequest, Method, Transport};

type PendingFetch = Shared<BoxFuture<'static, Result<Arc<Value>>>>;
type InflightTable = Mutex<HashMap<String, (u64, PendingFetch)>>;

/// Per-request options for [`FetchCache::fetch_json`].
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Serve from / store into the response cache (GET only).
    pub use_cache: bool,
    /// Returned instead of an error when the request fails.
    pub default_value: Option<Value>,
    /// Return `{"success": false, "error", "data"}` instead of an error.
    pub return_error_object: bool,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    /// JSON body for non-GET requests.
    pub body: Option<Value>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            default_value: None,
            return_error_object: false,
            method: Method::Get,
            headers: Vec::new(),
            body: None,
        }
    }
}

impl FetchOptions {
    pub fn no_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn error_object(mut self) -> Self {
        self.return_error_object = true;
        self
    }

    pub fn post(body: Value) -> Self {
        Self {
            method: Method::Post,
            body: Some(body),
            ..Self::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn is_cacheable(&self) -> bool {
        self.method == Method::Get && self.use_cache
    }
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchStats {
    pub cached: usize,
    pub in_flight: usize,
}

/// Response cache plus in-flight table, scoped to one client unless the
/// same `Arc<FetchCache>` is handed to several.
pub struct FetchCache {
    transport: Arc<dyn Transport>,
    cache: Arc<TimedLru<Arc<Value>>>,
    inflight: Arc<InflightTable>,
    generation: AtomicU64,
}

/// Removes an in-flight entry when the owning future completes or is dropped.
/// The table owns the future, so the guard only points back weakly.
struct InflightGuard {
    table: Weak<InflightTable>,
    url: String,
    id: u64,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let removed = {
            let mut table = table.lock();
            match table.get(&self.url) {
                Some((id, _)) if *id == self.id => table.remove(&self.url),
                _ => None,
            }
        };
        // dropped outside the lock: the last handle may own another guard
        drop(removed);
    }
}

impl FetchCache {
    pub fn new(transport: Arc<dyn Transport>, config: &CacheSegmentConfig) -> Self {
        Self {
            transport,
            cache: Arc::new(TimedLru::from_config(config)),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Fetch `url` and parse the body as JSON.
    ///
    /// # Errors
    ///
    /// Classified HTTP, JSON, or network errors, unless `default_value` or
    /// `return_error_object` is set, in which case failures are converted.
    pub async fn fetch_json(&self, url: &str, options: &FetchOptions) -> Result<Arc<Value>> {
        match self.fetch_raw(url, options).await {
            Ok(value) => Ok(value),
            Err(err) => recover(url, err, options),
        }
    }

    /// [`fetch_json`](Self::fetch_json) followed by typed deserialization.
    pub async fn fetch_as<T: DeserializeOwned>(&self, url: &str, options: &FetchOptions) -> Result<T> {
        let value = self.fetch_json(url, options).await?;
        T::deserialize(value.as_ref()).map_err(|e| Error::Json {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    async fn fetch_raw(&self, url: &str, options: &FetchOptions) -> Result<Arc<Value>> {
        if !options.is_cacheable() {
            let request = build_request(url, options)?;
            return request_json(self.transport.as_ref(), request).await;
        }

        if let Some(hit) = self.cache.get(url) {
            debug!(url, "fetch cache hit");
            return Ok(hit);
        }

        let pending = {
            let mut inflight = self.inflight.lock();
            match inflight.get(url) {
                Some((_, pending)) => {
                    debug!(url, "joining in-flight request");
                    pending.clone()
                }
                None => {
                    let id = self.generation.fetch_add(1, Ordering::Relaxed);
                    let pending = self.start_get(url, id);
                    inflight.insert(url.to_string(), (id, pending.clone()));
                    pending
                }
            }
        };

        pending.await
    }

    fn start_get(&self, url: &str, id: u64) -> PendingFetch {
        let transport = Arc::clone(&self.transport);
        let cache = Arc::clone(&self.cache);
        let guard = InflightGuard {
            table: Arc::downgrade(&self.inflight),
            url: url.to_string(),
            id,
        };
        let url = url.to_string();

        async move {
            let _guard = guard;
            debug!(url = %url, "fetch cache miss");
            let value = request_json(transport.as_ref(), HttpRequest::get(url.clone())).await?;
            cache.insert(url, Arc::clone(&value));
            Ok(value)
        }
        .boxed()
        .shared()
    }

    /// Drop every cached response and forget in-flight requests. Callers
    /// already awaiting a request still receive its result.
    pub fn clear(&self) {
        self.cache.clear();
        let pending = std::mem::take(&mut *self.inflight.lock());
        drop(pending);
    }

    /// Remove one cached response.
    pub fn invalidate(&self, url: &str) {
        self.cache.remove(url);
    }

    pub fn stats(&self) -> FetchStats {
        FetchStats {
            cached: self.cache.len(),
            in_flight: self.inflight.lock().len(),
        }
    }
}

fn recover(url: &str, err: Error, options: &FetchOptions) -> Result<Arc<Value>> {
    if options.return_error_object {
        warn!(url, error = %err, "fetch failed, returning error object");
        return Ok(Arc::new(json!({
            "success": false,
            "error": err.to_string(),
            "data": options.default_value.clone().unwrap_or(Value::Null),
        })));
    }
    if let Some(default) = &options.default_value {
        debug!(url, error = %err, "fetch failed, using default value");
        return Ok(Arc::new(default.clone()));
    }
    Err(err)
}

fn build_request(url: &str, options: &FetchOptions) -> Result<HttpRequest> {
    let mut headers = options.headers.clone();
    let body = match &options.body {
        Some(body) => {
            if !headers
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            {
                headers.push(("Content-Type".to_string(), "application/json".to_string()));
            }
            Some(serde_json::to_string(body).map_err(|e| {
                Error::Validation(format!("request body is not serializable: {}", e))
            })?)
        }
        None => None,
    };

    Ok(HttpRequest {
        method: options.method,
        url: url.to_string(),
        headers,
        body,
    })
}

async fn request_json(transport: &dyn Transport, request: HttpRequest) -> Result<Arc<Value>> {
    let url = request.url.clone();
    let response = transport.send(request).await?;

    if !response.is_success() {
        return Err(Error::from_status(response.status, &url));
    }

    if response.body.trim().is_empty() {
        return Ok(Arc::new(Value::Null));
    }

    let value: Value = serde_json::from_str(&response.body).map_err(|e| Error::Json {
        url,
        message: e.to_string(),
    })?;
    Ok(Arc::new(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::InMemoryTransport;
    use std::time::Duration;

    const URL: &str = "https://store.test/r1/posts.json";

    fn setup(latency_ms: u64) -> (Arc<InMemoryTransport>, FetchCache) {
        let transport =
            Arc::new(InMemoryTransport::new().with_latency(Duration::from_millis(latency_ms)));
        let fetch = FetchCache::new(transport.clone(), &CacheSegmentConfig::new(100, 3600));
        (transport, fetch)
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_request() {
        let (transport, fetch) = setup(20);
        transport.json(URL, json!([{"hash": "h1"}]));

        let opts = FetchOptions::default();
        let results =
            futures::future::join_all((0..10).map(|_| fetch.fetch_json(URL, &opts))).await;

        assert_eq!(transport.calls(URL), 1);
        for r in &results {
            assert_eq!(r.as_ref().unwrap().as_ref(), &json!([{"hash": "h1"}]));
        }
        assert_eq!(fetch.stats().in_flight, 0);

        fetch.fetch_json(URL, &opts).await.unwrap();
        assert_eq!(transport.calls(URL), 1, "second call is a cache hit");
    }

    #[tokio::test]
    async fn test_shared_failure_is_cleaned_up() {
        let (transport, fetch) = setup(20);
        transport.raw(URL, 500, "boom");

        let opts = FetchOptions::default();
        let results =
            futures::future::join_all((0..3).map(|_| fetch.fetch_json(URL, &opts))).await;

        assert_eq!(transport.calls(URL), 1);
        for r in results {
            assert_eq!(r.unwrap_err().status(), Some(500));
        }
        assert_eq!(fetch.stats(), FetchStats { cached: 0, in_flight: 0 });

        // failures are not cached: the next call goes back to the network
        let _ = fetch.fetch_json(URL, &opts).await;
        assert_eq!(transport.calls(URL), 2);
    }

    #[tokio::test]
    async fn test_non_get_bypasses_cache_and_dedup() {
        let (transport, fetch) = setup(5);
        transport.json(URL, json!({"ok": true}));

        let opts = FetchOptions::post(json!({"q": 1}));
        let _ = futures::future::join(fetch.fetch_json(URL, &opts), fetch.fetch_json(URL, &opts))
            .await;
        assert_eq!(transport.calls(URL), 2);
        assert_eq!(fetch.stats().cached, 0);

        let request = &transport.requests()[0];
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.body.as_deref(), Some(r#"{"q":1}"#));
        assert!(request
            .headers
            .contains(&("Content-Type".to_string(), "application/json".to_string())));
    }

    #[tokio::test]
    async fn test_no_cache_get_always_fetches() {
        let (transport, fetch) = setup(0);
        transport.json(URL, json!(1));
        let opts = FetchOptions::default().no_cache();
        fetch.fetch_json(URL, &opts).await.unwrap();
        fetch.fetch_json(URL, &opts).await.unwrap();
        assert_eq!(transport.calls(URL), 2);
    }

    #[tokio::test]
    async fn test_malformed_json() {
        let (transport, fetch) = setup(0);
        transport.raw(URL, 200, "{not json");
        let err = fetch
            .fetch_json(URL, &FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Json { .. }));
    }

    #[tokio::test]
    async fn test_default_value_and_error_object() {
        let (transport, fetch) = setup(0);
        transport.raw(URL, 404, "");

        let value = fetch
            .fetch_json(URL, &FetchOptions::default().with_default(json!({})))
            .await
            .unwrap();
        assert_eq!(value.as_ref(), &json!({}));

        let value = fetch
            .fetch_json(
                URL,
                &FetchOptions::default().with_default(json!([])).error_object(),
            )
            .await
            .unwrap();
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["data"], json!([]));
        assert!(value["error"].as_str().unwrap().contains("404"));
    }

    #[tokio::test]
    async fn test_network_error_propagates() {
        let (transport, fetch) = setup(0);
        transport.network_error(URL, "connection reset");
        let err = fetch
            .fetch_json(URL, &FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_fetch_as_typed() {
        let (transport, fetch) = setup(0);
        transport.json(URL, json!({"a": "b"}));
        let map: HashMap<String, String> = fetch
            .fetch_as(URL, &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(map["a"], "b");

        let err = fetch
            .fetch_as::<Vec<u32>>(URL, &FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Json { .. }));
    }

    #[tokio::test]
    async fn test_clear_drops_cached_responses() {
        let (transport, fetch) = setup(0);
        transport.json(URL, json!(1));
        fetch.fetch_json(URL, &FetchOptions::default()).await.unwrap();
        assert_eq!(fetch.stats().cached, 1);
        fetch.clear();
        assert_eq!(fetch.stats().cached, 0);
        fetch.fetch_json(URL, &FetchOptions::default()).await.unwrap();
        assert_eq!(transport.calls(URL), 2);
    }

    #[tokio::test]
    async fn test_abandoned_request_does_not_outlive_cache() {
        let (transport, fetch) = setup(50);
        transport.json(URL, json!([]));
        let fetch = Arc::new(fetch);

        let caller = Arc::clone(&fetch);
        let handle = tokio::spawn(async move {
            let _ = caller.fetch_json(URL, &FetchOptions::default()).await;
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        handle.abort();
        let _ = handle.await;
        assert_eq!(fetch.stats().in_flight, 1);

        drop(fetch);
        assert_eq!(Arc::strong_count(&transport), 1);
    }
}
