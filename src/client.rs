//! The client facade.
//!
//! [`RepoClient`] wires one fetch cache, one revision resolver, and the
//! post/media/similarity/search subsystems together for a single project.
//! Each client owns its caches; pass the same [`FetchCache`] to several
//! builders to share HTTP responses between them.
//!
//! ```rust,no_run
//! # use repo_client::client::RepoClient;
//! # use repo_client::config::ClientConfig;
//! # async fn demo() -> repo_client::error::Result<()> {
//! let config = ClientConfig::new("acme", "blog", "https://store.example.com", "https://api.example.com");
//! let client = RepoClient::new(config)?;
//! if let Some(post) = client.get_post_by_slug("hello-world").await? {
//!     println!("{:?}", post.title);
//! }
//! client.destroy();
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use repo_client_core::models::{KeyKind, MediaItem, Post};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::embedding::{create_embedder, Embedder};
use crate::error::{Error, Result};
use crate::fetch::{FetchCache, FetchOptions, FetchStats};
use crate::retrieval::{AugmentOptions, EntityStore, MEDIA, POSTS};
use crate::revision::RevisionResolver;
use crate::search::{SearchEngine, SearchRequest, SearchResult};
use crate::similarity::{EmbeddingTables, SimilarityEngine};
use crate::tasks::BackgroundTasks;
use crate::transport::{ReqwestTransport, Transport};
use crate::urls::{ProxyConfig, UrlBuilder};

/// Builder for [`RepoClient`] with injectable collaborators.
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    embedder: Option<Arc<dyn Embedder>>,
    fetch: Option<Arc<FetchCache>>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            embedder: None,
            fetch: None,
        }
    }

    /// Transport for all requests (default: reqwest).
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Embedder for vector search (default: from `[embedding]`).
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Share an existing fetch cache. Its transport is used and
    /// [`transport`](Self::transport) is ignored.
    pub fn fetch_cache(mut self, fetch: Arc<FetchCache>) -> Self {
        self.fetch = Some(fetch);
        self
    }

    pub fn build(self) -> Result<RepoClient> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| Error::Validation(e.to_string()))?;

        let urls = Arc::new(UrlBuilder::new(&config)?);
        let shared_fetch = self.fetch.is_some();
        let fetch = match self.fetch {
            Some(fetch) => fetch,
            None => {
                let transport: Arc<dyn Transport> = match self.transport {
                    Some(transport) => transport,
                    None => Arc::new(ReqwestTransport::new(Duration::from_secs(
                        config.http.timeout_secs,
                    ))?),
                };
                Arc::new(FetchCache::new(transport, &config.cache.http))
            }
        };
        let embedder = match self.embedder {
            Some(embedder) => embedder,
            None => create_embedder(&config.embedding, Arc::clone(&fetch))?,
        };

        let tasks = Arc::new(BackgroundTasks::new());
        let resolver = RevisionResolver::new(
            config.revision.clone(),
            &urls,
            Arc::clone(&fetch),
            config.resolver.ttl(),
        );

        let posts = EntityStore::new(
            POSTS,
            Arc::clone(&fetch),
            resolver.clone(),
            Arc::clone(&urls),
            config.retrieval.clone(),
            &config.cache.posts,
            Arc::clone(&tasks),
        );
        let media = EntityStore::new(
            MEDIA,
            Arc::clone(&fetch),
            resolver.clone(),
            Arc::clone(&urls),
            config.retrieval.clone(),
            &config.cache.media,
            Arc::clone(&tasks),
        );

        let embeddings = Arc::new(EmbeddingTables::new(Arc::clone(&fetch), Arc::clone(&urls)));
        let similarity = SimilarityEngine::new(
            Arc::clone(&fetch),
            Arc::clone(&urls),
            resolver.clone(),
            posts.clone(),
            Arc::clone(&embeddings),
            &config.cache.similarity,
        );
        let search = SearchEngine::new(
            posts.clone(),
            media.clone(),
            resolver.clone(),
            Arc::clone(&embeddings),
            embedder,
            config.search.clone(),
        );

        let id = Uuid::new_v4();
        info!(
            client = %id,
            org = %config.org_slug,
            project = %config.project_id,
            revision = %config.revision,
            "client created"
        );

        if config.resolver.prime_on_start {
            resolver.prime(&tasks);
        }

        Ok(RepoClient {
            id,
            config,
            urls,
            fetch,
            shared_fetch,
            resolver,
            posts,
            media,
            embeddings,
            similarity,
            search,
            tasks,
            destroyed: AtomicBool::new(false),
        })
    }
}

/// Revision-aware client for one project.
pub struct RepoClient {
    id: Uuid,
    config: ClientConfig,
    urls: Arc<UrlBuilder>,
    fetch: Arc<FetchCache>,
    shared_fetch: bool,
    resolver: RevisionResolver,
    posts: EntityStore<Post>,
    media: EntityStore<MediaItem>,
    embeddings: Arc<EmbeddingTables>,
    similarity: SimilarityEngine,
    search: SearchEngine,
    tasks: Arc<BackgroundTasks>,
    destroyed: AtomicBool,
}

impl RepoClient {
    /// Client with the default reqwest transport and configured embedder.
    pub fn new(config: ClientConfig) -> Result<Self> {
        ClientBuilder::new(config).build()
    }

    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Random id distinguishing this instance in logs.
    pub fn instance_id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn urls(&self) -> &UrlBuilder {
        &self.urls
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::Destroyed);
        }
        Ok(())
    }

    // ── revision ────────────────────────────────────────────────────

    /// The concrete revision currently served.
    pub async fn resolve_revision(&self) -> Result<String> {
        self.ensure_alive()?;
        self.resolver.resolve().await
    }

    // ── posts ───────────────────────────────────────────────────────

    pub async fn get_post_by_slug(&self, slug: &str) -> Result<Option<Post>> {
        self.ensure_alive()?;
        self.posts.get_by_slug(slug).await
    }

    pub async fn get_post_by_hash(&self, hash: &str) -> Result<Option<Post>> {
        self.ensure_alive()?;
        self.posts.get_by_hash(hash).await
    }

    pub async fn get_post_by_path(&self, path: &str) -> Result<Option<Post>> {
        self.ensure_alive()?;
        self.posts.get_by_path(path).await
    }

    pub async fn get_all_posts(&self, use_cache: bool, force_refresh: bool) -> Result<Arc<Vec<Post>>> {
        self.ensure_alive()?;
        self.posts.get_all(use_cache, force_refresh).await
    }

    pub async fn get_recent_posts(&self, count: usize) -> Result<Vec<Post>> {
        self.ensure_alive()?;
        self.posts.get_recent(count).await
    }

    pub async fn augment_posts(
        &self,
        keys: &[String],
        kind: KeyKind,
        options: &AugmentOptions,
    ) -> Result<Vec<Post>> {
        self.ensure_alive()?;
        self.posts.augment_by_keys(keys, kind, options).await
    }

    // ── media ───────────────────────────────────────────────────────

    pub async fn get_media_by_hash(&self, hash: &str) -> Result<Option<MediaItem>> {
        self.ensure_alive()?;
        self.media.get_by_hash(hash).await
    }

    pub async fn get_media_by_path(&self, path: &str) -> Result<Option<MediaItem>> {
        self.ensure_alive()?;
        self.media.get_by_path(path).await
    }

    pub async fn get_media_by_slug(&self, slug: &str) -> Result<Option<MediaItem>> {
        self.ensure_alive()?;
        self.media.get_by_slug(slug).await
    }

    pub async fn get_all_media(&self, use_cache: bool, force_refresh: bool) -> Result<Arc<Vec<MediaItem>>> {
        self.ensure_alive()?;
        self.media.get_all(use_cache, force_refresh).await
    }

    pub async fn augment_media(
        &self,
        keys: &[String],
        kind: KeyKind,
        options: &AugmentOptions,
    ) -> Result<Vec<MediaItem>> {
        self.ensure_alive()?;
        self.media.augment_by_keys(keys, kind, options).await
    }

    // ── similarity ──────────────────────────────────────────────────

    pub async fn similarity_by_hashes(&self, a: &str, b: &str) -> Result<f64> {
        self.ensure_alive()?;
        self.similarity.similarity_by_hashes(a, b).await
    }

    pub async fn top_similar_hashes(&self, hash: &str, limit: usize) -> Result<Vec<String>> {
        self.ensure_alive()?;
        self.similarity.top_similar_hashes_for(hash, limit).await
    }

    pub async fn similar_posts(&self, hash: &str, count: usize) -> Result<Vec<Post>> {
        self.ensure_alive()?;
        self.similarity.similar_posts_for(hash, count).await
    }

    // ── search ──────────────────────────────────────────────────────

    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchResult>> {
        self.ensure_alive()?;
        self.search.search(request).await
    }

    pub async fn autocomplete(&self, term: &str, limit: usize) -> Result<Vec<String>> {
        self.ensure_alive()?;
        self.search.autocomplete(term, limit).await
    }

    pub async fn refresh_search_index(&self) -> Result<usize> {
        self.ensure_alive()?;
        self.search.refresh_index().await
    }

    // ── raw access ──────────────────────────────────────────────────

    /// Fetch any JSON resource through this client's cache.
    pub async fn fetch_json(&self, url: &str, options: &FetchOptions) -> Result<Arc<Value>> {
        self.ensure_alive()?;
        self.fetch.fetch_json(url, options).await
    }

    /// Fetch a file of the current revision, e.g. `"posts.json"`.
    pub async fn fetch_revision_file(&self, file: &str, options: &FetchOptions) -> Result<Arc<Value>> {
        self.ensure_alive()?;
        let rev = self.resolver.resolve().await?;
        self.fetch
            .fetch_json(&self.urls.revision_url(&rev, file), options)
            .await
    }

    /// Upstream mapping and cache headers for framework proxy adapters.
    pub fn proxy_config(&self, max_age_secs: u64) -> Result<ProxyConfig> {
        self.ensure_alive()?;
        Ok(ProxyConfig::new(&self.urls, max_age_secs))
    }

    pub fn fetch_stats(&self) -> FetchStats {
        self.fetch.stats()
    }

    /// Drop every cached entity, score, and index, and forget the resolved
    /// revision. Cached responses are dropped too unless the fetch cache
    /// is shared with other clients.
    pub fn clear_cache(&self) {
        debug!(client = %self.id, "clearing caches");
        if !self.shared_fetch {
            self.fetch.clear();
        }
        self.resolver.invalidate();
        self.posts.clear();
        self.media.clear();
        self.embeddings.clear();
        self.similarity.clear();
        self.search.clear();
    }

    /// Release caches and abort background work. Every later call fails
    /// with [`Error::Destroyed`]. Calling it again is a no-op.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tasks.abort_all();
        self.clear_cache();
        info!(client = %self.id, "client destroyed");
    }
}

impl Drop for RepoClient {
    fn drop(&mut self) {
        self.tasks.abort_all();
    }
}
