//! Entity retrieval by slug, hash, or path.
//!
//! Lookups walk a cascade of increasingly expensive strategies and stop at
//! the first hit:
//!
//! | Step | Slug | Hash | Path |
//! |------|------|------|------|
//! | 1. memory | collection scan, then entity memo | same | same |
//! | 2. direct file | `{rev}/_posts/{slug}.json` | `_shared/posts/{hash}.json` | — |
//! | 3. mapping file | `slug→hash`, then hash steps 1–2 | `hash→path`, then path in memory | `path→hash`, then hash steps 1–2 |
//! | 4. full collection | `posts.json` scan | same | same |
//!
//! There is no per-path file, so the hash step 3 only consults memory for
//! the mapped path and leaves the collection scan to step 4.
//!
//! A miss after step 4 is `Ok(None)`. Missing direct files and mapping
//! files fall through to the next step; a failing full-collection fetch is
//! an error. Records in the full collection that do not deserialize are
//! skipped with a warning.
//!
//! # Side-loading
//!
//! Every hit from steps 2–3 counts as an individual load. Once the count
//! reaches `promotion_threshold` and the collection is not loaded yet, the
//! full collection is fetched once per revision in the background so later
//! lookups are answered from memory. The caller that crossed the threshold does not
//! wait for it.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use repo_client_core::models::{Entity, KeyKind};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{RevisionSlot, TimedLru};
use crate::config::{CacheSegmentConfig, RetrievalConfig};
use crate::error::{require_key, Error, Result};
use crate::fetch::{FetchCache, FetchOptions};
use crate::revision::RevisionResolver;
use crate::tasks::BackgroundTasks;
use crate::urls::UrlBuilder;

/// Where one entity collection lives in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collection {
    pub name: &'static str,
    /// Full collection, revision-scoped.
    pub all_file: &'static str,
    /// Revision-scoped folder of `{slug}.json` files.
    pub slug_folder: Option<&'static str>,
    /// Shared (non-revisioned) folder of `{hash}.json` files.
    pub hash_folder: Option<&'static str>,
    /// `slug → hash`
    pub slug_map: Option<&'static str>,
    /// `hash → path`
    pub hash_path_map: Option<&'static str>,
    /// `path → hash`
    pub path_map: Option<&'static str>,
}

pub const POSTS: Collection = Collection {
    name: "posts",
    all_file: "posts.json",
    slug_folder: Some("_posts"),
    hash_folder: Some("posts"),
    slug_map: Some("posts-slug-map.json"),
    hash_path_map: Some("posts-hash-path-map.json"),
    path_map: Some("posts-path-map.json"),
};

pub const MEDIA: Collection = Collection {
    name: "media",
    all_file: "media.json",
    slug_folder: None,
    hash_folder: Some("medias"),
    slug_map: None,
    hash_path_map: Some("media-hash-path-map.json"),
    path_map: Some("media-path-map.json"),
};

/// Options for [`EntityStore::augment_by_keys`].
#[derive(Debug, Clone, Default)]
pub struct AugmentOptions {
    /// Maximum number of entities returned (default: number of keys).
    pub count: Option<usize>,
    /// Fetch one by one when there are at most this many keys
    /// (default: `retrieval.load_individually`).
    pub load_individually: Option<usize>,
}

struct StoreInner<T> {
    collection: Collection,
    fetch: Arc<FetchCache>,
    resolver: RevisionResolver,
    urls: Arc<UrlBuilder>,
    settings: RetrievalConfig,
    tasks: Arc<BackgroundTasks>,
    all: RevisionSlot<Vec<T>>,
    memo: TimedLru<Arc<T>>,
    individual_loads: AtomicUsize,
    /// Revision whose side-load is running or done.
    side_loaded: Mutex<Option<String>>,
}

/// Lookup engine for one collection. Clones share caches and counters.
pub struct EntityStore<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Clone for EntityStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Entity> EntityStore<T> {
    pub fn new(
        collection: Collection,
        fetch: Arc<FetchCache>,
        resolver: RevisionResolver,
        urls: Arc<UrlBuilder>,
        settings: RetrievalConfig,
        memo: &CacheSegmentConfig,
        tasks: Arc<BackgroundTasks>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                collection,
                fetch,
                resolver,
                urls,
                settings,
                tasks,
                all: RevisionSlot::new(),
                memo: TimedLru::from_config(memo),
                individual_loads: AtomicUsize::new(0),
                side_loaded: Mutex::new(None),
            }),
        }
    }

    pub fn collection(&self) -> Collection {
        self.inner.collection
    }

    /// Number of hits served by direct files or mapping files so far.
    pub fn individual_loads(&self) -> usize {
        self.inner.individual_loads.load(Ordering::Relaxed)
    }

    /// Whether the full collection for the current revision is in memory.
    pub fn is_loaded(&self) -> bool {
        self.inner
            .resolver
            .cached()
            .is_some_and(|rev| self.inner.all.get(&rev).is_some())
    }

    pub async fn get_by_slug(&self, slug: &str) -> Result<Option<T>> {
        let slug = require_key(slug, "slug")?;
        let rev = self.inner.resolver.resolve().await?;

        if let Some(hit) = self.from_memory(&rev, KeyKind::Slug, slug) {
            return Ok(Some(hit));
        }

        if let Some(entity) = self.fetch_by_slug_file(&rev, slug).await {
            return Ok(Some(self.individual_hit(&rev, entity)));
        }

        if let Some(hash) = self.map_lookup(&rev, self.inner.collection.slug_map, slug).await {
            debug!(collection = self.inner.collection.name, slug, hash = %hash, "slug resolved via map");
            if let Some(entity) = self.find_by_hash_without_maps(&rev, &hash).await {
                self.remember(&rev, KeyKind::Slug, slug, &entity);
                return Ok(Some(entity));
            }
        }

        self.scan_all(&rev, KeyKind::Slug, slug).await
    }

    pub async fn get_by_hash(&self, hash: &str) -> Result<Option<T>> {
        let hash = require_key(hash, "hash")?;
        let rev = self.inner.resolver.resolve().await?;

        if let Some(entity) = self.find_by_hash_without_maps(&rev, hash).await {
            return Ok(Some(entity));
        }

        if let Some(path) = self
            .map_lookup(&rev, self.inner.collection.hash_path_map, hash)
            .await
        {
            debug!(collection = self.inner.collection.name, hash, path = %path, "hash resolved via map");
            if let Some(entity) = self.from_memory(&rev, KeyKind::Path, &path) {
                if entity.hash() == Some(hash) {
                    self.remember(&rev, KeyKind::Hash, hash, &entity);
                    return Ok(Some(entity));
                }
            }
        }

        self.scan_all(&rev, KeyKind::Hash, hash).await
    }

    pub async fn get_by_path(&self, path: &str) -> Result<Option<T>> {
        let path = require_key(path, "path")?;
        let rev = self.inner.resolver.resolve().await?;

        if let Some(hit) = self.from_memory(&rev, KeyKind::Path, path) {
            return Ok(Some(hit));
        }

        if let Some(hash) = self.map_lookup(&rev, self.inner.collection.path_map, path).await {
            if let Some(entity) = self.find_by_hash_without_maps(&rev, &hash).await {
                self.remember(&rev, KeyKind::Path, path, &entity);
                return Ok(Some(entity));
            }
        }

        self.scan_all(&rev, KeyKind::Path, path).await
    }

    /// Dispatch to the getter for `kind`.
    pub async fn get_by(&self, kind: KeyKind, key: &str) -> Result<Option<T>> {
        match kind {
            KeyKind::Slug => self.get_by_slug(key).await,
            KeyKind::Hash => self.get_by_hash(key).await,
            KeyKind::Path => self.get_by_path(key).await,
        }
    }

    /// The full collection for the current revision.
    ///
    /// `use_cache = false` or `force_refresh = true` bypasses both the
    /// in-memory collection and the HTTP cache. The result always replaces
    /// the in-memory collection.
    pub async fn get_all(&self, use_cache: bool, force_refresh: bool) -> Result<Arc<Vec<T>>> {
        let rev = self.inner.resolver.resolve().await?;
        self.load_all(&rev, use_cache && !force_refresh).await
    }

    /// The `count` most recent entities by date; undated entities last.
    pub async fn get_recent(&self, count: usize) -> Result<Vec<T>> {
        let all = self.get_all(true, false).await?;
        let mut items: Vec<T> = all.iter().cloned().collect();
        items.sort_by(|a, b| match (a.date(), b.date()) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => CmpOrdering::Less,
            (None, Some(_)) => CmpOrdering::Greater,
            (None, None) => CmpOrdering::Equal,
        });
        items.truncate(count);
        Ok(items)
    }

    /// Resolve `keys` to entities, preserving key order and skipping keys
    /// without a match.
    ///
    /// Small key lists are looked up individually in parallel; larger ones
    /// are answered from the full collection through a key table.
    pub async fn augment_by_keys(
        &self,
        keys: &[String],
        kind: KeyKind,
        options: &AugmentOptions,
    ) -> Result<Vec<T>> {
        for key in keys {
            require_key(key, kind.as_str())?;
        }

        let count = options.count.unwrap_or(keys.len());
        if keys.is_empty() || count == 0 {
            return Ok(Vec::new());
        }

        let individually = options
            .load_individually
            .unwrap_or(self.inner.settings.load_individually);

        if keys.len() <= individually {
            let found =
                futures::future::try_join_all(keys.iter().map(|key| self.get_by(kind, key)))
                    .await?;
            return Ok(found.into_iter().flatten().take(count).collect());
        }

        let rev = self.inner.resolver.resolve().await?;
        let all = match self.inner.all.get(&rev) {
            Some(all) => all,
            None => self.load_all(&rev, true).await?,
        };

        let mut table: HashMap<&str, &T> = HashMap::with_capacity(all.len());
        for entity in all.iter() {
            if let Some(key) = entity.key(kind) {
                table.entry(key).or_insert(entity);
            }
        }

        Ok(keys
            .iter()
            .filter_map(|key| table.get(key.as_str()).map(|e| (*e).clone()))
            .take(count)
            .collect())
    }

    /// Drop the in-memory collection, the entity memo, and the load counter.
    pub fn clear(&self) {
        self.inner.all.clear();
        self.inner.memo.clear();
        self.inner.individual_loads.store(0, Ordering::Relaxed);
        *self.inner.side_loaded.lock() = None;
    }

    // ── cascade steps ───────────────────────────────────────────────

    fn memo_key(rev: &str, kind: KeyKind, key: &str) -> String {
        format!("{}:{}:{}", rev, kind, key)
    }

    fn from_memory(&self, rev: &str, kind: KeyKind, key: &str) -> Option<T> {
        if let Some(all) = self.inner.all.get(rev) {
            if let Some(hit) = all.iter().find(|e| e.key(kind) == Some(key)) {
                return Some(hit.clone());
            }
        }
        self.inner
            .memo
            .get(&Self::memo_key(rev, kind, key))
            .map(|e| (*e).clone())
    }

    /// Memoize `entity` under `kind`/`key` and under every key it carries.
    fn remember(&self, rev: &str, kind: KeyKind, key: &str, entity: &T) {
        let shared = Arc::new(entity.clone());
        self.inner
            .memo
            .insert(Self::memo_key(rev, kind, key), Arc::clone(&shared));
        for own in [KeyKind::Hash, KeyKind::Slug, KeyKind::Path] {
            if let Some(value) = entity.key(own) {
                self.inner
                    .memo
                    .insert(Self::memo_key(rev, own, value), Arc::clone(&shared));
            }
        }
    }

    fn individual_hit(&self, rev: &str, entity: T) -> T {
        let loads = self.inner.individual_loads.fetch_add(1, Ordering::Relaxed) + 1;
        let threshold = self.inner.settings.promotion_threshold;
        if threshold > 0 && loads >= threshold && self.inner.all.get(rev).is_none() {
            self.side_load(rev);
        }
        entity
    }

    fn side_load(&self, rev: &str) {
        {
            let mut side_loaded = self.inner.side_loaded.lock();
            if side_loaded.as_deref() == Some(rev) {
                return;
            }
            *side_loaded = Some(rev.to_string());
        }
        info!(
            collection = self.inner.collection.name,
            revision = rev,
            "promotion threshold reached, side-loading full collection"
        );
        let store = self.clone();
        let target = rev.to_string();
        let spawned = self.inner.tasks.spawn("side-load", async move {
            if let Err(e) = store.load_all(&target, true).await {
                warn!(collection = store.inner.collection.name, error = %e, "side-load failed");
                store.forget_side_load(&target);
            }
        });
        if !spawned {
            self.forget_side_load(rev);
        }
    }

    fn forget_side_load(&self, rev: &str) {
        let mut side_loaded = self.inner.side_loaded.lock();
        if side_loaded.as_deref() == Some(rev) {
            *side_loaded = None;
        }
    }

    async fn find_by_hash_without_maps(&self, rev: &str, hash: &str) -> Option<T> {
        if let Some(hit) = self.from_memory(rev, KeyKind::Hash, hash) {
            return Some(hit);
        }
        let folder = self.inner.collection.hash_folder?;
        let url = self.inner.urls.shared_url(folder, &format!("{}.json", hash));
        let entity = self.fetch_entity_file(&url).await?;
        self.remember(rev, KeyKind::Hash, hash, &entity);
        Some(self.individual_hit(rev, entity))
    }

    async fn fetch_by_slug_file(&self, rev: &str, slug: &str) -> Option<T> {
        let folder = self.inner.collection.slug_folder?;
        let url = self
            .inner
            .urls
            .revision_folder_url(rev, folder, &format!("{}.json", slug));
        let entity = self.fetch_entity_file(&url).await?;
        self.remember(rev, KeyKind::Slug, slug, &entity);
        Some(entity)
    }

    /// A single-entity file; any failure is a miss.
    async fn fetch_entity_file(&self, url: &str) -> Option<T> {
        let options = FetchOptions::default().with_default(Value::Null);
        let value = self.inner.fetch.fetch_json(url, &options).await.ok()?;
        if value.is_null() {
            return None;
        }
        match T::deserialize(value.as_ref()) {
            Ok(entity) => Some(entity),
            Err(e) => {
                warn!(url, error = %e, "ignoring malformed entity file");
                None
            }
        }
    }

    /// Look `key` up in a mapping file; a missing file or entry is `None`.
    async fn map_lookup(&self, rev: &str, file: Option<&'static str>, key: &str) -> Option<String> {
        let url = self.inner.urls.revision_url(rev, file?);
        let options = FetchOptions::default().with_default(Value::Object(Default::default()));
        let map = self.inner.fetch.fetch_json(&url, &options).await.ok()?;
        map.get(key).and_then(Value::as_str).map(str::to_string)
    }

    async fn scan_all(&self, rev: &str, kind: KeyKind, key: &str) -> Result<Option<T>> {
        let all = match self.inner.all.get(rev) {
            Some(all) => all,
            None => self.load_all(rev, true).await?,
        };
        let found = all.iter().find(|e| e.key(kind) == Some(key)).cloned();
        match &found {
            Some(entity) => self.remember(rev, kind, key, entity),
            None => debug!(collection = self.inner.collection.name, %kind, key, "not found"),
        }
        Ok(found)
    }

    async fn load_all(&self, rev: &str, use_cache: bool) -> Result<Arc<Vec<T>>> {
        if use_cache {
            if let Some(all) = self.inner.all.get(rev) {
                return Ok(all);
            }
        }

        let url = self.inner.urls.revision_url(rev, self.inner.collection.all_file);
        let options = if use_cache {
            FetchOptions::default()
        } else {
            FetchOptions::default().no_cache()
        };
        let value = self.inner.fetch.fetch_json(&url, &options).await?;
        let items = parse_records::<T>(&url, &value)?;
        info!(
            collection = self.inner.collection.name,
            revision = rev,
            count = items.len(),
            "loaded full collection"
        );

        let all = Arc::new(items);
        self.inner.all.set(rev, Arc::clone(&all));
        Ok(all)
    }
}

/// Deserialize a collection record by record, skipping records that do
/// not fit `T`. Anything other than an array (or an empty body) is an error.
fn parse_records<T: Entity>(url: &str, value: &Value) -> Result<Vec<T>> {
    let records = match value {
        Value::Array(records) => records,
        Value::Null => return Ok(Vec::new()),
        other => {
            return Err(Error::Json {
                url: url.to_string(),
                message: format!("expected an array of records, got {}", json_kind(other)),
            })
        }
    };

    let mut items = Vec::with_capacity(records.len());
    let mut skipped = 0usize;
    for (index, record) in records.iter().enumerate() {
        match T::deserialize(record) {
            Ok(item) => items.push(item),
            Err(e) => {
                skipped += 1;
                debug!(url, index, error = %e, "malformed record");
            }
        }
    }
    if skipped > 0 {
        warn!(url, skipped, kept = items.len(), "skipped malformed records in collection");
    }
    Ok(items)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
