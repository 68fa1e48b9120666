//! Post-to-post similarity.
//!
//! Scores come from two sources, in order:
//!
//! 1. `posts-similarity.json`: precomputed scores keyed `"{a}-{b}"`
//! 2. `posts-embedding-hash-map.json`: cosine similarity of text embeddings
//!
//! Every computed or looked-up score is memoized under the canonical pair
//! key for the current revision, so `(a, b)` and `(b, a)` share one entry.
//! A pair where either post has no embedding scores `0.0` and is not
//! memoized, so it is picked up once the embedding exists.

use std::collections::HashMap;
use std::sync::Arc;

use repo_client_core::embedding::{cosine_similarity, pair_key, rank_by_similarity};
use repo_client_core::models::{KeyKind, Post};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{RevisionSlot, TimedLru};
use crate::config::CacheSegmentConfig;
use crate::error::{require_key, Result};
use crate::fetch::{FetchCache, FetchOptions};
use crate::retrieval::{AugmentOptions, EntityStore};
use crate::revision::RevisionResolver;
use crate::urls::UrlBuilder;

pub type EmbeddingTable = HashMap<String, Vec<f32>>;

const SCORES_FILE: &str = "posts-similarity.json";
const SIMILAR_FILE: &str = "posts-similar-hash.json";
const POST_TEXT_EMBEDDINGS: &str = "posts-embedding-hash-map.json";
const POST_CLIP_EMBEDDINGS: &str = "posts-embedding-clip-hash-map.json";
const MEDIA_CLIP_EMBEDDINGS: &str = "media-embedding-clip-hash-map.json";

/// Load a revision file that may legitimately be absent; absence and
/// failures both yield an empty object.
async fn fetch_optional_map(fetch: &FetchCache, url: &str) -> Arc<Value> {
    let options = FetchOptions::default().with_default(Value::Object(Default::default()));
    match fetch.fetch_json(url, &options).await {
        Ok(value) => value,
        Err(e) => {
            warn!(url, error = %e, "optional table unavailable");
            Arc::new(Value::Object(Default::default()))
        }
    }
}

/// `hash → vector`, skipping entries that are not numeric arrays.
fn parse_embeddings(value: &Value) -> EmbeddingTable {
    let Some(map) = value.as_object() else {
        return EmbeddingTable::new();
    };
    map.iter()
        .filter_map(|(hash, raw)| {
            Vec::<f32>::deserialize(raw)
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| (hash.clone(), v))
        })
        .collect()
}

fn parse_scores(value: &Value) -> HashMap<String, f64> {
    value
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_f64().map(|s| (k.clone(), s)))
                .collect()
        })
        .unwrap_or_default()
}

/// Entries may be bare hashes or `{ "hash": .. }` objects.
fn parse_similar(value: &Value) -> HashMap<String, Vec<String>> {
    let Some(map) = value.as_object() else {
        return HashMap::new();
    };
    map.iter()
        .filter_map(|(hash, list)| {
            let items = list.as_array()?;
            let hashes = items
                .iter()
                .filter_map(|item| match item {
                    Value::String(h) => Some(h.clone()),
                    Value::Object(o) => o.get("hash").and_then(Value::as_str).map(str::to_string),
                    _ => None,
                })
                .collect();
            Some((hash.clone(), hashes))
        })
        .collect()
}

/// Lazily loaded embedding tables for the current revision, shared by
/// similarity and vector search.
pub struct EmbeddingTables {
    fetch: Arc<FetchCache>,
    urls: Arc<UrlBuilder>,
    text: RevisionSlot<EmbeddingTable>,
    post_clip: RevisionSlot<EmbeddingTable>,
    media_clip: RevisionSlot<EmbeddingTable>,
}

impl EmbeddingTables {
    pub fn new(fetch: Arc<FetchCache>, urls: Arc<UrlBuilder>) -> Self {
        Self {
            fetch,
            urls,
            text: RevisionSlot::new(),
            post_clip: RevisionSlot::new(),
            media_clip: RevisionSlot::new(),
        }
    }

    /// Post text embeddings.
    pub async fn text(&self, rev: &str) -> Arc<EmbeddingTable> {
        self.load(&self.text, rev, POST_TEXT_EMBEDDINGS).await
    }

    /// Post CLIP embeddings.
    pub async fn post_clip(&self, rev: &str) -> Arc<EmbeddingTable> {
        self.load(&self.post_clip, rev, POST_CLIP_EMBEDDINGS).await
    }

    /// Media CLIP embeddings.
    pub async fn media_clip(&self, rev: &str) -> Arc<EmbeddingTable> {
        self.load(&self.media_clip, rev, MEDIA_CLIP_EMBEDDINGS).await
    }

    async fn load(
        &self,
        slot: &RevisionSlot<EmbeddingTable>,
        rev: &str,
        file: &str,
    ) -> Arc<EmbeddingTable> {
        if let Some(table) = slot.get(rev) {
            return table;
        }
        let url = self.urls.revision_url(rev, file);
        let raw = fetch_optional_map(&self.fetch, &url).await;
        let table = Arc::new(parse_embeddings(raw.as_ref()));
        debug!(file, entries = table.len(), "loaded embedding table");
        slot.set(rev, Arc::clone(&table));
        table
    }

    pub fn clear(&self) {
        self.text.clear();
        self.post_clip.clear();
        self.media_clip.clear();
    }
}

pub struct SimilarityEngine {
    fetch: Arc<FetchCache>,
    urls: Arc<UrlBuilder>,
    resolver: RevisionResolver,
    posts: EntityStore<Post>,
    embeddings: Arc<EmbeddingTables>,
    memo: TimedLru<f64>,
    scores: RevisionSlot<HashMap<String, f64>>,
    similar: RevisionSlot<HashMap<String, Vec<String>>>,
}

impl SimilarityEngine {
    pub fn new(
        fetch: Arc<FetchCache>,
        urls: Arc<UrlBuilder>,
        resolver: RevisionResolver,
        posts: EntityStore<Post>,
        embeddings: Arc<EmbeddingTables>,
        memo: &CacheSegmentConfig,
    ) -> Self {
        Self {
            fetch,
            urls,
            resolver,
            posts,
            embeddings,
            memo: TimedLru::from_config(memo),
            scores: RevisionSlot::new(),
            similar: RevisionSlot::new(),
        }
    }

    /// Similarity of two posts in `[0, 1]`; symmetric, and `1.0` for a
    /// post with itself.
    pub async fn similarity_by_hashes(&self, a: &str, b: &str) -> Result<f64> {
        let a = require_key(a, "hash")?;
        let b = require_key(b, "hash")?;
        if a == b {
            return Ok(1.0);
        }

        let rev = self.resolver.resolve().await?;
        let key = pair_key(a, b);
        let memo_key = format!("{}:{}", rev, key);
        if let Some(score) = self.memo.get(&memo_key) {
            return Ok(score);
        }

        let scores = self.score_table(&rev).await;
        let reversed = format!("{}-{}", b.max(a), b.min(a));
        if let Some(score) = scores.get(&key).or_else(|| scores.get(&reversed)) {
            let score = score.clamp(0.0, 1.0);
            self.memo.insert(memo_key, score);
            return Ok(score);
        }

        let embeddings = self.embeddings.text(&rev).await;
        let (Some(va), Some(vb)) = (embeddings.get(a), embeddings.get(b)) else {
            debug!(a, b, "missing embedding, similarity is 0");
            return Ok(0.0);
        };

        let score = (cosine_similarity(va, vb) as f64).clamp(0.0, 1.0);
        self.memo.insert(memo_key, score);
        Ok(score)
    }

    /// Hashes of the posts most similar to `hash`, best first.
    pub async fn top_similar_hashes_for(&self, hash: &str, limit: usize) -> Result<Vec<String>> {
        let hash = require_key(hash, "hash")?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rev = self.resolver.resolve().await?;

        let similar = self.similar_table(&rev).await;
        if let Some(list) = similar.get(hash).filter(|l| !l.is_empty()) {
            return Ok(list
                .iter()
                .filter(|h| h.as_str() != hash)
                .take(limit)
                .cloned()
                .collect());
        }

        let embeddings = self.embeddings.text(&rev).await;
        let Some(query) = embeddings.get(hash) else {
            return Ok(Vec::new());
        };

        debug!(hash, candidates = embeddings.len(), "ranking similar posts by embedding");
        let mut ranked = rank_by_similarity(query, &embeddings, 0.0, limit.saturating_add(1));
        ranked.retain(|s| s.id != hash);
        ranked.truncate(limit);

        for scored in &ranked {
            self.memo.insert(
                format!("{}:{}", rev, pair_key(hash, &scored.id)),
                scored.score.clamp(0.0, 1.0),
            );
        }
        Ok(ranked.into_iter().map(|s| s.id).collect())
    }

    /// Posts most similar to `hash`, falling back to the most recent posts
    /// (excluding `hash` itself) when nothing similar is known.
    pub async fn similar_posts_for(&self, hash: &str, count: usize) -> Result<Vec<Post>> {
        let hash = require_key(hash, "hash")?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let top = self.top_similar_hashes_for(hash, count).await?;
        if !top.is_empty() {
            let options = AugmentOptions {
                count: Some(count),
                ..Default::default()
            };
            let posts = self
                .posts
                .augment_by_keys(&top, KeyKind::Hash, &options)
                .await?;
            if !posts.is_empty() {
                return Ok(posts);
            }
        }

        debug!(hash, "no similar posts, falling back to recent");
        let mut recent = self.posts.get_recent(count.saturating_add(1)).await?;
        recent.retain(|p| p.hash.as_deref() != Some(hash));
        recent.truncate(count);
        Ok(recent)
    }

    pub fn clear(&self) {
        self.memo.clear();
        self.scores.clear();
        self.similar.clear();
    }

    async fn score_table(&self, rev: &str) -> Arc<HashMap<String, f64>> {
        if let Some(table) = self.scores.get(rev) {
            return table;
        }
        let url = self.urls.revision_url(rev, SCORES_FILE);
        let raw = fetch_optional_map(&self.fetch, &url).await;
        let table = Arc::new(parse_scores(raw.as_ref()));
        self.scores.set(rev, Arc::clone(&table));
        table
    }

    async fn similar_table(&self, rev: &str) -> Arc<HashMap<String, Vec<String>>> {
        if let Some(table) = self.similar.get(rev) {
            return table;
        }
        let url = self.urls.revision_url(rev, SIMILAR_FILE);
        let raw = fetch_optional_map(&self.fetch, &url).await;
        let table = Arc::new(parse_similar(raw.as_ref()));
        self.similar.set(rev, Arc::clone(&table));
        table
    }
}
