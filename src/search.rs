//! Full-text and vector search over posts and media.
//!
//! # Modes
//!
//! | Mode | Query | Ranked against |
//! |------|-------|----------------|
//! | `memory` | text | in-memory inverted index over posts |
//! | `vector` / `vector-text` | text | post text embeddings |
//! | `vector-clip-text` | text | post + media CLIP embeddings |
//! | `vector-clip-image` | image | post + media CLIP embeddings |
//!
//! # Index lifecycle
//!
//! ```text
//! Uninitialized ──first search──▶ Building ──▶ Ready(revision)
//!        ▲                           │
//!        └──────── build failed ─────┘
//! ```
//!
//! Concurrent searches during `Building` await the same build. A `Ready`
//! index built for an older revision is rebuilt on the next search.
//! [`SearchEngine::refresh_index`] rebuilds from a force-refreshed
//! collection.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use repo_client_core::embedding::{rank_by_similarity, sort_scored, ScoredId};
use repo_client_core::models::{Entity, KeyKind, MediaItem, Post};
use repo_client_core::search::{FieldSpec, InvertedIndex, QueryOptions};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::SearchConfig;
use crate::embedding::{Embedder, ImageInput};
use crate::error::{Error, Result};
use crate::retrieval::{AugmentOptions, EntityStore};
use crate::revision::RevisionResolver;
use crate::similarity::EmbeddingTables;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
    #[default]
    Memory,
    VectorText,
    VectorClipText,
    VectorClipImage,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Memory => "memory",
            SearchMode::VectorText => "vector-text",
            SearchMode::VectorClipText => "vector-clip-text",
            SearchMode::VectorClipImage => "vector-clip-image",
        }
    }

    fn takes_image(&self) -> bool {
        matches!(self, SearchMode::VectorClipImage)
    }
}

impl FromStr for SearchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "memory" => Ok(SearchMode::Memory),
            "vector" | "vector-text" => Ok(SearchMode::VectorText),
            "vector-clip-text" => Ok(SearchMode::VectorClipText),
            "vector-clip-image" => Ok(SearchMode::VectorClipImage),
            other => Err(Error::UnsupportedMode(other.to_string())),
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One search call. Exactly one of `text` / `image` must be set, matching
/// the mode.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub text: Option<String>,
    pub image: Option<ImageInput>,
    pub mode: SearchMode,
    /// Defaults to `search.limit`.
    pub limit: Option<usize>,
    /// Minimum vector score; defaults to `search.threshold`.
    pub threshold: Option<f64>,
}

impl SearchRequest {
    /// A `memory` search for `text`.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// A `vector-clip-image` search.
    pub fn image(image: ImageInput) -> Self {
        Self {
            image: Some(image),
            mode: SearchMode::VectorClipImage,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    fn validate(&self) -> Result<()> {
        let has_text = self.text.as_deref().is_some_and(|t| !t.trim().is_empty());
        let has_image = self.image.is_some();

        if self.mode.takes_image() {
            if !has_image {
                return Err(Error::Validation(format!(
                    "mode '{}' requires an image",
                    self.mode
                )));
            }
            if self.text.is_some() {
                return Err(Error::Validation(format!(
                    "mode '{}' does not accept text",
                    self.mode
                )));
            }
        } else {
            if has_image {
                return Err(Error::Validation(format!(
                    "mode '{}' does not accept an image",
                    self.mode
                )));
            }
            if !has_text {
                return Err(Error::Validation(format!(
                    "mode '{}' requires non-empty text",
                    self.mode
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SearchItem {
    Post(Post),
    Media(MediaItem),
}

impl SearchItem {
    pub fn hash(&self) -> Option<&str> {
        match self {
            SearchItem::Post(p) => p.hash(),
            SearchItem::Media(m) => m.hash(),
        }
    }

    pub fn as_post(&self) -> Option<&Post> {
        match self {
            SearchItem::Post(p) => Some(p),
            SearchItem::Media(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub score: f64,
    pub item: SearchItem,
    /// Query terms that matched (`memory` mode only).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub terms: Vec<String>,
}

struct PostIndex {
    revision: String,
    index: InvertedIndex,
    posts: Arc<Vec<Post>>,
}

type PendingBuild = Shared<BoxFuture<'static, Result<Arc<PostIndex>>>>;

enum IndexState {
    Uninitialized,
    Building { id: u64, pending: PendingBuild },
    Ready(Arc<PostIndex>),
}

struct Inner {
    posts: EntityStore<Post>,
    media: EntityStore<MediaItem>,
    resolver: RevisionResolver,
    embeddings: Arc<EmbeddingTables>,
    embedder: Arc<dyn Embedder>,
    config: SearchConfig,
    state: Mutex<IndexState>,
    generation: AtomicU64,
}

pub struct SearchEngine {
    inner: Arc<Inner>,
}

impl SearchEngine {
    pub fn new(
        posts: EntityStore<Post>,
        media: EntityStore<MediaItem>,
        resolver: RevisionResolver,
        embeddings: Arc<EmbeddingTables>,
        embedder: Arc<dyn Embedder>,
        config: SearchConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                posts,
                media,
                resolver,
                embeddings,
                embedder,
                config,
                state: Mutex::new(IndexState::Uninitialized),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchResult>> {
        request.validate()?;
        let limit = request.limit.unwrap_or(self.inner.config.limit);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let threshold = request.threshold.unwrap_or(self.inner.config.threshold);
        let text = request.text.as_deref().unwrap_or_default();

        debug!(mode = %request.mode, limit, "search");
        match request.mode {
            SearchMode::Memory => self.search_memory(text, limit).await,
            SearchMode::VectorText => {
                let rev = self.inner.resolver.resolve().await?;
                let query = self.inner.embedder.embed_text(text).await?;
                let table = self.inner.embeddings.text(&rev).await;
                let ranked = rank_by_similarity(&query, &table, threshold, limit);
                self.resolve_ranked(ranked, &HashSet::new()).await
            }
            SearchMode::VectorClipText | SearchMode::VectorClipImage => {
                let query = match &request.image {
                    Some(image) => self.inner.embedder.embed_clip_image(image).await?,
                    None => self.inner.embedder.embed_clip_text(text).await?,
                };
                self.search_clip(&query, threshold, limit).await
            }
        }
    }

    /// Indexed terms completing `term`: exact match first, then shorter
    /// terms, then alphabetical.
    pub async fn autocomplete(&self, term: &str, limit: usize) -> Result<Vec<String>> {
        if term.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let index = self.ensure_index(false).await?;
        Ok(index
            .index
            .autocomplete(term, limit, self.inner.config.fuzzy))
    }

    /// Rebuild the index from a freshly fetched collection. Returns the
    /// number of indexed posts.
    pub async fn refresh_index(&self) -> Result<usize> {
        let index = self.ensure_index(true).await?;
        Ok(index.index.len())
    }

    /// Drop the index; the next search rebuilds it.
    pub fn clear(&self) {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), IndexState::Uninitialized);
        drop(previous);
    }

    async fn search_memory(&self, text: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let index = self.ensure_index(false).await?;
        let options = QueryOptions {
            prefix: self.inner.config.prefix,
            fuzzy: self.inner.config.fuzzy,
            limit: Some(limit),
        };

        Ok(index
            .index
            .search(text, &options)
            .into_iter()
            .filter_map(|hit| {
                index.posts.get(hit.doc).map(|post| SearchResult {
                    score: hit.score,
                    item: SearchItem::Post(post.clone()),
                    terms: hit.terms,
                })
            })
            .collect())
    }

    async fn search_clip(
        &self,
        query: &[f32],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        let rev = self.inner.resolver.resolve().await?;
        let (post_table, media_table) = futures::join!(
            self.inner.embeddings.post_clip(&rev),
            self.inner.embeddings.media_clip(&rev)
        );

        let post_ranked = rank_by_similarity(query, &post_table, threshold, limit);
        let media_ranked = rank_by_similarity(query, &media_table, threshold, limit);

        let media_ids: HashSet<String> = media_ranked.iter().map(|s| s.id.clone()).collect();

        let mut merged: Vec<ScoredId> = post_ranked.into_iter().chain(media_ranked).collect();
        sort_scored(&mut merged);
        merged.truncate(limit);

        self.resolve_ranked(merged, &media_ids).await
    }

    /// Turn ranked hashes into results, keeping the ranking order. Hashes
    /// in `media` resolve against the media collection, the rest against
    /// posts. Hashes without an entity are dropped.
    async fn resolve_ranked(
        &self,
        ranked: Vec<ScoredId>,
        media: &HashSet<String>,
    ) -> Result<Vec<SearchResult>> {
        if ranked.is_empty() {
            return Ok(Vec::new());
        }

        let (media_keys, post_keys): (Vec<String>, Vec<String>) = ranked
            .iter()
            .map(|s| s.id.clone())
            .partition(|id| media.contains(id));

        let options = AugmentOptions::default();
        let posts = if post_keys.is_empty() {
            Vec::new()
        } else {
            self.inner
                .posts
                .augment_by_keys(&post_keys, KeyKind::Hash, &options)
                .await?
        };
        let medias = if media_keys.is_empty() {
            Vec::new()
        } else {
            self.inner
                .media
                .augment_by_keys(&media_keys, KeyKind::Hash, &options)
                .await?
        };

        let mut items: HashMap<String, SearchItem> = HashMap::new();
        for post in posts {
            if let Some(hash) = post.hash.clone() {
                items.insert(hash, SearchItem::Post(post));
            }
        }
        for item in medias {
            if let Some(hash) = item.hash.clone() {
                items.insert(hash, SearchItem::Media(item));
            }
        }

        Ok(ranked
            .into_iter()
            .filter_map(|scored| {
                items.remove(&scored.id).map(|item| SearchResult {
                    score: scored.score,
                    item,
                    terms: Vec::new(),
                })
            })
            .collect())
    }

    async fn ensure_index(&self, force_refresh: bool) -> Result<Arc<PostIndex>> {
        let rev = self.inner.resolver.resolve().await?;

        let (pending, previous) = {
            let mut state = self.inner.state.lock();
            let joined = match &*state {
                IndexState::Ready(index) if !force_refresh && index.revision == rev => {
                    return Ok(Arc::clone(index));
                }
                IndexState::Building { pending, .. } if !force_refresh => Some(pending.clone()),
                _ => None,
            };
            match joined {
                Some(pending) => {
                    debug!("joining in-flight index build");
                    (pending, None)
                }
                None => {
                    let id = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
                    let pending = self.start_build(id, rev, force_refresh);
                    let building = IndexState::Building {
                        id,
                        pending: pending.clone(),
                    };
                    (pending, Some(std::mem::replace(&mut *state, building)))
                }
            }
        };
        drop(previous);

        pending.await
    }

    /// The build future is stored in `Inner.state`; it holds `Inner` weakly.
    fn start_build(&self, id: u64, rev: String, force_refresh: bool) -> PendingBuild {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let posts = self.inner.posts.clone();
        let fields = self.inner.config.fields.clone();
        async move {
            let result = build_index(&posts, fields, rev, force_refresh).await;
            let Some(inner) = weak.upgrade() else {
                return result;
            };

            let previous = {
                let mut state = inner.state.lock();
                if matches!(&*state, IndexState::Building { id: current, .. } if *current == id) {
                    let next = match &result {
                        Ok(index) => IndexState::Ready(Arc::clone(index)),
                        Err(_) => IndexState::Uninitialized,
                    };
                    Some(std::mem::replace(&mut *state, next))
                } else {
                    None
                }
            };
            drop(previous);
            result
        }
        .boxed()
        .shared()
    }
}

async fn build_index(
    store: &EntityStore<Post>,
    fields: Vec<FieldSpec>,
    rev: String,
    force_refresh: bool,
) -> Result<Arc<PostIndex>> {
    let posts = store.get_all(true, force_refresh).await?;
    let index = InvertedIndex::build(fields, &posts);
    info!(
        revision = %rev,
        posts = index.len(),
        terms = index.term_count(),
        "built search index"
    );
    Ok(Arc::new(PostIndex {
        revision: rev,
        index,
        posts,
    }))
}
