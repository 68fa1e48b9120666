//! Client configuration.
//!
//! A [`ClientConfig`] is either parsed from TOML with [`load_config`] or
//! assembled from `REPO_*` environment variables with
//! [`ClientConfig::from_env`]. Both paths run [`ClientConfig::validate`].
//!
//! ```toml
//! org_slug = "acme"
//! project_id = "blog"
//! revision = "latest"
//! store_url = "https://store.example.com"
//! api_url = "https://api.example.com/v1"
//!
//! [resolver]
//! ttl_secs = 300
//!
//! [retrieval]
//! promotion_threshold = 5
//! load_individually = 3
//!
//! [cache.posts]
//! max_entries = 1000
//! max_age_secs = 3600
//! ```

use anyhow::{bail, Context, Result};
use repo_client_core::search::{default_fields, FieldSpec};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// The symbolic revision that tracks the project's active snapshot.
pub const LATEST: &str = "latest";

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    pub org_slug: String,
    pub project_id: String,
    /// `"latest"` or a pinned revision id.
    #[serde(default = "default_revision")]
    pub revision: String,
    /// Base URL of the object store serving revision files.
    pub store_url: String,
    /// Base URL of the project metadata API.
    pub api_url: String,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

fn default_revision() -> String {
    LATEST.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResolverConfig {
    /// How long a resolved `"latest"` stays valid.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Start resolving in the background as soon as the client is built.
    #[serde(default = "default_true")]
    pub prime_on_start: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            prime_on_start: true,
        }
    }
}

impl ResolverConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_ttl_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Individual loads after which the full collection is side-loaded.
    #[serde(default = "default_promotion_threshold")]
    pub promotion_threshold: usize,
    /// `augment_by_keys` fetches this many keys or fewer one by one.
    #[serde(default = "default_load_individually")]
    pub load_individually: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            promotion_threshold: default_promotion_threshold(),
            load_individually: default_load_individually(),
        }
    }
}

fn default_promotion_threshold() -> usize {
    5
}
fn default_load_individually() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    /// Minimum vector similarity kept before the limit is applied.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Fuzzy edit distance as a fraction of term length.
    #[serde(default = "default_fuzzy")]
    pub fuzzy: f64,
    #[serde(default = "default_true")]
    pub prefix: bool,
    #[serde(default = "default_fields")]
    pub fields: Vec<FieldSpec>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            limit: default_limit(),
            fuzzy: default_fuzzy(),
            prefix: true,
            fields: default_fields(),
        }
    }
}

fn default_threshold() -> f64 {
    0.1
}
fn default_limit() -> usize {
    20
}
fn default_fuzzy() -> f64 {
    0.2
}
fn default_true() -> bool {
    true
}

/// Size and age bounds for one cache segment.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct CacheSegmentConfig {
    pub max_entries: usize,
    pub max_age_secs: u64,
}

impl CacheSegmentConfig {
    pub fn new(max_entries: usize, max_age_secs: u64) -> Self {
        Self {
            max_entries,
            max_age_secs,
        }
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Parsed JSON responses, keyed by URL.
    #[serde(default = "default_http_segment")]
    pub http: CacheSegmentConfig,
    #[serde(default = "default_entity_segment")]
    pub posts: CacheSegmentConfig,
    #[serde(default = "default_entity_segment")]
    pub media: CacheSegmentConfig,
    #[serde(default = "default_similarity_segment")]
    pub similarity: CacheSegmentConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            http: default_http_segment(),
            posts: default_entity_segment(),
            media: default_entity_segment(),
            similarity: default_similarity_segment(),
        }
    }
}

fn default_http_segment() -> CacheSegmentConfig {
    CacheSegmentConfig::new(500, 3600)
}
fn default_entity_segment() -> CacheSegmentConfig {
    CacheSegmentConfig::new(1000, 3600)
}
fn default_similarity_segment() -> CacheSegmentConfig {
    CacheSegmentConfig::new(10_000, 3600)
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"disabled"` or `"http"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Base URL of the inference API.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub clip_model: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: None,
            model: None,
            clip_model: None,
            max_retries: default_max_retries(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    2
}
fn default_timeout_secs() -> u64 {
    30
}

impl ClientConfig {
    /// A config with every optional section at its default.
    pub fn new(
        org_slug: impl Into<String>,
        project_id: impl Into<String>,
        store_url: impl Into<String>,
        api_url: impl Into<String>,
    ) -> Self {
        Self {
            org_slug: org_slug.into(),
            project_id: project_id.into(),
            revision: default_revision(),
            store_url: store_url.into(),
            api_url: api_url.into(),
            http: HttpConfig::default(),
            resolver: ResolverConfig::default(),
            retrieval: RetrievalConfig::default(),
            search: SearchConfig::default(),
            cache: CacheConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }

    /// Pin or unpin the revision.
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    /// Build a config from `REPO_*` environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `REPO_ORG_SLUG` | `org_slug` (required) |
    /// | `REPO_PROJECT_ID` | `project_id` (required) |
    /// | `REPO_STORE_URL` | `store_url` (required) |
    /// | `REPO_API_URL` | `api_url` (required) |
    /// | `REPO_REVISION` | `revision` |
    /// | `REPO_EMBEDDING_URL` | enables the `http` embedding provider |
    /// | `REPO_EMBEDDING_MODEL` | `embedding.model` |
    ///
    /// Intended to be called once by the embedding application at startup.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .with_context(|| format!("{} environment variable not set", key))
        };

        let mut config = Self::new(
            required("REPO_ORG_SLUG")?,
            required("REPO_PROJECT_ID")?,
            required("REPO_STORE_URL")?,
            required("REPO_API_URL")?,
        );
        if let Some(rev) = lookup("REPO_REVISION").filter(|v| !v.trim().is_empty()) {
            config.revision = rev;
        }
        if let Some(url) = lookup("REPO_EMBEDDING_URL").filter(|v| !v.trim().is_empty()) {
            config.embedding.provider = "http".to_string();
            config.embedding.url = Some(url);
            config.embedding.model = lookup("REPO_EMBEDDING_MODEL");
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("org_slug", &self.org_slug),
            ("project_id", &self.project_id),
            ("revision", &self.revision),
        ] {
            if value.trim().is_empty() {
                bail!("{} must not be empty", name);
            }
        }

        for (name, value) in [("store_url", &self.store_url), ("api_url", &self.api_url)] {
            if !(value.starts_with("http://") || value.starts_with("https://")) {
                bail!("{} must be an http(s) URL, got '{}'", name, value);
            }
        }

        if !(0.0..=1.0).contains(&self.search.threshold) {
            bail!("search.threshold must be in [0.0, 1.0]");
        }
        if self.search.limit < 1 {
            bail!("search.limit must be >= 1");
        }
        if self.search.fields.is_empty() {
            bail!("search.fields must list at least one field");
        }

        for (name, segment) in [
            ("http", &self.cache.http),
            ("posts", &self.cache.posts),
            ("media", &self.cache.media),
            ("similarity", &self.cache.similarity),
        ] {
            if segment.max_entries == 0 {
                bail!("cache.{}.max_entries must be > 0", name);
            }
        }

        match self.embedding.provider.as_str() {
            "disabled" => {}
            "http" => {
                if self.embedding.url.is_none() {
                    bail!("embedding.url must be specified when provider is 'http'");
                }
            }
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled or http.",
                other
            ),
        }

        Ok(())
    }
}

/// Read and validate a TOML config file.
pub fn load_config(path: &Path) -> Result<ClientConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ClientConfig =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    config.validate()?;
    Ok(config)
}
