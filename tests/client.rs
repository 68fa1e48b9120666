//! End-to-end tests for the client facade against an in-memory store.
//!
//! Every test wires a [`RepoClient`] to an [`InMemoryTransport`] and
//! asserts both the returned data and the exact number of network calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use repo_client::client::RepoClient;
use repo_client::config::{ClientConfig, LATEST};
use repo_client::embedding::{Embedder, ImageInput};
use repo_client::error::{Error, Result};
use repo_client::fetch::{FetchCache, FetchOptions};
use repo_client::search::{SearchMode, SearchRequest};
use repo_client::transport::memory::InMemoryTransport;
use repo_client::KeyKind;
use serde_json::json;

const STORE: &str = "https://store.test";
const API: &str = "https://api.test";
const ACTIVE: &str = "https://api.test/projects/blog/active-rev";

fn store_url(file: &str) -> String {
    format!("{}/acme/blog/{}", STORE, file)
}

fn config(revision: &str) -> ClientConfig {
    let mut config = ClientConfig::new("acme", "blog", STORE, API).with_revision(revision);
    config.resolver.prime_on_start = false;
    config
}

fn client_with(transport: &Arc<InMemoryTransport>, config: ClientConfig) -> RepoClient {
    RepoClient::builder(config)
        .transport(transport.clone())
        .build()
        .unwrap()
}

// ─── Revision + retrieval ───────────────────────────────────────────

#[tokio::test]
async fn test_latest_resolves_and_lookup_is_cached() {
    let transport = Arc::new(InMemoryTransport::new());
    transport.json(ACTIVE, json!("rev123"));
    transport.json(
        store_url("rev123/posts.json"),
        json!([{"hash": "h1", "slug": "s1", "title": "Hello"}]),
    );
    let client = client_with(&transport, config(LATEST));

    let post = client.get_post_by_slug("s1").await.unwrap().unwrap();
    assert_eq!(post.hash.as_deref(), Some("h1"));
    assert_eq!(post.title.as_deref(), Some("Hello"));
    assert_eq!(transport.calls(ACTIVE), 1);
    assert_eq!(transport.calls(&store_url("rev123/posts.json")), 1);

    let calls = transport.total_calls();
    let again = client.get_post_by_slug("s1").await.unwrap().unwrap();
    assert_eq!(again, post);
    assert_eq!(transport.total_calls(), calls, "second lookup makes no calls");

    assert_eq!(client.resolve_revision().await.unwrap(), "rev123");
    assert_eq!(transport.calls(ACTIVE), 1);
}

#[tokio::test]
async fn test_concurrent_first_lookups_resolve_once() {
    let transport = Arc::new(InMemoryTransport::new().with_latency(Duration::from_millis(20)));
    transport.json(ACTIVE, json!({"activeRev": "rev123"}));
    transport.json(
        store_url("rev123/posts.json"),
        json!([{"hash": "h1", "slug": "a"}, {"hash": "h2", "slug": "b"}]),
    );
    let client = client_with(&transport, config(LATEST));

    let (a, b, all) = tokio::join!(
        client.get_post_by_hash("h1"),
        client.get_post_by_hash("h2"),
        client.get_all_posts(true, false),
    );
    assert!(a.unwrap().is_some());
    assert!(b.unwrap().is_some());
    assert_eq!(all.unwrap().len(), 2);

    assert_eq!(transport.calls(ACTIVE), 1);
    assert_eq!(transport.calls(&store_url("rev123/posts.json")), 1);
}

#[tokio::test]
async fn test_primed_client_resolves_in_background() {
    let transport = Arc::new(InMemoryTransport::new());
    transport.json(ACTIVE, json!("rev7"));
    let mut config = config(LATEST);
    config.resolver.prime_on_start = true;
    let client = client_with(&transport, config);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.calls(ACTIVE), 1);
    assert_eq!(client.resolve_revision().await.unwrap(), "rev7");
    assert_eq!(transport.calls(ACTIVE), 1);
}

#[tokio::test]
async fn test_revision_failure_is_reported() {
    let transport = Arc::new(InMemoryTransport::new());
    transport.raw(ACTIVE, 500, "down");
    let client = client_with(&transport, config(LATEST));

    let err = client.get_post_by_slug("s1").await.unwrap_err();
    assert!(matches!(err, Error::Revision { .. }));
}

#[tokio::test]
async fn test_not_found_is_not_an_error() {
    let transport = Arc::new(InMemoryTransport::new());
    transport.json(store_url("r1/posts.json"), json!([{"hash": "h1"}]));
    transport.json(store_url("r1/media.json"), json!([]));
    let client = client_with(&transport, config("r1"));

    assert_eq!(client.get_post_by_hash("nonexistent").await.unwrap(), None);
    assert_eq!(client.get_post_by_path("nope.md").await.unwrap(), None);
    assert_eq!(client.get_media_by_hash("m0").await.unwrap(), None);
    assert!(matches!(
        client.get_post_by_slug("").await,
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn test_media_lookup_through_shared_file() {
    let transport = Arc::new(InMemoryTransport::new());
    transport.json(
        store_url("_shared/medias/m1.json"),
        json!({"hash": "m1", "path": "img/cat.png", "mimeType": "image/png", "width": 640}),
    );
    let client = client_with(&transport, config("r1"));

    let media = client.get_media_by_hash("m1").await.unwrap().unwrap();
    assert_eq!(media.mime_type.as_deref(), Some("image/png"));
    assert_eq!(media.width, Some(640));
    assert_eq!(transport.calls(&store_url("r1/media.json")), 0);

    // the path key was memoized with the entity
    let by_path = client.get_media_by_path("img/cat.png").await.unwrap().unwrap();
    assert_eq!(by_path, media);
    assert_eq!(transport.calls(&store_url("r1/media-path-map.json")), 0);
}

#[tokio::test]
async fn test_augment_posts_by_slug() {
    let transport = Arc::new(InMemoryTransport::new());
    transport.json(
        store_url("r1/posts.json"),
        json!([
            {"hash": "h1", "slug": "one"},
            {"hash": "h2", "slug": "two"},
            {"hash": "h3", "slug": "three"},
            {"hash": "h4", "slug": "four"},
        ]),
    );
    let client = client_with(&transport, config("r1"));

    let keys: Vec<String> = ["four", "missing", "two", "one", "three"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let posts = client
        .augment_posts(&keys, KeyKind::Slug, &Default::default())
        .await
        .unwrap();
    let slugs: Vec<_> = posts.iter().filter_map(|p| p.slug.as_deref()).collect();
    assert_eq!(slugs, vec!["four", "two", "one", "three"]);
}

// ─── Similarity ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_similarity_is_symmetric() {
    let transport = Arc::new(InMemoryTransport::new());
    transport.json(
        store_url("r1/posts-embedding-hash-map.json"),
        json!({"a": [1.0, 2.0, 3.0], "b": [3.0, 2.0, 1.0]}),
    );
    let client = client_with(&transport, config("r1"));

    let ab = client.similarity_by_hashes("a", "b").await.unwrap();
    let ba = client.similarity_by_hashes("b", "a").await.unwrap();
    assert_eq!(ab, ba);
    assert!((ab - 10.0 / 14.0).abs() < 1e-6);
    assert_eq!(client.similarity_by_hashes("a", "a").await.unwrap(), 1.0);
}

#[tokio::test]
async fn test_similar_posts() {
    let transport = Arc::new(InMemoryTransport::new());
    transport.json(
        store_url("r1/posts.json"),
        json!([
            {"hash": "a", "title": "A"},
            {"hash": "b", "title": "B"},
            {"hash": "c", "title": "C"},
        ]),
    );
    transport.json(
        store_url("r1/posts-embedding-hash-map.json"),
        json!({"a": [1.0, 0.0], "b": [0.0, 1.0], "c": [0.8, 0.2]}),
    );
    let client = client_with(&transport, config("r1"));

    let similar = client.similar_posts("a", 2).await.unwrap();
    let titles: Vec<_> = similar.iter().filter_map(|p| p.title.as_deref()).collect();
    assert_eq!(titles, vec!["C", "B"]);
}

// ─── Search ─────────────────────────────────────────────────────────

struct AxisEmbedder;

#[async_trait]
impl Embedder for AxisEmbedder {
    fn model_name(&self) -> &str {
        "axis"
    }
    async fn embed_text(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![1.0, 0.0])
    }
    async fn embed_clip_text(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![0.0, 1.0])
    }
    async fn embed_clip_image(&self, _image: &ImageInput) -> Result<Vec<f32>> {
        Ok(vec![0.0, 1.0])
    }
}

#[tokio::test]
async fn test_memory_and_vector_search() {
    let transport = Arc::new(InMemoryTransport::new());
    transport.json(
        store_url("r1/posts.json"),
        json!([
            {"hash": "h1", "title": "Async Rust", "content": "futures and executors"},
            {"hash": "h2", "title": "Sourdough", "content": "bread with rust colored crust"},
        ]),
    );
    transport.json(
        store_url("r1/posts-embedding-hash-map.json"),
        json!({"h1": [0.0, 1.0], "h2": [1.0, 0.0]}),
    );
    let client = RepoClient::builder(config("r1"))
        .transport(transport.clone())
        .embedder(Arc::new(AxisEmbedder))
        .build()
        .unwrap();

    let hits = client.search(&SearchRequest::text("rust")).await.unwrap();
    assert_eq!(hits[0].item.hash(), Some("h1"), "title matches rank first");
    assert_eq!(hits.len(), 2);

    let vector = client
        .search(&SearchRequest::text("anything").with_mode(SearchMode::VectorText))
        .await
        .unwrap();
    assert_eq!(vector.len(), 1);
    assert_eq!(vector[0].item.hash(), Some("h2"));

    let suggestions = client.autocomplete("bre", 3).await.unwrap();
    assert_eq!(suggestions, vec!["bread"]);

    let err = "hybrid".parse::<SearchMode>().unwrap_err();
    assert!(matches!(err, Error::UnsupportedMode(_)));
}

#[tokio::test]
async fn test_vector_search_with_disabled_embedder_fails() {
    let transport = Arc::new(InMemoryTransport::new());
    let client = client_with(&transport, config("r1"));

    let err = client
        .search(&SearchRequest::text("rust").with_mode(SearchMode::VectorText))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Embedding(_)));
}

// ─── Lifecycle ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_destroy_rejects_further_calls() {
    let transport = Arc::new(InMemoryTransport::new());
    transport.json(store_url("r1/posts.json"), json!([{"hash": "h1", "slug": "s1"}]));
    let client = client_with(&transport, config("r1"));

    assert!(client.get_post_by_slug("s1").await.unwrap().is_some());
    assert!(client.fetch_stats().cached > 0);

    client.destroy();
    assert!(client.is_destroyed());
    assert_eq!(client.fetch_stats().cached, 0);
    assert!(matches!(
        client.get_post_by_slug("s1").await,
        Err(Error::Destroyed)
    ));
    assert!(matches!(client.proxy_config(60), Err(Error::Destroyed)));
    client.destroy();
}

#[tokio::test]
async fn test_dropping_client_mid_lookup_releases_resources() {
    let transport = Arc::new(InMemoryTransport::new().with_latency(Duration::from_millis(50)));
    transport.json(ACTIVE, json!("rev1"));
    let mut config = config(LATEST);
    config.resolver.prime_on_start = true;
    let client = client_with(&transport, config);

    tokio::time::sleep(Duration::from_millis(5)).await;
    drop(client);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(Arc::strong_count(&transport), 1);
}

#[tokio::test]
async fn test_shared_fetch_cache_across_clients() {
    let transport = Arc::new(InMemoryTransport::new());
    transport.json(store_url("r1/posts.json"), json!([{"hash": "h1"}]));
    let fetch = Arc::new(FetchCache::new(
        transport.clone(),
        &config("r1").cache.http,
    ));

    let first = RepoClient::builder(config("r1"))
        .fetch_cache(fetch.clone())
        .build()
        .unwrap();
    let second = RepoClient::builder(config("r1"))
        .fetch_cache(fetch.clone())
        .build()
        .unwrap();
    assert_ne!(first.instance_id(), second.instance_id());

    first.get_all_posts(true, false).await.unwrap();
    second.get_all_posts(true, false).await.unwrap();
    assert_eq!(transport.calls(&store_url("r1/posts.json")), 1);

    // destroying one client leaves the shared responses in place
    first.destroy();
    assert_eq!(fetch.stats().cached, 1);
}

#[tokio::test]
async fn test_fetch_helpers_and_proxy() {
    let transport = Arc::new(InMemoryTransport::new());
    transport.json(store_url("r1/custom.json"), json!({"k": 1}));
    let client = client_with(&transport, config("r1"));

    let value = client
        .fetch_revision_file("custom.json", &FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(value["k"], 1);

    let fallback = client
        .fetch_json(
            &store_url("r1/missing.json"),
            &FetchOptions::default().with_default(json!([])),
        )
        .await
        .unwrap();
    assert_eq!(fallback.as_ref(), &json!([]));

    let proxy = client.proxy_config(600).unwrap();
    assert_eq!(proxy.target_url("/r1/posts.json"), store_url("r1/posts.json"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let transport = Arc::new(InMemoryTransport::new());
    let bad = ClientConfig::new("acme", "", STORE, API);
    let result = RepoClient::builder(bad).transport(transport).build();
    assert!(matches!(result, Err(Error::Validation(_))));
}
