//! # repo-client
//!
//! A revision-aware client for content published to a remote object store.
//!
//! A project's content (posts, media, similarity tables, embeddings) is
//! published as immutable JSON snapshots, one folder per revision, plus a
//! content-addressed `_shared` area. The client resolves which revision to
//! read, finds entities through a cascade of cheap-to-expensive lookups,
//! and keeps everything it fetched in bounded in-memory caches.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────┐
//!                    │  RepoClient  │
//!                    └──────┬───────┘
//!      ┌──────────────┬─────┴───────┬──────────────┐
//!      ▼              ▼             ▼              ▼
//! ┌──────────┐  ┌────────────┐ ┌──────────┐  ┌──────────┐
//! │Retrieval │  │ Similarity │ │  Search  │  │ Revision │
//! │post/media│  │            │ │ mem/vec  │  │ resolver │
//! └────┬─────┘  └─────┬──────┘ └────┬─────┘  └────┬─────┘
//!      └──────────────┴──────┬──────┴─────────────┘
//!                            ▼
//!                     ┌────────────┐     ┌───────────┐
//!                     │ FetchCache │────▶│ Transport │
//!                     │ LRU + 1×   │     │ reqwest / │
//!                     └────────────┘     │ in-memory │
//!                                        └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use repo_client::client::RepoClient;
//! use repo_client::config::ClientConfig;
//! use repo_client::search::SearchRequest;
//!
//! # async fn demo() -> repo_client::error::Result<()> {
//! let client = RepoClient::new(ClientConfig::new(
//!     "acme",
//!     "blog",
//!     "https://store.example.com",
//!     "https://api.example.com",
//! ))?;
//!
//! let post = client.get_post_by_slug("hello-world").await?;
//! let related = client.similar_posts("3f2a9c", 5).await?;
//! let hits = client.search(&SearchRequest::text("ownership")).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`client`] | Client facade and builder |
//! | [`config`] | TOML / environment configuration |
//! | [`error`] | Error taxonomy |
//! | [`fetch`] | JSON fetching with caching and single-flight |
//! | [`revision`] | `"latest"` revision resolution |
//! | [`retrieval`] | Cascade lookups by slug, hash, or path |
//! | [`similarity`] | Post similarity and related posts |
//! | [`search`] | Full-text and vector search |
//! | [`embedding`] | Embedding inference |
//! | [`urls`] | Store URLs and proxy helpers |
//! | [`transport`] | HTTP transport abstraction |
//! | [`cache`] | Bounded LRU caches with expiry |
//! | [`tasks`] | Background task tracking |

pub mod cache;
pub mod client;
pub mod config;
pub mod embedding;
pub mod error;
pub mod fetch;
pub mod retrieval;
pub mod revision;
pub mod search;
pub mod similarity;
pub mod tasks;
pub mod transport;
pub mod urls;

pub use repo_client_core::models::{Entity, KeyKind, MediaItem, Post};
