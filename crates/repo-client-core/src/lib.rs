//! # repo-client core
//!
//! Runtime-free logic for `repo-client`: entity models, vector math, and
//! the in-memory full-text index.
//!
//! This crate contains no tokio, HTTP, or filesystem dependencies; the
//! async fetch/cache engine lives in the `repo-client` crate.

pub mod embedding;
pub mod models;
pub mod search;
