//! Entity models served by the remote store.
//!
//! Posts and media items are plain JSON records addressed by up to three
//! independent keys (see [`KeyKind`]). None of the keys is guaranteed to be
//! present on every record, so every accessor returns an `Option`.
//!
//! Fields this crate does not interpret are kept in `extra` so a record
//! serializes back to what the store sent.

use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::search::Indexable;

/// The three ways an entity can be addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// Content-addressed identifier, stable across revisions.
    Hash,
    /// Human-readable identifier, stable within a revision.
    Slug,
    /// Location of the source file the entity was built from.
    Path,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Hash => "hash",
            KeyKind::Slug => "slug",
            KeyKind::Path => "path",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record that can be looked up by hash, slug, or path.
///
/// Implemented by [`Post`] and [`MediaItem`]; the retrieval engine is
/// generic over this trait.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn hash(&self) -> Option<&str>;
    fn slug(&self) -> Option<&str>;
    fn path(&self) -> Option<&str>;

    /// Publication timestamp used for recency ordering.
    fn date(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Returns the value of the given key, if the record carries it.
    fn key(&self, kind: KeyKind) -> Option<&str> {
        match kind {
            KeyKind::Hash => self.hash(),
            KeyKind::Slug => self.slug(),
            KeyKind::Path => self.path(),
        }
    }
}

/// A published post.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    /// Markdown-free body text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plain: Option<String>,
    /// `null`, a single string, or a list; non-string entries are dropped.
    #[serde(
        default,
        deserialize_with = "lenient_tags",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub tags: Vec<String>,
    /// ISO 8601 date or datetime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity for Post {
    fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    fn slug(&self) -> Option<&str> {
        self.slug.as_deref()
    }

    fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    fn date(&self) -> Option<DateTime<Utc>> {
        self.date.as_deref().and_then(parse_date)
    }
}

impl Indexable for Post {
    fn field_text(&self, field: &str) -> Option<Cow<'_, str>> {
        match field {
            "title" => self.title.as_deref().map(Cow::Borrowed),
            "content" => self.content.as_deref().map(Cow::Borrowed),
            "excerpt" => self.excerpt.as_deref().map(Cow::Borrowed),
            "plain" => self.plain.as_deref().map(Cow::Borrowed),
            "tags" if !self.tags.is_empty() => Some(Cow::Owned(self.tags.join(" "))),
            _ => None,
        }
    }
}

/// An image or other media asset referenced by posts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_dimension",
        skip_serializing_if = "Option::is_none"
    )]
    pub width: Option<u32>,
    #[serde(
        default,
        deserialize_with = "lenient_dimension",
        skip_serializing_if = "Option::is_none"
    )]
    pub height: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity for MediaItem {
    fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    fn slug(&self) -> Option<&str> {
        self.slug.as_deref()
    }

    fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }
}

fn lenient_tags<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(tag) if !tag.trim().is_empty() => Some(tag),
                _ => None,
            })
            .collect(),
        Value::String(tag) if !tag.trim().is_empty() => vec![tag],
        _ => Vec::new(),
    })
}

/// Pixel sizes arrive as integers, floats, or numeric strings. Anything
/// else, or a value outside `u32`, becomes `None`.
fn lenient_dimension<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let number = match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(number
        .filter(|n| n.is_finite() && *n >= 0.0 && *n <= f64::from(u32::MAX))
        .map(|n| n.round() as u32))
}

/// Parse an RFC 3339 datetime or a bare `YYYY-MM-DD` date.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}
