//! Error taxonomy for the client.
//!
//! "Not found" is never an error: getters return `Ok(None)` or an empty
//! `Vec` when an entity does not exist. Errors are reserved for bad input,
//! transport failures, and failed revision resolution.
//!
//! [`Error`] is `Clone` because a single failure is handed to every caller
//! waiting on the same in-flight request.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Missing or malformed arguments, rejected before any I/O.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// The server answered with a non-success status.
    #[error("{message}")]
    Http {
        status: u16,
        url: String,
        message: String,
    },

    /// The body could not be parsed as JSON.
    #[error("invalid JSON from {url}: {message}")]
    Json { url: String, message: String },

    /// The request never produced a response.
    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("could not determine latest revision for project {project_id}: {message}")]
    Revision { project_id: String, message: String },

    #[error("unsupported search mode '{0}'. Use memory, vector, vector-text, vector-clip-text, or vector-clip-image.")]
    UnsupportedMode(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("client has been destroyed")]
    Destroyed,
}

impl Error {
    /// Build an [`Error::Http`] with a message chosen by status class.
    pub fn from_status(status: u16, url: &str) -> Self {
        let message = match status {
            404 => format!("Resource not found (404) at {}", url),
            401 => format!("Unauthorized (401) fetching {}", url),
            403 => format!("Access forbidden (403) for {}", url),
            429 => format!("Rate limited (429) fetching {}", url),
            500..=599 => format!("Server error ({}) fetching {}", status, url),
            other => format!("HTTP error ({}) fetching {}", other, url),
        };
        Error::Http {
            status,
            url: url.to_string(),
            message,
        }
    }

    /// HTTP status, when the failure came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Rate limits, server errors, and network failures may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http { status, .. } => *status == 429 || *status >= 500,
            Error::Network { .. } => true,
            _ => false,
        }
    }
}

/// Reject empty or whitespace-only string keys.
pub(crate) fn require_key<'a>(value: &'a str, name: &str) -> Result<&'a str> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!(
            "{} must be a non-empty string",
            name
        )));
    }
    Ok(value)
}
