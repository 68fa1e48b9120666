//! Resolution of the `"latest"` revision alias.
//!
//! A pinned revision is returned as-is and never touches the network. For
//! `"latest"`, the resolver keeps the last resolved id for `ttl`; once it
//! expires, the next caller starts exactly one lookup against the project
//! API and every concurrent caller awaits that same lookup.
//!
//! ```text
//! resolve()
//!   ├─ pinned ───────────────────────▶ requested revision
//!   ├─ resolved and younger than ttl ─▶ cached id
//!   ├─ lookup in flight ─────────────▶ await it
//!   └─ start lookup ─▶ GET active-rev ─▶ cache id + timestamp
//! ```
//!
//! Failures are reported as [`Error::Revision`] and are not cached.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::LATEST;
use crate::error::{Error, Result};
use crate::fetch::{FetchCache, FetchOptions};
use crate::tasks::BackgroundTasks;
use crate::urls::UrlBuilder;

type PendingResolve = Shared<BoxFuture<'static, Result<String>>>;

#[derive(Default)]
struct ResolverState {
    resolved: Option<(String, Instant)>,
    pending: Option<(u64, PendingResolve)>,
    generation: u64,
}

struct Inner {
    requested: String,
    project_id: String,
    url: String,
    ttl: Duration,
    fetch: Arc<FetchCache>,
    state: Mutex<ResolverState>,
}

/// Cheaply cloneable handle; clones share state.
#[derive(Clone)]
pub struct RevisionResolver {
    inner: Arc<Inner>,
}

/// Clears the pending lookup once it settles.
struct PendingGuard {
    inner: Weak<Inner>,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let finished = {
            let mut state = inner.state.lock();
            match &state.pending {
                Some((id, _)) if *id == self.id => state.pending.take(),
                _ => None,
            }
        };
        drop(finished);
    }
}

impl RevisionResolver {
    pub fn new(
        requested: impl Into<String>,
        urls: &UrlBuilder,
        fetch: Arc<FetchCache>,
        ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                requested: requested.into(),
                project_id: urls.project_id().to_string(),
                url: urls.active_revision_url(),
                ttl,
                fetch,
                state: Mutex::new(ResolverState::default()),
            }),
        }
    }

    /// The revision the client was configured with.
    pub fn requested(&self) -> &str {
        &self.inner.requested
    }

    /// `true` when a concrete revision was configured.
    pub fn is_pinned(&self) -> bool {
        self.inner.requested != LATEST
    }

    /// The concrete revision, if known and fresh, without any I/O.
    pub fn cached(&self) -> Option<String> {
        if self.is_pinned() {
            return Some(self.inner.requested.clone());
        }
        let state = self.inner.state.lock();
        state
            .resolved
            .as_ref()
            .filter(|(_, at)| at.elapsed() < self.inner.ttl)
            .map(|(rev, _)| rev.clone())
    }

    /// Forget the resolved id so the next call resolves again.
    pub fn invalidate(&self) {
        let pending = {
            let mut state = self.inner.state.lock();
            state.resolved = None;
            state.pending.take()
        };
        drop(pending);
    }

    /// Resolve to a concrete revision id.
    pub async fn resolve(&self) -> Result<String> {
        if self.is_pinned() {
            return Ok(self.inner.requested.clone());
        }

        let pending = {
            let mut state = self.inner.state.lock();
            if let Some((rev, at)) = &state.resolved {
                if at.elapsed() < self.inner.ttl {
                    return Ok(rev.clone());
                }
            }
            match &state.pending {
                Some((_, pending)) => {
                    debug!(project = %self.inner.project_id, "joining in-flight revision lookup");
                    pending.clone()
                }
                None => {
                    state.generation += 1;
                    let id = state.generation;
                    let pending = self.start_lookup(id);
                    state.pending = Some((id, pending.clone()));
                    pending
                }
            }
        };

        pending.await
    }

    /// Resolve in the background so the first real caller finds a warm
    /// value. Returns `false` when nothing was spawned.
    pub fn prime(&self, tasks: &BackgroundTasks) -> bool {
        if self.is_pinned() {
            return false;
        }
        let resolver = self.clone();
        tasks.spawn("prime-revision", async move {
            if let Err(e) = resolver.resolve().await {
                warn!(error = %e, "background revision lookup failed");
            }
        })
    }

    /// The lookup future lives in `state.pending`, so it only holds a weak
    /// reference back to `Inner`.
    fn start_lookup(&self, id: u64) -> PendingResolve {
        let weak = Arc::downgrade(&self.inner);
        let fetch = Arc::clone(&self.inner.fetch);
        let url = self.inner.url.clone();
        let project_id = self.inner.project_id.clone();
        async move {
            let _guard = PendingGuard {
                inner: weak.clone(),
                id,
            };
            let result = lookup_active_revision(&fetch, &url, &project_id).await;
            match &result {
                Ok(rev) => {
                    info!(project = %project_id, revision = %rev, "resolved latest revision");
                    if let Some(inner) = weak.upgrade() {
                        inner.state.lock().resolved = Some((rev.clone(), Instant::now()));
                    }
                }
                Err(e) => warn!(project = %project_id, error = %e, "revision lookup failed"),
            }
            result
        }
        .boxed()
        .shared()
    }
}

async fn lookup_active_revision(fetch: &FetchCache, url: &str, project_id: &str) -> Result<String> {
    let revision_error = |message: String| Error::Revision {
        project_id: project_id.to_string(),
        message,
    };

    let body = fetch
        .fetch_json(url, &FetchOptions::default().no_cache())
        .await
        .map_err(|e| revision_error(e.to_string()))?;

    extract_revision(&body)
        .ok_or_else(|| revision_error("response did not contain a revision id".to_string()))
}

/// Accepts a bare JSON string or an object carrying the id under a
/// well-known key, optionally wrapped in `data`.
fn extract_revision(body: &Value) -> Option<String> {
    match body {
        Value::String(rev) if !rev.trim().is_empty() => Some(rev.clone()),
        Value::Object(map) => ["activeRev", "rev", "revision", "id"]
            .iter()
            .find_map(|key| {
                map.get(*key)
                    .and_then(Value::as_str)
                    .filter(|s| !s.trim().is_empty())
                    .map(str::to_string)
            })
            .or_else(|| map.get("data").and_then(extract_revision)),
        _ => None,
    }
}
