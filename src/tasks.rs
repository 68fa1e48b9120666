//! Fire-and-forget background work owned by a client.
//!
//! Revision priming and collection side-loading run as detached tokio
//! tasks. Their handles are kept here so `destroy()` can abort them.
//! Outside a tokio runtime nothing is spawned and callers simply fall back
//! to doing the work on demand. After [`BackgroundTasks::abort_all`] the set
//! is closed and later spawns are refused.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Default)]
pub struct BackgroundTasks {
    handles: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `fut` on the current runtime. Returns `false` when no runtime
    /// is available or the set has been closed.
    pub fn spawn<F>(&self, name: &'static str, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(handle) = Handle::try_current() else {
            debug!(task = name, "no tokio runtime, skipping background task");
            return false;
        };

        let mut handles = self.handles.lock();
        // checked under the lock so abort_all cannot miss a handle
        if self.closed.load(Ordering::Acquire) {
            debug!(task = name, "background tasks closed, skipping");
            return false;
        }
        handles.retain(|h| !h.is_finished());
        handles.push(handle.spawn(fut));
        debug!(task = name, "spawned background task");
        true
    }

    /// Tasks that have not finished yet.
    pub fn pending(&self) -> usize {
        self.handles.lock().iter().filter(|h| !h.is_finished()).count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Abort every running task and refuse new ones.
    pub fn abort_all(&self) {
        let mut handles = self.handles.lock();
        self.closed.store(true, Ordering::Release);
        for handle in handles.drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_spawn_without_runtime() {
        let tasks = BackgroundTasks::new();
        assert!(!tasks.spawn("noop", async {}));
        assert_eq!(tasks.pending(), 0);
    }

    #[tokio::test]
    async fn test_abort_all() {
        let tasks = BackgroundTasks::new();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        assert!(tasks.spawn("sleeper", async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            flag.store(true, Ordering::SeqCst);
        }));
        assert_eq!(tasks.pending(), 1);

        tasks.abort_all();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tasks.pending(), 0);
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_spawn_after_abort_is_refused() {
        let tasks = BackgroundTasks::new();
        tasks.abort_all();
        assert!(tasks.is_closed());

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        assert!(!tasks.spawn("late", async move {
            flag.store(true, Ordering::SeqCst);
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(tasks.pending(), 0);
    }
}
