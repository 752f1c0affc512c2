/// Hierarchical cancellation
///
/// A token cancels itself and every token derived from it; cancelling a child
/// never reaches the parent. The engine layers caller token, run timeout and
/// per-attempt scope this way.
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Inner {
    state: watch::Sender<bool>,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn new(cancelled: bool) -> Self {
        let (state, _) = watch::channel(cancelled);
        Self {
            state,
            children: Mutex::new(Vec::new()),
        }
    }

    fn cancel(&self) {
        // send_replace succeeds without receivers
        if self.state.send_replace(true) {
            return;
        }
        let children = {
            let mut guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new(false)),
        }
    }

    /// Token cancelled together with `self`, but cancellable on its own
    pub fn child_token(&self) -> CancelToken {
        let child = Arc::new(Inner::new(false));
        {
            let mut children = self.inner.children.lock().unwrap_or_else(|e| e.into_inner());
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child));
        }
        // Parent may have been cancelled before registration
        if self.is_cancelled() {
            child.cancel();
        }
        CancelToken { inner: child }
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.state.borrow()
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Run `future` unless the token is cancelled first
    pub async fn run_until_cancelled<F: Future>(&self, future: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancelled() => None,
            output = future => Some(output),
        }
    }

    /// Cancel this token once `duration` elapses. Abort the returned handle to
    /// disarm the timer.
    pub fn cancel_after(&self, duration: Duration) -> JoinHandle<()> {
        let token = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(duration) => {
                    tracing::debug!("Cancelling after {:?}", duration);
                    token.cancel();
                }
            }
        })
    }
}
