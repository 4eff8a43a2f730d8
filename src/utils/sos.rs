//! Signal-of-Stop: cooperative cancellation primitive.
//!
//! Every long-lived task (relay I/O, peer negotiation, channel workers)
//! selects on one of these. Children let a per-connection stop fire
//! independently while still following a node-wide shutdown.

use futures_util::future::select_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A cooperative cancellation token.
///
/// Clones share the same underlying state, so cancelling any clone
/// notifies all waiters.
#[derive(Debug, Default, Clone)]
pub struct SignalOfStop {
    internal: Arc<SharedState>,
    /// Every ancestor, root first.
    lineage: Vec<Arc<SharedState>>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
}

impl SharedState {
    fn cancelled(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel is not missed.
            notified.as_mut().enable();
            if self.cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl SignalOfStop {
    /// Create a new, uncancelled signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that fires when it, `self`, or any of `self`'s ancestors
    /// is cancelled. Cancelling the child leaves `self` untouched.
    pub fn child(&self) -> Self {
        let mut lineage = self.lineage.clone();
        lineage.push(self.internal.clone());
        Self {
            internal: Arc::new(SharedState::default()),
            lineage,
        }
    }

    /// Signal cancellation to all waiters.
    pub fn cancel(&self) {
        self.internal.closing.store(true, Ordering::Release);
        self.internal.notify.notify_waiters();
    }

    /// Check if cancellation has been signaled.
    pub fn cancelled(&self) -> bool {
        self.internal.cancelled() || self.lineage.iter().any(|s| s.cancelled())
    }

    /// Wait for cancellation. Returns immediately if already cancelled.
    pub async fn wait(&self) {
        if self.lineage.is_empty() {
            return self.internal.wait().await;
        }
        let waits = std::iter::once(&self.internal)
            .chain(self.lineage.iter())
            .map(|state| Box::pin(state.wait()));
        select_all(waits).await;
    }
}
