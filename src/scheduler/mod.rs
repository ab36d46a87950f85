//! Scheduled-action manager (C9): named, cancellable, delayed one-shot
//! actions keyed by call id. Used for the delayed SMS-location-send flow.
//!
//! Grounded on `soul/scheduler.rs`'s `TaskScheduler` (a keyed task map behind
//! a `tokio::sync::Mutex`, executors stored as boxed futures), simplified
//! from its cron/interval/recurring model to a single one-shot-cancellable-
//! by-key primitive matching `location_integration.py`'s
//! `schedule_location_send`/`cancel_location_send` usage.

pub mod location;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Scheduler keyed by an arbitrary string (typically `call_id` or
/// `call_id:tag`). Scheduling a new action for an existing key cancels the
/// previous one first.
pub struct ActionScheduler {
    handles: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl ActionScheduler {
    pub fn new() -> Self {
        ActionScheduler {
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Schedules `action` to run after `delay`. If a pending action already
    /// exists for `key`, it is cancelled first so at most one action per key
    /// is ever pending.
    pub async fn schedule<F>(&self, key: impl Into<String>, delay: std::time::Duration, action: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        self.cancel(&key).await;

        let handles = self.handles.clone();
        let key_for_task = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
            handles.lock().await.remove(&key_for_task);
        });

        self.handles.lock().await.insert(key, handle);
    }

    /// Cancels any pending action for `key`. Idempotent: cancelling an
    /// already-cancelled or never-scheduled key is a no-op.
    pub async fn cancel(&self, key: &str) -> bool {
        if let Some(handle) = self.handles.lock().await.remove(key) {
            handle.abort();
            debug!(key, "cancelled pending scheduled action");
            true
        } else {
            false
        }
    }

    pub async fn has_pending(&self, key: &str) -> bool {
        self.handles.lock().await.contains_key(key)
    }
}

impl Default for ActionScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn fires_after_delay_when_not_cancelled() {
        let scheduler = ActionScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        scheduler
            .schedule("CALL1", Duration::from_millis(10), async move {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_prevents_firing() {
        let scheduler = ActionScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        scheduler
            .schedule("CALL1", Duration::from_millis(30), async move {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert!(scheduler.cancel("CALL1").await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let scheduler = ActionScheduler::new();
        assert!(!scheduler.cancel("UNKNOWN").await);
        assert!(!scheduler.cancel("UNKNOWN").await);
    }

    #[tokio::test]
    async fn rescheduling_the_same_key_cancels_the_previous_action() {
        let scheduler = ActionScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f1 = fired.clone();
        scheduler
            .schedule("CALL1", Duration::from_millis(20), async move {
                f1.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        let f2 = fired.clone();
        scheduler
            .schedule("CALL1", Duration::from_millis(20), async move {
                f2.fetch_add(10, Ordering::SeqCst);
            })
            .await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }
}
