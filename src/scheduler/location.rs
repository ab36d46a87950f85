//! Location-send coordination built on [`super::ActionScheduler`] (C9 use
//! case, SPEC_FULL.md §4.9).
//!
//! The decision to send ("pending" signal) is made by an external policy
//! component that is out of scope for this crate; this module only reacts
//! to that signal: it starts a cancellable timer, exposes a manual trigger
//! and a manual cancel, and reports every outcome to the dashboard.
//! Performing the SMS itself is also out of scope — [`LocationSender`] is
//! the seam where a real SMS adapter would plug in.

use crate::dashboard::Broadcaster;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[async_trait]
pub trait LocationSender: Send + Sync {
    async fn send(&self, call_id: &str, caller: &str) -> anyhow::Result<()>;
}

/// Stand-in for the out-of-scope SMS integration: logs instead of sending.
/// Test-mode call ids (`TEST-` prefix) always use this path regardless of
/// the configured sender.
pub struct LoggingLocationSender;

#[async_trait]
impl LocationSender for LoggingLocationSender {
    async fn send(&self, call_id: &str, caller: &str) -> anyhow::Result<()> {
        info!(call_id, caller, "location send (stub adapter, no SMS provider configured)");
        Ok(())
    }
}

pub struct LocationCoordinator {
    scheduler: Arc<super::ActionScheduler>,
    sender: Arc<dyn LocationSender>,
    broadcaster: Arc<Broadcaster>,
}

impl LocationCoordinator {
    pub fn new(
        scheduler: Arc<super::ActionScheduler>,
        sender: Arc<dyn LocationSender>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        LocationCoordinator {
            scheduler,
            sender,
            broadcaster,
        }
    }

    /// Reacts to an external "pending" signal: schedules a send at
    /// `now + timeout`, broadcasting the pending state immediately.
    pub async fn start_pending(
        &self,
        call_id: &str,
        caller: &str,
        confidence: f64,
        reason: &str,
        timeout: Duration,
    ) {
        self.broadcaster
            .location_send_pending(call_id, caller, confidence, reason, timeout.as_secs())
            .await;

        let sender = self.sender_for(call_id);
        let broadcaster = self.broadcaster.clone();
        let call_id_owned = call_id.to_string();
        let caller_owned = caller.to_string();

        self.scheduler
            .schedule(call_id.to_string(), timeout, async move {
                let success = sender.send(&call_id_owned, &caller_owned).await.is_ok();
                broadcaster
                    .location_sent(&call_id_owned, &caller_owned, "timeout", success)
                    .await;
            })
            .await;
    }

    /// Manual trigger (dashboard `send_location`): cancels the timer and
    /// sends immediately.
    pub async fn send_now(&self, call_id: &str, caller: &str) {
        self.scheduler.cancel(call_id).await;
        let success = self.sender_for(call_id).send(call_id, caller).await.is_ok();
        self.broadcaster
            .location_sent(call_id, caller, "manual", success)
            .await;
    }

    /// Test-mode call ids (`TEST-` prefix) always route to the logging stub,
    /// regardless of the configured sender, so test traffic never reaches a
    /// real SMS provider.
    fn sender_for(&self, call_id: &str) -> Arc<dyn LocationSender> {
        if call_id.starts_with("TEST-") {
            Arc::new(LoggingLocationSender)
        } else {
            self.sender.clone()
        }
    }

    /// Manual cancel (dashboard `cancel_location`): cancels without sending.
    pub async fn cancel(&self, call_id: &str) {
        if self.scheduler.cancel(call_id).await {
            self.broadcaster.location_cancelled(call_id).await;
        }
    }
}
