//! Timers requested by the child.
//!
//! Each timer is a tokio task that re-injects `Request::Timer { token }` into the
//! owning instance's inbox. Tasks hold a weak sender, so a pending timer never
//! keeps a terminated instance alive.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::bridge::protocol::TimerToken;
use crate::instance::Request;

const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    OneShot,
    Repeating,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimerError {
    #[error("no timer registered for token {0}")]
    UnknownToken(TimerToken),
}

struct TimerEntry {
    kind: TimerKind,
    task: JoinHandle<()>,
}

/// Token-keyed timer table owned by a single instance.
pub struct TimerRegistry {
    inbox: mpsc::WeakSender<Request>,
    timers: HashMap<TimerToken, TimerEntry>,
}

impl TimerRegistry {
    pub(crate) fn new(inbox: mpsc::WeakSender<Request>) -> Self {
        Self {
            inbox,
            timers: HashMap::new(),
        }
    }

    /// Start a timer under `token`. An existing timer with the same token is replaced.
    pub fn schedule(&mut self, token: TimerToken, delay: Duration, kind: TimerKind) {
        let inbox = self.inbox.clone();
        let fired = token.clone();
        let task = match kind {
            TimerKind::OneShot => tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                fire(&inbox, fired).await;
            }),
            TimerKind::Repeating => tokio::spawn(async move {
                let period = delay.max(MIN_PERIOD);
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if !fire(&inbox, fired.clone()).await {
                        break;
                    }
                }
            }),
        };

        tracing::debug!(%token, ?kind, delay_ms = delay.as_millis() as u64, "Timer scheduled");
        if let Some(old) = self.timers.insert(token.clone(), TimerEntry { kind, task }) {
            tracing::warn!(%token, "Timer token reused, replacing previous timer");
            old.task.abort();
        }
    }

    /// Stop and forget the timer under `token`.
    ///
    /// A one-shot that has already fired is still registered, so cancelling it
    /// is a no-op success.
    pub fn cancel(&mut self, token: &TimerToken) -> Result<(), TimerError> {
        let entry = self
            .timers
            .remove(token)
            .ok_or_else(|| TimerError::UnknownToken(token.clone()))?;
        entry.task.abort();
        tracing::debug!(%token, kind = ?entry.kind, "Timer cancelled");
        Ok(())
    }

    /// Whether a fired tick for `token` should still be delivered.
    pub fn is_registered(&self, token: &TimerToken) -> bool {
        self.timers.contains_key(token)
    }

    pub fn kind(&self, token: &TimerToken) -> Option<TimerKind> {
        self.timers.get(token).map(|e| e.kind)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Abort every timer.
    pub fn clear(&mut self) {
        for (_, entry) in self.timers.drain() {
            entry.task.abort();
        }
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Returns false once the instance is gone.
async fn fire(inbox: &mpsc::WeakSender<Request>, token: TimerToken) -> bool {
    let Some(tx) = inbox.upgrade() else {
        return false;
    };
    tracing::trace!(%token, "Timer fired");
    tx.send(Request::Timer { token }).await.is_ok()
}
