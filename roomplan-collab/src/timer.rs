//! Cancellable one-shot timer owned by a session.

use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep_until, Instant, Sleep};

/// A single pending deadline, or nothing.
///
/// Re-arming replaces the previous deadline, so there is never more than
/// one outstanding firing. Dropping or cancelling the timer discards it.
#[derive(Debug, Default)]
pub struct Timer {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `after` from now. Delays too large to represent are clamped to
    /// a deadline that never arrives in practice.
    pub fn arm(&mut self, after: Duration) {
        let deadline = deadline_after(after);
        match self.sleep.as_mut() {
            Some(s) => s.as_mut().reset(deadline),
            None => self.sleep = Some(Box::pin(sleep_until(deadline))),
        }
    }

    pub fn cancel(&mut self) {
        self.sleep = None;
    }

    pub fn is_armed(&self) -> bool {
        self.sleep.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.sleep.as_ref().map(|s| s.deadline())
    }

    /// Resolves when the deadline passes, disarming the timer.
    /// Never resolves while disarmed. Cancel-safe.
    pub async fn fired(&mut self) {
        match self.sleep.as_mut() {
            Some(s) => {
                s.as_mut().await;
                self.sleep = None;
            }
            None => std::future::pending().await,
        }
    }
}

/// Roughly 30 years.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after.min(FAR_FUTURE))
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}
