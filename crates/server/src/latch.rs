use std::sync::OnceLock;

use tokio::sync::Notify;

/// A one-shot latch that records why something closed.
///
/// Multiple actors may race to trigger it; the first reason wins and every
/// later trigger is absorbed. Waiters registered before or after the trigger
/// all observe the winning reason.
#[derive(Debug, Default)]
pub struct CloseLatch<R> {
    reason: OnceLock<R>,
    notify: Notify,
}

impl<R> CloseLatch<R> {
    pub fn new() -> Self {
        Self {
            reason: OnceLock::new(),
            notify: Notify::new(),
        }
    }

    /// Trigger the latch. Returns true if this call won the race.
    pub fn trigger(&self, reason: R) -> bool {
        let won = self.reason.set(reason).is_ok();
        if won {
            self.notify.notify_waiters();
        }
        won
    }

    pub fn is_triggered(&self) -> bool {
        self.reason.get().is_some()
    }

    pub fn reason(&self) -> Option<&R> {
        self.reason.get()
    }

    /// Wait until the latch is triggered and return the winning reason.
    pub async fn triggered(&self) -> &R {
        loop {
            // Register interest before checking, so a trigger that lands
            // between the check and the await still wakes us.
            let notified = self.notify.notified();
            if let Some(reason) = self.reason.get() {
                return reason;
            }
            notified.await;
        }
    }
}
