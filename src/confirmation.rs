//! Tracks acknowledgements the device still owes us.
//!
//! Every action that makes the device answer with a stream message (for
//! example disabling logging, which triggers a log dump) bumps the count;
//! every complete message received brings it back down.

use std::sync::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct ConfirmationTracker {
    pending: Mutex<usize>,
    settled: Notify,
}

impl ConfirmationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_one(&self) {
        *self.lock() += 1;
    }

    /// A confirmation nobody is waiting for is ignored.
    pub fn on_ack_observed(&self) {
        let mut pending = self.lock();
        if *pending > 0 {
            *pending -= 1;
            self.settled.notify_waiters();
        }
    }

    pub fn pending(&self) -> usize {
        *self.lock()
    }

    pub async fn wait_until_settled(&self) {
        loop {
            // Registered before the check so a decrement in between is not lost.
            let notified = self.settled.notified();
            if *self.lock() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, usize> {
        // The count is a plain integer, a poisoned lock still holds a valid value.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_settles_immediately_when_nothing_expected() {
        let tracker = ConfirmationTracker::new();
        tokio::time::timeout(Duration::from_millis(50), tracker.wait_until_settled())
            .await
            .expect("should not block");
    }

    #[tokio::test]
    async fn test_balanced_expect_and_ack_does_not_block() {
        let tracker = ConfirmationTracker::new();
        tracker.expect_one();
        tracker.expect_one();
        tracker.on_ack_observed();
        tracker.expect_one();
        tracker.on_ack_observed();
        tracker.on_ack_observed();
        assert_eq!(tracker.pending(), 0);
        tokio::time::timeout(Duration::from_millis(50), tracker.wait_until_settled())
            .await
            .expect("should not block");
    }

    #[test]
    fn test_extra_ack_is_a_noop() {
        let tracker = ConfirmationTracker::new();
        tracker.on_ack_observed();
        assert_eq!(tracker.pending(), 0);
        tracker.expect_one();
        tracker.on_ack_observed();
        tracker.on_ack_observed();
        assert_eq!(tracker.pending(), 0);
        tracker.expect_one();
        assert_eq!(tracker.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_wakes_on_last_ack() {
        let tracker = Arc::new(ConfirmationTracker::new());
        tracker.expect_one();
        tracker.expect_one();

        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.wait_until_settled().await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        tracker.on_ack_observed();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        tracker.on_ack_observed();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }
}
