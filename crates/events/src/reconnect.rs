//! Fixed-delay reconnection timer for the push channel.
//!
//! The bus keeps at most one pending reconnect. Scheduling again replaces
//! (aborts) the previous timer instead of stacking a second one, and the
//! delay is constant: every terminal close waits the same interval.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Single-slot delayed task.
pub(crate) struct ReconnectTimer {
    delay: Duration,
    pending: Option<JoinHandle<()>>,
}

impl ReconnectTimer {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: None,
        }
    }

    pub(crate) fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `fire` after the fixed delay, cancelling any timer already armed.
    pub(crate) fn schedule<F>(&mut self, fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let delay = self.delay;
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire.await;
        }));
    }

    /// Abort the armed timer. Returns whether one was pending.
    pub(crate) fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Forget the armed timer without aborting it. Used by the timer's own
    /// task once it has fired.
    pub(crate) fn clear(&mut self) {
        self.pending = None;
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

impl Drop for ReconnectTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn counting(counter: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_the_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = ReconnectTimer::new(Duration::from_millis(3_000));
        timer.schedule(counting(&fired));

        tokio::time::sleep(Duration::from_millis(2_999)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_the_pending_timer() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = ReconnectTimer::new(Duration::from_millis(3_000));
        timer.schedule(counting(&fired));
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        timer.schedule(counting(&fired));
        timer.schedule(counting(&fired));

        tokio::time::sleep(Duration::from_millis(10_000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = ReconnectTimer::new(Duration::from_millis(3_000));
        timer.schedule(counting(&fired));
        assert!(timer.is_pending());
        assert!(timer.cancel());
        assert!(!timer.is_pending());

        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
