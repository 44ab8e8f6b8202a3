//! Quiet-period coalescing of repeated triggers
//!
//! Collapses any number of triggers arriving within the quiet period into
//! exactly one delayed execution of the most recent action. Used to fold
//! rapid-fire feed updates into a single recomputation and to suppress
//! duplicate public announcements.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

type Action = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Armed {
    /// Bumped on every trigger; a timer only fires if it still holds the
    /// latest value, so re-arming cancels the previous firing.
    seq: u64,
    pending: Option<Action>,
}

/// One coalescer per debounced target. Not shared across unrelated action
/// streams.
pub struct Debouncer {
    quiet: Duration,
    armed: Arc<Mutex<Armed>>,
}

impl Debouncer {
    /// A zero quiet period disables the mechanism: triggers execute
    /// immediately and synchronously, with no coalescing.
    pub fn new(quiet: Duration) -> Self {
        Self { quiet, armed: Arc::new(Mutex::new(Armed::default())) }
    }

    /// Schedule `action` to run once the quiet period has elapsed without a
    /// newer trigger. Only the action passed on the most recent trigger
    /// executes. Must be called from within a tokio runtime unless the quiet
    /// period is zero.
    pub fn trigger(&self, action: impl FnOnce() + Send + 'static) {
        if self.quiet.is_zero() {
            action();
            return;
        }

        let seq = {
            let mut armed = self.armed.lock();
            armed.seq += 1;
            armed.pending = Some(Box::new(action));
            armed.seq
        };

        let armed = Arc::clone(&self.armed);
        let quiet = self.quiet;
        tokio::spawn(async move {
            tokio::time::sleep(quiet).await;

            // take the action only if no newer trigger re-armed us; run it
            // outside the lock so it may trigger again
            let fired = {
                let mut armed = armed.lock();
                if armed.seq == seq {
                    armed.pending.take()
                } else {
                    trace!(seq, "debounce_superseded");
                    None
                }
            };
            if let Some(action) = fired {
                action();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const QUIET: Duration = Duration::from_millis(50);

    #[tokio::test(flavor = "multi_thread")]
    async fn test_burst_coalesces_to_one_execution() {
        let debouncer = Debouncer::new(QUIET);
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let c = Arc::clone(&count);
            debouncer.trigger(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(QUIET * 3).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_last_action_wins() {
        let debouncer = Debouncer::new(QUIET);
        let winner = Arc::new(AtomicUsize::new(0));

        for i in 1..=4 {
            let w = Arc::clone(&winner);
            debouncer.trigger(move || {
                w.store(i, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(QUIET * 3).await;
        assert_eq!(winner.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retrigger_after_firing_runs_again() {
        let debouncer = Debouncer::new(QUIET);
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        debouncer.trigger(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(QUIET * 3).await;

        let c = Arc::clone(&count);
        debouncer.trigger(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(QUIET * 3).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rearm_extends_the_delay() {
        let debouncer = Debouncer::new(QUIET);
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        debouncer.trigger(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        // keep re-arming well before the quiet period elapses
        for _ in 0..3 {
            tokio::time::sleep(QUIET / 5).await;
            let c = Arc::clone(&count);
            debouncer.trigger(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
            assert_eq!(count.load(Ordering::SeqCst), 0);
        }

        tokio::time::sleep(QUIET * 3).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_quiet_period_runs_synchronously() {
        let debouncer = Debouncer::new(Duration::ZERO);
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let c = Arc::clone(&count);
            debouncer.trigger(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }

        // no coalescing and no delay
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_action_may_retrigger_itself() {
        let debouncer = Arc::new(Debouncer::new(QUIET));
        let count = Arc::new(AtomicUsize::new(0));

        let d = Arc::clone(&debouncer);
        let c = Arc::clone(&count);
        debouncer.trigger(move || {
            c.fetch_add(1, Ordering::SeqCst);
            let c2 = Arc::clone(&c);
            d.trigger(move || {
                c2.fetch_add(1, Ordering::SeqCst);
            });
        });

        tokio::time::sleep(QUIET * 5).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
