// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-shot cancellable retry timer.
//!
//! Each connector owns one [`RetryTimer`]. Arming it replaces any pending
//! timer, cancelling it aborts the sleeping task. A generation counter makes
//! a timer that fires concurrently with a cancellation a no-op: the task only
//! runs its action if the slot still holds its own generation.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

struct Armed {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    next_generation: u64,
    armed: Option<Armed>,
}

/// Single-shot cancellable timer.
pub struct RetryTimer {
    name: String,
    slot: Arc<Mutex<Slot>>,
}

impl RetryTimer {
    /// Create an idle timer. `name` only appears in logs.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Run `action` after `delay`, replacing any pending timer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn arm<F, Fut>(&self, delay: Duration, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.slot.lock();
        if let Some(previous) = slot.armed.take() {
            previous.handle.abort();
        }
        slot.next_generation += 1;
        let generation = slot.next_generation;

        let shared = Arc::clone(&self.slot);
        let name = self.name.clone();
        // The task cannot observe the slot before we release the lock below,
        // so `armed` is always populated when it checks its generation.
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slot = shared.lock();
                match &slot.armed {
                    Some(armed) if armed.generation == generation => {
                        slot.armed = None;
                    }
                    _ => {
                        trace!("{}: stale timer generation {} ignored", name, generation);
                        return;
                    }
                }
            }
            trace!("{}: timer fired", name);
            action().await;
        });
        slot.armed = Some(Armed { generation, handle });
    }

    /// Cancel the pending timer. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        let mut slot = self.slot.lock();
        slot.next_generation += 1;
        match slot.armed.take() {
            Some(armed) => {
                armed.handle.abort();
                trace!("{}: timer cancelled", self.name);
                true
            }
            None => false,
        }
    }

    /// Whether a timer is armed and has not fired yet.
    pub fn is_pending(&self) -> bool {
        self.slot.lock().armed.is_some()
    }
}

impl Drop for RetryTimer {
    fn drop(&mut self) {
        if let Some(armed) = self.slot.lock().armed.take() {
            armed.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_action(counter: &Arc<AtomicUsize>) -> impl FnOnce() -> std::future::Ready<()> {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test]
    async fn test_fires_once() {
        let timer = RetryTimer::new("test");
        let fired = Arc::new(AtomicUsize::new(0));
        timer.arm(Duration::from_millis(10), counter_action(&fired));
        assert!(timer.is_pending());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());
    }

    #[tokio::test]
    async fn test_cancel_prevents_fire() {
        let timer = RetryTimer::new("test");
        let fired = Arc::new(AtomicUsize::new(0));
        timer.arm(Duration::from_millis(20), counter_action(&fired));
        assert!(timer.cancel());
        assert!(!timer.cancel());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rearm_replaces_pending() {
        let timer = RetryTimer::new("test");
        let fired = Arc::new(AtomicUsize::new(0));
        timer.arm(Duration::from_millis(10), counter_action(&fired));
        timer.arm(Duration::from_millis(10), counter_action(&fired));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
