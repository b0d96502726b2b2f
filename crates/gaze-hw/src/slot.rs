//! Latest-wins single-value mailbox.
//!
//! The producer never blocks and never queues: a `put` replaces whatever
//! the consumer has not taken yet. Consumers wait with a timeout so they
//! can notice shutdown flags between frames.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub struct LatestSlot<T> {
    inner: Arc<(Mutex<Option<T>>, Condvar)>,
}

impl<T> Clone for LatestSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking holder cannot leave an Option half-written.
    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `value`, returning the unread value it displaced, if any.
    pub fn put(&self, value: T) -> Option<T> {
        let evicted = self.lock().replace(value);
        self.inner.1.notify_one();
        evicted
    }

    /// Take the current value, waiting up to `timeout` for one to arrive.
    pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
        let guard = self.lock();
        let (mut guard, _) = self
            .inner
            .1
            .wait_timeout_while(guard, timeout, |slot| slot.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        guard.take()
    }

    pub fn try_take(&self) -> Option<T> {
        self.lock().take()
    }

    /// Discard any pending value. Returns whether one was dropped.
    pub fn drain(&self) -> bool {
        self.try_take().is_some()
    }
}
