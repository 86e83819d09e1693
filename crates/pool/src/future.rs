//! Fulfill-once futures bridging pool workers and pipeline stages.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Errors carried across the future are stringified so the slot can be
/// cloned to every waiter.
type Slot<T> = Option<std::result::Result<T, String>>;

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

/// The write end of a [`SharedFuture`]. Fulfilling twice is a no-op for
/// the second writer.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

/// The read end: cloneable, blocking, with an optional timed wait.
pub struct SharedFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SharedFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub fn promise<T>() -> (Promise<T>, SharedFuture<T>) {
    let inner = Arc::new(Inner {
        slot: Mutex::new(None),
        ready: Condvar::new(),
    });
    (
        Promise {
            inner: Arc::clone(&inner),
        },
        SharedFuture { inner },
    )
}

impl<T> Promise<T> {
    pub fn fulfill(self, value: Result<T>) {
        let mut slot = self.inner.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(value.map_err(|e| format!("{e:#}")));
            self.inner.ready.notify_all();
        }
    }
}

impl<T: Clone> SharedFuture<T> {
    /// Block until the promise resolves.
    pub fn wait(&self) -> Result<T> {
        let mut slot = self.inner.slot.lock().unwrap_or_else(|e| e.into_inner());
        while slot.is_none() {
            slot = self
                .inner
                .ready
                .wait(slot)
                .unwrap_or_else(|e| e.into_inner());
        }
        Self::take(&slot)
    }

    /// Block up to `timeout`; expiry resolves to an error and the caller
    /// is expected to drop the candidate the future was tracking.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.slot.lock().unwrap_or_else(|e| e.into_inner());
        while slot.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return Err(anyhow!("timed out after {timeout:?}"));
            }
            let (guard, _) = self
                .inner
                .ready
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            slot = guard;
        }
        Self::take(&slot)
    }

    pub fn try_get(&self) -> Option<Result<T>> {
        let slot = self.inner.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().map(|r| Self::unpack(r))
    }

    fn take(slot: &Slot<T>) -> Result<T> {
        Self::unpack(slot.as_ref().expect("resolved slot"))
    }

    fn unpack(result: &std::result::Result<T, String>) -> Result<T> {
        match result {
            Ok(value) => Ok(value.clone()),
            Err(message) => Err(anyhow!("{message}")),
        }
    }
}
