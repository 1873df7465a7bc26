//! Buffer synchronization fences

use crate::error::{Error, Result};
use crate::sync::wait_until;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

struct FenceInner {
    signaled: Mutex<bool>,
    condvar: Condvar,
    /// Created by the session rather than the client
    internal: bool,
}

/// One-shot sync object guarding a buffer
///
/// Clones share the same underlying fence.
#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    fn with_state(signaled: bool, internal: bool) -> Self {
        Self {
            inner: Arc::new(FenceInner {
                signaled: Mutex::new(signaled),
                condvar: Condvar::new(),
                internal,
            }),
        }
    }

    /// Unsignaled client fence
    pub fn new() -> Self {
        Self::with_state(false, false)
    }

    /// Client fence that is already signaled
    pub fn signaled() -> Self {
        Self::with_state(true, false)
    }

    /// Session-owned fence, already signaled
    pub fn internal() -> Self {
        Self::with_state(true, true)
    }

    pub fn signal(&self) {
        *self.inner.signaled.lock() = true;
        self.inner.condvar.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.inner.signaled.lock()
    }

    pub fn is_internal(&self) -> bool {
        self.inner.internal
    }

    /// Block until signaled, or fail with `Timeout`
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let mut signaled = self.inner.signaled.lock();
        if wait_until(&mut signaled, &self.inner.condvar, timeout, |s| *s) {
            Ok(())
        } else {
            Err(Error::Timeout(format!(
                "fence not signaled within {}ms",
                timeout.as_millis()
            )))
        }
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("signaled", &self.is_signaled())
            .field("internal", &self.inner.internal)
            .finish()
    }
}
