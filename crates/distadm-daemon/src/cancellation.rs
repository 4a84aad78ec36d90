//! Cooperative cancellation, replacing the original's alarm/signal-based
//! thread interruption (REDESIGN FLAGS: signal-driven `longjmp`-style
//! interruption has no safe Rust analogue; a checked token is the idiomatic
//! substitute, following the polling style `neutronium::net::endpoint`
//! uses around its own poll loop).

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Default for CancellationToken {
    fn default() -> Self {
        CancellationToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Sets the cancelled flag and wakes any thread parked in `wait_for`.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        let _guard = self.inner.mutex.lock();
        self.inner.condvar.notify_all();
    }

    /// Blocks up to `timeout` or until cancelled, whichever comes first.
    /// Used between chunks of blocking I/O (e.g. the anti-entropy backoff
    /// sleep) so shutdown doesn't have to wait out a full sleep period.
    pub fn wait_for(&self, timeout: Duration) {
        if self.is_cancelled() {
            return;
        }
        let mut guard = self.inner.mutex.lock();
        self.inner.condvar.wait_for(&mut guard, timeout);
    }
}
