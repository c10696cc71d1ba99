/// Process-wide cooperative cancellation flag
///
/// Every worker loop polls this between bounded waits. It is set at most once
/// (later sets are no-ops) and never cleared.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    set: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Returns true only for the call that actually flipped it.
    pub fn trigger(&self) -> bool {
        !self.set.swap(true, Ordering::SeqCst)
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    /// Guard for a worker thread: sets the flag if the thread unwinds
    pub fn panic_guard(&self) -> PanicGuard {
        PanicGuard { flag: self.clone() }
    }
}

/// Trips the shutdown flag when dropped during a panic
#[derive(Debug)]
pub struct PanicGuard {
    flag: ShutdownFlag,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.flag.trigger();
        }
    }
}
