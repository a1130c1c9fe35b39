//! Holder for a real-time callback that can be torn down safely.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// A callback shared between a real-time thread and the control thread.
///
/// The real-time side only ever `try_lock`s, so it never waits; the lock is
/// contended only while [`clear`](Self::clear) runs. `clear` takes the lock
/// for real, which waits out an in-flight invocation, and removes the
/// callback. After it returns the callback cannot run again.
pub(crate) struct CallbackSlot<F: ?Sized> {
    callback: Mutex<Option<Box<F>>>,
    invocations: AtomicU64,
}

impl<F: ?Sized> CallbackSlot<F> {
    pub(crate) fn new() -> Self {
        Self {
            callback: Mutex::new(None),
            invocations: AtomicU64::new(0),
        }
    }

    /// Installs `callback`, replacing any previous one.
    pub(crate) fn install(&self, callback: Box<F>) {
        *self.callback.lock() = Some(callback);
    }

    /// Removes the callback, waiting for a running invocation to finish.
    pub(crate) fn clear(&self) -> Option<Box<F>> {
        self.callback.lock().take()
    }

    pub(crate) fn is_installed(&self) -> bool {
        self.callback.lock().is_some()
    }

    /// Runs `f` with the callback if one is installed and the slot is free.
    ///
    /// Never blocks. Returns `None` when nothing ran.
    #[inline]
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut F) -> R) -> Option<R> {
        let mut guard = self.callback.try_lock()?;
        let callback = guard.as_deref_mut()?;
        self.invocations.fetch_add(1, Ordering::Relaxed);
        Some(f(callback))
    }

    /// Number of times the callback has run.
    pub(crate) fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }
}
