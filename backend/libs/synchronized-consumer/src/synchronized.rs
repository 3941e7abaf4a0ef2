use parking_lot::{Mutex, MutexGuard};
use std::ops::Deref;

/// Mutex-guarded value shared between the caller and the commit log worker.
///
/// All accessors hold the lock for their whole scope, so callers must only do
/// constant-time work while a [`SynchronizedRef`] is alive.
#[derive(Debug, Default)]
pub struct Synchronized<T> {
    value: Mutex<T>,
}

/// Scoped read access to a [`Synchronized`] value
pub struct SynchronizedRef<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for SynchronizedRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> Synchronized<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
        }
    }

    /// Lock and return read access until the returned guard is dropped
    pub fn get(&self) -> SynchronizedRef<'_, T> {
        SynchronizedRef {
            guard: self.value.lock(),
        }
    }

    /// Replace the value
    pub fn set(&self, value: T) {
        *self.value.lock() = value;
    }

    /// Mutate the value in place under the lock
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.value.lock())
    }
}
