use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Lock a mutex, ignoring poisoning. None of the guarded data in this crate
/// is left half-updated by a panic, so the inner value is always usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
}
