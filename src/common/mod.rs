pub mod crypto;

pub use crypto::*;

use std::sync::{Mutex, MutexGuard};

/// Locks `mutex`, recovering the data if a holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
