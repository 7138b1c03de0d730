//! Per-scope session handles and their frame stacks.
//!
//! # Responsibility
//! - Own one scope's connection and nesting state.
//! - Drive begin/savepoint/commit/release/rollback for atomic blocks.
//!
//! # Invariants
//! - `depth` always equals the number of open frames.
//! - A handle is never shared between scopes.
//!
//! # See also
//! - `crate::atomic` for the wrapper that drives frames.
//! - `crate::registry` for how handles are bound to scopes.

pub mod async_handle;
mod frame;
pub mod handle;

pub use async_handle::AsyncSessionHandle;
pub use frame::{FrameOrderError, TransactionFrame};
pub use handle::SessionHandle;

use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

/// Locks `mutex`, recovering the data if a panicking holder poisoned it.
///
/// Frame bookkeeping stays consistent across panics because every mutation
/// is a single push/pop/flag write.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Like [`lock`], but `None` instead of waiting on a held mutex.
pub(crate) fn try_lock<T>(mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match mutex.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}
