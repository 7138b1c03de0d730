//! Blocking atomic blocks over a thread-scoped registry.

use super::error::{AtomicResult, WorkError};
use super::{log_failure, resolve_failure};
use crate::driver::{Connection, Connector};
use crate::registry::SessionRegistry;
use crate::session::{SessionHandle, TransactionFrame};
use log::{debug, warn};
use std::thread::ThreadId;
use std::time::Instant;

/// Runs `work` atomically on the session bound to `scope`.
///
/// Nested calls on the same scope open savepoints. A failing inner block
/// undoes only its own writes; the enclosing block decides whether to
/// propagate the error with `?` or carry on.
///
/// # Errors
/// - `AtomicError::Connection` when the scope cannot connect or its session
///   was invalidated.
/// - `Internal`, `Aborted` or `DeadlockDetected` when the block failed; the
///   block's writes are rolled back in every case.
pub fn run_atomic<K, T, F>(registry: &SessionRegistry<K>, scope: ThreadId, work: F) -> AtomicResult<T>
where
    K: Connector,
    F: FnOnce(&SessionHandle<K::Connection>) -> Result<T, WorkError>,
{
    let handle = registry.get_or_create(scope)?;
    run_on_handle(&handle, work)
}

/// [`run_atomic`] on the calling thread's scope.
pub fn atomic<K, T, F>(registry: &SessionRegistry<K>, work: F) -> AtomicResult<T>
where
    K: Connector,
    F: FnOnce(&SessionHandle<K::Connection>) -> Result<T, WorkError>,
{
    run_atomic(registry, SessionRegistry::<K>::current_scope(), work)
}

fn run_on_handle<C, T, F>(handle: &SessionHandle<C>, work: F) -> AtomicResult<T>
where
    C: Connection,
    F: FnOnce(&SessionHandle<C>) -> Result<T, WorkError>,
{
    handle.ensure_usable()?;
    let started_at = Instant::now();
    let frame = match handle.begin_frame() {
        Ok(frame) => frame,
        Err(err) => {
            let err = resolve_failure(err, handle.database());
            log_failure(handle.session_id(), handle.depth(), &err, started_at);
            return Err(err);
        }
    };

    let mut guard = FrameGuard {
        handle,
        frame: &frame,
        armed: true,
    };
    let outcome = work(handle);
    guard.armed = false;
    drop(guard);

    let outcome = match outcome {
        Ok(value) => handle.commit_frame(&frame).map(|()| value),
        Err(err) => {
            handle.rollback_frame(&frame);
            Err(err)
        }
    };

    match outcome {
        Ok(value) => {
            debug!(
                "event=atomic_commit module=atomic status=ok session_id={} depth={} duration_ms={}",
                handle.session_id(),
                frame.depth_at_entry(),
                started_at.elapsed().as_millis()
            );
            Ok(value)
        }
        Err(err) => {
            let err = resolve_failure(err, handle.database());
            log_failure(handle.session_id(), frame.depth_at_entry(), &err, started_at);
            Err(err)
        }
    }
}

/// Rolls the frame back if `work` unwinds by panicking.
struct FrameGuard<'a, C: Connection> {
    handle: &'a SessionHandle<C>,
    frame: &'a TransactionFrame,
    armed: bool,
}

impl<C: Connection> Drop for FrameGuard<'_, C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(
            "event=atomic_panic module=atomic status=rolled_back session_id={} depth={}",
            self.handle.session_id(),
            self.frame.depth_at_entry()
        );
        self.handle.rollback_frame(self.frame);
    }
}
