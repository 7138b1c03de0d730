//! Async atomic blocks over a task-scoped registry.
//!
//! Dropping a block's future mid-flight counts as a `Generic` failure: its
//! frame is popped on the spot and the rollback runs before the next driver
//! call on the same session.

use super::error::{AtomicResult, WorkError};
use super::{log_failure, resolve_failure};
use crate::classify::{classify, FailureDescriptor};
use crate::driver::{AsyncConnection, AsyncConnector};
use crate::registry::AsyncSessionRegistry;
use crate::session::{AsyncSessionHandle, TransactionFrame};
use log::{debug, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::task;

/// Runs `work` atomically on the session bound to `scope`.
///
/// Same contract as [`crate::atomic::run_atomic`]. `work` receives the
/// session handle and reaches the connection through
/// [`AsyncSessionHandle::connection`].
///
/// A block that had to open the scope's session releases it when the block
/// ends, unless the scope runs under [`AsyncSessionRegistry::scoped`].
pub async fn run_atomic_async<K, T, F, Fut>(
    registry: &AsyncSessionRegistry<K>,
    scope: task::Id,
    work: F,
) -> AtomicResult<T>
where
    K: AsyncConnector,
    F: FnOnce(Arc<AsyncSessionHandle<K::Connection>>) -> Fut,
    Fut: Future<Output = Result<T, WorkError>>,
{
    let (handle, connected) = registry.acquire(scope).await?;
    let owned = if connected {
        registry.block_release(scope, &handle)
    } else {
        None
    };

    let outcome = run_on_handle(handle, work).await;
    if let Some(owned) = owned {
        owned.release().await;
    }
    outcome
}

/// [`run_atomic_async`] on the calling task's scope.
///
/// # Errors
/// - `AtomicError::ScopeUnavailable` when not called from a tokio task.
pub async fn atomic_async<K, T, F, Fut>(registry: &AsyncSessionRegistry<K>, work: F) -> AtomicResult<T>
where
    K: AsyncConnector,
    F: FnOnce(Arc<AsyncSessionHandle<K::Connection>>) -> Fut,
    Fut: Future<Output = Result<T, WorkError>>,
{
    let scope = AsyncSessionRegistry::<K>::current_scope()?;
    run_atomic_async(registry, scope, work).await
}

async fn run_on_handle<C, T, F, Fut>(handle: Arc<AsyncSessionHandle<C>>, work: F) -> AtomicResult<T>
where
    C: AsyncConnection,
    F: FnOnce(Arc<AsyncSessionHandle<C>>) -> Fut,
    Fut: Future<Output = Result<T, WorkError>>,
{
    handle.ensure_usable()?;
    let started_at = Instant::now();
    let frame = handle.plan_frame();
    let mut guard = AsyncFrameGuard {
        handle: &handle,
        frame: &frame,
        stage: Stage::Entering,
    };

    if let Err(err) = handle.begin_frame(&frame).await {
        guard.stage = Stage::Done;
        let err = resolve_failure(err, handle.database());
        log_failure(handle.session_id(), frame.depth_at_entry(), &err, started_at);
        return Err(err);
    }
    guard.stage = Stage::Open;

    let outcome = match work(Arc::clone(&handle)).await {
        Ok(value) => handle.commit_frame(&frame).await.map(|()| value),
        Err(err) => {
            handle.rollback_frame(&frame).await;
            Err(err)
        }
    };
    guard.stage = Stage::Done;

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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Begin/savepoint may be in flight; the frame may not be pushed yet.
    Entering,
    Open,
    Done,
}

/// Queues the frame's rollback if the block's future is dropped.
struct AsyncFrameGuard<'a, C: AsyncConnection> {
    handle: &'a AsyncSessionHandle<C>,
    frame: &'a TransactionFrame,
    stage: Stage,
}

impl<C: AsyncConnection> Drop for AsyncFrameGuard<'_, C> {
    fn drop(&mut self) {
        if self.stage == Stage::Done {
            return;
        }
        let queued = self
            .handle
            .abandon_frame(self.frame, self.stage == Stage::Entering);
        if queued {
            warn!(
                "event=atomic_cancelled module=atomic status=rollback_queued session_id={} depth={} classification={}",
                self.handle.session_id(),
                self.frame.depth_at_entry(),
                classify(&FailureDescriptor::cancelled()).as_str()
            );
        }
    }
}
