//! Session registry keyed by tokio task.
//!
//! Tokio has no task-exit hook, so handles are released by whoever opened
//! them:
//! - a handle opened by a top-level atomic block is released when that
//!   block ends, whether it returns or its future is dropped;
//! - inside [`AsyncSessionRegistry::scoped`] the handle outlives individual
//!   blocks and is released when the scoped future ends;
//! - a handle obtained through `get_or_create` stays bound until `remove`
//!   or `reset_all`.

use crate::atomic::error::{AtomicError, AtomicResult};
use crate::driver::{AsyncConnection, AsyncConnector};
use crate::session::{lock, AsyncSessionHandle};
use log::{error, info, warn};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task;

type SessionMap<C> = HashMap<task::Id, Arc<AsyncSessionHandle<C>>>;

/// Task-scoped sessions over one async connector.
pub struct AsyncSessionRegistry<K: AsyncConnector> {
    inner: Arc<AsyncRegistryInner<K>>,
}

struct AsyncRegistryInner<K: AsyncConnector> {
    connector: K,
    sessions: Mutex<SessionMap<K::Connection>>,
    // Scopes currently running under `scoped`.
    held: Mutex<HashSet<task::Id>>,
}

impl<K: AsyncConnector> Clone for AsyncSessionRegistry<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: AsyncConnector> AsyncSessionRegistry<K> {
    pub fn new(connector: K) -> Self {
        Self {
            inner: Arc::new(AsyncRegistryInner {
                connector,
                sessions: Mutex::new(HashMap::new()),
                held: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn connector(&self) -> &K {
        &self.inner.connector
    }

    /// Id of the calling tokio task.
    ///
    /// # Errors
    /// - `AtomicError::ScopeUnavailable` outside a spawned task, e.g. directly
    ///   under `Runtime::block_on`.
    pub fn current_scope() -> AtomicResult<task::Id> {
        task::try_id().ok_or(AtomicError::ScopeUnavailable)
    }

    /// Returns the handle bound to `scope`, connecting one if needed.
    ///
    /// The caller owns a handle created here until it calls `remove`.
    pub async fn get_or_create(
        &self,
        scope: task::Id,
    ) -> AtomicResult<Arc<AsyncSessionHandle<K::Connection>>> {
        self.acquire(scope).await.map(|(handle, _)| handle)
    }

    /// Like `get_or_create`; the flag tells whether this call connected.
    pub(crate) async fn acquire(
        &self,
        scope: task::Id,
    ) -> AtomicResult<(Arc<AsyncSessionHandle<K::Connection>>, bool)> {
        if let Some(existing) = self.get(scope) {
            return Ok((existing, false));
        }

        let started_at = Instant::now();
        let target = self.inner.connector.target();
        let conn = match self.inner.connector.connect().await {
            Ok(conn) => conn,
            Err(err) => {
                error!(
                    "event=session_open module=registry status=error database={} duration_ms={} error={}",
                    target,
                    started_at.elapsed().as_millis(),
                    err
                );
                return Err(AtomicError::connection(
                    target,
                    "failed to open connection",
                    Some(err),
                ));
            }
        };

        let created = Arc::new(AsyncSessionHandle::new(scope, target, conn));
        let handle = {
            let mut sessions = lock(&self.inner.sessions);
            Arc::clone(sessions.entry(scope).or_insert_with(|| Arc::clone(&created)))
        };
        let connected = Arc::ptr_eq(&handle, &created);
        if connected {
            info!(
                "event=session_open module=registry status=ok session_id={} database={} duration_ms={}",
                handle.session_id(),
                target,
                started_at.elapsed().as_millis()
            );
        }
        Ok((handle, connected))
    }

    /// Release guard for a handle a top-level block just opened.
    ///
    /// `None` while `scope` runs under `scoped`, which releases it instead.
    pub(crate) fn block_release(
        &self,
        scope: task::Id,
        handle: &Arc<AsyncSessionHandle<K::Connection>>,
    ) -> Option<ScopeRelease<K>> {
        if lock(&self.inner.held).contains(&scope) {
            return None;
        }
        Some(ScopeRelease {
            registry: self.clone(),
            scope,
            owner: Owner::Block(Arc::clone(handle)),
            pending: true,
        })
    }

    pub async fn get_or_create_current(
        &self,
    ) -> AtomicResult<Arc<AsyncSessionHandle<K::Connection>>> {
        self.get_or_create(Self::current_scope()?).await
    }

    pub fn get(&self, scope: task::Id) -> Option<Arc<AsyncSessionHandle<K::Connection>>> {
        lock(&self.inner.sessions).get(&scope).cloned()
    }

    pub fn contains(&self, scope: task::Id) -> bool {
        lock(&self.inner.sessions).contains_key(&scope)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rolls back, closes and unbinds the handle of `scope`. Idempotent.
    pub async fn remove(&self, scope: task::Id) -> bool {
        let removed = self.inner.detach(scope);
        match removed {
            Some(handle) => {
                release(&handle).await;
                true
            }
            None => false,
        }
    }

    /// Removes the calling task's handle; `false` outside a task.
    pub async fn remove_current(&self) -> bool {
        match Self::current_scope() {
            Ok(scope) => self.remove(scope).await,
            Err(_) => false,
        }
    }

    pub async fn reset_all(&self) -> usize {
        let drained: Vec<_> = lock(&self.inner.sessions).drain().collect();
        let released = drained.len();
        for (_, handle) in drained {
            release(&handle).await;
        }
        info!(
            "event=registry_reset module=registry status=ok released={}",
            released
        );
        released
    }

    /// Runs `future` with one session for the calling task, then releases it.
    ///
    /// Atomic blocks inside `future` share that session instead of each
    /// releasing their own. The handle is released whether `future` completes
    /// or is dropped; on drop the close runs on a spawned task. Nested
    /// `scoped` calls for the same task defer to the outermost one.
    pub async fn scoped<F>(&self, future: F) -> F::Output
    where
        F: Future,
    {
        let Some(scope) = task::try_id() else {
            return future.await;
        };
        if !lock(&self.inner.held).insert(scope) {
            return future.await;
        }

        let guard = ScopeRelease {
            registry: self.clone(),
            scope,
            owner: Owner::Scoped,
            pending: true,
        };
        let output = future.await;
        guard.release().await;
        output
    }
}

impl<K: AsyncConnector> AsyncRegistryInner<K> {
    fn detach(&self, scope: task::Id) -> Option<Arc<AsyncSessionHandle<K::Connection>>> {
        lock(&self.sessions).remove(&scope)
    }

    /// Unbinds `scope` only if it is still bound to `expected`.
    fn detach_if(
        &self,
        scope: task::Id,
        expected: &Arc<AsyncSessionHandle<K::Connection>>,
    ) -> Option<Arc<AsyncSessionHandle<K::Connection>>> {
        let mut sessions = lock(&self.sessions);
        match sessions.get(&scope) {
            Some(bound) if Arc::ptr_eq(bound, expected) => sessions.remove(&scope),
            _ => None,
        }
    }
}

async fn release<C: AsyncConnection>(handle: &AsyncSessionHandle<C>) {
    let depth = handle.depth();
    match handle.close().await {
        Ok(()) => info!(
            "event=session_close module=registry status=ok session_id={} depth={}",
            handle.session_id(),
            depth
        ),
        Err(err) => error!(
            "event=session_close module=registry status=error session_id={} error={}",
            handle.session_id(),
            err
        ),
    }
}

enum Owner<C: AsyncConnection> {
    Scoped,
    Block(Arc<AsyncSessionHandle<C>>),
}

/// Releases a scope's handle when awaited or dropped.
pub(crate) struct ScopeRelease<K: AsyncConnector> {
    registry: AsyncSessionRegistry<K>,
    scope: task::Id,
    owner: Owner<K::Connection>,
    pending: bool,
}

impl<K: AsyncConnector> ScopeRelease<K> {
    pub(crate) async fn release(mut self) {
        if let Some(handle) = self.detach() {
            release(&handle).await;
        }
    }

    fn detach(&mut self) -> Option<Arc<AsyncSessionHandle<K::Connection>>> {
        if !std::mem::take(&mut self.pending) {
            return None;
        }
        let inner = &self.registry.inner;
        match &self.owner {
            Owner::Scoped => {
                lock(&inner.held).remove(&self.scope);
                inner.detach(self.scope)
            }
            Owner::Block(handle) => inner.detach_if(self.scope, handle),
        }
    }
}

impl<K: AsyncConnector> Drop for ScopeRelease<K> {
    fn drop(&mut self) {
        let Some(handle) = self.detach() else {
            return;
        };
        // Unbound already; only the close itself is deferred.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { release(&handle).await });
            }
            Err(_) => warn!(
                "event=session_close module=registry status=skipped session_id={} reason=no_runtime",
                handle.session_id()
            ),
        }
    }
}
