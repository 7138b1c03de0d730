//! Session registry keyed by OS thread.

use crate::atomic::error::{AtomicError, AtomicResult};
use crate::driver::{Connection, Connector};
use crate::session::{lock, SessionHandle};
use log::{error, info};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::Instant;

type SessionMap<C> = HashMap<ThreadId, Arc<SessionHandle<C>>>;

/// Thread-scoped sessions over one connector.
///
/// Cloning is cheap and clones share the same sessions.
pub struct SessionRegistry<K: Connector> {
    inner: Arc<RegistryInner<K>>,
}

struct RegistryInner<K: Connector> {
    connector: K,
    sessions: Mutex<SessionMap<K::Connection>>,
}

impl<K: Connector> Clone for SessionRegistry<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Connector> SessionRegistry<K> {
    pub fn new(connector: K) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connector,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn connector(&self) -> &K {
        &self.inner.connector
    }

    /// Scope of the calling thread.
    pub fn current_scope() -> ThreadId {
        thread::current().id()
    }

    /// Returns the handle bound to `scope`, connecting one if needed.
    ///
    /// A handle created for the calling thread is released automatically
    /// when that thread exits.
    ///
    /// # Errors
    /// - `AtomicError::Connection` when the connector fails.
    pub fn get_or_create(&self, scope: ThreadId) -> AtomicResult<Arc<SessionHandle<K::Connection>>> {
        if let Some(existing) = self.get(scope) {
            return Ok(existing);
        }

        let started_at = Instant::now();
        let target = self.inner.connector.target();
        let conn = match self.inner.connector.connect() {
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

        let created = Arc::new(SessionHandle::new(scope, target, conn));
        let handle = {
            let mut sessions = lock(&self.inner.sessions);
            Arc::clone(sessions.entry(scope).or_insert_with(|| Arc::clone(&created)))
        };

        if Arc::ptr_eq(&handle, &created) {
            if scope == Self::current_scope() {
                reap_on_thread_exit(&self.inner, scope);
            }
            info!(
                "event=session_open module=registry status=ok session_id={} database={} duration_ms={}",
                handle.session_id(),
                target,
                started_at.elapsed().as_millis()
            );
        }
        Ok(handle)
    }

    pub fn get_or_create_current(&self) -> AtomicResult<Arc<SessionHandle<K::Connection>>> {
        self.get_or_create(Self::current_scope())
    }

    pub fn get(&self, scope: ThreadId) -> Option<Arc<SessionHandle<K::Connection>>> {
        lock(&self.inner.sessions).get(&scope).cloned()
    }

    pub fn contains(&self, scope: ThreadId) -> bool {
        lock(&self.inner.sessions).contains_key(&scope)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rolls back, closes and unbinds the handle of `scope`.
    ///
    /// Returns whether a handle was bound. Removing an absent scope is a no-op.
    pub fn remove(&self, scope: ThreadId) -> bool {
        self.inner.remove(scope)
    }

    pub fn remove_current(&self) -> bool {
        self.remove(Self::current_scope())
    }

    /// Releases every handle; returns how many were bound.
    pub fn reset_all(&self) -> usize {
        let drained: Vec<_> = lock(&self.inner.sessions).drain().collect();
        let released = drained.len();
        for (_, handle) in drained {
            release(&handle);
        }
        info!(
            "event=registry_reset module=registry status=ok released={}",
            released
        );
        released
    }
}

impl<K: Connector> RegistryInner<K> {
    fn remove(&self, scope: ThreadId) -> bool {
        let removed = lock(&self.sessions).remove(&scope);
        match removed {
            Some(handle) => {
                release(&handle);
                true
            }
            None => false,
        }
    }
}

fn release<C: Connection>(handle: &SessionHandle<C>) {
    let depth = handle.depth();
    match handle.close() {
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

trait ScopeReaper {
    fn registry_key(&self) -> usize;
    fn is_live(&self) -> bool;
    fn reap(self: Box<Self>);
}

struct RegistryReaper<K: Connector> {
    registry: Weak<RegistryInner<K>>,
    scope: ThreadId,
}

impl<K: Connector> ScopeReaper for RegistryReaper<K> {
    fn registry_key(&self) -> usize {
        self.registry.as_ptr() as *const () as usize
    }

    fn is_live(&self) -> bool {
        self.registry.strong_count() > 0
    }

    fn reap(self: Box<Self>) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.scope);
        }
    }
}

/// Per-thread list of registries holding a handle for this thread.
#[derive(Default)]
struct ThreadReapers {
    reapers: Vec<Box<dyn ScopeReaper>>,
}

impl Drop for ThreadReapers {
    fn drop(&mut self) {
        for reaper in self.reapers.drain(..) {
            reaper.reap();
        }
    }
}

thread_local! {
    static THREAD_REAPERS: RefCell<ThreadReapers> = RefCell::new(ThreadReapers::default());
}

fn reap_on_thread_exit<K: Connector>(inner: &Arc<RegistryInner<K>>, scope: ThreadId) {
    let reaper = RegistryReaper {
        registry: Arc::downgrade(inner),
        scope,
    };
    // Fails only while the thread is already tearing down its locals.
    let _ = THREAD_REAPERS.try_with(|cell| {
        let mut reapers = cell.borrow_mut();
        reapers.reapers.retain(|existing| existing.is_live());
        let key = reaper.registry_key();
        if reapers.reapers.iter().all(|existing| existing.registry_key() != key) {
            reapers.reapers.push(Box::new(reaper));
        }
    });
}
