//! Async session handle bound to one tokio task.
//!
//! # Responsibility
//! - Same frame protocol as `SessionHandle`, over an `AsyncConnection`.
//! - Apply rollbacks owed by cancelled blocks before the next driver call.
//!
//! # Invariants
//! - Bookkeeping locks are never held across an `.await`.
//! - Every driver interaction goes through `settle()` first, so work never
//!   runs on top of a frame that a cancelled block left behind.
//! - A closed connection invalidates the handle at the next frame boundary.
//! - A queued rollback sends its first statement in the same poll that
//!   dequeues it; the connection's FIFO order does the rest.

use super::frame::{FrameBook, TransactionFrame};
use super::handle::{commit_op, doomed_error};
use super::lock;
use crate::atomic::error::{AtomicError, WorkError};
use crate::driver::{AsyncConnection, DriverError, DriverOp, DriverResult};
use log::{error, warn};
use std::sync::{Mutex, MutexGuard};
use tokio::task;
use uuid::Uuid;

/// One task's connection plus its nesting state.
pub struct AsyncSessionHandle<C: AsyncConnection> {
    session_id: Uuid,
    scope: task::Id,
    database: String,
    conn: C,
    book: Mutex<FrameBook>,
}

impl<C: AsyncConnection> AsyncSessionHandle<C> {
    pub(crate) fn new(scope: task::Id, database: &str, conn: C) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            scope,
            database: database.to_string(),
            conn,
            book: Mutex::new(FrameBook::default()),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn scope(&self) -> task::Id {
        self.scope
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn depth(&self) -> usize {
        self.lock_book().depth()
    }

    pub fn frames(&self) -> Vec<TransactionFrame> {
        self.lock_book().frames().to_vec()
    }

    pub fn is_valid(&self) -> bool {
        !self.lock_book().is_invalidated()
    }

    /// Whether a cancelled block still owes a rollback.
    pub fn has_pending_unwind(&self) -> bool {
        self.lock_book().has_pending()
    }

    pub fn invalidate(&self) {
        self.lock_book().invalidate();
        warn!(
            "event=session_invalidate module=session status=ok session_id={}",
            self.session_id
        );
    }

    /// The connection, for statements inside the current frame.
    ///
    /// Applies owed rollbacks first.
    pub async fn connection(&self) -> Result<&C, WorkError> {
        self.settle().await;
        {
            let book = self.lock_book();
            if book.is_invalidated() {
                return Err(
                    DriverError::new(DriverOp::Execute, "session was invalidated").into(),
                );
            }
            if book.is_doomed() {
                return Err(doomed_error(DriverOp::Execute).into());
            }
        }
        Ok(&self.conn)
    }

    /// Applies rollbacks queued by cancelled blocks, oldest first.
    pub async fn settle(&self) {
        loop {
            let next = self.lock_book().next_pending();
            let Some(unwind) = next else {
                return;
            };
            self.undo(&unwind.frame, unwind.best_effort).await;
        }
    }

    pub(crate) fn ensure_usable(&self) -> Result<(), AtomicError> {
        let mut book = self.lock_book();
        if !self.conn.is_open() && !book.is_invalidated() {
            book.invalidate();
            warn!(
                "event=session_invalidate module=session status=connection_lost session_id={}",
                self.session_id
            );
        }
        if book.is_invalidated() {
            return Err(AtomicError::connection(
                &self.database,
                format!("session {} was invalidated", self.session_id),
                None,
            ));
        }
        Ok(())
    }

    /// The frame the next `begin_frame` opens.
    pub(crate) fn plan_frame(&self) -> TransactionFrame {
        self.lock_book().next_frame()
    }

    pub(crate) async fn begin_frame(&self, frame: &TransactionFrame) -> Result<(), WorkError> {
        self.settle().await;
        if self.lock_book().is_doomed() {
            return Err(doomed_error(DriverOp::Savepoint).into());
        }
        match frame.savepoint() {
            None => {
                // A commit cancelled mid-flight can fail on the engine after its
                // block has gone; nothing owns that transaction any more.
                if self.conn.in_transaction().await? {
                    warn!(
                        "event=frame_begin module=session status=orphan_rollback session_id={}",
                        self.session_id
                    );
                    self.conn.rollback().await?;
                }
                self.conn.begin().await?
            }
            Some(name) => self.conn.savepoint(name).await?,
        }
        self.lock_book().push(frame.clone())?;
        Ok(())
    }

    /// Commits (root) or releases (nested) `frame`; rolls it back on failure.
    pub(crate) async fn commit_frame(&self, frame: &TransactionFrame) -> Result<(), WorkError> {
        self.settle().await;
        let doomed = {
            let mut book = self.lock_book();
            book.pop(frame.depth_at_entry())?;
            book.is_doomed()
        };

        let outcome = if doomed {
            Err(doomed_error(commit_op(frame)))
        } else {
            match frame.savepoint() {
                None => self.conn.commit().await,
                Some(name) => self.conn.release(name).await,
            }
        };

        if let Err(err) = outcome {
            self.undo(frame, false).await;
            return Err(err.into());
        }
        Ok(())
    }

    pub(crate) async fn rollback_frame(&self, frame: &TransactionFrame) {
        self.settle().await;
        let popped = self.lock_book().pop(frame.depth_at_entry());
        if let Err(err) = popped {
            warn!(
                "event=frame_rollback module=session status=skipped session_id={} error={}",
                self.session_id, err
            );
            return;
        }
        self.undo(frame, false).await;
    }

    /// Pops a frame whose block was dropped and queues its rollback.
    ///
    /// Never awaits; called from drop guards.
    pub(crate) fn abandon_frame(&self, frame: &TransactionFrame, entering: bool) -> bool {
        self.lock_book().abandon(frame, entering)
    }

    pub(crate) async fn close(&self) -> DriverResult<()> {
        let (abandoned, owed) = {
            let mut book = self.lock_book();
            book.invalidate();
            (book.drain().len(), book.clear_pending())
        };

        if self.conn.in_transaction().await.unwrap_or(false) {
            warn!(
                "event=session_close module=session status=forced_rollback session_id={} depth={} pending={}",
                self.session_id, abandoned, owed
            );
            if let Err(err) = self.conn.rollback().await {
                error!(
                    "event=session_close module=session status=error session_id={} error={}",
                    self.session_id, err
                );
            }
        }
        self.conn.close().await
    }

    async fn undo(&self, frame: &TransactionFrame, best_effort: bool) {
        let outcome = match frame.savepoint() {
            None => self.conn.rollback().await,
            Some(name) => match self.conn.rollback_to(name).await {
                Ok(()) => self.conn.release(name).await,
                Err(err) => Err(err),
            },
        };

        if frame.is_root() {
            self.lock_book().clear_doomed();
        }
        let Err(err) = outcome else {
            return;
        };

        if !self.conn.is_open() {
            self.lock_book().invalidate();
            error!(
                "event=frame_rollback module=session status=connection_lost session_id={} depth={} error={}",
                self.session_id,
                frame.depth_at_entry(),
                err
            );
            return;
        }

        let in_transaction = self.conn.in_transaction().await.unwrap_or(true);
        if !in_transaction || best_effort {
            if !in_transaction && !frame.is_root() {
                self.lock_book().doom();
            }
            warn!(
                "event=frame_rollback module=session status=superseded session_id={} depth={} best_effort={} error={}",
                self.session_id,
                frame.depth_at_entry(),
                best_effort,
                err
            );
            return;
        }

        self.lock_book().invalidate();
        error!(
            "event=frame_rollback module=session status=error session_id={} depth={} error={}",
            self.session_id,
            frame.depth_at_entry(),
            err
        );
    }

    fn lock_book(&self) -> MutexGuard<'_, FrameBook> {
        lock(&self.book)
    }
}

impl<C: AsyncConnection> std::fmt::Debug for AsyncSessionHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSessionHandle")
            .field("session_id", &self.session_id)
            .field("scope", &self.scope)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::AsyncSessionHandle;
    use crate::atomic::error::{AtomicError, WorkError};
    use crate::config::SessionConfig;
    use crate::driver::{
        AsyncConnection, AsyncConnector, AsyncSqliteConnection, AsyncSqliteConnector,
        DriverError,
    };

    async fn handle() -> AsyncSessionHandle<AsyncSqliteConnection> {
        let connector = AsyncSqliteConnector::new(SessionConfig::in_memory()).unwrap();
        let conn = connector.connect().await.unwrap();
        let scope = tokio::task::try_id().expect("tests run inside a spawned task");
        AsyncSessionHandle::new(scope, ":memory:", conn)
    }

    async fn count(handle: &AsyncSessionHandle<AsyncSqliteConnection>) -> i64 {
        handle
            .connection()
            .await
            .unwrap()
            .call(|raw| {
                raw.query_row("SELECT COUNT(*) FROM entities;", [], |row| row.get(0))
                    .map_err(DriverError::from)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn abandoned_frames_are_rolled_back_on_next_interaction() {
        tokio::spawn(async {
            let handle = handle().await;
            let root = handle.plan_frame();
            handle.begin_frame(&root).await.unwrap();
            handle
                .connection()
                .await
                .unwrap()
                .call(|raw| {
                    raw.execute_batch("INSERT INTO entities (uuid, description) VALUES ('a', 'x');")
                        .map_err(DriverError::from)
                })
                .await
                .unwrap();

            assert!(handle.abandon_frame(&root, false));
            assert_eq!(handle.depth(), 0);
            assert!(handle.has_pending_unwind());

            assert_eq!(count(&handle).await, 0);
            assert!(!handle.has_pending_unwind());
            assert!(handle.is_valid());
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn closed_connection_surfaces_as_connection_error() {
        tokio::spawn(async {
            let handle = handle().await;
            let root = handle.plan_frame();
            handle.begin_frame(&root).await.unwrap();
            handle.connection().await.unwrap().close().await.unwrap();

            let err = handle.commit_frame(&root).await.unwrap_err();
            assert!(matches!(err, WorkError::Driver(ref driver) if driver.is_connection_lost()));
            assert_eq!(handle.depth(), 0);
            assert!(!handle.is_valid());
            assert!(matches!(
                handle.ensure_usable(),
                Err(AtomicError::Connection { .. })
            ));
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn close_rolls_back_and_invalidates() {
        tokio::spawn(async {
            let handle = handle().await;
            let root = handle.plan_frame();
            handle.begin_frame(&root).await.unwrap();
            handle.close().await.unwrap();

            assert_eq!(handle.depth(), 0);
            assert!(!handle.is_valid());
            assert!(handle.connection().await.is_err());
        })
        .await
        .unwrap();
    }
}
