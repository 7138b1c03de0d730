//! Blocking session handle bound to one OS thread.
//!
//! # Invariants
//! - Lock order is connection, then frame book.
//! - A failed rollback or a closed connection invalidates the handle;
//!   otherwise only `close` and an explicit `invalidate` do.
//! - Frame operations never wait on the connection lock. An atomic block
//!   opened inside `with_connection` fails instead of hanging the thread.

use super::frame::{FrameBook, TransactionFrame};
use super::{lock, try_lock};
use crate::atomic::error::{AtomicError, WorkError};
use crate::driver::{Connection, DriverError, DriverOp, DriverResult};
use log::{error, warn};
use std::sync::{Mutex, MutexGuard};
use std::thread::ThreadId;
use uuid::Uuid;

/// One thread's connection plus its nesting state.
pub struct SessionHandle<C: Connection> {
    session_id: Uuid,
    scope: ThreadId,
    database: String,
    conn: Mutex<C>,
    book: Mutex<FrameBook>,
}

impl<C: Connection> SessionHandle<C> {
    pub(crate) fn new(scope: ThreadId, database: &str, conn: C) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            scope,
            database: database.to_string(),
            conn: Mutex::new(conn),
            book: Mutex::new(FrameBook::default()),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn scope(&self) -> ThreadId {
        self.scope
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Number of open frames; `0` means no transaction is open.
    pub fn depth(&self) -> usize {
        self.lock_book().depth()
    }

    /// Open frames, root first.
    pub fn frames(&self) -> Vec<TransactionFrame> {
        self.lock_book().frames().to_vec()
    }

    pub fn is_valid(&self) -> bool {
        !self.lock_book().is_invalidated()
    }

    /// Marks the handle unusable, e.g. after the caller lost the server.
    ///
    /// Later atomic blocks on this handle fail with `AtomicError::Connection`
    /// until the scope is removed from its registry.
    pub fn invalidate(&self) {
        self.lock_book().invalidate();
        warn!(
            "event=session_invalidate module=session status=ok session_id={}",
            self.session_id
        );
    }

    /// Runs `f` against the connection.
    ///
    /// Atomic blocks and further `with_connection` calls made from inside
    /// `f` fail; open nested blocks outside the closure.
    pub fn with_connection<R, F>(&self, f: F) -> Result<R, WorkError>
    where
        F: FnOnce(&mut C) -> Result<R, WorkError>,
    {
        self.check_statements_allowed()?;
        let mut conn = self.claim_conn(DriverOp::Execute)?;
        f(&mut conn)
    }

    pub(crate) fn ensure_usable(&self) -> Result<(), AtomicError> {
        let lost = try_lock(&self.conn).is_some_and(|conn| !conn.is_open());
        let mut book = self.lock_book();
        if lost && !book.is_invalidated() {
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

    /// Opens the next frame: `BEGIN` at depth 0, a savepoint otherwise.
    pub(crate) fn begin_frame(&self) -> Result<TransactionFrame, WorkError> {
        let mut conn = self.claim_conn(DriverOp::Begin)?;
        let frame = {
            let book = self.lock_book();
            if book.is_doomed() {
                return Err(doomed_error(DriverOp::Savepoint).into());
            }
            book.next_frame()
        };

        match frame.savepoint() {
            None => conn.begin()?,
            Some(name) => conn.savepoint(name)?,
        }
        self.lock_book().push(frame.clone())?;
        Ok(frame)
    }

    /// Commits (root) or releases (nested) `frame`.
    ///
    /// On failure the frame is already rolled back when this returns.
    pub(crate) fn commit_frame(&self, frame: &TransactionFrame) -> Result<(), WorkError> {
        let mut conn = match self.claim_conn(commit_op(frame)) {
            Ok(conn) => conn,
            Err(err) => {
                self.strand(frame, &err);
                return Err(err.into());
            }
        };
        let doomed = {
            let mut book = self.lock_book();
            book.pop(frame.depth_at_entry())?;
            book.is_doomed()
        };

        let outcome = if doomed {
            Err(doomed_error(commit_op(frame)))
        } else {
            match frame.savepoint() {
                None => conn.commit(),
                Some(name) => conn.release(name),
            }
        };

        if let Err(err) = outcome {
            self.undo(&mut conn, frame);
            return Err(err.into());
        }
        Ok(())
    }

    /// Rolls `frame` back and pops it.
    pub(crate) fn rollback_frame(&self, frame: &TransactionFrame) {
        let mut conn = match self.claim_conn(DriverOp::Rollback) {
            Ok(conn) => conn,
            Err(err) => {
                self.strand(frame, &err);
                return;
            }
        };
        if let Err(err) = self.lock_book().pop(frame.depth_at_entry()) {
            warn!(
                "event=frame_rollback module=session status=skipped session_id={} error={}",
                self.session_id, err
            );
            return;
        }
        self.undo(&mut conn, frame);
    }

    /// Forces a rollback of anything open and closes the connection.
    pub(crate) fn close(&self) -> DriverResult<()> {
        let mut conn = self.lock_conn();
        let abandoned = {
            let mut book = self.lock_book();
            book.invalidate();
            book.clear_pending();
            book.drain()
        };

        if conn.in_transaction() {
            warn!(
                "event=session_close module=session status=forced_rollback session_id={} depth={}",
                self.session_id,
                abandoned.len()
            );
            if let Err(err) = conn.rollback() {
                error!(
                    "event=session_close module=session status=error session_id={} error={}",
                    self.session_id, err
                );
            }
        }
        conn.close()
    }

    fn undo(&self, conn: &mut C, frame: &TransactionFrame) {
        let outcome = match frame.savepoint() {
            None => conn.rollback(),
            Some(name) => conn.rollback_to(name).and_then(|()| conn.release(name)),
        };

        let mut book = self.lock_book();
        if frame.is_root() {
            book.clear_doomed();
        }
        let Err(err) = outcome else {
            return;
        };

        if !conn.is_open() {
            book.invalidate();
            error!(
                "event=frame_rollback module=session status=connection_lost session_id={} depth={} error={}",
                self.session_id,
                frame.depth_at_entry(),
                err
            );
            return;
        }

        if !conn.in_transaction() {
            // SQLite drops the whole transaction on some errors (e.g. SQLITE_FULL);
            // there is nothing left to undo for this frame.
            if !frame.is_root() {
                book.doom();
            }
            warn!(
                "event=frame_rollback module=session status=superseded session_id={} depth={} error={}",
                self.session_id,
                frame.depth_at_entry(),
                err
            );
            return;
        }

        book.invalidate();
        error!(
            "event=frame_rollback module=session status=error session_id={} depth={} error={}",
            self.session_id,
            frame.depth_at_entry(),
            err
        );
    }

    /// Drops `frame` without touching the engine and gives up on the session.
    ///
    /// Only reached when the connection is held by an enclosing
    /// `with_connection` on this thread.
    fn strand(&self, frame: &TransactionFrame, err: &DriverError) {
        let mut book = self.lock_book();
        if let Err(order) = book.pop(frame.depth_at_entry()) {
            warn!(
                "event=frame_rollback module=session status=skipped session_id={} error={}",
                self.session_id, order
            );
        }
        book.invalidate();
        error!(
            "event=frame_rollback module=session status=stranded session_id={} depth={} error={}",
            self.session_id,
            frame.depth_at_entry(),
            err
        );
    }

    fn check_statements_allowed(&self) -> Result<(), WorkError> {
        let book = self.lock_book();
        if book.is_invalidated() {
            return Err(DriverError::new(DriverOp::Execute, "session was invalidated").into());
        }
        if book.is_doomed() {
            return Err(doomed_error(DriverOp::Execute).into());
        }
        Ok(())
    }

    fn lock_conn(&self) -> MutexGuard<'_, C> {
        lock(&self.conn)
    }

    fn claim_conn(&self, op: DriverOp) -> Result<MutexGuard<'_, C>, DriverError> {
        try_lock(&self.conn).ok_or_else(|| {
            DriverError::new(
                op,
                "connection is already in use on this session; open atomic blocks outside with_connection",
            )
        })
    }

    fn lock_book(&self) -> MutexGuard<'_, FrameBook> {
        lock(&self.book)
    }
}

impl<C: Connection> std::fmt::Debug for SessionHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("scope", &self.scope)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

pub(crate) fn commit_op(frame: &TransactionFrame) -> DriverOp {
    if frame.is_root() {
        DriverOp::Commit
    } else {
        DriverOp::Release
    }
}

pub(crate) fn doomed_error(op: DriverOp) -> DriverError {
    DriverError::new(
        op,
        "the engine already rolled back the open transaction; unwind to the root block",
    )
}
