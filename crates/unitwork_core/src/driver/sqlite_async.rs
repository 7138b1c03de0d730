//! Async SQLite driver: one worker thread per connection.
//!
//! # Responsibility
//! - Implement `AsyncConnector`/`AsyncConnection` without blocking the
//!   async runtime on SQLite calls.
//! - Run every call for one connection in submission order.
//!
//! # Invariants
//! - The `rusqlite::Connection` lives on its worker thread only.
//! - Jobs run strictly FIFO, so a rollback queued after a cancelled call
//!   always executes after that call.
//! - Dropping the last handle stops the worker and closes the connection,
//!   which makes SQLite discard any open transaction.
//! - A worker that stops answering marks the connection closed.

use super::{
    validate_savepoint_name, AsyncConnection, AsyncConnector, DriverError, DriverOp,
    DriverResult,
};
use crate::config::{BeginMode, ConfigError, SessionConfig};
use crate::db::open_db;
use async_trait::async_trait;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce(&mut Option<rusqlite::Connection>) + Send>;

/// Opens worker-backed SQLite connections for one configured database.
#[derive(Debug, Clone)]
pub struct AsyncSqliteConnector {
    config: SessionConfig,
}

impl AsyncSqliteConnector {
    pub fn new(config: SessionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

#[async_trait]
impl AsyncConnector for AsyncSqliteConnector {
    type Connection = AsyncSqliteConnection;

    async fn connect(&self) -> DriverResult<AsyncSqliteConnection> {
        let config = self.config.clone();
        let conn = tokio::task::spawn_blocking(move || open_db(&config))
            .await
            .map_err(|err| {
                DriverError::new(DriverOp::Connect, format!("connect task failed: {err}"))
            })??;
        AsyncSqliteConnection::spawn(conn, self.config.begin_mode)
    }

    fn target(&self) -> &str {
        &self.config.database
    }
}

/// Handle to a SQLite connection owned by a dedicated worker thread.
pub struct AsyncSqliteConnection {
    jobs: mpsc::UnboundedSender<Job>,
    open: Arc<AtomicBool>,
    begin_mode: BeginMode,
}

impl AsyncSqliteConnection {
    /// Moves `conn` onto a new worker thread.
    pub fn spawn(conn: rusqlite::Connection, begin_mode: BeginMode) -> DriverResult<Self> {
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();
        std::thread::Builder::new()
            .name("unitwork-sqlite".to_string())
            .spawn(move || {
                let mut slot = Some(conn);
                while let Some(job) = queue.blocking_recv() {
                    job(&mut slot);
                }
                debug!("event=sqlite_worker_exit module=driver status=ok");
            })
            .map_err(|err| {
                DriverError::new(DriverOp::Connect, "failed to spawn connection worker")
                    .with_source(err)
            })?;

        Ok(Self {
            jobs,
            open: Arc::new(AtomicBool::new(true)),
            begin_mode,
        })
    }

    /// Runs `f` against the connection on the worker thread.
    ///
    /// The closure's error type only needs to absorb `DriverError`, so work
    /// closures can return their own error type directly.
    pub async fn call<F, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<DriverError> + Send + 'static,
    {
        self.submit(DriverOp::Execute, move |slot| match slot.as_mut() {
            Some(conn) => f(conn),
            None => Err(E::from(DriverError::closed(DriverOp::Execute))),
        })
        .await
    }

    async fn submit<F, R, E>(&self, op: DriverOp, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut Option<rusqlite::Connection>) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<DriverError> + Send + 'static,
    {
        let (reply, answer) = oneshot::channel();
        let job: Job = Box::new(move |slot: &mut Option<rusqlite::Connection>| {
            let _ = reply.send(f(slot));
        });
        if self.jobs.send(job).is_err() {
            self.open.store(false, Ordering::SeqCst);
            return Err(E::from(DriverError::closed(op)));
        }
        match answer.await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.open.store(false, Ordering::SeqCst);
                Err(E::from(DriverError::lost(
                    op,
                    "connection worker stopped before replying",
                )))
            }
        }
    }

    async fn exec(&self, op: DriverOp, sql: String) -> DriverResult<()> {
        self.submit(op, move |slot| {
            let conn = slot.as_mut().ok_or_else(|| DriverError::closed(op))?;
            conn.execute_batch(&sql)
                .map_err(|err| DriverError::from(err).at(op))
        })
        .await
    }
}

#[async_trait]
impl AsyncConnection for AsyncSqliteConnection {
    async fn begin(&self) -> DriverResult<()> {
        self.exec(DriverOp::Begin, self.begin_mode.begin_sql().to_string())
            .await
    }

    async fn savepoint(&self, name: &str) -> DriverResult<()> {
        validate_savepoint_name(DriverOp::Savepoint, name)?;
        self.exec(DriverOp::Savepoint, format!("SAVEPOINT {name};"))
            .await
    }

    async fn release(&self, name: &str) -> DriverResult<()> {
        validate_savepoint_name(DriverOp::Release, name)?;
        self.exec(DriverOp::Release, format!("RELEASE SAVEPOINT {name};"))
            .await
    }

    async fn rollback(&self) -> DriverResult<()> {
        self.exec(DriverOp::Rollback, "ROLLBACK;".to_string()).await
    }

    async fn rollback_to(&self, name: &str) -> DriverResult<()> {
        validate_savepoint_name(DriverOp::RollbackTo, name)?;
        self.exec(
            DriverOp::RollbackTo,
            format!("ROLLBACK TO SAVEPOINT {name};"),
        )
        .await
    }

    async fn commit(&self) -> DriverResult<()> {
        self.exec(DriverOp::Commit, "COMMIT;".to_string()).await
    }

    async fn close(&self) -> DriverResult<()> {
        self.open.store(false, Ordering::SeqCst);
        self.submit(DriverOp::Close, |slot| match slot.take() {
            Some(conn) => conn
                .close()
                .map_err(|(_, err)| DriverError::from(err).at(DriverOp::Close)),
            None => Ok(()),
        })
        .await
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn in_transaction(&self) -> DriverResult<bool> {
        self.submit(DriverOp::Execute, |slot| {
            Ok(slot.as_ref().is_some_and(|conn| !conn.is_autocommit()))
        })
        .await
    }
}
