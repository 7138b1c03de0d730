//! Driver boundary consumed by session handles.
//!
//! # Responsibility
//! - Define the transaction primitives a session needs from a database
//!   client: connect, begin, savepoint, release, rollback, rollback-to,
//!   commit, close.
//! - Normalize driver failures into `DriverError` with an optional
//!   SQLSTATE-style code so classification stays driver-agnostic.
//!
//! # Invariants
//! - Savepoint names are validated before they are spliced into SQL.
//! - A closed connection rejects every primitive with `DriverOp`-tagged errors
//!   marked `is_connection_lost`.

use crate::classify::FailureDescriptor;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod sqlite;
pub mod sqlite_async;

pub use sqlite::{SqliteConnection, SqliteConnector};
pub use sqlite_async::{AsyncSqliteConnection, AsyncSqliteConnector};

pub type DriverResult<T> = Result<T, DriverError>;

static SAVEPOINT_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("savepoint name pattern is valid")
});

/// Driver primitive that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOp {
    Connect,
    Begin,
    Savepoint,
    Release,
    Rollback,
    RollbackTo,
    Commit,
    Close,
    Execute,
}

impl DriverOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Begin => "begin",
            Self::Savepoint => "savepoint",
            Self::Release => "release",
            Self::Rollback => "rollback",
            Self::RollbackTo => "rollback_to",
            Self::Commit => "commit",
            Self::Close => "close",
            Self::Execute => "execute",
        }
    }
}

/// Normalized driver failure.
#[derive(Debug)]
pub struct DriverError {
    op: DriverOp,
    sqlstate: Option<String>,
    message: String,
    connection_lost: bool,
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl DriverError {
    pub fn new(op: DriverOp, message: impl Into<String>) -> Self {
        Self {
            op,
            sqlstate: None,
            message: message.into(),
            connection_lost: false,
            source: None,
        }
    }

    /// Error returned by every primitive once the connection is closed.
    pub fn closed(op: DriverOp) -> Self {
        Self::lost(op, "connection is closed")
    }

    /// The connection is gone; no later call on it can succeed.
    pub fn lost(op: DriverOp, message: impl Into<String>) -> Self {
        Self {
            connection_lost: true,
            ..Self::new(op, message)
        }
    }

    /// Attaches a SQLSTATE-style code (e.g. `40001`).
    pub fn with_sqlstate(mut self, sqlstate: impl Into<String>) -> Self {
        self.sqlstate = Some(sqlstate.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Re-tags the primitive, keeping code and source.
    pub fn at(mut self, op: DriverOp) -> Self {
        self.op = op;
        self
    }

    pub fn op(&self) -> DriverOp {
        self.op
    }

    pub fn sqlstate(&self) -> Option<&str> {
        self.sqlstate.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_connection_lost(&self) -> bool {
        self.connection_lost
    }

    pub fn descriptor(&self) -> FailureDescriptor {
        FailureDescriptor::driver(self.sqlstate())
    }
}

impl Display for DriverError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "driver {} failed: {}", self.op.as_str(), self.message)?;
        if let Some(code) = &self.sqlstate {
            write!(f, " (sqlstate {code})")?;
        }
        Ok(())
    }
}

impl Error for DriverError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn Error + 'static))
    }
}

/// Rejects names that are not plain SQL identifiers.
pub fn validate_savepoint_name(op: DriverOp, name: &str) -> DriverResult<()> {
    if SAVEPOINT_NAME.is_match(name) {
        return Ok(());
    }
    Err(DriverError::new(
        op,
        format!("invalid savepoint name `{name}`"),
    ))
}

/// Blocking connection owned by exactly one session handle.
pub trait Connection: Send {
    fn begin(&mut self) -> DriverResult<()>;
    fn savepoint(&mut self, name: &str) -> DriverResult<()>;
    fn release(&mut self, name: &str) -> DriverResult<()>;
    fn rollback(&mut self) -> DriverResult<()>;
    fn rollback_to(&mut self, name: &str) -> DriverResult<()>;
    fn commit(&mut self) -> DriverResult<()>;
    /// Closes the connection; later primitives fail with `closed`.
    fn close(&mut self) -> DriverResult<()>;
    fn is_open(&self) -> bool;
    /// Whether the engine currently has an open transaction.
    fn in_transaction(&self) -> bool;
}

/// Factory for blocking connections.
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection + 'static;

    fn connect(&self) -> DriverResult<Self::Connection>;
    /// Connection target used in logs and connection errors.
    fn target(&self) -> &str;
}

/// Async connection owned by exactly one task-scoped session handle.
#[async_trait]
pub trait AsyncConnection: Send + Sync {
    async fn begin(&self) -> DriverResult<()>;
    async fn savepoint(&self, name: &str) -> DriverResult<()>;
    async fn release(&self, name: &str) -> DriverResult<()>;
    async fn rollback(&self) -> DriverResult<()>;
    async fn rollback_to(&self, name: &str) -> DriverResult<()>;
    async fn commit(&self) -> DriverResult<()>;
    async fn close(&self) -> DriverResult<()>;
    fn is_open(&self) -> bool;
    async fn in_transaction(&self) -> DriverResult<bool>;
}

/// Factory for async connections.
#[async_trait]
pub trait AsyncConnector: Send + Sync + 'static {
    type Connection: AsyncConnection + 'static;

    async fn connect(&self) -> DriverResult<Self::Connection>;
    fn target(&self) -> &str;
}
