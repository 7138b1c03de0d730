//! Caller-facing error taxonomy of atomic blocks.
//!
//! # Responsibility
//! - Surface exactly one outward kind per failed block.
//! - Keep the original failure reachable through `source()`.
//!
//! # Invariants
//! - `Internal`, `Aborted` and `DeadlockDetected` are derived from the
//!   classification only; callers never construct them from raw driver codes.
//! - An `AtomicError` raised by an inner block keeps its kind while it
//!   propagates through enclosing blocks.

use crate::classify::{ErrorClassification, FailureDescriptor};
use crate::db::DbError;
use crate::driver::DriverError;
use crate::repo::entity_repo::RepoError;
use crate::session::FrameOrderError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type AtomicResult<T> = Result<T, AtomicError>;

/// Failure surfaced by `run_atomic` and friends.
#[derive(Debug)]
pub enum AtomicError {
    /// Unrecognized failure; the block was fully unwound.
    Internal(Box<WorkError>),
    /// Serialization conflict; retrying the whole top-level block may succeed.
    Aborted(Box<WorkError>),
    /// Lock-wait cycle; same retry semantics as `Aborted`.
    DeadlockDetected(Box<WorkError>),
    /// The scope's connection could not be opened or is no longer usable.
    Connection {
        database: String,
        details: String,
        source: Option<DriverError>,
    },
    /// No execution scope could be identified for the caller.
    ScopeUnavailable,
}

impl AtomicError {
    /// Wraps `cause` in the kind chosen by `classification`.
    pub fn classified(classification: ErrorClassification, cause: WorkError) -> Self {
        let cause = Box::new(cause);
        match classification {
            ErrorClassification::Generic => Self::Internal(cause),
            ErrorClassification::TransientConflict => Self::Aborted(cause),
            ErrorClassification::StructuralConflict => Self::DeadlockDetected(cause),
        }
    }

    pub(crate) fn connection(
        database: &str,
        details: impl Into<String>,
        source: Option<DriverError>,
    ) -> Self {
        Self::Connection {
            database: database.to_string(),
            details: details.into(),
            source,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Aborted(_) => "ABORTED",
            Self::DeadlockDetected(_) => "DEADLOCK",
            Self::Connection { .. } => "DATABASE_CONNECTION_ERROR",
            Self::ScopeUnavailable => "SCOPE_UNAVAILABLE",
        }
    }

    pub fn classification(&self) -> ErrorClassification {
        match self {
            Self::Aborted(_) => ErrorClassification::TransientConflict,
            Self::DeadlockDetected(_) => ErrorClassification::StructuralConflict,
            Self::Internal(_) | Self::Connection { .. } | Self::ScopeUnavailable => {
                ErrorClassification::Generic
            }
        }
    }

    /// Whether re-running the whole top-level block is likely to succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Aborted(_) | Self::DeadlockDetected(_))
    }

    /// The failure raised inside the block, for classified kinds.
    pub fn cause(&self) -> Option<&WorkError> {
        match self {
            Self::Internal(cause) | Self::Aborted(cause) | Self::DeadlockDetected(cause) => {
                Some(cause.as_ref())
            }
            Self::Connection { .. } | Self::ScopeUnavailable => None,
        }
    }
}

impl Display for AtomicError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Internal(cause) => write!(f, "internal error in atomic block: {cause}"),
            Self::Aborted(cause) => write!(f, "transaction aborted: {cause}"),
            Self::DeadlockDetected(cause) => write!(f, "deadlock detected: {cause}"),
            Self::Connection {
                database, details, ..
            } => write!(f, "database connection error for `{database}`: {details}"),
            Self::ScopeUnavailable => write!(
                f,
                "no execution scope: async sessions must run inside a tokio task"
            ),
        }
    }
}

impl Error for AtomicError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Internal(cause) | Self::Aborted(cause) | Self::DeadlockDetected(cause) => {
                Some(cause.as_ref())
            }
            Self::Connection { source, .. } => {
                source.as_ref().map(|err| err as &(dyn Error + 'static))
            }
            Self::ScopeUnavailable => None,
        }
    }
}

/// Failure returned by a work closure.
#[derive(Debug)]
pub enum WorkError {
    Driver(DriverError),
    /// Raised by a nested atomic block and not handled by the work.
    Atomic(AtomicError),
    Application(Box<dyn Error + Send + Sync>),
}

impl WorkError {
    /// Wraps any application error (or message) raised inside a block.
    pub fn application(err: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self::Application(err.into())
    }

    pub fn descriptor(&self) -> FailureDescriptor {
        match self {
            Self::Driver(err) => err.descriptor(),
            Self::Atomic(err) => err
                .cause()
                .map_or_else(FailureDescriptor::application, WorkError::descriptor),
            Self::Application(_) => FailureDescriptor::application(),
        }
    }
}

impl Display for WorkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Driver(err) => write!(f, "{err}"),
            Self::Atomic(err) => write!(f, "{err}"),
            Self::Application(err) => write!(f, "{err}"),
        }
    }
}

impl Error for WorkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Driver(err) => Some(err),
            Self::Atomic(err) => Some(err),
            Self::Application(err) => Some(err.as_ref()),
        }
    }
}

impl From<DriverError> for WorkError {
    fn from(value: DriverError) -> Self {
        Self::Driver(value)
    }
}

impl From<rusqlite::Error> for WorkError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Driver(value.into())
    }
}

impl From<AtomicError> for WorkError {
    fn from(value: AtomicError) -> Self {
        Self::Atomic(value)
    }
}

impl From<FrameOrderError> for WorkError {
    fn from(value: FrameOrderError) -> Self {
        Self::Application(Box::new(value))
    }
}

impl From<RepoError> for WorkError {
    fn from(value: RepoError) -> Self {
        match value {
            // Storage failures stay driver failures so conflicts are still classified.
            RepoError::Db(DbError::Sqlite(err)) => Self::Driver(err.into()),
            other => Self::Application(Box::new(other)),
        }
    }
}
