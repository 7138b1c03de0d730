//! Nesting-aware atomic execution.
//!
//! # Responsibility
//! - Run a unit of work inside a frame of the scope's session: a real
//!   transaction at depth 0, a savepoint otherwise.
//! - Classify failures and surface exactly one `AtomicError` kind.
//!
//! # Invariants
//! - Every exit path (return, error, panic, cancellation) unwinds the frame.
//! - After the root frame unwinds the session is at depth 0 and reusable.
//! - A released savepoint is provisional until the root commits.
//! - An `AtomicError` raised by an inner block keeps its kind outward.
//!
//! # See also
//! - `crate::classify` for the classification rules.

pub mod error;
mod async_atomic;
mod sync_atomic;

pub use async_atomic::{atomic_async, run_atomic_async};
pub use error::{AtomicError, AtomicResult, WorkError};
pub use sync_atomic::{atomic, run_atomic};

use crate::classify::classify;
use log::warn;
use std::time::Instant;
use uuid::Uuid;

/// Turns a failure raised inside a frame into the caller-facing error.
///
/// A lost connection is a connectivity failure, not a classified one.
pub(crate) fn resolve_failure(err: WorkError, database: &str) -> AtomicError {
    match err {
        WorkError::Atomic(inner) => inner,
        WorkError::Driver(driver) if driver.is_connection_lost() => {
            AtomicError::connection(database, driver.to_string(), Some(driver))
        }
        other => {
            let classification = classify(&other.descriptor());
            AtomicError::classified(classification, other)
        }
    }
}

pub(crate) fn log_failure(
    session_id: Uuid,
    depth_at_entry: usize,
    err: &AtomicError,
    started_at: Instant,
) {
    warn!(
        "event=atomic_rollback module=atomic status=error session_id={} depth={} classification={} code={} duration_ms={}",
        session_id,
        depth_at_entry,
        err.classification().as_str(),
        err.code(),
        started_at.elapsed().as_millis()
    );
}

#[cfg(test)]
mod tests {
    use super::{resolve_failure, AtomicError, WorkError};
    use crate::classify::{SQLSTATE_DEADLOCK_DETECTED, SQLSTATE_SERIALIZATION_FAILURE};
    use crate::driver::{DriverError, DriverOp};

    fn driver_failure(code: &str) -> WorkError {
        DriverError::new(DriverOp::Execute, "conflict")
            .with_sqlstate(code)
            .into()
    }

    #[test]
    fn driver_codes_pick_the_outward_kind() {
        assert!(matches!(
            resolve_failure(driver_failure(SQLSTATE_DEADLOCK_DETECTED), "db"),
            AtomicError::DeadlockDetected(_)
        ));
        assert!(matches!(
            resolve_failure(driver_failure(SQLSTATE_SERIALIZATION_FAILURE), "db"),
            AtomicError::Aborted(_)
        ));
        assert!(matches!(
            resolve_failure(WorkError::application("value error"), "db"),
            AtomicError::Internal(_)
        ));
    }

    #[test]
    fn inner_atomic_errors_pass_through_unchanged() {
        let inner = resolve_failure(driver_failure(SQLSTATE_SERIALIZATION_FAILURE), "db");
        let outer = resolve_failure(WorkError::Atomic(inner), "db");
        assert!(matches!(outer, AtomicError::Aborted(_)));

        let outer = resolve_failure(WorkError::Atomic(AtomicError::ScopeUnavailable), "db");
        assert!(matches!(outer, AtomicError::ScopeUnavailable));
    }

    #[test]
    fn lost_connection_is_a_connection_error() {
        let err = resolve_failure(DriverError::closed(DriverOp::Commit).into(), "app.db");
        match err {
            AtomicError::Connection {
                database, source, ..
            } => {
                assert_eq!(database, "app.db");
                assert_eq!(source.map(|err| err.op()), Some(DriverOp::Commit));
            }
            other => panic!("expected connection error, got {other:?}"),
        }
    }
}
