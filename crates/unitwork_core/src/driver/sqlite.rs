//! Blocking SQLite driver built on `rusqlite`.
//!
//! # Responsibility
//! - Implement `Connector`/`Connection` over one `rusqlite::Connection`.
//! - Translate SQLite lock/snapshot failures into SQLSTATE-style codes.
//!
//! # Invariants
//! - `SQLITE_BUSY_SNAPSHOT` maps to `40001`; other `SQLITE_BUSY*` and
//!   `SQLITE_LOCKED*` map to `40P01`. Everything else carries no code.
//! - SQLite reports a refused lock upgrade and an expired busy timeout with
//!   the same `SQLITE_BUSY`, so a busy timeout also surfaces as
//!   `DeadlockDetected`. Raise `busy_timeout_ms` to wait out long writers.

use super::{
    validate_savepoint_name, Connection, Connector, DriverError, DriverOp, DriverResult,
};
use crate::classify::{SQLSTATE_DEADLOCK_DETECTED, SQLSTATE_SERIALIZATION_FAILURE};
use crate::config::{BeginMode, ConfigError, SessionConfig};
use crate::db::{open_db, DbError};
use rusqlite::ErrorCode;
use std::os::raw::c_int;

// SQLITE_BUSY | (2 << 8): a WAL read snapshot went stale before the write.
const SQLITE_BUSY_SNAPSHOT: c_int = 5 | (2 << 8);

/// Opens SQLite connections for one configured database.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    config: SessionConfig,
}

impl SqliteConnector {
    pub fn new(config: SessionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl Connector for SqliteConnector {
    type Connection = SqliteConnection;

    fn connect(&self) -> DriverResult<SqliteConnection> {
        let conn = open_db(&self.config)?;
        Ok(SqliteConnection::new(conn, self.config.begin_mode))
    }

    fn target(&self) -> &str {
        &self.config.database
    }
}

/// One SQLite connection plus the begin mode of its root transactions.
pub struct SqliteConnection {
    conn: Option<rusqlite::Connection>,
    begin_mode: BeginMode,
}

impl SqliteConnection {
    pub fn new(conn: rusqlite::Connection, begin_mode: BeginMode) -> Self {
        Self {
            conn: Some(conn),
            begin_mode,
        }
    }

    /// Borrows the underlying connection for statements inside a frame.
    pub fn raw(&self) -> DriverResult<&rusqlite::Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| DriverError::closed(DriverOp::Execute))
    }

    fn exec(&self, op: DriverOp, sql: &str) -> DriverResult<()> {
        let conn = self.conn.as_ref().ok_or_else(|| DriverError::closed(op))?;
        conn.execute_batch(sql)
            .map_err(|err| DriverError::from(err).at(op))
    }
}

impl Connection for SqliteConnection {
    fn begin(&mut self) -> DriverResult<()> {
        self.exec(DriverOp::Begin, self.begin_mode.begin_sql())
    }

    fn savepoint(&mut self, name: &str) -> DriverResult<()> {
        validate_savepoint_name(DriverOp::Savepoint, name)?;
        self.exec(DriverOp::Savepoint, &format!("SAVEPOINT {name};"))
    }

    fn release(&mut self, name: &str) -> DriverResult<()> {
        validate_savepoint_name(DriverOp::Release, name)?;
        self.exec(DriverOp::Release, &format!("RELEASE SAVEPOINT {name};"))
    }

    fn rollback(&mut self) -> DriverResult<()> {
        self.exec(DriverOp::Rollback, "ROLLBACK;")
    }

    fn rollback_to(&mut self, name: &str) -> DriverResult<()> {
        validate_savepoint_name(DriverOp::RollbackTo, name)?;
        self.exec(
            DriverOp::RollbackTo,
            &format!("ROLLBACK TO SAVEPOINT {name};"),
        )
    }

    fn commit(&mut self) -> DriverResult<()> {
        self.exec(DriverOp::Commit, "COMMIT;")
    }

    fn close(&mut self) -> DriverResult<()> {
        match self.conn.take() {
            Some(conn) => conn
                .close()
                .map_err(|(_, err)| DriverError::from(err).at(DriverOp::Close)),
            None => Ok(()),
        }
    }

    fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    fn in_transaction(&self) -> bool {
        self.conn
            .as_ref()
            .is_some_and(|conn| !conn.is_autocommit())
    }
}

impl From<rusqlite::Error> for DriverError {
    fn from(value: rusqlite::Error) -> Self {
        let message = value.to_string();
        let error = DriverError::new(DriverOp::Execute, message);
        let error = match sqlstate_for(&value) {
            Some(code) => error.with_sqlstate(code),
            None => error,
        };
        error.with_source(value)
    }
}

impl From<DbError> for DriverError {
    fn from(value: DbError) -> Self {
        match value {
            DbError::Sqlite(err) => DriverError::from(err).at(DriverOp::Connect),
            other => DriverError::new(DriverOp::Connect, other.to_string()).with_source(other),
        }
    }
}

/// SQLSTATE-style code for SQLite lock and snapshot failures.
pub(crate) fn sqlstate_for(err: &rusqlite::Error) -> Option<&'static str> {
    let rusqlite::Error::SqliteFailure(ffi_err, _) = err else {
        return None;
    };

    match ffi_err.code {
        ErrorCode::DatabaseBusy if ffi_err.extended_code == SQLITE_BUSY_SNAPSHOT => {
            Some(SQLSTATE_SERIALIZATION_FAILURE)
        }
        // Lock cycle or busy timeout; the engine does not tell them apart.
        ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => Some(SQLSTATE_DEADLOCK_DETECTED),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{sqlstate_for, SqliteConnector, SQLITE_BUSY_SNAPSHOT};
    use crate::config::SessionConfig;
    use crate::db::DbError;
    use crate::driver::{Connection, Connector, DriverError, DriverOp};
    use rusqlite::ffi;

    fn failure(extended_code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(ffi::Error::new(extended_code), None)
    }

    #[test]
    fn busy_snapshot_maps_to_serialization_failure() {
        assert_eq!(sqlstate_for(&failure(SQLITE_BUSY_SNAPSHOT)), Some("40001"));
    }

    #[test]
    fn busy_timeout_behind_a_writer_maps_to_deadlock() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::file(dir.path().join("busy.db")).with_busy_timeout_ms(10);
        let connector = SqliteConnector::new(config).unwrap();
        let mut writer = connector.connect().unwrap();
        let mut waiter = connector.connect().unwrap();

        writer.begin().unwrap();
        writer
            .raw()
            .unwrap()
            .execute_batch("INSERT INTO entities (uuid, description) VALUES ('a', 'held');")
            .unwrap();
        waiter.begin().unwrap();
        let err = waiter
            .raw()
            .unwrap()
            .execute_batch("INSERT INTO entities (uuid, description) VALUES ('b', 'waits');")
            .map_err(DriverError::from)
            .unwrap_err();
        assert_eq!(err.sqlstate(), Some("40P01"));

        waiter.rollback().unwrap();
        writer.rollback().unwrap();
    }

    #[test]
    fn busy_and_locked_map_to_deadlock() {
        assert_eq!(sqlstate_for(&failure(ffi::SQLITE_BUSY)), Some("40P01"));
        assert_eq!(sqlstate_for(&failure(ffi::SQLITE_LOCKED)), Some("40P01"));
    }

    #[test]
    fn open_failures_are_tagged_as_connect() {
        let err = DriverError::from(DbError::UnsupportedSchemaVersion {
            db_version: 9,
            latest_supported: 1,
        });
        assert_eq!(err.op(), DriverOp::Connect);
        assert!(err.message().contains("newer than supported"));

        let err = DriverError::from(DbError::Sqlite(failure(ffi::SQLITE_BUSY)));
        assert_eq!(err.op(), DriverOp::Connect);
        assert_eq!(err.sqlstate(), Some("40P01"));
    }

    #[test]
    fn other_failures_carry_no_code() {
        assert_eq!(sqlstate_for(&failure(ffi::SQLITE_CONSTRAINT)), None);
        assert_eq!(sqlstate_for(&rusqlite::Error::QueryReturnedNoRows), None);
    }

    #[test]
    fn savepoint_primitives_nest_on_one_connection() {
        let connector = SqliteConnector::new(SessionConfig::in_memory()).unwrap();
        let mut conn = connector.connect().unwrap();
        assert!(!conn.in_transaction());

        conn.begin().unwrap();
        assert!(conn.in_transaction());
        conn.raw()
            .unwrap()
            .execute_batch("INSERT INTO entities (uuid, description) VALUES ('a', 'kept');")
            .unwrap();
        conn.savepoint("sp_2").unwrap();
        conn.raw()
            .unwrap()
            .execute_batch("INSERT INTO entities (uuid, description) VALUES ('b', 'undone');")
            .unwrap();
        conn.rollback_to("sp_2").unwrap();
        conn.release("sp_2").unwrap();
        conn.commit().unwrap();
        assert!(!conn.in_transaction());

        let count: i64 = conn
            .raw()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM entities;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn closed_connection_rejects_primitives() {
        let connector = SqliteConnector::new(SessionConfig::in_memory()).unwrap();
        let mut conn = connector.connect().unwrap();
        conn.close().unwrap();
        assert!(!conn.is_open());
        conn.close().expect("close is idempotent");

        let err = conn.begin().unwrap_err();
        assert_eq!(err.op(), DriverOp::Begin);
        assert!(conn.raw().is_err());
    }

    #[test]
    fn invalid_savepoint_name_is_rejected_before_sql() {
        let connector = SqliteConnector::new(SessionConfig::in_memory()).unwrap();
        let mut conn = connector.connect().unwrap();
        conn.begin().unwrap();
        let err = conn.savepoint("x; DROP TABLE entities").unwrap_err();
        assert_eq!(err.op(), DriverOp::Savepoint);
        conn.rollback().unwrap();
    }
}
