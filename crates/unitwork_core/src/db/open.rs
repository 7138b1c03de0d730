//! Connection bootstrap for SQLite sessions.
//!
//! # Responsibility
//! - Open file or in-memory SQLite connections.
//! - Apply the pragmas requested by `SessionConfig`.
//! - Trigger schema migrations before returning a usable connection.
//!
//! # Invariants
//! - Returned connections are in autocommit mode (no open transaction).
//! - Returned connections have migrations fully applied.

use super::migrations::apply_migrations;
use super::DbResult;
use crate::config::SessionConfig;
use log::{error, info};
use rusqlite::Connection;
use std::time::Instant;

/// Opens the database named by `config` and applies pending migrations.
///
/// # Side effects
/// - Creates the database file when it does not exist yet.
/// - Emits `db_open` logging events with duration and status.
pub fn open_db(config: &SessionConfig) -> DbResult<Connection> {
    let started_at = Instant::now();
    let mode = if config.is_in_memory() { "memory" } else { "file" };
    info!("event=db_open module=db status=start mode={mode}");

    let opened = if config.is_in_memory() {
        Connection::open_in_memory()
    } else {
        Connection::open(config.database.trim())
    };
    let mut conn = match opened {
        Ok(conn) => conn,
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={mode} duration_ms={} error_code=db_open_failed error={}",
                started_at.elapsed().as_millis(),
                err
            );
            return Err(err.into());
        }
    };

    match bootstrap_connection(&mut conn, config) {
        Ok(journal_mode) => {
            info!(
                "event=db_open module=db status=ok mode={mode} journal_mode={journal_mode} duration_ms={}",
                started_at.elapsed().as_millis()
            );
            Ok(conn)
        }
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={mode} duration_ms={} error_code=db_bootstrap_failed error={}",
                started_at.elapsed().as_millis(),
                err
            );
            Err(err)
        }
    }
}

fn bootstrap_connection(conn: &mut Connection, config: &SessionConfig) -> DbResult<String> {
    conn.pragma_update(None, "foreign_keys", config.foreign_keys)?;
    conn.busy_timeout(config.busy_timeout())?;

    let journal_mode = if config.is_in_memory() {
        "memory".to_string()
    } else {
        // journal_mode answers with the mode actually in effect.
        conn.pragma_update_and_check(
            None,
            "journal_mode",
            config.journal_mode.as_pragma(),
            |row| row.get::<_, String>(0),
        )?
    };

    apply_migrations(conn)?;
    Ok(journal_mode.to_ascii_lowercase())
}
