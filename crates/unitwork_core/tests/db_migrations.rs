use rusqlite::Connection;
use unitwork_core::db::migrations::latest_version;
use unitwork_core::db::{open_db, DbError};
use unitwork_core::{JournalMode, SessionConfig};

#[test]
fn in_memory_database_gets_all_migrations() {
    let conn = open_db(&SessionConfig::in_memory()).unwrap();

    assert_eq!(schema_version(&conn), latest_version());
    assert_table_exists(&conn, "entities");
    assert!(conn.is_autocommit());
}

#[test]
fn opening_same_file_twice_is_idempotent_and_uses_wal() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig::file(dir.path().join("unitwork.db"));

    let first = open_db(&config).unwrap();
    assert_eq!(schema_version(&first), latest_version());
    drop(first);

    let second = open_db(&config).unwrap();
    assert_eq!(schema_version(&second), latest_version());
    let journal_mode: String = second
        .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(journal_mode.to_ascii_lowercase(), "wal");
}

#[test]
fn journal_mode_follows_config() {
    let dir = tempfile::tempdir().unwrap();
    let config =
        SessionConfig::file(dir.path().join("delete.db")).with_journal_mode(JournalMode::Delete);

    let conn = open_db(&config).unwrap();
    let journal_mode: String = conn
        .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(journal_mode.to_ascii_lowercase(), "delete");
}

#[test]
fn newer_schema_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.db");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    let err = open_db(&SessionConfig::file(&path)).unwrap_err();
    match err {
        DbError::UnsupportedSchemaVersion {
            db_version,
            latest_supported,
        } => {
            assert_eq!(db_version, 999);
            assert_eq!(latest_supported, latest_version());
        }
        other => panic!("unexpected error: {other}"),
    }
}

fn schema_version(conn: &Connection) -> u32 {
    conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
        .unwrap()
}

fn assert_table_exists(conn: &Connection, table_name: &str) {
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM sqlite_master
                WHERE type = 'table' AND name = ?1
            );",
            [table_name],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(exists, 1, "table {table_name} does not exist");
}
