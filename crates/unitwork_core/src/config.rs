//! Session configuration consumed at handle construction time.
//!
//! # Responsibility
//! - Describe the connection target and transaction behavior of a session.
//! - Load configuration from JSON and reject unusable values early.
//!
//! # Invariants
//! - A config returned by `from_json_*` has passed `validate()`.
//! - `database` is never empty; `:memory:` selects a private in-memory DB.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const IN_MEMORY_DATABASE: &str = ":memory:";
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const MAX_BUSY_TIMEOUT_MS: u64 = 10 * 60 * 1_000;

/// How the root frame opens its transaction.
///
/// SQLite has no per-transaction isolation level; the lock acquisition mode
/// is the knob that plays that role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeginMode {
    /// Locks are taken lazily on first read/write.
    #[default]
    Deferred,
    /// The write lock is taken at `BEGIN`.
    Immediate,
    /// Readers and writers are excluded at `BEGIN`.
    Exclusive,
}

impl BeginMode {
    pub fn begin_sql(self) -> &'static str {
        match self {
            Self::Deferred => "BEGIN DEFERRED;",
            Self::Immediate => "BEGIN IMMEDIATE;",
            Self::Exclusive => "BEGIN EXCLUSIVE;",
        }
    }
}

/// SQLite journal mode applied when a connection opens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    Delete,
    #[default]
    Wal,
    Memory,
}

impl JournalMode {
    pub fn as_pragma(self) -> &'static str {
        match self {
            Self::Delete => "DELETE",
            Self::Wal => "WAL",
            Self::Memory => "MEMORY",
        }
    }
}

/// Connection target and transaction behavior for one session handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// File path, or `:memory:`.
    pub database: String,
    pub begin_mode: BeginMode,
    /// Ignored for in-memory databases.
    pub journal_mode: JournalMode,
    pub busy_timeout_ms: u64,
    pub foreign_keys: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            database: IN_MEMORY_DATABASE.to_string(),
            begin_mode: BeginMode::default(),
            journal_mode: JournalMode::default(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            foreign_keys: true,
        }
    }
}

impl SessionConfig {
    /// Config for a file database with default transaction behavior.
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self {
            database: path.as_ref().to_string_lossy().into_owned(),
            ..Self::default()
        }
    }

    /// Config for a private in-memory database.
    ///
    /// Every connection gets its own database, so data is never shared
    /// between scopes.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_begin_mode(mut self, begin_mode: BeginMode) -> Self {
        self.begin_mode = begin_mode;
        self
    }

    pub fn with_journal_mode(mut self, journal_mode: JournalMode) -> Self {
        self.journal_mode = journal_mode;
        self
    }

    pub fn with_busy_timeout_ms(mut self, busy_timeout_ms: u64) -> Self {
        self.busy_timeout_ms = busy_timeout_ms;
        self
    }

    /// Parses and validates a JSON config document.
    ///
    /// Missing fields fall back to defaults; unknown fields are rejected.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Checks values that would otherwise fail late, at connect time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.trim().is_empty() {
            return Err(ConfigError::EmptyDatabase);
        }
        if self.busy_timeout_ms > MAX_BUSY_TIMEOUT_MS {
            return Err(ConfigError::BusyTimeoutTooLarge {
                value_ms: self.busy_timeout_ms,
                max_ms: MAX_BUSY_TIMEOUT_MS,
            });
        }
        Ok(())
    }

    pub fn is_in_memory(&self) -> bool {
        self.database.trim() == IN_MEMORY_DATABASE
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Configuration loading/validation errors.
#[derive(Debug)]
pub enum ConfigError {
    EmptyDatabase,
    BusyTimeoutTooLarge { value_ms: u64, max_ms: u64 },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse(serde_json::Error),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyDatabase => write!(f, "database target cannot be empty"),
            Self::BusyTimeoutTooLarge { value_ms, max_ms } => write!(
                f,
                "busy_timeout_ms {value_ms} exceeds the supported maximum {max_ms}"
            ),
            Self::Io { path, source } => {
                write!(f, "failed to read config `{}`: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "invalid session config: {err}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::EmptyDatabase | Self::BusyTimeoutTooLarge { .. } => None,
        }
    }
}
