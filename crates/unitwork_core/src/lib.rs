//! Transactional unit of work over SQLite.
//!
//! One session per execution scope (OS thread or tokio task), nested atomic
//! blocks mapped onto transactions and savepoints, and a stable error
//! taxonomy for failed blocks.

pub mod atomic;
pub mod classify;
pub mod config;
pub mod db;
pub mod driver;
pub mod logging;
pub mod model;
pub mod registry;
pub mod repo;
pub mod service;
pub mod session;

pub use atomic::{
    atomic, atomic_async, run_atomic, run_atomic_async, AtomicError, AtomicResult, WorkError,
};
pub use classify::{classify, ErrorClassification, FailureDescriptor, FailureOrigin};
pub use config::{BeginMode, ConfigError, JournalMode, SessionConfig};
pub use driver::{
    AsyncConnection, AsyncConnector, AsyncSqliteConnection, AsyncSqliteConnector, Connection,
    Connector, DriverError, DriverOp, DriverResult, SqliteConnection, SqliteConnector,
};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::entity::{Entity, EntityId, EntityValidationError};
pub use registry::{AsyncSessionRegistry, SessionRegistry};
pub use repo::entity_repo::{
    EntityListQuery, EntityRepository, RepoError, RepoResult, SqliteEntityRepository,
};
pub use service::entity_service::{AsyncEntityService, EntityService};
pub use session::{AsyncSessionHandle, FrameOrderError, SessionHandle, TransactionFrame};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
