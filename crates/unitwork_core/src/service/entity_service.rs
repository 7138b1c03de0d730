//! Entity use-case services.
//!
//! # Responsibility
//! - Provide CRUD entry points that always run inside an atomic block.
//! - Delegate persistence to `SqliteEntityRepository`.
//!
//! # Invariants
//! - Every call joins the caller's open block as a savepoint, or opens its
//!   own transaction when none is open.
//! - Service calls made from inside `SessionHandle::with_connection` fail
//!   with `AtomicError::Internal`.

use crate::atomic::{atomic, atomic_async, AtomicResult, WorkError};
use crate::driver::{AsyncSqliteConnector, SqliteConnector};
use crate::model::entity::{Entity, EntityId};
use crate::registry::{AsyncSessionRegistry, SessionRegistry};
use crate::repo::entity_repo::{EntityListQuery, EntityRepository, SqliteEntityRepository};

/// Blocking entity service over a thread-scoped registry.
pub struct EntityService {
    registry: SessionRegistry<SqliteConnector>,
}

impl EntityService {
    pub fn new(registry: SessionRegistry<SqliteConnector>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SessionRegistry<SqliteConnector> {
        &self.registry
    }

    pub fn create_entity(&self, entity: &Entity) -> AtomicResult<EntityId> {
        self.with_repo(|repo| Ok(repo.create_entity(entity)?))
    }

    pub fn get_entity(&self, id: EntityId) -> AtomicResult<Option<Entity>> {
        self.with_repo(|repo| Ok(repo.get_entity(id)?))
    }

    pub fn update_entity(&self, entity: &Entity) -> AtomicResult<()> {
        self.with_repo(|repo| Ok(repo.update_entity(entity)?))
    }

    pub fn delete_entity(&self, id: EntityId) -> AtomicResult<()> {
        self.with_repo(|repo| Ok(repo.delete_entity(id)?))
    }

    pub fn list_entities(&self, query: &EntityListQuery) -> AtomicResult<Vec<Entity>> {
        self.with_repo(|repo| Ok(repo.list_entities(query)?))
    }

    pub fn count_entities(&self) -> AtomicResult<u64> {
        self.with_repo(|repo| Ok(repo.count_entities()?))
    }

    fn with_repo<T, F>(&self, f: F) -> AtomicResult<T>
    where
        F: FnOnce(&SqliteEntityRepository<'_>) -> Result<T, WorkError>,
    {
        atomic(&self.registry, |session| {
            session.with_connection(|conn| f(&SqliteEntityRepository::new(conn.raw()?)))
        })
    }
}

/// Async entity service over a task-scoped registry.
///
/// Must be called from inside a tokio task. A call made outside any block
/// opens and releases its own session; wrap a batch of calls in
/// `AsyncSessionRegistry::scoped` to share one.
pub struct AsyncEntityService {
    registry: AsyncSessionRegistry<AsyncSqliteConnector>,
}

impl AsyncEntityService {
    pub fn new(registry: AsyncSessionRegistry<AsyncSqliteConnector>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &AsyncSessionRegistry<AsyncSqliteConnector> {
        &self.registry
    }

    pub async fn create_entity(&self, entity: Entity) -> AtomicResult<EntityId> {
        self.with_repo(move |repo| Ok(repo.create_entity(&entity)?))
            .await
    }

    pub async fn get_entity(&self, id: EntityId) -> AtomicResult<Option<Entity>> {
        self.with_repo(move |repo| Ok(repo.get_entity(id)?)).await
    }

    pub async fn update_entity(&self, entity: Entity) -> AtomicResult<()> {
        self.with_repo(move |repo| Ok(repo.update_entity(&entity)?))
            .await
    }

    pub async fn delete_entity(&self, id: EntityId) -> AtomicResult<()> {
        self.with_repo(move |repo| Ok(repo.delete_entity(id)?)).await
    }

    pub async fn list_entities(&self, query: EntityListQuery) -> AtomicResult<Vec<Entity>> {
        self.with_repo(move |repo| Ok(repo.list_entities(&query)?))
            .await
    }

    pub async fn count_entities(&self) -> AtomicResult<u64> {
        self.with_repo(|repo| Ok(repo.count_entities()?)).await
    }

    async fn with_repo<T, F>(&self, f: F) -> AtomicResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteEntityRepository<'_>) -> Result<T, WorkError> + Send + 'static,
    {
        atomic_async(&self.registry, move |session| async move {
            session
                .connection()
                .await?
                .call(move |raw| f(&SqliteEntityRepository::new(raw)))
                .await
        })
        .await
    }
}
