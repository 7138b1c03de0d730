//! Entity repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide CRUD APIs over `entities` storage.
//! - Keep SQL details inside the persistence boundary.
//!
//! # Invariants
//! - Write paths call `Entity::validate()` before SQL mutations.
//! - Read paths reject invalid persisted state instead of masking it.
//! - The repository never opens or ends transactions; it runs inside
//!   whatever frame the caller's session has open.

use crate::db::DbError;
use crate::model::entity::{Entity, EntityId, EntityValidationError};
use rusqlite::{params, Connection, Row};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

const ENTITY_SELECT_SQL: &str = "SELECT
    uuid,
    description,
    created_at,
    updated_at
FROM entities";

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error for entity persistence and query operations.
#[derive(Debug)]
pub enum RepoError {
    Validation(EntityValidationError),
    Db(DbError),
    NotFound(EntityId),
    InvalidData(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "entity not found: {id}"),
            Self::InvalidData(message) => write!(f, "invalid persisted entity data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::NotFound(_) | Self::InvalidData(_) => None,
        }
    }
}

impl From<EntityValidationError> for RepoError {
    fn from(value: EntityValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Paging options for listing entities, newest first.
#[derive(Debug, Clone, Default)]
pub struct EntityListQuery {
    pub limit: Option<u32>,
    pub offset: u32,
}

/// Repository interface for entity CRUD operations.
pub trait EntityRepository {
    fn create_entity(&self, entity: &Entity) -> RepoResult<EntityId>;
    fn get_entity(&self, id: EntityId) -> RepoResult<Option<Entity>>;
    fn update_entity(&self, entity: &Entity) -> RepoResult<()>;
    fn delete_entity(&self, id: EntityId) -> RepoResult<()>;
    fn list_entities(&self, query: &EntityListQuery) -> RepoResult<Vec<Entity>>;
    fn count_entities(&self) -> RepoResult<u64>;
}

/// SQLite-backed entity repository.
pub struct SqliteEntityRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteEntityRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl EntityRepository for SqliteEntityRepository<'_> {
    fn create_entity(&self, entity: &Entity) -> RepoResult<EntityId> {
        entity.validate()?;

        self.conn.execute(
            "INSERT INTO entities (uuid, description) VALUES (?1, ?2);",
            params![entity.uuid.to_string(), entity.description.as_str()],
        )?;

        Ok(entity.uuid)
    }

    fn get_entity(&self, id: EntityId) -> RepoResult<Option<Entity>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{ENTITY_SELECT_SQL} WHERE uuid = ?1;"))?;

        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_entity_row(row)?));
        }

        Ok(None)
    }

    fn update_entity(&self, entity: &Entity) -> RepoResult<()> {
        entity.validate()?;

        let changed = self.conn.execute(
            "UPDATE entities
             SET
                description = ?1,
                updated_at = MAX(created_at, (strftime('%s', 'now') * 1000))
             WHERE uuid = ?2;",
            params![entity.description.as_str(), entity.uuid.to_string()],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound(entity.uuid));
        }

        Ok(())
    }

    fn delete_entity(&self, id: EntityId) -> RepoResult<()> {
        let changed = self
            .conn
            .execute("DELETE FROM entities WHERE uuid = ?1;", [id.to_string()])?;

        if changed == 0 {
            return Err(RepoError::NotFound(id));
        }

        Ok(())
    }

    fn list_entities(&self, query: &EntityListQuery) -> RepoResult<Vec<Entity>> {
        // SQLite treats a negative LIMIT as "no limit".
        let limit = query.limit.map_or(-1, i64::from);
        let mut stmt = self.conn.prepare(&format!(
            "{ENTITY_SELECT_SQL}
             ORDER BY updated_at DESC, uuid ASC
             LIMIT ?1 OFFSET ?2;"
        ))?;

        let mut rows = stmt.query(params![limit, i64::from(query.offset)])?;
        let mut entities = Vec::new();
        while let Some(row) = rows.next()? {
            entities.push(parse_entity_row(row)?);
        }

        Ok(entities)
    }

    fn count_entities(&self) -> RepoResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM entities;", [], |row| row.get(0))?;
        u64::try_from(count)
            .map_err(|_| RepoError::InvalidData(format!("negative entity count `{count}`")))
    }
}

fn parse_entity_row(row: &Row<'_>) -> RepoResult<Entity> {
    let uuid_text: String = row.get("uuid")?;
    let uuid = Uuid::parse_str(&uuid_text).map_err(|_| {
        RepoError::InvalidData(format!("invalid uuid value `{uuid_text}` in entities.uuid"))
    })?;

    let entity = Entity {
        uuid,
        description: row.get("description")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    };
    entity.validate()?;
    Ok(entity)
}
