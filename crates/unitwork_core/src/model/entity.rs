//! Entity domain model.
//!
//! # Responsibility
//! - Define the record persisted by the storage adapter.
//! - Validate records before they reach SQL.
//!
//! # Invariants
//! - `uuid` is stable and never reused for another entity.
//! - `description` is non-blank and at most `MAX_DESCRIPTION_CHARS` long.
//! - `updated_at` is never earlier than `created_at` when both are known.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub type EntityId = Uuid;

pub const MAX_DESCRIPTION_CHARS: usize = 1_000;

/// One row of the `entities` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub uuid: EntityId,
    pub description: String,
    /// Unix epoch milliseconds; assigned by storage on insert.
    pub created_at: Option<i64>,
    /// Unix epoch milliseconds; refreshed by storage on every update.
    pub updated_at: Option<i64>,
}

impl Entity {
    /// Creates an entity with a generated stable ID.
    pub fn new(description: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), description)
    }

    /// Creates an entity with a caller-provided stable ID.
    pub fn with_id(uuid: EntityId, description: impl Into<String>) -> Self {
        Self {
            uuid,
            description: description.into(),
            created_at: None,
            updated_at: None,
        }
    }

    pub fn validate(&self) -> Result<(), EntityValidationError> {
        if self.description.trim().is_empty() {
            return Err(EntityValidationError::EmptyDescription);
        }
        let chars = self.description.chars().count();
        if chars > MAX_DESCRIPTION_CHARS {
            return Err(EntityValidationError::DescriptionTooLong {
                chars,
                max_chars: MAX_DESCRIPTION_CHARS,
            });
        }
        if let (Some(created_at), Some(updated_at)) = (self.created_at, self.updated_at) {
            if updated_at < created_at {
                return Err(EntityValidationError::UpdatedBeforeCreated {
                    created_at,
                    updated_at,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityValidationError {
    EmptyDescription,
    DescriptionTooLong { chars: usize, max_chars: usize },
    UpdatedBeforeCreated { created_at: i64, updated_at: i64 },
}

impl Display for EntityValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyDescription => write!(f, "entity description cannot be empty"),
            Self::DescriptionTooLong { chars, max_chars } => write!(
                f,
                "entity description has {chars} characters; maximum is {max_chars}"
            ),
            Self::UpdatedBeforeCreated {
                created_at,
                updated_at,
            } => write!(
                f,
                "entity updated_at ({updated_at}) is earlier than created_at ({created_at})"
            ),
        }
    }
}

impl Error for EntityValidationError {}
