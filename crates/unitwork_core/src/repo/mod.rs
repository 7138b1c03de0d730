//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define data access contracts over a borrowed connection.
//! - Isolate SQLite query details from services.
//!
//! # Invariants
//! - Repository writes enforce `Entity::validate()` before persistence.
//! - Repository APIs return semantic errors (`NotFound`) in addition to DB
//!   transport errors.

pub mod entity_repo;
