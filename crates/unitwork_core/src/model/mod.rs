//! Domain model persisted through unit-of-work sessions.

pub mod entity;
