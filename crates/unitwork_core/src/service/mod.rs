//! Use-case services running repository calls inside atomic blocks.

pub mod entity_service;
