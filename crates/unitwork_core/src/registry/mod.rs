//! Scope-keyed session registries.
//!
//! # Responsibility
//! - Bind at most one session handle to each execution scope.
//! - Create handles lazily and release them with a forced rollback.
//!
//! # Invariants
//! - A registry never hands out a handle that belongs to another scope.
//! - A failed connect leaves no registration behind.
//! - Registries are explicit values; nothing here is process-global.
//!
//! # See also
//! - `thread_registry` for OS-thread scopes.
//! - `task_registry` for tokio-task scopes.

pub mod task_registry;
pub mod thread_registry;

pub use task_registry::AsyncSessionRegistry;
pub use thread_registry::SessionRegistry;
