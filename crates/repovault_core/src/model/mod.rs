//! Domain model for repositories, versions, content and queued tasks.
//!
//! # Responsibility
//! - Define canonical data structures used by core business logic.
//! - Keep pure set arithmetic (version diffs) free of storage concerns.
//!
//! # Invariants
//! - Every persisted entity is identified by a stable UUID.
//! - Versions are immutable once complete.

pub mod content;
pub mod owner;
pub mod publication;
pub mod repository;
pub mod task;
pub mod version;
