//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate repository calls into use-case level APIs.
//! - Own the request path: validate, then enqueue mutations as tasks.
//! - Provide the task handlers workers execute for those mutations.

pub mod repository_service;
pub mod resolver;
pub mod tasks;
