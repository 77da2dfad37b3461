//! Named task handlers.

use crate::repo::RepoError;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::Connection;
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

static TASK_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z][a-z0-9_]*(\.[a-z][a-z0-9_]*)*$").expect("valid task name regex")
});

/// Failure captured from a task body and stored on the task record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskError {
    message: String,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for TaskError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for TaskError {}

impl From<RepoError> for TaskError {
    fn from(value: RepoError) -> Self {
        Self::new(value.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(value: serde_json::Error) -> Self {
        Self::new(format!("invalid task arguments: {value}"))
    }
}

pub type TaskOutput = Result<Value, TaskError>;

/// Task body: runs on a worker connection with the submitted JSON arguments.
pub type TaskHandler = Arc<dyn Fn(&Connection, &Value) -> TaskOutput + Send + Sync>;

/// Registration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    InvalidTaskName(String),
    DuplicateTaskName(String),
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTaskName(name) => write!(f, "task name is invalid: {name}"),
            Self::DuplicateTaskName(name) => write!(f, "task name already registered: {name}"),
        }
    }
}

impl Error for RegistryError {}

/// Maps task names to handlers. Built once, then shared read-only by workers.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: BTreeMap<String, TaskHandler>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one handler under a dotted lowercase name.
    pub fn register<F>(&mut self, name: &str, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(&Connection, &Value) -> TaskOutput + Send + Sync + 'static,
    {
        let name = name.trim();
        if !TASK_NAME_RE.is_match(name) {
            return Err(RegistryError::InvalidTaskName(name.to_string()));
        }
        if self.handlers.contains_key(name) {
            return Err(RegistryError::DuplicateTaskName(name.to_string()));
        }
        self.handlers.insert(name.to_string(), Arc::new(handler));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<TaskHandler> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Returns sorted task names.
    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{RegistryError, TaskRegistry};
    use serde_json::json;

    #[test]
    fn register_rejects_invalid_and_duplicate_names() {
        let mut registry = TaskRegistry::new();
        registry
            .register("repository.update", |_, _| Ok(json!(null)))
            .unwrap();

        assert_eq!(
            registry
                .register("repository.update", |_, _| Ok(json!(null)))
                .unwrap_err(),
            RegistryError::DuplicateTaskName("repository.update".to_string())
        );
        assert!(matches!(
            registry.register("Bad Name", |_, _| Ok(json!(null))),
            Err(RegistryError::InvalidTaskName(_))
        ));
        assert_eq!(registry.names(), vec!["repository.update".to_string()]);
    }
}
