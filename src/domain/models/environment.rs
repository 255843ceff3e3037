//! Execution environments and the in-process environment registry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A named execution environment a worker can be launched into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEnvironment {
    /// Unique environment id (referenced by task submissions).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Worker command (binary or image reference, runtime-dependent).
    pub command: String,
    /// Arguments passed to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the worker.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the worker, if any.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Per-environment execution timeout in milliseconds.
    pub timeout_ms: u64,
}

impl ExecutionEnvironment {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            timeout_ms: 300_000,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// In-process registry of execution environments.
///
/// Built once at wiring time; lookups are by environment id.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentRegistry {
    environments: HashMap<String, ExecutionEnvironment>,
}

impl EnvironmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an environment, replacing any previous one with the same id.
    pub fn register(&mut self, env: ExecutionEnvironment) {
        self.environments.insert(env.id.clone(), env);
    }

    /// Look up an environment by id.
    pub fn get(&self, id: &str) -> Option<&ExecutionEnvironment> {
        self.environments.get(id)
    }

    /// List registered environment ids.
    pub fn ids(&self) -> Vec<String> {
        self.environments.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.environments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_get() {
        let mut registry = EnvironmentRegistry::new();
        registry.register(ExecutionEnvironment::new("default", "/bin/sh"));

        assert!(registry.get("default").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = EnvironmentRegistry::new();
        registry.register(ExecutionEnvironment::new("default", "/bin/sh"));
        registry.register(ExecutionEnvironment::new("default", "/bin/bash").with_timeout_ms(1000));

        let env = registry.get("default").unwrap();
        assert_eq!(env.command, "/bin/bash");
        assert_eq!(env.timeout_ms, 1000);
        assert_eq!(registry.len(), 1);
    }
}
