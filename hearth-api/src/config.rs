//! # Configuration Lookup
//!
//! Configuration is consumed as a tree of `/`-separated paths mapping to
//! string values. The daemon imposes no grammar: anything that can answer
//! [`Config::value`] and [`Config::subkeys`] can drive it. Typed accessors
//! are provided on top of those two methods.
//!
//! [`MemoryConfig`] is an ordered in-memory implementation, useful for
//! embedding and tests.

use std::fmt;

use crate::errors::ConfigError;

/// Path-addressed configuration source.
pub trait Config: Send + Sync + fmt::Debug {
    /// Raw value stored at `path`.
    fn value(&self, path: &str) -> Option<String>;

    /// Names of the direct children of `path`, in declaration order.
    fn subkeys(&self, path: &str) -> Vec<String>;

    fn has(&self, path: &str) -> bool {
        self.value(path).is_some()
    }

    fn as_string(&self, path: &str) -> Result<String, ConfigError> {
        self.value(path)
            .ok_or_else(|| ConfigError::Missing(path.to_string()))
    }

    fn as_string_or(&self, path: &str, default: &str) -> String {
        self.value(path).unwrap_or_else(|| default.to_string())
    }

    fn as_int(&self, path: &str) -> Result<i64, ConfigError> {
        let value = self.as_string(path)?;
        value.trim().parse::<i64>().map_err(|_| ConfigError::Invalid {
            path: path.to_string(),
            value,
            expected: "integer",
        })
    }

    /// A missing value yields `default`; a malformed one is still an error.
    fn as_int_or(&self, path: &str, default: i64) -> Result<i64, ConfigError> {
        match self.as_int(path) {
            Err(ConfigError::Missing(_)) => Ok(default),
            other => other,
        }
    }

    /// Accepts `yes/no`, `true/false`, `on/off` and `1/0`, ignoring case.
    fn as_bool_or(&self, path: &str, default: bool) -> Result<bool, ConfigError> {
        let Some(value) = self.value(path) else {
            return Ok(default);
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "yes" | "true" | "on" | "1" => Ok(true),
            "no" | "false" | "off" | "0" => Ok(false),
            _ => Err(ConfigError::Invalid {
                path: path.to_string(),
                value,
                expected: "boolean",
            }),
        }
    }
}

/// Strip leading and trailing separators so `"/a/b/"` and `"a/b"` agree.
fn normalize(path: &str) -> &str {
    path.trim_matches('/')
}

/// In-memory configuration that keeps keys in insertion order.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfig {
    entries: Vec<(String, String)>,
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, path: &str, value: impl Into<String>) -> Self {
        self.set(path, value);
        self
    }

    /// Insert or replace a value. A replaced key keeps its original position.
    pub fn set(&mut self, path: &str, value: impl Into<String>) {
        let path = normalize(path);
        let value = value.into();
        match self.entries.iter_mut().find(|(key, _)| key == path) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((path.to_string(), value)),
        }
    }

    pub fn remove(&mut self, path: &str) -> Option<String> {
        let path = normalize(path);
        let index = self.entries.iter().position(|(key, _)| key == path)?;
        Some(self.entries.remove(index).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Config for MemoryConfig {
    fn value(&self, path: &str) -> Option<String> {
        let path = normalize(path);
        self.entries
            .iter()
            .find(|(key, _)| key == path)
            .map(|(_, value)| value.clone())
    }

    fn subkeys(&self, path: &str) -> Vec<String> {
        let path = normalize(path);
        let mut children: Vec<String> = Vec::new();
        for (key, _) in &self.entries {
            let rest = if path.is_empty() {
                key.as_str()
            } else {
                match key.strip_prefix(path).and_then(|rest| rest.strip_prefix('/')) {
                    Some(rest) => rest,
                    None => continue,
                }
            };
            let child = rest.split('/').next().unwrap_or_default();
            if !child.is_empty() && !children.iter().any(|c| c == child) {
                children.push(child.to_string());
            }
        }
        children
    }
}
