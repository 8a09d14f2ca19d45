//! # Configuration Error Types
//!
//! Errors raised while reading values out of a [`Config`](crate::Config).
//! Missing keys and malformed values are reported separately so callers can
//! fall back to defaults for the former and abort on the latter.

use thiserror::Error;

/// Error produced by typed configuration lookups.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The requested path has no value.
    #[error("Configuration value is missing: {0}")]
    Missing(String),

    /// The value exists but cannot be read as the requested type.
    #[error("Invalid configuration value at {path}: '{value}' is not a valid {expected}")]
    Invalid {
        path: String,
        value: String,
        expected: &'static str,
    },
}
