//! Error types for the snapvault library
//!
//! This module defines all error types that can occur while scanning trees,
//! talking to object stores and driving backup or restore runs. The variants
//! follow the recovery policy of the sync engine:
//!
//! - [`VaultError::NotFound`] is recoverable: read paths treat it as "absent"
//! - [`VaultError::Transient`] is retried exactly once after a reconnect
//! - everything else is fatal to the operation that raised it

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the snapvault library
pub type Result<T> = std::result::Result<T, VaultError>;

/// Main error type for all snapvault operations
#[derive(Debug, Error)]
pub enum VaultError {
    /// I/O errors during local file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors while parsing a configuration file
    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Object absent from the store
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Network or authentication hiccup talking to the remote backend
    #[error("Transient backend error: {0}")]
    Transient(String),

    /// Non-retryable backend failure
    #[error("Store error: {0}")]
    Store(String),

    /// Relative path escapes the store namespace or is malformed
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Persisted snapshot cannot be decoded or violates its invariants
    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Glob pattern could not be compiled
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// No persisted snapshot matches the request
    #[error("No snapshot found: {0}")]
    NoSnapshot(String),

    /// External backup command failed
    #[error("Command failed with status {status:?}")]
    CommandFailed {
        /// Exit status, `None` when killed by a signal or failure sentinel
        status: Option<i32>,
        /// Combined stdout/stderr of the command
        output: String,
    },

    /// Local directory expected to exist is missing
    #[error("Directory not found: {0:?}")]
    MissingDirectory(PathBuf),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<globset::Error> for VaultError {
    fn from(err: globset::Error) -> Self {
        VaultError::InvalidPattern(err.to_string())
    }
}

impl From<reqwest::Error> for VaultError {
    /// Connection-level failures are worth a reconnect; malformed requests
    /// and undecodable responses are not.
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            VaultError::Transient(err.to_string())
        } else {
            VaultError::Store(err.to_string())
        }
    }
}

impl VaultError {
    /// Create a store error with a custom message
    pub fn store(msg: impl Into<String>) -> Self {
        VaultError::Store(msg.into())
    }

    /// Create a transient backend error with a custom message
    pub fn transient(msg: impl Into<String>) -> Self {
        VaultError::Transient(msg.into())
    }

    /// Create a configuration error with a custom message
    pub fn config(msg: impl Into<String>) -> Self {
        VaultError::InvalidConfiguration(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        VaultError::Internal(msg.into())
    }

    /// Check if this error should trigger a reconnect-and-retry
    pub fn is_transient(&self) -> bool {
        matches!(self, VaultError::Transient(_))
    }

    /// Check if this error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            VaultError::NotFound(_) => true,
            VaultError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            VaultError::NoSnapshot(what) => {
                format!("No snapshot found for {}. Use 'snapvault list --remote' to see available snapshots.", what)
            }
            VaultError::InvalidConfiguration(msg) => {
                format!("Configuration problem: {}. Check the config file and try again.", msg)
            }
            VaultError::CommandFailed { status, output } => {
                format!("Backup command failed (status {:?})\n{}", status, output)
            }
            VaultError::Transient(msg) => {
                format!("Object store unreachable after retry: {}", msg)
            }
            _ => self.to_string(),
        }
    }
}
