//! External backup command
//!
//! Before a backup upload the database's own backup tool is run to write a
//! fresh on-disk backup into the tree. The tool does not always report
//! failure through its exit status, so besides a non-zero status any output
//! line equal to the configured sentinel also counts as failure.

use crate::config::BackupCommandConfig;
use crate::error::{Result, VaultError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Instant;
use tracing::{debug, info};

/// A configured external backup command
#[derive(Debug, Clone)]
pub struct BackupCommand {
    program: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    failure_sentinel: String,
}

impl BackupCommand {
    /// Create a command with no extra environment and the default sentinel
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: BTreeMap::new(),
            failure_sentinel: "backup failed!".to_string(),
        }
    }

    /// Build from configuration
    pub fn from_config(config: &BackupCommandConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            failure_sentinel: config.failure_sentinel.clone(),
        }
    }

    /// Set an environment variable for the child
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Replace the failure sentinel line
    pub fn failure_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.failure_sentinel = sentinel.into();
        self
    }

    /// Run to completion, returning the combined output on success
    ///
    /// Fails with [`VaultError::CommandFailed`] on a non-zero exit status or
    /// when the sentinel line appears. A program that cannot be started is
    /// an [`VaultError::Io`] error.
    pub fn run(&self) -> Result<String> {
        info!("Running backup command: {:?} {:?}", self.program, self.args);
        let start = Instant::now();

        let output = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .output()?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        if !combined.is_empty() && !combined.ends_with('\n') && !output.stderr.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        debug!("Backup command finished in {:?} with {}", start.elapsed(), output.status);

        if !output.status.success() {
            return Err(VaultError::CommandFailed {
                status: output.status.code(),
                output: combined,
            });
        }
        if combined.lines().any(|line| line == self.failure_sentinel) {
            return Err(VaultError::CommandFailed {
                status: None,
                output: combined,
            });
        }

        Ok(combined)
    }
}
