//! Configuration
//!
//! Runs are configured from a TOML file:
//!
//! ```toml
//! backup_dir = "/data/backup"
//! snapshot_name = "nightly"
//! retain = 7
//! warning_minutes = 120
//! log_dir = "/var/log/snapvault"
//!
//! [backup_command]
//! program = "/opt/vertica/bin/vbr.py"
//! args = ["--config-file", "/etc/vbr/nightly.ini", "--task", "backup"]
//!
//! [remote]
//! auth_url = "https://objects.example.com/auth/v1.0"
//! user = "backup"
//! key = "secret"
//! ```
//!
//! Missing optional keys take the defaults documented on each field.
//! [`Config::validate`] rejects anything a run cannot start with.

use crate::epoch::SNAPSHOT_PLACEHOLDER;
use crate::error::{Result, VaultError};
use crate::store::remote::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use globset::GlobBuilder;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory the database backup tool writes into
    pub backup_dir: PathBuf,

    /// Name of the backup snapshot, the second level of every object path
    pub snapshot_name: String,

    /// Database node directory under `backup_dir`; discovered when unset
    #[serde(default)]
    pub node_name: Option<String>,

    /// Glob used to discover the node directory (default: `v_*_node*`)
    #[serde(default = "default_node_pattern")]
    pub node_pattern: String,

    /// Number of remote snapshots to retain (default: 7)
    #[serde(default = "default_retain")]
    pub retain: usize,

    /// Runs longer than this report a warning (default: 120)
    #[serde(default = "default_warning_minutes")]
    pub warning_minutes: u64,

    /// Directory for per-command log files; stdout when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// External backup command run before the upload
    #[serde(default)]
    pub backup_command: Option<BackupCommandConfig>,

    /// Epoch files renamed around a snapshot
    #[serde(default)]
    pub epoch: EpochConfig,

    /// Remote object store
    pub remote: RemoteConfig,
}

/// External backup command
#[derive(Debug, Clone, Deserialize)]
pub struct BackupCommandConfig {
    /// Executable to run
    pub program: PathBuf,

    /// Arguments passed to the executable
    #[serde(default)]
    pub args: Vec<String>,

    /// Output line that marks a failed run even on exit status zero
    #[serde(default = "default_failure_sentinel")]
    pub failure_sentinel: String,

    /// Extra environment (default: `LANG=en_US.UTF-8`)
    #[serde(default = "default_command_env")]
    pub env: BTreeMap<String, String>,

    /// Set to false to skip the command and only upload
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Epoch files relative to the synchronised tree
#[derive(Debug, Clone, Deserialize)]
pub struct EpochConfig {
    /// File templates; `{snapshot}` expands to the snapshot name
    #[serde(default = "default_epoch_files")]
    pub files: Vec<String>,
}

impl Default for EpochConfig {
    fn default() -> Self {
        Self {
            files: default_epoch_files(),
        }
    }
}

/// Remote object store connection
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// v1 authentication endpoint
    pub auth_url: String,

    /// Account user
    pub user: String,

    /// Account key
    pub key: String,

    /// Container name; `<domain>_<hostname>` when unset
    ///
    /// Nodes may share a container: each tree keeps its persisted snapshots
    /// beside it under its own node directory.
    #[serde(default)]
    pub container: Option<String>,

    /// Domain part of the container name; taken from the host's FQDN when unset
    #[serde(default)]
    pub domain: Option<String>,

    /// Objects per listing page (default: 10000)
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// HTTP request timeout in seconds (default: 300)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

// Default values
fn default_node_pattern() -> String {
    "v_*_node*".to_string()
}

fn default_retain() -> usize {
    7
}

fn default_warning_minutes() -> u64 {
    120
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_failure_sentinel() -> String {
    "backup failed!".to_string()
}

fn default_command_env() -> BTreeMap<String, String> {
    BTreeMap::from([("LANG".to_string(), "en_US.UTF-8".to_string())])
}

fn default_true() -> bool {
    true
}

fn default_epoch_files() -> Vec<String> {
    vec![
        format!("{}.txt", SNAPSHOT_PLACEHOLDER),
        format!("{}.info", SNAPSHOT_PLACEHOLDER),
        "var/vertica/catalog/*/v_*_catalog/Snapshots/catalog.ctlg".to_string(),
    ]
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_timeout_secs() -> u64 {
    300
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Load and validate a configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every value a run depends on
    pub fn validate(&self) -> Result<()> {
        if self.backup_dir.as_os_str().is_empty() {
            return Err(VaultError::config("backup_dir must not be empty"));
        }
        check_path_segment("snapshot_name", &self.snapshot_name)?;
        if let Some(node) = &self.node_name {
            check_path_segment("node_name", node)?;
        }
        GlobBuilder::new(&self.node_pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| VaultError::config(format!("node_pattern: {}", e)))?;
        if self.retain < 1 {
            return Err(VaultError::config("retain must be at least 1"));
        }
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(VaultError::config(format!(
                "log_level {:?} is not one of {:?}",
                self.log_level, LOG_LEVELS
            )));
        }
        if let Some(command) = &self.backup_command {
            if command.enabled && command.program.as_os_str().is_empty() {
                return Err(VaultError::config("backup_command.program must not be empty"));
            }
        }
        if self.epoch.files.iter().any(|f| f.trim().is_empty() || f.starts_with('/')) {
            return Err(VaultError::config(
                "epoch.files entries must be non-empty paths relative to the snapshot tree",
            ));
        }
        self.remote.validate()
    }

    /// Warning threshold as a duration
    pub fn warning_threshold(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.warning_minutes * 60)
    }

    /// Database node directory name, from config or discovered under `backup_dir`
    ///
    /// Discovery takes the first directory (lexical order) matching
    /// `node_pattern`.
    pub fn resolve_node_name(&self) -> Result<String> {
        if let Some(node) = &self.node_name {
            return Ok(node.clone());
        }

        let matcher = GlobBuilder::new(&self.node_pattern)
            .literal_separator(true)
            .build()?
            .compile_matcher();
        let mut nodes: Vec<String> = fs::read_dir(&self.backup_dir)
            .map_err(|_| VaultError::MissingDirectory(self.backup_dir.clone()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| matcher.is_match(name))
            .collect();
        nodes.sort();

        nodes.into_iter().next().ok_or_else(|| {
            VaultError::config(format!(
                "no directory matching {:?} in {:?}",
                self.node_pattern, self.backup_dir
            ))
        })
    }

    /// Object prefix of a node's tree: `<node>/<snapshot_name>`
    pub fn prefix_for(&self, node: &str) -> String {
        format!("{}/{}", node, self.snapshot_name)
    }

    /// Local directory holding a node's tree
    pub fn tree_dir_for(&self, node: &str) -> PathBuf {
        self.backup_dir.join(node).join(&self.snapshot_name)
    }
}

impl RemoteConfig {
    /// Check connection settings
    pub fn validate(&self) -> Result<()> {
        if self.auth_url.trim().is_empty() {
            return Err(VaultError::config("remote.auth_url must not be empty"));
        }
        if self.user.trim().is_empty() {
            return Err(VaultError::config("remote.user must not be empty"));
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(VaultError::config(format!(
                "remote.page_size must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, self.page_size
            )));
        }
        if self.timeout_secs == 0 {
            return Err(VaultError::config("remote.timeout_secs must be at least 1"));
        }
        Ok(())
    }
}

fn check_path_segment(key: &str, value: &str) -> Result<()> {
    if value.is_empty() || value == "." || value == ".." || value.contains('/') {
        return Err(VaultError::config(format!(
            "{} must be a single non-empty path segment, got {:?}",
            key, value
        )));
    }
    Ok(())
}
