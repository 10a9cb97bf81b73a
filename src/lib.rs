//! # Snapvault - incremental snapshot backup to object stores
//!
//! Content-addressed backup and restore of a large directory tree (typically
//! a database's on-disk backup) against a remote object store, using
//! persisted snapshot metadata to avoid redundant transfers and to reconcile
//! local and remote state.
//!
//! ## Overview
//!
//! Snapvault keeps a tree in a local directory and a remote container in
//! sync at the file level:
//! - Every file is identified by its path, size and content hash
//! - A run compares two snapshots and transfers only what differs
//! - A persisted snapshot marks every completed run
//! - Retention keeps the content of the N newest snapshots and deletes the rest
//!
//! ## Architecture
//!
//! - **Object stores**: the [`ObjectStore`] trait hides whether a tree lives
//!   on a local filesystem ([`FsStore`]) or in a remote container
//!   ([`RemoteStore`] over a [`RemoteClient`] transport such as
//!   [`SwiftClient`])
//! - **Snapshots**: [`SnapshotMetadata`] maps relative paths to
//!   [`FileFingerprint`]s, diffs against another snapshot, and persists as
//!   `YYYY_MM_DD_HHMM.snapshot`
//! - **Drivers**: [`BackupDriver`] and [`RestoreDriver`] run the two flows
//!   end to end, including epoch file relocation and snapshot pruning
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use snapvault::{BackupDriver, FsStore};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let local = FsStore::new("/data/backup", "v_db_node0001/nightly")?;
//! let target = FsStore::new("/mnt/offsite", "v_db_node0001/nightly")?;
//!
//! let report = BackupDriver::new(&local, &target).retain(7).run()?;
//! println!(
//!     "Uploaded {} files ({} bytes) as {}",
//!     report.files_uploaded, report.bytes_uploaded, report.snapshot_name
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ### Restoring a given day
//!
//! ```rust,no_run
//! use snapvault::{FsStore, RestoreDriver, Selection};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let local = FsStore::new("/data/restore", "v_db_node0001/nightly")?;
//! let source = FsStore::new("/mnt/offsite", "v_db_node0001/nightly")?;
//!
//! let report = RestoreDriver::new(&local, &source).run(Selection::Day("2024_03_01"))?;
//! println!("Restored {}", report.snapshot_name);
//! # Ok(())
//! # }
//! ```
//!
//! ## Failure model
//!
//! - Per-file errors while scanning a local tree are logged and the file is
//!   left out of the snapshot
//! - Transfer and delete errors abort the run
//! - Transient remote errors are retried once after reconnecting, for
//!   uploads and listing pages only
//! - The remote snapshot is written last, so its presence proves the run
//!   completed
//!
//! ## Module Organization
//!
//! - [`store`]: object store trait, scoped handles and the backends
//! - [`snapshot`]: snapshot metadata, diff, persistence and retention
//! - [`backup`] / [`restore`]: the two run drivers
//! - [`epoch`]: epoch file relocation
//! - [`command`]: external backup command runner
//! - [`config`]: TOML configuration
//! - [`types`]: common types and data structures
//! - [`utils`]: hashing, path and formatting helpers
//! - [`error`]: error types and handling

// Public API modules
pub mod backup;
pub mod command;
pub mod config;
pub mod epoch;
pub mod error;
pub mod restore;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use backup::BackupDriver;
pub use command::BackupCommand;
pub use config::Config;
pub use epoch::{EpochFiles, EpochLayout};
pub use error::{Result, VaultError};
pub use restore::{select_snapshot, RestoreDriver, Selection, SnapshotSelector};
pub use snapshot::{prune_snapshots, RetentionPlan, SnapshotMetadata};
pub use store::{FsStore, ObjectStore, OpenMode, RemoteClient, RemoteStore, StoreFile, SwiftClient};
pub use types::*;
