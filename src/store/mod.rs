//! Object store abstraction
//!
//! Backups and persisted snapshots live in an [`ObjectStore`]. The sync
//! engine only ever talks to this trait, so a local filesystem tree and a
//! remote object store are interchangeable as either source or target.
//!
//! ## Backends
//!
//! - [`fs::FsStore`]: a directory on a locally mounted filesystem
//! - [`remote::RemoteStore`]: an object-store container reached through a
//!   [`remote::RemoteClient`] transport such as [`swift::SwiftClient`]
//!
//! ## Namespaces
//!
//! Every store has a root (the base of its namespace) and a prefix under the
//! root that holds the tree being synchronised. Object paths are always
//! relative to the root and never escape it. Persisted snapshot files live
//! next to the tree in `<prefix>.snapshots/`, so trees sharing a root (one
//! per node in a shared container) never see each other's snapshots. A
//! store with an empty prefix keeps them in the root.
//!
//! ## Scoped handles
//!
//! [`ObjectStore::open`] returns a [`StoreFile`]. For the local backend it
//! wraps the file itself; for the remote backend it wraps a private
//! temporary copy that is uploaded back when a writable handle is closed.
//! The temporary file is removed on every exit path, including early
//! returns and panics, because cleanup happens in `Drop`.

pub mod fs;
pub mod remote;
pub mod swift;

use crate::error::{Result, VaultError};
use crate::types::Entries;
use globset::{Glob, GlobMatcher};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::OnceLock;
use tempfile::TempPath;
use tracing::warn;

pub use fs::FsStore;
pub use remote::{RemoteClient, RemoteStore};
pub use swift::SwiftClient;

/// Extension of persisted snapshot files
pub const SNAPSHOT_EXTENSION: &str = "snapshot";

/// How a [`StoreFile`] is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read existing content
    Read,
    /// Create or truncate, then write
    Write,
    /// Keep existing content (if any) and append
    Append,
}

impl OpenMode {
    /// Whether closing the handle must publish its content
    pub fn is_writable(&self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::Append)
    }

    /// Whether existing content is needed before use
    pub fn needs_existing(&self) -> bool {
        matches!(self, OpenMode::Read | OpenMode::Append)
    }

    fn open_options(&self) -> std::fs::OpenOptions {
        let mut options = std::fs::OpenOptions::new();
        match self {
            OpenMode::Read => options.read(true),
            OpenMode::Write => options.write(true).create(true).truncate(true),
            OpenMode::Append => options.append(true).create(true),
        };
        options
    }

    /// Open a local path in this mode
    pub fn open(&self, path: &Path) -> io::Result<File> {
        self.open_options().open(path)
    }
}

/// Capability set every storage backend implements
pub trait ObjectStore: Send + Sync {
    /// Short backend name used in log messages
    fn kind(&self) -> &'static str;

    /// Prefix under the root holding the synchronised tree
    fn prefix(&self) -> &str;

    /// Remove an object; succeeds silently if it does not exist
    fn delete(&self, path: &str) -> Result<()>;

    /// Copy `base_dir/relative_path` into the store at `relative_path`
    ///
    /// Returns the number of bytes transferred.
    fn upload(&self, relative_path: &str, base_dir: &Path) -> Result<u64>;

    /// Copy the object at `relative_path` to `dest_dir/relative_path`
    ///
    /// Parent directories are created as needed. Returns the number of
    /// bytes transferred, or [`VaultError::NotFound`](crate::VaultError::NotFound)
    /// when the object is absent.
    fn download(&self, relative_path: &str, dest_dir: &Path) -> Result<u64>;

    /// Fingerprint every object under the store's prefix
    fn collect_fingerprints(&self) -> Result<Entries>;

    /// Names of the objects directly under `dir`, or the root when empty
    fn list_dir(&self, dir: &str) -> Result<Vec<String>>;

    /// Open an object as a scoped handle
    fn open(&self, path: &str, mode: OpenMode) -> Result<StoreFile<'_>>;

    /// Directory holding this tree's persisted snapshots
    fn snapshot_dir(&self) -> String {
        match self.prefix() {
            "" => String::new(),
            prefix => format!("{}.{}s", prefix, SNAPSHOT_EXTENSION),
        }
    }

    /// Object path of the persisted snapshot `name`
    fn snapshot_path(&self, name: &str) -> String {
        match self.snapshot_dir().as_str() {
            "" => name.to_string(),
            dir => format!("{}/{}", dir, name),
        }
    }

    /// Persisted snapshot file names, newest first
    ///
    /// Snapshot names are fixed-width and zero-padded, so reverse lexical
    /// order is reverse chronological order.
    fn list_snapshot_files(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .list_dir(&self.snapshot_dir())?
            .into_iter()
            .filter(|name| is_snapshot_file(name))
            .collect();
        names.sort_unstable_by(|a, b| b.cmp(a));
        Ok(names)
    }
}

/// Whether an object name within a snapshot directory is a persisted snapshot
pub fn is_snapshot_file(name: &str) -> bool {
    static MATCHER: OnceLock<Option<GlobMatcher>> = OnceLock::new();
    MATCHER
        .get_or_init(|| {
            Glob::new(&format!("*.{}", SNAPSHOT_EXTENSION))
                .ok()
                .map(|glob| glob.compile_matcher())
        })
        .as_ref()
        .map(|matcher| !name.contains('/') && matcher.is_match(name))
        .unwrap_or(false)
}

/// Callback run with the temporary file's path when a writable handle closes
pub type CloseHook<'a> = Box<dyn FnOnce(&Path) -> Result<()> + Send + 'a>;

/// Scoped handle returned by [`ObjectStore::open`]
///
/// Call [`StoreFile::close`] to observe errors from publishing the content.
/// A handle dropped without `close` still runs its close hook (errors are
/// logged) and always deletes its temporary file.
pub struct StoreFile<'a> {
    name: String,
    file: File,
    temp: Option<TempPath>,
    on_close: Option<CloseHook<'a>>,
}

impl<'a> StoreFile<'a> {
    /// Handle over a file owned by the store itself
    pub fn direct(name: impl Into<String>, file: File) -> Self {
        Self {
            name: name.into(),
            file,
            temp: None,
            on_close: None,
        }
    }

    /// Handle over a private temporary copy
    pub fn temporary(
        name: impl Into<String>,
        file: File,
        temp: TempPath,
        on_close: Option<CloseHook<'a>>,
    ) -> Self {
        Self {
            name: name.into(),
            file,
            temp: Some(temp),
            on_close,
        }
    }

    /// Object name this handle refers to
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Flush, publish the content if writable, and release the handle
    pub fn close(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        let hook = self.on_close.take();
        let temp = self.temp.take();

        let result = self.file.flush().map_err(VaultError::from).and_then(|()| {
            match (hook, temp.as_deref()) {
                (Some(hook), Some(path)) => hook(path),
                _ => Ok(()),
            }
        });

        if let Some(temp) = temp {
            if let Err(e) = temp.close() {
                warn!("Failed to remove temporary file for {}: {}", self.name, e);
            }
        }
        result
    }
}

impl Drop for StoreFile<'_> {
    fn drop(&mut self) {
        if self.on_close.is_some() || self.temp.is_some() {
            if let Err(e) = self.finish() {
                warn!("Closing {} failed: {}", self.name, e);
            }
        }
    }
}

impl std::fmt::Debug for StoreFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreFile")
            .field("name", &self.name)
            .field("temporary", &self.temp.is_some())
            .field("publish_on_close", &self.on_close.is_some())
            .finish()
    }
}

impl Read for StoreFile<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for StoreFile<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for StoreFile<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}
