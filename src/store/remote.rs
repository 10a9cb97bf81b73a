//! Remote object store backend
//!
//! [`RemoteStore`] implements [`ObjectStore`] on top of a container in a
//! remote object store. The wire protocol is hidden behind the small
//! [`RemoteClient`] transport trait so the store logic (retry policy,
//! pagination, scoped handles) is independent of any particular HTTP API.
//!
//! ## Retry policy
//!
//! Uploads and metadata listing pages are wrapped in a single
//! reconnect-and-retry: a [`VaultError::Transient`] failure triggers one
//! [`RemoteClient::reconnect`] followed by one more attempt. A second failure
//! propagates. Nothing else is retried.
//!
//! ## Pagination
//!
//! Listings are fetched page by page using the last object name seen as the
//! marker for the next page. A full page means more may follow; a partial
//! page ends the listing.

use crate::error::{Result, VaultError};
use crate::store::{ObjectStore, OpenMode, StoreFile};
use crate::types::{Entries, FileFingerprint};
use crate::utils;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Instant;
use tempfile::NamedTempFile;
use tracing::{debug, info, trace, warn};

/// Largest listing page the object-store API returns
pub const MAX_PAGE_SIZE: usize = 10_000;

/// Default number of objects requested per listing page
pub const DEFAULT_PAGE_SIZE: usize = MAX_PAGE_SIZE;

/// Content type the backend reports for pseudo-directory marker objects
pub const DIRECTORY_CONTENT_TYPE: &str = "application/directory";

const LAST_MODIFIED_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Parameters of one listing request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    /// Only return names starting with this prefix
    pub prefix: Option<String>,
    /// Collapse names below this delimiter into one pseudo-directory entry
    pub delimiter: Option<char>,
    /// Only return names sorting strictly after this one
    pub marker: Option<String>,
    /// Maximum number of entries in the page
    pub limit: usize,
}

/// One entry of a listing page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListedObject {
    /// Object name relative to the container
    pub name: String,
    /// Size in bytes
    pub bytes: u64,
    /// Content hash reported by the backend
    pub hash: String,
    /// Last-modified timestamp as reported by the backend
    pub last_modified: String,
    /// Backend content type
    pub content_type: String,
}

impl ListedObject {
    /// Whether this entry is a pseudo-directory marker rather than a file
    pub fn is_directory_marker(&self) -> bool {
        self.content_type == DIRECTORY_CONTENT_TYPE
    }

    /// Parse the last-modified timestamp; the backend reports UTC without offset
    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(&self.last_modified, LAST_MODIFIED_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }
}

/// Transport operations a remote backend must provide
///
/// Implementations map backend failures onto the crate's error taxonomy:
/// absent objects are [`VaultError::NotFound`], retryable network or
/// authentication hiccups are [`VaultError::Transient`], anything else is
/// [`VaultError::Store`].
pub trait RemoteClient: Send + Sync {
    /// Drop the current session and authenticate again
    fn reconnect(&self) -> Result<()>;

    /// Fetch one listing page
    fn list(&self, query: &ListQuery) -> Result<Vec<ListedObject>>;

    /// Stream an object's content into `sink`, returning the bytes written
    fn get(&self, name: &str, sink: &mut dyn Write) -> Result<u64>;

    /// Store the content of a local file under `name`, returning the bytes sent
    fn put(&self, name: &str, source: &Path) -> Result<u64>;

    /// Remove an object
    fn delete(&self, name: &str) -> Result<()>;
}

/// Object store backed by a remote container
#[derive(Debug)]
pub struct RemoteStore<C: RemoteClient> {
    client: C,
    prefix: String,
    page_size: usize,
}

impl<C: RemoteClient> RemoteStore<C> {
    /// Create a store whose synchronised tree lives under `prefix`
    pub fn new(client: C, prefix: &str) -> Result<Self> {
        let prefix = if prefix.trim_matches('/').is_empty() {
            String::new()
        } else {
            utils::normalize_relative(prefix)?
        };

        Ok(Self {
            client,
            prefix,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// Override the listing page size, clamped to `1..=MAX_PAGE_SIZE`
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    /// Underlying transport
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Run `op`, reconnecting and retrying exactly once on a transient error
    fn retry_once<T>(&self, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        match op() {
            Err(e) if e.is_transient() => {
                warn!("{} failed, reconnecting and retrying once: {}", what, e);
                self.client.reconnect()?;
                op()
            }
            result => result,
        }
    }

    /// Fetch every page of a listing
    fn list_all(&self, prefix: Option<String>, delimiter: Option<char>) -> Result<Vec<ListedObject>> {
        let mut objects = Vec::new();
        let mut query = ListQuery {
            prefix,
            delimiter,
            marker: None,
            limit: self.page_size,
        };

        loop {
            let page = self.retry_once("Listing page", || self.client.list(&query))?;
            let full_page = page.len() >= self.page_size;
            trace!("Listing page returned {} entries", page.len());

            query.marker = page.last().map(|last| last.name.clone());
            objects.extend(page);
            if !full_page || query.marker.is_none() {
                break;
            }
        }

        Ok(objects)
    }
}

impl<C: RemoteClient> ObjectStore for RemoteStore<C> {
    fn kind(&self) -> &'static str {
        "remote"
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn delete(&self, path: &str) -> Result<()> {
        let key = utils::normalize_relative(path)?;
        match self.client.delete(&key) {
            Ok(()) => {
                trace!("Deleted remote object {}", key);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn upload(&self, relative_path: &str, base_dir: &Path) -> Result<u64> {
        let key = utils::normalize_relative(relative_path)?;
        let source = base_dir.join(&key);
        // Surface a missing local file as a local I/O error before any network call
        fs::metadata(&source)?;

        let bytes = self.retry_once("Upload", || self.client.put(&key, &source))?;
        trace!("Uploaded {} ({} bytes)", key, bytes);
        Ok(bytes)
    }

    fn download(&self, relative_path: &str, dest_dir: &Path) -> Result<u64> {
        let key = utils::normalize_relative(relative_path)?;
        let dest = dest_dir.join(&key);
        let parent = dest.parent().unwrap_or(dest_dir);
        fs::create_dir_all(parent)?;

        // Stage next to the destination so a failed transfer never leaves a partial file
        let mut staged = NamedTempFile::new_in(parent)?;
        let bytes = self.client.get(&key, staged.as_file_mut())?;
        staged.as_file_mut().flush()?;
        staged.persist(&dest).map_err(|e| VaultError::Io(e.error))?;

        trace!("Downloaded {} ({} bytes)", key, bytes);
        Ok(bytes)
    }

    fn collect_fingerprints(&self) -> Result<Entries> {
        let start = Instant::now();
        let prefix = if self.prefix.is_empty() {
            None
        } else {
            Some(format!("{}/", self.prefix))
        };

        let mut entries = Entries::new();
        let mut markers = 0usize;
        for object in self.list_all(prefix, None)? {
            if object.is_directory_marker() {
                markers += 1;
                continue;
            }
            let mtime = object.modified_at().unwrap_or_else(|| {
                warn!(
                    "Unparseable last-modified {:?} for {}",
                    object.last_modified, object.name
                );
                DateTime::<Utc>::default()
            });
            let fingerprint = FileFingerprint::new(object.name.clone(), object.bytes, mtime, object.hash);
            entries.insert(object.name, fingerprint);
        }

        info!(
            "Listed {} remote objects under {:?} ({} directory markers skipped) in {}",
            entries.len(),
            self.prefix,
            markers,
            utils::format_elapsed(start.elapsed())
        );
        Ok(entries)
    }

    fn list_dir(&self, dir: &str) -> Result<Vec<String>> {
        let prefix = match dir {
            "" => None,
            dir => Some(format!("{}/", utils::normalize_relative(dir)?)),
        };
        let strip = prefix.as_deref().unwrap_or("");
        Ok(self
            .list_all(prefix.clone(), Some('/'))?
            .into_iter()
            .filter_map(|object| object.name.strip_prefix(strip).map(str::to_string))
            .collect())
    }

    fn open(&self, path: &str, mode: OpenMode) -> Result<StoreFile<'_>> {
        let key = utils::normalize_relative(path)?;
        let mut staged = NamedTempFile::new()?;

        if mode.needs_existing() {
            match self.client.get(&key, staged.as_file_mut()) {
                Ok(bytes) => debug!("Fetched {} ({} bytes) into a temporary copy", key, bytes),
                Err(e) if e.is_not_found() && mode == OpenMode::Append => {}
                Err(e) => return Err(e),
            }
            staged.as_file_mut().flush()?;
        }

        let (staged_file, temp) = staged.into_parts();
        drop(staged_file);
        let file = mode.open(&temp)?;

        if !mode.is_writable() {
            return Ok(StoreFile::temporary(key, file, temp, None));
        }

        let name = key.clone();
        let hook: crate::store::CloseHook<'_> = Box::new(move |local: &Path| {
            let bytes = self.retry_once("Upload", || self.client.put(&name, local))?;
            debug!("Published {} ({} bytes)", name, bytes);
            Ok(())
        });
        Ok(StoreFile::temporary(key, file, temp, Some(hook)))
    }
}
