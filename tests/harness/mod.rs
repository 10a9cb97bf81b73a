//! Shared fixtures for the snapvault test suites
//!
//! [`MemoryClient`] is an in-memory [`RemoteClient`] that behaves like a
//! container listing (sorted names, markers, prefixes, delimiters) and can
//! be told to fail in the ways a real backend does.

use ::snapvault::store::remote::{ListQuery, ListedObject, DIRECTORY_CONTENT_TYPE};
use ::snapvault::*;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Object prefix used by every suite
pub const PREFIX: &str = "v_db_node0001/nightly";

/// Capture time on a given day of March 2024
pub fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, 1, 30, 0).unwrap()
}

/// Write a file inside the synchronised tree under `root`
pub fn write_tree_file(root: &Path, rel: &str, content: &[u8]) {
    let path = root.join(PREFIX).join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// Remove a file from the synchronised tree under `root`
pub fn remove_tree_file(root: &Path, rel: &str) {
    fs::remove_file(root.join(PREFIX).join(rel)).unwrap();
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    content_type: String,
}

/// Kinds of injected failure
#[derive(Debug, Default)]
struct Faults {
    transient_puts: usize,
    transient_lists: usize,
    transient_gets: usize,
    /// Puts of names containing this fragment fail permanently
    reject_put: Option<String>,
}

/// In-memory container with failure injection
#[derive(Debug, Default)]
pub struct MemoryClient {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    faults: Mutex<Faults>,
    pub list_calls: Mutex<usize>,
    pub put_calls: Mutex<usize>,
    pub reconnects: Mutex<usize>,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object directly, bypassing the failure injection
    pub fn insert(&self, name: &str, content: &[u8]) {
        self.objects.lock().insert(
            name.to_string(),
            StoredObject {
                data: content.to_vec(),
                content_type: "application/octet-stream".to_string(),
            },
        );
    }

    /// Store a pseudo-directory marker
    pub fn insert_marker(&self, name: &str) {
        self.objects.lock().insert(
            name.to_string(),
            StoredObject {
                data: Vec::new(),
                content_type: DIRECTORY_CONTENT_TYPE.to_string(),
            },
        );
    }

    pub fn content(&self, name: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(name).map(|o| o.data.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.objects.lock().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    /// Fail the next `n` puts with a transient error
    pub fn fail_puts(&self, n: usize) {
        self.faults.lock().transient_puts = n;
    }

    /// Fail the next `n` listing pages with a transient error
    pub fn fail_lists(&self, n: usize) {
        self.faults.lock().transient_lists = n;
    }

    /// Fail the next `n` gets with a transient error
    pub fn fail_gets(&self, n: usize) {
        self.faults.lock().transient_gets = n;
    }

    /// Reject every put whose name contains `fragment`
    pub fn reject_puts_of(&self, fragment: &str) {
        self.faults.lock().reject_put = Some(fragment.to_string());
    }

    /// Stop injecting failures
    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    fn take(counter: &mut usize) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

impl RemoteClient for MemoryClient {
    fn reconnect(&self) -> Result<()> {
        *self.reconnects.lock() += 1;
        Ok(())
    }

    fn list(&self, query: &ListQuery) -> Result<Vec<ListedObject>> {
        *self.list_calls.lock() += 1;
        if Self::take(&mut self.faults.lock().transient_lists) {
            return Err(VaultError::transient("listing timed out"));
        }

        let objects = self.objects.lock();
        let mut page: Vec<ListedObject> = Vec::new();
        for (name, object) in objects.iter() {
            if query.marker.as_ref().is_some_and(|marker| name <= marker) {
                continue;
            }
            let rest = match &query.prefix {
                Some(prefix) => match name.strip_prefix(prefix.as_str()) {
                    Some(rest) => rest,
                    None => continue,
                },
                None => name.as_str(),
            };
            let entry = match query.delimiter.and_then(|d| rest.find(d)) {
                Some(idx) => ListedObject {
                    name: name[..name.len() - rest.len() + idx + 1].to_string(),
                    content_type: DIRECTORY_CONTENT_TYPE.to_string(),
                    ..ListedObject::default()
                },
                None => ListedObject {
                    name: name.clone(),
                    bytes: object.data.len() as u64,
                    hash: utils::hash_data(&object.data),
                    last_modified: "2024-03-01T02:30:00.123456".to_string(),
                    content_type: object.content_type.clone(),
                },
            };
            if page.last().is_some_and(|last| last.name == entry.name) {
                continue;
            }
            page.push(entry);
            if page.len() == query.limit {
                break;
            }
        }
        Ok(page)
    }

    fn get(&self, name: &str, sink: &mut dyn Write) -> Result<u64> {
        if Self::take(&mut self.faults.lock().transient_gets) {
            return Err(VaultError::transient("read timed out"));
        }
        let data = self
            .content(name)
            .ok_or_else(|| VaultError::NotFound(name.to_string()))?;
        sink.write_all(&data)?;
        Ok(data.len() as u64)
    }

    fn put(&self, name: &str, source: &Path) -> Result<u64> {
        *self.put_calls.lock() += 1;
        {
            let mut faults = self.faults.lock();
            if Self::take(&mut faults.transient_puts) {
                return Err(VaultError::transient("connection reset"));
            }
            if faults.reject_put.as_ref().is_some_and(|f| name.contains(f.as_str())) {
                return Err(VaultError::store(format!("quota exceeded writing {}", name)));
            }
        }
        let data = fs::read(source)?;
        let len = data.len() as u64;
        self.insert(name, &data);
        Ok(len)
    }

    fn delete(&self, name: &str) -> Result<()> {
        match self.objects.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(VaultError::NotFound(name.to_string())),
        }
    }
}

/// One [`MemoryClient`] handed to several stores, as when nodes share a container
#[derive(Debug, Clone, Default)]
pub struct SharedClient(pub Arc<MemoryClient>);

impl RemoteClient for SharedClient {
    fn reconnect(&self) -> Result<()> {
        self.0.reconnect()
    }

    fn list(&self, query: &ListQuery) -> Result<Vec<ListedObject>> {
        self.0.list(query)
    }

    fn get(&self, name: &str, sink: &mut dyn Write) -> Result<u64> {
        self.0.get(name, sink)
    }

    fn put(&self, name: &str, source: &Path) -> Result<u64> {
        self.0.put(name, source)
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.0.delete(name)
    }
}

/// A local tree, a restore target and an in-memory remote container
pub struct VaultHarness {
    pub source: TempDir,
    pub target: TempDir,
    pub local: FsStore,
    pub restore_target: FsStore,
    pub remote: RemoteStore<MemoryClient>,
}

impl VaultHarness {
    pub fn new() -> Self {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let local = FsStore::new(source.path(), PREFIX).unwrap();
        let restore_target = FsStore::new(target.path(), PREFIX).unwrap();
        let remote = RemoteStore::new(MemoryClient::new(), PREFIX).unwrap();
        Self {
            source,
            target,
            local,
            restore_target,
            remote,
        }
    }

    pub fn write(&self, rel: &str, content: &[u8]) {
        write_tree_file(self.source.path(), rel, content);
    }

    pub fn remove(&self, rel: &str) {
        remove_tree_file(self.source.path(), rel);
    }

    pub fn backup(&self, day: u32, retain: usize) -> Result<BackupReport> {
        BackupDriver::new(&self.local, &self.remote)
            .retain(retain)
            .run_at(at(day))
    }

    pub fn restore_day(&self, day: &str) -> Result<RestoreReport> {
        RestoreDriver::new(&self.restore_target, &self.remote).run(Selection::Day(day))
    }

    /// Object name of a tree file in the remote container
    pub fn remote_name(rel: &str) -> String {
        format!("{}/{}", PREFIX, rel)
    }
}

impl Default for VaultHarness {
    fn default() -> Self {
        Self::new()
    }
}
