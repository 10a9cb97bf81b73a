//! Utility functions for snapvault
//!
//! This module provides common helpers used throughout the library:
//!
//! - File content hashing (MD5, the digest object stores report as their
//!   content hash, so local and remote fingerprints are comparable)
//! - Relative path normalisation and namespace checks
//! - Byte and duration formatting for log output

use crate::error::{Result, VaultError};
use md5::{Digest, Md5};
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Hash a file's content with MD5, returning a lowercase hex digest
///
/// The file is streamed through an 8KB buffer so memory use stays flat
/// regardless of file size.
pub fn hash_file_content(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash in-memory data with MD5
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Normalise a store-relative path
///
/// Leading separators are stripped so `"/a/b"` and `"a/b"` address the same
/// object. Paths that are empty or contain `..` would escape the store's
/// namespace and are rejected.
pub fn normalize_relative(path: &str) -> Result<String> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(VaultError::InvalidPath(format!("empty path {:?}", path)));
    }

    let mut parts = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => return Err(VaultError::InvalidPath(format!("{:?} is not UTF-8", path))),
            },
            Component::CurDir => {}
            _ => return Err(VaultError::InvalidPath(format!("{:?} escapes the store root", path))),
        }
    }

    if parts.is_empty() {
        return Err(VaultError::InvalidPath(format!("empty path {:?}", path)));
    }
    Ok(parts.join("/"))
}

/// Convert a path relative to a store root into its key form (`/` separated)
///
/// Returns `None` for paths that are not valid UTF-8.
pub fn path_to_key(relative: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

/// Make a path relative to a base path
pub fn make_relative(path: &Path, base: &Path) -> Result<PathBuf> {
    path.strip_prefix(base)
        .map(Path::to_path_buf)
        .map_err(|_| VaultError::internal(format!("Path {:?} is not relative to {:?}", path, base)))
}

/// Format bytes in human-readable form
///
/// Uses 1024 as the conversion factor. Values below 1 KB are shown as whole
/// bytes, larger values with two decimals.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Format an elapsed duration at second resolution
pub fn format_elapsed(elapsed: Duration) -> String {
    humantime::format_duration(Duration::from_secs(elapsed.as_secs())).to_string()
}
