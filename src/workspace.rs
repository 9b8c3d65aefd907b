//! Temp workspace management.
//!
//! The temp path is a scratch directory owned by Help Chat. It is marked
//! with a sentinel file on first use, and every preparation pass purges
//! whatever is not ours: only the sentinel, the `_markdown` snapshot tree,
//! and (when colocated) the embeddings store survive.
//!
//! A pre-existing directory without the sentinel is refused unless it is
//! empty or holds nothing but a stale debug log, so a misconfigured
//! `temp_path` can never wipe user data.

use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::error::IndexError;

pub const SENTINEL_NAME: &str = ".help_chat_temp";
pub const MARKDOWN_DIR_NAME: &str = "_markdown";
pub const DEBUG_LOG_NAME: &str = "program_debug.log";

/// SQLite writes these next to the database file.
const STORE_SIDECAR_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

/// Prepare `temp_path` for a reindex pass and return the snapshot root.
///
/// Creates the directory (and sentinel) when missing, refuses unmanaged
/// directories with [`IndexError::UnmanagedDirectory`], and purges foreign
/// top-level entries. Individual delete failures are logged and skipped.
pub fn prepare_workspace(temp_path: &Path, store_path: &Path) -> Result<PathBuf, IndexError> {
    let sentinel = temp_path.join(SENTINEL_NAME);

    if temp_path.exists() {
        if !temp_path.is_dir() {
            return Err(IndexError::UnmanagedDirectory {
                path: temp_path.to_path_buf(),
                reason: "temp path must be a directory".to_string(),
            });
        }
        if !sentinel.exists() {
            adopt_unmarked_directory(temp_path)?;
            fs::write(&sentinel, b"").map_err(|e| IndexError::io(&sentinel, e))?;
        }
    } else {
        fs::create_dir_all(temp_path).map_err(|e| IndexError::io(temp_path, e))?;
        fs::write(&sentinel, b"").map_err(|e| IndexError::io(&sentinel, e))?;
    }

    let protected = protected_entries(temp_path, store_path);

    let listing = fs::read_dir(temp_path).map_err(|e| IndexError::io(temp_path, e))?;
    for entry in listing {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Failed to list temp artifact in {}: {}", temp_path.display(), e);
                continue;
            }
        };
        let name = entry.file_name();
        if name == SENTINEL_NAME || name == MARKDOWN_DIR_NAME || protected.contains(&name) {
            continue;
        }
        remove_entry(&entry.path());
    }

    let markdown_root = temp_path.join(MARKDOWN_DIR_NAME);
    fs::create_dir_all(&markdown_root).map_err(|e| IndexError::io(&markdown_root, e))?;
    Ok(markdown_root)
}

/// Accept a sentinel-less directory only if it holds no foreign entries.
/// Leaves the filesystem untouched when refusing.
fn adopt_unmarked_directory(temp_path: &Path) -> Result<(), IndexError> {
    let listing = fs::read_dir(temp_path).map_err(|e| IndexError::io(temp_path, e))?;
    let mut names = Vec::new();
    for entry in listing {
        let entry = entry.map_err(|e| IndexError::io(temp_path, e))?;
        names.push(entry.file_name());
    }

    if let Some(foreign) = names.iter().find(|name| *name != DEBUG_LOG_NAME) {
        return Err(IndexError::UnmanagedDirectory {
            path: temp_path.to_path_buf(),
            reason: format!(
                "found unrecognized entry '{}'; choose an empty directory or one previously created by Help Chat",
                foreign.to_string_lossy()
            ),
        });
    }

    for name in names {
        remove_entry(&temp_path.join(name));
    }
    Ok(())
}

fn remove_entry(path: &Path) {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => debug!("Removed temp artifact {}", path.display()),
        Err(e) => warn!("Failed to remove temp artifact '{}': {}", path.display(), e),
    }
}

/// Top-level names under `temp_path` that hold the embeddings store.
fn protected_entries(temp_path: &Path, store_path: &Path) -> HashSet<OsString> {
    let mut protected = HashSet::new();

    let Ok(temp_abs) = fs::canonicalize(temp_path) else {
        return protected;
    };
    let Some(store_abs) = resolve_lenient(store_path) else {
        return protected;
    };
    let Ok(relative) = store_abs.strip_prefix(&temp_abs) else {
        return protected;
    };

    let mut components = relative.components();
    let Some(Component::Normal(first)) = components.next() else {
        return protected;
    };
    protected.insert(first.to_os_string());

    if components.next().is_none() {
        for suffix in STORE_SIDECAR_SUFFIXES {
            protected.insert(with_suffix(first, suffix));
        }
    }
    protected
}

fn with_suffix(name: &OsStr, suffix: &str) -> OsString {
    let mut out = name.to_os_string();
    out.push(suffix);
    out
}

/// Canonical form of a path that may not exist yet: canonicalize the path
/// itself, else its parent plus the file name, else the plain absolute path.
pub(crate) fn resolve_lenient(path: &Path) -> Option<PathBuf> {
    let absolute = std::path::absolute(path).ok()?;
    if let Ok(canonical) = fs::canonicalize(&absolute) {
        return Some(canonical);
    }
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => match fs::canonicalize(parent) {
            Ok(parent) => Some(parent.join(name)),
            Err(_) => Some(absolute),
        },
        _ => Some(absolute),
    }
}
