//! Markdown snapshot tree.
//!
//! Every indexed source has a text snapshot under the markdown root that
//! mirrors its root-relative path with `.md` appended to the file name:
//! `docs/guide.txt` becomes `_markdown/docs/guide.txt.md`. Retrieval reads
//! excerpts from these files.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Snapshot location for `source`. Pure path arithmetic, no I/O.
///
/// Sources outside `root` map to their bare file name.
pub fn path_for(source: &Path, root: &Path, markdown_root: &Path) -> PathBuf {
    let relative = match source.strip_prefix(root) {
        Ok(rel) if rel.file_name().is_some() => rel.to_path_buf(),
        _ => source
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("unnamed")),
    };

    let mut file_name: OsString = relative
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    file_name.push(".md");
    markdown_root.join(relative.with_file_name(file_name))
}

/// Write (or overwrite) the snapshot for `source`, creating parents.
pub fn write(source: &Path, root: &Path, markdown_root: &Path, text: &str) -> io::Result<PathBuf> {
    let target = path_for(source, root, markdown_root);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&target, text)?;
    Ok(target)
}

/// Snapshot text for `source`, if one exists and is readable.
pub fn read(source: &Path, root: &Path, markdown_root: &Path) -> Option<String> {
    fs::read_to_string(path_for(source, root, markdown_root)).ok()
}

/// Remove the snapshot for `source` and prune empty parents up to (not
/// including) `markdown_root`. Failures are logged at debug level only.
pub fn delete(source: &Path, root: &Path, markdown_root: &Path) {
    let target = path_for(source, root, markdown_root);
    match fs::remove_file(&target) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => debug!("Failed to remove snapshot {}: {}", target.display(), e),
    }

    let mut current = target.parent();
    while let Some(dir) = current {
        if dir == markdown_root || !dir.starts_with(markdown_root) {
            break;
        }
        let is_empty = match fs::read_dir(dir) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => break,
        };
        if !is_empty {
            break;
        }
        if let Err(e) = fs::remove_dir(dir) {
            debug!("Failed to prune snapshot directory {}: {}", dir.display(), e);
            break;
        }
        current = dir.parent();
    }
}
