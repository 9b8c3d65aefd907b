//! Directory scanner.
//!
//! Walks the configured root and returns one [`ScanEntry`] per supported
//! file. Symlinks are never followed, and symlinked files are not indexed.

use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::extensions::ExtensionFilter;
use crate::hasher::hash_file;
use crate::models::ScanEntry;

/// Recursively scan `root` for files accepted by `filter`.
///
/// Files that cannot be read are logged and skipped; so are subtrees the
/// walk cannot enter. Entries come back sorted by path.
pub fn scan_directory(root: &Path, filter: &ExtensionFilter) -> Vec<ScanEntry> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable path during scan: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let Some(extension) = filter.accept(path) else {
            continue;
        };

        match hash_file(path) {
            Ok(content_hash) => entries.push(ScanEntry {
                path: path.to_path_buf(),
                content_hash,
                extension,
            }),
            Err(e) => {
                warn!("Skipping unreadable file: {} ({})", path.display(), e);
            }
        }
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    debug!("Scanned {} files from {}", entries.len(), root.display());
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn paths(entries: &[ScanEntry], root: &Path) -> Vec<String> {
        let mut out: Vec<String> = entries
            .iter()
            .map(|e| {
                e.path
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();
        out.sort();
        out
    }

    #[test]
    fn finds_nested_files_matching_filter() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("top.txt"), "top").unwrap();
        fs::write(root.join("a/b/deep.md"), "# deep").unwrap();
        fs::write(root.join("a/skip.xyz"), "nope").unwrap();

        let filter = ExtensionFilter::parse(".txt,.md").unwrap();
        let entries = scan_directory(root, &filter);
        assert_eq!(paths(&entries, root), vec!["a/b/deep.md", "top.txt"]);

        let deep = entries
            .iter()
            .find(|e| e.path.ends_with("deep.md"))
            .unwrap();
        assert_eq!(deep.extension, ".md");
        assert_eq!(deep.content_hash.len(), 64);
    }

    #[test]
    fn entries_are_sorted_by_path() {
        let tmp = TempDir::new().unwrap();
        for name in ["zeta.txt", "alpha.txt", "mid/beta.txt"] {
            let path = tmp.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, name).unwrap();
        }

        let filter = ExtensionFilter::parse(".txt").unwrap();
        let names: Vec<_> = scan_directory(tmp.path(), &filter)
            .into_iter()
            .map(|e| e.path)
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names.len(), 3);
        assert_eq!(names, sorted);
    }

    #[test]
    fn extension_match_is_case_insensitive() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("report.TXT"), "upper").unwrap();
        fs::write(tmp.path().join("notes.xyz"), "other").unwrap();

        let filter = ExtensionFilter::parse(".txt").unwrap();
        let entries = scan_directory(tmp.path(), &filter);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].extension, ".txt");
        assert!(entries[0].path.ends_with("report.TXT"));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directories_are_not_followed() {
        let tmp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret.txt"), "outside").unwrap();
        std::os::unix::fs::symlink(outside.path(), tmp.path().join("link")).unwrap();
        fs::write(tmp.path().join("inside.txt"), "inside").unwrap();

        let filter = ExtensionFilter::parse(".txt").unwrap();
        let entries = scan_directory(tmp.path(), &filter);
        assert_eq!(paths(&entries, tmp.path()), vec!["inside.txt"]);
    }
}
