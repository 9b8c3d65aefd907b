//! Normalization of the configured `supported_extensions` list.

use std::collections::HashSet;
use std::path::Path;

use crate::error::IndexError;

/// Set of lowercase extensions, each with a leading dot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionFilter {
    extensions: HashSet<String>,
}

impl ExtensionFilter {
    /// Parse a comma-separated list such as `".txt, MD,json"`.
    ///
    /// Tokens are trimmed and lowercased; a missing leading dot is added.
    /// Fails with [`IndexError::InvalidConfig`] when no token survives.
    pub fn parse(raw: &str) -> Result<Self, IndexError> {
        let extensions: HashSet<String> = raw
            .split(',')
            .map(|token| token.trim().to_lowercase())
            .filter(|token| !token.is_empty() && token != ".")
            .map(|token| {
                if token.starts_with('.') {
                    token
                } else {
                    format!(".{}", token)
                }
            })
            .collect();

        if extensions.is_empty() {
            return Err(IndexError::InvalidConfig(
                "supported_extensions configuration cannot be empty".to_string(),
            ));
        }

        Ok(Self { extensions })
    }

    pub fn contains(&self, extension: &str) -> bool {
        self.extensions.contains(extension)
    }

    /// Normalized extension of `path` if the filter accepts it.
    pub fn accept(&self, path: &Path) -> Option<String> {
        let ext = extension_of(path)?;
        self.contains(&ext).then_some(ext)
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}

/// Lowercase extension with leading dot, or `None` for suffix-less names
/// (dotfiles such as `.bashrc` have no extension).
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
}
