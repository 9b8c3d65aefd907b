//! Core data models used throughout Help Chat.
//!
//! These types represent the scan results, stored rows, and retrieval hits
//! that flow through the indexing and retrieval pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// One supported file found by a scan pass. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub path: PathBuf,
    pub content_hash: String,
    /// Lowercase, with leading dot.
    pub extension: String,
}

/// A row of the `embeddings` table.
#[derive(Debug, Clone)]
pub struct IndexedDocument {
    pub path: String,
    pub content_hash: String,
    /// Little-endian `f32` bytes.
    pub embedding: Vec<u8>,
    pub last_updated: DateTime<Utc>,
    pub extension: String,
}

/// A retrieval hit, ordered by descending similarity.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedDocument {
    pub path: String,
    pub score: f32,
}

/// Counters reported at the end of a reindex pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReindexSummary {
    pub scanned: usize,
    pub indexed: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub removed: usize,
}
