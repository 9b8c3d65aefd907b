//! Semantic retrieval over the vector store.
//!
//! A [`Retriever`] owns its own store connection and embedder. Queries are
//! encoded once, every stored vector is streamed and scored by cosine
//! similarity, and a bounded min-heap keeps the best `top_k`:
//!
//! ```text
//! query → encode → stream rows → cosine → heap(top_k) → sort desc
//! ```
//!
//! Excerpts for prompt augmentation come from the markdown snapshot tree
//! written during reindexing.

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::config::Config;
use crate::embedding::{blob_to_vec, create_embedder, l2_norm, Embedder};
use crate::models::RetrievedDocument;
use crate::snapshot;
use crate::store::VectorStore;
use crate::workspace::{resolve_lenient, MARKDOWN_DIR_NAME};

/// Default excerpt length in characters.
pub const DEFAULT_EXCERPT_LIMIT: usize = 1500;

/// Query keywords shorter than this (in characters) are ignored.
const MIN_KEYWORD_CHARS: usize = 4;

pub struct Retriever {
    store: VectorStore,
    embedder: Arc<Mutex<Box<dyn Embedder>>>,
    root: Option<PathBuf>,
    markdown_root: Option<PathBuf>,
}

impl Retriever {
    /// Open the store and construct the embedder named by `config`.
    pub async fn open(config: &Config) -> Result<Self> {
        let store = VectorStore::open(&config.embeddings_path).await?;
        let embedder = create_embedder(&config.embedder_settings())
            .with_context(|| "Failed to create query embedder")?;
        Ok(Self::new(
            store,
            embedder,
            &config.root_path,
            &config.temp_path,
        ))
    }

    pub fn new(
        store: VectorStore,
        embedder: Box<dyn Embedder>,
        root_path: &Path,
        temp_path: &Path,
    ) -> Self {
        Self {
            store,
            embedder: Arc::new(Mutex::new(embedder)),
            root: resolve_lenient(root_path),
            markdown_root: resolve_lenient(temp_path).map(|t| t.join(MARKDOWN_DIR_NAME)),
        }
    }

    /// Top `top_k` stored documents by cosine similarity to `query`,
    /// highest first.
    ///
    /// Rows whose vector is all zeros or has a different dimension than
    /// the query vector are skipped. A zero query vector matches nothing.
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedDocument>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let query_vec = self.encode(query).await?;
        let query_norm = l2_norm(&query_vec);
        if query_norm == 0.0 {
            return Ok(Vec::new());
        }

        let mut heap: BinaryHeap<Reverse<Scored>> = BinaryHeap::with_capacity(top_k + 1);
        let mut rows = pin!(self.store.iterate());
        while let Some((path, blob)) = rows.try_next().await? {
            let stored = blob_to_vec(&blob);
            if stored.len() != query_vec.len() {
                debug!("Skipping {}: dimension {} != {}", path, stored.len(), query_vec.len());
                continue;
            }
            let stored_norm = l2_norm(&stored);
            if stored_norm == 0.0 {
                continue;
            }
            let dot: f32 = query_vec.iter().zip(&stored).map(|(a, b)| a * b).sum();
            let candidate = Scored {
                score: dot / (query_norm * stored_norm),
                path,
            };

            if heap.len() < top_k {
                heap.push(Reverse(candidate));
            } else if heap
                .peek()
                .is_some_and(|Reverse(worst)| candidate.score > worst.score)
            {
                heap.pop();
                heap.push(Reverse(candidate));
            }
        }

        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(s)| RetrievedDocument {
                path: s.path,
                score: s.score,
            })
            .collect())
    }

    /// Excerpt of the snapshot for `path` around the first query keyword.
    /// Empty when the snapshot is missing, unreadable or blank.
    pub fn load_markdown_excerpt(&self, path: &str, query: &str, limit: usize) -> String {
        let Some(snapshot_path) = self.snapshot_path(path) else {
            return String::new();
        };
        match std::fs::read_to_string(&snapshot_path) {
            Ok(text) => excerpt(&text, query, limit),
            Err(e) => {
                debug!("No snapshot for {}: {}", path, e);
                String::new()
            }
        }
    }

    /// Prefix `prompt` with the retrieved documents and their excerpts.
    pub fn augment_prompt(&self, prompt: &str, hits: &[RetrievedDocument]) -> String {
        let context: Vec<(&RetrievedDocument, String)> = hits
            .iter()
            .map(|hit| {
                (
                    hit,
                    self.load_markdown_excerpt(&hit.path, prompt, DEFAULT_EXCERPT_LIMIT),
                )
            })
            .collect();
        format_augmented_prompt(prompt, &context)
    }

    pub async fn close(self) {
        self.store.close().await;
    }

    fn snapshot_path(&self, path: &str) -> Option<PathBuf> {
        let root = self.root.as_deref()?;
        let markdown_root = self.markdown_root.as_deref()?;
        let source = resolve_lenient(Path::new(path))?;
        if !source.starts_with(root) {
            return None;
        }
        Some(snapshot::path_for(&source, root, markdown_root))
    }

    async fn encode(&self, query: &str) -> Result<Vec<f32>> {
        let embedder = Arc::clone(&self.embedder);
        let text = query.to_string();
        tokio::task::spawn_blocking(move || {
            let mut guard = embedder
                .lock()
                .map_err(|_| anyhow!("Query embedder lock poisoned"))?;
            guard.encode(&text)
        })
        .await
        .with_context(|| "Query embedding task failed")?
        .with_context(|| "Failed to embed query")
    }
}

struct Scored {
    score: f32,
    path: String,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.path.cmp(&self.path))
    }
}

/// Pick an excerpt of at most `limit` characters (plus a trailing `…`)
/// from `text`, centered on the first query keyword that occurs in it.
///
/// Keywords are the query's word tokens longer than three characters,
/// tried in query order and matched case-insensitively. Without a match
/// the excerpt is the head of the text.
pub fn excerpt(text: &str, query: &str, limit: usize) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let normalized: Vec<char> = trimmed.replace("\r\n", "\n").chars().collect();
    let lowered: Vec<char> = normalized.iter().map(|&c| lower_char(c)).collect();

    let match_index = keywords(query)
        .iter()
        .find_map(|keyword| find_chars(&lowered, keyword));

    let raw: String = match match_index {
        None => normalized.iter().take(limit * 2).collect(),
        Some(idx) => {
            let half_window = (limit / 2).max(1);
            let start = idx.saturating_sub(half_window);
            let end = (idx + half_window).min(normalized.len());
            let mut out = String::new();
            if start > 0 {
                out.push('…');
            }
            out.extend(&normalized[start..end]);
            if end < normalized.len() {
                out.push('…');
            }
            out
        }
    };

    let raw = raw.trim();
    if raw.chars().count() <= limit {
        return raw.to_string();
    }
    let mut cut: String = raw.chars().take(limit).collect();
    cut.truncate(cut.trim_end().len());
    cut.push('…');
    cut
}

/// Render the augmented prompt. Hits with an empty excerpt contribute only
/// their source line.
pub fn format_augmented_prompt(prompt: &str, context: &[(&RetrievedDocument, String)]) -> String {
    if context.is_empty() {
        return prompt.to_string();
    }

    let mut text = String::from("Relevant documentation:\n\n");
    for (hit, snippet) in context {
        text.push_str(&format!(
            "- Source: {} (relevance: {:.2})\n",
            hit.path, hit.score
        ));
        if !snippet.is_empty() {
            let indented: Vec<String> = snippet.lines().map(|line| format!("    {}", line)).collect();
            text.push_str("  Content excerpt:\n");
            text.push_str(&indented.join("\n"));
            text.push('\n');
        }
    }
    format!("{}\n\nUser question: {}", text, prompt)
}

fn keywords(query: &str) -> Vec<Vec<char>> {
    let lowered: Vec<char> = query.chars().map(lower_char).collect();
    lowered
        .split(|c| !(c.is_alphanumeric() || *c == '_'))
        .filter(|token| token.len() >= MIN_KEYWORD_CHARS)
        .map(|token| token.to_vec())
        .collect()
}

/// Single-character lowercase, so offsets in the lowered text line up with
/// the original.
fn lower_char(c: char) -> char {
    let mut lower = c.to_lowercase();
    match (lower.next(), lower.next()) {
        (Some(l), None) => l,
        _ => c,
    }
}

fn find_chars(haystack: &[char], needle: &[char]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
