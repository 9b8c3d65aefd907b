//! Reindex orchestration.
//!
//! One pass brings the vector store and the markdown snapshot tree in line
//! with the files under the root:
//!
//! ```text
//! prepare temp → open store → scan → diff hashes → drop removed files
//!   → warm pools → convert/embed new and changed files → commit
//! ```
//!
//! Every row mutation of a pass shares one transaction. Per-file failures
//! are logged and skipped (the previous row, if any, is kept); only setup
//! failures and the final commit abort the pass.

use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::embedding::EmbedderSettings;
use crate::error::{IndexError, SkipReason};
use crate::extensions::ExtensionFilter;
use crate::extract::{self, MAX_ARCHIVE_SIZE_BYTES};
use crate::models::{IndexedDocument, ReindexSummary, ScanEntry};
use crate::pool::TaskOutcome;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::scan::scan_directory;
use crate::snapshot;
use crate::store::{StoreTx, VectorStore};
use crate::worker::{
    conversion_pool, embedding_pool, ConversionPool, ConvertRequest, EmbedRequest,
    EmbeddingPool, WorkerBackend, EMBEDDING_WARMUP_TEXT,
};
use crate::workspace::prepare_workspace;

/// Inputs of one reindex pass.
#[derive(Debug, Clone)]
pub struct ReindexOptions {
    pub root_path: PathBuf,
    pub temp_path: PathBuf,
    pub embeddings_path: PathBuf,
    /// Base per-file budget for both pools.
    pub conversion_timeout: Duration,
    pub supported_extensions: String,
    pub embedder: EmbedderSettings,
    pub backend: WorkerBackend,
}

impl ReindexOptions {
    pub fn from_config(config: &Config, backend: WorkerBackend) -> Self {
        Self {
            root_path: config.root_path.clone(),
            temp_path: config.temp_path.clone(),
            embeddings_path: config.embeddings_path.clone(),
            conversion_timeout: config.conversion_timeout(),
            supported_extensions: config.supported_extensions.clone(),
            embedder: config.embedder_settings(),
            backend,
        }
    }
}

/// Paths resolved for the duration of one pass.
struct PassContext {
    root: PathBuf,
    markdown_root: PathBuf,
    model: String,
}

/// Run one incremental reindex pass.
///
/// # Errors
///
/// - [`IndexError::RootNotFound`] before anything is touched.
/// - [`IndexError::UnmanagedDirectory`] if the temp path is not ours.
/// - [`IndexError::InvalidConfig`] for an empty extension list.
/// - [`IndexError::Store`] / [`IndexError::Io`] for setup failures.
/// - [`IndexError::Store`] if staging a row fails mid-pass; the pass is
///   rolled back.
/// - [`IndexError::StoreCommit`] if the final commit fails; nothing from
///   this pass is persisted in the store.
pub async fn reindex(
    options: &ReindexOptions,
    progress: &dyn ProgressReporter,
) -> Result<ReindexSummary, IndexError> {
    if !options.root_path.exists() {
        return Err(IndexError::RootNotFound(options.root_path.clone()));
    }
    let root = std::fs::canonicalize(&options.root_path)
        .map_err(|e| IndexError::io(&options.root_path, e))?;

    let markdown_root = prepare_workspace(&options.temp_path, &options.embeddings_path)?;
    info!("Reindex started: {}", root.display());

    let store = VectorStore::open(&options.embeddings_path).await?;
    let filter = match ExtensionFilter::parse(&options.supported_extensions) {
        Ok(filter) => filter,
        Err(e) => {
            store.close().await;
            return Err(e);
        }
    };

    let ctx = PassContext {
        root,
        markdown_root,
        model: options.embedder.model.clone(),
    };
    let mut conversion = conversion_pool(&options.backend, options.conversion_timeout);
    let mut embedding =
        embedding_pool(&options.backend, &options.embedder, options.conversion_timeout);

    let result = run_pass(&ctx, &store, &filter, &mut conversion, &mut embedding, progress).await;

    conversion.shutdown();
    embedding.shutdown();
    store.close().await;

    if let Ok(summary) = &result {
        info!(
            "Reindex finished: {} scanned, {} indexed, {} unchanged, {} skipped, {} removed",
            summary.scanned, summary.indexed, summary.unchanged, summary.skipped, summary.removed
        );
    }
    result
}

/// Load the configuration's options and reindex with `backend`.
pub async fn run_reindex(
    config: &Config,
    backend: WorkerBackend,
    progress: &dyn ProgressReporter,
) -> Result<ReindexSummary, IndexError> {
    reindex(&ReindexOptions::from_config(config, backend), progress).await
}

async fn run_pass(
    ctx: &PassContext,
    store: &VectorStore,
    filter: &ExtensionFilter,
    conversion: &mut ConversionPool,
    embedding: &mut EmbeddingPool,
    progress: &dyn ProgressReporter,
) -> Result<ReindexSummary, IndexError> {
    let scanned = {
        let root = ctx.root.clone();
        let filter = filter.clone();
        tokio::task::spawn_blocking(move || scan_directory(&root, &filter))
            .await
            .map_err(|e| IndexError::io(&ctx.root, std::io::Error::other(e)))?
    };
    let stored = store.load_all_hashes().await?;

    let mut summary = ReindexSummary {
        scanned: scanned.len(),
        ..Default::default()
    };
    let mut tx = store.begin().await?;

    let scanned_paths: HashSet<String> = scanned.iter().map(|e| path_key(&e.path)).collect();
    for stale in stored.keys().filter(|p| !scanned_paths.contains(*p)) {
        match tx.delete(stale).await {
            Ok(_) => {
                snapshot::delete(Path::new(stale), &ctx.root, &ctx.markdown_root);
                summary.removed += 1;
                debug!("Removed missing file from index: {}", stale);
            }
            Err(e) => warn!("Failed to remove {} from index: {}", stale, e),
        }
    }

    let pending: Vec<&ScanEntry> = scanned
        .iter()
        .filter(|e| stored.get(&path_key(&e.path)) != Some(&e.content_hash))
        .collect();
    summary.unchanged = scanned.len() - pending.len();
    progress.report(ProgressEvent::Scanned {
        files: scanned.len() as u64,
        pending: pending.len() as u64,
    });

    if !pending.is_empty() {
        warm_up(conversion, embedding, &pending, &ctx.model).await;
    }

    let total = pending.len() as u64;
    for entry in pending {
        match index_entry(ctx, entry, conversion, embedding).await {
            Ok(embedding_bytes) => {
                if let Err(e) = stage(&mut tx, entry, embedding_bytes).await {
                    if let Err(rollback) = tx.rollback().await {
                        warn!("Rollback after failed write also failed: {}", rollback);
                    }
                    return Err(e);
                }
                summary.indexed += 1;
                progress.report(ProgressEvent::Indexed {
                    path: entry.path.clone(),
                    n: summary.indexed as u64,
                    total,
                });
            }
            Err(reason) => {
                warn!("Skipping {}: {}", entry.path.display(), reason);
                summary.skipped += 1;
            }
        }
    }

    tx.commit().await?;
    Ok(summary)
}

/// Warm both pools concurrently. The conversion pool is only warmed when
/// some pending file actually needs it.
async fn warm_up(
    conversion: &mut ConversionPool,
    embedding: &mut EmbeddingPool,
    pending: &[&ScanEntry],
    model: &str,
) {
    let needs_conversion = pending
        .iter()
        .any(|e| !extract::is_fast_format(&e.extension));
    let embed_warmup = embedding.warm_up(EmbedRequest {
        text: EMBEDDING_WARMUP_TEXT.to_string(),
        model: model.to_string(),
    });

    if needs_conversion {
        let (converted, embedded) =
            tokio::join!(conversion.warm_up(ConvertRequest::Ping), embed_warmup);
        debug!("Pool warm-up: conversion={} embedding={}", converted, embedded);
    } else {
        let embedded = embed_warmup.await;
        debug!("Pool warm-up: embedding={}", embedded);
    }
}

/// Convert and embed one new or changed file, writing its snapshot.
async fn index_entry(
    ctx: &PassContext,
    entry: &ScanEntry,
    conversion: &mut ConversionPool,
    embedding: &mut EmbeddingPool,
) -> Result<Vec<u8>, SkipReason> {
    let path = &entry.path;

    if extract::is_archive(&entry.extension) {
        let size = std::fs::metadata(path)
            .map(|m| m.len())
            .unwrap_or(MAX_ARCHIVE_SIZE_BYTES + 1);
        if size > MAX_ARCHIVE_SIZE_BYTES {
            return Err(SkipReason::ArchiveTooLarge { size });
        }
    }

    let text = if extract::is_fast_format(&entry.extension) {
        debug!("Inline conversion start: {}", path.display());
        convert_inline(path.clone()).await?
    } else {
        let budget = conversion.effective_timeout();
        debug!("Pooled conversion start: {} (budget {:?})", path.display(), budget);
        match conversion.submit(ConvertRequest::Convert(path.clone())).await {
            TaskOutcome::Success(text) => text,
            TaskOutcome::Unsupported(m) => return Err(SkipReason::ConversionUnsupported(m)),
            TaskOutcome::Error(m) => return Err(SkipReason::ConversionError(m)),
            TaskOutcome::Timeout => return Err(SkipReason::ConversionTimeout(budget)),
        }
    };

    if text.trim().is_empty() {
        return Err(SkipReason::EmptyContent);
    }

    match snapshot::write(path, &ctx.root, &ctx.markdown_root, &text) {
        Ok(target) => debug!("Markdown snapshot written: {}", target.display()),
        Err(e) => warn!("Failed to write snapshot for {}: {}", path.display(), e),
    }

    let budget = embedding.effective_timeout();
    let request = EmbedRequest {
        text,
        model: ctx.model.clone(),
    };
    match embedding.submit(request).await {
        TaskOutcome::Success(bytes) if !bytes.is_empty() => Ok(bytes),
        TaskOutcome::Success(_) => Err(SkipReason::EmbeddingError(
            "embedding is empty".to_string(),
        )),
        TaskOutcome::Unsupported(m) | TaskOutcome::Error(m) => Err(SkipReason::EmbeddingError(m)),
        TaskOutcome::Timeout => Err(SkipReason::EmbeddingTimeout(budget)),
    }
}

async fn convert_inline(path: PathBuf) -> Result<String, SkipReason> {
    let converted = tokio::task::spawn_blocking(move || extract::convert_path(&path))
        .await
        .map_err(|e| SkipReason::ConversionError(e.to_string()))?;
    match converted {
        Ok(text) => Ok(text),
        Err(extract::ExtractError::Io(e)) => Err(SkipReason::Io(e.to_string())),
        Err(e) if e.is_unsupported() => Err(SkipReason::ConversionUnsupported(e.to_string())),
        Err(e) => Err(SkipReason::ConversionError(e.to_string())),
    }
}

async fn stage(tx: &mut StoreTx, entry: &ScanEntry, embedding: Vec<u8>) -> Result<(), IndexError> {
    let doc = IndexedDocument {
        path: path_key(&entry.path),
        content_hash: entry.content_hash.clone(),
        embedding,
        last_updated: Utc::now(),
        extension: entry.extension.clone(),
    };
    tx.upsert(&doc).await
}

/// Key under which a scanned path is stored.
fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
