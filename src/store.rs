//! Persistent vector store.
//!
//! One row per indexed source file in the `embeddings` table, keyed by the
//! canonical absolute path. Writes go through a [`StoreTx`] so a whole
//! reindex pass commits or rolls back as a unit; reads (including the lazy
//! [`VectorStore::iterate`] stream used by retrieval) go straight to the pool.

use chrono::{DateTime, NaiveDateTime, Utc};
use futures::{Stream, StreamExt};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::db;
use crate::error::IndexError;
use crate::migrate;
use crate::models::IndexedDocument;

pub struct VectorStore {
    path: PathBuf,
    pool: SqlitePool,
}

impl VectorStore {
    /// Open the store at `path`, creating the file and schema if needed.
    pub async fn open(path: &Path) -> Result<Self, IndexError> {
        let pool = db::connect(path)
            .await
            .map_err(|e| IndexError::store(path, e))?;
        migrate::run_migrations(&pool)
            .await
            .map_err(|e| IndexError::store(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            pool,
        })
    }

    /// Every stored path with its content hash, in one query.
    pub async fn load_all_hashes(&self) -> Result<HashMap<String, String>, IndexError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT file_path, file_hash FROM embeddings")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| self.err(e))?;
        Ok(rows.into_iter().collect())
    }

    /// Start the transaction that stages all mutations of one pass.
    pub async fn begin(&self) -> Result<StoreTx, IndexError> {
        let tx = self.pool.begin().await.map_err(|e| self.err(e))?;
        Ok(StoreTx {
            tx,
            path: self.path.clone(),
        })
    }

    /// Lazily stream `(path, embedding bytes)` for every row.
    pub fn iterate(&self) -> impl Stream<Item = Result<(String, Vec<u8>), IndexError>> + '_ {
        sqlx::query("SELECT file_path, embedding_vector FROM embeddings")
            .fetch(&self.pool)
            .map(move |row| -> Result<(String, Vec<u8>), IndexError> {
                let row = row.map_err(|e| self.err(e))?;
                let path: String = row.try_get(0).map_err(|e| self.err(e))?;
                let blob: Vec<u8> = row.try_get(1).map_err(|e| self.err(e))?;
                Ok((path, blob))
            })
    }

    pub async fn get(&self, file_path: &str) -> Result<Option<IndexedDocument>, IndexError> {
        let row = sqlx::query(
            "SELECT file_path, file_hash, embedding_vector, last_updated, file_extension \
             FROM embeddings WHERE file_path = ?",
        )
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| self.err(e))?;

        row.map(|row| document_from_row(&row).map_err(|e| self.err(e)))
            .transpose()
    }

    pub async fn count(&self) -> Result<i64, IndexError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.err(e))
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    fn err(&self, e: sqlx::Error) -> IndexError {
        IndexError::store(&self.path, e)
    }
}

/// Staged mutations of one reindex pass. Dropping without
/// [`StoreTx::commit`] rolls everything back.
pub struct StoreTx {
    tx: Transaction<'static, Sqlite>,
    path: PathBuf,
}

impl StoreTx {
    pub async fn upsert(&mut self, doc: &IndexedDocument) -> Result<(), IndexError> {
        sqlx::query(
            r#"
            INSERT INTO embeddings (file_path, file_hash, embedding_vector, last_updated, file_extension)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(file_path) DO UPDATE SET
                file_hash = excluded.file_hash,
                embedding_vector = excluded.embedding_vector,
                last_updated = excluded.last_updated,
                file_extension = excluded.file_extension
            "#,
        )
        .bind(&doc.path)
        .bind(&doc.content_hash)
        .bind(&doc.embedding)
        .bind(doc.last_updated.to_rfc3339())
        .bind(&doc.extension)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| IndexError::store(&self.path, e))?;
        Ok(())
    }

    /// Returns whether a row was removed.
    pub async fn delete(&mut self, file_path: &str) -> Result<bool, IndexError> {
        let result = sqlx::query("DELETE FROM embeddings WHERE file_path = ?")
            .bind(file_path)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| IndexError::store(&self.path, e))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn commit(self) -> Result<(), IndexError> {
        let path = self.path;
        self.tx
            .commit()
            .await
            .map_err(|source| IndexError::StoreCommit { path, source })
    }

    /// Discard everything staged so far.
    pub async fn rollback(self) -> Result<(), IndexError> {
        let path = self.path;
        self.tx
            .rollback()
            .await
            .map_err(|e| IndexError::store(path, e))
    }
}

fn document_from_row(row: &SqliteRow) -> Result<IndexedDocument, sqlx::Error> {
    let raw_time: String = row.try_get("last_updated")?;
    let last_updated = parse_timestamp(&raw_time).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: "last_updated".to_string(),
        source: format!("unrecognized timestamp '{}'", raw_time).into(),
    })?;

    Ok(IndexedDocument {
        path: row.try_get("file_path")?,
        content_hash: row.try_get("file_hash")?,
        embedding: row.try_get("embedding_vector")?,
        last_updated,
        extension: row.try_get("file_extension")?,
    })
}

/// RFC 3339, or the space-separated form older stores wrote.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
