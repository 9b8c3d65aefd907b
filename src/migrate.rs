use sqlx::SqlitePool;

/// Create the `embeddings` table if it does not exist. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            file_path TEXT PRIMARY KEY,
            file_hash TEXT NOT NULL,
            embedding_vector BLOB NOT NULL,
            last_updated TIMESTAMP NOT NULL,
            file_extension TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use tempfile::TempDir;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("nested/dir/e.db")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let columns: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info('embeddings') ORDER BY cid")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(
            columns,
            vec![
                "file_path",
                "file_hash",
                "embedding_vector",
                "last_updated",
                "file_extension"
            ]
        );
        pool.close().await;
    }
}
