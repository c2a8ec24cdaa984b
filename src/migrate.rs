use anyhow::Result;
use sqlx::SqlitePool;

/// Column list shared by `chunks` and `archived_chunks`.
const CHUNK_COLUMNS: &str = r#"
            id TEXT PRIMARY KEY,
            file_path TEXT NOT NULL,
            heading TEXT,
            content TEXT NOT NULL,
            hash TEXT NOT NULL,
            line_start INTEGER NOT NULL,
            line_end INTEGER NOT NULL,
            entities TEXT NOT NULL DEFAULT '[]',
            chunk_type TEXT NOT NULL,
            confidence REAL NOT NULL,
            created_at INTEGER NOT NULL,
            last_accessed INTEGER,
            access_count INTEGER NOT NULL DEFAULT 0,
            prior_type TEXT,
            stale_since INTEGER,
            decayed_at INTEGER,
            reinforced_at INTEGER"#;

/// Create every table and index the store needs. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            path TEXT PRIMARY KEY,
            mtime INTEGER NOT NULL,
            indexed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS chunks ({},\n            FOREIGN KEY (file_path) REFERENCES files(path)\n        )",
        CHUNK_COLUMNS
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS archived_chunks ({},\n            archived_at INTEGER NOT NULL\n        )",
        CHUNK_COLUMNS
    ))
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS contradictions (
            chunk_a TEXT NOT NULL,
            chunk_b TEXT NOT NULL,
            entity TEXT NOT NULL,
            reason TEXT NOT NULL,
            detected_at INTEGER NOT NULL,
            PRIMARY KEY (chunk_a, chunk_b)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                content
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_file_path ON chunks(file_path)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_created_at ON chunks(created_at)")
        .execute(pool)
        .await?;

    Ok(())
}
