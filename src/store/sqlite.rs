//! SQLite-backed [`Store`] with an FTS5 index over chunk content.
//!
//! File replacement, lifecycle write-back and archiving each run in one
//! transaction, so a concurrent reader sees either the old or the new
//! state of a file. Keyword search ranks with BM25, negated so higher is
//! better.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::PruneMode;
use crate::db;
use crate::migrate;
use crate::models::{Chunk, ChunkType, Contradiction, FileRecord, Lifecycle, Millis};

use super::{ChunkCandidate, Store, StoreStats};

const CHUNK_FIELDS: [&str; 17] = [
    "id",
    "file_path",
    "heading",
    "content",
    "hash",
    "line_start",
    "line_end",
    "entities",
    "chunk_type",
    "confidence",
    "created_at",
    "last_accessed",
    "access_count",
    "prior_type",
    "stale_since",
    "decayed_at",
    "reinforced_at",
];

fn columns(prefix: &str) -> String {
    CHUNK_FIELDS
        .iter()
        .map(|f| format!("{}{}", prefix, f))
        .collect::<Vec<_>>()
        .join(", ")
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

pub struct SqliteStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteStore {
    /// Open the store at `db_path`, creating it and its schema when missing.
    pub async fn open(db_path: &Path) -> Result<Self> {
        let pool = db::connect(db_path).await?;
        migrate::run_migrations(&pool)
            .await
            .with_context(|| format!("Failed to migrate store: {}", db_path.display()))?;
        Ok(Self {
            pool,
            path: db_path.to_path_buf(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn select_chunks(&self, sql: &str, bind: Option<&str>) -> Result<Vec<Chunk>> {
        let mut query = sqlx::query(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_chunk).collect()
    }
}

fn parse_type(raw: &str) -> Result<ChunkType> {
    raw.parse::<ChunkType>()
        .with_context(|| format!("Unknown chunk type in store: {}", raw))
}

fn row_to_chunk(row: &SqliteRow) -> Result<Chunk> {
    let entities: String = row.try_get("entities")?;
    let chunk_type: String = row.try_get("chunk_type")?;
    let prior_type: Option<String> = row.try_get("prior_type")?;
    let line_start: i64 = row.try_get("line_start")?;
    let line_end: i64 = row.try_get("line_end")?;

    Ok(Chunk {
        id: row.try_get("id")?,
        file_path: row.try_get("file_path")?,
        heading: row.try_get("heading")?,
        content: row.try_get("content")?,
        hash: row.try_get("hash")?,
        line_start: line_start as usize,
        line_end: line_end as usize,
        entities: serde_json::from_str(&entities).context("Malformed entities column")?,
        chunk_type: parse_type(&chunk_type)?,
        confidence: row.try_get("confidence")?,
        created_at: row.try_get("created_at")?,
        last_accessed: row.try_get("last_accessed")?,
        access_count: row.try_get("access_count")?,
        lifecycle: Lifecycle {
            prior_type: prior_type.as_deref().map(parse_type).transpose()?,
            stale_since: row.try_get("stale_since")?,
            decayed_at: row.try_get("decayed_at")?,
            reinforced_at: row.try_get("reinforced_at")?,
        },
    })
}

/// Quote each term for FTS5 and OR them together.
fn fts_query(terms: &[String]) -> String {
    terms
        .iter()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[async_trait]
impl Store for SqliteStore {
    async fn file_mtime(&self, path: &str) -> Result<Option<Millis>> {
        let mtime: Option<i64> = sqlx::query_scalar("SELECT mtime FROM files WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(mtime)
    }

    async fn list_file_paths(&self) -> Result<Vec<String>> {
        let paths: Vec<String> = sqlx::query_scalar("SELECT path FROM files ORDER BY path")
            .fetch_all(&self.pool)
            .await?;
        Ok(paths)
    }

    async fn file_chunks(&self, path: &str) -> Result<Vec<Chunk>> {
        let sql = format!(
            "SELECT {} FROM chunks WHERE file_path = ? ORDER BY line_start, line_end, id",
            columns("")
        );
        self.select_chunks(&sql, Some(path)).await
    }

    async fn replace_file(&self, file: &FileRecord, chunks: &[Chunk]) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let insert_chunk = format!(
            "INSERT INTO chunks ({}) VALUES ({})",
            columns(""),
            placeholders(CHUNK_FIELDS.len())
        );

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO files (path, mtime, indexed_at) VALUES (?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET mtime = excluded.mtime, indexed_at = excluded.indexed_at
            "#,
        )
        .bind(&file.path)
        .bind(file.mtime)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        // Read after the first write, so the transaction already holds the
        // write lock and no touch can land between this read and the swap.
        let access: HashMap<String, (i64, Option<Millis>)> =
            sqlx::query("SELECT id, access_count, last_accessed FROM chunks WHERE file_path = ?")
                .bind(&file.path)
                .fetch_all(&mut *tx)
                .await?
                .iter()
                .map(|row| -> Result<(String, (i64, Option<Millis>))> {
                    Ok((
                        row.try_get("id")?,
                        (row.try_get("access_count")?, row.try_get("last_accessed")?),
                    ))
                })
                .collect::<Result<_>>()?;

        sqlx::query("DELETE FROM chunks_fts WHERE chunk_id IN (SELECT id FROM chunks WHERE file_path = ?)")
            .bind(&file.path)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE file_path = ?")
            .bind(&file.path)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            let entities = serde_json::to_string(&chunk.entities)?;
            let (access_count, last_accessed) = access
                .get(&chunk.id)
                .copied()
                .unwrap_or((chunk.access_count, chunk.last_accessed));
            sqlx::query(&insert_chunk)
                .bind(&chunk.id)
                .bind(&chunk.file_path)
                .bind(&chunk.heading)
                .bind(&chunk.content)
                .bind(&chunk.hash)
                .bind(chunk.line_start as i64)
                .bind(chunk.line_end as i64)
                .bind(entities)
                .bind(chunk.chunk_type.as_str())
                .bind(chunk.confidence)
                .bind(chunk.created_at)
                .bind(last_accessed)
                .bind(access_count)
                .bind(chunk.lifecycle.prior_type.map(|t| t.as_str()))
                .bind(chunk.lifecycle.stale_since)
                .bind(chunk.lifecycle.decayed_at)
                .bind(chunk.lifecycle.reinforced_at)
                .execute(&mut *tx)
                .await?;

            sqlx::query("INSERT INTO chunks_fts (chunk_id, content) VALUES (?, ?)")
                .bind(&chunk.id)
                .bind(&chunk.content)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts WHERE chunk_id IN (SELECT id FROM chunks WHERE file_path = ?)")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM chunks WHERE file_path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM files WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed as usize)
    }

    async fn keyword_search(&self, terms: &[String], limit: usize) -> Result<Vec<ChunkCandidate>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            SELECT {}, bm25(chunks_fts) AS score
            FROM chunks_fts
            JOIN chunks c ON c.id = chunks_fts.chunk_id
            WHERE chunks_fts MATCH ?
            ORDER BY score
            LIMIT ?
            "#,
            columns("c.")
        );
        let rows = sqlx::query(&sql)
            .bind(fts_query(terms))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<ChunkCandidate> {
                let score: f64 = row.try_get("score")?;
                Ok(ChunkCandidate {
                    chunk: row_to_chunk(row)?,
                    raw_score: -score, // negate so higher = better
                })
            })
            .collect()
    }

    async fn chunks_created_between(
        &self,
        start: Option<Millis>,
        end: Option<Millis>,
        limit: usize,
    ) -> Result<Vec<Chunk>> {
        let sql = format!(
            "SELECT {} FROM chunks WHERE created_at >= ? AND created_at <= ? ORDER BY created_at DESC, id LIMIT ?",
            columns("")
        );
        let rows = sqlx::query(&sql)
            .bind(start.unwrap_or(i64::MIN))
            .bind(end.unwrap_or(i64::MAX))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn touch(&self, ids: &[String], at: Millis) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE chunks SET access_count = access_count + 1, last_accessed = ? WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql).bind(at);
        for id in ids {
            query = query.bind(id);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn all_chunks(&self) -> Result<Vec<Chunk>> {
        let sql = format!(
            "SELECT {} FROM chunks ORDER BY file_path, line_start, line_end, id",
            columns("")
        );
        self.select_chunks(&sql, None).await
    }

    async fn update_lifecycle(&self, chunks: &[Chunk]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;
        for chunk in chunks {
            updated += sqlx::query(
                r#"
                UPDATE chunks
                SET confidence = ?, chunk_type = ?, prior_type = ?,
                    stale_since = ?, decayed_at = ?, reinforced_at = ?
                WHERE id = ?
                "#,
            )
            .bind(chunk.confidence)
            .bind(chunk.chunk_type.as_str())
            .bind(chunk.lifecycle.prior_type.map(|t| t.as_str()))
            .bind(chunk.lifecycle.stale_since)
            .bind(chunk.lifecycle.decayed_at)
            .bind(chunk.lifecycle.reinforced_at)
            .bind(&chunk.id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(updated as usize)
    }

    async fn archive_chunks(&self, ids: &[String], mode: PruneMode, at: Millis) -> Result<usize> {
        let archive_sql = format!(
            "INSERT OR REPLACE INTO archived_chunks ({cols}, archived_at) SELECT {cols}, ? FROM chunks WHERE id = ?",
            cols = columns("")
        );

        let mut tx = self.pool.begin().await?;
        let mut affected = 0;
        for id in ids {
            if mode == PruneMode::Archive {
                sqlx::query(&archive_sql)
                    .bind(at)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            affected += sqlx::query("DELETE FROM chunks WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(affected as usize)
    }

    async fn record_contradictions(&self, pairs: &[Contradiction], at: Millis) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut added = 0;
        for pair in pairs {
            added += sqlx::query(
                r#"
                INSERT OR IGNORE INTO contradictions (chunk_a, chunk_b, entity, reason, detected_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&pair.chunk_a)
            .bind(&pair.chunk_b)
            .bind(&pair.entity)
            .bind(&pair.reason)
            .bind(at)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(added as usize)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let archived: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM archived_chunks")
            .fetch_one(&self.pool)
            .await?;
        let contradictions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM contradictions")
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(
            "SELECT chunk_type, COUNT(*) AS cnt FROM chunks GROUP BY chunk_type ORDER BY chunk_type",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut by_type = std::collections::BTreeMap::new();
        for row in &rows {
            by_type.insert(row.try_get::<String, _>("chunk_type")?, row.try_get::<i64, _>("cnt")?);
        }

        Ok(StoreStats {
            files,
            chunks,
            by_type,
            archived,
            contradictions,
        })
    }
}
