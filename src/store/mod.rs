//! Storage abstraction for the memory index.
//!
//! The [`Store`] trait is the storage contract: file records, their chunk
//! sets (replaced wholesale), full-text candidate search, access bumps and
//! the lifecycle-owned field updates. Two backends implement it:
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`sqlite::SqliteStore`] | Durable per-workspace store (SQLite + FTS5) |
//! | [`memory::InMemoryStore`] | Tests and embedders that need no disk |
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::config::PruneMode;
use crate::models::{Chunk, Contradiction, FileRecord, Millis};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// A chunk matched by keyword search.
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub chunk: Chunk,
    /// Backend score, higher is better. Only comparable within one result set.
    pub raw_score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub files: i64,
    pub chunks: i64,
    pub by_type: BTreeMap<String, i64>,
    pub archived: i64,
    pub contradictions: i64,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Owner |
/// |--------|-------|
/// | [`replace_file`](Store::replace_file), [`remove_file`](Store::remove_file) | Indexer |
/// | [`keyword_search`](Store::keyword_search), [`chunks_created_between`](Store::chunks_created_between), [`touch`](Store::touch) | Retrieval |
/// | [`update_lifecycle`](Store::update_lifecycle), [`archive_chunks`](Store::archive_chunks), [`record_contradictions`](Store::record_contradictions) | Reflect |
#[async_trait]
pub trait Store: Send + Sync {
    /// Stored mtime for `path`, if the file has been indexed.
    async fn file_mtime(&self, path: &str) -> Result<Option<Millis>>;

    async fn list_file_paths(&self) -> Result<Vec<String>>;

    /// Chunks of one file, ordered by line range.
    async fn file_chunks(&self, path: &str) -> Result<Vec<Chunk>>;

    /// Upsert the file record and swap its chunk set in one atomic write.
    ///
    /// A chunk whose id is already stored keeps the stored `access_count`
    /// and `last_accessed`, read inside the same write; the values on
    /// `chunks` apply only to new ids.
    async fn replace_file(&self, file: &FileRecord, chunks: &[Chunk]) -> Result<()>;

    /// Delete a file record and its chunks. Returns the number of chunks removed.
    async fn remove_file(&self, path: &str) -> Result<usize>;

    /// Chunks matching any of `terms`, best first, at most `limit`.
    async fn keyword_search(&self, terms: &[String], limit: usize) -> Result<Vec<ChunkCandidate>>;

    /// Chunks whose `created_at` lies in `[start, end]` (open ends unbounded),
    /// newest first, at most `limit`.
    async fn chunks_created_between(
        &self,
        start: Option<Millis>,
        end: Option<Millis>,
        limit: usize,
    ) -> Result<Vec<Chunk>>;

    /// Increment `access_count` and set `last_accessed` on each id.
    async fn touch(&self, ids: &[String], at: Millis) -> Result<()>;

    async fn all_chunks(&self) -> Result<Vec<Chunk>>;

    /// Write back `confidence`, `chunk_type` and the lifecycle fields of each
    /// chunk; every other column is left as stored. Returns rows updated.
    async fn update_lifecycle(&self, chunks: &[Chunk]) -> Result<usize>;

    /// Move chunks to the archive, or delete them. Returns rows affected.
    async fn archive_chunks(&self, ids: &[String], mode: PruneMode, at: Millis) -> Result<usize>;

    /// Record contradiction pairs, ignoring ones already known. Returns new rows.
    async fn record_contradictions(&self, pairs: &[Contradiction], at: Millis) -> Result<usize>;

    async fn stats(&self) -> Result<StoreStats>;
}
