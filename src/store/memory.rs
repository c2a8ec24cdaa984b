//! In-memory [`Store`] implementation for tests and embedders.
//!
//! All state sits behind one `std::sync::RwLock`, so a file's chunk swap is
//! a single write guard and readers never see half of it. Keyword search
//! counts case-insensitive substring hits per term in place of BM25.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::config::PruneMode;
use crate::models::{Chunk, Contradiction, FileRecord, Millis};

use super::{ChunkCandidate, Store, StoreStats};

#[derive(Default)]
struct Inner {
    files: BTreeMap<String, Millis>,
    chunks: BTreeMap<String, Vec<Chunk>>,
    archived: Vec<(Chunk, Millis)>,
    contradictions: BTreeMap<(String, String), (Contradiction, Millis)>,
}

impl Inner {
    fn iter_chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values().flatten()
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut Chunk> {
        self.chunks.values_mut().flatten().find(|c| c.id == id)
    }
}

pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn term_hits(content: &str, terms: &[String]) -> usize {
    let haystack = content.to_lowercase();
    terms
        .iter()
        .map(|t| haystack.matches(t.to_lowercase().as_str()).count())
        .sum()
}

#[async_trait]
impl Store for InMemoryStore {
    async fn file_mtime(&self, path: &str) -> Result<Option<Millis>> {
        Ok(self.read()?.files.get(path).copied())
    }

    async fn list_file_paths(&self) -> Result<Vec<String>> {
        Ok(self.read()?.files.keys().cloned().collect())
    }

    async fn file_chunks(&self, path: &str) -> Result<Vec<Chunk>> {
        Ok(self.read()?.chunks.get(path).cloned().unwrap_or_default())
    }

    async fn replace_file(&self, file: &FileRecord, chunks: &[Chunk]) -> Result<()> {
        let mut inner = self.write()?;
        let stored = inner.chunks.remove(&file.path).unwrap_or_default();
        let replaced = chunks
            .iter()
            .cloned()
            .map(|mut chunk| {
                if let Some(prev) = stored.iter().find(|c| c.id == chunk.id) {
                    chunk.access_count = prev.access_count;
                    chunk.last_accessed = prev.last_accessed;
                }
                chunk
            })
            .collect();
        inner.files.insert(file.path.clone(), file.mtime);
        inner.chunks.insert(file.path.clone(), replaced);
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<usize> {
        let mut inner = self.write()?;
        inner.files.remove(path);
        Ok(inner.chunks.remove(path).map_or(0, |c| c.len()))
    }

    async fn keyword_search(&self, terms: &[String], limit: usize) -> Result<Vec<ChunkCandidate>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.read()?;
        let mut hits: Vec<ChunkCandidate> = inner
            .iter_chunks()
            .filter_map(|chunk| {
                let hits = term_hits(&chunk.content, terms);
                (hits > 0).then(|| ChunkCandidate {
                    chunk: chunk.clone(),
                    raw_score: hits as f64,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.raw_score
                .total_cmp(&a.raw_score)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn chunks_created_between(
        &self,
        start: Option<Millis>,
        end: Option<Millis>,
        limit: usize,
    ) -> Result<Vec<Chunk>> {
        let inner = self.read()?;
        let mut found: Vec<Chunk> = inner
            .iter_chunks()
            .filter(|c| start.map_or(true, |s| c.created_at >= s) && end.map_or(true, |e| c.created_at <= e))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        found.truncate(limit);
        Ok(found)
    }

    async fn touch(&self, ids: &[String], at: Millis) -> Result<()> {
        let mut inner = self.write()?;
        for id in ids {
            if let Some(chunk) = inner.find_mut(id) {
                chunk.access_count += 1;
                chunk.last_accessed = Some(at);
            }
        }
        Ok(())
    }

    async fn all_chunks(&self) -> Result<Vec<Chunk>> {
        Ok(self.read()?.iter_chunks().cloned().collect())
    }

    async fn update_lifecycle(&self, chunks: &[Chunk]) -> Result<usize> {
        let mut inner = self.write()?;
        let mut updated = 0;
        for chunk in chunks {
            if let Some(stored) = inner.find_mut(&chunk.id) {
                stored.confidence = chunk.confidence;
                stored.chunk_type = chunk.chunk_type;
                stored.lifecycle = chunk.lifecycle.clone();
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn archive_chunks(&self, ids: &[String], mode: PruneMode, at: Millis) -> Result<usize> {
        let mut inner = self.write()?;
        let mut removed = Vec::new();
        for chunks in inner.chunks.values_mut() {
            let (gone, kept): (Vec<Chunk>, Vec<Chunk>) =
                chunks.drain(..).partition(|c| ids.contains(&c.id));
            *chunks = kept;
            removed.extend(gone);
        }
        let count = removed.len();
        if mode == PruneMode::Archive {
            inner.archived.extend(removed.into_iter().map(|c| (c, at)));
        }
        Ok(count)
    }

    async fn record_contradictions(&self, pairs: &[Contradiction], at: Millis) -> Result<usize> {
        let mut inner = self.write()?;
        let mut added = 0;
        for pair in pairs {
            let key = (pair.chunk_a.clone(), pair.chunk_b.clone());
            if !inner.contradictions.contains_key(&key) {
                inner.contradictions.insert(key, (pair.clone(), at));
                added += 1;
            }
        }
        Ok(added)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let inner = self.read()?;
        let mut stats = StoreStats {
            files: inner.files.len() as i64,
            archived: inner.archived.len() as i64,
            contradictions: inner.contradictions.len() as i64,
            ..Default::default()
        };
        for chunk in inner.iter_chunks() {
            stats.chunks += 1;
            *stats.by_type.entry(chunk.chunk_type.to_string()).or_default() += 1;
        }
        Ok(stats)
    }
}
