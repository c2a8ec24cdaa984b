//! Indexing pipeline orchestration.
//!
//! Coordinates one pass: discovery → change detection → segmentation →
//! type resolution → merge with stored access/lifecycle state → atomic
//! per-file replacement → orphan cleanup.
//!
//! Failures are isolated per file. An unreadable file is reported in
//! [`IndexReport::errors`]; a malformed fact file is stored with zero
//! chunks so it is not re-parsed until it changes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::OsStr;
use std::path::Path;

use chrono::{NaiveDate, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::chunk::{segment_markdown, Segment};
use crate::config::{validate_type_defaults, Config};
use crate::discovery::{self, absolute_path, file_mtime};
use crate::error::{MemoryError, Result};
use crate::facts::segment_facts;
use crate::models::{Chunk, FileError, FileRecord, IndexOptions, IndexReport, Lifecycle, Millis};
use crate::store::Store;
use crate::typing::{scan_markers, ResolverChain};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Indexed { chunks: usize },
    Skipped,
}

pub struct Indexer<'a> {
    config: &'a Config,
    store: &'a dyn Store,
    resolver: ResolverChain,
}

impl<'a> Indexer<'a> {
    /// `extra_defaults` override configured `file_type_defaults` with the same key.
    pub fn new(
        config: &'a Config,
        store: &'a dyn Store,
        extra_defaults: &BTreeMap<String, crate::models::TypeAssignment>,
    ) -> Result<Self> {
        validate_type_defaults("file_type_defaults", extra_defaults)
            .map_err(|e| MemoryError::Config(format!("{:#}", e)))?;
        let mut defaults = config.workspace.file_type_defaults.clone();
        defaults.extend(extra_defaults.iter().map(|(k, v)| (k.clone(), *v)));
        let resolver = ResolverChain::standard(&defaults)
            .map_err(|e| MemoryError::Config(format!("{:#}", e)))?;
        Ok(Self {
            config,
            store,
            resolver,
        })
    }

    /// Run a full pass over the workspace.
    pub async fn run(&self, options: &IndexOptions) -> Result<IndexReport> {
        // a missing root or a bad include glob is a configuration problem
        let files = discovery::discover(self.config, &options.include)
            .map_err(|e| MemoryError::Config(format!("{:#}", e)))?;
        let mut report = IndexReport {
            total: files.len(),
            ..Default::default()
        };

        for rel in &files {
            match self.index_file(rel, options.force).await {
                Ok(FileOutcome::Indexed { chunks }) => {
                    debug!(file = %rel, chunks, "indexed");
                    report.indexed += 1;
                }
                Ok(FileOutcome::Skipped) => {
                    debug!(file = %rel, "unchanged, skipped");
                    report.skipped += 1;
                }
                Err(err) => {
                    warn!(file = %rel, error = %err, "failed to index file");
                    report.errors.push(FileError {
                        file: rel.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        let discovered: HashSet<&str> = files.iter().map(String::as_str).collect();
        for stored in self.store.list_file_paths().await? {
            if !discovered.contains(stored.as_str()) {
                let removed = self.store.remove_file(&stored).await?;
                debug!(file = %stored, chunks = removed, "removed orphaned file");
                report.cleaned += 1;
            }
        }

        info!(
            total = report.total,
            indexed = report.indexed,
            skipped = report.skipped,
            errors = report.errors.len(),
            cleaned = report.cleaned,
            "index pass complete"
        );
        Ok(report)
    }

    /// Index one workspace-relative file, skipping it when its mtime is unchanged.
    pub async fn index_file(&self, rel: &str, force: bool) -> Result<FileOutcome> {
        let path = absolute_path(self.config, rel);
        let mtime = file_mtime(&path).map_err(|source| MemoryError::FileRead {
            path: path.clone(),
            source,
        })?;

        if !force && self.store.file_mtime(rel).await? == Some(mtime) {
            return Ok(FileOutcome::Skipped);
        }

        let text = std::fs::read_to_string(&path).map_err(|source| MemoryError::FileRead {
            path: path.clone(),
            source,
        })?;

        let now = Utc::now().timestamp_millis();
        let fresh = match self.build_chunks(rel, &text, now) {
            Ok(chunks) => chunks,
            Err(err @ MemoryError::Parse { .. }) => {
                warn!(file = %rel, error = %err, "malformed fact file, storing without chunks");
                Vec::new()
            }
            Err(err) => return Err(err),
        };

        let old: HashMap<String, Chunk> = self
            .store
            .file_chunks(rel)
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        let merged: Vec<Chunk> = fresh.into_iter().map(|c| merge_stored(c, &old)).collect();

        let record = FileRecord {
            path: rel.to_string(),
            mtime,
        };
        self.store.replace_file(&record, &merged).await?;
        Ok(FileOutcome::Indexed {
            chunks: merged.len(),
        })
    }

    /// Segment and type a file's text. Pure apart from `now`.
    pub fn build_chunks(&self, rel: &str, text: &str, now: Millis) -> Result<Vec<Chunk>> {
        let is_fact_file = Path::new(rel)
            .file_name()
            .is_some_and(|n| n == OsStr::new(&self.config.workspace.fact_file_name));

        let (segments, markers) = if is_fact_file {
            let segments = segment_facts(rel, text).map_err(|source| MemoryError::Parse {
                path: rel.into(),
                source,
            })?;
            (segments, Vec::new())
        } else {
            (
                segment_markdown(text, self.config.chunking.max_chars),
                scan_markers(text),
            )
        };

        let created_at = date_from_stem(rel).unwrap_or(now);
        let mut ordinals: HashMap<(usize, usize), usize> = HashMap::new();

        Ok(segments
            .into_iter()
            .map(|segment| {
                let ordinal = ordinals
                    .entry((segment.line_start, segment.line_end))
                    .or_insert(0);
                let id = chunk_id(rel, &segment, *ordinal);
                *ordinal += 1;

                let typing = self.resolver.resolve(rel, &segment, &markers);
                Chunk {
                    id,
                    file_path: rel.to_string(),
                    hash: content_hash(&segment.content),
                    heading: segment.heading,
                    content: segment.content,
                    line_start: segment.line_start,
                    line_end: segment.line_end,
                    entities: segment.entities,
                    chunk_type: typing.chunk_type,
                    confidence: typing.confidence,
                    created_at,
                    last_accessed: None,
                    access_count: 0,
                    lifecycle: Lifecycle::default(),
                }
            })
            .collect())
    }
}

/// Carry stored state onto a freshly built chunk with the same id.
///
/// Access fields and `created_at` always survive a reindex; confidence,
/// type and lifecycle fields survive only when the content is unchanged.
fn merge_stored(mut fresh: Chunk, old: &HashMap<String, Chunk>) -> Chunk {
    let Some(prev) = old.get(&fresh.id) else {
        return fresh;
    };
    fresh.access_count = prev.access_count;
    fresh.last_accessed = prev.last_accessed;
    fresh.created_at = prev.created_at;
    if prev.hash == fresh.hash {
        fresh.confidence = prev.confidence;
        fresh.chunk_type = prev.chunk_type;
        fresh.lifecycle = prev.lifecycle.clone();
    }
    fresh
}

fn chunk_id(rel: &str, segment: &Segment, ordinal: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rel.as_bytes());
    hasher.update(format!(":{}:{}:{}", segment.line_start, segment.line_end, ordinal).as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Midnight UTC of a `YYYY-MM-DD` file stem.
pub fn date_from_stem(rel: &str) -> Option<Millis> {
    let stem = Path::new(rel).file_stem()?.to_str()?;
    let date = NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis())
}
