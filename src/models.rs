//! Core data models used throughout the memory harness.
//!
//! These types represent the chunks, file records and structured facts that
//! flow through indexing, plus the option and report types of the four
//! engine operations (index, query, remember, reflect).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MemoryError;

/// Milliseconds since the Unix epoch.
pub type Millis = i64;

pub const MILLIS_PER_DAY: i64 = 86_400_000;

/// Classification of a chunk's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Fact,
    Confirmed,
    Inferred,
    Decision,
    Preference,
    Opinion,
    Outdated,
    Rule,
    ActionItem,
}

impl ChunkType {
    pub const ALL: [ChunkType; 9] = [
        ChunkType::Fact,
        ChunkType::Confirmed,
        ChunkType::Inferred,
        ChunkType::Decision,
        ChunkType::Preference,
        ChunkType::Opinion,
        ChunkType::Outdated,
        ChunkType::Rule,
        ChunkType::ActionItem,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Fact => "fact",
            ChunkType::Confirmed => "confirmed",
            ChunkType::Inferred => "inferred",
            ChunkType::Decision => "decision",
            ChunkType::Preference => "preference",
            ChunkType::Opinion => "opinion",
            ChunkType::Outdated => "outdated",
            ChunkType::Rule => "rule",
            ChunkType::ActionItem => "action_item",
        }
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkType {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        ChunkType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| MemoryError::query_filter("type", s))
    }
}

/// Lifecycle-owned bookkeeping on a chunk. Only the reflect pass writes these.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Lifecycle {
    /// Type the chunk had before being marked `outdated`.
    pub prior_type: Option<ChunkType>,
    /// When the chunk was marked `outdated`.
    pub stale_since: Option<Millis>,
    /// Decay has been applied up to this instant.
    pub decayed_at: Option<Millis>,
    /// Last reinforcement instant.
    pub reinforced_at: Option<Millis>,
}

/// The atomic indexed unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub id: String,
    /// Workspace-relative path with `/` separators.
    pub file_path: String,
    pub heading: Option<String>,
    pub content: String,
    /// SHA-256 of `content`.
    pub hash: String,
    /// 1-based, inclusive.
    pub line_start: usize,
    pub line_end: usize,
    pub entities: BTreeSet<String>,
    pub chunk_type: ChunkType,
    pub confidence: f64,
    pub created_at: Millis,
    pub last_accessed: Option<Millis>,
    pub access_count: i64,
    pub lifecycle: Lifecycle,
}

/// A file known to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub path: String,
    pub mtime: Millis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactStatus {
    #[default]
    Active,
    Superseded,
}

/// One structured statement about an entity, as stored in a fact file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtomicFact {
    pub id: String,
    pub fact: String,
    #[serde(default)]
    pub category: String,
    #[serde(rename = "type", default)]
    pub fact_type: Option<String>,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub status: FactStatus,
    #[serde(default)]
    pub superseded_by: Option<String>,
}

/// A type and confidence pair, used for config defaults and resolver output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TypeAssignment {
    #[serde(rename = "type")]
    pub chunk_type: ChunkType,
    pub confidence: f64,
}

// ============ index ============

#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    /// Reindex files even when their mtime is unchanged.
    pub force: bool,
    /// Extra workspace-relative paths or globs, on top of the configured ones.
    pub include: Vec<String>,
    /// Extra path-glob type defaults, overriding configured entries with the same key.
    pub file_type_defaults: BTreeMap<String, TypeAssignment>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileError {
    pub file: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexReport {
    pub indexed: usize,
    pub skipped: usize,
    pub errors: Vec<FileError>,
    pub total: usize,
    pub cleaned: usize,
}

// ============ query ============

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub limit: Option<usize>,
    /// `YYYY-MM-DD`, RFC 3339, or relative (`7d`, `2w`, `yesterday`).
    pub since: Option<String>,
    /// Chunk type name, e.g. `decision`.
    pub chunk_type: Option<String>,
    pub min_confidence: Option<f64>,
    /// Long-form delivery budget in characters.
    pub max_chars: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryHit {
    pub chunk_id: String,
    pub file_path: String,
    pub heading: Option<String>,
    pub line_start: usize,
    pub line_end: usize,
    pub chunk_type: ChunkType,
    pub confidence: f64,
    pub final_score: f64,
    pub content: String,
}

// ============ remember ============

#[derive(Debug, Clone, Default)]
pub struct RememberOptions {
    /// Inline marker written ahead of the content, e.g. `decision`.
    pub tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RememberOutcome {
    pub file_path: String,
    /// 1-based line of the appended entry (0 when skipped).
    pub line: usize,
    pub skipped: bool,
}

// ============ reflect ============

#[derive(Debug, Clone, Copy, Default)]
pub struct ReflectOptions {
    pub dry_run: bool,
}

/// Two chunks making mutually exclusive assertions about one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contradiction {
    pub entity: String,
    pub chunk_a: String,
    pub chunk_b: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DecayReport {
    pub decayed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ReinforceReport {
    pub reinforced: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StaleReport {
    pub marked: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContradictionReport {
    pub found: usize,
    pub pairs: Vec<Contradiction>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PruneReport {
    pub archived: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReflectReport {
    pub dry_run: bool,
    pub decay: DecayReport,
    pub reinforce: ReinforceReport,
    pub stale: StaleReport,
    pub contradictions: ContradictionReport,
    pub prune: PruneReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_type_round_trips_names() {
        for t in ChunkType::ALL {
            assert_eq!(t.as_str().parse::<ChunkType>().unwrap(), t);
        }
        assert_eq!("Action-Item".parse::<ChunkType>().unwrap(), ChunkType::ActionItem);
    }

    #[test]
    fn test_unknown_chunk_type_is_filter_error() {
        match "gossip".parse::<ChunkType>() {
            Err(MemoryError::QueryFilter { field, value }) => {
                assert_eq!(field, "type");
                assert_eq!(value, "gossip");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_fact_deserializes_with_defaults() {
        let json = r#"{"id": "f1", "fact": "Lives in Lisbon", "source": "chat"}"#;
        let fact: AtomicFact = serde_json::from_str(json).unwrap();
        assert_eq!(fact.status, FactStatus::Active);
        assert!(fact.superseded_by.is_none());
        assert!(fact.category.is_empty());
    }

    #[test]
    fn test_fact_reads_superseded_by() {
        let json = r#"{"id": "f2", "fact": "x", "status": "superseded", "supersededBy": "f3"}"#;
        let fact: AtomicFact = serde_json::from_str(json).unwrap();
        assert_eq!(fact.status, FactStatus::Superseded);
        assert_eq!(fact.superseded_by.as_deref(), Some("f3"));
    }
}
