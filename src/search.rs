//! Retrieval and ranking.
//!
//! A query runs through these stages:
//!
//! 1. **Preprocess**: noise stripping, intent, temporal window ([`crate::query`]).
//! 2. **Candidates**: keyword search over the full-text index, plus chunks
//!    created inside an explicit temporal window.
//! 3. **Window filter**: candidates outside the temporal window are dropped
//!    before scoring.
//! 4. **Score**: a weighted sum of seven signals, each in `[0, 1]`:
//!
//! | Signal | Source |
//! |--------|--------|
//! | lexical | min-max normalized BM25 |
//! | recency | `exp(-age / (horizon / 3))`, 0 past the horizon |
//! | confidence | chunk confidence |
//! | chunk_type | per-type weight, intent-adjusted |
//! | importance | `file_weights` glob or built-in per-file default |
//! | entity | share of query keys found among chunk entities |
//! | semantic | optional [`SemanticScorer`] |
//!
//! 5. **Filter and cut**: `min_score`, `min_confidence`, `type`, `since`,
//!    `exclude_from_recall`, then `limit`, then delivery truncation.
//! 6. **Touch**: every returned chunk gets one access bump.

use std::collections::{BTreeSet, HashSet};

use anyhow::Context;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher, GlobSet};

use crate::chunk::char_len;
use crate::config::{build_globset, Config};
use crate::entities::entity_key;
use crate::error::{MemoryError, Result};
use crate::models::{Chunk, ChunkType, Millis, QueryHit, QueryOptions, MILLIS_PER_DAY};
use crate::query::{parse_since, prepare, Intent, PreparedQuery};
use crate::store::{ChunkCandidate, Store};

/// Optional similarity signal, e.g. an embedding model owned by the host.
pub trait SemanticScorer: Send + Sync {
    /// Similarity of `chunk` to `query` in `[0, 1]`, or `None` when unknown.
    fn score(&self, query: &str, chunk: &Chunk) -> Option<f64>;
}

/// Filters validated up front, so a bad value fails before any I/O.
struct Filters {
    chunk_type: Option<ChunkType>,
    since: Option<Millis>,
    min_confidence: Option<f64>,
}

impl Filters {
    fn parse(options: &QueryOptions, now: DateTime<Utc>) -> Result<Self> {
        let chunk_type = options
            .chunk_type
            .as_deref()
            .map(str::parse::<ChunkType>)
            .transpose()?;
        let since = options
            .since
            .as_deref()
            .map(|s| parse_since(s, now))
            .transpose()?;
        if let Some(c) = options.min_confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(MemoryError::query_filter("minConfidence", c.to_string()));
            }
        }
        Ok(Self {
            chunk_type,
            since,
            min_confidence: options.min_confidence,
        })
    }

    fn admits(&self, chunk: &Chunk) -> bool {
        self.chunk_type.map_or(true, |t| chunk.chunk_type == t)
            && self.since.map_or(true, |s| chunk.created_at >= s)
            && self.min_confidence.map_or(true, |c| chunk.confidence >= c)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Signals {
    pub lexical: f64,
    pub recency: f64,
    pub confidence: f64,
    pub chunk_type: f64,
    pub importance: f64,
    pub entity: f64,
    pub semantic: f64,
}

/// Per-query scoring state: compiled globs plus the prepared query.
pub struct Ranker<'a> {
    config: &'a Config,
    query: &'a PreparedQuery,
    file_weights: Vec<(GlobMatcher, f64)>,
    semantic: Option<&'a dyn SemanticScorer>,
    now: Millis,
}

impl<'a> Ranker<'a> {
    pub fn new(
        config: &'a Config,
        query: &'a PreparedQuery,
        semantic: Option<&'a dyn SemanticScorer>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let file_weights = config
            .retrieval
            .file_weights
            .iter()
            .map(|(pattern, weight)| {
                let glob = Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?;
                Ok((glob.compile_matcher(), *weight))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            config,
            query,
            file_weights,
            semantic,
            now: now.timestamp_millis(),
        })
    }

    pub fn signals(&self, chunk: &Chunk, lexical: f64) -> Signals {
        Signals {
            lexical,
            recency: recency(chunk.created_at, self.now, self.config.retrieval.recency_horizon_days),
            confidence: chunk.confidence.clamp(0.0, 1.0),
            chunk_type: self.type_weight(chunk.chunk_type),
            importance: self.importance(&chunk.file_path),
            entity: entity_overlap(&self.query.entity_keys, chunk),
            semantic: self
                .semantic
                .and_then(|s| s.score(&self.query.text, chunk))
                .map_or(0.0, |v| v.clamp(0.0, 1.0)),
        }
    }

    pub fn combine(&self, s: &Signals) -> f64 {
        let w = &self.config.retrieval.weights;
        w.lexical * s.lexical
            + w.recency * s.recency
            + w.confidence * s.confidence
            + w.chunk_type * s.chunk_type
            + w.importance * s.importance
            + w.entity * s.entity
            + w.semantic * s.semantic
    }

    fn type_weight(&self, chunk_type: ChunkType) -> f64 {
        let multiplier = match (self.query.intent, chunk_type) {
            (Intent::Reasoning, ChunkType::Decision) => 1.3,
            (Intent::Reasoning, ChunkType::Confirmed) => 1.2,
            (Intent::Action, ChunkType::ActionItem) => 1.4,
            (Intent::Action, ChunkType::Decision) => 1.2,
            (Intent::Neutral, ChunkType::Rule) if !self.query.mentions_rules => {
                self.config.retrieval.rule_penalty
            }
            _ => 1.0,
        };
        (base_type_weight(chunk_type) * multiplier).clamp(0.0, 1.0)
    }

    fn importance(&self, file_path: &str) -> f64 {
        if let Some((_, weight)) = self.file_weights.iter().find(|(m, _)| m.is_match(file_path)) {
            return *weight;
        }
        let ws = &self.config.workspace;
        let file_name = file_path.rsplit('/').next().unwrap_or(file_path);
        if file_path == "MEMORY.md" {
            1.0
        } else if file_name == ws.fact_file_name {
            0.9
        } else if file_path.starts_with(&format!("{}/", ws.daily_dir)) {
            0.7
        } else {
            0.6
        }
    }
}

pub fn base_type_weight(chunk_type: ChunkType) -> f64 {
    match chunk_type {
        ChunkType::Confirmed => 1.0,
        ChunkType::Fact | ChunkType::Decision => 0.9,
        ChunkType::Rule => 0.85,
        ChunkType::ActionItem | ChunkType::Preference => 0.8,
        ChunkType::Inferred => 0.6,
        ChunkType::Opinion => 0.5,
        ChunkType::Outdated => 0.2,
    }
}

/// `exp(-age / (horizon / 3))`; future chunks count as age 0.
pub fn recency(created_at: Millis, now: Millis, horizon_days: f64) -> f64 {
    let age_days = ((now - created_at) as f64 / MILLIS_PER_DAY as f64).max(0.0);
    if age_days > horizon_days {
        0.0
    } else {
        (-age_days / (horizon_days / 3.0)).exp()
    }
}

fn entity_overlap(keys: &BTreeSet<String>, chunk: &Chunk) -> f64 {
    if keys.is_empty() {
        return 0.0;
    }
    let chunk_keys: HashSet<String> = chunk.entities.iter().map(|e| entity_key(e)).collect();
    let shared = keys.iter().filter(|k| chunk_keys.contains(*k)).count();
    shared as f64 / keys.len() as f64
}

/// Min-max normalize scores to [0, 1]. A single score, or all-equal scores, map to 1.0.
fn normalize_scores(candidates: &[ChunkCandidate]) -> Vec<(&ChunkCandidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

/// Cut `text` to at most `max_chars` characters (including the trailing
/// `…`), ending at the last sentence boundary in budget, else the last
/// whitespace.
pub fn truncate_for_delivery(text: &str, max_chars: usize) -> String {
    if max_chars == 0 || char_len(text) <= max_chars {
        return text.to_string();
    }
    let budget = max_chars.saturating_sub(1);
    let cut = text
        .char_indices()
        .nth(budget)
        .map_or(text.len(), |(i, _)| i);
    let prefix = &text[..cut];

    let sentence_end = prefix
        .char_indices()
        .filter(|(i, c)| {
            matches!(c, '.' | '!' | '?')
                && text[i + c.len_utf8()..]
                    .chars()
                    .next()
                    .map_or(true, char::is_whitespace)
        })
        .map(|(i, c)| i + c.len_utf8())
        .last();
    let end = sentence_end
        .or_else(|| prefix.rfind(char::is_whitespace))
        .filter(|&e| e > 0)
        .unwrap_or(cut);

    format!("{}…", text[..end].trim_end())
}

/// Run a query against the store as of `now`.
pub async fn search(
    store: &dyn Store,
    config: &Config,
    semantic: Option<&dyn SemanticScorer>,
    text: &str,
    options: &QueryOptions,
    now: DateTime<Utc>,
) -> Result<Vec<QueryHit>> {
    let filters = Filters::parse(options, now)?;
    let excluded: GlobSet = build_globset(config.workspace.exclude_from_recall.iter())?;
    let query = prepare(text, config.workspace.owner.as_deref(), now);

    let retrieval = &config.retrieval;
    let (candidate_k, min_score) = match query.intent {
        Intent::Aggregation => (retrieval.candidate_k * 2, retrieval.min_score / 2.0),
        _ => (retrieval.candidate_k, retrieval.min_score),
    };
    tracing::debug!(
        intent = ?query.intent,
        temporal = ?query.temporal,
        terms = ?query.terms,
        "prepared query"
    );

    let keyword = store.keyword_search(&query.terms, candidate_k).await?;
    let mut pool: Vec<(Chunk, f64)> = normalize_scores(&keyword)
        .into_iter()
        .map(|(c, norm)| (c.chunk.clone(), norm))
        .collect();

    if let Some(window) = query.temporal {
        if window.fetch_by_date {
            let seen: HashSet<String> = pool.iter().map(|(c, _)| c.id.clone()).collect();
            let dated = store
                .chunks_created_between(window.start, window.end, candidate_k)
                .await?;
            pool.extend(
                dated
                    .into_iter()
                    .filter(|c| !seen.contains(&c.id))
                    .map(|c| (c, 0.0)),
            );
        }
        pool.retain(|(c, _)| window.contains(c.created_at));
    }

    let ranker = Ranker::new(config, &query, semantic, now)?;
    let mut scored: Vec<(Chunk, f64)> = pool
        .into_iter()
        .map(|(chunk, lexical)| {
            let score = ranker.combine(&ranker.signals(&chunk, lexical));
            (chunk, score)
        })
        .collect();

    scored.sort_by(|a, b| {
        b.1.total_cmp(&a.1)
            .then(b.0.created_at.cmp(&a.0.created_at))
            .then(a.0.id.cmp(&b.0.id))
    });

    let limit = options.limit.unwrap_or(retrieval.final_limit).max(1);
    let delivery = options.max_chars.unwrap_or(retrieval.delivery_max_chars);

    let hits: Vec<QueryHit> = scored
        .into_iter()
        .filter(|(chunk, score)| {
            *score >= min_score && filters.admits(chunk) && !excluded.is_match(&chunk.file_path)
        })
        .take(limit)
        .map(|(chunk, score)| QueryHit {
            content: truncate_for_delivery(&chunk.content, delivery),
            chunk_id: chunk.id,
            file_path: chunk.file_path,
            heading: chunk.heading,
            line_start: chunk.line_start,
            line_end: chunk.line_end,
            chunk_type: chunk.chunk_type,
            confidence: chunk.confidence,
            final_score: score,
        })
        .collect();

    let ids: Vec<String> = hits.iter().map(|h| h.chunk_id.clone()).collect();
    store.touch(&ids, now.timestamp_millis()).await?;

    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileRecord, Lifecycle};
    use crate::store::InMemoryStore;
    use chrono::TimeZone;

    fn make_candidate(chunk_id: &str, score: f64) -> ChunkCandidate {
        ChunkCandidate {
            chunk: chunk(chunk_id, "MEMORY.md", "", 0),
            raw_score: score,
        }
    }

    fn chunk(id: &str, path: &str, content: &str, created_at: Millis) -> Chunk {
        Chunk {
            id: id.to_string(),
            file_path: path.to_string(),
            heading: None,
            content: content.to_string(),
            hash: String::new(),
            line_start: 1,
            line_end: 1,
            entities: Default::default(),
            chunk_type: ChunkType::Fact,
            confidence: 0.6,
            created_at,
            last_accessed: None,
            access_count: 0,
            lifecycle: Lifecycle::default(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 11, 12, 0, 0).unwrap()
    }

    fn ms(y: i32, m: u32, d: u32) -> Millis {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap().timestamp_millis()
    }

    async fn store_with(chunks: Vec<Chunk>) -> InMemoryStore {
        let store = InMemoryStore::new();
        let mut by_file: std::collections::BTreeMap<String, Vec<Chunk>> = Default::default();
        for c in chunks {
            by_file.entry(c.file_path.clone()).or_default().push(c);
        }
        for (path, chunks) in by_file {
            store
                .replace_file(&FileRecord { path, mtime: 1 }, &chunks)
                .await
                .unwrap();
        }
        store
    }

    #[test]
    fn test_normalize_empty() {
        let result = normalize_scores(&[]);
        assert!(result.is_empty());
    }

    #[test]
    fn test_normalize_single() {
        let candidates = vec![make_candidate("c1", 5.0)];
        let result = normalize_scores(&candidates);
        assert_eq!(result.len(), 1);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_range() {
        let candidates = vec![
            make_candidate("c1", 10.0),
            make_candidate("c2", 5.0),
            make_candidate("c3", 0.0),
        ];
        let result = normalize_scores(&candidates);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
        assert!((result[1].1 - 0.5).abs() < 1e-9);
        assert!((result[2].1 - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_recency_decays_and_clamps() {
        let now = ms(2025, 6, 11);
        assert!((recency(now, now, 365.0) - 1.0).abs() < 1e-9);
        assert!((recency(now + 10 * MILLIS_PER_DAY, now, 365.0) - 1.0).abs() < 1e-9);
        assert!(recency(now - 30 * MILLIS_PER_DAY, now, 365.0) > recency(now - 60 * MILLIS_PER_DAY, now, 365.0));
        assert_eq!(recency(now - 400 * MILLIS_PER_DAY, now, 365.0), 0.0);
    }

    #[test]
    fn test_truncate_at_sentence_boundary() {
        let text = "First sentence here. Second one is longer and keeps going on.";
        let cut = truncate_for_delivery(text, 30);
        assert_eq!(cut, "First sentence here.…");
        assert!(char_len(&cut) <= 30);
    }

    #[test]
    fn test_truncate_falls_back_to_whitespace() {
        let cut = truncate_for_delivery("alpha beta gamma delta epsilon", 14);
        assert_eq!(cut, "alpha beta…");
        assert_eq!(truncate_for_delivery("short", 14), "short");
    }

    #[test]
    fn test_type_weight_intent_multipliers() {
        let config = Config::default();
        let why = prepare("why did we pick postgres", None, now());
        let ranker = Ranker::new(&config, &why, None, now()).unwrap();
        assert!((ranker.type_weight(ChunkType::Decision) - 1.0).abs() < 1e-9);

        let plain = prepare("postgres version", None, now());
        let ranker = Ranker::new(&config, &plain, None, now()).unwrap();
        assert!((ranker.type_weight(ChunkType::Rule) - 0.425).abs() < 1e-9);

        let rules = prepare("postgres naming rules", None, now());
        let ranker = Ranker::new(&config, &rules, None, now()).unwrap();
        assert!((ranker.type_weight(ChunkType::Rule) - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_importance_defaults_and_overrides() {
        let mut config = Config::default();
        config.retrieval.file_weights.insert("projects/**".into(), 0.95);
        let q = prepare("x", None, now());
        let ranker = Ranker::new(&config, &q, None, now()).unwrap();
        assert_eq!(ranker.importance("MEMORY.md"), 1.0);
        assert_eq!(ranker.importance("people/jane/items.json"), 0.9);
        assert_eq!(ranker.importance("memory/2025-01-01.md"), 0.7);
        assert_eq!(ranker.importance("notes/x.md"), 0.6);
        assert_eq!(ranker.importance("projects/a.md"), 0.95);
    }

    #[tokio::test]
    async fn test_search_ranks_and_touches() {
        let store = store_with(vec![
            chunk("a", "MEMORY.md", "postgres postgres postgres is our database", ms(2025, 6, 1)),
            chunk("b", "notes/x.md", "we once tried postgres", ms(2025, 6, 1)),
            chunk("c", "notes/y.md", "unrelated gardening notes", ms(2025, 6, 1)),
        ])
        .await;
        let config = Config::default();
        let hits = search(&store, &config, None, "postgres", &QueryOptions::default(), now())
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(hits[0].final_score > hits[1].final_score);

        let touched = store.file_chunks("MEMORY.md").await.unwrap();
        assert_eq!(touched[0].access_count, 1);
        assert_eq!(touched[0].last_accessed, Some(now().timestamp_millis()));
        assert_eq!(store.file_chunks("notes/y.md").await.unwrap()[0].access_count, 0);
    }

    #[tokio::test]
    async fn test_type_and_confidence_filters() {
        let mut decision = chunk("d", "notes/a.md", "postgres chosen", ms(2025, 6, 1));
        decision.chunk_type = ChunkType::Decision;
        decision.confidence = 0.85;
        let store = store_with(vec![decision, chunk("f", "notes/b.md", "postgres fact", ms(2025, 6, 1))]).await;
        let config = Config::default();

        let options = QueryOptions {
            chunk_type: Some("decision".into()),
            ..Default::default()
        };
        let hits = search(&store, &config, None, "postgres", &options, now()).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "d");

        let options = QueryOptions {
            min_confidence: Some(0.7),
            ..Default::default()
        };
        let hits = search(&store, &config, None, "postgres", &options, now()).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_bad_filters_rejected() {
        let store = InMemoryStore::new();
        let config = Config::default();
        let bad_type = QueryOptions {
            chunk_type: Some("rumor".into()),
            ..Default::default()
        };
        let err = search(&store, &config, None, "x", &bad_type, now()).await.unwrap_err();
        assert!(matches!(err, MemoryError::QueryFilter { field: "type", .. }));

        let bad_since = QueryOptions {
            since: Some("whenever".into()),
            ..Default::default()
        };
        let err = search(&store, &config, None, "x", &bad_since, now()).await.unwrap_err();
        assert!(matches!(err, MemoryError::QueryFilter { field: "since", .. }));
    }

    #[tokio::test]
    async fn test_forward_month_returns_only_future() {
        let store = store_with(vec![
            chunk("future", "memory/2026-03-10.md", "launch review", ms(2026, 3, 10)),
            chunk("past", "memory/2025-03-10.md", "launch review", ms(2025, 3, 10)),
        ])
        .await;
        let config = Config::default();
        let hits = search(&store, &config, None, "what's coming in March", &QueryOptions::default(), now())
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["future"]);
    }

    #[tokio::test]
    async fn test_exclude_from_recall_and_since() {
        let store = store_with(vec![
            chunk("soul", "SOUL.md", "postgres vibes", ms(2025, 6, 1)),
            chunk("old", "notes/a.md", "postgres history", ms(2024, 1, 1)),
            chunk("new", "notes/b.md", "postgres today", ms(2025, 6, 10)),
        ])
        .await;
        let mut config = Config::default();
        config.workspace.exclude_from_recall = vec!["SOUL.md".into()];
        let options = QueryOptions {
            since: Some("30d".into()),
            ..Default::default()
        };
        let hits = search(&store, &config, None, "postgres", &options, now()).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["new"]);
    }

    struct Fixed(f64);

    impl SemanticScorer for Fixed {
        fn score(&self, _: &str, chunk: &Chunk) -> Option<f64> {
            (chunk.id == "b").then_some(self.0)
        }
    }

    #[tokio::test]
    async fn test_semantic_signal_can_reorder() {
        let store = store_with(vec![
            chunk("a", "notes/a.md", "postgres postgres", ms(2025, 6, 1)),
            chunk("b", "notes/b.md", "postgres", ms(2025, 6, 1)),
        ])
        .await;
        let mut config = Config::default();
        config.retrieval.weights.semantic = 1.0;
        let hits = search(&store, &config, Some(&Fixed(1.0)), "postgres", &QueryOptions::default(), now())
            .await
            .unwrap();
        assert_eq!(hits[0].chunk_id, "b");
    }
}
