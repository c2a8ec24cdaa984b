//! Lifecycle maintenance ("reflect").
//!
//! One pass loads every chunk into a working copy and runs the enabled
//! steps in a fixed order: decay, reinforce, stale, contradictions, prune.
//! Each step sees the effects of the steps before it. A dry run stops after
//! the last step; a real run persists lifecycle fields, records detected
//! contradictions and archives (or deletes) pruned chunks.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

use crate::config::LifecycleConfig;
use crate::entities::entity_key;
use crate::error::Result;
use crate::models::{
    Chunk, ChunkType, Contradiction, ContradictionReport, DecayReport, Millis, PruneReport,
    ReflectOptions, ReflectReport, ReinforceReport, StaleReport, MILLIS_PER_DAY,
};
use crate::store::Store;

static SENTENCE_SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?;\n]+").unwrap());
static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9]+(?:'[a-z]+)?").unwrap());

const NEGATION_WORDS: &[&str] = &[
    "not", "no", "never", "nor", "cannot", "can't", "don't", "doesn't", "didn't", "isn't",
    "aren't", "wasn't", "weren't", "won't", "wouldn't", "shouldn't", "hasn't", "haven't",
];

const ANTONYMS: &[(&str, &str)] = &[
    ("likes", "dislikes"),
    ("like", "dislike"),
    ("prefers", "avoids"),
    ("prefer", "avoid"),
    ("enabled", "disabled"),
    ("active", "inactive"),
    ("true", "false"),
    ("yes", "no"),
    ("always", "never"),
    ("can", "cannot"),
    ("will", "won't"),
];

const SIMILARITY_THRESHOLD: f64 = 0.6;

/// Applies lifecycle steps to a working copy of chunks as of `now`.
pub struct Reflector<'a> {
    config: &'a LifecycleConfig,
    now: Millis,
    changed: BTreeSet<String>,
}

impl<'a> Reflector<'a> {
    pub fn new(config: &'a LifecycleConfig, now: Millis) -> Self {
        Self {
            config,
            now,
            changed: BTreeSet::new(),
        }
    }

    /// Ids whose lifecycle fields differ from what the store holds.
    pub fn changed(&self) -> &BTreeSet<String> {
        &self.changed
    }

    pub fn decay(&mut self, chunks: &mut [Chunk]) -> DecayReport {
        let window = days_to_millis(self.config.decay_window_days);
        let mut report = DecayReport::default();
        for chunk in chunks.iter_mut() {
            let idle_anchor = chunk.last_accessed.unwrap_or(chunk.created_at);
            let from = match chunk.lifecycle.decayed_at {
                Some(d) => (idle_anchor + window).max(d),
                None => idle_anchor + window,
            };
            if self.now <= from {
                continue;
            }
            let days = (self.now - from) as f64 / MILLIS_PER_DAY as f64;
            let decayed = (chunk.confidence - days * self.config.decay_per_day).max(0.0);
            if decayed < chunk.confidence {
                chunk.confidence = decayed;
                report.decayed += 1;
            }
            chunk.lifecycle.decayed_at = Some(self.now);
            self.changed.insert(chunk.id.clone());
        }
        report
    }

    pub fn reinforce(&mut self, chunks: &mut [Chunk]) -> ReinforceReport {
        let mut report = ReinforceReport::default();
        for chunk in chunks.iter_mut() {
            let accessed_since = match (chunk.last_accessed, chunk.lifecycle.reinforced_at) {
                (Some(accessed), Some(reinforced)) => accessed > reinforced,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if chunk.access_count < self.config.reinforce_min_access || !accessed_since {
                continue;
            }
            chunk.confidence = (chunk.confidence + self.config.reinforce_step).min(1.0);
            chunk.lifecycle.reinforced_at = Some(self.now);
            if chunk.chunk_type == ChunkType::Outdated
                && chunk.confidence >= self.config.stale_threshold
            {
                if let Some(prior) = chunk.lifecycle.prior_type.take() {
                    chunk.chunk_type = prior;
                    chunk.lifecycle.stale_since = None;
                }
            }
            report.reinforced += 1;
            self.changed.insert(chunk.id.clone());
        }
        report
    }

    pub fn mark_stale(&mut self, chunks: &mut [Chunk]) -> StaleReport {
        let mut report = StaleReport::default();
        for chunk in chunks.iter_mut() {
            if chunk.chunk_type == ChunkType::Outdated
                || chunk.confidence >= self.config.stale_threshold
            {
                continue;
            }
            chunk.lifecycle.prior_type = Some(chunk.chunk_type);
            chunk.lifecycle.stale_since = Some(self.now);
            chunk.chunk_type = ChunkType::Outdated;
            report.marked += 1;
            self.changed.insert(chunk.id.clone());
        }
        report
    }

    /// Ids of outdated chunks whose grace period has run out.
    pub fn prune_candidates(&self, chunks: &[Chunk]) -> Vec<String> {
        let grace = days_to_millis(self.config.prune_grace_days);
        chunks
            .iter()
            .filter(|c| c.chunk_type == ChunkType::Outdated)
            .filter(|c| c.lifecycle.stale_since.map_or(false, |s| self.now - s > grace))
            .map(|c| c.id.clone())
            .collect()
    }
}

fn days_to_millis(days: f64) -> Millis {
    (days * MILLIS_PER_DAY as f64) as Millis
}

fn sentences(text: &str) -> Vec<BTreeSet<String>> {
    let lower = text.to_lowercase().replace('\u{2019}', "'");
    SENTENCE_SPLIT_RE
        .split(&lower)
        .map(|s| WORD_RE.find_iter(s).map(|m| m.as_str().to_string()).collect::<BTreeSet<_>>())
        .filter(|words| !words.is_empty())
        .collect()
}

fn jaccard(a: &BTreeSet<&str>, b: &BTreeSet<&str>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

fn is_negation(word: &str) -> bool {
    NEGATION_WORDS.contains(&word)
}

/// Why two sentences make mutually exclusive claims, if they do.
fn conflict(a: &BTreeSet<String>, b: &BTreeSet<String>) -> Option<String> {
    let plain_a: BTreeSet<&str> = a.iter().map(String::as_str).filter(|w| !is_negation(w)).collect();
    let plain_b: BTreeSet<&str> = b.iter().map(String::as_str).filter(|w| !is_negation(w)).collect();
    let negated_a = a.iter().any(|w| is_negation(w));
    let negated_b = b.iter().any(|w| is_negation(w));
    if negated_a != negated_b && jaccard(&plain_a, &plain_b) >= SIMILARITY_THRESHOLD {
        return Some("negation".to_string());
    }

    for &(x, y) in ANTONYMS {
        for (left, right) in [(x, y), (y, x)] {
            let found = a.contains(left) && b.contains(right) && !a.contains(right) && !b.contains(left);
            if !found {
                continue;
            }
            let rest_a: BTreeSet<&str> = a.iter().map(String::as_str).filter(|w| *w != left).collect();
            let rest_b: BTreeSet<&str> = b.iter().map(String::as_str).filter(|w| *w != right).collect();
            if jaccard(&rest_a, &rest_b) >= SIMILARITY_THRESHOLD {
                return Some(format!("antonyms {}/{}", left, right));
            }
        }
    }
    None
}

/// Pairwise comparison of non-outdated chunks that share an entity.
/// Each pair is reported once, ordered by id, under the first shared entity.
pub fn detect_contradictions(chunks: &[Chunk]) -> Vec<Contradiction> {
    let live: Vec<&Chunk> = chunks
        .iter()
        .filter(|c| c.chunk_type != ChunkType::Outdated)
        .collect();

    let mut by_entity: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, chunk) in live.iter().enumerate() {
        let keys: BTreeSet<String> = chunk.entities.iter().map(|e| entity_key(e)).collect();
        for key in keys {
            by_entity.entry(key).or_default().push(i);
        }
    }

    let parsed: Vec<Vec<BTreeSet<String>>> = live.iter().map(|c| sentences(&c.content)).collect();
    let mut found: BTreeMap<(String, String), Contradiction> = BTreeMap::new();

    for (entity, members) in &by_entity {
        for (pos, &i) in members.iter().enumerate() {
            for &j in &members[pos + 1..] {
                let (a, b) = if live[i].id <= live[j].id { (i, j) } else { (j, i) };
                let key = (live[a].id.clone(), live[b].id.clone());
                if key.0 == key.1 || found.contains_key(&key) {
                    continue;
                }
                let reason = parsed[a]
                    .iter()
                    .find_map(|sa| parsed[b].iter().find_map(|sb| conflict(sa, sb)));
                if let Some(reason) = reason {
                    found.insert(
                        key.clone(),
                        Contradiction {
                            entity: entity.clone(),
                            chunk_a: key.0,
                            chunk_b: key.1,
                            reason,
                        },
                    );
                }
            }
        }
    }

    found.into_values().collect()
}

/// Run one lifecycle pass against `store` as of `now`.
pub async fn reflect(
    store: &dyn Store,
    config: &LifecycleConfig,
    options: ReflectOptions,
    now: DateTime<Utc>,
) -> Result<ReflectReport> {
    let now_ms = now.timestamp_millis();
    let mut chunks = store.all_chunks().await?;
    let mut reflector = Reflector::new(config, now_ms);
    let mut report = ReflectReport {
        dry_run: options.dry_run,
        ..Default::default()
    };

    if config.decay {
        report.decay = reflector.decay(&mut chunks);
    }
    if config.reinforce {
        report.reinforce = reflector.reinforce(&mut chunks);
    }
    if config.stale {
        report.stale = reflector.mark_stale(&mut chunks);
    }
    if config.contradictions {
        let pairs = detect_contradictions(&chunks);
        report.contradictions = ContradictionReport {
            found: pairs.len(),
            pairs,
        };
    }
    let pruned = if config.prune {
        reflector.prune_candidates(&chunks)
    } else {
        Vec::new()
    };
    report.prune = PruneReport {
        archived: pruned.len(),
    };

    if !options.dry_run {
        let changed: Vec<Chunk> = chunks
            .into_iter()
            .filter(|c| reflector.changed().contains(&c.id) && !pruned.contains(&c.id))
            .collect();
        store.update_lifecycle(&changed).await?;
        store
            .record_contradictions(&report.contradictions.pairs, now_ms)
            .await?;
        if !pruned.is_empty() {
            store.archive_chunks(&pruned, config.prune_mode, now_ms).await?;
        }
    }

    info!(
        dry_run = options.dry_run,
        decayed = report.decay.decayed,
        reinforced = report.reinforce.reinforced,
        stale = report.stale.marked,
        contradictions = report.contradictions.found,
        pruned = report.prune.archived,
        "reflect pass complete"
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PruneMode;
    use crate::models::{FileRecord, Lifecycle};
    use crate::store::InMemoryStore;

    const DAY: Millis = MILLIS_PER_DAY;
    const NOW: Millis = 1_000 * DAY;

    fn chunk(id: &str, content: &str, confidence: f64, created_at: Millis) -> Chunk {
        Chunk {
            id: id.to_string(),
            file_path: "notes.md".to_string(),
            heading: None,
            content: content.to_string(),
            hash: String::new(),
            line_start: 1,
            line_end: 1,
            entities: Default::default(),
            chunk_type: ChunkType::Fact,
            confidence,
            created_at,
            last_accessed: None,
            access_count: 0,
            lifecycle: Lifecycle::default(),
        }
    }

    fn with_entity(mut c: Chunk, entity: &str) -> Chunk {
        c.entities.insert(entity.to_string());
        c
    }

    #[test]
    fn test_decay_after_window_only() {
        let config = LifecycleConfig::default();
        let mut chunks = vec![
            chunk("idle", "x", 0.6, NOW - 50 * DAY),
            chunk("fresh", "y", 0.6, NOW - 10 * DAY),
        ];
        let mut r = Reflector::new(&config, NOW);
        let report = r.decay(&mut chunks);
        assert_eq!(report.decayed, 1);
        assert!((chunks[0].confidence - (0.6 - 20.0 * 0.005)).abs() < 1e-9);
        assert_eq!(chunks[1].confidence, 0.6);
    }

    #[test]
    fn test_decay_does_not_double_count() {
        let config = LifecycleConfig::default();
        let mut chunks = vec![chunk("idle", "x", 0.6, NOW - 50 * DAY)];
        Reflector::new(&config, NOW).decay(&mut chunks);
        let after_first = chunks[0].confidence;
        Reflector::new(&config, NOW + DAY).decay(&mut chunks);
        assert!((chunks[0].confidence - (after_first - 0.005)).abs() < 1e-9);
    }

    #[test]
    fn test_decay_floors_at_zero() {
        let config = LifecycleConfig::default();
        let mut chunks = vec![chunk("ancient", "x", 0.1, NOW - 900 * DAY)];
        Reflector::new(&config, NOW).decay(&mut chunks);
        assert_eq!(chunks[0].confidence, 0.0);
    }

    #[test]
    fn test_reinforce_caps_and_requires_new_access() {
        let config = LifecycleConfig::default();
        let mut c = chunk("hot", "x", 0.98, NOW - DAY);
        c.access_count = 7;
        c.last_accessed = Some(NOW - DAY);
        let mut chunks = vec![c];

        let mut r = Reflector::new(&config, NOW);
        assert_eq!(r.reinforce(&mut chunks).reinforced, 1);
        assert_eq!(chunks[0].confidence, 1.0);

        let mut r = Reflector::new(&config, NOW + DAY);
        assert_eq!(r.reinforce(&mut chunks).reinforced, 0);
    }

    #[test]
    fn test_reinforce_revives_outdated() {
        let config = LifecycleConfig::default();
        let mut c = chunk("revived", "x", 0.28, NOW - DAY);
        c.chunk_type = ChunkType::Outdated;
        c.lifecycle.prior_type = Some(ChunkType::Decision);
        c.lifecycle.stale_since = Some(NOW - 5 * DAY);
        c.access_count = 5;
        c.last_accessed = Some(NOW - DAY);
        let mut chunks = vec![c];
        Reflector::new(&config, NOW).reinforce(&mut chunks);
        assert_eq!(chunks[0].chunk_type, ChunkType::Decision);
        assert_eq!(chunks[0].lifecycle.stale_since, None);
    }

    #[test]
    fn test_stale_marking_remembers_prior_type() {
        let config = LifecycleConfig::default();
        let mut low = chunk("low", "x", 0.2, NOW);
        low.chunk_type = ChunkType::Preference;
        let mut chunks = vec![low, chunk("ok", "y", 0.5, NOW)];
        let report = Reflector::new(&config, NOW).mark_stale(&mut chunks);
        assert_eq!(report.marked, 1);
        assert_eq!(chunks[0].chunk_type, ChunkType::Outdated);
        assert_eq!(chunks[0].lifecycle.prior_type, Some(ChunkType::Preference));
        assert_eq!(chunks[0].lifecycle.stale_since, Some(NOW));
    }

    #[test]
    fn test_prune_after_grace() {
        let config = LifecycleConfig::default();
        let mut expired = chunk("expired", "x", 0.1, 0);
        expired.chunk_type = ChunkType::Outdated;
        expired.lifecycle.stale_since = Some(NOW - 31 * DAY);
        let mut recent = chunk("recent", "x", 0.1, 0);
        recent.chunk_type = ChunkType::Outdated;
        recent.lifecycle.stale_since = Some(NOW - 2 * DAY);
        let mut tagged = chunk("tagged", "x", 0.1, 0);
        tagged.chunk_type = ChunkType::Outdated;

        let r = Reflector::new(&config, NOW);
        assert_eq!(r.prune_candidates(&[expired, recent, tagged]), vec!["expired"]);
    }

    #[test]
    fn test_negation_contradiction() {
        let chunks = vec![
            with_entity(chunk("b", "Sam is vegetarian.", 0.6, 0), "Sam"),
            with_entity(chunk("a", "Sam is not vegetarian.", 0.6, 0), "Sam"),
        ];
        let pairs = detect_contradictions(&chunks);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].chunk_a, "a");
        assert_eq!(pairs[0].chunk_b, "b");
        assert_eq!(pairs[0].entity, "sam");
        assert_eq!(pairs[0].reason, "negation");
    }

    #[test]
    fn test_antonym_contradiction() {
        let chunks = vec![
            with_entity(chunk("a", "Some intro. Sam likes spicy food.", 0.6, 0), "Sam"),
            with_entity(chunk("b", "Sam dislikes spicy food", 0.6, 0), "Sam"),
        ];
        let pairs = detect_contradictions(&chunks);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].reason, "antonyms likes/dislikes");
    }

    #[test]
    fn test_no_contradiction_without_shared_entity() {
        let chunks = vec![
            with_entity(chunk("a", "Sam is vegetarian.", 0.6, 0), "Sam"),
            with_entity(chunk("b", "Sam is not vegetarian.", 0.6, 0), "Jo"),
        ];
        assert!(detect_contradictions(&chunks).is_empty());
    }

    #[test]
    fn test_outdated_chunks_skip_contradictions() {
        let mut old = with_entity(chunk("a", "Sam is vegetarian.", 0.2, 0), "Sam");
        old.chunk_type = ChunkType::Outdated;
        let chunks = vec![old, with_entity(chunk("b", "Sam is not vegetarian.", 0.6, 0), "Sam")];
        assert!(detect_contradictions(&chunks).is_empty());
    }

    async fn seeded_store() -> InMemoryStore {
        let store = InMemoryStore::new();
        let mut idle = chunk("idle", "old note", 0.32, NOW - 100 * DAY);
        idle.file_path = "a.md".into();
        let mut fresh = chunk("fresh", "new note", 0.6, NOW);
        fresh.file_path = "a.md".into();
        store
            .replace_file(
                &FileRecord {
                    path: "a.md".into(),
                    mtime: 1,
                },
                &[idle, fresh],
            )
            .await
            .unwrap();
        store
    }

    fn at(ms: Millis) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[tokio::test]
    async fn test_dry_run_matches_real_run_counts() {
        let store = seeded_store().await;
        let config = LifecycleConfig::default();

        let dry = reflect(&store, &config, ReflectOptions { dry_run: true }, at(NOW)).await.unwrap();
        let untouched = store.file_chunks("a.md").await.unwrap();
        assert_eq!(untouched[0].confidence, 0.32);

        let real = reflect(&store, &config, ReflectOptions { dry_run: false }, at(NOW)).await.unwrap();
        assert_eq!(dry.decay, real.decay);
        assert_eq!(dry.stale, real.stale);
        assert_eq!(real.decay.decayed, 1);
        assert_eq!(real.stale.marked, 1);

        let stored = store.file_chunks("a.md").await.unwrap();
        assert_eq!(stored[0].chunk_type, ChunkType::Outdated);
        assert!(stored[0].confidence < 0.3);
        assert_eq!(stored[1].confidence, 0.6);
    }

    #[tokio::test]
    async fn test_prune_archives_after_grace() {
        let store = seeded_store().await;
        let config = LifecycleConfig::default();
        reflect(&store, &config, ReflectOptions::default(), at(NOW)).await.unwrap();

        let later = reflect(&store, &config, ReflectOptions::default(), at(NOW + 31 * DAY))
            .await
            .unwrap();
        assert_eq!(later.prune.archived, 1);
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.archived, 1);
        assert_eq!(stats.chunks, 1);
    }

    #[tokio::test]
    async fn test_disabled_steps_report_zero() {
        let store = seeded_store().await;
        let config = LifecycleConfig {
            decay: false,
            stale: false,
            prune_mode: PruneMode::Delete,
            ..Default::default()
        };
        let report = reflect(&store, &config, ReflectOptions::default(), at(NOW)).await.unwrap();
        assert_eq!(report.decay.decayed, 0);
        assert_eq!(report.stale.marked, 0);
    }
}
