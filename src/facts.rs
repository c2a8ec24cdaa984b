//! Structured fact segmenter.
//!
//! A fact file is a JSON array of [`AtomicFact`]s living at
//! `<category>/<entity>/<fact_file_name>`. Active facts are batched in
//! source order, five per chunk, and every chunk is typed `confirmed` at
//! 0.9 by construction. Superseded facts never reach the index.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::chunk::Segment;
use crate::entities::{extract_with, EntityRule};
use crate::models::{AtomicFact, ChunkType, FactStatus, TypeAssignment};

pub const FACT_BATCH_SIZE: usize = 5;

pub const FACT_TYPING: TypeAssignment = TypeAssignment {
    chunk_type: ChunkType::Confirmed,
    confidence: 0.9,
};

static ID_FIELD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""id"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap());
static CAPITALIZED_PHRASE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z][a-z]+(?:[ \t]+[A-Z][a-z]+)+\b").unwrap());

const PHRASE_STOP_WORDS: &[&str] = &[
    "The", "This", "That", "These", "Those", "When", "Where", "What", "Why", "How", "Who", "And",
    "But", "Also", "Then", "After", "Before", "Since", "If", "In", "On", "At", "For", "From",
    "With", "It", "He", "She", "They", "We", "A", "An",
];

/// Split a fact file into batched segments.
///
/// `file_path` is the workspace-relative path; its parent directory names
/// the entity and the grandparent names the category.
pub fn segment_facts(file_path: &str, raw: &str) -> Result<Vec<Segment>, serde_json::Error> {
    let facts: Vec<AtomicFact> = serde_json::from_str(raw)?;
    let active: Vec<&AtomicFact> = facts
        .iter()
        .filter(|f| f.status == FactStatus::Active)
        .collect();
    if active.is_empty() {
        return Ok(Vec::new());
    }

    let (entity, category) = entity_and_category(file_path);
    let heading = if category.is_empty() {
        entity.clone()
    } else {
        format!("{} ({})", entity, category)
    };

    let id_lines = id_line_numbers(raw);
    let last_line = raw.trim_end().lines().count().max(1);
    let batches: Vec<&[&AtomicFact]> = active.chunks(FACT_BATCH_SIZE).collect();
    // an id missing from the raw text starts where the previous batch did
    let mut starts: Vec<usize> = Vec::with_capacity(batches.len());
    for batch in &batches {
        let prev = starts.last().copied().unwrap_or(1);
        let line = id_lines.get(batch[0].id.as_str()).copied();
        starts.push(line.map_or(prev, |l| l.max(prev)));
    }

    let mut segments = Vec::with_capacity(batches.len());
    for (i, batch) in batches.iter().enumerate() {
        let line_start = starts[i];
        let line_end = match starts.get(i + 1) {
            Some(next) => next.saturating_sub(1).max(line_start),
            None => last_line.max(line_start),
        };

        let mut content = format!("## {}", heading);
        for fact in batch.iter() {
            let fact_category = if fact.category.is_empty() {
                category.as_str()
            } else {
                fact.category.as_str()
            };
            content.push_str(&format!(
                "\n- [{}] {} (category: {}, {})",
                fact.id, fact.fact, fact_category, fact.timestamp
            ));
        }

        segments.push(Segment {
            heading: Some(heading.clone()),
            content,
            line_start,
            line_end,
            entities: batch_entities(&entity, batch),
            pre_typed: Some(FACT_TYPING),
        });
    }
    Ok(segments)
}

fn entity_and_category(file_path: &str) -> (String, String) {
    let path = Path::new(file_path);
    let name_of = |p: Option<&Path>| {
        p.and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    let parent = path.parent();
    (name_of(parent), name_of(parent.and_then(|p| p.parent())))
}

/// 1-based line of each fact id's first appearance in the raw JSON, keyed
/// by the decoded id.
fn id_line_numbers(raw: &str) -> HashMap<String, usize> {
    let mut lines = HashMap::new();
    for cap in ID_FIELD_RE.captures_iter(raw) {
        let (Some(whole), Some(id)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        let Ok(id) = serde_json::from_str::<String>(&format!("\"{}\"", id.as_str())) else {
            continue;
        };
        let line = raw[..whole.start()].bytes().filter(|b| *b == b'\n').count() + 1;
        lines.entry(id).or_insert(line);
    }
    lines
}

fn batch_entities(entity: &str, batch: &[&AtomicFact]) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    if !entity.is_empty() {
        out.insert(entity.to_string());
    }
    for fact in batch {
        out.extend(extract_with(&[EntityRule::Emphasis], &fact.fact));
        out.extend(capitalized_phrases(&fact.fact));
    }
    out
}

/// Multi-word Title Case runs, with leading stop-words peeled off.
fn capitalized_phrases(text: &str) -> Vec<String> {
    CAPITALIZED_PHRASE_RE
        .find_iter(text)
        .filter_map(|m| {
            let words: Vec<&str> = m
                .as_str()
                .split_whitespace()
                .skip_while(|w| PHRASE_STOP_WORDS.contains(w))
                .collect();
            (words.len() >= 2).then(|| words.join(" "))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact_file(active: usize, superseded: usize) -> String {
        let mut items = Vec::new();
        for i in 0..active {
            items.push(format!(
                "  {{\n    \"id\": \"a{i}\",\n    \"fact\": \"Works with New Horizons team on item {i}\",\n    \"category\": \"work\",\n    \"timestamp\": \"2025-01-0{d}\",\n    \"status\": \"active\"\n  }}",
                i = i,
                d = i % 9 + 1
            ));
        }
        for i in 0..superseded {
            items.push(format!(
                "  {{\n    \"id\": \"s{i}\",\n    \"fact\": \"Old claim {i}\",\n    \"status\": \"superseded\",\n    \"supersededBy\": \"a0\"\n  }}",
                i = i
            ));
        }
        format!("[\n{}\n]\n", items.join(",\n"))
    }

    #[test]
    fn test_batches_active_facts_only() {
        let raw = fact_file(12, 3);
        let segs = segment_facts("life/people/jane/items.json", &raw).unwrap();
        assert_eq!(segs.len(), 3);
        let sizes: Vec<usize> = segs.iter().map(|s| s.content.lines().count() - 1).collect();
        assert_eq!(sizes, vec![5, 5, 2]);
        for seg in &segs {
            assert_eq!(seg.pre_typed, Some(FACT_TYPING));
            assert!(!seg.content.contains("Old claim"));
        }
    }

    #[test]
    fn test_body_format_and_heading() {
        let raw = fact_file(1, 0);
        let segs = segment_facts("people/jane/items.json", &raw).unwrap();
        assert_eq!(segs[0].heading.as_deref(), Some("jane (people)"));
        assert_eq!(
            segs[0].content,
            "## jane (people)\n- [a0] Works with New Horizons team on item 0 (category: work, 2025-01-01)"
        );
    }

    #[test]
    fn test_line_ranges_follow_json_ids() {
        let raw = fact_file(7, 0);
        let segs = segment_facts("people/jane/items.json", &raw).unwrap();
        assert_eq!(segs.len(), 2);
        // each fact object spans 7 lines, the array opens on line 1
        assert_eq!(segs[0].line_start, 3);
        assert_eq!(segs[1].line_start, 3 + 5 * 7);
        assert_eq!(segs[0].line_end, segs[1].line_start - 1);
        assert_eq!(segs[1].line_end, raw.trim_end().lines().count());
    }

    #[test]
    fn test_escaped_ids_keep_their_lines() {
        let mut items: Vec<String> = (0..5)
            .map(|i| format!(r#"  {{"id": "p{}", "fact": "Plain fact {}"}}"#, i, i))
            .collect();
        items.push(r#"  {"id": "q\"1A", "fact": "Quoted id fact"}"#.to_string());
        let raw = format!("[\n{}\n]\n", items.join(",\n"));

        let segs = segment_facts("people/jane/items.json", &raw).unwrap();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].line_start, 2);
        assert_eq!(segs[0].line_end, 6);
        assert_eq!(segs[1].line_start, 7);
        assert!(segs[1].content.contains("[q\"1A]"));
    }

    #[test]
    fn test_entities_include_name_and_phrases() {
        let raw = r#"[{"id": "x", "fact": "The Blue Bottle cafe is her pick, see **latte art**"}]"#;
        let segs = segment_facts("people/jane/items.json", raw).unwrap();
        let ents = &segs[0].entities;
        assert!(ents.contains("jane"));
        assert!(ents.contains("Blue Bottle"));
        assert!(ents.contains("latte art"));
        assert!(!ents.iter().any(|e| e.starts_with("The ")));
    }

    #[test]
    fn test_all_superseded_yields_nothing() {
        let raw = fact_file(0, 4);
        assert!(segment_facts("people/jane/items.json", &raw).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_is_error() {
        assert!(segment_facts("people/jane/items.json", "{not json").is_err());
    }
}
