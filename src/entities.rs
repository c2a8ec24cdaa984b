//! Heuristic entity extraction.
//!
//! Six independent rules run over a text span and their matches are unioned
//! into a sorted set:
//!
//! | Rule | Example |
//! |------|---------|
//! | [`EntityRule::Mention`] | `@sam` |
//! | [`EntityRule::Emphasis`] | `**Project Atlas**` |
//! | [`EntityRule::Acronym`] | `AWS` (skip-list excludes `OK`, `US`, `AM`, ...) |
//! | [`EntityRule::Ticker`] | `$NVDA` |
//! | [`EntityRule::QuotedPhrase`] | `"ship it friday"` (3–50 chars) |
//! | [`EntityRule::Url`] | `https://example.com/a` |
//!
//! Extraction is pure and deterministic; both segmenters and the query path
//! call the same functions.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

static MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^\w.@])@([A-Za-z0-9_][A-Za-z0-9_-]{0,38})").unwrap());
static EMPHASIS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*([^*\n]{1,80}?)\*\*").unwrap());
static ACRONYM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z][A-Z0-9]{1,9}\b").unwrap());
static TICKER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$([A-Z]{1,6})\b").unwrap());
static CURLY_QUOTED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"“([^”\n]+)”").unwrap());
static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"https?://[^\s<>()"'\]\[]+"#).unwrap());

/// Short uppercase words that are not acronyms worth indexing.
const ACRONYM_SKIP: &[&str] = &[
    "OK", "US", "AM", "PM", "AN", "AS", "AT", "BE", "BY", "DO", "GO", "HE", "IF", "IN", "IS", "IT",
    "ME", "MY", "NO", "OF", "OH", "ON", "OR", "SO", "TO", "UP", "WE", "THE", "AND", "FOR", "BUT",
    "NOT", "YES", "ALL", "ANY", "ARE", "WAS", "TBD", "FYI", "ETA", "TODO", "NOTE",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityRule {
    Mention,
    Emphasis,
    Acronym,
    Ticker,
    QuotedPhrase,
    Url,
}

impl EntityRule {
    pub const ALL: [EntityRule; 6] = [
        EntityRule::Mention,
        EntityRule::Emphasis,
        EntityRule::Acronym,
        EntityRule::Ticker,
        EntityRule::QuotedPhrase,
        EntityRule::Url,
    ];

    /// Add this rule's matches in `text` to `out`.
    pub fn extract_into(&self, text: &str, out: &mut BTreeSet<String>) {
        match self {
            EntityRule::Mention => {
                for cap in MENTION_RE.captures_iter(text) {
                    out.insert(format!("@{}", &cap[1]));
                }
            }
            EntityRule::Emphasis => {
                for cap in EMPHASIS_RE.captures_iter(text) {
                    let term = cap[1].trim();
                    if !term.is_empty() {
                        out.insert(term.to_string());
                    }
                }
            }
            EntityRule::Acronym => {
                for m in ACRONYM_RE.find_iter(text) {
                    if !ACRONYM_SKIP.contains(&m.as_str()) {
                        out.insert(m.as_str().to_string());
                    }
                }
            }
            EntityRule::Ticker => {
                for cap in TICKER_RE.captures_iter(text) {
                    out.insert(format!("${}", &cap[1]));
                }
            }
            EntityRule::QuotedPhrase => {
                // Straight quotes pair up in order within a line; an unclosed
                // trailing quote opens nothing.
                for line in text.lines() {
                    let segments: Vec<&str> = line.split('"').collect();
                    for i in (1..segments.len().saturating_sub(1)).step_by(2) {
                        insert_phrase(segments[i], out);
                    }
                }
                for cap in CURLY_QUOTED_RE.captures_iter(text) {
                    insert_phrase(&cap[1], out);
                }
            }
            EntityRule::Url => {
                for m in URL_RE.find_iter(text) {
                    let url = m
                        .as_str()
                        .trim_end_matches(|c: char| ".,;:!?".contains(c));
                    out.insert(url.to_string());
                }
            }
        }
    }
}

fn insert_phrase(phrase: &str, out: &mut BTreeSet<String>) {
    let phrase = phrase.trim();
    if (3..=50).contains(&phrase.chars().count()) {
        out.insert(phrase.to_string());
    }
}

/// Apply every rule to `text`.
pub fn extract_entities(text: &str) -> BTreeSet<String> {
    extract_with(&EntityRule::ALL, text)
}

/// Apply a subset of rules to `text`.
pub fn extract_with(rules: &[EntityRule], text: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for rule in rules {
        rule.extract_into(text, &mut out);
    }
    out
}

/// Comparison key for entity overlap: lower-cased, without `@`/`$` sigils.
pub fn entity_key(entity: &str) -> String {
    entity
        .trim_start_matches(|c: char| c == '@' || c == '$')
        .trim()
        .to_lowercase()
}
