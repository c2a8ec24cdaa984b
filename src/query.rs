//! Query preprocessing.
//!
//! Turns raw query text into a [`PreparedQuery`]: noise-stripped text, an
//! [`Intent`], an optional [`TemporalFilter`] and the lexical terms handed
//! to the store. All date arithmetic is UTC, matching how dated notes are
//! stamped at index time.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::entities::{entity_key, extract_entities};
use crate::error::{MemoryError, Result};
use crate::models::{Millis, MILLIS_PER_DAY};

static CODE_FENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```.*?```|~~~.*?~~~").unwrap());
static TAG_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<[A-Za-z][\w-]*[^>]*>.*?</[A-Za-z][\w-]*\s*>").unwrap());
static ENVELOPE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:\s*\[[^\]\n]*\])+\s*").unwrap());
static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\p{L}\p{N}_]+").unwrap());

static ISO_DATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").unwrap());
static DAYS_AGO_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{1,4})\s+days?\s+ago\b").unwrap());
static LAST_N_DAYS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:last|past)\s+(\d{1,4})\s+days?\b").unwrap());
static RELATIVE_PERIOD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(this|last|next)\s+(week|month|year)\b").unwrap());
static DAY_WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(today|yesterday|tomorrow)\b").unwrap());
static MONTH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(in|of|during|by|until)?\s*\b(january|february|march|april|may|june|july|august|september|october|november|december)\b(?:\s+(\d{4}))?",
    )
    .unwrap()
});
static SINCE_RELATIVE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)\s*([hdwmy])$").unwrap());

const MONTHS: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "is", "are", "was", "were", "be", "been", "am", "do",
    "does", "did", "i", "me", "my", "we", "our", "you", "your", "he", "she", "it", "its", "they",
    "them", "their", "what", "whats", "which", "who", "whom", "when", "where", "why", "how", "s",
    "t", "of", "in", "on", "at", "to", "for", "from", "with", "by", "about", "as", "into", "that",
    "this", "these", "those", "there", "here", "have", "has", "had", "will", "would", "should",
    "can", "could", "any", "all", "some", "so", "if", "then", "than", "not", "no", "up", "out",
    "tell", "know", "please", "list", "every", "get", "got",
];

const TEMPORAL_WORDS: &[&str] = &[
    "today", "yesterday", "tomorrow", "week", "weeks", "month", "months", "year", "years", "day",
    "days", "last", "next", "ago", "past", "recent", "recently", "coming", "upcoming", "planned",
    "scheduled", "ahead", "future", "previous", "happened", "since", "until", "during",
];

const FORWARD_WORDS: &[&str] = &["coming", "upcoming", "will", "planned", "scheduled", "ahead", "future"];
const BACKWARD_WORDS: &[&str] = &["last", "ago", "happened", "did", "was", "previous", "past", "recent"];
/// Forward phrasing that opens a `[now, ∞)` window without a named period.
/// Modal verbs alone ("will", "planned") only clamp a named period.
const SCHEDULE_PHRASES: &[&str] = &[
    "upcoming",
    "coming up",
    "whats coming",
    "what is coming",
    "scheduled for",
    "whats ahead",
    "what is ahead",
];
const RULE_WORDS: &[&str] = &[
    "rule", "rules", "policy", "policies", "always", "never", "must", "guideline", "guidelines",
    "convention", "conventions",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Aggregation,
    Reasoning,
    Action,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
    Neutral,
}

/// A `created_at` window derived from the query text. Ends are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemporalFilter {
    pub start: Option<Millis>,
    pub end: Option<Millis>,
    /// Fetch in-range chunks as candidates even without a lexical match.
    /// False for a bare backward phrase, which only excludes the future.
    pub fetch_by_date: bool,
}

impl TemporalFilter {
    pub fn contains(&self, at: Millis) -> bool {
        self.start.map_or(true, |s| at >= s) && self.end.map_or(true, |e| at <= e)
    }
}

#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub text: String,
    pub intent: Intent,
    pub temporal: Option<TemporalFilter>,
    /// Lower-cased lexical terms, stop-words and temporal words removed.
    pub terms: Vec<String>,
    /// Entity comparison keys: extracted entities plus terms, owner removed.
    pub entity_keys: BTreeSet<String>,
    pub mentions_rules: bool,
}

pub fn prepare(raw: &str, owner: Option<&str>, now: DateTime<Utc>) -> PreparedQuery {
    let text = strip_noise(raw);
    let lower = text.to_lowercase();
    let words = words(&lower);

    let terms = lexical_terms(&words);
    let mut entity_keys: BTreeSet<String> = extract_entities(&text)
        .iter()
        .map(|e| entity_key(e))
        .collect();
    entity_keys.extend(terms.iter().cloned());
    if let Some(owner) = owner {
        entity_keys.remove(&entity_key(owner));
    }

    PreparedQuery {
        intent: classify_intent(&lower),
        temporal: parse_temporal(&lower, now),
        mentions_rules: words.iter().any(|w| RULE_WORDS.contains(&w.as_str())),
        terms,
        entity_keys,
        text,
    }
}

/// Remove code fences, `<tag>…</tag>` blocks, `>` quoted lines and leading
/// `[...]` envelopes, then collapse whitespace.
pub fn strip_noise(raw: &str) -> String {
    let without_fences = CODE_FENCE_RE.replace_all(raw, " ");
    let without_tags = TAG_BLOCK_RE.replace_all(&without_fences, " ");
    let kept: Vec<String> = without_tags
        .lines()
        .filter(|line| !line.trim_start().starts_with('>'))
        .map(|line| ENVELOPE_RE.replace(line, "").into_owned())
        .collect();
    kept.join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn words(lower: &str) -> Vec<String> {
    TOKEN_RE
        .find_iter(&lower.replace('\'', ""))
        .map(|m| m.as_str().to_string())
        .collect()
}

fn lexical_terms(words: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    words
        .iter()
        .filter(|w| {
            !STOP_WORDS.contains(&w.as_str())
                && !TEMPORAL_WORDS.contains(&w.as_str())
                && !MONTHS.contains(&w.as_str())
                && !w.chars().all(|c| c.is_ascii_digit())
        })
        .filter(|w| seen.insert(w.to_string()))
        .cloned()
        .collect()
}

fn has_phrase(padded: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|p| padded.contains(&format!(" {} ", p)))
}

/// Alphanumeric words joined by single spaces, with a space at each end.
fn padded(lower: &str) -> String {
    let normalized: String = lower
        .replace('\'', "")
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    format!(" {} ", normalized.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Reasoning is checked first, then action, then aggregation.
pub fn classify_intent(lower: &str) -> Intent {
    let padded = padded(lower);

    if has_phrase(
        &padded,
        &["why", "because", "reason", "reasons", "rationale", "what led", "how come"],
    ) {
        Intent::Reasoning
    } else if has_phrase(
        &padded,
        &[
            "next step",
            "next steps",
            "todo",
            "to do",
            "what should",
            "should i",
            "action item",
            "action items",
            "follow up",
            "plan to",
        ],
    ) {
        Intent::Action
    } else if has_phrase(
        &padded,
        &["list", "all", "every", "what are", "summarize", "summary", "overview", "how many"],
    ) {
        Intent::Aggregation
    } else {
        Intent::Neutral
    }
}

fn direction(lower: &str) -> Direction {
    let words = words(lower);
    let has = |set: &[&str]| words.iter().any(|w| set.contains(&w.as_str()));
    match (has(FORWARD_WORDS), has(BACKWARD_WORDS)) {
        (true, false) => Direction::Forward,
        (false, true) => Direction::Backward,
        // mixed phrasing clamps nothing
        _ => Direction::Neutral,
    }
}

fn day_start(date: NaiveDate) -> Millis {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default())
        .timestamp_millis()
}

fn day_range(date: NaiveDate) -> (Millis, Millis) {
    let start = day_start(date);
    (start, start + MILLIS_PER_DAY - 1)
}

fn month_range(year: i32, month: u32) -> Option<(Millis, Millis)> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some((day_start(first), day_start(next) - 1))
}

/// The period named in the text, if any, before direction clamping.
fn named_period(lower: &str, direction: Direction, now: DateTime<Utc>) -> Option<(Millis, Millis)> {
    let today = now.date_naive();

    if let Some(cap) = ISO_DATE_RE.captures(lower) {
        let date = NaiveDate::from_ymd_opt(cap[1].parse().ok()?, cap[2].parse().ok()?, cap[3].parse().ok()?)?;
        return Some(day_range(date));
    }
    if let Some(cap) = DAYS_AGO_RE.captures(lower) {
        let n: i64 = cap[1].parse().ok()?;
        return Some(day_range(today - Duration::days(n)));
    }
    if let Some(cap) = LAST_N_DAYS_RE.captures(lower) {
        let n: i64 = cap[1].parse().ok()?;
        let now_ms = now.timestamp_millis();
        return Some((now_ms - n * MILLIS_PER_DAY, now_ms));
    }
    if let Some(cap) = DAY_WORD_RE.captures(lower) {
        let date = match &cap[1] {
            "yesterday" => today - Duration::days(1),
            "tomorrow" => today + Duration::days(1),
            _ => today,
        };
        return Some(day_range(date));
    }
    if let Some(cap) = RELATIVE_PERIOD_RE.captures(lower) {
        let offset: i32 = match &cap[1] {
            "last" => -1,
            "next" => 1,
            _ => 0,
        };
        return match &cap[2] {
            "week" => {
                let monday = today - Duration::days(today.weekday().num_days_from_monday() as i64);
                let start = monday + Duration::weeks(offset as i64);
                Some((day_start(start), day_start(start + Duration::weeks(1)) - 1))
            }
            "month" => {
                let index = today.year() * 12 + today.month0() as i32 + offset;
                month_range(index.div_euclid(12), index.rem_euclid(12) as u32 + 1)
            }
            _ => {
                let year = today.year() + offset;
                let (start, _) = month_range(year, 1)?;
                let (_, end) = month_range(year, 12)?;
                Some((start, end))
            }
        };
    }
    for cap in MONTH_RE.captures_iter(lower) {
        let name = &cap[2];
        let month = MONTHS.iter().position(|m| *m == name)? as u32 + 1;
        let year = cap.get(3).and_then(|y| y.as_str().parse::<i32>().ok());
        // "may" is only a month with a preposition or a year
        if name == "may" && cap.get(1).is_none() && year.is_none() {
            continue;
        }
        let year = year.unwrap_or_else(|| match direction {
            Direction::Forward if month < today.month() => today.year() + 1,
            Direction::Forward => today.year(),
            _ if month > today.month() => today.year() - 1,
            _ => today.year(),
        });
        return month_range(year, month);
    }
    None
}

/// Detect temporal qualifiers and turn them into a `created_at` window.
///
/// Forward phrasing clamps a named period to start no earlier than `now`;
/// backward phrasing to end no later than `now`. Without a named period
/// only a scheduling phrase ("upcoming", "coming up") opens a window.
pub fn parse_temporal(lower: &str, now: DateTime<Utc>) -> Option<TemporalFilter> {
    let direction = direction(lower);
    let now_ms = now.timestamp_millis();

    match named_period(lower, direction, now) {
        Some((start, end)) => {
            let (start, end) = match direction {
                Direction::Forward => (start.max(now_ms), end),
                Direction::Backward => (start, end.min(now_ms)),
                Direction::Neutral => (start, end),
            };
            Some(TemporalFilter {
                start: Some(start),
                end: Some(end),
                fetch_by_date: true,
            })
        }
        None => match direction {
            Direction::Forward if has_phrase(&padded(lower), SCHEDULE_PHRASES) => Some(TemporalFilter {
                start: Some(now_ms),
                end: None,
                fetch_by_date: true,
            }),
            Direction::Backward => Some(TemporalFilter {
                start: None,
                end: Some(now_ms),
                fetch_by_date: false,
            }),
            Direction::Forward | Direction::Neutral => None,
        },
    }
}

/// Parse a `since` filter into a lower bound on `created_at`.
pub fn parse_since(value: &str, now: DateTime<Utc>) -> Result<Millis> {
    let trimmed = value.trim();
    let lower = trimmed.to_ascii_lowercase();
    let today = now.date_naive();

    match lower.as_str() {
        "today" => return Ok(day_start(today)),
        "yesterday" => return Ok(day_start(today - Duration::days(1))),
        _ => {}
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(day_start(date));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.timestamp_millis());
    }
    if let Some(cap) = SINCE_RELATIVE_RE.captures(&lower) {
        let n: i64 = cap[1]
            .parse()
            .map_err(|_| MemoryError::query_filter("since", value))?;
        let unit_ms = match &cap[2] {
            "h" => 3_600_000,
            "d" => MILLIS_PER_DAY,
            "w" => 7 * MILLIS_PER_DAY,
            "m" => 30 * MILLIS_PER_DAY,
            _ => 365 * MILLIS_PER_DAY,
        };
        let span = n
            .checked_mul(unit_ms)
            .ok_or_else(|| MemoryError::query_filter("since", value))?;
        return Ok(now.timestamp_millis() - span);
    }
    Err(MemoryError::query_filter("since", value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn ms(y: i32, m: u32, d: u32) -> Millis {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap().timestamp_millis()
    }

    #[test]
    fn test_strip_noise() {
        let raw = "[Telegram 2025-01-01 10:00] what did we pick?\n> quoted reply\n```\ncode here\n```\n<meta>ignore me</meta> for the database";
        assert_eq!(strip_noise(raw), "what did we pick? for the database");
    }

    #[test]
    fn test_classify_intent() {
        assert_eq!(classify_intent("list all my projects"), Intent::Aggregation);
        assert_eq!(classify_intent("why did we choose postgres"), Intent::Reasoning);
        assert_eq!(classify_intent("what's the next step on the launch"), Intent::Action);
        assert_eq!(classify_intent("postgres version"), Intent::Neutral);
        // substring of a word does not count
        assert_eq!(classify_intent("the allocation plan"), Intent::Neutral);
    }

    #[test]
    fn test_terms_drop_stop_and_temporal_words() {
        let q = prepare("What did we decide about Postgres last week?", None, at(2025, 6, 11));
        assert_eq!(q.terms, vec!["decide", "postgres"]);
        assert!(q.temporal.is_some());
    }

    #[test]
    fn test_owner_excluded_from_entity_keys() {
        let q = prepare("what does @sam think of AWS", Some("Sam"), at(2025, 6, 11));
        assert!(q.entity_keys.contains("aws"));
        assert!(!q.entity_keys.contains("sam"));
    }

    #[test]
    fn test_yesterday_and_today() {
        let now = at(2025, 6, 11);
        let f = parse_temporal("what happened yesterday", now).unwrap();
        assert_eq!(f.start, Some(ms(2025, 6, 10)));
        assert_eq!(f.end, Some(ms(2025, 6, 11) - 1));
        let f = parse_temporal("notes from today", now).unwrap();
        assert_eq!(f.start, Some(ms(2025, 6, 11)));
    }

    #[test]
    fn test_last_week_is_previous_calendar_week() {
        // 2025-06-11 is a Wednesday
        let f = parse_temporal("what did i ship last week", at(2025, 6, 11)).unwrap();
        assert_eq!(f.start, Some(ms(2025, 6, 2)));
        assert_eq!(f.end, Some(ms(2025, 6, 9) - 1));
    }

    #[test]
    fn test_forward_month_is_next_occurrence() {
        let now = at(2025, 6, 11);
        let f = parse_temporal("what's coming in march", now).unwrap();
        assert_eq!(f.start, Some(ms(2026, 3, 1)));
        assert_eq!(f.end, Some(ms(2026, 4, 1) - 1));
        assert!(f.fetch_by_date);
    }

    #[test]
    fn test_backward_month_is_latest_past() {
        let f = parse_temporal("what happened in march", at(2025, 6, 11)).unwrap();
        assert_eq!(f.start, Some(ms(2025, 3, 1)));
        let f = parse_temporal("what happened in september", at(2025, 6, 11)).unwrap();
        assert_eq!(f.start, Some(ms(2024, 9, 1)));
    }

    #[test]
    fn test_month_with_year_and_may_guard() {
        let f = parse_temporal("budget for march 2023", at(2025, 6, 11)).unwrap();
        assert_eq!(f.start, Some(ms(2023, 3, 1)));
        assert!(parse_temporal("may i ask about postgres", at(2025, 6, 11)).is_none());
        assert!(parse_temporal("plans in may", at(2025, 6, 11)).is_some());
    }

    #[test]
    fn test_bare_forward_is_open_ended() {
        let now = at(2025, 6, 11);
        let f = parse_temporal("anything upcoming", now).unwrap();
        assert_eq!(f.start, Some(now.timestamp_millis()));
        assert_eq!(f.end, None);
        assert!(parse_temporal("postgres version", now).is_none());
        let f = parse_temporal("what's coming up for the launch", now).unwrap();
        assert_eq!(f.end, None);
    }

    #[test]
    fn test_modal_verbs_alone_set_no_window() {
        let now = at(2025, 6, 11);
        assert!(parse_temporal("what will we use for billing", now).is_none());
        assert!(parse_temporal("what is planned for billing", now).is_none());
        assert!(parse_temporal("anything ahead for the future of billing", now).is_none());
    }

    #[test]
    fn test_modal_verb_clamps_named_period() {
        let now = at(2025, 6, 11);
        let f = parse_temporal("what is planned for march", now).unwrap();
        assert_eq!(f.start, Some(ms(2026, 3, 1)));
        let f = parse_temporal("what will happen next week", now).unwrap();
        assert_eq!(f.start, Some(ms(2025, 6, 16)));
    }

    #[test]
    fn test_mixed_direction_does_not_clamp() {
        let now = at(2025, 6, 11);
        let f = parse_temporal("what did we say will ship in march", now).unwrap();
        // neutral direction resolves the month to its latest past occurrence, unclamped
        assert_eq!(f.start, Some(ms(2025, 3, 1)));
        assert_eq!(f.end, Some(ms(2025, 4, 1) - 1));
        assert!(parse_temporal("what did we say will ship", now).is_none());
    }

    #[test]
    fn test_parse_since_forms() {
        let now = at(2025, 6, 11);
        let now_ms = now.timestamp_millis();
        assert_eq!(parse_since("2025-06-01", now).unwrap(), ms(2025, 6, 1));
        assert_eq!(parse_since("7d", now).unwrap(), now_ms - 7 * MILLIS_PER_DAY);
        assert_eq!(parse_since("2w", now).unwrap(), now_ms - 14 * MILLIS_PER_DAY);
        assert_eq!(parse_since("yesterday", now).unwrap(), ms(2025, 6, 10));
        assert_eq!(
            parse_since("2025-06-01T00:00:00Z", now).unwrap(),
            ms(2025, 6, 1)
        );
    }

    #[test]
    fn test_parse_since_rejects_garbage() {
        match parse_since("next tuesday-ish", at(2025, 6, 11)) {
            Err(MemoryError::QueryFilter { field, value }) => {
                assert_eq!(field, "since");
                assert_eq!(value, "next tuesday-ish");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
