//! Heading-aware markdown segmenter.
//!
//! Splits a markdown file into [`Segment`]s, one per `#`–`####` section.
//! A section that fits `max_chars` becomes exactly one segment covering its
//! full line range. An oversized section is handed to a chain of
//! [`SplitStrategy`]s (paragraphs, then speaker turns, then sentences):
//! the first strategy yielding at least two units has its units accumulated
//! greedily under the cap, and any group still over the cap falls through to
//! the remaining strategies. A group nothing can divide is emitted whole.
//!
//! Every segment's content is a verbatim, trimmed slice of the source, and
//! its line range is computed from byte offsets, never estimated.

use std::collections::BTreeSet;
use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::entities::extract_entities;
use crate::models::TypeAssignment;

static HEADING_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#{1,4}[ \t]+(\S.*)$").unwrap());
static SPEAKER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:\[\d{1,2}:\d{2}(?::\d{2})?\]\s*)?[A-Za-z][\w .'-]{0,40}?:(?:\s|$)").unwrap()
});
static SENTENCE_END_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]+\s+").unwrap());

/// Sections with fewer non-heading characters than this carry nothing to index.
pub(crate) const MIN_BODY_CHARS: usize = 5;

/// A bounded piece of a source file, before identity and typing are assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub heading: Option<String>,
    pub content: String,
    /// 1-based, inclusive.
    pub line_start: usize,
    pub line_end: usize,
    pub entities: BTreeSet<String>,
    /// Set by segmenters whose output is typed by construction.
    pub pre_typed: Option<TypeAssignment>,
}

/// One way of cutting text into indivisible units.
///
/// Units are byte ranges into the given text, in order and non-overlapping.
/// Returning fewer than two units means the strategy does not apply.
pub trait SplitStrategy: Sync {
    fn name(&self) -> &'static str;
    fn units(&self, text: &str) -> Vec<Range<usize>>;
}

/// Blank-line-delimited paragraphs. A leading heading-only paragraph is
/// attached to the paragraph after it.
pub struct Paragraphs;

/// Lines of the form `Name:` or `[hh:mm(:ss)] Name:` start a turn.
pub struct SpeakerTurns;

/// Text following `.`, `!` or `?` plus whitespace starts a sentence.
pub struct Sentences;

impl SplitStrategy for Paragraphs {
    fn name(&self) -> &'static str {
        "paragraphs"
    }

    fn units(&self, text: &str) -> Vec<Range<usize>> {
        let mut units = Vec::new();
        let mut current: Option<Range<usize>> = None;
        for (offset, line) in line_offsets(text) {
            if line.trim().is_empty() {
                if let Some(run) = current.take() {
                    units.push(run);
                }
                continue;
            }
            let end = offset + line.trim_end_matches(['\r', '\n']).len();
            current = Some(match current {
                Some(run) => run.start..end,
                None => offset..end,
            });
        }
        if let Some(run) = current {
            units.push(run);
        }

        if units.len() >= 2 && is_heading(&text[units[0].clone()]) {
            let second = units.remove(1);
            units[0].end = second.end;
        }
        units
    }
}

impl SplitStrategy for SpeakerTurns {
    fn name(&self) -> &'static str {
        "speaker_turns"
    }

    fn units(&self, text: &str) -> Vec<Range<usize>> {
        let markers: Vec<usize> = line_offsets(text)
            .filter(|(_, line)| SPEAKER_RE.is_match(line))
            .map(|(offset, _)| offset)
            .collect();
        if markers.len() < 2 {
            return Vec::new();
        }

        let mut bounds = Vec::with_capacity(markers.len() + 1);
        if !text[..markers[0]].trim().is_empty() {
            bounds.push(0);
        }
        bounds.extend(markers);

        bounds
            .iter()
            .enumerate()
            .map(|(i, &start)| {
                let end = bounds.get(i + 1).copied().unwrap_or(text.len());
                start..start + text[start..end].trim_end().len()
            })
            .filter(|r| !r.is_empty())
            .collect()
    }
}

impl SplitStrategy for Sentences {
    fn name(&self) -> &'static str {
        "sentences"
    }

    fn units(&self, text: &str) -> Vec<Range<usize>> {
        let mut units = Vec::new();
        let mut start = 0;
        for m in SENTENCE_END_RE.find_iter(text) {
            let end = m.start() + m.as_str().trim_end().len();
            if end > start {
                units.push(start..end);
            }
            start = m.end();
        }
        if start < text.len() && !text[start..].trim().is_empty() {
            units.push(start..text.len());
        }
        units
    }
}

/// The fallback order for oversized sections.
pub static SPLIT_CHAIN: [&dyn SplitStrategy; 3] = [&Paragraphs, &SpeakerTurns, &Sentences];

/// Split markdown `text` into segments no longer than `max_chars`
/// (except indivisible units).
pub fn segment_markdown(text: &str, max_chars: usize) -> Vec<Segment> {
    let lines: Vec<&str> = text.split('\n').collect();
    let mut segments = Vec::new();

    let mut heading: Option<String> = None;
    let mut section_start = 0;
    let mut in_fence = false;

    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(title) = heading_text(line) {
            flush_section(&lines, section_start, idx, heading.take(), max_chars, &mut segments);
            heading = Some(title);
            section_start = idx;
        }
    }
    flush_section(&lines, section_start, lines.len(), heading, max_chars, &mut segments);

    segments
}

fn flush_section(
    lines: &[&str],
    mut start: usize,
    mut end: usize,
    heading: Option<String>,
    max_chars: usize,
    out: &mut Vec<Segment>,
) {
    while start < end && lines[start].trim().is_empty() {
        start += 1;
    }
    while end > start && lines[end - 1].trim().is_empty() {
        end -= 1;
    }
    if start >= end {
        return;
    }

    let body_chars: usize = lines[start..end]
        .iter()
        .filter(|l| !is_heading(l))
        .map(|l| l.trim().chars().count())
        .sum();
    if body_chars < MIN_BODY_CHARS {
        return;
    }

    let text = lines[start..end].join("\n");
    let base_line = start + 1;

    let mut ranges = Vec::new();
    split_oversized(&text, 0..text.len(), &SPLIT_CHAIN, max_chars, &mut ranges);

    for range in ranges {
        let Some(range) = trim_range(&text, range) else {
            continue;
        };
        let content = &text[range.clone()];
        out.push(Segment {
            heading: heading.clone(),
            content: content.to_string(),
            line_start: base_line + count_newlines(&text[..range.start]),
            line_end: base_line + count_newlines(&text[..range.end]),
            entities: extract_entities(content),
            pre_typed: None,
        });
    }
}

/// Divide `range` of `text` with the first applicable strategy, recursing
/// into oversized groups with the strategies after it.
fn split_oversized(
    text: &str,
    range: Range<usize>,
    strategies: &[&dyn SplitStrategy],
    max_chars: usize,
    out: &mut Vec<Range<usize>>,
) {
    let slice = &text[range.clone()];
    if char_len(slice) <= max_chars {
        out.push(range);
        return;
    }

    for (i, strategy) in strategies.iter().enumerate() {
        let units = strategy.units(slice);
        if units.len() < 2 {
            continue;
        }
        tracing::trace!(strategy = strategy.name(), units = units.len(), "splitting oversized text");
        for group in accumulate(slice, &units, max_chars) {
            let absolute = range.start + group.start..range.start + group.end;
            split_oversized(text, absolute, &strategies[i + 1..], max_chars, out);
        }
        return;
    }

    out.push(range);
}

/// Greedily merge consecutive units while the merged slice fits `max_chars`.
fn accumulate(text: &str, units: &[Range<usize>], max_chars: usize) -> Vec<Range<usize>> {
    let mut groups = Vec::new();
    let mut current: Option<Range<usize>> = None;
    for unit in units {
        current = Some(match current {
            None => unit.clone(),
            Some(group) => {
                let merged = group.start..unit.end;
                if char_len(&text[merged.clone()]) > max_chars {
                    groups.push(group);
                    unit.clone()
                } else {
                    merged
                }
            }
        });
    }
    if let Some(group) = current {
        groups.push(group);
    }
    groups
}

fn trim_range(text: &str, range: Range<usize>) -> Option<Range<usize>> {
    let slice = &text[range.clone()];
    let leading = slice.len() - slice.trim_start().len();
    let trimmed_len = slice.trim().len();
    if trimmed_len == 0 {
        return None;
    }
    let start = range.start + leading;
    Some(start..start + trimmed_len)
}

/// Lines of `text` paired with their starting byte offset, line endings kept.
fn line_offsets(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.split_inclusive('\n').scan(0, |offset, line| {
        let start = *offset;
        *offset += line.len();
        Some((start, line))
    })
}

fn heading_text(line: &str) -> Option<String> {
    HEADING_RE.captures(line.trim_end()).map(|cap| {
        cap[1]
            .trim_end_matches(|c: char| c == '#' || c.is_whitespace())
            .to_string()
    })
}

fn is_heading(line: &str) -> bool {
    HEADING_RE.is_match(line.trim_end())
}

fn count_newlines(text: &str) -> usize {
    text.bytes().filter(|b| *b == b'\n').count()
}

pub(crate) fn char_len(text: &str) -> usize {
    text.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_lines(text: &str, seg: &Segment) -> String {
        text.split('\n')
            .skip(seg.line_start - 1)
            .take(seg.line_end - seg.line_start + 1)
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_one_segment_per_short_section() {
        let text = "# Alpha\nFirst section body.\n\n## Beta\nSecond body here.\n\n### Gamma\nThird body text.\n";
        let segs = segment_markdown(text, 2000);
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0].heading.as_deref(), Some("Alpha"));
        assert_eq!((segs[0].line_start, segs[0].line_end), (1, 2));
        assert_eq!((segs[1].line_start, segs[1].line_end), (4, 5));
        assert_eq!((segs[2].line_start, segs[2].line_end), (7, 8));
        for seg in &segs {
            assert_eq!(seg.content, source_lines(text, seg));
        }
    }

    #[test]
    fn test_preamble_before_first_heading() {
        let text = "Loose notes up top.\n# Later\nBody of later.";
        let segs = segment_markdown(text, 2000);
        assert_eq!(segs.len(), 2);
        assert!(segs[0].heading.is_none());
        assert_eq!(segs[1].line_start, 2);
    }

    #[test]
    fn test_heading_only_section_dropped() {
        let text = "# Empty\n\n# Full\nThis one has content.\n# Tiny\nok";
        let segs = segment_markdown(text, 2000);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].heading.as_deref(), Some("Full"));
    }

    #[test]
    fn test_headings_in_code_fence_ignored() {
        let text = "# Real\nIntro text here.\n```\n# not a heading\n```\nAfter fence.";
        let segs = segment_markdown(text, 2000);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].line_end, 6);
    }

    #[test]
    fn test_oversized_section_splits_on_paragraphs() {
        let para = "word ".repeat(30);
        let text = format!("# Big\n\n{p}\n\n{p}\n\n{p}", p = para.trim());
        let segs = segment_markdown(&text, 200);
        assert_eq!(segs.len(), 3);
        assert!(segs[0].content.starts_with("# Big"));
        for pair in segs.windows(2) {
            assert!(pair[1].line_start > pair[0].line_end);
        }
        for seg in &segs {
            assert!(char_len(&seg.content) <= 200);
            assert_eq!(seg.content, source_lines(&text, seg));
        }
    }

    #[test]
    fn test_speaker_turns_fallback() {
        let mut text = String::from("# Call\n");
        for i in 0..12 {
            let who = if i % 2 == 0 {
                "Alice".to_string()
            } else {
                format!("[10:0{}] Bob", i % 10)
            };
            text.push_str(&format!("{}: {}\n", who, "talking about the roadmap ".repeat(3)));
        }
        let segs = segment_markdown(&text, 300);
        assert!(segs.len() >= 3);
        for seg in &segs {
            assert!(char_len(&seg.content) <= 300, "too long: {}", seg.content.len());
            // splits land on turn boundaries
            let first = seg.content.lines().next().unwrap();
            assert!(first.starts_with("# Call") || SPEAKER_RE.is_match(first));
        }
    }

    #[test]
    fn test_sentence_fallback_for_giant_paragraph() {
        let sentence = "The migration plan covers storage, compute and the network layer in detail. ";
        let body = sentence.repeat(70);
        let text = format!("# Plan\n{}", body.trim_end());
        assert!(text.len() > 5000);
        let segs = segment_markdown(&text, 2000);
        assert!(segs.len() >= 3);
        for seg in &segs {
            assert!(char_len(&seg.content) <= 2000);
            assert!(seg.content.ends_with('.'));
        }
        for pair in segs.windows(2) {
            assert!(pair[1].line_start >= pair[0].line_end);
        }
    }

    #[test]
    fn test_indivisible_sentence_kept_whole() {
        let text = format!("# Run\n{}", "x".repeat(300));
        let segs = segment_markdown(&text, 100);
        assert_eq!(segs.len(), 1);
        assert!(char_len(&segs[0].content) > 100);
    }

    #[test]
    fn test_segments_carry_entities() {
        let segs = segment_markdown("# Team\nMet @dana about the AWS bill.", 2000);
        assert!(segs[0].entities.contains("@dana"));
        assert!(segs[0].entities.contains("AWS"));
    }

    #[test]
    fn test_sentence_units() {
        let units = Sentences.units("One. Two! Three? Four");
        assert_eq!(units.len(), 4);
    }

    #[test]
    fn test_speaker_turns_need_two_markers() {
        assert!(SpeakerTurns.units("Alice: hello there\nand more text").is_empty());
    }
}
