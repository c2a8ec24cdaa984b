//! Chunk type resolution.
//!
//! A [`ResolverChain`] asks each [`TypeResolver`] in order and takes the
//! first answer:
//!
//! 1. [`PreTyped`]: segmenter-assigned types (structured facts).
//! 2. [`PathDefault`]: `file_type_defaults` globs, tried in key order.
//! 3. [`InlineMarkers`]: bracketed tags such as `[decision]` on a line
//!    inside the chunk's range; the highest-confidence tag in range wins.
//!
//! With no answer the chunk is a `fact` at 0.6.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use globset::{Glob, GlobMatcher};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::chunk::Segment;
use crate::models::{ChunkType, TypeAssignment};

pub const DEFAULT_TYPING: TypeAssignment = TypeAssignment {
    chunk_type: ChunkType::Fact,
    confidence: 0.6,
};

static MARKER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\[(confirmed|rule|fact|decision|preference|action|todo|opinion|inferred)\]")
        .unwrap()
});

/// An inline tag found in the raw file text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Marker {
    /// 1-based line of the tag.
    pub line: usize,
    pub assignment: TypeAssignment,
}

fn marker_assignment(tag: &str) -> Option<TypeAssignment> {
    let (chunk_type, confidence) = match tag.to_ascii_lowercase().as_str() {
        "confirmed" => (ChunkType::Confirmed, 0.95),
        "rule" => (ChunkType::Rule, 0.9),
        "fact" => (ChunkType::Fact, 0.85),
        "decision" => (ChunkType::Decision, 0.85),
        "preference" => (ChunkType::Preference, 0.8),
        "action" | "todo" => (ChunkType::ActionItem, 0.75),
        "opinion" => (ChunkType::Opinion, 0.6),
        "inferred" => (ChunkType::Inferred, 0.5),
        _ => return None,
    };
    Some(TypeAssignment {
        chunk_type,
        confidence,
    })
}

/// Every inline marker in `text`, in scan order.
pub fn scan_markers(text: &str) -> Vec<Marker> {
    let mut markers = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        for cap in MARKER_RE.captures_iter(line) {
            if let Some(assignment) = marker_assignment(&cap[1]) {
                markers.push(Marker {
                    line: idx + 1,
                    assignment,
                });
            }
        }
    }
    markers
}

pub trait TypeResolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` defers to the next resolver in the chain.
    fn resolve(&self, file_path: &str, segment: &Segment, markers: &[Marker]) -> Option<TypeAssignment>;
}

pub struct PreTyped;

impl TypeResolver for PreTyped {
    fn name(&self) -> &'static str {
        "pre_typed"
    }

    fn resolve(&self, _: &str, segment: &Segment, _: &[Marker]) -> Option<TypeAssignment> {
        segment.pre_typed
    }
}

pub struct PathDefault {
    rules: Vec<(GlobMatcher, TypeAssignment)>,
}

impl PathDefault {
    pub fn new(defaults: &BTreeMap<String, TypeAssignment>) -> Result<Self> {
        let rules = defaults
            .iter()
            .map(|(pattern, assignment)| {
                let glob = Glob::new(pattern)
                    .with_context(|| format!("Invalid file type glob: {}", pattern))?;
                Ok((glob.compile_matcher(), *assignment))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }
}

impl TypeResolver for PathDefault {
    fn name(&self) -> &'static str {
        "path_default"
    }

    fn resolve(&self, file_path: &str, _: &Segment, _: &[Marker]) -> Option<TypeAssignment> {
        self.rules
            .iter()
            .find(|(matcher, _)| matcher.is_match(file_path))
            .map(|(_, assignment)| *assignment)
    }
}

pub struct InlineMarkers;

impl TypeResolver for InlineMarkers {
    fn name(&self) -> &'static str {
        "inline_markers"
    }

    fn resolve(&self, _: &str, segment: &Segment, markers: &[Marker]) -> Option<TypeAssignment> {
        let mut best: Option<TypeAssignment> = None;
        for marker in markers
            .iter()
            .filter(|m| m.line >= segment.line_start && m.line <= segment.line_end)
        {
            // strictly greater: the first of equal tags stays
            if best.map_or(true, |b| marker.assignment.confidence > b.confidence) {
                best = Some(marker.assignment);
            }
        }
        best
    }
}

pub struct ResolverChain {
    resolvers: Vec<Box<dyn TypeResolver>>,
}

impl ResolverChain {
    pub fn new(resolvers: Vec<Box<dyn TypeResolver>>) -> Self {
        Self { resolvers }
    }

    /// The standard precedence: pre-typed, then path defaults, then markers.
    pub fn standard(defaults: &BTreeMap<String, TypeAssignment>) -> Result<Self> {
        Ok(Self::new(vec![
            Box::new(PreTyped),
            Box::new(PathDefault::new(defaults)?),
            Box::new(InlineMarkers),
        ]))
    }

    pub fn resolve(&self, file_path: &str, segment: &Segment, markers: &[Marker]) -> TypeAssignment {
        for resolver in &self.resolvers {
            if let Some(assignment) = resolver.resolve(file_path, segment, markers) {
                tracing::trace!(
                    resolver = resolver.name(),
                    file = file_path,
                    line = segment.line_start,
                    "resolved chunk type"
                );
                return assignment;
            }
        }
        DEFAULT_TYPING
    }
}
