//! Appending new memories to the daily note.
//!
//! `remember` writes one bullet line to `<daily_dir>/<YYYY-MM-DD>.md` and
//! then reindexes only that file. Content deduplication sits behind the
//! [`Deduplicator`] trait so hosts can supply their own.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context};
use chrono::NaiveDate;
use sha2::{Digest, Sha256};

use crate::chunk::{char_len, MIN_BODY_CHARS};
use crate::config::Config;
use crate::error::{MemoryError, Result};

const FILLER_WORDS: &[&str] = &[
    "a", "an", "the", "in", "on", "at", "to", "for", "of", "with", "by",
];

/// Decides whether a piece of content was already remembered.
pub trait Deduplicator: Send + Sync {
    fn is_duplicate(&self, content: &str) -> Result<bool>;

    /// Called after the content has been written.
    fn record(&self, content: &str) -> Result<()>;
}

/// Accepts everything.
pub struct NoDedup;

impl Deduplicator for NoDedup {
    fn is_duplicate(&self, _content: &str) -> Result<bool> {
        Ok(false)
    }

    fn record(&self, _content: &str) -> Result<()> {
        Ok(())
    }
}

/// SHA-256 of normalized content, persisted as a JSON array.
pub struct HashIndexDeduplicator {
    path: PathBuf,
    guard: Mutex<()>,
}

impl HashIndexDeduplicator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    /// `.memory/hashes.json` next to the store.
    pub fn for_config(config: &Config) -> Self {
        let dir = config
            .db_path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config.workspace.root.join(".memory"));
        Self::new(dir.join("hashes.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> anyhow::Result<BTreeSet<String>> {
        if !self.path.exists() {
            return Ok(BTreeSet::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let hashes = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        Ok(hashes)
    }

    fn save(&self, hashes: &BTreeSet<String>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(hashes)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Deduplicator for HashIndexDeduplicator {
    fn is_duplicate(&self, content: &str) -> Result<bool> {
        let _held = self.guard.lock().map_err(|_| anyhow!("hash index lock poisoned"))?;
        Ok(self.load()?.contains(&normalized_hash(content)))
    }

    fn record(&self, content: &str) -> Result<()> {
        let _held = self.guard.lock().map_err(|_| anyhow!("hash index lock poisoned"))?;
        let mut hashes = self.load()?;
        if hashes.insert(normalized_hash(content)) {
            self.save(&hashes)?;
        }
        Ok(())
    }
}

/// Lower-case, strip `.!?,;:`, drop filler words, collapse whitespace.
pub fn normalize(content: &str) -> String {
    let stripped: String = content
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(c, '.' | '!' | '?' | ',' | ';' | ':'))
        .collect();
    stripped
        .split_whitespace()
        .filter(|w| !FILLER_WORDS.contains(w))
        .collect::<Vec<_>>()
        .join(" ")
}

fn normalized_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(content).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The bullet line written for `content`, newlines collapsed.
pub fn format_entry(content: &str, tag: Option<&str>) -> Result<String> {
    let body = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if body.is_empty() {
        return Err(MemoryError::EmptyContent);
    }
    let entry = match tag.map(str::trim).filter(|t| !t.is_empty()) {
        Some(tag) => format!("- [{}] {}", tag, body),
        None => format!("- {}", body),
    };
    if char_len(&entry) < MIN_BODY_CHARS {
        return Err(MemoryError::ContentTooShort(body));
    }
    Ok(entry)
}

/// Workspace-relative path of the daily note for `date`.
pub fn daily_note_path(config: &Config, date: NaiveDate) -> String {
    format!("{}/{}.md", config.workspace.daily_dir, date.format("%Y-%m-%d"))
}

/// Append `entry` to the daily note, creating it with a date heading.
/// Returns the 1-based line number of the new entry.
pub fn append_entry(path: &Path, date: NaiveDate, entry: &str) -> Result<usize> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let existing = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(MemoryError::FileRead {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let mut prefix = String::new();
    if existing.is_empty() {
        prefix.push_str(&format!("# {}\n\n", date.format("%Y-%m-%d")));
    } else if !existing.ends_with('\n') {
        prefix.push('\n');
    }

    let line = existing.matches('\n').count() + prefix.matches('\n').count() + 1;

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}{}", prefix, entry)?;
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 11).unwrap()
    }

    #[test]
    fn test_normalize_drops_filler_and_punctuation() {
        assert_eq!(normalize("The  meeting is at 3pm!"), "meeting is 3pm");
        assert_eq!(normalize("meeting is AT 3pm"), normalize("The meeting is at 3pm."));
    }

    #[test]
    fn test_format_entry() {
        assert_eq!(format_entry("ship it\nfriday", Some("decision")).unwrap(), "- [decision] ship it friday");
        assert_eq!(format_entry("plain", None).unwrap(), "- plain");
        assert!(matches!(format_entry("  \n ", None), Err(MemoryError::EmptyContent)));
        assert!(matches!(format_entry("ok", None), Err(MemoryError::ContentTooShort(b)) if b == "ok"));
        assert_eq!(format_entry("ok", Some("todo")).unwrap(), "- [todo] ok");
    }

    #[test]
    fn test_append_creates_heading_and_counts_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("memory/2025-06-11.md");

        assert_eq!(append_entry(&path, date(), "- first").unwrap(), 3);
        assert_eq!(append_entry(&path, date(), "- second").unwrap(), 4);

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "# 2025-06-11\n\n- first\n- second\n");
    }

    #[test]
    fn test_append_handles_missing_trailing_newline() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("note.md");
        fs::write(&path, "# 2025-06-11\n\n- one").unwrap();
        assert_eq!(append_entry(&path, date(), "- two").unwrap(), 4);
        assert_eq!(fs::read_to_string(&path).unwrap(), "# 2025-06-11\n\n- one\n- two\n");
    }

    #[test]
    fn test_hash_index_dedup_persists() {
        let tmp = TempDir::new().unwrap();
        let dedup = HashIndexDeduplicator::new(tmp.path().join(".memory/hashes.json"));
        assert!(!dedup.is_duplicate("The meeting is at 3pm.").unwrap());
        dedup.record("The meeting is at 3pm.").unwrap();

        let reopened = HashIndexDeduplicator::new(dedup.path());
        assert!(reopened.is_duplicate("meeting is at 3pm").unwrap());
        assert!(!reopened.is_duplicate("meeting is at 4pm").unwrap());
    }
}
