//! Workspace discovery.
//!
//! Walks the workspace root once and collects every file the indexer
//! should look at:
//!
//! - the known root files (`MEMORY.md`, `USER.md`, ...) that exist,
//! - `<daily_dir>/*.md` (not recursive),
//! - `<ingested_dir>/**/*.md`,
//! - every `<fact_file_name>` at any depth,
//! - explicit `include` paths and `include_globs` matches.
//!
//! `.git`, `node_modules`, `target` and the store's own directory are never
//! entered. Paths are workspace-relative with `/` separators, de-duplicated
//! and sorted.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Result};
use walkdir::{DirEntry, WalkDir};

use crate::config::{build_globset, Config};
use crate::models::Millis;

pub const KNOWN_ROOT_FILES: &[&str] = &[
    "MEMORY.md",
    "USER.md",
    "IDENTITY.md",
    "AGENTS.md",
    "TOOLS.md",
    "HEARTBEAT.md",
];

const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", "target"];

/// Discover eligible files under the configured root.
///
/// `extra_include` entries are treated as globs when they contain a glob
/// metacharacter and as explicit relative paths otherwise.
pub fn discover(config: &Config, extra_include: &[String]) -> Result<Vec<String>> {
    let root = &config.workspace.root;
    if !root.is_dir() {
        bail!("Workspace root does not exist: {}", root.display());
    }
    let ws = &config.workspace;

    let mut explicit: Vec<&String> = ws.include.iter().collect();
    let mut globs: Vec<&String> = ws.include_globs.iter().collect();
    for entry in extra_include {
        if is_glob(entry) {
            globs.push(entry);
        } else {
            explicit.push(entry);
        }
    }
    let include_set = build_globset(globs)?;

    let db_dir = config
        .db_path()
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| root.clone());
    let daily_prefix = format!("{}/", ws.daily_dir.trim_end_matches('/'));
    let ingested_prefix = format!("{}/", ws.ingested_dir.trim_end_matches('/'));

    let mut found = BTreeSet::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_skipped_dir(e, &db_dir));
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(error = %err, "skipping unreadable path during discovery");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = relative_path(root, entry.path());
        let file_name = entry.file_name().to_string_lossy();

        let eligible = (entry.depth() == 1 && KNOWN_ROOT_FILES.contains(&rel.as_str()))
            || rel
                .strip_prefix(&daily_prefix)
                .is_some_and(|rest| !rest.contains('/') && rest.ends_with(".md"))
            || (rel.starts_with(&ingested_prefix) && rel.ends_with(".md"))
            || file_name == ws.fact_file_name.as_str()
            || include_set.is_match(&rel);
        if eligible {
            found.insert(rel);
        }
    }

    for path in explicit {
        let rel = path.trim_start_matches("./").replace('\\', "/");
        if root.join(&rel).is_file() {
            found.insert(rel);
        } else {
            tracing::warn!(path = %rel, "included path does not exist");
        }
    }

    Ok(found.into_iter().collect())
}

fn is_skipped_dir(entry: &DirEntry, db_dir: &Path) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    SKIPPED_DIRS.contains(&&*name) || entry.path() == db_dir
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

/// `path` relative to `root`, with `/` separators.
pub fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Modification time in whole milliseconds since the epoch.
pub fn file_mtime(path: &Path) -> std::io::Result<Millis> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Millis)
}

/// Absolute path of a workspace-relative file.
pub fn absolute_path(config: &Config, rel: &str) -> PathBuf {
    config.workspace.root.join(rel)
}
