//! Index statistics and health overview.
//!
//! A quick summary of what's indexed: file and chunk counts, the per-type
//! breakdown, archived chunks and recorded contradictions. Used by
//! `mem stats`.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::Result;
use crate::store::{Store, StoreStats};

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    #[serde(flatten)]
    pub store: StoreStats,
    pub db_path: PathBuf,
    /// 0 when the store has no file on disk.
    pub db_size: u64,
}

pub async fn gather(store: &dyn Store, db_path: &Path) -> Result<Stats> {
    let db_size = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);
    Ok(Stats {
        store: store.stats().await?,
        db_path: db_path.to_path_buf(),
        db_size,
    })
}

pub fn print(stats: &Stats) {
    println!("Memory Harness Index Stats");
    println!("============================");
    println!();
    println!("  Database:        {}", stats.db_path.display());
    println!("  Size:            {}", format_bytes(stats.db_size));
    println!();
    println!("  Files:           {}", stats.store.files);
    println!("  Chunks:          {}", stats.store.chunks);
    println!("  Archived:        {}", stats.store.archived);
    println!("  Contradictions:  {}", stats.store.contradictions);

    if !stats.store.by_type.is_empty() {
        println!();
        println!("  By type:");
        println!("  {:<16} {:>8}", "TYPE", "CHUNKS");
        println!("  {}", "-".repeat(25));
        for (chunk_type, count) in &stats.store.by_type {
            println!("  {:<16} {:>8}", chunk_type, count);
        }
    }

    println!();
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[tokio::test]
    async fn test_gather_without_db_file() {
        let store = InMemoryStore::new();
        let stats = gather(&store, Path::new("/nonexistent/index.sqlite")).await.unwrap();
        assert_eq!(stats.db_size, 0);
        assert_eq!(stats.store.chunks, 0);
    }
}
