//! # Memory Harness CLI (`mem`)
//!
//! The `mem` binary drives the four engine operations over one workspace.
//!
//! ## Usage
//!
//! ```bash
//! mem --workspace ~/agent <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mem init` | Write `.memory/config.toml` and create the index |
//! | `mem index` | Index new and changed files, drop vanished ones |
//! | `mem query "<text>"` | Ranked retrieval |
//! | `mem remember "<text>"` | Append to today's daily note and index it |
//! | `mem reflect` | Decay, reinforce, stale marking, contradictions, pruning |
//! | `mem stats` | Index statistics |
//!
//! Logging goes to stderr, filtered by `MEM_LOG` (or `RUST_LOG`), default `warn`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use memory_harness::config::{resolve_config, DEFAULT_CONFIG_PATH};
use memory_harness::models::{IndexOptions, QueryOptions, ReflectOptions, RememberOptions};
use memory_harness::{stats, Engine};

const CONFIG_TEMPLATE: &str = r#"# Memory Harness configuration. Every key is optional.

[workspace]
# owner = "sam"
# include = ["projects/roadmap.md"]
# include_globs = ["people/**/*.md"]
# exclude_from_recall = ["SOUL.md"]

[workspace.file_type_defaults]
# "decisions/**/*.md" = { type = "decision", confidence = 0.85 }

[chunking]
max_chars = 2000

[retrieval]
final_limit = 10
candidate_k = 80
min_score = 0.15

[lifecycle]
decay_window_days = 30
decay_per_day = 0.005
stale_threshold = 0.3
prune_grace_days = 30
prune_mode = "archive"
"#;

/// Memory Harness CLI: a local, file-backed memory index for
/// conversational agents.
#[derive(Parser)]
#[command(
    name = "mem",
    about = "Memory Harness: chunking, ranked recall and confidence lifecycle over a notes directory",
    version
)]
struct Cli {
    /// Workspace root holding the notes.
    #[arg(long, global = true, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file (TOML). Defaults to `<workspace>/.memory/config.toml` when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config and create the index.
    ///
    /// Idempotent: an existing config file is left as is.
    Init,

    /// Index new and changed files.
    Index {
        /// Reindex files even when their mtime is unchanged.
        #[arg(long)]
        force: bool,

        /// Extra workspace-relative path or glob to include (repeatable).
        #[arg(long = "include")]
        include: Vec<String>,
    },

    /// Ranked retrieval over indexed chunks.
    Query {
        /// The query text.
        text: String,

        #[arg(long)]
        limit: Option<usize>,

        /// Only chunks created on or after this point (`YYYY-MM-DD`, `7d`, `2w`, `yesterday`).
        #[arg(long)]
        since: Option<String>,

        /// Only chunks of this type (e.g. `decision`, `action_item`).
        #[arg(long = "type")]
        chunk_type: Option<String>,

        #[arg(long)]
        min_confidence: Option<f64>,

        /// Truncate delivered content to this many characters.
        #[arg(long)]
        max_chars: Option<usize>,

        /// Print hits as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Append a memory to today's daily note.
    Remember {
        text: String,

        /// Inline marker written ahead of the text, e.g. `decision`.
        #[arg(long)]
        tag: Option<String>,
    },

    /// Run the lifecycle maintenance pass.
    Reflect {
        /// Report counts without writing anything.
        #[arg(long)]
        dry_run: bool,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show index statistics.
    Stats,
}

fn init_logging() {
    let filter = std::env::var("MEM_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}

fn write_config_template(workspace: &Path) -> anyhow::Result<Option<PathBuf>> {
    let path = workspace.join(DEFAULT_CONFIG_PATH);
    if path.exists() {
        return Ok(None);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(Some(path))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        if let Some(path) = write_config_template(&cli.workspace)? {
            println!("Wrote {}", path.display());
        }
    }

    let config = resolve_config(&cli.workspace, cli.config.as_deref())?;
    let engine = Engine::open(config).await?;

    match cli.command {
        Commands::Init => {
            println!("Index ready at {}", engine.config().db_path().display());
        }
        Commands::Index { force, include } => {
            let report = engine
                .index(&IndexOptions {
                    force,
                    include,
                    ..Default::default()
                })
                .await?;
            println!("index");
            println!("  files: {}", report.total);
            println!("  indexed: {}", report.indexed);
            println!("  skipped: {}", report.skipped);
            println!("  cleaned: {}", report.cleaned);
            for e in &report.errors {
                println!("  error: {}: {}", e.file, e.error);
            }
            println!("ok");
        }
        Commands::Query {
            text,
            limit,
            since,
            chunk_type,
            min_confidence,
            max_chars,
            json,
        } => {
            let options = QueryOptions {
                limit,
                since,
                chunk_type,
                min_confidence,
                max_chars,
            };
            let hits = engine.query(&text, &options).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else if hits.is_empty() {
                println!("No results.");
            } else {
                for (i, hit) in hits.iter().enumerate() {
                    println!(
                        "{}. [{:.2}] {}:{}-{} ({}, {:.2})",
                        i + 1,
                        hit.final_score,
                        hit.file_path,
                        hit.line_start,
                        hit.line_end,
                        hit.chunk_type,
                        hit.confidence
                    );
                    if let Some(heading) = &hit.heading {
                        println!("    heading: {}", heading);
                    }
                    println!("    excerpt: \"{}\"", hit.content.replace('\n', " ").trim());
                    println!("    id: {}", hit.chunk_id);
                    println!();
                }
            }
        }
        Commands::Remember { text, tag } => {
            let outcome = engine.remember(&text, &RememberOptions { tag }).await?;
            if outcome.skipped {
                println!("Already remembered; skipped.");
            } else {
                println!("Remembered at {}:{}", outcome.file_path, outcome.line);
            }
        }
        Commands::Reflect { dry_run, json } => {
            let report = engine.reflect(ReflectOptions { dry_run }).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("reflect{}", if dry_run { " (dry-run)" } else { "" });
                println!("  decayed: {}", report.decay.decayed);
                println!("  reinforced: {}", report.reinforce.reinforced);
                println!("  marked stale: {}", report.stale.marked);
                println!("  contradictions: {}", report.contradictions.found);
                for pair in &report.contradictions.pairs {
                    println!(
                        "    {} <-> {} [{}] {}",
                        pair.chunk_a, pair.chunk_b, pair.entity, pair.reason
                    );
                }
                println!("  archived: {}", report.prune.archived);
                println!("ok");
            }
        }
        Commands::Stats => {
            stats::print(&engine.stats().await?);
        }
    }

    Ok(())
}
