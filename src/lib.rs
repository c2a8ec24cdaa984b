//! # Memory Harness
//!
//! A local, file-backed memory index for conversational agents.
//!
//! Memory Harness turns a directory of markdown notes and structured fact
//! files into a ranked, self-maintaining index, exposed through four
//! operations on [`Engine`]: `index`, `query`, `remember` and `reflect`.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────────┐   ┌───────────┐
//! │ Discovery  │──▶│ Segment + Type   │──▶│  Store    │
//! │ notes/facts│   │ facts + typing   │   │ SQLite FTS│
//! └────────────┘   └──────────────────┘   └─────┬─────┘
//!                                               │
//!                        ┌──────────────────────┤
//!                        ▼                      ▼
//!                  ┌───────────┐          ┌───────────┐
//!                  │  search   │          │  reflect  │
//!                  │ (ranking) │          │(lifecycle)│
//!                  └───────────┘          └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! mem init
//! mem index
//! mem query "why did we pick postgres"
//! mem remember "Ship the billing migration on Friday" --tag decision
//! mem reflect --dry-run
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types and operation options/reports |
//! | [`discovery`] | Workspace file discovery |
//! | [`chunk`] | Markdown segmentation |
//! | [`facts`] | Structured fact file segmentation |
//! | [`entities`] | Heuristic entity extraction |
//! | [`typing`] | Chunk type resolution |
//! | [`ingest`] | Indexing pipeline |
//! | [`store`] | Storage trait and backends |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Schema migrations |
//! | [`query`] | Query preprocessing |
//! | [`search`] | Multi-signal ranking |
//! | [`reflect`] | Lifecycle maintenance |
//! | [`remember`] | Daily-note append and deduplication |
//! | [`engine`] | The four operations behind a write lock |
//! | [`stats`] | Index statistics |

pub mod chunk;
pub mod config;
pub mod db;
pub mod discovery;
pub mod engine;
pub mod entities;
pub mod error;
pub mod facts;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod query;
pub mod reflect;
pub mod remember;
pub mod search;
pub mod stats;
pub mod store;
pub mod typing;

pub use config::Config;
pub use engine::Engine;
pub use error::{MemoryError, Result};
pub use models::{
    Chunk, ChunkType, IndexOptions, IndexReport, QueryHit, QueryOptions, ReflectOptions,
    ReflectReport, RememberOptions, RememberOutcome,
};
