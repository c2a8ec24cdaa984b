//! The four engine operations behind one workspace write lock.
//!
//! `index`, `remember` and a non-dry `reflect` take the lock with
//! `try_lock` and fail fast with [`MemoryError::LockContention`] when
//! another write holds it. `query`, `stats` and dry-run `reflect` never
//! take it.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDate, Utc};
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::config::{validate, Config};
use crate::discovery::absolute_path;
use crate::error::{MemoryError, Result};
use crate::ingest::Indexer;
use crate::models::{
    IndexOptions, IndexReport, QueryHit, QueryOptions, ReflectOptions, ReflectReport,
    RememberOptions, RememberOutcome,
};
use crate::reflect;
use crate::remember::{self, Deduplicator, HashIndexDeduplicator};
use crate::search::{self, SemanticScorer};
use crate::stats::{self, Stats};
use crate::store::{SqliteStore, Store};

pub struct Engine {
    config: Config,
    store: Arc<dyn Store>,
    write_lock: Mutex<()>,
    dedup: Arc<dyn Deduplicator>,
    semantic: Option<Arc<dyn SemanticScorer>>,
}

impl Engine {
    /// Validate `config` and open the SQLite store at its `db_path()`.
    pub async fn open(config: Config) -> Result<Self> {
        validate(&config).map_err(|e| MemoryError::Config(format!("{:#}", e)))?;
        let store = SqliteStore::open(&config.db_path()).await?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    pub fn with_store(config: Config, store: Arc<dyn Store>) -> Self {
        let dedup = Arc::new(HashIndexDeduplicator::for_config(&config));
        Self {
            config,
            store,
            write_lock: Mutex::new(()),
            dedup,
            semantic: None,
        }
    }

    pub fn with_deduplicator(mut self, dedup: Arc<dyn Deduplicator>) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn with_semantic(mut self, scorer: Arc<dyn SemanticScorer>) -> Self {
        self.semantic = Some(scorer);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    fn acquire(&self, operation: &'static str) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .try_lock()
            .map_err(|_| MemoryError::LockContention { operation })
    }

    pub async fn index(&self, options: &IndexOptions) -> Result<IndexReport> {
        let _guard = self.acquire("index")?;
        Indexer::new(&self.config, self.store(), &options.file_type_defaults)?
            .run(options)
            .await
    }

    pub async fn query(&self, text: &str, options: &QueryOptions) -> Result<Vec<QueryHit>> {
        self.query_at(text, options, Utc::now()).await
    }

    /// Like [`Engine::query`], with temporal phrases resolved against `now`.
    pub async fn query_at(
        &self,
        text: &str,
        options: &QueryOptions,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueryHit>> {
        search::search(
            self.store(),
            &self.config,
            self.semantic.as_deref(),
            text,
            options,
            now,
        )
        .await
    }

    pub async fn remember(&self, content: &str, options: &RememberOptions) -> Result<RememberOutcome> {
        self.remember_on(content, options, Local::now().date_naive()).await
    }

    /// Like [`Engine::remember`], appending to the daily note for `date`.
    pub async fn remember_on(
        &self,
        content: &str,
        options: &RememberOptions,
        date: NaiveDate,
    ) -> Result<RememberOutcome> {
        let entry = remember::format_entry(content, options.tag.as_deref())?;
        let _guard = self.acquire("remember")?;

        let file_path = remember::daily_note_path(&self.config, date);
        if self.dedup.is_duplicate(content)? {
            info!(file = %file_path, "duplicate memory skipped");
            return Ok(RememberOutcome {
                file_path,
                line: 0,
                skipped: true,
            });
        }

        let line = remember::append_entry(&absolute_path(&self.config, &file_path), date, &entry)?;
        self.dedup.record(content)?;

        Indexer::new(&self.config, self.store(), &BTreeMap::new())?
            .index_file(&file_path, true)
            .await?;
        info!(file = %file_path, line, "memory appended");

        Ok(RememberOutcome {
            file_path,
            line,
            skipped: false,
        })
    }

    pub async fn reflect(&self, options: ReflectOptions) -> Result<ReflectReport> {
        self.reflect_at(options, Utc::now()).await
    }

    pub async fn reflect_at(&self, options: ReflectOptions, now: DateTime<Utc>) -> Result<ReflectReport> {
        let _guard = if options.dry_run {
            None
        } else {
            Some(self.acquire("reflect")?)
        };
        reflect::reflect(self.store(), &self.config.lifecycle, options, now).await
    }

    pub async fn stats(&self) -> Result<Stats> {
        stats::gather(self.store(), &self.config.db_path()).await
    }
}
