use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::models::TypeAssignment;

/// Location of the config file inside a workspace when none is given.
pub const DEFAULT_CONFIG_PATH: &str = ".memory/config.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".memory/index.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default, alias = "includeGlobs")]
    pub include_globs: Vec<String>,
    #[serde(default, alias = "excludeFromRecall")]
    pub exclude_from_recall: Vec<String>,
    #[serde(default, alias = "fileTypeDefaults")]
    pub file_type_defaults: BTreeMap<String, TypeAssignment>,
    #[serde(default = "default_daily_dir")]
    pub daily_dir: String,
    #[serde(default = "default_ingested_dir")]
    pub ingested_dir: String,
    #[serde(default = "default_fact_file_name")]
    pub fact_file_name: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            owner: None,
            include: Vec::new(),
            include_globs: Vec::new(),
            exclude_from_recall: Vec::new(),
            file_type_defaults: BTreeMap::new(),
            daily_dir: default_daily_dir(),
            ingested_dir: default_ingested_dir(),
            fact_file_name: default_fact_file_name(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_daily_dir() -> String {
    "memory".to_string()
}
fn default_ingested_dir() -> String {
    "ingested".to_string()
}
fn default_fact_file_name() -> String {
    "items.json".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    /// 0 disables delivery truncation.
    #[serde(default)]
    pub delivery_max_chars: usize,
    #[serde(default = "default_recency_horizon_days")]
    pub recency_horizon_days: f64,
    #[serde(default = "default_rule_penalty")]
    pub rule_penalty: f64,
    #[serde(default)]
    pub weights: SignalWeights,
    /// Glob -> importance in `[0, 1]`.
    #[serde(default)]
    pub file_weights: BTreeMap<String, f64>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            final_limit: default_final_limit(),
            candidate_k: default_candidate_k(),
            min_score: default_min_score(),
            delivery_max_chars: 0,
            recency_horizon_days: default_recency_horizon_days(),
            rule_penalty: default_rule_penalty(),
            weights: SignalWeights::default(),
            file_weights: BTreeMap::new(),
        }
    }
}

fn default_final_limit() -> usize {
    10
}
fn default_candidate_k() -> usize {
    80
}
fn default_min_score() -> f64 {
    0.15
}
fn default_recency_horizon_days() -> f64 {
    365.0
}
fn default_rule_penalty() -> f64 {
    0.5
}

/// Weights of the ranking signals. They need not sum to 1.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SignalWeights {
    pub lexical: f64,
    pub recency: f64,
    pub confidence: f64,
    pub chunk_type: f64,
    pub importance: f64,
    pub entity: f64,
    pub semantic: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            lexical: 0.35,
            recency: 0.15,
            confidence: 0.15,
            chunk_type: 0.10,
            importance: 0.10,
            entity: 0.15,
            semantic: 0.0,
        }
    }
}

impl SignalWeights {
    fn all(&self) -> [(&'static str, f64); 7] {
        [
            ("lexical", self.lexical),
            ("recency", self.recency),
            ("confidence", self.confidence),
            ("chunk_type", self.chunk_type),
            ("importance", self.importance),
            ("entity", self.entity),
            ("semantic", self.semantic),
        ]
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PruneMode {
    #[default]
    Archive,
    Delete,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LifecycleConfig {
    pub decay: bool,
    pub reinforce: bool,
    pub stale: bool,
    pub contradictions: bool,
    pub prune: bool,
    pub decay_window_days: f64,
    pub decay_per_day: f64,
    pub reinforce_min_access: i64,
    pub reinforce_step: f64,
    pub stale_threshold: f64,
    pub prune_grace_days: f64,
    pub prune_mode: PruneMode,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            decay: true,
            reinforce: true,
            stale: true,
            contradictions: true,
            prune: true,
            decay_window_days: 30.0,
            decay_per_day: 0.005,
            reinforce_min_access: 5,
            reinforce_step: 0.05,
            stale_threshold: 0.3,
            prune_grace_days: 30.0,
            prune_mode: PruneMode::Archive,
        }
    }
}

impl Config {
    /// Defaults for a workspace rooted at `root`.
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let mut config = Config::default();
        config.workspace.root = root.into();
        config
    }

    /// The store path, resolved against the workspace root when relative.
    pub fn db_path(&self) -> PathBuf {
        if self.db.path.is_absolute() {
            self.db.path.clone()
        } else {
            self.workspace.root.join(&self.db.path)
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Load `path` if given, else `<workspace>/.memory/config.toml` if present,
/// else defaults. A relative `workspace.root` resolves against `workspace`.
pub fn resolve_config(workspace: &Path, path: Option<&Path>) -> Result<Config> {
    let default_path = workspace.join(DEFAULT_CONFIG_PATH);
    let mut config = match path {
        Some(p) => load_config(p)?,
        None if default_path.exists() => load_config(&default_path)?,
        None => Config::default(),
    };
    if config.workspace.root.is_relative() {
        config.workspace.root = workspace.join(&config.workspace.root);
    }
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_chars == 0 {
        bail!("chunking.max_chars must be > 0");
    }

    let retrieval = &config.retrieval;
    if retrieval.final_limit < 1 {
        bail!("retrieval.final_limit must be >= 1");
    }
    if retrieval.candidate_k < 1 {
        bail!("retrieval.candidate_k must be >= 1");
    }
    for (name, value) in [
        ("retrieval.min_score", retrieval.min_score),
        ("retrieval.rule_penalty", retrieval.rule_penalty),
    ] {
        check_unit(name, value)?;
    }
    if retrieval.recency_horizon_days <= 0.0 {
        bail!("retrieval.recency_horizon_days must be > 0");
    }
    for (name, value) in retrieval.weights.all() {
        check_unit(&format!("retrieval.weights.{}", name), value)?;
    }
    for (glob, weight) in &retrieval.file_weights {
        check_unit(&format!("retrieval.file_weights.\"{}\"", glob), *weight)?;
    }
    build_globset(retrieval.file_weights.keys())?;

    let lifecycle = &config.lifecycle;
    for (name, value) in [
        ("lifecycle.decay_per_day", lifecycle.decay_per_day),
        ("lifecycle.reinforce_step", lifecycle.reinforce_step),
        ("lifecycle.stale_threshold", lifecycle.stale_threshold),
    ] {
        check_unit(name, value)?;
    }
    if lifecycle.decay_window_days < 0.0 || lifecycle.prune_grace_days < 0.0 {
        bail!("lifecycle windows must be >= 0 days");
    }

    let workspace = &config.workspace;
    validate_type_defaults("workspace.file_type_defaults", &workspace.file_type_defaults)?;
    build_globset(workspace.include_globs.iter())?;
    build_globset(workspace.exclude_from_recall.iter())?;

    Ok(())
}

/// Check confidences and globs of a `file_type_defaults` table. Also applied
/// to defaults passed at index time.
pub fn validate_type_defaults(name: &str, defaults: &BTreeMap<String, TypeAssignment>) -> Result<()> {
    for (glob, assignment) in defaults {
        check_unit(&format!("{}.\"{}\".confidence", name, glob), assignment.confidence)?;
    }
    build_globset(defaults.keys())?;
    Ok(())
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        bail!("{} must be in [0.0, 1.0], got {}", name, value);
    }
    Ok(())
}

pub fn build_globset<'a, I>(patterns: I) -> Result<GlobSet>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
