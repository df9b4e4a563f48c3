//! Pipeline configuration.
//!
//! Loaded once per run from three layers, lowest precedence first:
//! 1. built-in defaults (`PipelineConfig::default()`)
//! 2. a YAML document rooted at `pipeline:`
//! 3. environment overrides (`INBOX_ETL__SECTION__KEY=value` plus a few
//!    legacy names such as `DATABASE_PATH`)
//!
//! Layers are merged as YAML trees, so the last writer wins per leaf key.
//! Sequences and the `category_actions` map are leaves: a file that sets them
//! replaces the default wholesale.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::ConfigError;

/// Category every unrecognized categorization result collapses into.
pub const FALLBACK_CATEGORY: &str = "Other";

/// Action names the mail-store collaborator understands.
pub const KNOWN_ACTIONS: &[&str] = &["apply_label", "archive", "star", "mark_as_read"];

/// Prefix for key-path environment overrides.
pub const ENV_PREFIX: &str = "INBOX_ETL__";

/// Maps whose keys are user data, not schema. Never merged key-by-key.
const LEAF_MAPS: &[&str] = &["pipeline.load.category_actions"];

// ── Sections ────────────────────────────────────────────────────────

/// Top-level pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Compute actions without touching the mail store.
    pub dry_run: bool,
    /// Keep going with the surviving items when a stage fails.
    pub continue_on_error: bool,
    /// Fraction of a batch allowed to fail before the continuation policy applies.
    pub failure_tolerance: f64,
    pub retry: RetryConfig,
    pub extract: ExtractConfig,
    pub transform: TransformConfig,
    pub load: LoadConfig,
    pub sync: SyncConfig,
    pub monitoring: MonitoringConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            continue_on_error: true,
            failure_tolerance: 0.0,
            retry: RetryConfig::default(),
            extract: ExtractConfig::default(),
            transform: TransformConfig::default(),
            load: LoadConfig::default(),
            sync: SyncConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

/// Timeout and retry bounds applied to every collaborator call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    pub call_timeout_secs: u64,
    /// Base delay between attempts; doubles each retry.
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            call_timeout_secs: 30,
            backoff_ms: 250,
        }
    }
}

/// Where Extract reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractSource {
    #[serde(alias = "gmail")]
    MailStore,
    #[serde(alias = "database")]
    PersistedStore,
}

impl FromStr for ExtractSource {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mail_store" | "gmail" => Ok(Self::MailStore),
            "persisted_store" | "database" => Ok(Self::PersistedStore),
            other => Err(ConfigError::InvalidValue {
                key: "pipeline.extract.source".into(),
                message: format!("unknown source '{other}'"),
            }),
        }
    }
}

impl fmt::Display for ExtractSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MailStore => write!(f, "mail_store"),
            Self::PersistedStore => write!(f, "persisted_store"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub source: ExtractSource,
    /// Mail-store search query (persisted store: substring filter on subject/sender).
    pub query: String,
    pub batch_size: usize,
    /// Upper bound on extracted items; falls back to `batch_size`.
    pub max_results: Option<usize>,
    /// Persisted store only: also return items that were already synced.
    pub include_processed: bool,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            source: ExtractSource::MailStore,
            query: "is:unread".to_string(),
            batch_size: 100,
            max_results: None,
            include_processed: false,
        }
    }
}

impl ExtractConfig {
    /// Effective maximum number of items to extract.
    pub fn limit(&self) -> usize {
        self.max_results.unwrap_or(self.batch_size)
    }
}

/// Categorization backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategorizerProvider {
    #[serde(alias = "open_ai")]
    OpenAi,
    Ollama,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub provider: CategorizerProvider,
    pub model: String,
    /// Override the provider's API base URL.
    pub base_url: Option<String>,
    /// Content is truncated to this many characters before categorization.
    pub max_content_length: usize,
    pub categories: Vec<String>,
    pub fallback_category: String,
    /// Items categorized concurrently. 1 keeps the loop sequential.
    pub concurrency: usize,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            provider: CategorizerProvider::OpenAi,
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            max_content_length: 4000,
            categories: [
                "Marketing",
                "Response Needed / High Priority",
                "Bills",
                "Subscriptions",
                "Newsletters",
                "Personal",
                "Work",
                "Events",
                "Travel",
                "Receipts",
                "Low quality",
                "Notifications",
                "Other",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            fallback_category: FALLBACK_CATEGORY.to_string(),
            concurrency: 1,
        }
    }
}

impl TransformConfig {
    /// Whether `category` is in the closed vocabulary (fallback included).
    pub fn is_known_category(&self, category: &str) -> bool {
        category == self.fallback_category || self.categories.iter().any(|c| c == category)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub apply_labels: bool,
    pub create_missing_labels: bool,
    /// Category → ordered action names.
    pub category_actions: BTreeMap<String, Vec<String>>,
    /// Actions for categories absent from `category_actions`.
    pub default_actions: Vec<String>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        let mut category_actions = BTreeMap::new();
        let mut map = |category: &str, actions: &[&str]| {
            category_actions.insert(
                category.to_string(),
                actions.iter().map(|a| a.to_string()).collect(),
            );
        };
        map("Marketing", &["apply_label", "archive"]);
        map("Response Needed / High Priority", &["apply_label", "star"]);
        map("Bills", &["apply_label", "star"]);
        map("Newsletters", &["apply_label", "archive"]);
        map("Low quality", &["apply_label", "archive", "mark_as_read"]);
        map("Notifications", &["apply_label", "mark_as_read"]);

        Self {
            apply_labels: true,
            create_missing_labels: true,
            category_actions,
            default_actions: Vec::new(),
        }
    }
}

impl LoadConfig {
    /// Resolve the ordered action list for a category.
    pub fn actions_for(&self, category: &str) -> Vec<String> {
        self.category_actions
            .get(category)
            .cloned()
            .unwrap_or_else(|| self.default_actions.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    /// Flush RunMetrics to `metrics_path` when the run ends.
    pub save_metrics: bool,
    /// Append a history row whenever an item's labels change.
    pub track_history: bool,
    pub metrics_path: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/email_pipeline.db"),
            save_metrics: true,
            track_history: true,
            metrics_path: PathBuf::from("pipeline_metrics.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    /// Directory for a daily-rolling log file. Console only when unset.
    pub log_dir: Option<PathBuf>,
    pub metrics_export: MetricsExport,
}

/// File format for exported run metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsExport {
    #[default]
    Json,
    /// One row per stage, category, action and error, next to `metrics_path` as `.csv`.
    Csv,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            metrics_export: MetricsExport::Json,
        }
    }
}

/// On-disk document shape: everything lives under `pipeline:`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    pipeline: PipelineConfig,
}

// ── Sources ─────────────────────────────────────────────────────────

/// Inputs to [`PipelineConfig::load`].
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    pub file: Option<PathBuf>,
    /// Environment snapshot as (name, value) pairs.
    pub env: Vec<(String, String)>,
}

impl ConfigSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    /// Snapshot the process environment.
    pub fn from_process_env(file: Option<PathBuf>) -> Self {
        Self {
            file,
            env: std::env::vars().collect(),
        }
    }
}

/// Command-line overrides applied on top of a loaded config, before the run.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub source: Option<ExtractSource>,
    pub query: Option<String>,
    pub limit: Option<usize>,
}

// ── Validation ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// One finding from [`PipelineConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigIssue {
    pub path: String,
    pub message: String,
    pub severity: Severity,
}

impl ConfigIssue {
    fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            severity: Severity::Error,
        }
    }

    fn warning(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            severity: Severity::Warning,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "[{tag}] {}: {}", self.path, self.message)
    }
}

impl PipelineConfig {
    /// Merge defaults, the optional YAML file, and environment overrides.
    pub fn load(sources: &ConfigSources) -> Result<Self, ConfigError> {
        let mut tree = serde_yaml::to_value(ConfigDocument::default())
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(path) = &sources.file {
            let overlay = read_yaml_file(path)?;
            merge(&mut tree, overlay, "");
        }

        for (mut path, value) in env_overrides(&sources.env) {
            match_category_key(&tree, &mut path);
            set_path(&mut tree, &path, value)?;
        }

        let doc: ConfigDocument =
            serde_yaml::from_value(tree).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        Ok(doc.pipeline)
    }

    /// Defaults overlaid with an in-memory YAML document.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let mut tree = serde_yaml::to_value(ConfigDocument::default())
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let overlay: Value =
            serde_yaml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        merge(&mut tree, overlay, "");
        let doc: ConfigDocument =
            serde_yaml::from_value(tree).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        Ok(doc.pipeline)
    }

    /// Where the metrics sink writes, given the export format.
    pub fn metrics_file(&self) -> PathBuf {
        match self.monitoring.metrics_export {
            MetricsExport::Json => self.sync.metrics_path.clone(),
            MetricsExport::Csv => self.sync.metrics_path.with_extension("csv"),
        }
    }

    /// Render as a full YAML document (`generate-config`).
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        #[derive(Serialize)]
        struct Out<'a> {
            pipeline: &'a PipelineConfig,
        }
        serde_yaml::to_string(&Out { pipeline: self })
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn apply_overrides(&mut self, overrides: &RunOverrides) {
        if let Some(source) = overrides.source {
            self.extract.source = source;
        }
        if let Some(query) = &overrides.query {
            self.extract.query = query.clone();
        }
        if let Some(limit) = overrides.limit {
            self.extract.max_results = Some(limit);
            self.extract.batch_size = self.extract.batch_size.min(limit);
        }
    }

    /// Check structural invariants. Never fails; callers decide what is fatal.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let transform = &self.transform;

        if transform.categories.is_empty() {
            issues.push(ConfigIssue::error(
                "pipeline.transform.categories",
                "at least one category is required",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for category in &transform.categories {
            if !seen.insert(category.as_str()) {
                issues.push(ConfigIssue::warning(
                    "pipeline.transform.categories",
                    format!("duplicate category '{category}'"),
                ));
            }
        }
        if transform.fallback_category.trim().is_empty() {
            issues.push(ConfigIssue::error(
                "pipeline.transform.fallback_category",
                "fallback category must not be empty",
            ));
        }
        if transform.model.trim().is_empty() {
            issues.push(ConfigIssue::error(
                "pipeline.transform.model",
                "model name is required",
            ));
        }
        if transform.concurrency == 0 {
            issues.push(ConfigIssue::error(
                "pipeline.transform.concurrency",
                "must be at least 1",
            ));
        }

        for (category, actions) in &self.load.category_actions {
            if category != FALLBACK_CATEGORY && !transform.is_known_category(category) {
                issues.push(ConfigIssue::error(
                    format!("pipeline.load.category_actions.{category}"),
                    format!("category '{category}' is not listed in pipeline.transform.categories"),
                ));
            }
            for action in actions {
                if !KNOWN_ACTIONS.contains(&action.as_str()) {
                    issues.push(ConfigIssue::warning(
                        format!("pipeline.load.category_actions.{category}"),
                        format!("unknown action '{action}'"),
                    ));
                }
            }
        }
        for action in &self.load.default_actions {
            if !KNOWN_ACTIONS.contains(&action.as_str()) {
                issues.push(ConfigIssue::warning(
                    "pipeline.load.default_actions",
                    format!("unknown action '{action}'"),
                ));
            }
        }

        if self.extract.batch_size == 0 {
            issues.push(ConfigIssue::error(
                "pipeline.extract.batch_size",
                "must be greater than zero",
            ));
        }
        if self.extract.max_results == Some(0) {
            issues.push(ConfigIssue::error(
                "pipeline.extract.max_results",
                "must be greater than zero when set",
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_tolerance) {
            issues.push(ConfigIssue::error(
                "pipeline.failure_tolerance",
                "must be between 0.0 and 1.0",
            ));
        }
        if self.retry.max_attempts == 0 {
            issues.push(ConfigIssue::error(
                "pipeline.retry.max_attempts",
                "must be at least 1",
            ));
        }
        if self.retry.call_timeout_secs == 0 {
            issues.push(ConfigIssue::error(
                "pipeline.retry.call_timeout_secs",
                "must be greater than zero",
            ));
        }
        if self.sync.database_path.as_os_str().is_empty() {
            issues.push(ConfigIssue::error(
                "pipeline.sync.database_path",
                "database path is required",
            ));
        }
        if self.sync.save_metrics && self.sync.metrics_path.as_os_str().is_empty() {
            issues.push(ConfigIssue::error(
                "pipeline.sync.metrics_path",
                "metrics path is required when save_metrics is enabled",
            ));
        }

        issues
    }

    /// Fail with every error-severity issue, if any.
    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        let errors: Vec<ConfigIssue> = self
            .validate()
            .into_iter()
            .filter(ConfigIssue::is_error)
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

// ── Tree merging ────────────────────────────────────────────────────

fn read_yaml_file(path: &Path) -> Result<Value, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    let value: Value = serde_yaml::from_str(&text)
        .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;
    // An empty file parses as null; treat it as "no overrides".
    Ok(if value.is_null() {
        Value::Mapping(Mapping::new())
    } else {
        value
    })
}

fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

/// Overlay `overlay` onto `base`; mappings merge per key, everything else replaces.
fn merge(base: &mut Value, overlay: Value, path: &str) {
    if let Value::Mapping(overlay_map) = overlay {
        if let Value::Mapping(base_map) = base {
            if !LEAF_MAPS.contains(&path) {
                for (key, value) in overlay_map {
                    let child = join_path(path, key.as_str().unwrap_or_default());
                    match base_map.get_mut(&key) {
                        Some(existing) => merge(existing, value, &child),
                        None => {
                            base_map.insert(key, value);
                        }
                    }
                }
                return;
            }
        }
        *base = Value::Mapping(overlay_map);
        return;
    }
    *base = overlay;
}

/// Translate environment variables into (key path, value) overrides.
///
/// Legacy names come first so the explicit `INBOX_ETL__` form wins.
fn env_overrides(env: &[(String, String)]) -> Vec<(Vec<String>, Value)> {
    let mut legacy = Vec::new();
    let mut prefixed = Vec::new();

    let path = |parts: &[&str]| -> Vec<String> {
        std::iter::once("pipeline")
            .chain(parts.iter().copied())
            .map(String::from)
            .collect()
    };

    for (name, raw) in env {
        match name.as_str() {
            "LLM_SERVICE" => legacy.push((
                path(&["transform", "provider"]),
                Value::String(raw.to_lowercase()),
            )),
            "OPENAI_MODEL" | "OLLAMA_MODEL" => {
                legacy.push((path(&["transform", "model"]), Value::String(raw.clone())))
            }
            "DATABASE_PATH" => legacy.push((
                path(&["sync", "database_path"]),
                Value::String(raw.clone()),
            )),
            "LOG_LEVEL" => legacy.push((
                path(&["monitoring", "log_level"]),
                Value::String(raw.to_lowercase()),
            )),
            _ => {
                if let Some(rest) = name.strip_prefix(ENV_PREFIX) {
                    let mut key_path = vec!["pipeline".to_string()];
                    for segment in rest.split("__").filter(|s| !s.is_empty()) {
                        // Category names below `category_actions` are case-sensitive.
                        if key_path.last().is_some_and(|k| k == "category_actions") {
                            key_path.push(segment.to_string());
                        } else {
                            key_path.push(segment.to_lowercase());
                        }
                    }
                    if key_path.len() > 1 {
                        prefixed.push((key_path, parse_scalar(raw)));
                    }
                }
            }
        }
    }

    legacy.extend(prefixed);
    legacy
}

/// Rewrite an env-spelled category key (`BILLS`) to the configured category it names.
///
/// Known names are the transform categories, the existing `category_actions`
/// keys, and the fallback. Unmatched keys are kept as given.
fn match_category_key(tree: &Value, path: &mut [String]) {
    let Some(index) = path
        .iter()
        .position(|k| k == "category_actions")
        .map(|i| i + 1)
    else {
        return;
    };
    let Some(key) = path.get(index) else {
        return;
    };
    let pipeline = &tree["pipeline"];
    let categories = pipeline["transform"]["categories"]
        .as_sequence()
        .into_iter()
        .flatten()
        .filter_map(Value::as_str);
    let mapped = pipeline["load"]["category_actions"]
        .as_mapping()
        .into_iter()
        .flat_map(|m| m.keys())
        .filter_map(Value::as_str);
    let known = categories
        .chain(mapped)
        .chain(std::iter::once(FALLBACK_CATEGORY))
        .find(|name| name.eq_ignore_ascii_case(key))
        .map(str::to_string);
    if let Some(name) = known {
        path[index] = name;
    }
}

/// Interpret an environment value as a YAML scalar (`true`, `25`, `~`), else a string.
fn parse_scalar(raw: &str) -> Value {
    match serde_yaml::from_str::<Value>(raw) {
        Ok(v @ (Value::Bool(_) | Value::Number(_) | Value::Null | Value::String(_))) => v,
        Ok(v @ Value::Sequence(_)) => v,
        _ => Value::String(raw.to_string()),
    }
}

fn set_path(tree: &mut Value, path: &[String], value: Value) -> Result<(), ConfigError> {
    let Some((last, parents)) = path.split_last() else {
        return Ok(());
    };
    let mut node = tree;
    for key in parents {
        let Value::Mapping(map) = node else {
            return Err(ConfigError::InvalidValue {
                key: path.join("."),
                message: format!("'{key}' is not a section"),
            });
        };
        node = map
            .entry(Value::String(key.clone()))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
    }
    match node {
        Value::Mapping(map) => {
            map.insert(Value::String(last.clone()), value);
            Ok(())
        }
        _ => Err(ConfigError::InvalidValue {
            key: path.join("."),
            message: "parent is not a section".into(),
        }),
    }
}
