//! Run metrics: per-stage counters, category histogram, export.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MetricsError, StageError};
use crate::pipeline::types::StageResult;

/// Counts for one stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub name: String,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    #[serde(default)]
    pub unattempted: usize,
    pub elapsed_ms: u64,
    /// Batch-fatal error, if the stage produced no successes because of one.
    #[serde(default)]
    pub fatal: Option<String>,
}

/// Everything recorded about one run. This is the exported document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageMetrics>,
    pub categories: BTreeMap<String, u64>,
    #[serde(default)]
    pub fallbacks: u64,
    #[serde(default)]
    pub actions: BTreeMap<String, u64>,
    pub errors: Vec<String>,
}

impl RunMetrics {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            ended_at: None,
            stages: Vec::new(),
            categories: BTreeMap::new(),
            fallbacks: 0,
            actions: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    /// Most recent entry for `name`.
    pub fn stage(&self, name: &str) -> Option<&StageMetrics> {
        self.stages.iter().rev().find(|s| s.name == name)
    }

    pub fn to_json_pretty(&self) -> Result<String, MetricsError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// The document flattened to CSV rows: stages, then categories, actions,
    /// fallbacks and errors.
    pub fn csv_rows(&self) -> Vec<MetricsRow> {
        let row = |kind, name: &str, count| MetricsRow {
            run_id: self.run_id,
            ended_at: self.ended_at,
            kind,
            name: name.to_string(),
            count,
            attempted: None,
            failed: None,
            unattempted: None,
            elapsed_ms: None,
        };

        let mut rows: Vec<MetricsRow> = self
            .stages
            .iter()
            .map(|s| MetricsRow {
                attempted: Some(s.attempted),
                failed: Some(s.failed),
                unattempted: Some(s.unattempted),
                elapsed_ms: Some(s.elapsed_ms),
                ..row(RowKind::Stage, &s.name, s.succeeded as u64)
            })
            .collect();
        rows.extend(
            self.categories
                .iter()
                .map(|(name, count)| row(RowKind::Category, name, *count)),
        );
        rows.extend(
            self.actions
                .iter()
                .map(|(name, count)| row(RowKind::Action, name, *count)),
        );
        if self.fallbacks > 0 {
            rows.push(row(RowKind::Fallback, "fallback", self.fallbacks));
        }
        rows.extend(self.errors.iter().map(|e| row(RowKind::Error, e, 1)));
        rows
    }
}

/// What a [`MetricsRow`] counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    Stage,
    Category,
    Action,
    Fallback,
    Error,
}

/// One line of the CSV export. Stage rows count successes and carry the
/// per-stage columns; other rows leave them empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRow {
    pub run_id: Uuid,
    pub ended_at: Option<DateTime<Utc>>,
    pub kind: RowKind,
    pub name: String,
    pub count: u64,
    pub attempted: Option<usize>,
    pub failed: Option<usize>,
    pub unattempted: Option<usize>,
    pub elapsed_ms: Option<u64>,
}

/// Accumulates [`RunMetrics`] for one run. Append-only.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    metrics: RunMetrics,
}

impl MetricsCollector {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            metrics: RunMetrics::new(run_id),
        }
    }

    pub fn record_stage(&mut self, stage: &str, result: &StageResult, elapsed: Duration) {
        self.metrics.stages.push(StageMetrics {
            name: stage.to_string(),
            attempted: result.attempted,
            succeeded: result.succeeded(),
            failed: result.failed(),
            unattempted: result.unattempted,
            elapsed_ms: elapsed.as_millis() as u64,
            fatal: None,
        });
    }

    /// A stage that failed as a whole: every input item counts as failed.
    pub fn record_stage_failure(
        &mut self,
        stage: &str,
        input_len: usize,
        error: &StageError,
        elapsed: Duration,
    ) {
        self.metrics.stages.push(StageMetrics {
            name: stage.to_string(),
            attempted: input_len,
            succeeded: 0,
            failed: input_len,
            unattempted: 0,
            elapsed_ms: elapsed.as_millis() as u64,
            fatal: Some(error.to_string()),
        });
    }

    pub fn record_category(&mut self, category: &str) {
        *self
            .metrics
            .categories
            .entry(category.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_fallback(&mut self) {
        self.metrics.fallbacks += 1;
    }

    pub fn record_action(&mut self, action: &str) {
        *self.metrics.actions.entry(action.to_string()).or_insert(0) += 1;
    }

    pub fn record_error(&mut self, summary: impl Into<String>) {
        self.metrics.errors.push(summary.into());
    }

    /// Current state without closing the run.
    pub fn snapshot(&self) -> RunMetrics {
        self.metrics.clone()
    }

    /// Stamp the end time (first call only) and return the final snapshot.
    pub fn finalize(&mut self) -> RunMetrics {
        if self.metrics.ended_at.is_none() {
            self.metrics.ended_at = Some(Utc::now());
        }
        self.metrics.clone()
    }
}

// ── Sinks ───────────────────────────────────────────────────────────

/// Destination for exported metrics.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn export(&self, metrics: &RunMetrics) -> Result<(), MetricsError>;
}

/// Writes the metrics document as pretty JSON, replacing any previous run.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MetricsSink for JsonFileSink {
    async fn export(&self, metrics: &RunMetrics) -> Result<(), MetricsError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = metrics.to_json_pretty()?;
        tokio::fs::write(&self.path, json).await?;
        tracing::debug!(path = %self.path.display(), run_id = %metrics.run_id, "Metrics exported");
        Ok(())
    }
}

/// Writes [`RunMetrics::csv_rows`] with a header line, replacing any previous run.
#[derive(Debug, Clone)]
pub struct CsvFileSink {
    path: PathBuf,
}

impl CsvFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MetricsSink for CsvFileSink {
    async fn export(&self, metrics: &RunMetrics) -> Result<(), MetricsError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in metrics.csv_rows() {
            writer.serialize(row)?;
        }
        let bytes = writer.into_inner().map_err(|e| e.into_error())?;
        tokio::fs::write(&self.path, bytes).await?;
        tracing::debug!(path = %self.path.display(), run_id = %metrics.run_id, "Metrics exported as CSV");
        Ok(())
    }
}

/// Read a document written by [`JsonFileSink`].
pub async fn read_metrics_file(path: &Path) -> Result<RunMetrics, MetricsError> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&text)?)
}
