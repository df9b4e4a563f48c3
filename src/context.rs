//! Run context: the state one pipeline run owns.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::metrics::{MetricsCollector, RunMetrics};

/// Execution mode, fixed when the run starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMode {
    /// Resolve actions but never touch the mail store.
    pub dry_run: bool,
    /// Like `dry_run`, and render a summary line per item.
    pub preview: bool,
    /// Collaborators were replaced with in-process doubles.
    pub test: bool,
}

impl RunMode {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Default::default()
        }
    }

    pub fn preview() -> Self {
        Self {
            preview: true,
            ..Default::default()
        }
    }

    /// Load and Sync must not write anything.
    pub fn is_read_only(&self) -> bool {
        self.dry_run || self.preview
    }
}

/// Shared state for exactly one run.
///
/// Stages get `&mut RunContext` but can only append: record errors and
/// metrics, or ask for a metrics flush. Config and mode are read-only.
#[derive(Debug)]
pub struct RunContext {
    run_id: Uuid,
    config: Arc<PipelineConfig>,
    mode: RunMode,
    metrics: MetricsCollector,
    errors: Vec<String>,
    flush_requested: bool,
}

impl RunContext {
    pub fn new(config: Arc<PipelineConfig>, mode: RunMode) -> Self {
        let run_id = Uuid::new_v4();
        Self {
            run_id,
            config,
            mode,
            metrics: MetricsCollector::new(run_id),
            errors: Vec::new(),
            flush_requested: false,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Owned handle, for stages that read config while appending to the context.
    pub fn shared_config(&self) -> Arc<PipelineConfig> {
        Arc::clone(&self.config)
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut MetricsCollector {
        &mut self.metrics
    }

    /// Append an error summary to the context and to the run metrics.
    pub fn record_error(&mut self, summary: impl Into<String>) {
        let summary = summary.into();
        self.metrics.record_error(summary.clone());
        self.errors.push(summary);
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Ask the orchestrator to export metrics once the current stage is recorded.
    pub fn request_metrics_flush(&mut self) {
        self.flush_requested = true;
    }

    pub(crate) fn take_flush_request(&mut self) -> bool {
        std::mem::take(&mut self.flush_requested)
    }

    /// Whether `failed` out of `total` is over `failure_tolerance`.
    pub fn exceeds_tolerance(&self, failed: usize, total: usize) -> bool {
        total > 0 && failed as f64 / total as f64 > self.config.failure_tolerance
    }

    /// A stage should stop attempting items: the run will abort on this batch anyway.
    pub fn should_stop_batch(&self, failed: usize, total: usize) -> bool {
        !self.config.continue_on_error && self.exceeds_tolerance(failed, total)
    }

    pub fn finalize_metrics(&mut self) -> RunMetrics {
        self.metrics.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_mirrored_into_metrics() {
        let mut ctx = RunContext::new(Arc::new(PipelineConfig::default()), RunMode::default());
        ctx.record_error("transform: m1: timed out");
        assert_eq!(ctx.errors().len(), 1);
        assert_eq!(ctx.metrics().snapshot().errors, ctx.errors());
        assert_eq!(ctx.metrics().snapshot().run_id, ctx.run_id());
    }

    #[test]
    fn fail_fast_only_without_continuation() {
        let mut config = PipelineConfig::default();
        config.continue_on_error = false;
        let ctx = RunContext::new(Arc::new(config.clone()), RunMode::default());
        assert!(!ctx.should_stop_batch(0, 3));
        assert!(ctx.should_stop_batch(1, 3));

        config.continue_on_error = true;
        let ctx = RunContext::new(Arc::new(config), RunMode::default());
        assert!(ctx.exceeds_tolerance(1, 3));
        assert!(!ctx.should_stop_batch(3, 3));
    }

    #[test]
    fn flush_request_is_consumed_once() {
        let mut ctx = RunContext::new(Arc::new(PipelineConfig::default()), RunMode::preview());
        assert!(ctx.mode().is_read_only());
        ctx.request_metrics_flush();
        assert!(ctx.take_flush_request());
        assert!(!ctx.take_flush_request());
    }
}
