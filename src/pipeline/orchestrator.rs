//! Orchestrator: drives a linear chain of named stages against one run context.
//!
//! The chain is assembled once, before any run starts. Each run gets a fresh
//! [`RunContext`]; the output of stage *n* is the input of stage *n + 1*.
//! Mode flags live on the context and are read by the stages themselves, so
//! the sequencing below is the same in every mode.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::context::{RunContext, RunMode};
use crate::error::{Error, PipelineError, RunAborted, StageError};
use crate::metrics::{MetricsSink, RunMetrics};
use crate::pipeline::stage::{EXTRACT, Stage};
use crate::pipeline::types::{Batch, StageResult};

// ── Chain ───────────────────────────────────────────────────────────

/// Ordered, uniquely named stages.
#[derive(Clone, Default)]
pub struct StageChain {
    entries: Vec<(String, Arc<dyn Stage>)>,
}

impl std::fmt::Debug for StageChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl StageChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage at the end of the chain.
    pub fn push(
        &mut self,
        name: impl Into<String>,
        stage: Arc<dyn Stage>,
    ) -> Result<(), PipelineError> {
        let name = self.check_new(name.into())?;
        self.entries.push((name, stage));
        Ok(())
    }

    /// Insert a stage directly after `after`.
    pub fn insert_after(
        &mut self,
        after: &str,
        name: impl Into<String>,
        stage: Arc<dyn Stage>,
    ) -> Result<(), PipelineError> {
        let index = self.require(after)?;
        let name = self.check_new(name.into())?;
        self.entries.insert(index + 1, (name, stage));
        Ok(())
    }

    /// Insert a stage directly before `before`.
    pub fn insert_before(
        &mut self,
        before: &str,
        name: impl Into<String>,
        stage: Arc<dyn Stage>,
    ) -> Result<(), PipelineError> {
        let index = self.require(before)?;
        let name = self.check_new(name.into())?;
        self.entries.insert(index, (name, stage));
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<Arc<dyn Stage>, PipelineError> {
        let index = self.require(name)?;
        Ok(self.entries.remove(index).1)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n == name)
    }

    fn require(&self, name: &str) -> Result<usize, PipelineError> {
        self.position(name)
            .ok_or_else(|| PipelineError::UnknownStage(name.to_string()))
    }

    fn check_new(&self, name: String) -> Result<String, PipelineError> {
        if self.contains(&name) {
            Err(PipelineError::DuplicateStage(name))
        } else {
            Ok(name)
        }
    }
}

// ── Report ──────────────────────────────────────────────────────────

/// What a run that reached the end of its chain produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    /// Stages that returned a result, in execution order.
    pub stages_completed: Vec<String>,
    /// Items Extract produced; zero when the run did not start at Extract.
    pub emails_extracted: usize,
    /// Output of the last stage.
    pub output: Batch,
    pub previews: Vec<String>,
    pub stage_results: Vec<(String, StageResult)>,
    pub metrics: RunMetrics,
    pub errors: Vec<String>,
}

impl RunReport {
    pub fn result(&self, stage: &str) -> Option<&StageResult> {
        self.stage_results
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, result)| result)
    }

    /// Every stage finished without item failures.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

// ── Orchestrator ────────────────────────────────────────────────────

pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    chain: StageChain,
    sink: Option<Arc<dyn MetricsSink>>,
}

impl Orchestrator {
    pub fn new(config: Arc<PipelineConfig>, chain: StageChain) -> Self {
        Self {
            config,
            chain,
            sink: None,
        }
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn chain(&self) -> &StageChain {
        &self.chain
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the whole chain from its first stage with an empty batch.
    pub async fn run(&self, mode: RunMode) -> crate::Result<RunReport> {
        self.execute(&self.chain.entries, Batch::Empty, mode).await
    }

    /// Resume at `stage` with a batch produced by an earlier run.
    pub async fn run_from(
        &self,
        stage: &str,
        batch: Batch,
        mode: RunMode,
    ) -> crate::Result<RunReport> {
        let start = self.chain.require(stage)?;
        info!(stage, items = batch.len(), "Resuming run");
        self.execute(&self.chain.entries[start..], batch, mode).await
    }

    /// Run exactly one stage.
    pub async fn run_stage(
        &self,
        stage: &str,
        batch: Batch,
        mode: RunMode,
    ) -> crate::Result<RunReport> {
        let index = self.chain.require(stage)?;
        self.execute(&self.chain.entries[index..=index], batch, mode)
            .await
    }

    async fn execute(
        &self,
        stages: &[(String, Arc<dyn Stage>)],
        batch: Batch,
        mode: RunMode,
    ) -> crate::Result<RunReport> {
        let mode = RunMode {
            dry_run: mode.dry_run || self.config.dry_run,
            ..mode
        };
        let mut ctx = RunContext::new(Arc::clone(&self.config), mode);
        let run_id = ctx.run_id();
        info!(
            %run_id,
            stages = ?stages.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            dry_run = mode.dry_run,
            preview = mode.preview,
            test = mode.test,
            "Pipeline run starting"
        );

        let mut current = batch;
        let mut stages_completed = Vec::new();
        let mut stage_results = Vec::new();
        let mut previews = Vec::new();
        let mut emails_extracted = 0;
        let mut flush_requested = false;

        for (name, stage) in stages {
            let input_len = current.len();
            let started = Instant::now();

            let outcome = if stage.validate_input(&current) {
                debug!(%run_id, stage = %name, items = input_len, "Stage starting");
                stage.execute(std::mem::take(&mut current), &mut ctx).await
            } else {
                Err(StageError::Validation {
                    stage: name.clone(),
                    reason: format!("rejected {} batch of {input_len} item(s)", current.kind()),
                })
            };
            let elapsed = started.elapsed();
            flush_requested |= ctx.take_flush_request();

            match outcome {
                Ok(result) => {
                    self.record(&mut ctx, name, &result, elapsed);
                    if name == EXTRACT {
                        emails_extracted = result.succeeded();
                    }
                    previews.extend(result.previews.iter().cloned());

                    let failure_rate = result.failure_rate();
                    if failure_rate > self.config.failure_tolerance {
                        let error = StageError::ToleranceExceeded {
                            stage: name.clone(),
                            failed: result.failed(),
                            total: result.attempted + result.unattempted,
                        };
                        if !self.config.continue_on_error {
                            return Err(self.abort(ctx, name, error, stages_completed).await);
                        }
                        warn!(%run_id, stage = %name, %error, "Continuing with successful items");
                    }

                    stages_completed.push(name.clone());
                    current = result.output.clone();
                    stage_results.push((name.clone(), result));
                }
                Err(error) => {
                    ctx.metrics_mut()
                        .record_stage_failure(name, input_len, &error, elapsed);
                    ctx.record_error(format!("{name}: {error}"));
                    if error.is_run_fatal() || !self.config.continue_on_error {
                        return Err(self.abort(ctx, name, error, stages_completed).await);
                    }
                    warn!(%run_id, stage = %name, %error, "Stage failed, continuing with an empty batch");
                    current = Batch::Empty;
                }
            }
        }

        let metrics = ctx.finalize_metrics();
        if flush_requested {
            self.flush(&metrics).await;
        }
        info!(
            %run_id,
            stages = stages_completed.len(),
            emails_extracted,
            output = current.len(),
            errors = ctx.errors().len(),
            "Pipeline run complete"
        );

        Ok(RunReport {
            run_id,
            stages_completed,
            emails_extracted,
            output: current,
            previews,
            stage_results,
            metrics,
            errors: ctx.errors().to_vec(),
        })
    }

    /// Fold one stage's result into the run metrics and error list.
    fn record(
        &self,
        ctx: &mut RunContext,
        name: &str,
        result: &StageResult,
        elapsed: std::time::Duration,
    ) {
        let metrics = ctx.metrics_mut();
        metrics.record_stage(name, result, elapsed);
        for category in &result.categorized {
            metrics.record_category(category);
        }
        for _ in 0..result.fallbacks {
            metrics.record_fallback();
        }
        for action in &result.actions {
            metrics.record_action(action);
        }
        for failure in &result.failures {
            ctx.record_error(format!("{name}: {}: {}", failure.item_id, failure.reason));
        }
        info!(
            run_id = %ctx.run_id(),
            stage = %name,
            attempted = result.attempted,
            succeeded = result.succeeded(),
            failed = result.failed(),
            unattempted = result.unattempted,
            elapsed_ms = elapsed.as_millis() as u64,
            "Stage finished"
        );
    }

    async fn abort(
        &self,
        mut ctx: RunContext,
        stage: &str,
        error: StageError,
        stages_completed: Vec<String>,
    ) -> Error {
        error!(run_id = %ctx.run_id(), stage, %error, "Pipeline run aborted");
        let metrics = ctx.finalize_metrics();
        if self.config.sync.save_metrics {
            self.flush(&metrics).await;
        }
        Error::Aborted(Box::new(RunAborted {
            stage: stage.to_string(),
            error,
            metrics,
            stages_completed,
        }))
    }

    /// Best-effort export; a failing sink never changes the run's outcome.
    async fn flush(&self, metrics: &RunMetrics) {
        let Some(sink) = &self.sink else {
            return;
        };
        if let Err(e) = sink.export(metrics).await {
            warn!(run_id = %metrics.run_id, error = %e, "Failed to export metrics");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CollaboratorError, MetricsError};
    use crate::pipeline::types::{EmailRecord, ItemFailure};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    type Behaviour = fn(Batch) -> Result<StageResult, StageError>;

    /// Stage driven by a plain function, counting its executions.
    struct FnStage {
        accepts: fn(&Batch) -> bool,
        behaviour: Behaviour,
        runs: AtomicUsize,
        last_input: std::sync::Mutex<Vec<String>>,
    }

    impl FnStage {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                accepts: |_| true,
                behaviour,
                runs: AtomicUsize::new(0),
                last_input: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn strict(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                accepts: |b| matches!(b, Batch::Emails(_)),
                behaviour,
                runs: AtomicUsize::new(0),
                last_input: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }

        fn last_input(&self) -> Vec<String> {
            self.last_input.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Stage for FnStage {
        fn validate_input(&self, batch: &Batch) -> bool {
            (self.accepts)(batch)
        }

        async fn execute(
            &self,
            batch: Batch,
            _ctx: &mut RunContext,
        ) -> Result<StageResult, StageError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            *self.last_input.lock().unwrap() = batch.ids();
            (self.behaviour)(batch)
        }
    }

    #[derive(Default)]
    struct CaptureSink {
        exported: Mutex<Vec<RunMetrics>>,
    }

    #[async_trait]
    impl MetricsSink for CaptureSink {
        async fn export(&self, metrics: &RunMetrics) -> Result<(), MetricsError> {
            self.exported.lock().await.push(metrics.clone());
            Ok(())
        }
    }

    fn three() -> Result<StageResult, StageError> {
        Ok(StageResult::passthrough(Batch::Emails(vec![
            EmailRecord::new("1", "", "", ""),
            EmailRecord::new("2", "", "", ""),
            EmailRecord::new("3", "", "", ""),
        ])))
    }

    fn drop_second(batch: Batch) -> Result<StageResult, StageError> {
        let Batch::Emails(mut items) = batch else {
            return Ok(StageResult::default());
        };
        let attempted = items.len();
        items.retain(|e| e.id != "2");
        Ok(StageResult {
            output: Batch::Emails(items),
            failures: vec![ItemFailure::new("2", "timed out")],
            attempted,
            ..Default::default()
        })
    }

    fn passthrough(batch: Batch) -> Result<StageResult, StageError> {
        Ok(StageResult::passthrough(batch))
    }

    fn unreachable_service(_: Batch) -> Result<StageResult, StageError> {
        Err(StageError::Unavailable {
            stage: "middle".into(),
            source: CollaboratorError::Transient {
                service: "svc".into(),
                reason: "down".into(),
            },
        })
    }

    fn revoked(_: Batch) -> Result<StageResult, StageError> {
        Err(StageError::Auth {
            stage: "middle".into(),
            source: CollaboratorError::Auth {
                service: "svc".into(),
                reason: "revoked".into(),
            },
        })
    }

    fn config(continue_on_error: bool) -> Arc<PipelineConfig> {
        let mut config = PipelineConfig::default();
        config.continue_on_error = continue_on_error;
        Arc::new(config)
    }

    fn chain(stages: Vec<(&str, Arc<FnStage>)>) -> StageChain {
        let mut chain = StageChain::new();
        for (name, stage) in stages {
            chain.push(name, stage).unwrap();
        }
        chain
    }

    #[test]
    fn chain_insertion_keeps_a_single_line() {
        let mut chain = chain(vec![
            ("extract", FnStage::new(passthrough)),
            ("transform", FnStage::new(passthrough)),
            ("load", FnStage::new(passthrough)),
        ]);
        chain
            .insert_after("transform", "audit", FnStage::new(passthrough))
            .unwrap();
        chain
            .insert_before("extract", "warmup", FnStage::new(passthrough))
            .unwrap();
        assert_eq!(
            chain.names(),
            vec!["warmup", "extract", "transform", "audit", "load"]
        );

        assert!(matches!(
            chain.insert_after("missing", "x", FnStage::new(passthrough)),
            Err(PipelineError::UnknownStage(name)) if name == "missing"
        ));
        assert!(matches!(
            chain.push("audit", FnStage::new(passthrough)),
            Err(PipelineError::DuplicateStage(_))
        ));

        chain.remove("warmup").unwrap();
        assert_eq!(chain.len(), 4);
        assert!(chain.remove("warmup").is_err());
    }

    #[tokio::test]
    async fn continuation_hands_on_successful_items() {
        let last = FnStage::new(passthrough);
        let orchestrator = Orchestrator::new(
            config(true),
            chain(vec![
                ("first", FnStage::new(|_| three())),
                ("middle", FnStage::new(drop_second)),
                ("last", last.clone()),
            ]),
        );

        let report = orchestrator.run(RunMode::default()).await.unwrap();
        assert_eq!(last.last_input(), vec!["1", "3"]);
        assert_eq!(report.stages_completed, vec!["first", "middle", "last"]);
        assert_eq!(report.errors, vec!["middle: 2: timed out"]);
        assert_eq!(report.metrics.stage("middle").unwrap().failed, 1);
        assert!(report.metrics.ended_at.is_some());
    }

    #[tokio::test]
    async fn abort_preserves_metrics_and_skips_later_stages() {
        let last = FnStage::new(passthrough);
        let orchestrator = Orchestrator::new(
            config(false),
            chain(vec![
                ("first", FnStage::new(|_| three())),
                ("middle", FnStage::new(drop_second)),
                ("last", last.clone()),
            ]),
        );

        let err = orchestrator.run(RunMode::default()).await.unwrap_err();
        let Error::Aborted(aborted) = err else {
            panic!("expected abort");
        };
        assert_eq!(aborted.stage, "middle");
        assert!(matches!(aborted.error, StageError::ToleranceExceeded { failed: 1, total: 3, .. }));
        assert_eq!(aborted.stages_completed, vec!["first"]);
        assert_eq!(aborted.metrics.stages.len(), 2);
        assert_eq!(last.runs(), 0);
    }

    #[tokio::test]
    async fn validation_failure_skips_execute() {
        let strict = FnStage::strict(passthrough);
        let orchestrator = Orchestrator::new(
            config(false),
            chain(vec![("only", strict.clone())]),
        );
        let err = orchestrator
            .run_stage("only", Batch::Empty, RunMode::default())
            .await
            .unwrap_err();
        let Error::Aborted(aborted) = err else {
            panic!("expected abort");
        };
        assert!(matches!(aborted.error, StageError::Validation { .. }));
        assert_eq!(strict.runs(), 0);
    }

    #[tokio::test]
    async fn batch_fatal_failure_continues_with_empty_batch() {
        let last = FnStage::new(passthrough);
        let orchestrator = Orchestrator::new(
            config(true),
            chain(vec![
                ("first", FnStage::new(|_| three())),
                ("middle", FnStage::new(unreachable_service)),
                ("last", last.clone()),
            ]),
        );
        let report = orchestrator.run(RunMode::default()).await.unwrap();
        assert_eq!(last.runs(), 1);
        assert!(last.last_input().is_empty());
        assert_eq!(report.stages_completed, vec!["first", "last"]);
        let middle = report.metrics.stage("middle").unwrap();
        assert_eq!((middle.attempted, middle.failed), (3, 3));
        assert!(middle.fatal.is_some());
    }

    #[tokio::test]
    async fn auth_failure_aborts_despite_continuation() {
        let sink = Arc::new(CaptureSink::default());
        let orchestrator = Orchestrator::new(
            config(true),
            chain(vec![
                ("first", FnStage::new(|_| three())),
                ("middle", FnStage::new(revoked)),
                ("last", FnStage::new(passthrough)),
            ]),
        )
        .with_metrics_sink(sink.clone());

        let err = orchestrator.run(RunMode::default()).await.unwrap_err();
        assert!(matches!(err, Error::Aborted(ref a) if a.error.is_run_fatal()));
        // save_metrics defaults on: the partial document is still exported.
        let exported = sink.exported.lock().await;
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].stages.len(), 2);
    }

    #[tokio::test]
    async fn run_from_bypasses_earlier_stages() {
        let first = FnStage::new(|_| three());
        let last = FnStage::new(passthrough);
        let orchestrator = Orchestrator::new(
            config(true),
            chain(vec![("first", first.clone()), ("last", last.clone())]),
        );
        let batch = Batch::Emails(vec![EmailRecord::new("9", "", "", "")]);
        let report = orchestrator
            .run_from("last", batch, RunMode::default())
            .await
            .unwrap();
        assert_eq!(first.runs(), 0);
        assert_eq!(report.output.ids(), vec!["9"]);
        assert_eq!(report.emails_extracted, 0);

        assert!(matches!(
            orchestrator
                .run_from("nope", Batch::Empty, RunMode::default())
                .await,
            Err(Error::Pipeline(PipelineError::UnknownStage(_)))
        ));
    }

    #[tokio::test]
    async fn no_flush_without_request() {
        let sink = Arc::new(CaptureSink::default());
        let orchestrator = Orchestrator::new(
            config(true),
            chain(vec![("first", FnStage::new(|_| three()))]),
        )
        .with_metrics_sink(sink.clone());
        orchestrator.run(RunMode::default()).await.unwrap();
        assert!(sink.exported.lock().await.is_empty());
    }
}
