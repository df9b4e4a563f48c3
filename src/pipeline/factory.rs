//! Builds the standard four-stage pipeline from a config.
//!
//! Collaborators are chosen here, once, before the run: test mode swaps in
//! the in-process doubles and the orchestrator never knows the difference.

use std::sync::Arc;

use tracing::info;

use crate::config::{MetricsExport, PipelineConfig};
use crate::context::RunMode;
use crate::error::{ConfigError, PipelineError};
use crate::llm::{Categorizer, KeywordCategorizer, create_categorizer};
use crate::mail::{GmailClient, InMemoryMailStore, MailStore};
use crate::metrics::{CsvFileSink, JsonFileSink, MetricsSink};
use crate::pipeline::extract::ExtractStage;
use crate::pipeline::load::LoadStage;
use crate::pipeline::orchestrator::{Orchestrator, StageChain};
use crate::pipeline::stage::{EXTRACT, LOAD, SYNC, TRANSFORM};
use crate::pipeline::sync::SyncStage;
use crate::pipeline::transform::TransformStage;
use crate::store::{LibSqlStore, PersistenceStore};

/// The external services one run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub mail: Arc<dyn MailStore>,
    pub categorizer: Arc<dyn Categorizer>,
    pub store: Arc<dyn PersistenceStore>,
}

impl Collaborators {
    /// Gmail, the configured LLM provider, and the on-disk database.
    pub async fn live(config: &PipelineConfig) -> crate::Result<Self> {
        let categorizer = create_categorizer(&config.transform)?;
        let store = LibSqlStore::new_local(&config.sync.database_path)
            .await?
            .with_history(config.sync.track_history);
        Ok(Self {
            mail: Arc::new(GmailClient::from_env()),
            categorizer,
            store: Arc::new(store),
        })
    }

    /// Fixture inbox, keyword rules, and an in-memory database.
    pub async fn test_doubles(config: &PipelineConfig) -> crate::Result<Self> {
        let categorizer =
            KeywordCategorizer::default_rules().map_err(|e| ConfigError::InvalidValue {
                key: "pipeline.transform".into(),
                message: format!("keyword rules: {e}"),
            })?;
        let store = LibSqlStore::new_memory()
            .await?
            .with_history(config.sync.track_history);
        Ok(Self {
            mail: Arc::new(InMemoryMailStore::with_fixture()),
            categorizer: Arc::new(categorizer),
            store: Arc::new(store),
        })
    }

    pub async fn for_mode(config: &PipelineConfig, mode: RunMode) -> crate::Result<Self> {
        if mode.test {
            info!("Test mode: using in-process collaborators");
            Self::test_doubles(config).await
        } else {
            Self::live(config).await
        }
    }
}

/// extract → transform → load → sync
pub fn standard_chain(collaborators: &Collaborators) -> Result<StageChain, PipelineError> {
    let mut chain = StageChain::new();
    chain.push(
        EXTRACT,
        Arc::new(ExtractStage::new(
            Arc::clone(&collaborators.mail),
            Arc::clone(&collaborators.store),
        )),
    )?;
    chain.push(
        TRANSFORM,
        Arc::new(TransformStage::new(Arc::clone(&collaborators.categorizer))),
    )?;
    chain.push(LOAD, Arc::new(LoadStage::new(Arc::clone(&collaborators.mail))))?;
    chain.push(SYNC, Arc::new(SyncStage::new(Arc::clone(&collaborators.store))))?;
    Ok(chain)
}

/// Orchestrator over the standard chain with the given collaborators.
///
/// Fails on blocking config issues; the metrics file sink for
/// `monitoring.metrics_export` is installed when `sync.save_metrics` is set.
pub fn orchestrator_with(
    config: Arc<PipelineConfig>,
    collaborators: &Collaborators,
) -> crate::Result<Orchestrator> {
    config.ensure_valid()?;
    let chain = standard_chain(collaborators)?;
    let sink = config.sync.save_metrics.then(|| metrics_sink(&config));
    let orchestrator = Orchestrator::new(config, chain);
    Ok(match sink {
        Some(sink) => orchestrator.with_metrics_sink(sink),
        None => orchestrator,
    })
}

fn metrics_sink(config: &PipelineConfig) -> Arc<dyn MetricsSink> {
    let path = config.metrics_file();
    match config.monitoring.metrics_export {
        MetricsExport::Json => Arc::new(JsonFileSink::new(path)),
        MetricsExport::Csv => Arc::new(CsvFileSink::new(path)),
    }
}

/// Validate the config, pick collaborators for `mode`, and wire everything up.
pub async fn build_orchestrator(
    config: Arc<PipelineConfig>,
    mode: RunMode,
) -> crate::Result<Orchestrator> {
    config.ensure_valid()?;
    let collaborators = Collaborators::for_mode(&config, mode).await?;
    orchestrator_with(config, &collaborators)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn standard_chain_order() {
        let collaborators = Collaborators::test_doubles(&PipelineConfig::default())
            .await
            .unwrap();
        let chain = standard_chain(&collaborators).unwrap();
        assert_eq!(chain.names(), vec!["extract", "transform", "load", "sync"]);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_the_run() {
        let mut config = PipelineConfig::default();
        config
            .load
            .category_actions
            .insert("Astrology".into(), vec!["star".into()]);
        let result = build_orchestrator(Arc::new(config), RunMode {
            test: true,
            ..Default::default()
        })
        .await;
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::Invalid(_)))
        ));
    }

    #[tokio::test]
    async fn test_mode_runs_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.sync.metrics_path = dir.path().join("metrics.json");
        let mode = RunMode {
            test: true,
            ..Default::default()
        };
        let orchestrator = build_orchestrator(Arc::new(config), mode).await.unwrap();
        let report = orchestrator.run(mode).await.unwrap();
        assert_eq!(report.emails_extracted, 5);
        assert_eq!(report.stages_completed.len(), 4);
        assert_eq!(report.metrics.categories.values().sum::<u64>(), 5);
        assert!(dir.path().join("metrics.json").exists());
    }

    #[tokio::test]
    async fn csv_export_writes_next_to_the_metrics_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.sync.metrics_path = dir.path().join("metrics.json");
        config.monitoring.metrics_export = MetricsExport::Csv;
        let mode = RunMode {
            test: true,
            ..Default::default()
        };
        let orchestrator = build_orchestrator(Arc::new(config), mode).await.unwrap();
        let report = orchestrator.run(mode).await.unwrap();

        let csv = std::fs::read_to_string(dir.path().join("metrics.csv")).unwrap();
        assert!(csv.starts_with("run_id,ended_at,kind,name,count,"));
        assert!(csv.contains(&report.run_id.to_string()));
        assert!(csv.contains(",stage,sync,"));
        assert!(!dir.path().join("metrics.json").exists());
    }
}
