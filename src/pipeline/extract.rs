//! Extract: pull emails from the mail store or the persisted store.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::ExtractSource;
use crate::context::RunContext;
use crate::error::{CollaboratorError, StageError};
use crate::mail::MailStore;
use crate::pipeline::retry::{RetryPolicy, call_with_retry};
use crate::pipeline::stage::{EXTRACT, Stage};
use crate::pipeline::types::{Batch, EmailRecord, StageResult};
use crate::store::{PersistenceStore, StoreQuery};

pub struct ExtractStage {
    mail: Arc<dyn MailStore>,
    store: Arc<dyn PersistenceStore>,
}

impl ExtractStage {
    pub fn new(mail: Arc<dyn MailStore>, store: Arc<dyn PersistenceStore>) -> Self {
        Self { mail, store }
    }
}

#[async_trait]
impl Stage for ExtractStage {
    /// Extract starts a run; it takes no items.
    fn validate_input(&self, batch: &Batch) -> bool {
        batch.is_empty()
    }

    async fn execute(&self, _batch: Batch, ctx: &mut RunContext) -> Result<StageResult, StageError> {
        let config = ctx.shared_config();
        let extract = &config.extract;
        let limit = extract.limit();
        let policy = RetryPolicy::from(&config.retry);

        let fetched = match extract.source {
            ExtractSource::MailStore => {
                if ctx.mode().dry_run {
                    info!(run_id = %ctx.run_id(), "Dry run: skipping mail-store fetch");
                    return Ok(StageResult::passthrough(Batch::Emails(Vec::new())));
                }
                let mail = &self.mail;
                let query = extract.query.as_str();
                call_with_retry(&policy, "mail_store", move || mail.fetch(query, limit)).await
            }
            ExtractSource::PersistedStore => {
                let store = &self.store;
                let query = &StoreQuery::from_search(&extract.query, limit, extract.include_processed);
                call_with_retry(&policy, "store", move || async move {
                    store
                        .load_by_query(query)
                        .await
                        .map_err(CollaboratorError::from)
                })
                .await
            }
        }
        .map_err(|e| StageError::from_collaborator(EXTRACT, e))?;

        let emails = dedupe(fetched, limit);
        info!(
            run_id = %ctx.run_id(),
            source = %extract.source,
            count = emails.len(),
            "Extracted emails"
        );
        Ok(StageResult::passthrough(Batch::Emails(emails)))
    }
}

/// Drop repeated ids (first wins) and enforce the bound.
fn dedupe(emails: Vec<EmailRecord>, limit: usize) -> Vec<EmailRecord> {
    let mut seen = HashSet::new();
    emails
        .into_iter()
        .filter(|e| seen.insert(e.id.clone()))
        .take(limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::context::RunMode;
    use crate::mail::InMemoryMailStore;
    use crate::store::LibSqlStore;

    async fn stage_with(mail: Arc<InMemoryMailStore>) -> (ExtractStage, Arc<LibSqlStore>) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        (ExtractStage::new(mail, store.clone()), store)
    }

    fn ctx(config: PipelineConfig, mode: RunMode) -> RunContext {
        RunContext::new(Arc::new(config), mode)
    }

    #[tokio::test]
    async fn fetches_up_to_limit() {
        let mail = Arc::new(InMemoryMailStore::with_fixture());
        let (stage, _) = stage_with(mail.clone()).await;
        let mut config = PipelineConfig::default();
        config.extract.max_results = Some(3);

        let result = stage
            .execute(Batch::Empty, &mut ctx(config, RunMode::default()))
            .await
            .unwrap();
        assert_eq!(result.output.len(), 3);
        assert_eq!(result.attempted, 3);
        assert_eq!(mail.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn dry_run_never_touches_mail_store() {
        let mail = Arc::new(InMemoryMailStore::with_fixture());
        let (stage, _) = stage_with(mail.clone()).await;
        let result = stage
            .execute(
                Batch::Empty,
                &mut ctx(PipelineConfig::default(), RunMode::dry_run()),
            )
            .await
            .unwrap();
        assert!(result.output.is_empty());
        assert_eq!(result.attempted, 0);
        assert_eq!(mail.total_calls(), 0);
    }

    #[tokio::test]
    async fn persisted_source_reads_unprocessed_rows() {
        let mail = Arc::new(InMemoryMailStore::with_fixture());
        let (stage, store) = stage_with(mail.clone()).await;
        store
            .save_email(&EmailRecord::new("db-1", "Invoice #7", "a@b.test", ""))
            .await
            .unwrap();

        let mut config = PipelineConfig::default();
        config.extract.source = ExtractSource::PersistedStore;
        let result = stage
            .execute(Batch::Empty, &mut ctx(config, RunMode::dry_run()))
            .await
            .unwrap();
        assert_eq!(result.output.ids(), vec!["db-1"]);
        assert_eq!(mail.total_calls(), 0);
    }

    #[tokio::test]
    async fn unreachable_mail_store_is_batch_fatal() {
        let mail = Arc::new(InMemoryMailStore::with_fixture());
        mail.fail_fetch(CollaboratorError::Transient {
            service: "memory-mail".into(),
            reason: "503".into(),
        })
        .await;
        let (stage, _) = stage_with(mail.clone()).await;
        let mut config = PipelineConfig::default();
        config.retry.backoff_ms = 0;

        let err = stage
            .execute(Batch::Empty, &mut ctx(config, RunMode::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Unavailable { .. }));
        assert_eq!(mail.fetch_calls(), 3);
    }

    #[tokio::test]
    async fn rejects_non_empty_input() {
        let (stage, _) = stage_with(Arc::new(InMemoryMailStore::with_fixture())).await;
        assert!(stage.validate_input(&Batch::Empty));
        assert!(!stage.validate_input(&Batch::Emails(vec![EmailRecord::new("1", "", "", "")])));
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let emails = dedupe(
            vec![
                EmailRecord::new("1", "a", "", ""),
                EmailRecord::new("1", "b", "", ""),
                EmailRecord::new("2", "c", "", ""),
            ],
            10,
        );
        let subjects: Vec<&str> = emails.iter().map(|e| e.subject.as_str()).collect();
        assert_eq!(subjects, vec!["a", "c"]);
    }
}
