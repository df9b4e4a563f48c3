//! Sync: persist enriched records and schedule the metrics export.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::context::RunContext;
use crate::error::{CollaboratorError, StageError};
use crate::pipeline::retry::{RetryPolicy, call_with_retry};
use crate::pipeline::stage::{SYNC, Stage, has_unique_ids};
use crate::pipeline::types::{Batch, ItemFailure, StageResult};
use crate::store::{PersistenceStore, UpsertOutcome};

pub struct SyncStage {
    store: Arc<dyn PersistenceStore>,
}

impl SyncStage {
    pub fn new(store: Arc<dyn PersistenceStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Stage for SyncStage {
    fn validate_input(&self, batch: &Batch) -> bool {
        matches!(batch, Batch::Empty | Batch::Enriched(_)) && has_unique_ids(batch)
    }

    async fn execute(&self, batch: Batch, ctx: &mut RunContext) -> Result<StageResult, StageError> {
        let records = match batch {
            Batch::Enriched(records) => records,
            Batch::Empty => Vec::new(),
            other => {
                return Err(StageError::Validation {
                    stage: SYNC.into(),
                    reason: format!("expected enriched emails, got {}", other.kind()),
                });
            }
        };
        let config = ctx.shared_config();
        if config.sync.save_metrics {
            ctx.request_metrics_flush();
        }
        if records.is_empty() {
            return Ok(StageResult::passthrough(Batch::Enriched(Vec::new())));
        }

        if ctx.mode().is_read_only() {
            info!(
                run_id = %ctx.run_id(),
                count = records.len(),
                "Read-only run: skipping persistence"
            );
            return Ok(StageResult::passthrough(Batch::Enriched(records)));
        }

        let policy = RetryPolicy::from(&config.retry);
        let total = records.len();
        let store = &self.store;

        let mut result = StageResult::default();
        let mut synced = Vec::with_capacity(total);
        let (mut inserted, mut updated, mut unchanged) = (0usize, 0usize, 0usize);
        let mut remaining = records.into_iter();

        while let Some(record) = remaining.next() {
            if ctx.should_stop_batch(result.failures.len(), total) {
                result.unattempted = 1 + remaining.len();
                warn!(
                    run_id = %ctx.run_id(),
                    skipped = result.unattempted,
                    "Failure tolerance exceeded, not persisting remaining emails"
                );
                break;
            }
            result.attempted += 1;

            let outcome = {
                let record = &record;
                call_with_retry(&policy, "store", move || async move {
                    store.upsert(record).await.map_err(CollaboratorError::from)
                })
                .await
            };

            match outcome {
                Ok(outcome) => {
                    debug!(email_id = %record.id(), ?outcome, "Upserted");
                    match outcome {
                        UpsertOutcome::Inserted => inserted += 1,
                        UpsertOutcome::Updated => updated += 1,
                        UpsertOutcome::Unchanged => unchanged += 1,
                    }
                    synced.push(record);
                }
                Err(e) if e.is_auth() => return Err(StageError::from_collaborator(SYNC, e)),
                Err(e) => {
                    warn!(email_id = %record.id(), error = %e, "Persist failed");
                    result.failures.push(ItemFailure::new(record.id(), e.to_string()));
                }
            }
        }

        info!(
            run_id = %ctx.run_id(),
            inserted,
            updated,
            unchanged,
            failed = result.failures.len(),
            "Sync complete"
        );
        result.output = Batch::Enriched(synced);
        Ok(result)
    }
}
