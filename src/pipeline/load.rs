//! Load: resolve each item's actions from its category and apply them.
//!
//! In dry-run and preview modes the actions are resolved and logged but the
//! mail store is never called. Preview also renders one summary line per item.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::LoadConfig;
use crate::context::{RunContext, RunMode};
use crate::error::StageError;
use crate::mail::{MailAction, MailStore};
use crate::pipeline::retry::{RetryPolicy, call_with_retry};
use crate::pipeline::stage::{LOAD, Stage, has_unique_ids};
use crate::pipeline::types::{
    ActionDisposition, ActionRecord, Batch, EnrichedEmailRecord, ItemFailure, StageResult,
};

pub struct LoadStage {
    mail: Arc<dyn MailStore>,
}

impl LoadStage {
    pub fn new(mail: Arc<dyn MailStore>) -> Self {
        Self { mail }
    }

    /// Apply an item's resolved actions in order. `Err` only for auth failures.
    async fn apply(
        &self,
        record: &mut EnrichedEmailRecord,
        actions: &[MailAction],
        policy: &RetryPolicy,
    ) -> Result<Option<String>, StageError> {
        let mut first_failure = None;
        let mail = &self.mail;

        for (name, action) in record.actions.clone().into_iter().zip(actions) {
            let item_id = record.email.id.as_str();
            let outcome = call_with_retry(policy, "mail_store", move || {
                mail.apply_action(item_id, action)
            })
            .await;

            match outcome {
                Ok(()) => record.action_log.push(ActionRecord {
                    action: name,
                    disposition: ActionDisposition::Applied,
                    error: None,
                }),
                Err(e) if e.is_auth() => return Err(StageError::from_collaborator(LOAD, e)),
                Err(e) => {
                    warn!(email_id = %record.id(), action = %name, error = %e, "Action failed");
                    record.action_log.push(ActionRecord {
                        action: name.clone(),
                        disposition: ActionDisposition::Failed,
                        error: Some(e.to_string()),
                    });
                    first_failure.get_or_insert(format!("{name}: {e}"));
                }
            }
        }

        Ok(first_failure)
    }
}

/// Ordered action names for a category, honouring `apply_labels`.
pub fn resolve_actions(config: &LoadConfig, category: &str) -> Vec<String> {
    config
        .actions_for(category)
        .into_iter()
        .filter(|a| config.apply_labels || a != "apply_label")
        .collect()
}

/// Mail actions for an item's action names; any unknown name rejects the item.
pub fn mail_actions(
    record: &EnrichedEmailRecord,
    config: &LoadConfig,
) -> Result<Vec<MailAction>, String> {
    record
        .actions
        .iter()
        .map(|name| {
            MailAction::resolve(name, &record.category, config.create_missing_labels)
                .ok_or_else(|| format!("unknown action '{name}'"))
        })
        .collect()
}

/// `[preview] <id> "<subject>" from <sender> -> <category>: <actions>`
pub fn preview_line(record: &EnrichedEmailRecord) -> String {
    let actions = if record.actions.is_empty() {
        "(no actions)".to_string()
    } else {
        record.actions.join(", ")
    };
    format!(
        "[preview] {} \"{}\" from {} -> {}: {}",
        record.id(),
        record.email.subject,
        record.email.sender,
        record.category,
        actions
    )
}

fn record_intended(record: &mut EnrichedEmailRecord, mode: RunMode) {
    let disposition = if mode.preview {
        ActionDisposition::Preview
    } else {
        ActionDisposition::DryRun
    };
    record.action_log = record
        .actions
        .iter()
        .map(|action| ActionRecord {
            action: action.clone(),
            disposition,
            error: None,
        })
        .collect();
}

#[async_trait]
impl Stage for LoadStage {
    fn validate_input(&self, batch: &Batch) -> bool {
        matches!(batch, Batch::Empty | Batch::Enriched(_)) && has_unique_ids(batch)
    }

    async fn execute(&self, batch: Batch, ctx: &mut RunContext) -> Result<StageResult, StageError> {
        let records = match batch {
            Batch::Enriched(records) => records,
            Batch::Empty => Vec::new(),
            other => {
                return Err(StageError::Validation {
                    stage: LOAD.into(),
                    reason: format!("expected enriched emails, got {}", other.kind()),
                });
            }
        };
        if records.is_empty() {
            return Ok(StageResult::passthrough(Batch::Enriched(Vec::new())));
        }

        let config = ctx.shared_config();
        let policy = RetryPolicy::from(&config.retry);
        let mode = ctx.mode();
        let total = records.len();

        let mut result = StageResult::default();
        let mut loaded = Vec::with_capacity(total);
        let mut remaining = records.into_iter();

        while let Some(mut record) = remaining.next() {
            if ctx.should_stop_batch(result.failures.len(), total) {
                result.unattempted = 1 + remaining.len();
                warn!(
                    run_id = %ctx.run_id(),
                    skipped = result.unattempted,
                    "Failure tolerance exceeded, not loading remaining emails"
                );
                break;
            }
            result.attempted += 1;

            record.actions = resolve_actions(&config.load, &record.category);
            record.action_log.clear();

            let actions = match mail_actions(&record, &config.load) {
                Ok(actions) => actions,
                Err(reason) => {
                    warn!(email_id = %record.id(), %reason, "Not loading email");
                    result.failures.push(ItemFailure::new(record.id(), reason));
                    continue;
                }
            };

            if mode.is_read_only() {
                record_intended(&mut record, mode);
                if mode.preview {
                    let line = preview_line(&record);
                    info!("{line}");
                    result.previews.push(line);
                } else {
                    debug!(
                        email_id = %record.id(),
                        category = %record.category,
                        actions = ?record.actions,
                        "Dry run: would apply actions"
                    );
                }
                result.actions.extend(record.actions.iter().cloned());
                loaded.push(record);
                continue;
            }

            match self.apply(&mut record, &actions, &policy).await? {
                None => {
                    result.actions.extend(record.actions.iter().cloned());
                    loaded.push(record);
                }
                Some(reason) => {
                    result.actions.extend(
                        record
                            .action_log
                            .iter()
                            .filter(|a| a.disposition == ActionDisposition::Applied)
                            .map(|a| a.action.clone()),
                    );
                    result.failures.push(ItemFailure::new(record.id(), reason));
                }
            }
        }

        info!(
            run_id = %ctx.run_id(),
            loaded = loaded.len(),
            failed = result.failures.len(),
            dry_run = mode.dry_run,
            preview = mode.preview,
            "Load complete"
        );
        result.output = Batch::Enriched(loaded);
        Ok(result)
    }
}
