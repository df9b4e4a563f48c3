//! Transform: categorize each email.
//!
//! One categorizer call per item, `transform.concurrency` in flight at a
//! time. Out-of-vocabulary categories collapse to the fallback; that is
//! counted, not treated as a failure.

use std::pin::pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tracing::{debug, info, warn};

use crate::config::TransformConfig;
use crate::context::RunContext;
use crate::error::StageError;
use crate::llm::{Categorization, Categorizer};
use crate::pipeline::retry::{RetryPolicy, call_with_retry};
use crate::pipeline::stage::{TRANSFORM, Stage, has_unique_ids};
use crate::pipeline::types::{Batch, EmailRecord, EnrichedEmailRecord, ItemFailure, StageResult};

pub struct TransformStage {
    categorizer: Arc<dyn Categorizer>,
}

impl TransformStage {
    pub fn new(categorizer: Arc<dyn Categorizer>) -> Self {
        Self { categorizer }
    }
}

/// Attach a categorization to an email, mapping unknown categories to the fallback.
///
/// Returns the record and whether the fallback was used.
pub fn enrich(
    email: EmailRecord,
    categorization: Categorization,
    config: &TransformConfig,
) -> (EnrichedEmailRecord, bool) {
    let proposed = categorization.category.trim();
    let resolved = if proposed == config.fallback_category {
        Some(config.fallback_category.clone())
    } else {
        config
            .categories
            .iter()
            .find(|c| c.as_str() == proposed)
            .or_else(|| {
                config
                    .categories
                    .iter()
                    .find(|c| c.eq_ignore_ascii_case(proposed))
            })
            .cloned()
    };
    let fallback = resolved.is_none();
    let category = resolved.unwrap_or_else(|| config.fallback_category.clone());

    let mut record = EnrichedEmailRecord::new(email, category);
    record.rationale = categorization.rationale;
    record.confidence = categorization.confidence;
    (record, fallback)
}

#[async_trait]
impl Stage for TransformStage {
    fn validate_input(&self, batch: &Batch) -> bool {
        matches!(batch, Batch::Empty | Batch::Emails(_)) && has_unique_ids(batch)
    }

    async fn execute(&self, batch: Batch, ctx: &mut RunContext) -> Result<StageResult, StageError> {
        let emails = match batch {
            Batch::Emails(emails) => emails,
            Batch::Empty => Vec::new(),
            other => {
                return Err(StageError::Validation {
                    stage: TRANSFORM.into(),
                    reason: format!("expected emails, got {}", other.kind()),
                });
            }
        };
        if emails.is_empty() {
            return Ok(StageResult::passthrough(Batch::Enriched(Vec::new())));
        }

        let config = ctx.shared_config();
        let policy = RetryPolicy::from(&config.retry);
        let total = emails.len();
        let categorizer = &self.categorizer;
        let policy = &policy;

        let mut pending = pin!(
            stream::iter(emails)
                .map(move |email| async move {
                    let outcome = {
                        let email = &email;
                        call_with_retry(policy, categorizer.name(), move || {
                            categorizer.categorize(email)
                        })
                        .await
                    };
                    (email, outcome)
                })
                .buffered(config.transform.concurrency.max(1))
        );

        let mut result = StageResult::default();
        let mut enriched = Vec::with_capacity(total);
        let mut processed = 0;

        loop {
            if ctx.should_stop_batch(result.failures.len(), total) {
                result.unattempted = total - processed;
                warn!(
                    run_id = %ctx.run_id(),
                    failed = result.failures.len(),
                    skipped = result.unattempted,
                    "Failure tolerance exceeded, not categorizing remaining emails"
                );
                break;
            }
            let Some((email, outcome)) = pending.next().await else {
                break;
            };
            processed += 1;

            match outcome {
                Ok(categorization) => {
                    let (record, fallback) = enrich(email, categorization, &config.transform);
                    if fallback {
                        debug!(email_id = %record.id(), "Category outside vocabulary, using fallback");
                        result.fallbacks += 1;
                    }
                    result.categorized.push(record.category.clone());
                    enriched.push(record);
                }
                Err(e) if e.is_auth() => {
                    return Err(StageError::from_collaborator(TRANSFORM, e));
                }
                Err(e) => {
                    warn!(email_id = %email.id, error = %e, "Categorization failed");
                    result.failures.push(ItemFailure::new(email.id, e.to_string()));
                }
            }
        }

        result.attempted = processed;
        info!(
            run_id = %ctx.run_id(),
            categorized = enriched.len(),
            failed = result.failures.len(),
            fallbacks = result.fallbacks,
            "Transform complete"
        );
        result.output = Batch::Enriched(enriched);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::context::RunMode;
    use crate::error::CollaboratorError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Categorizer answering from a subject → category table.
    struct Scripted {
        answers: HashMap<String, Result<String, CollaboratorError>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(answers: &[(&str, Result<&str, CollaboratorError>)]) -> Self {
            Self {
                answers: answers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone().map(String::from)))
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Categorizer for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn categorize(
            &self,
            email: &EmailRecord,
        ) -> Result<Categorization, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.answers.get(&email.subject) {
                Some(Ok(category)) => Ok(Categorization {
                    category: category.clone(),
                    rationale: None,
                    confidence: None,
                }),
                Some(Err(e)) => Err(e.clone()),
                None => Ok(Categorization {
                    category: "Other".into(),
                    rationale: None,
                    confidence: None,
                }),
            }
        }
    }

    fn transient() -> CollaboratorError {
        CollaboratorError::Transient {
            service: "scripted".into(),
            reason: "overloaded".into(),
        }
    }

    fn config(continue_on_error: bool) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.continue_on_error = continue_on_error;
        config.retry.backoff_ms = 0;
        config.transform.categories = vec!["Bills".into(), "Personal".into()];
        config
    }

    fn three_emails() -> Batch {
        Batch::Emails(vec![
            EmailRecord::new("1", "one", "a@test", ""),
            EmailRecord::new("2", "two", "a@test", ""),
            EmailRecord::new("3", "three", "a@test", ""),
        ])
    }

    #[tokio::test]
    async fn empty_batch_makes_no_calls() {
        let categorizer = Arc::new(Scripted::new(&[]));
        let stage = TransformStage::new(categorizer.clone());
        let mut ctx = RunContext::new(Arc::new(config(true)), RunMode::default());
        let result = stage.execute(Batch::Empty, &mut ctx).await.unwrap();
        assert_eq!((result.attempted, result.succeeded(), result.failed()), (0, 0, 0));
        assert_eq!(categorizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_category_maps_to_fallback() {
        let categorizer = Arc::new(Scripted::new(&[
            ("one", Ok("bills")),
            ("two", Ok("Astrology")),
        ]));
        let stage = TransformStage::new(categorizer);
        let mut ctx = RunContext::new(Arc::new(config(true)), RunMode::default());
        let batch = Batch::Emails(vec![
            EmailRecord::new("1", "one", "a@test", ""),
            EmailRecord::new("2", "two", "a@test", ""),
        ]);
        let result = stage.execute(batch, &mut ctx).await.unwrap();
        assert_eq!(result.categorized, vec!["Bills", "Other"]);
        assert_eq!(result.fallbacks, 1);
        assert!(result.failures.is_empty());
    }

    #[tokio::test]
    async fn transient_item_failure_keeps_the_rest() {
        let categorizer = Arc::new(Scripted::new(&[
            ("one", Ok("Bills")),
            ("two", Err(transient())),
            ("three", Ok("Personal")),
        ]));
        let stage = TransformStage::new(categorizer.clone());
        let mut ctx = RunContext::new(Arc::new(config(true)), RunMode::default());

        let result = stage.execute(three_emails(), &mut ctx).await.unwrap();
        assert_eq!(result.output.ids(), vec!["1", "3"]);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].item_id, "2");
        assert_eq!(result.attempted, 3);
        // Item 2 is tried max_attempts (3) times.
        assert_eq!(categorizer.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn fail_fast_without_continuation() {
        let categorizer = Arc::new(Scripted::new(&[
            ("one", Ok("Bills")),
            ("two", Err(transient())),
            ("three", Ok("Personal")),
        ]));
        let stage = TransformStage::new(categorizer);
        let mut ctx = RunContext::new(Arc::new(config(false)), RunMode::default());

        let result = stage.execute(three_emails(), &mut ctx).await.unwrap();
        assert_eq!(result.succeeded(), 1);
        assert_eq!(result.failed(), 1);
        assert_eq!(result.unattempted, 1);
        assert_eq!(result.attempted, 2);
    }

    #[tokio::test]
    async fn auth_failure_is_batch_fatal() {
        let categorizer = Arc::new(Scripted::new(&[(
            "two",
            Err(CollaboratorError::Auth {
                service: "scripted".into(),
                reason: "revoked".into(),
            }),
        )]));
        let stage = TransformStage::new(categorizer);
        let mut ctx = RunContext::new(Arc::new(config(true)), RunMode::default());
        let err = stage.execute(three_emails(), &mut ctx).await.unwrap_err();
        assert!(err.is_run_fatal());
    }

    #[tokio::test]
    async fn concurrent_mode_categorizes_everything() {
        let categorizer = Arc::new(Scripted::new(&[("one", Ok("Bills"))]));
        let stage = TransformStage::new(categorizer.clone());
        let mut cfg = config(true);
        cfg.transform.concurrency = 4;
        let mut ctx = RunContext::new(Arc::new(cfg), RunMode::default());
        let result = stage.execute(three_emails(), &mut ctx).await.unwrap();
        assert_eq!(result.succeeded(), 3);
        let mut ids = result.output.ids();
        ids.sort();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn validates_input_shape() {
        let stage = TransformStage::new(Arc::new(Scripted::new(&[])));
        assert!(stage.validate_input(&Batch::Empty));
        assert!(stage.validate_input(&three_emails()));
        assert!(!stage.validate_input(&Batch::Enriched(Vec::new())));
    }
}
