//! In-process mail store.
//!
//! Serves a fixed set of emails and records every action it is asked to
//! apply. Failures can be scripted per item or for the whole fetch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::Mutex;

use crate::error::CollaboratorError;
use crate::mail::{MailAction, MailStore};
use crate::pipeline::types::EmailRecord;

const SERVICE: &str = "memory-mail";

#[derive(Debug, Default)]
pub struct InMemoryMailStore {
    emails: Vec<EmailRecord>,
    applied: Mutex<Vec<(String, MailAction)>>,
    action_failures: Mutex<HashMap<String, CollaboratorError>>,
    fetch_failure: Mutex<Option<CollaboratorError>>,
    fetch_calls: AtomicUsize,
    action_calls: AtomicUsize,
}

impl InMemoryMailStore {
    pub fn new(emails: Vec<EmailRecord>) -> Self {
        Self {
            emails,
            ..Default::default()
        }
    }

    /// Store pre-loaded with the five sample emails used by test mode.
    pub fn with_fixture() -> Self {
        Self::new(fixture_emails())
    }

    /// Every `apply_action` on `item_id` fails with `error`.
    pub async fn fail_actions_for(&self, item_id: &str, error: CollaboratorError) {
        self.action_failures
            .lock()
            .await
            .insert(item_id.to_string(), error);
    }

    pub async fn fail_fetch(&self, error: CollaboratorError) {
        *self.fetch_failure.lock().await = Some(error);
    }

    pub async fn applied(&self) -> Vec<(String, MailAction)> {
        self.applied.lock().await.clone()
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn action_calls(&self) -> usize {
        self.action_calls.load(Ordering::SeqCst)
    }

    /// Total calls of either kind.
    pub fn total_calls(&self) -> usize {
        self.fetch_calls() + self.action_calls()
    }
}

/// Free-text terms must all appear in subject, sender, or body.
/// Gmail operators (`is:unread`, `label:x`) are ignored.
fn matches_query(email: &EmailRecord, query: &str) -> bool {
    let haystack = format!("{} {} {}", email.subject, email.sender, email.content).to_lowercase();
    query
        .split_whitespace()
        .filter(|term| !term.contains(':'))
        .all(|term| haystack.contains(&term.to_lowercase()))
}

#[async_trait]
impl MailStore for InMemoryMailStore {
    async fn fetch(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<EmailRecord>, CollaboratorError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fetch_failure.lock().await.clone() {
            return Err(err);
        }
        Ok(self
            .emails
            .iter()
            .filter(|e| matches_query(e, query))
            .take(max_results)
            .cloned()
            .collect())
    }

    async fn apply_action(
        &self,
        item_id: &str,
        action: &MailAction,
    ) -> Result<(), CollaboratorError> {
        self.action_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.action_failures.lock().await.get(item_id) {
            return Err(err.clone());
        }
        if !self.emails.iter().any(|e| e.id == item_id) {
            return Err(CollaboratorError::NotFound {
                service: SERVICE.into(),
                id: item_id.to_string(),
            });
        }
        self.applied
            .lock()
            .await
            .push((item_id.to_string(), action.clone()));
        Ok(())
    }
}

/// Sample inbox: one email per common category.
pub fn fixture_emails() -> Vec<EmailRecord> {
    let now = Utc::now();
    let email = |id: &str, subject: &str, sender: &str, body: &str, hours: i64| EmailRecord {
        id: id.to_string(),
        subject: subject.to_string(),
        sender: sender.to_string(),
        content: body.to_string(),
        received_at: now - Duration::hours(hours),
    };
    vec![
        email(
            "fixture-1",
            "Invoice #42",
            "billing@acme.test",
            "Your invoice for March is attached. Amount due: $120.",
            1,
        ),
        email(
            "fixture-2",
            "Team lunch Friday",
            "sam@friends.test",
            "Want to grab lunch on Friday at noon?",
            2,
        ),
        email(
            "fixture-3",
            "Weekly newsletter",
            "news@digest.test",
            "<p>This week's top stories in tech.</p>",
            5,
        ),
        email(
            "fixture-4",
            "Your order has shipped",
            "orders@shop.test",
            "Your package is on the way and will arrive Tuesday.",
            8,
        ),
        email(
            "fixture-5",
            "Action required: contract review",
            "legal@partner.test",
            "Please review and sign the attached contract by Thursday.",
            12,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_honours_limit_and_free_text() {
        let store = InMemoryMailStore::with_fixture();
        assert_eq!(store.fetch("is:unread", 100).await.unwrap().len(), 5);
        assert_eq!(store.fetch("is:unread", 2).await.unwrap().len(), 2);

        let hits = store.fetch("is:unread invoice", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].subject, "Invoice #42");
        assert_eq!(store.fetch_calls(), 3);
    }

    #[tokio::test]
    async fn records_actions_and_scripted_failures() {
        let store = InMemoryMailStore::with_fixture();
        store
            .apply_action("fixture-1", &MailAction::Star)
            .await
            .unwrap();
        store
            .fail_actions_for(
                "fixture-2",
                CollaboratorError::Transient {
                    service: SERVICE.into(),
                    reason: "503".into(),
                },
            )
            .await;
        assert!(
            store
                .apply_action("fixture-2", &MailAction::Archive)
                .await
                .unwrap_err()
                .is_transient()
        );
        assert!(matches!(
            store.apply_action("missing", &MailAction::Star).await,
            Err(CollaboratorError::NotFound { .. })
        ));

        assert_eq!(
            store.applied().await,
            vec![("fixture-1".to_string(), MailAction::Star)]
        );
        assert_eq!(store.action_calls(), 3);
    }
}
