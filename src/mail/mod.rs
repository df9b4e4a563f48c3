//! Mail-store collaborator: fetch emails and apply actions to them.
//!
//! `GmailClient` talks to the Gmail REST API; `InMemoryMailStore` is the
//! in-process double used by test mode and the test suite.

pub mod gmail;
pub mod memory;

pub use gmail::GmailClient;
pub use memory::InMemoryMailStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;
use crate::pipeline::types::EmailRecord;

/// One operation against a stored email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MailAction {
    /// Add the label named after the item's category.
    ApplyLabel { label: String, create_missing: bool },
    Archive,
    Star,
    MarkAsRead,
}

impl MailAction {
    /// Map a configured action name onto an operation. `None` for unknown names.
    pub fn resolve(name: &str, category: &str, create_missing: bool) -> Option<Self> {
        match name {
            "apply_label" => Some(Self::ApplyLabel {
                label: category.to_string(),
                create_missing,
            }),
            "archive" => Some(Self::Archive),
            "star" => Some(Self::Star),
            "mark_as_read" => Some(Self::MarkAsRead),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ApplyLabel { .. } => "apply_label",
            Self::Archive => "archive",
            Self::Star => "star",
            Self::MarkAsRead => "mark_as_read",
        }
    }
}

#[async_trait]
pub trait MailStore: Send + Sync {
    /// Up to `max_results` emails matching `query`.
    async fn fetch(&self, query: &str, max_results: usize)
    -> Result<Vec<EmailRecord>, CollaboratorError>;

    async fn apply_action(&self, item_id: &str, action: &MailAction)
    -> Result<(), CollaboratorError>;
}
