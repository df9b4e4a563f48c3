//! Persistence collaborator: libSQL-backed email and label state.

pub mod libsql_backend;
pub mod migrations;

pub use libsql_backend::LibSqlStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DatabaseError;
use crate::pipeline::types::{EmailRecord, EnrichedEmailRecord};

/// Filter for [`PersistenceStore::load_by_query`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreQuery {
    /// Substring matched against subject or sender. Empty matches everything.
    pub text: String,
    pub limit: usize,
    /// Also return emails that already have a stored category.
    pub include_processed: bool,
}

impl StoreQuery {
    /// Build from a mail-store style query, keeping only free-text terms.
    pub fn from_search(query: &str, limit: usize, include_processed: bool) -> Self {
        let text = query
            .split_whitespace()
            .filter(|term| !term.contains(':'))
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            text,
            limit,
            include_processed,
        }
    }
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Stored state already matched; nothing written.
    Unchanged,
}

/// One recorded change of an email's category or actions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelChange {
    pub email_id: String,
    pub old_category: Option<String>,
    pub new_category: String,
    pub old_actions: Option<Vec<String>>,
    pub new_actions: Vec<String>,
    pub changed_at: DateTime<Utc>,
}

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Idempotent write keyed by email id.
    async fn upsert(&self, record: &EnrichedEmailRecord) -> Result<UpsertOutcome, DatabaseError>;

    async fn load_by_query(&self, query: &StoreQuery) -> Result<Vec<EmailRecord>, DatabaseError>;

    async fn save_email(&self, email: &EmailRecord) -> Result<(), DatabaseError>;

    async fn get_enriched(&self, id: &str) -> Result<Option<EnrichedEmailRecord>, DatabaseError>;

    async fn label_history(&self, id: &str) -> Result<Vec<LabelChange>, DatabaseError>;
}
