//! Shared types for the email batch pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Records ─────────────────────────────────────────────────────────

/// One email as extracted from the mail store or the persisted store.
///
/// Immutable once extracted; stages hand records to each other by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailRecord {
    /// Identifier assigned by the mail store. Unique within a batch.
    pub id: String,
    pub subject: String,
    pub sender: String,
    /// Raw body (may be HTML).
    pub content: String,
    pub received_at: DateTime<Utc>,
}

impl EmailRecord {
    pub fn new(
        id: impl Into<String>,
        subject: impl Into<String>,
        sender: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            subject: subject.into(),
            sender: sender.into(),
            content: content.into(),
            received_at: Utc::now(),
        }
    }
}

/// What happened to one resolved action in Load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionDisposition {
    Applied,
    DryRun,
    Preview,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: String,
    pub disposition: ActionDisposition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An email after categorization.
///
/// Transform fills in the category; Load resolves `actions` from config and
/// logs what it did with each one in `action_log`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedEmailRecord {
    #[serde(flatten)]
    pub email: EmailRecord,
    pub category: String,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub action_log: Vec<ActionRecord>,
}

impl EnrichedEmailRecord {
    pub fn new(email: EmailRecord, category: impl Into<String>) -> Self {
        Self {
            email,
            category: category.into(),
            rationale: None,
            confidence: None,
            actions: Vec::new(),
            action_log: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.email.id
    }
}

// ── Batch ───────────────────────────────────────────────────────────

/// Items flowing between two stages.
///
/// Order is not significant; items are keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "items", rename_all = "snake_case")]
pub enum Batch {
    /// No items yet (input to Extract).
    #[default]
    Empty,
    Emails(Vec<EmailRecord>),
    Enriched(Vec<EnrichedEmailRecord>),
}

impl Batch {
    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Emails(items) => items.len(),
            Self::Enriched(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Item identifiers in batch order.
    pub fn ids(&self) -> Vec<String> {
        match self {
            Self::Empty => Vec::new(),
            Self::Emails(items) => items.iter().map(|e| e.id.clone()).collect(),
            Self::Enriched(items) => items.iter().map(|e| e.id().to_string()).collect(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Emails(_) => "emails",
            Self::Enriched(_) => "enriched",
        }
    }
}

impl From<Vec<EmailRecord>> for Batch {
    fn from(items: Vec<EmailRecord>) -> Self {
        Self::Emails(items)
    }
}

impl From<Vec<EnrichedEmailRecord>> for Batch {
    fn from(items: Vec<EnrichedEmailRecord>) -> Self {
        Self::Enriched(items)
    }
}

// ── Stage results ───────────────────────────────────────────────────

/// An item a stage gave up on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub item_id: String,
    pub reason: String,
}

impl ItemFailure {
    pub fn new(item_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            reason: reason.into(),
        }
    }
}

/// Outcome of one stage over one batch.
///
/// `output` holds the successfully processed items only; it becomes the
/// next stage's input. Items a stage never reached (fail-fast) are counted
/// in `unattempted` and appear in neither list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageResult {
    pub output: Batch,
    pub failures: Vec<ItemFailure>,
    pub attempted: usize,
    pub unattempted: usize,
    /// Category of every item categorized in this stage.
    pub categorized: Vec<String>,
    /// Items whose category collapsed to the fallback.
    pub fallbacks: usize,
    /// Action names resolved (applied or would-apply) in this stage.
    pub actions: Vec<String>,
    /// Human-readable per-item summaries (preview mode).
    pub previews: Vec<String>,
}

impl StageResult {
    /// Result that carries a batch through untouched.
    pub fn passthrough(output: Batch) -> Self {
        Self {
            attempted: output.len(),
            output,
            ..Default::default()
        }
    }

    pub fn succeeded(&self) -> usize {
        self.output.len()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// No item failed and none were skipped.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.unattempted == 0
    }

    /// Failed items over the whole input batch.
    pub fn failure_rate(&self) -> f64 {
        let total = self.attempted + self.unattempted;
        if total == 0 {
            0.0
        } else {
            self.failed() as f64 / total as f64
        }
    }
}
