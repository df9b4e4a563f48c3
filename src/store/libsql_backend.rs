//! libSQL implementation of [`PersistenceStore`].
//!
//! Local file or in-memory database, one shared connection. Upserts are the
//! only synchronization point between concurrent runs: every write is keyed
//! by email id and skipped when the stored state already matches.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Row, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::pipeline::types::{EmailRecord, EnrichedEmailRecord};
use crate::store::migrations;
use crate::store::{LabelChange, PersistenceStore, StoreQuery, UpsertOutcome};

pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    track_history: bool,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// In-memory database (tests and test mode).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            track_history: true,
        })
    }

    /// Toggle `label_history` rows on category/action changes.
    pub fn with_history(mut self, track_history: bool) -> Self {
        self.track_history = track_history;
        self
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn stored_label(&self, id: &str) -> Result<Option<StoredLabel>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT category, actions, rationale, confidence FROM email_labels WHERE email_id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stored_label: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let category: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("stored_label row parse: {e}")))?;
                let actions_json: String = row.get(1).unwrap_or_else(|_| "[]".to_string());
                Ok(Some(StoredLabel {
                    category,
                    actions: parse_actions(&actions_json)?,
                    rationale: row.get(2).ok(),
                    confidence: row.get::<f64>(3).ok(),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("stored_label: {e}"))),
        }
    }

    async fn record_history(
        &self,
        record: &EnrichedEmailRecord,
        previous: Option<&StoredLabel>,
        now: &str,
    ) -> Result<(), DatabaseError> {
        let old_actions = previous.map(|p| serialize_actions(&p.actions)).transpose()?;
        self.conn()
            .execute(
                "INSERT INTO label_history (email_id, old_category, new_category, old_actions, new_actions, changed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id(),
                    opt_text(previous.map(|p| p.category.as_str())),
                    record.category.as_str(),
                    opt_text(old_actions.as_deref()),
                    serialize_actions(&record.actions)?,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_history: {e}")))?;
        Ok(())
    }
}

/// Current `email_labels` row for one email.
#[derive(Debug)]
struct StoredLabel {
    category: String,
    actions: Vec<String>,
    rationale: Option<String>,
    confidence: Option<f64>,
}

impl StoredLabel {
    fn matches(&self, record: &EnrichedEmailRecord) -> bool {
        self.category == record.category
            && self.actions == record.actions
            && self.rationale == record.rationale
            && self.confidence == record.confidence.map(f64::from)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(v) => libsql::Value::Text(v.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_real(v: Option<f32>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(f64::from(v)),
        None => libsql::Value::Null,
    }
}

fn serialize_actions(actions: &[String]) -> Result<String, DatabaseError> {
    serde_json::to_string(actions).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn parse_actions(json: &str) -> Result<Vec<String>, DatabaseError> {
    serde_json::from_str(json).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

const EMAIL_COLUMNS: &str = "e.id, e.subject, e.sender, e.content, e.received_at";

fn row_to_email(row: &Row) -> Result<EmailRecord, libsql::Error> {
    let received_at: String = row.get(4)?;
    Ok(EmailRecord {
        id: row.get(0)?,
        subject: row.get(1)?,
        sender: row.get(2)?,
        content: row.get(3)?,
        received_at: parse_datetime(&received_at),
    })
}

#[async_trait]
impl PersistenceStore for LibSqlStore {
    async fn upsert(&self, record: &EnrichedEmailRecord) -> Result<UpsertOutcome, DatabaseError> {
        self.save_email(&record.email).await?;

        let previous = self.stored_label(record.id()).await?;
        if let Some(prev) = &previous
            && prev.matches(record)
        {
            debug!(email_id = %record.id(), "Upsert skipped, state unchanged");
            return Ok(UpsertOutcome::Unchanged);
        }

        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO email_labels (email_id, category, actions, rationale, confidence, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(email_id) DO UPDATE SET
                    category = excluded.category,
                    actions = excluded.actions,
                    rationale = excluded.rationale,
                    confidence = excluded.confidence,
                    updated_at = excluded.updated_at",
                params![
                    record.id(),
                    record.category.as_str(),
                    serialize_actions(&record.actions)?,
                    opt_text(record.rationale.as_deref()),
                    opt_real(record.confidence),
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert: {e}")))?;

        let labels_changed = previous
            .as_ref()
            .is_none_or(|p| p.category != record.category || p.actions != record.actions);
        if self.track_history && labels_changed {
            self.record_history(record, previous.as_ref(), &now).await?;
        }

        Ok(if previous.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    async fn load_by_query(&self, query: &StoreQuery) -> Result<Vec<EmailRecord>, DatabaseError> {
        let pattern = format!("%{}%", query.text);
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EMAIL_COLUMNS} FROM emails e
                     LEFT JOIN email_labels l ON l.email_id = e.id
                     WHERE (?1 = 1 OR l.email_id IS NULL)
                       AND (?2 = '' OR e.subject LIKE ?3 OR e.sender LIKE ?3)
                     ORDER BY e.received_at ASC
                     LIMIT ?4"
                ),
                params![
                    query.include_processed as i64,
                    query.text.as_str(),
                    pattern,
                    query.limit as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_by_query: {e}")))?;

        let mut emails = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_email(&row) {
                Ok(email) => emails.push(email),
                Err(e) => tracing::warn!("Skipping email row: {e}"),
            }
        }
        Ok(emails)
    }

    async fn save_email(&self, email: &EmailRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO emails (id, subject, sender, content, received_at) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    subject = excluded.subject,
                    sender = excluded.sender,
                    content = excluded.content,
                    received_at = excluded.received_at",
                params![
                    email.id.as_str(),
                    email.subject.as_str(),
                    email.sender.as_str(),
                    email.content.as_str(),
                    email.received_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_email: {e}")))?;
        Ok(())
    }

    async fn get_enriched(&self, id: &str) -> Result<Option<EnrichedEmailRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {EMAIL_COLUMNS} FROM emails e WHERE e.id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_enriched: {e}")))?;

        let email = match rows.next().await {
            Ok(Some(row)) => row_to_email(&row)
                .map_err(|e| DatabaseError::Query(format!("get_enriched row parse: {e}")))?,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("get_enriched: {e}"))),
        };

        Ok(self.stored_label(id).await?.map(|label| EnrichedEmailRecord {
            email,
            category: label.category,
            rationale: label.rationale,
            confidence: label.confidence.map(|c| c as f32),
            actions: label.actions,
            action_log: Vec::new(),
        }))
    }

    async fn label_history(&self, id: &str) -> Result<Vec<LabelChange>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT email_id, old_category, new_category, old_actions, new_actions, changed_at
                 FROM label_history WHERE email_id = ?1 ORDER BY id ASC",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("label_history: {e}")))?;

        let mut changes = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let old_actions: Option<String> = row.get(3).ok();
            let new_actions: String = row.get(4).unwrap_or_else(|_| "[]".to_string());
            let changed_at: String = row.get(5).unwrap_or_default();
            changes.push(LabelChange {
                email_id: row.get(0).unwrap_or_default(),
                old_category: row.get(1).ok(),
                new_category: row.get(2).unwrap_or_default(),
                old_actions: old_actions.as_deref().map(parse_actions).transpose()?,
                new_actions: parse_actions(&new_actions)?,
                changed_at: parse_datetime(&changed_at),
            });
        }
        Ok(changes)
    }
}
