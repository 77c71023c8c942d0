//! Core domain model for CDX: mapping records, sync pages, webhook
//! subscriptions, enrichment records, and structured upsert reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "cdx-core";

/// Kind of directory entity a mapping refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Company,
}

/// How a record last reached the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMethod {
    Bulk,
    Incremental,
    Webhook,
}

/// Whether the last sync created or updated the directory contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Created,
    Updated,
}

/// Durable association between a source-system record and a directory
/// contact. Unique per (source instance, external id); overwritten on every
/// subsequent sync of the same external id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecord {
    pub external_id: String,
    pub internal_id: String,
    pub entity_type: EntityType,
    pub sync_method: SyncMethod,
    pub action: SyncAction,
    pub last_synced_at: DateTime<Utc>,
}

/// One page of raw person records from a source system. The cursor is
/// opaque to the orchestrator; plugins encode their own semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonPage {
    pub records: Vec<JsonValue>,
    pub cursor: Option<String>,
    pub has_more: bool,
}

impl PersonPage {
    /// A terminal page with no records.
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            cursor: None,
            has_more: false,
        }
    }
}

/// Parameters for fetching one page of person records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonPageRequest {
    pub object_type: String,
    pub cursor: Option<String>,
    pub limit: u32,
    pub modified_since: Option<DateTime<Utc>>,
    pub sort_desc: bool,
}

impl PersonPageRequest {
    pub fn first_page(object_type: impl Into<String>, limit: u32) -> Self {
        Self {
            object_type: object_type.into(),
            cursor: None,
            limit,
            modified_since: None,
            sort_desc: false,
        }
    }

    #[must_use]
    pub fn with_cursor(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }

    #[must_use]
    pub fn modified_since(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.modified_since = since;
        self
    }

    #[must_use]
    pub fn newest_first(mut self) -> Self {
        self.sort_desc = true;
        self
    }
}

/// A person record transformed into the directory's contact shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactDraft {
    pub external_id: String,
    pub source_name: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub role: Option<String>,
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub phone_numbers: Vec<String>,
    pub source_url: Option<String>,
}

/// A registered per-chunk webhook subscription in the directory.
///
/// The chunk index is a stable logical slot: when the required resource set
/// shrinks, higher-indexed chunks are deleted rather than renumbering
/// survivors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub webhook_id: String,
    pub webhook_key: String,
    pub phone_ids: Vec<String>,
    pub chunk_index: usize,
}

/// Maps a call or message activity to the source-system log entry created
/// for it. Invariant: `log_id` always refers to a log entry that currently
/// exists in the source system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub activity_id: String,
    pub log_id: String,
    pub contact_id: String,
    pub contact_type: String,
}

/// Direction of a call or message, from the directory user's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityDirection {
    Incoming,
    Outgoing,
}

/// Kind of activity logged to the source system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Call,
    Message,
}

/// Content of a source-system activity log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityLog {
    pub kind: ActivityKind,
    pub direction: ActivityDirection,
    pub contact_id: String,
    pub contact_type: String,
    pub duration_seconds: Option<u32>,
    pub participants: Vec<String>,
    pub occurred_at: DateTime<Utc>,
    pub body: String,
}

/// Per-record failure inside a batch operation. `external_id` is `None`
/// only for batch-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    pub external_id: Option<String>,
    pub error: String,
}

/// Structured outcome of a batch upsert: sibling successes are never
/// discarded because some records failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertReport {
    pub success_count: usize,
    pub error_count: usize,
    pub errors: Vec<RecordError>,
}

impl UpsertReport {
    pub fn record_success(&mut self) {
        self.success_count += 1;
    }

    pub fn failure(&mut self, external_id: Option<String>, error: impl Into<String>) {
        self.error_count += 1;
        self.errors.push(RecordError {
            external_id,
            error: error.into(),
        });
    }

    pub fn record_error(&mut self, external_id: impl Into<String>, error: impl Into<String>) {
        self.failure(Some(external_id.into()), error);
    }

    /// Record a failure of the whole batch as a single entry, not one
    /// entry per submitted record.
    pub fn batch_error(&mut self, error: impl Into<String>) {
        self.failure(None, error);
    }

    pub fn merge(&mut self, other: UpsertReport) {
        self.success_count += other.success_count;
        self.error_count += other.error_count;
        self.errors.extend(other.errors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_report_isolates_record_errors() {
        let mut report = UpsertReport::default();
        report.record_success();
        report.record_error("p2", "Contact not found after bulk create");
        report.record_error("p3", "Contact not found after bulk create");

        assert_eq!(report.success_count, 1);
        assert_eq!(report.error_count, 2);
        assert_eq!(report.errors[0].external_id.as_deref(), Some("p2"));
        assert_eq!(report.errors[1].external_id.as_deref(), Some("p3"));
    }

    #[test]
    fn batch_error_is_a_single_entry() {
        let mut report = UpsertReport::default();
        report.batch_error("Bulk create returned no contacts");

        assert_eq!(report.success_count, 0);
        assert_eq!(report.error_count, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].external_id.is_none());
    }

    #[test]
    fn mapping_record_serde_uses_snake_case_enums() {
        let record = MappingRecord {
            external_id: "p1".into(),
            internal_id: "c1".into(),
            entity_type: EntityType::Person,
            sync_method: SyncMethod::Bulk,
            action: SyncAction::Created,
            last_synced_at: Utc::now(),
        };
        let json = serde_json::to_string(&record).expect("serialize");
        assert!(json.contains("\"sync_method\":\"bulk\""));
        assert!(json.contains("\"action\":\"created\""));
    }

    #[test]
    fn page_request_builder_sets_incremental_fields() {
        let since = Utc::now();
        let req = PersonPageRequest::first_page("person", 50)
            .modified_since(Some(since))
            .newest_first();
        assert_eq!(req.limit, 50);
        assert_eq!(req.modified_since, Some(since));
        assert!(req.sort_desc);
        assert!(req.cursor.is_none());
    }
}
