//! Source-system adapter contract + pagination normalization helpers and a
//! fixture-first adapter for local runs and tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cdx_core::{ActivityLog, ContactDraft, PersonPage, PersonPageRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "cdx-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("adapter does not support {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A person found in the source system, as referenced by activity logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRef {
    pub id: String,
    pub contact_type: String,
}

/// Capability contract every source-system plugin implements. Selected per
/// source-system instance at construction; the orchestrator never looks
/// behind it.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    /// Whether the source system can update an activity log in place.
    /// Note-only systems return false and take the create-then-delete path.
    fn supports_update_in_place(&self) -> bool {
        false
    }

    /// Fetch one page of raw person records. The returned cursor is fed
    /// back verbatim on the next call; its semantics belong to the plugin.
    async fn fetch_person_page(
        &self,
        request: &PersonPageRequest,
    ) -> Result<PersonPage, AdapterError>;

    fn transform_person(&self, record: &JsonValue) -> Result<ContactDraft, AdapterError>;

    async fn find_person_by_phone(&self, phone: &str)
        -> Result<Option<PersonRef>, AdapterError>;

    /// Create an activity log entry; returns the source system's log id.
    async fn log_activity(&self, log: &ActivityLog) -> Result<String, AdapterError>;

    async fn update_activity(
        &self,
        _log_id: &str,
        _log: &ActivityLog,
    ) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported("update-in-place activity logs"))
    }

    async fn delete_activity(&self, log_id: &str) -> Result<(), AdapterError>;
}

// ---------------------------------------------------------------------------
// Pagination normalization
// ---------------------------------------------------------------------------

/// Extract a continuation token embedded as a query parameter of a full
/// next-page URL. Plugins whose APIs return such URLs call this before
/// handing the cursor to the orchestrator.
pub fn token_from_next_url(next_url: &str, param: &str) -> Result<Option<String>, AdapterError> {
    let parsed = Url::parse(next_url)
        .map_err(|e| AdapterError::Message(format!("invalid next-page url {next_url}: {e}")))?;
    Ok(parsed
        .query_pairs()
        .find(|(name, _)| name == param)
        .map(|(_, value)| value.into_owned()))
}

/// Encode an offset-style page index as an opaque cursor.
pub fn encode_offset(page: u64) -> String {
    page.to_string()
}

/// Decode an offset-style cursor; absence means the first page.
pub fn decode_offset(cursor: Option<&str>) -> Result<u64, AdapterError> {
    match cursor {
        None => Ok(0),
        Some(raw) => raw
            .parse()
            .map_err(|_| AdapterError::Message(format!("invalid offset cursor {raw:?}"))),
    }
}

// ---------------------------------------------------------------------------
// Fixture adapter
// ---------------------------------------------------------------------------

/// Construction recipe for an adapter, resolved from the source registry.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub kind: String,
    pub source_id: String,
    pub fixture_path: Option<PathBuf>,
}

pub fn adapter_for_config(config: &AdapterConfig) -> Result<Option<Box<dyn SourceAdapter>>> {
    match config.kind.as_str() {
        "fixture" => {
            let path = config
                .fixture_path
                .as_ref()
                .with_context(|| format!("source {} has no fixture path", config.source_id))?;
            let adapter = JsonFixtureAdapter::from_file(&config.source_id, path)?;
            Ok(Some(Box::new(adapter)))
        }
        _ => Ok(None),
    }
}

/// Offset-paging adapter over a JSON file of person records. Stands in for
/// a live CRM in local runs; note-only (no update-in-place).
pub struct JsonFixtureAdapter {
    source_id: String,
    records: Vec<JsonValue>,
    logs: Mutex<LogBook>,
}

#[derive(Debug, Default)]
struct LogBook {
    next_id: u64,
    entries: HashMap<String, ActivityLog>,
}

impl JsonFixtureAdapter {
    pub fn from_file(source_id: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let records: Vec<JsonValue> =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::from_records(source_id, records))
    }

    pub fn from_records(source_id: impl Into<String>, records: Vec<JsonValue>) -> Self {
        Self {
            source_id: source_id.into(),
            records,
            logs: Mutex::new(LogBook::default()),
        }
    }

    pub fn logged_activity(&self, log_id: &str) -> Option<ActivityLog> {
        self.logs
            .lock()
            .expect("log book lock")
            .entries
            .get(log_id)
            .cloned()
    }

    fn modified_at(record: &JsonValue) -> Option<DateTime<Utc>> {
        record
            .get("modifiedAt")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

fn json_str(record: &JsonValue, key: &str) -> Option<String> {
    record.get(key).and_then(|v| v.as_str()).map(String::from)
}

fn json_str_vec(record: &JsonValue, key: &str) -> Vec<String> {
    record
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl SourceAdapter for JsonFixtureAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_person_page(
        &self,
        request: &PersonPageRequest,
    ) -> Result<PersonPage, AdapterError> {
        let page = decode_offset(request.cursor.as_deref())?;
        let limit = request.limit.max(1) as usize;

        let mut filtered: Vec<&JsonValue> = self
            .records
            .iter()
            .filter(|record| match (request.modified_since, Self::modified_at(record)) {
                (Some(since), Some(modified)) => modified > since,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .collect();
        filtered.sort_by_key(|record| Self::modified_at(record));
        if request.sort_desc {
            filtered.reverse();
        }

        let start = (page as usize).saturating_mul(limit);
        let records: Vec<JsonValue> = filtered
            .iter()
            .skip(start)
            .take(limit)
            .map(|r| (*r).clone())
            .collect();
        let has_more = start + records.len() < filtered.len();

        Ok(PersonPage {
            records,
            cursor: has_more.then(|| encode_offset(page + 1)),
            has_more,
        })
    }

    fn transform_person(&self, record: &JsonValue) -> Result<ContactDraft, AdapterError> {
        let external_id = json_str(record, "id")
            .ok_or_else(|| AdapterError::Message("person record has no id".to_string()))?;
        Ok(ContactDraft {
            external_id,
            source_name: self.source_id.clone(),
            first_name: json_str(record, "firstName"),
            last_name: json_str(record, "lastName"),
            company: json_str(record, "company"),
            role: json_str(record, "role"),
            emails: json_str_vec(record, "emails"),
            phone_numbers: json_str_vec(record, "phones"),
            source_url: json_str(record, "url"),
        })
    }

    async fn find_person_by_phone(
        &self,
        phone: &str,
    ) -> Result<Option<PersonRef>, AdapterError> {
        let found = self.records.iter().find(|record| {
            json_str_vec(record, "phones")
                .iter()
                .any(|candidate| candidate == phone)
        });
        Ok(found.and_then(|record| {
            json_str(record, "id").map(|id| PersonRef {
                id,
                contact_type: "person".to_string(),
            })
        }))
    }

    async fn log_activity(&self, log: &ActivityLog) -> Result<String, AdapterError> {
        let mut book = self.logs.lock().expect("log book lock");
        book.next_id += 1;
        let log_id = format!("log-{}", book.next_id);
        book.entries.insert(log_id.clone(), log.clone());
        Ok(log_id)
    }

    async fn delete_activity(&self, log_id: &str) -> Result<(), AdapterError> {
        let mut book = self.logs.lock().expect("log book lock");
        if book.entries.remove(log_id).is_none() {
            return Err(AdapterError::Message(format!("no such activity log {log_id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdx_core::{ActivityDirection, ActivityKind};
    use serde_json::json;

    fn person(id: &str, modified: &str, phone: &str) -> JsonValue {
        json!({
            "id": id,
            "firstName": "Ada",
            "lastName": "Lovelace",
            "company": "Analytical Engines",
            "emails": [format!("{id}@example.com")],
            "phones": [phone],
            "modifiedAt": modified,
        })
    }

    fn fixture() -> JsonFixtureAdapter {
        JsonFixtureAdapter::from_records(
            "crm-fixture",
            vec![
                person("p1", "2026-01-01T00:00:00Z", "+15550001"),
                person("p2", "2026-02-01T00:00:00Z", "+15550002"),
                person("p3", "2026-03-01T00:00:00Z", "+15550003"),
            ],
        )
    }

    #[test]
    fn offset_cursor_roundtrip() {
        assert_eq!(decode_offset(None).expect("first page"), 0);
        assert_eq!(decode_offset(Some(&encode_offset(7))).expect("page"), 7);
        assert!(decode_offset(Some("not-a-page")).is_err());
    }

    #[test]
    fn token_extracted_from_next_page_url() {
        let token = token_from_next_url(
            "https://api.example.com/people?limit=50&cursor=abc123",
            "cursor",
        )
        .expect("parse");
        assert_eq!(token.as_deref(), Some("abc123"));

        let missing = token_from_next_url("https://api.example.com/people?limit=50", "cursor")
            .expect("parse");
        assert!(missing.is_none());

        assert!(token_from_next_url("::not a url::", "cursor").is_err());
    }

    #[tokio::test]
    async fn fixture_pages_terminate() {
        let adapter = fixture();
        let mut request = PersonPageRequest::first_page("person", 2);
        let first = adapter.fetch_person_page(&request).await.expect("page 1");
        assert_eq!(first.records.len(), 2);
        assert!(first.has_more);

        request = request.with_cursor(first.cursor);
        let second = adapter.fetch_person_page(&request).await.expect("page 2");
        assert_eq!(second.records.len(), 1);
        assert!(!second.has_more);
        assert!(second.cursor.is_none());
    }

    #[tokio::test]
    async fn modified_since_filters_and_sort_desc_freshens_first() {
        let adapter = fixture();
        let since = DateTime::parse_from_rfc3339("2026-01-15T00:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let request = PersonPageRequest::first_page("person", 10)
            .modified_since(Some(since))
            .newest_first();

        let page = adapter.fetch_person_page(&request).await.expect("page");
        let ids: Vec<_> = page
            .records
            .iter()
            .map(|r| r.get("id").and_then(|v| v.as_str()).expect("id"))
            .collect();
        assert_eq!(ids, vec!["p3", "p2"]);
    }

    #[tokio::test]
    async fn transform_requires_external_id() {
        let adapter = fixture();
        let draft = adapter
            .transform_person(&person("p1", "2026-01-01T00:00:00Z", "+15550001"))
            .expect("transform");
        assert_eq!(draft.external_id, "p1");
        assert_eq!(draft.source_name, "crm-fixture");
        assert_eq!(draft.phone_numbers, vec!["+15550001"]);

        assert!(adapter.transform_person(&json!({"name": "no id"})).is_err());
    }

    #[tokio::test]
    async fn phone_lookup_resolves_person() {
        let adapter = fixture();
        let found = adapter
            .find_person_by_phone("+15550002")
            .await
            .expect("lookup");
        assert_eq!(
            found,
            Some(PersonRef {
                id: "p2".to_string(),
                contact_type: "person".to_string()
            })
        );
        assert!(adapter
            .find_person_by_phone("+15559999")
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn activity_logs_create_and_delete() {
        let adapter = fixture();
        let log = ActivityLog {
            kind: ActivityKind::Call,
            direction: ActivityDirection::Incoming,
            contact_id: "p1".into(),
            contact_type: "person".into(),
            duration_seconds: Some(60),
            participants: vec!["+15550001".into()],
            occurred_at: Utc::now(),
            body: "Call with Ada".into(),
        };
        let log_id = adapter.log_activity(&log).await.expect("create");
        assert!(adapter.logged_activity(&log_id).is_some());

        adapter.delete_activity(&log_id).await.expect("delete");
        assert!(adapter.logged_activity(&log_id).is_none());
        assert!(adapter.delete_activity(&log_id).await.is_err());

        // note-only adapter: no in-place update capability
        assert!(!adapter.supports_update_in_place());
        assert!(matches!(
            adapter.update_activity(&log_id, &log).await,
            Err(AdapterError::Unsupported(_))
        ));
    }
}
