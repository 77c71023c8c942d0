//! Durable engine state (mapping, enrichment, checkpoint stores) + the
//! target-directory HTTP client.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cdx_core::{ContactDraft, EnrichmentRecord, MappingRecord};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cdx-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

/// Resume point for an interrupted sync of one (source, object type) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub source: String,
    pub object_type: String,
    pub cursor: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Mapping records keyed per (source instance, external id). `put`
/// overwrites; records are never appended.
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn get(&self, source: &str, external_id: &str)
        -> Result<Option<MappingRecord>, StoreError>;
    async fn put(&self, source: &str, record: MappingRecord) -> Result<(), StoreError>;
    async fn remove(&self, source: &str, external_id: &str) -> Result<(), StoreError>;
    async fn list(&self, source: &str) -> Result<Vec<MappingRecord>, StoreError>;
}

/// Enrichment records keyed by external activity id.
#[async_trait]
pub trait EnrichmentStore: Send + Sync {
    async fn get(&self, activity_id: &str) -> Result<Option<EnrichmentRecord>, StoreError>;
    async fn put(&self, record: EnrichmentRecord) -> Result<(), StoreError>;
    async fn remove(&self, activity_id: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, source: &str, object_type: &str)
        -> Result<Option<SyncCheckpoint>, StoreError>;
    async fn save(&self, checkpoint: SyncCheckpoint) -> Result<(), StoreError>;
    async fn clear(&self, source: &str, object_type: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    mappings: HashMap<String, BTreeMap<String, MappingRecord>>,
    #[serde(default)]
    enrichments: BTreeMap<String, EnrichmentRecord>,
    #[serde(default)]
    checkpoints: BTreeMap<String, SyncCheckpoint>,
}

fn checkpoint_key(source: &str, object_type: &str) -> String {
    format!("{source}/{object_type}")
}

/// JSON-file-backed state store. The snapshot is written via a temp file and
/// an atomic rename so a crashed write never leaves a torn document.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    state: Mutex<Option<PersistedState>>,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            path: root.into().join("cdx-state.json"),
            state: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_state<T>(
        &self,
        f: impl FnOnce(&mut PersistedState) -> (T, bool),
    ) -> Result<T, StoreError> {
        let mut guard = self.state.lock().await;
        if guard.is_none() {
            *guard = Some(self.load_snapshot().await?);
        }
        let state = guard.as_mut().expect("state loaded above");
        let (out, dirty) = f(state);
        if dirty {
            persist_json(&self.path, state).await?;
        }
        Ok(out)
    }

    async fn load_snapshot(&self) -> Result<PersistedState, StoreError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(PersistedState::default())
            }
            Err(err) => Err(err.into()),
        }
    }
}

async fn persist_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::Other(format!("state path {} has no parent", path.display())))?;
    fs::create_dir_all(parent).await?;

    let bytes = serde_json::to_vec_pretty(value)?;
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    file.write_all(&bytes).await?;
    file.flush().await?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err.into())
        }
    }
}

#[async_trait]
impl MappingStore for FileStateStore {
    async fn get(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<MappingRecord>, StoreError> {
        self.with_state(|state| {
            let found = state
                .mappings
                .get(source)
                .and_then(|m| m.get(external_id).cloned());
            (found, false)
        })
        .await
    }

    async fn put(&self, source: &str, record: MappingRecord) -> Result<(), StoreError> {
        self.with_state(|state| {
            state
                .mappings
                .entry(source.to_string())
                .or_default()
                .insert(record.external_id.clone(), record);
            ((), true)
        })
        .await
    }

    async fn remove(&self, source: &str, external_id: &str) -> Result<(), StoreError> {
        self.with_state(|state| {
            let removed = state
                .mappings
                .get_mut(source)
                .and_then(|m| m.remove(external_id))
                .is_some();
            ((), removed)
        })
        .await
    }

    async fn list(&self, source: &str) -> Result<Vec<MappingRecord>, StoreError> {
        self.with_state(|state| {
            let records = state
                .mappings
                .get(source)
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default();
            (records, false)
        })
        .await
    }
}

#[async_trait]
impl EnrichmentStore for FileStateStore {
    async fn get(&self, activity_id: &str) -> Result<Option<EnrichmentRecord>, StoreError> {
        self.with_state(|state| (state.enrichments.get(activity_id).cloned(), false))
            .await
    }

    async fn put(&self, record: EnrichmentRecord) -> Result<(), StoreError> {
        self.with_state(|state| {
            state.enrichments.insert(record.activity_id.clone(), record);
            ((), true)
        })
        .await
    }

    async fn remove(&self, activity_id: &str) -> Result<(), StoreError> {
        self.with_state(|state| {
            let removed = state.enrichments.remove(activity_id).is_some();
            ((), removed)
        })
        .await
    }
}

#[async_trait]
impl CheckpointStore for FileStateStore {
    async fn load(
        &self,
        source: &str,
        object_type: &str,
    ) -> Result<Option<SyncCheckpoint>, StoreError> {
        let key = checkpoint_key(source, object_type);
        self.with_state(|state| (state.checkpoints.get(&key).cloned(), false))
            .await
    }

    async fn save(&self, checkpoint: SyncCheckpoint) -> Result<(), StoreError> {
        let key = checkpoint_key(&checkpoint.source, &checkpoint.object_type);
        self.with_state(|state| {
            state.checkpoints.insert(key, checkpoint);
            ((), true)
        })
        .await
    }

    async fn clear(&self, source: &str, object_type: &str) -> Result<(), StoreError> {
        let key = checkpoint_key(source, object_type);
        self.with_state(|state| {
            let removed = state.checkpoints.remove(&key).is_some();
            ((), removed)
        })
        .await
    }
}

/// Volatile state store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<PersistedState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MappingStore for MemoryStateStore {
    async fn get(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<MappingRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .mappings
            .get(source)
            .and_then(|m| m.get(external_id).cloned()))
    }

    async fn put(&self, source: &str, record: MappingRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .mappings
            .entry(source.to_string())
            .or_default()
            .insert(record.external_id.clone(), record);
        Ok(())
    }

    async fn remove(&self, source: &str, external_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(m) = state.mappings.get_mut(source) {
            m.remove(external_id);
        }
        Ok(())
    }

    async fn list(&self, source: &str) -> Result<Vec<MappingRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .mappings
            .get(source)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl EnrichmentStore for MemoryStateStore {
    async fn get(&self, activity_id: &str) -> Result<Option<EnrichmentRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.enrichments.get(activity_id).cloned())
    }

    async fn put(&self, record: EnrichmentRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.enrichments.insert(record.activity_id.clone(), record);
        Ok(())
    }

    async fn remove(&self, activity_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.enrichments.remove(activity_id);
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStateStore {
    async fn load(
        &self,
        source: &str,
        object_type: &str,
    ) -> Result<Option<SyncCheckpoint>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .checkpoints
            .get(&checkpoint_key(source, object_type))
            .cloned())
    }

    async fn save(&self, checkpoint: SyncCheckpoint) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let key = checkpoint_key(&checkpoint.source, &checkpoint.object_type);
        state.checkpoints.insert(key, checkpoint);
        Ok(())
    }

    async fn clear(&self, source: &str, object_type: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.checkpoints.remove(&checkpoint_key(source, object_type));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Target-directory HTTP client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Classification only; retry policy belongs to the caller's queue layer,
/// never to this client.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("directory status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        retryable: bool,
    },
    #[error("directory {resource} {id} not found")]
    NotFound { resource: &'static str, id: String },
}

impl DirectoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DirectoryError::NotFound { .. })
    }
}

/// A contact as the directory returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryContact {
    pub id: String,
    pub external_id: Option<String>,
    pub source_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
}

/// Acknowledgement of an asynchronous bulk create: receipt, not completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkAccepted {
    pub accepted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WebhookEventKind {
    Message,
    Call,
    CallSummary,
}

/// A webhook endpoint registered in the directory. The chunk slot is carried
/// in the label so reconciliation can recover it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEndpoint {
    pub id: String,
    pub key: String,
    pub url: String,
    pub events: Vec<WebhookEventKind>,
    #[serde(default)]
    pub resource_ids: Vec<String>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWebhookRequest {
    pub url: String,
    pub events: Vec<WebhookEventKind>,
    pub resource_ids: Vec<String>,
    pub label: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWebhookRequest {
    pub resource_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallDetails {
    pub id: String,
    pub direction: String,
    pub duration_seconds: Option<u32>,
    pub phone_number_id: Option<String>,
    pub user_id: Option<String>,
    pub participants: Vec<String>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub summary: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaLink {
    pub url: String,
    pub duration_seconds: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoicemailLink {
    pub url: String,
    pub transcript: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryPhoneNumber {
    pub id: String,
    pub number: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryUser {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

/// The directory REST surface this engine consumes. Implemented over HTTP
/// for production and by in-process fakes in tests.
#[async_trait]
pub trait DirectoryApi: Send + Sync {
    async fn list_contacts_by_external_ids(
        &self,
        source_name: &str,
        external_ids: &[String],
    ) -> Result<Vec<DirectoryContact>, DirectoryError>;

    /// Asynchronous: the directory acknowledges receipt and creates the
    /// contacts out-of-band.
    async fn bulk_create_contacts(
        &self,
        source_name: &str,
        contacts: &[ContactDraft],
    ) -> Result<BulkAccepted, DirectoryError>;

    async fn create_contact(&self, draft: &ContactDraft)
        -> Result<DirectoryContact, DirectoryError>;
    async fn update_contact(
        &self,
        contact_id: &str,
        draft: &ContactDraft,
    ) -> Result<DirectoryContact, DirectoryError>;
    async fn delete_contact(&self, contact_id: &str) -> Result<(), DirectoryError>;

    async fn list_webhooks(&self) -> Result<Vec<WebhookEndpoint>, DirectoryError>;
    async fn create_webhook(
        &self,
        request: &CreateWebhookRequest,
    ) -> Result<WebhookEndpoint, DirectoryError>;
    async fn update_webhook(
        &self,
        webhook_id: &str,
        request: &UpdateWebhookRequest,
    ) -> Result<WebhookEndpoint, DirectoryError>;
    async fn delete_webhook(&self, webhook_id: &str) -> Result<(), DirectoryError>;

    async fn get_call(&self, call_id: &str) -> Result<CallDetails, DirectoryError>;
    async fn get_call_recordings(&self, call_id: &str) -> Result<Vec<MediaLink>, DirectoryError>;
    async fn get_call_voicemails(&self, call_id: &str)
        -> Result<Vec<VoicemailLink>, DirectoryError>;
    async fn get_phone_number(&self, id: &str) -> Result<DirectoryPhoneNumber, DirectoryError>;
    async fn list_phone_numbers(&self) -> Result<Vec<DirectoryPhoneNumber>, DirectoryError>;
    async fn get_user(&self, id: &str) -> Result<DirectoryUser, DirectoryError>;
}

#[derive(Debug, Clone)]
pub struct DirectoryClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl DirectoryClientConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Plain request/response client for the directory API. No retries: the
/// caller owns retry policy and can consult [`classify_status`].
#[derive(Debug)]
pub struct DirectoryClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BulkCreateBody<'a> {
    source_name: &'a str,
    contacts: &'a [ContactDraft],
}

#[derive(Debug, Deserialize)]
struct ListEnvelope<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ItemEnvelope<T> {
    data: T,
}

impl DirectoryClient {
    pub fn new(config: DirectoryClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building directory http client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check(
        &self,
        resp: reqwest::Response,
        resource: &'static str,
        id: &str,
    ) -> Result<reqwest::Response, DirectoryError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(DirectoryError::NotFound {
                resource,
                id: id.to_string(),
            });
        }
        Err(DirectoryError::HttpStatus {
            status: status.as_u16(),
            url: resp.url().to_string(),
            retryable: classify_status(status) == RetryDisposition::Retryable,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        resource: &'static str,
        id: &str,
    ) -> Result<T, DirectoryError> {
        let span = info_span!("directory_request", method = "GET", path);
        let _guard = span.enter();
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.api_key)
            .query(query)
            .send()
            .await?;
        let resp = self.check(resp, resource, id).await?;
        Ok(resp.json().await?)
    }

    async fn send_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
        resource: &'static str,
        id: &str,
    ) -> Result<T, DirectoryError> {
        let span = info_span!("directory_request", method = %method, path);
        let _guard = span.enter();
        let resp = self
            .client
            .request(method, self.url(path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;
        let resp = self.check(resp, resource, id).await?;
        Ok(resp.json().await?)
    }

    async fn delete(
        &self,
        path: &str,
        resource: &'static str,
        id: &str,
    ) -> Result<(), DirectoryError> {
        let span = info_span!("directory_request", method = "DELETE", path);
        let _guard = span.enter();
        let resp = self
            .client
            .delete(self.url(path))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        self.check(resp, resource, id).await?;
        Ok(())
    }
}

#[async_trait]
impl DirectoryApi for DirectoryClient {
    async fn list_contacts_by_external_ids(
        &self,
        source_name: &str,
        external_ids: &[String],
    ) -> Result<Vec<DirectoryContact>, DirectoryError> {
        let query = vec![
            ("sourceName", source_name.to_string()),
            ("externalIds", external_ids.join(",")),
        ];
        let envelope: ListEnvelope<DirectoryContact> = self
            .get_json("/v1/contacts", &query, "contacts", source_name)
            .await?;
        Ok(envelope.data)
    }

    async fn bulk_create_contacts(
        &self,
        source_name: &str,
        contacts: &[ContactDraft],
    ) -> Result<BulkAccepted, DirectoryError> {
        let body = BulkCreateBody {
            source_name,
            contacts,
        };
        let envelope: ItemEnvelope<BulkAccepted> = self
            .send_json(
                reqwest::Method::POST,
                "/v1/contacts/bulk",
                &body,
                "contacts",
                source_name,
            )
            .await?;
        Ok(envelope.data)
    }

    async fn create_contact(
        &self,
        draft: &ContactDraft,
    ) -> Result<DirectoryContact, DirectoryError> {
        let envelope: ItemEnvelope<DirectoryContact> = self
            .send_json(
                reqwest::Method::POST,
                "/v1/contacts",
                draft,
                "contact",
                &draft.external_id,
            )
            .await?;
        Ok(envelope.data)
    }

    async fn update_contact(
        &self,
        contact_id: &str,
        draft: &ContactDraft,
    ) -> Result<DirectoryContact, DirectoryError> {
        let envelope: ItemEnvelope<DirectoryContact> = self
            .send_json(
                reqwest::Method::PATCH,
                &format!("/v1/contacts/{contact_id}"),
                draft,
                "contact",
                contact_id,
            )
            .await?;
        Ok(envelope.data)
    }

    async fn delete_contact(&self, contact_id: &str) -> Result<(), DirectoryError> {
        self.delete(&format!("/v1/contacts/{contact_id}"), "contact", contact_id)
            .await
    }

    async fn list_webhooks(&self) -> Result<Vec<WebhookEndpoint>, DirectoryError> {
        let envelope: ListEnvelope<WebhookEndpoint> =
            self.get_json("/v1/webhooks", &[], "webhooks", "all").await?;
        Ok(envelope.data)
    }

    async fn create_webhook(
        &self,
        request: &CreateWebhookRequest,
    ) -> Result<WebhookEndpoint, DirectoryError> {
        let envelope: ItemEnvelope<WebhookEndpoint> = self
            .send_json(
                reqwest::Method::POST,
                "/v1/webhooks",
                request,
                "webhook",
                &request.label,
            )
            .await?;
        Ok(envelope.data)
    }

    async fn update_webhook(
        &self,
        webhook_id: &str,
        request: &UpdateWebhookRequest,
    ) -> Result<WebhookEndpoint, DirectoryError> {
        let envelope: ItemEnvelope<WebhookEndpoint> = self
            .send_json(
                reqwest::Method::PATCH,
                &format!("/v1/webhooks/{webhook_id}"),
                request,
                "webhook",
                webhook_id,
            )
            .await?;
        Ok(envelope.data)
    }

    async fn delete_webhook(&self, webhook_id: &str) -> Result<(), DirectoryError> {
        self.delete(&format!("/v1/webhooks/{webhook_id}"), "webhook", webhook_id)
            .await
    }

    async fn get_call(&self, call_id: &str) -> Result<CallDetails, DirectoryError> {
        let envelope: ItemEnvelope<CallDetails> = self
            .get_json(&format!("/v1/calls/{call_id}"), &[], "call", call_id)
            .await?;
        Ok(envelope.data)
    }

    async fn get_call_recordings(&self, call_id: &str) -> Result<Vec<MediaLink>, DirectoryError> {
        let envelope: ListEnvelope<MediaLink> = self
            .get_json(
                &format!("/v1/call-recordings/{call_id}"),
                &[],
                "call recordings",
                call_id,
            )
            .await?;
        Ok(envelope.data)
    }

    async fn get_call_voicemails(
        &self,
        call_id: &str,
    ) -> Result<Vec<VoicemailLink>, DirectoryError> {
        let envelope: ListEnvelope<VoicemailLink> = self
            .get_json(
                &format!("/v1/call-voicemails/{call_id}"),
                &[],
                "call voicemails",
                call_id,
            )
            .await?;
        Ok(envelope.data)
    }

    async fn get_phone_number(&self, id: &str) -> Result<DirectoryPhoneNumber, DirectoryError> {
        let envelope: ItemEnvelope<DirectoryPhoneNumber> = self
            .get_json(&format!("/v1/phone-numbers/{id}"), &[], "phone number", id)
            .await?;
        Ok(envelope.data)
    }

    async fn list_phone_numbers(&self) -> Result<Vec<DirectoryPhoneNumber>, DirectoryError> {
        let envelope: ListEnvelope<DirectoryPhoneNumber> = self
            .get_json("/v1/phone-numbers", &[], "phone numbers", "all")
            .await?;
        Ok(envelope.data)
    }

    async fn get_user(&self, id: &str) -> Result<DirectoryUser, DirectoryError> {
        let envelope: ItemEnvelope<DirectoryUser> = self
            .get_json(&format!("/v1/users/{id}"), &[], "user", id)
            .await?;
        Ok(envelope.data)
    }
}
