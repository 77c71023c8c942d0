//! Sync orchestration: page-fetch/transform/upsert loop, bulk upsert with
//! settle delay, incremental upsert, and scheduled recurring syncs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cdx_adapters::{adapter_for_config, AdapterConfig, SourceAdapter};
use cdx_core::{
    ContactDraft, EntityType, MappingRecord, PersonPageRequest, SyncAction, SyncMethod,
    UpsertReport,
};
use cdx_store::{
    CheckpointStore, DirectoryApi, DirectoryClient, DirectoryClientConfig, FileStateStore,
    MappingStore, StoreError, SyncCheckpoint,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cdx-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub adapter: String,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
    #[serde(default = "default_object_types")]
    pub object_types: Vec<String>,
}

fn default_object_types() -> Vec<String> {
    vec!["person".to_string()]
}

impl SourceConfig {
    pub fn adapter_config(&self, workspace_root: &Path) -> AdapterConfig {
        AdapterConfig {
            kind: self.adapter.clone(),
            source_id: self.source_id.clone(),
            fixture_path: self.fixture_path.as_ref().map(|p| workspace_root.join(p)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub directory_base_url: String,
    pub directory_api_key: String,
    pub state_dir: PathBuf,
    pub settle_delay_ms: u64,
    pub page_limit: u32,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub incremental_window_hours: u64,
    pub webhook_capacity: usize,
    pub webhook_receipt_url: String,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            directory_base_url: std::env::var("DIRECTORY_BASE_URL")
                .unwrap_or_else(|_| "https://api.directory.example.com".to_string()),
            directory_api_key: std::env::var("DIRECTORY_API_KEY").unwrap_or_default(),
            state_dir: std::env::var("CDX_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state")),
            settle_delay_ms: std::env::var("CDX_SETTLE_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(900),
            page_limit: std::env::var("CDX_PAGE_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            http_timeout_secs: std::env::var("CDX_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("CDX_USER_AGENT")
                .unwrap_or_else(|_| "cdx-bot/0.1".to_string()),
            scheduler_enabled: std::env::var("CDX_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("CDX_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 */6 * * *".to_string()),
            incremental_window_hours: std::env::var("CDX_INCREMENTAL_WINDOW_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(24),
            webhook_capacity: std::env::var("CDX_WEBHOOK_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            webhook_receipt_url: std::env::var("CDX_WEBHOOK_URL")
                .unwrap_or_else(|_| "http://localhost:8080/hooks/directory".to_string()),
            workspace_root: PathBuf::from("."),
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn directory_client(&self) -> Result<DirectoryClient> {
        let mut config =
            DirectoryClientConfig::new(&self.directory_base_url, &self.directory_api_key);
        config.timeout = Duration::from_secs(self.http_timeout_secs);
        config.user_agent = Some(self.user_agent.clone());
        DirectoryClient::new(config)
    }
}

/// A person change pushed by the source system's webhook.
#[derive(Debug, Clone, PartialEq)]
pub enum PersonChangeEvent {
    Upserted(serde_json::Value),
    Deleted { external_id: String },
}

/// Per-run knobs for one orchestrator instance.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub object_type: String,
    pub page_limit: u32,
    pub settle_delay: Duration,
    pub sort_desc: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            object_type: "person".to_string(),
            page_limit: 100,
            settle_delay: Duration::from_millis(900),
            // freshest records first, so an interrupted sync has already
            // captured the most recent data
            sort_desc: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub method: SyncMethod,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_fetched: usize,
    pub records_seen: usize,
    pub report: UpsertReport,
}

/// Drives full and incremental syncs for one source-system instance. The
/// page loop is strictly sequential: page N is fully processed and its
/// cursor persisted before page N+1 is requested.
pub struct SyncOrchestrator {
    source: Arc<dyn SourceAdapter>,
    directory: Arc<dyn DirectoryApi>,
    mappings: Arc<dyn MappingStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    options: SyncOptions,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn SourceAdapter>,
        directory: Arc<dyn DirectoryApi>,
        mappings: Arc<dyn MappingStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        options: SyncOptions,
    ) -> Self {
        Self {
            source,
            directory,
            mappings,
            checkpoints,
            options,
        }
    }

    pub fn source_id(&self) -> &str {
        self.source.source_id()
    }

    /// Full resync through the asynchronous bulk-create path.
    pub async fn run_full_sync(&self) -> Result<SyncRunSummary> {
        self.run(SyncMethod::Bulk, None).await
    }

    /// Ongoing sync of records modified since the given instant, through
    /// the single-record create/update path.
    pub async fn run_incremental_sync(&self, since: DateTime<Utc>) -> Result<SyncRunSummary> {
        self.run(SyncMethod::Incremental, Some(since)).await
    }

    async fn run(
        &self,
        method: SyncMethod,
        modified_since: Option<DateTime<Utc>>,
    ) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let source_id = self.source.source_id().to_string();
        let object_type = self.options.object_type.clone();

        let mut cursor = self
            .checkpoints
            .load(&source_id, &object_type)
            .await
            .context("loading sync checkpoint")?
            .and_then(|checkpoint| checkpoint.cursor);
        if cursor.is_some() {
            info!(source = %source_id, "resuming sync from persisted cursor");
        }

        let mut pages_fetched = 0usize;
        let mut records_seen = 0usize;
        let mut report = UpsertReport::default();

        loop {
            let request = PersonPageRequest {
                object_type: object_type.clone(),
                cursor: cursor.clone(),
                limit: self.options.page_limit,
                modified_since,
                sort_desc: self.options.sort_desc,
            };
            let page = self.source.fetch_person_page(&request).await?;
            pages_fetched += 1;
            records_seen += page.records.len();

            let mut drafts = Vec::with_capacity(page.records.len());
            for record in &page.records {
                match self.source.transform_person(record) {
                    Ok(draft) => drafts.push(draft),
                    Err(err) => {
                        let external_id = record
                            .get("id")
                            .and_then(|v| v.as_str())
                            .map(String::from);
                        report.failure(external_id, format!("transform failed: {err}"));
                    }
                }
            }

            let page_report = match method {
                SyncMethod::Bulk => self.bulk_upsert(&drafts).await?,
                _ => self.incremental_upsert(&drafts).await?,
            };
            report.merge(page_report);

            // persist the returned cursor as the resume point before asking
            // for the next page
            self.checkpoints
                .save(SyncCheckpoint {
                    source: source_id.clone(),
                    object_type: object_type.clone(),
                    cursor: page.cursor.clone(),
                    updated_at: Utc::now(),
                })
                .await
                .context("persisting sync checkpoint")?;

            match (page.cursor, page.has_more) {
                (Some(next), true) => cursor = Some(next),
                (None, true) => {
                    warn!(source = %source_id, "source reported more pages without a cursor; stopping");
                    break;
                }
                (_, false) => break,
            }
        }

        self.checkpoints
            .clear(&source_id, &object_type)
            .await
            .context("clearing sync checkpoint")?;

        let summary = SyncRunSummary {
            run_id,
            source_id,
            method,
            started_at,
            finished_at: Utc::now(),
            pages_fetched,
            records_seen,
            report,
        };
        info!(
            run_id = %summary.run_id,
            source = %summary.source_id,
            pages = summary.pages_fetched,
            success = summary.report.success_count,
            errors = summary.report.error_count,
            "sync run finished"
        );
        Ok(summary)
    }

    /// Submit a batch to the directory's asynchronous bulk-create endpoint,
    /// wait out the settle delay, then resolve internal ids and write
    /// mapping records one by one.
    pub async fn bulk_upsert(&self, drafts: &[ContactDraft]) -> Result<UpsertReport> {
        let mut report = UpsertReport::default();
        if drafts.is_empty() {
            return Ok(report);
        }
        let source = self.source.source_id();

        self.directory.bulk_create_contacts(source, drafts).await?;

        // the bulk endpoint acknowledges receipt, not completion; creation
        // finishes out-of-band
        tokio::time::sleep(self.options.settle_delay).await;

        let external_ids: Vec<String> =
            drafts.iter().map(|d| d.external_id.clone()).collect();
        let contacts = self
            .directory
            .list_contacts_by_external_ids(source, &external_ids)
            .await?;
        let by_external: HashMap<&str, &cdx_store::DirectoryContact> = contacts
            .iter()
            .filter_map(|c| c.external_id.as_deref().map(|ext| (ext, c)))
            .collect();

        if by_external.is_empty() {
            report.batch_error("Bulk create failed: no contacts were created");
            return Ok(report);
        }

        for draft in drafts {
            let Some(contact) = by_external.get(draft.external_id.as_str()) else {
                report.record_error(&draft.external_id, "Contact not found after bulk create");
                continue;
            };
            match self
                .write_mapping(draft, &contact.id, SyncMethod::Bulk)
                .await
            {
                Ok(()) => report.record_success(),
                Err(err) => report
                    .record_error(&draft.external_id, format!("mapping write failed: {err}")),
            }
        }
        Ok(report)
    }

    /// Upsert records one at a time through the mapping store: mapped
    /// records are updated in the directory, unmapped records created.
    pub async fn incremental_upsert(&self, drafts: &[ContactDraft]) -> Result<UpsertReport> {
        let mut report = UpsertReport::default();
        for draft in drafts {
            self.upsert_one(draft, SyncMethod::Incremental, &mut report)
                .await;
        }
        Ok(report)
    }

    /// Apply one person change pushed by the source system's own webhook.
    /// Mapping records written through this path carry
    /// `SyncMethod::Webhook`; a source-record deletion is the only event
    /// that removes a mapping.
    pub async fn apply_person_change(&self, event: &PersonChangeEvent) -> Result<UpsertReport> {
        let mut report = UpsertReport::default();
        let source = self.source.source_id();

        match event {
            PersonChangeEvent::Upserted(record) => match self.source.transform_person(record) {
                Ok(draft) => {
                    self.upsert_one(&draft, SyncMethod::Webhook, &mut report)
                        .await;
                }
                Err(err) => {
                    let external_id =
                        record.get("id").and_then(|v| v.as_str()).map(String::from);
                    report.failure(external_id, format!("transform failed: {err}"));
                }
            },
            PersonChangeEvent::Deleted { external_id } => {
                match self.mappings.get(source, external_id).await {
                    Ok(Some(mapping)) => {
                        // already-gone directory contacts make the delete a no-op
                        match self.directory.delete_contact(&mapping.internal_id).await {
                            Ok(()) => {}
                            Err(err) if err.is_not_found() => {}
                            Err(err) => {
                                report.record_error(external_id, err.to_string());
                                return Ok(report);
                            }
                        }
                        match self.mappings.remove(source, external_id).await {
                            Ok(()) => report.record_success(),
                            Err(err) => report.record_error(
                                external_id,
                                format!("mapping delete failed: {err}"),
                            ),
                        }
                    }
                    Ok(None) => report.record_success(),
                    Err(err) => {
                        report.record_error(external_id, format!("mapping read failed: {err}"));
                    }
                }
            }
        }
        Ok(report)
    }

    async fn upsert_one(
        &self,
        draft: &ContactDraft,
        sync_method: SyncMethod,
        report: &mut UpsertReport,
    ) {
        let source = self.source.source_id();
        let existing = match self.mappings.get(source, &draft.external_id).await {
            Ok(existing) => existing,
            Err(err) => {
                report.record_error(&draft.external_id, format!("mapping read failed: {err}"));
                return;
            }
        };

        // a mapped contact missing from the directory raises for that
        // record: there is nothing to update
        let result = match existing {
            Some(mapping) => self.directory.update_contact(&mapping.internal_id, draft).await,
            None => self.directory.create_contact(draft).await,
        };

        match result {
            Ok(contact) => match self.write_mapping(draft, &contact.id, sync_method).await {
                Ok(()) => report.record_success(),
                Err(err) => report
                    .record_error(&draft.external_id, format!("mapping write failed: {err}")),
            },
            Err(err) => report.record_error(&draft.external_id, err.to_string()),
        }
    }

    async fn write_mapping(
        &self,
        draft: &ContactDraft,
        internal_id: &str,
        sync_method: SyncMethod,
    ) -> Result<(), StoreError> {
        let source = self.source.source_id();
        let action = match self.mappings.get(source, &draft.external_id).await? {
            Some(_) => SyncAction::Updated,
            None => SyncAction::Created,
        };
        self.mappings
            .put(
                source,
                MappingRecord {
                    external_id: draft.external_id.clone(),
                    internal_id: internal_id.to_string(),
                    entity_type: EntityType::Person,
                    sync_method,
                    action,
                    last_synced_at: Utc::now(),
                },
            )
            .await
    }
}

pub async fn load_source_registry(workspace_root: &Path) -> Result<SourceRegistry> {
    let path = workspace_root.join("sources.yaml");
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Build one orchestrator per enabled source in the registry.
pub async fn build_orchestrators_from_env(
    config: &SyncConfig,
) -> Result<Vec<Arc<SyncOrchestrator>>> {
    let registry = load_source_registry(&config.workspace_root).await?;
    let store = Arc::new(FileStateStore::new(config.state_dir.clone()));
    let directory: Arc<dyn DirectoryApi> = Arc::new(config.directory_client()?);

    let mut orchestrators = Vec::new();
    for source in registry.sources.into_iter().filter(|s| s.enabled) {
        let adapter_config = source.adapter_config(&config.workspace_root);
        for object_type in &source.object_types {
            let adapter = adapter_for_config(&adapter_config)?
                .with_context(|| format!("no adapter registered for {}", source.source_id))?;
            orchestrators.push(Arc::new(SyncOrchestrator::new(
                Arc::from(adapter),
                directory.clone(),
                store.clone(),
                store.clone(),
                SyncOptions {
                    object_type: object_type.clone(),
                    page_limit: config.page_limit,
                    settle_delay: config.settle_delay(),
                    ..SyncOptions::default()
                },
            )));
        }
    }
    Ok(orchestrators)
}

pub async fn run_full_sync_from_env() -> Result<Vec<SyncRunSummary>> {
    let config = SyncConfig::from_env();
    let orchestrators = build_orchestrators_from_env(&config).await?;
    let mut summaries = Vec::with_capacity(orchestrators.len());
    for orchestrator in orchestrators {
        summaries.push(orchestrator.run_full_sync().await?);
    }
    Ok(summaries)
}

pub async fn run_incremental_sync_from_env(since: DateTime<Utc>) -> Result<Vec<SyncRunSummary>> {
    let config = SyncConfig::from_env();
    let orchestrators = build_orchestrators_from_env(&config).await?;
    let mut summaries = Vec::with_capacity(orchestrators.len());
    for orchestrator in orchestrators {
        summaries.push(orchestrator.run_incremental_sync(since).await?);
    }
    Ok(summaries)
}

/// Wire recurring incremental syncs when the scheduler is enabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrators: Vec<Arc<SyncOrchestrator>>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let window = chrono::Duration::hours(config.incremental_window_hours as i64);
    for orchestrator in orchestrators {
        let job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _lock| {
            let orchestrator = orchestrator.clone();
            Box::pin(async move {
                let since = Utc::now() - window;
                match orchestrator.run_incremental_sync(since).await {
                    Ok(summary) => info!(
                        source = %summary.source_id,
                        success = summary.report.success_count,
                        errors = summary.report.error_count,
                        "scheduled incremental sync finished"
                    ),
                    Err(err) => warn!(error = %err, "scheduled incremental sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {}", config.sync_cron))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cdx_adapters::{AdapterError, PersonRef};
    use cdx_core::{ActivityLog, PersonPage};
    use cdx_store::{
        BulkAccepted, CallDetails, CreateWebhookRequest, DirectoryContact, DirectoryError,
        DirectoryPhoneNumber, DirectoryUser, MediaLink, MemoryStateStore, UpdateWebhookRequest,
        VoicemailLink, WebhookEndpoint,
    };
    use serde_json::json;
    use std::sync::Mutex;

    struct ScriptedAdapter {
        pages: Vec<PersonPage>,
        fail_at: Option<usize>,
        requests: Mutex<Vec<PersonPageRequest>>,
    }

    impl ScriptedAdapter {
        fn new(pages: Vec<PersonPage>) -> Self {
            Self {
                pages,
                fail_at: None,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn request_count(&self) -> usize {
            self.requests.lock().expect("requests lock").len()
        }

        fn request_cursors(&self) -> Vec<Option<String>> {
            self.requests
                .lock()
                .expect("requests lock")
                .iter()
                .map(|r| r.cursor.clone())
                .collect()
        }
    }

    #[async_trait]
    impl SourceAdapter for ScriptedAdapter {
        fn source_id(&self) -> &str {
            "crm-test"
        }

        async fn fetch_person_page(
            &self,
            request: &PersonPageRequest,
        ) -> Result<PersonPage, AdapterError> {
            let mut requests = self.requests.lock().expect("requests lock");
            let index = requests.len();
            requests.push(request.clone());
            if self.fail_at == Some(index) {
                return Err(AdapterError::Message("source rate limited".to_string()));
            }
            Ok(self.pages[index].clone())
        }

        fn transform_person(
            &self,
            record: &serde_json::Value,
        ) -> Result<ContactDraft, AdapterError> {
            let external_id = record
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| AdapterError::Message("person record has no id".to_string()))?;
            Ok(ContactDraft {
                external_id: external_id.to_string(),
                source_name: "crm-test".to_string(),
                ..ContactDraft::default()
            })
        }

        async fn find_person_by_phone(
            &self,
            _phone: &str,
        ) -> Result<Option<PersonRef>, AdapterError> {
            Ok(None)
        }

        async fn log_activity(&self, _log: &ActivityLog) -> Result<String, AdapterError> {
            Ok("log-1".to_string())
        }

        async fn delete_activity(&self, _log_id: &str) -> Result<(), AdapterError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeDirectory {
        resolved: Vec<String>,
        bulk_calls: Mutex<usize>,
    }

    impl FakeDirectory {
        fn resolving(ids: &[&str]) -> Self {
            Self {
                resolved: ids.iter().map(|s| s.to_string()).collect(),
                ..Self::default()
            }
        }

        fn contact(external_id: &str) -> DirectoryContact {
            DirectoryContact {
                id: format!("dir-{external_id}"),
                external_id: Some(external_id.to_string()),
                source_name: Some("crm-test".to_string()),
                first_name: None,
                last_name: None,
                company: None,
            }
        }
    }

    #[async_trait]
    impl DirectoryApi for FakeDirectory {
        async fn list_contacts_by_external_ids(
            &self,
            _source_name: &str,
            external_ids: &[String],
        ) -> Result<Vec<DirectoryContact>, DirectoryError> {
            Ok(external_ids
                .iter()
                .filter(|id| self.resolved.contains(id))
                .map(|id| Self::contact(id))
                .collect())
        }

        async fn bulk_create_contacts(
            &self,
            _source_name: &str,
            contacts: &[ContactDraft],
        ) -> Result<BulkAccepted, DirectoryError> {
            *self.bulk_calls.lock().expect("bulk lock") += 1;
            Ok(BulkAccepted {
                accepted: contacts.len(),
            })
        }

        async fn create_contact(
            &self,
            draft: &ContactDraft,
        ) -> Result<DirectoryContact, DirectoryError> {
            Ok(Self::contact(&draft.external_id))
        }

        async fn update_contact(
            &self,
            contact_id: &str,
            draft: &ContactDraft,
        ) -> Result<DirectoryContact, DirectoryError> {
            if !self.resolved.contains(&draft.external_id) {
                return Err(DirectoryError::NotFound {
                    resource: "contact",
                    id: contact_id.to_string(),
                });
            }
            Ok(Self::contact(&draft.external_id))
        }

        async fn delete_contact(&self, _contact_id: &str) -> Result<(), DirectoryError> {
            Ok(())
        }

        async fn list_webhooks(&self) -> Result<Vec<WebhookEndpoint>, DirectoryError> {
            Ok(Vec::new())
        }

        async fn create_webhook(
            &self,
            _request: &CreateWebhookRequest,
        ) -> Result<WebhookEndpoint, DirectoryError> {
            unimplemented!("not used in sync tests")
        }

        async fn update_webhook(
            &self,
            _webhook_id: &str,
            _request: &UpdateWebhookRequest,
        ) -> Result<WebhookEndpoint, DirectoryError> {
            unimplemented!("not used in sync tests")
        }

        async fn delete_webhook(&self, _webhook_id: &str) -> Result<(), DirectoryError> {
            unimplemented!("not used in sync tests")
        }

        async fn get_call(&self, _call_id: &str) -> Result<CallDetails, DirectoryError> {
            unimplemented!("not used in sync tests")
        }

        async fn get_call_recordings(
            &self,
            _call_id: &str,
        ) -> Result<Vec<MediaLink>, DirectoryError> {
            unimplemented!("not used in sync tests")
        }

        async fn get_call_voicemails(
            &self,
            _call_id: &str,
        ) -> Result<Vec<VoicemailLink>, DirectoryError> {
            unimplemented!("not used in sync tests")
        }

        async fn get_phone_number(
            &self,
            _id: &str,
        ) -> Result<DirectoryPhoneNumber, DirectoryError> {
            unimplemented!("not used in sync tests")
        }

        async fn list_phone_numbers(&self) -> Result<Vec<DirectoryPhoneNumber>, DirectoryError> {
            Ok(Vec::new())
        }

        async fn get_user(&self, _id: &str) -> Result<DirectoryUser, DirectoryError> {
            unimplemented!("not used in sync tests")
        }
    }

    fn page(ids: &[&str], cursor: Option<&str>, has_more: bool) -> PersonPage {
        PersonPage {
            records: ids.iter().map(|id| json!({ "id": id })).collect(),
            cursor: cursor.map(String::from),
            has_more,
        }
    }

    fn draft(id: &str) -> ContactDraft {
        ContactDraft {
            external_id: id.to_string(),
            source_name: "crm-test".to_string(),
            ..ContactDraft::default()
        }
    }

    fn orchestrator(
        adapter: Arc<ScriptedAdapter>,
        directory: Arc<FakeDirectory>,
        store: Arc<MemoryStateStore>,
    ) -> SyncOrchestrator {
        SyncOrchestrator::new(
            adapter,
            directory,
            store.clone(),
            store,
            SyncOptions {
                settle_delay: Duration::from_millis(5),
                ..SyncOptions::default()
            },
        )
    }

    #[tokio::test]
    async fn pagination_stops_exactly_when_has_more_is_false() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![
            page(&["p1"], Some("c1"), true),
            page(&["p2"], Some("c2"), true),
            page(&["p3"], None, false),
        ]));
        let directory = Arc::new(FakeDirectory::resolving(&["p1", "p2", "p3"]));
        let store = Arc::new(MemoryStateStore::new());
        let sync = orchestrator(adapter.clone(), directory, store);

        let summary = sync.run_full_sync().await.expect("sync");
        assert_eq!(adapter.request_count(), 3);
        assert_eq!(summary.pages_fetched, 3);
        assert_eq!(
            adapter.request_cursors(),
            vec![None, Some("c1".to_string()), Some("c2".to_string())]
        );
        assert_eq!(summary.report.success_count, 3);
        assert_eq!(summary.report.error_count, 0);
    }

    #[tokio::test]
    async fn bulk_upsert_reports_unresolved_records_individually() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![]));
        let directory = Arc::new(FakeDirectory::resolving(&["p1"]));
        let store = Arc::new(MemoryStateStore::new());
        let sync = orchestrator(adapter, directory, store);

        let report = sync
            .bulk_upsert(&[draft("p1"), draft("p2"), draft("p3")])
            .await
            .expect("bulk upsert");

        assert_eq!(report.success_count, 1);
        assert_eq!(report.error_count, 2);
        assert_eq!(report.errors[0].external_id.as_deref(), Some("p2"));
        assert_eq!(report.errors[0].error, "Contact not found after bulk create");
        assert_eq!(report.errors[1].external_id.as_deref(), Some("p3"));
    }

    #[tokio::test]
    async fn fully_failed_bulk_call_is_one_batch_error() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![]));
        let directory = Arc::new(FakeDirectory::resolving(&[]));
        let store = Arc::new(MemoryStateStore::new());
        let sync = orchestrator(adapter, directory, store);

        let report = sync
            .bulk_upsert(&[draft("p1"), draft("p2"), draft("p3")])
            .await
            .expect("bulk upsert");

        assert_eq!(report.success_count, 0);
        assert_eq!(report.error_count, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].external_id.is_none());
    }

    #[tokio::test]
    async fn syncing_twice_keeps_one_mapping_and_marks_it_updated() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![]));
        let directory = Arc::new(FakeDirectory::resolving(&["p1"]));
        let store = Arc::new(MemoryStateStore::new());
        let sync = orchestrator(adapter, directory, store.clone());

        sync.bulk_upsert(&[draft("p1")]).await.expect("bulk");
        let first = MappingStore::get(store.as_ref(), "crm-test", "p1")
            .await
            .expect("get")
            .expect("mapping exists");
        assert_eq!(first.action, SyncAction::Created);
        assert_eq!(first.sync_method, SyncMethod::Bulk);

        sync.incremental_upsert(&[draft("p1")])
            .await
            .expect("incremental");
        let all = MappingStore::list(store.as_ref(), "crm-test")
            .await
            .expect("list");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].action, SyncAction::Updated);
        assert_eq!(all[0].sync_method, SyncMethod::Incremental);
        assert!(all[0].last_synced_at >= first.last_synced_at);
    }

    #[tokio::test]
    async fn incremental_update_of_missing_target_raises_per_record() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![]));
        // p1 mapped but the directory no longer has it; p2 is new
        let directory = Arc::new(FakeDirectory::resolving(&[]));
        let store = Arc::new(MemoryStateStore::new());
        MappingStore::put(
            store.as_ref(),
            "crm-test",
            MappingRecord {
                external_id: "p1".to_string(),
                internal_id: "dir-p1".to_string(),
                entity_type: EntityType::Person,
                sync_method: SyncMethod::Bulk,
                action: SyncAction::Created,
                last_synced_at: Utc::now(),
            },
        )
        .await
        .expect("seed mapping");
        let sync = orchestrator(adapter, directory, store);

        let report = sync
            .incremental_upsert(&[draft("p1"), draft("p2")])
            .await
            .expect("incremental");
        assert_eq!(report.success_count, 1);
        assert_eq!(report.error_count, 1);
        assert_eq!(report.errors[0].external_id.as_deref(), Some("p1"));
    }

    struct FailingMappingStore {
        inner: MemoryStateStore,
        fail_for: String,
    }

    #[async_trait]
    impl MappingStore for FailingMappingStore {
        async fn get(
            &self,
            source: &str,
            external_id: &str,
        ) -> Result<Option<MappingRecord>, StoreError> {
            MappingStore::get(&self.inner, source, external_id).await
        }

        async fn put(&self, source: &str, record: MappingRecord) -> Result<(), StoreError> {
            if record.external_id == self.fail_for {
                return Err(StoreError::Other("mapping store unavailable".to_string()));
            }
            MappingStore::put(&self.inner, source, record).await
        }

        async fn remove(&self, source: &str, external_id: &str) -> Result<(), StoreError> {
            MappingStore::remove(&self.inner, source, external_id).await
        }

        async fn list(&self, source: &str) -> Result<Vec<MappingRecord>, StoreError> {
            MappingStore::list(&self.inner, source).await
        }
    }

    #[tokio::test]
    async fn mapping_write_failure_does_not_block_siblings() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![]));
        let directory = Arc::new(FakeDirectory::resolving(&["p1", "p2", "p3"]));
        let mappings = Arc::new(FailingMappingStore {
            inner: MemoryStateStore::new(),
            fail_for: "p2".to_string(),
        });
        let sync = SyncOrchestrator::new(
            adapter,
            directory,
            mappings,
            Arc::new(MemoryStateStore::new()),
            SyncOptions {
                settle_delay: Duration::from_millis(5),
                ..SyncOptions::default()
            },
        );

        let report = sync
            .bulk_upsert(&[draft("p1"), draft("p2"), draft("p3")])
            .await
            .expect("bulk upsert");
        assert_eq!(report.success_count, 2);
        assert_eq!(report.error_count, 1);
        assert_eq!(report.errors[0].external_id.as_deref(), Some("p2"));
    }

    #[tokio::test]
    async fn interrupted_run_resumes_from_persisted_cursor() {
        let store = Arc::new(MemoryStateStore::new());
        let failing = Arc::new(ScriptedAdapter {
            pages: vec![page(&["p1"], Some("c1"), true), PersonPage::empty()],
            fail_at: Some(1),
            requests: Mutex::new(Vec::new()),
        });
        let directory = Arc::new(FakeDirectory::resolving(&["p1", "p2"]));
        let sync = orchestrator(failing, directory.clone(), store.clone());
        sync.run_full_sync().await.expect_err("second page fails");

        let checkpoint = store
            .load("crm-test", "person")
            .await
            .expect("load")
            .expect("checkpoint saved");
        assert_eq!(checkpoint.cursor.as_deref(), Some("c1"));

        let resumed = Arc::new(ScriptedAdapter::new(vec![page(&["p2"], None, false)]));
        let sync = orchestrator(resumed.clone(), directory, store.clone());
        sync.run_full_sync().await.expect("resumed run");
        assert_eq!(resumed.request_cursors(), vec![Some("c1".to_string())]);
        assert!(store
            .load("crm-test", "person")
            .await
            .expect("load")
            .is_none());
    }

    #[tokio::test]
    async fn webhook_person_change_writes_mapping_with_webhook_method() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![]));
        let directory = Arc::new(FakeDirectory::resolving(&[]));
        let store = Arc::new(MemoryStateStore::new());
        let sync = orchestrator(adapter, directory, store.clone());

        let report = sync
            .apply_person_change(&PersonChangeEvent::Upserted(json!({ "id": "p1" })))
            .await
            .expect("apply change");
        assert_eq!(report.success_count, 1);

        let mapping = MappingStore::get(store.as_ref(), "crm-test", "p1")
            .await
            .expect("get")
            .expect("mapping written");
        assert_eq!(mapping.sync_method, SyncMethod::Webhook);
        assert_eq!(mapping.action, SyncAction::Created);
    }

    #[tokio::test]
    async fn source_record_deletion_removes_the_mapping() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![]));
        let directory = Arc::new(FakeDirectory::resolving(&["p1"]));
        let store = Arc::new(MemoryStateStore::new());
        let sync = orchestrator(adapter, directory, store.clone());

        sync.bulk_upsert(&[draft("p1")]).await.expect("seed");
        assert!(MappingStore::get(store.as_ref(), "crm-test", "p1")
            .await
            .expect("get")
            .is_some());

        let report = sync
            .apply_person_change(&PersonChangeEvent::Deleted {
                external_id: "p1".to_string(),
            })
            .await
            .expect("apply delete");
        assert_eq!(report.success_count, 1);
        assert_eq!(report.error_count, 0);
        assert!(MappingStore::get(store.as_ref(), "crm-test", "p1")
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn deleting_an_unmapped_record_is_a_no_op() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![]));
        let directory = Arc::new(FakeDirectory::resolving(&[]));
        let store = Arc::new(MemoryStateStore::new());
        let sync = orchestrator(adapter, directory, store);

        let report = sync
            .apply_person_change(&PersonChangeEvent::Deleted {
                external_id: "p-unknown".to_string(),
            })
            .await
            .expect("apply delete");
        assert_eq!(report.success_count, 1);
        assert_eq!(report.error_count, 0);
    }

    #[test]
    fn registry_yaml_parses() {
        let yaml = r#"
sources:
  - source_id: crm-fixture
    display_name: Fixture CRM
    enabled: true
    adapter: fixture
    fixture_path: demos/fixtures/people.json
  - source_id: crm-disabled
    display_name: Disabled CRM
    enabled: false
    adapter: fixture
"#;
        let registry: SourceRegistry = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(registry.sources.len(), 2);
        assert_eq!(registry.sources[0].object_types, vec!["person"]);
        assert!(!registry.sources[1].enabled);
    }
}
