//! Webhook subscription planning, inbound signature verification, and the
//! call/message activity enrichment pipeline.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use cdx_adapters::SourceAdapter;
use cdx_core::{
    ActivityDirection, ActivityKind, ActivityLog, EnrichmentRecord, WebhookSubscription,
};
use cdx_store::{
    CallDetails, CreateWebhookRequest, DirectoryApi, DirectoryPhoneNumber, DirectoryUser,
    EnrichmentStore, MediaLink, UpdateWebhookRequest, VoicemailLink, WebhookEndpoint,
    WebhookEventKind,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "cdx-webhooks";

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Subscription planner
// ---------------------------------------------------------------------------

pub const DELETE_REASON_CHUNK_NO_LONGER_NEEDED: &str = "chunk_no_longer_needed";

/// Group resource ids into ordered, capacity-bounded chunks for the planner.
pub fn chunk_phone_ids(ids: &[String], capacity: usize) -> Vec<Vec<String>> {
    ids.chunks(capacity.max(1)).map(<[String]>::to_vec).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedCreate {
    pub chunk_index: usize,
    pub phone_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedUpdate {
    pub webhook_id: String,
    pub webhook_key: String,
    pub chunk_index: usize,
    pub phone_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedDelete {
    pub webhook_id: String,
    pub chunk_index: usize,
    pub reason: String,
}

/// Minimal mutation set reconciling required chunks against registered
/// subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WebhookPlan {
    pub create: Vec<PlannedCreate>,
    pub update: Vec<PlannedUpdate>,
    pub delete: Vec<PlannedDelete>,
    pub keep: Vec<WebhookSubscription>,
}

impl WebhookPlan {
    pub fn is_noop(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

fn same_membership(a: &[String], b: &[String]) -> bool {
    a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
}

/// By chunk index: unoccupied slot → create; identical membership → keep;
/// changed membership → update, preserving webhook identity; any existing
/// subscription with no corresponding required chunk → delete.
pub fn plan_subscriptions(
    required_chunks: &[Vec<String>],
    existing: &[WebhookSubscription],
) -> WebhookPlan {
    let mut plan = WebhookPlan::default();
    let mut by_index: HashMap<usize, &WebhookSubscription> = HashMap::new();

    for subscription in existing {
        if subscription.chunk_index < required_chunks.len()
            && !by_index.contains_key(&subscription.chunk_index)
        {
            by_index.insert(subscription.chunk_index, subscription);
        } else {
            plan.delete.push(PlannedDelete {
                webhook_id: subscription.webhook_id.clone(),
                chunk_index: subscription.chunk_index,
                reason: DELETE_REASON_CHUNK_NO_LONGER_NEEDED.to_string(),
            });
        }
    }

    for (chunk_index, phone_ids) in required_chunks.iter().enumerate() {
        match by_index.get(&chunk_index) {
            None => plan.create.push(PlannedCreate {
                chunk_index,
                phone_ids: phone_ids.clone(),
            }),
            Some(subscription) if same_membership(&subscription.phone_ids, phone_ids) => {
                plan.keep.push((*subscription).clone());
            }
            Some(subscription) => plan.update.push(PlannedUpdate {
                webhook_id: subscription.webhook_id.clone(),
                webhook_key: subscription.webhook_key.clone(),
                chunk_index,
                phone_ids: phone_ids.clone(),
            }),
        }
    }

    plan
}

pub fn chunk_label(chunk_index: usize) -> String {
    format!("cdx-chunk-{chunk_index}")
}

pub fn chunk_index_from_label(label: &str) -> Option<usize> {
    label.strip_prefix("cdx-chunk-")?.parse().ok()
}

/// Interpret a registered endpoint as a planner subscription; endpoints
/// without a chunk label belong to someone else and are ignored.
pub fn subscription_from_endpoint(endpoint: &WebhookEndpoint) -> Option<WebhookSubscription> {
    let chunk_index = chunk_index_from_label(endpoint.label.as_deref()?)?;
    Some(WebhookSubscription {
        webhook_id: endpoint.id.clone(),
        webhook_key: endpoint.key.clone(),
        phone_ids: endpoint.resource_ids.clone(),
        chunk_index,
    })
}

/// Per-chunk failure while applying a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkError {
    pub webhook_id: Option<String>,
    pub chunk_index: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    pub success_count: usize,
    pub error_count: usize,
    pub errors: Vec<ChunkError>,
}

impl ApplyOutcome {
    fn success(&mut self) {
        self.success_count += 1;
    }

    fn failure(&mut self, webhook_id: Option<String>, chunk_index: usize, error: String) {
        self.error_count += 1;
        self.errors.push(ChunkError {
            webhook_id,
            chunk_index,
            error,
        });
    }
}

/// Reconciles the required phone-id chunks against the directory's
/// registered webhooks. Mutations run sequentially; each targets a distinct
/// webhook identity, and one chunk's failure never aborts its siblings.
pub struct SubscriptionReconciler {
    directory: Arc<dyn DirectoryApi>,
    receipt_url: String,
    events: Vec<WebhookEventKind>,
}

impl SubscriptionReconciler {
    pub fn new(
        directory: Arc<dyn DirectoryApi>,
        receipt_url: impl Into<String>,
        events: Vec<WebhookEventKind>,
    ) -> Self {
        Self {
            directory,
            receipt_url: receipt_url.into(),
            events,
        }
    }

    /// Plan against the directory's current registrations and apply.
    pub async fn reconcile(
        &self,
        required_chunks: &[Vec<String>],
    ) -> Result<(WebhookPlan, ApplyOutcome)> {
        let endpoints = self.directory.list_webhooks().await?;
        let existing: Vec<WebhookSubscription> = endpoints
            .iter()
            .filter_map(subscription_from_endpoint)
            .collect();
        let plan = plan_subscriptions(required_chunks, &existing);
        info!(
            create = plan.create.len(),
            update = plan.update.len(),
            delete = plan.delete.len(),
            keep = plan.keep.len(),
            "webhook subscription plan computed"
        );
        let outcome = self.apply(&plan).await;
        Ok((plan, outcome))
    }

    pub async fn apply(&self, plan: &WebhookPlan) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();

        for create in &plan.create {
            let request = CreateWebhookRequest {
                url: self.receipt_url.clone(),
                events: self.events.clone(),
                resource_ids: create.phone_ids.clone(),
                label: chunk_label(create.chunk_index),
            };
            match self.directory.create_webhook(&request).await {
                Ok(_) => outcome.success(),
                Err(err) => outcome.failure(None, create.chunk_index, err.to_string()),
            }
        }

        for update in &plan.update {
            let request = UpdateWebhookRequest {
                resource_ids: update.phone_ids.clone(),
            };
            match self
                .directory
                .update_webhook(&update.webhook_id, &request)
                .await
            {
                Ok(_) => outcome.success(),
                Err(err) => outcome.failure(
                    Some(update.webhook_id.clone()),
                    update.chunk_index,
                    err.to_string(),
                ),
            }
        }

        for delete in &plan.delete {
            match self.directory.delete_webhook(&delete.webhook_id).await {
                Ok(_) => outcome.success(),
                Err(err) => outcome.failure(
                    Some(delete.webhook_id.clone()),
                    delete.chunk_index,
                    err.to_string(),
                ),
            }
        }

        outcome
    }
}

// ---------------------------------------------------------------------------
// Signature verification
// ---------------------------------------------------------------------------

fn hmac_bytes(secret: &str, parts: &[&[u8]]) -> Vec<u8> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.ct_eq(b).into()
}

/// Candidates of a different length than the expected digest are rejected
/// before the constant-time comparator runs.
fn digests_match(candidate: &str, expected: &str) -> bool {
    if candidate.len() != expected.len() {
        return false;
    }
    constant_time_eq(candidate.as_bytes(), expected.as_bytes())
}

/// Hex HMAC-SHA256 over the raw request body, compared against the header.
/// Absent header or secret rejects before any comparison.
pub fn verify_simple_signature(secret: Option<&str>, header: Option<&str>, body: &[u8]) -> bool {
    let (Some(secret), Some(header)) = (secret, header) else {
        return false;
    };
    if secret.is_empty() || header.is_empty() {
        return false;
    }
    let expected = hex::encode(hmac_bytes(secret, &[body]));
    digests_match(header, &expected)
}

/// Structured scheme: `algo;version;timestamp;signature` header fields with
/// a base64 signature over `timestamp + body`.
pub fn verify_structured_signature(
    secret: Option<&str>,
    header: Option<&str>,
    body: &[u8],
) -> bool {
    let (Some(secret), Some(header)) = (secret, header) else {
        return false;
    };
    if secret.is_empty() {
        return false;
    }
    let fields: Vec<&str> = header.split(';').collect();
    let [algo, _version, timestamp, signature] = fields.as_slice() else {
        return false;
    };
    if *algo != "hmac" || timestamp.is_empty() || signature.is_empty() {
        return false;
    }
    let expected = BASE64.encode(hmac_bytes(secret, &[timestamp.as_bytes(), body]));
    digests_match(signature, &expected)
}

/// Sign a payload in the structured scheme; used by tests and local tooling
/// to produce valid headers.
pub fn structured_signature_header(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let signature = BASE64.encode(hmac_bytes(secret, &[timestamp.as_bytes(), body]));
    format!("hmac;1;{timestamp};{signature}")
}

pub fn simple_signature_header(secret: &str, body: &[u8]) -> String {
    hex::encode(hmac_bytes(secret, &[body]))
}

// ---------------------------------------------------------------------------
// Activity enrichment pipeline
// ---------------------------------------------------------------------------

/// A call or message that just completed (phase 1 input).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityCompletedEvent {
    pub activity_id: String,
    pub kind: ActivityKind,
    pub direction: ActivityDirection,
    pub counterparty_number: String,
    pub participants: Vec<String>,
    pub duration_seconds: Option<u32>,
    pub occurred_at: DateTime<Utc>,
}

/// A delayed call summary becoming available (phase 2/3 input).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSummaryEvent {
    pub activity_id: String,
    pub summary: Vec<String>,
    pub next_steps: Vec<String>,
}

/// Phase-1 outcome; an unknown counterparty is a low-severity result, not
/// an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutcome {
    Logged { log_id: String },
    NoMatchingContact,
}

/// Phase-3 outcome; a summary for an activity that was never logged is a
/// low-severity result, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichOutcome {
    Enriched { log_id: String },
    NotLogged,
}

/// Three-phase state machine: log the minimal facts as soon as an activity
/// completes, then replace the log with an enriched version once the
/// delayed summary arrives. The original entry is never lost: on the
/// note-only path the replacement is created before the old entry is
/// deleted, and a failed delete is swallowed because the new entry already
/// exists.
pub struct EnrichmentPipeline {
    source: Arc<dyn SourceAdapter>,
    directory: Arc<dyn DirectoryApi>,
    store: Arc<dyn EnrichmentStore>,
}

impl EnrichmentPipeline {
    pub fn new(
        source: Arc<dyn SourceAdapter>,
        directory: Arc<dyn DirectoryApi>,
        store: Arc<dyn EnrichmentStore>,
    ) -> Self {
        Self {
            source,
            directory,
            store,
        }
    }

    /// Phase 1: resolve the counterparty by phone number, create a basic
    /// log entry in the source system, and persist the enrichment record.
    pub async fn log_completed_activity(
        &self,
        event: &ActivityCompletedEvent,
    ) -> Result<LogOutcome> {
        let Some(person) = self
            .source
            .find_person_by_phone(&event.counterparty_number)
            .await?
        else {
            info!(activity_id = %event.activity_id, "no contact matches counterparty number");
            return Ok(LogOutcome::NoMatchingContact);
        };

        let log = ActivityLog {
            kind: event.kind,
            direction: event.direction,
            contact_id: person.id.clone(),
            contact_type: person.contact_type.clone(),
            duration_seconds: event.duration_seconds,
            participants: event.participants.clone(),
            occurred_at: event.occurred_at,
            body: basic_body(event),
        };
        let log_id = self.source.log_activity(&log).await?;
        self.store
            .put(EnrichmentRecord {
                activity_id: event.activity_id.clone(),
                log_id: log_id.clone(),
                contact_id: person.id,
                contact_type: person.contact_type,
            })
            .await?;
        Ok(LogOutcome::Logged { log_id })
    }

    /// Phases 2+3: fetch the full call details, recordings, and voicemails,
    /// then replace the basic log entry with the enriched version.
    ///
    /// Re-applies idempotently on duplicate summary delivery: the stored
    /// enrichment record is re-read each time, so a second pass replaces
    /// the previous enriched entry, never the long-gone original.
    pub async fn apply_call_summary(&self, event: &CallSummaryEvent) -> Result<EnrichOutcome> {
        let Some(record) = self.store.get(&event.activity_id).await? else {
            info!(activity_id = %event.activity_id, "summary arrived for an unlogged activity");
            return Ok(EnrichOutcome::NotLogged);
        };

        let call = self.directory.get_call(&event.activity_id).await?;
        let recordings = self.directory.get_call_recordings(&event.activity_id).await?;
        let voicemails = self.directory.get_call_voicemails(&event.activity_id).await?;
        let phone_number = match &call.phone_number_id {
            Some(id) => Some(self.directory.get_phone_number(id).await?),
            None => None,
        };
        let user = match &call.user_id {
            Some(id) => Some(self.directory.get_user(id).await?),
            None => None,
        };

        let log = ActivityLog {
            kind: ActivityKind::Call,
            direction: parse_direction(&call.direction),
            contact_id: record.contact_id.clone(),
            contact_type: record.contact_type.clone(),
            duration_seconds: call.duration_seconds,
            participants: call.participants.clone(),
            occurred_at: call.completed_at.unwrap_or_else(Utc::now),
            body: enriched_body(
                event,
                &call,
                phone_number.as_ref(),
                user.as_ref(),
                &recordings,
                &voicemails,
            ),
        };

        if self.source.supports_update_in_place() {
            self.source.update_activity(&record.log_id, &log).await?;
            return Ok(EnrichOutcome::Enriched {
                log_id: record.log_id,
            });
        }

        // note-only path: the replacement must exist before the old entry
        // goes away; a create failure leaves the original untouched
        let new_log_id = self.source.log_activity(&log).await?;
        self.store
            .put(EnrichmentRecord {
                log_id: new_log_id.clone(),
                ..record.clone()
            })
            .await?;
        if let Err(err) = self.source.delete_activity(&record.log_id).await {
            warn!(
                activity_id = %event.activity_id,
                log_id = %record.log_id,
                error = %err,
                "failed to delete superseded activity log"
            );
        }
        Ok(EnrichOutcome::Enriched { log_id: new_log_id })
    }
}

fn parse_direction(raw: &str) -> ActivityDirection {
    if raw.eq_ignore_ascii_case("outgoing") {
        ActivityDirection::Outgoing
    } else {
        ActivityDirection::Incoming
    }
}

fn describe_duration(seconds: Option<u32>) -> String {
    match seconds {
        Some(s) if s >= 60 => format!("{}m {}s", s / 60, s % 60),
        Some(s) => format!("{s}s"),
        None => "unknown duration".to_string(),
    }
}

fn basic_body(event: &ActivityCompletedEvent) -> String {
    let kind = match event.kind {
        ActivityKind::Call => "call",
        ActivityKind::Message => "message",
    };
    let direction = match event.direction {
        ActivityDirection::Incoming => "Incoming",
        ActivityDirection::Outgoing => "Outgoing",
    };
    match event.kind {
        ActivityKind::Call => format!(
            "{direction} {kind} ({}) with {}",
            describe_duration(event.duration_seconds),
            event.counterparty_number
        ),
        ActivityKind::Message => {
            format!("{direction} {kind} with {}", event.counterparty_number)
        }
    }
}

fn enriched_body(
    event: &CallSummaryEvent,
    call: &CallDetails,
    phone_number: Option<&DirectoryPhoneNumber>,
    user: Option<&DirectoryUser>,
    recordings: &[MediaLink],
    voicemails: &[VoicemailLink],
) -> String {
    let mut lines = vec![format!(
        "Call ({}), {}",
        describe_duration(call.duration_seconds),
        call.direction
    )];

    if let Some(phone_number) = phone_number {
        let name = phone_number.name.as_deref().unwrap_or(&phone_number.number);
        lines.push(format!("Line: {name}"));
    }
    if let Some(name) = user.and_then(|u| u.name.as_deref()) {
        lines.push(format!("Handled by: {name}"));
    }

    if !event.summary.is_empty() {
        lines.push("Summary:".to_string());
        for bullet in &event.summary {
            lines.push(format!("- {bullet}"));
        }
    }
    if !event.next_steps.is_empty() {
        lines.push("Next steps:".to_string());
        for step in &event.next_steps {
            lines.push(format!("- {step}"));
        }
    }
    for recording in recordings {
        lines.push(format!("Recording: {}", recording.url));
    }
    for voicemail in voicemails {
        lines.push(format!("Voicemail: {}", voicemail.url));
        if let Some(transcript) = &voicemail.transcript {
            lines.push(format!("Transcript: {transcript}"));
        }
    }
    lines.join("\n")
}
