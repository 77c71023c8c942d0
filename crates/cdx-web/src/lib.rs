//! Axum webhook receipt endpoints. Signatures are checked up front, events
//! are queued for asynchronous processing, and the acknowledgement returns
//! before processing completes.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use cdx_adapters::{adapter_for_config, SourceAdapter};
use cdx_core::{ActivityDirection, ActivityKind};
use cdx_store::{DirectoryApi, FileStateStore};
use cdx_sync::{
    load_source_registry, PersonChangeEvent, SyncConfig, SyncOptions, SyncOrchestrator,
};
use cdx_webhooks::{
    verify_simple_signature, verify_structured_signature, ActivityCompletedEvent,
    CallSummaryEvent, EnrichmentPipeline,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "cdx-web";

pub const SOURCE_SIGNATURE_HEADER: &str = "x-cdx-signature";
pub const DIRECTORY_SIGNATURE_HEADER: &str = "x-directory-signature";

/// Where an inbound event came from, which decides the signature scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    Source,
    Directory,
}

/// A signature-verified raw event awaiting asynchronous processing.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub origin: EventOrigin,
    pub body: Vec<u8>,
}

#[derive(Clone)]
pub struct AppState {
    pub source_secret: Option<String>,
    pub directory_secret: Option<String>,
    pub events: mpsc::Sender<InboundEvent>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/hooks/source", post(source_hook_handler))
        .route("/hooks/directory", post(directory_hook_handler))
        .with_state(Arc::new(state))
}

async fn source_hook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = header_value(&headers, SOURCE_SIGNATURE_HEADER);
    if !verify_simple_signature(state.source_secret.as_deref(), signature.as_deref(), &body) {
        return signature_required();
    }
    accept_event(&state, EventOrigin::Source, &body)
}

async fn directory_hook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = header_value(&headers, DIRECTORY_SIGNATURE_HEADER);
    if !verify_structured_signature(
        state.directory_secret.as_deref(),
        signature.as_deref(),
        &body,
    ) {
        return signature_required();
    }
    accept_event(&state, EventOrigin::Directory, &body)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn signature_required() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": "Signature required" })),
    )
        .into_response()
}

fn accept_event(state: &AppState, origin: EventOrigin, body: &[u8]) -> Response {
    if is_handshake(body) {
        return Json(serde_json::json!({ "received": true, "handshake": true })).into_response();
    }

    // acknowledgement happens before processing; the worker drains the queue
    if let Err(err) = state.events.try_send(InboundEvent {
        origin,
        body: body.to_vec(),
    }) {
        warn!(error = %err, "inbound event queue rejected an event");
    }
    Json(serde_json::json!({ "received": true })).into_response()
}

fn is_handshake(body: &[u8]) -> bool {
    serde_json::from_slice::<JsonValue>(body)
        .ok()
        .and_then(|value| value.get("type").and_then(|t| t.as_str()).map(String::from))
        .is_some_and(|kind| kind == "handshake")
}

// ---------------------------------------------------------------------------
// Event dispatch
// ---------------------------------------------------------------------------

/// A parsed inbound event, ready for the enrichment pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundCommand {
    LogActivity(ActivityCompletedEvent),
    ApplySummary(CallSummaryEvent),
    Ignore,
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: JsonValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallPayload {
    id: String,
    direction: Option<String>,
    from: Option<String>,
    to: Option<String>,
    #[serde(default)]
    participants: Vec<String>,
    duration_seconds: Option<u32>,
    completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryPayload {
    call_id: String,
    #[serde(default)]
    summary: Vec<String>,
    #[serde(default)]
    next_steps: Vec<String>,
}

/// Map a raw event body onto a pipeline command. Unknown event types and
/// malformed payloads are ignored, not errors: the provider may ship event
/// kinds this engine does not handle.
pub fn parse_inbound_event(body: &[u8]) -> InboundCommand {
    let Ok(envelope) = serde_json::from_slice::<EventEnvelope>(body) else {
        return InboundCommand::Ignore;
    };
    match envelope.kind.as_str() {
        "call.completed" => {
            let Ok(payload) = serde_json::from_value::<CallPayload>(envelope.data) else {
                return InboundCommand::Ignore;
            };
            let direction = parse_direction(payload.direction.as_deref());
            let counterparty = match direction {
                ActivityDirection::Incoming => payload.from,
                ActivityDirection::Outgoing => payload.to,
            };
            let Some(counterparty_number) = counterparty else {
                return InboundCommand::Ignore;
            };
            InboundCommand::LogActivity(ActivityCompletedEvent {
                activity_id: payload.id,
                kind: ActivityKind::Call,
                direction,
                counterparty_number,
                participants: payload.participants,
                duration_seconds: payload.duration_seconds,
                occurred_at: payload.completed_at.unwrap_or_else(Utc::now),
            })
        }
        "message.received" => {
            let Ok(payload) = serde_json::from_value::<CallPayload>(envelope.data) else {
                return InboundCommand::Ignore;
            };
            let Some(counterparty_number) = payload.from else {
                return InboundCommand::Ignore;
            };
            InboundCommand::LogActivity(ActivityCompletedEvent {
                activity_id: payload.id,
                kind: ActivityKind::Message,
                direction: ActivityDirection::Incoming,
                counterparty_number,
                participants: payload.participants,
                duration_seconds: None,
                occurred_at: payload.completed_at.unwrap_or_else(Utc::now),
            })
        }
        "call.summary.completed" => {
            let Ok(payload) = serde_json::from_value::<SummaryPayload>(envelope.data) else {
                return InboundCommand::Ignore;
            };
            InboundCommand::ApplySummary(CallSummaryEvent {
                activity_id: payload.call_id,
                summary: payload.summary,
                next_steps: payload.next_steps,
            })
        }
        _ => InboundCommand::Ignore,
    }
}

fn parse_direction(raw: Option<&str>) -> ActivityDirection {
    match raw {
        Some(value) if value.eq_ignore_ascii_case("outgoing") => ActivityDirection::Outgoing,
        _ => ActivityDirection::Incoming,
    }
}

/// A parsed source-system webhook event.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceCommand {
    Change(PersonChangeEvent),
    Ignore,
}

/// Map a raw source-system event body onto a person change. The source
/// sends its record inline for creates/updates and only the id for deletes.
pub fn parse_source_event(body: &[u8]) -> SourceCommand {
    let Ok(envelope) = serde_json::from_slice::<EventEnvelope>(body) else {
        return SourceCommand::Ignore;
    };
    match envelope.kind.as_str() {
        "person.created" | "person.updated" => {
            if envelope.data.get("id").and_then(|v| v.as_str()).is_none() {
                return SourceCommand::Ignore;
            }
            SourceCommand::Change(PersonChangeEvent::Upserted(envelope.data))
        }
        "person.deleted" => match envelope.data.get("id").and_then(|v| v.as_str()) {
            Some(external_id) => SourceCommand::Change(PersonChangeEvent::Deleted {
                external_id: external_id.to_string(),
            }),
            None => SourceCommand::Ignore,
        },
        _ => SourceCommand::Ignore,
    }
}

/// Drain the inbound queue: directory events feed the enrichment pipeline,
/// source events feed the orchestrator's webhook upsert path. One event's
/// failure is logged and never stops the worker.
pub fn spawn_event_worker(
    mut events: mpsc::Receiver<InboundEvent>,
    pipeline: Arc<EnrichmentPipeline>,
    orchestrator: Option<Arc<SyncOrchestrator>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event.origin {
                EventOrigin::Source => {
                    let Some(orchestrator) = &orchestrator else {
                        continue;
                    };
                    let SourceCommand::Change(change) = parse_source_event(&event.body) else {
                        continue;
                    };
                    match orchestrator.apply_person_change(&change).await {
                        Ok(report) if report.error_count > 0 => {
                            warn!(errors = report.error_count, "source change partially failed");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "source change failed"),
                    }
                }
                EventOrigin::Directory => match parse_inbound_event(&event.body) {
                    InboundCommand::LogActivity(activity) => {
                        if let Err(err) = pipeline.log_completed_activity(&activity).await {
                            warn!(activity_id = %activity.activity_id, error = %err, "activity logging failed");
                        }
                    }
                    InboundCommand::ApplySummary(summary) => {
                        if let Err(err) = pipeline.apply_call_summary(&summary).await {
                            warn!(activity_id = %summary.activity_id, error = %err, "summary enrichment failed");
                        }
                    }
                    InboundCommand::Ignore => {}
                },
            }
        }
    })
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub source_signing_secret: Option<String>,
    pub directory_signing_secret: Option<String>,
    pub event_queue_depth: usize,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("CDX_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            source_signing_secret: std::env::var("CDX_SOURCE_SIGNING_SECRET").ok(),
            directory_signing_secret: std::env::var("CDX_DIRECTORY_SIGNING_SECRET").ok(),
            event_queue_depth: std::env::var("CDX_EVENT_QUEUE_DEPTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1024),
        }
    }
}

/// Wire the receipt endpoints and the event worker from env configuration
/// and serve until shutdown.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let web_config = WebConfig::from_env();
    let sync_config = SyncConfig::from_env();

    let registry = load_source_registry(&sync_config.workspace_root).await?;
    let source = registry
        .sources
        .into_iter()
        .find(|s| s.enabled)
        .ok_or_else(|| anyhow::anyhow!("no enabled source in sources.yaml"))?;
    let adapter_config = source.adapter_config(&sync_config.workspace_root);
    let adapter: Arc<dyn SourceAdapter> = Arc::from(
        adapter_for_config(&adapter_config)?
            .ok_or_else(|| anyhow::anyhow!("no adapter registered for {}", source.source_id))?,
    );

    let store = Arc::new(FileStateStore::new(sync_config.state_dir.clone()));
    let directory: Arc<dyn DirectoryApi> = Arc::new(sync_config.directory_client()?);
    let pipeline = Arc::new(EnrichmentPipeline::new(
        adapter.clone(),
        directory.clone(),
        store.clone(),
    ));
    let orchestrator = Arc::new(SyncOrchestrator::new(
        adapter,
        directory,
        store.clone(),
        store,
        SyncOptions {
            page_limit: sync_config.page_limit,
            settle_delay: sync_config.settle_delay(),
            ..SyncOptions::default()
        },
    ));

    let (events_tx, events_rx) = mpsc::channel(web_config.event_queue_depth);
    let worker = spawn_event_worker(events_rx, pipeline, Some(orchestrator));

    let state = AppState {
        source_secret: web_config.source_signing_secret.clone(),
        directory_secret: web_config.directory_signing_secret.clone(),
        events: events_tx,
    };
    let listener = TcpListener::bind(("0.0.0.0", web_config.port)).await?;
    info!(port = web_config.port, "webhook receipt endpoints listening");
    axum::serve(listener, app(state)).await?;

    worker.abort();
    Ok(())
}
