use std::sync::Arc;

use anyhow::Result;
use cdx_store::{DirectoryApi, WebhookEventKind};
use cdx_sync::{build_orchestrators_from_env, maybe_build_scheduler, SyncConfig};
use cdx_webhooks::{
    chunk_phone_ids, plan_subscriptions, subscription_from_endpoint, SubscriptionReconciler,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cdx-cli")]
#[command(about = "CDX command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync every enabled source into the directory
    Sync {
        /// Incremental sync of records modified in the last N hours
        /// (defaults to a full resync through the bulk path)
        #[arg(long)]
        since_hours: Option<i64>,
    },
    /// Reconcile webhook subscriptions against the directory
    PlanWebhooks {
        /// Apply the computed plan instead of only printing it
        #[arg(long)]
        apply: bool,
    },
    /// Serve the webhook receipt endpoints
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { since_hours: None }) {
        Commands::Sync { since_hours } => {
            let summaries = match since_hours {
                Some(hours) => {
                    let since = Utc::now() - chrono::Duration::hours(hours);
                    cdx_sync::run_incremental_sync_from_env(since).await?
                }
                None => cdx_sync::run_full_sync_from_env().await?,
            };
            for summary in summaries {
                println!(
                    "sync complete: source={} run_id={} pages={} records={} ok={} errors={}",
                    summary.source_id,
                    summary.run_id,
                    summary.pages_fetched,
                    summary.records_seen,
                    summary.report.success_count,
                    summary.report.error_count
                );
            }
        }
        Commands::PlanWebhooks { apply } => {
            let config = SyncConfig::from_env();
            let directory: Arc<dyn DirectoryApi> = Arc::new(config.directory_client()?);
            let phone_ids: Vec<String> = directory
                .list_phone_numbers()
                .await?
                .into_iter()
                .map(|p| p.id)
                .collect();
            let required = chunk_phone_ids(&phone_ids, config.webhook_capacity);

            if apply {
                let reconciler = SubscriptionReconciler::new(
                    directory,
                    &config.webhook_receipt_url,
                    vec![
                        WebhookEventKind::Message,
                        WebhookEventKind::Call,
                        WebhookEventKind::CallSummary,
                    ],
                );
                let (plan, outcome) = reconciler.reconcile(&required).await?;
                println!("{}", serde_json::to_string_pretty(&plan)?);
                println!(
                    "applied: ok={} errors={}",
                    outcome.success_count, outcome.error_count
                );
            } else {
                let existing: Vec<_> = directory
                    .list_webhooks()
                    .await?
                    .iter()
                    .filter_map(subscription_from_endpoint)
                    .collect();
                let plan = plan_subscriptions(&required, &existing);
                println!("{}", serde_json::to_string_pretty(&plan)?);
            }
        }
        Commands::Serve => {
            let config = SyncConfig::from_env();
            let _scheduler = if config.scheduler_enabled {
                let orchestrators = build_orchestrators_from_env(&config).await?;
                let scheduler = maybe_build_scheduler(&config, orchestrators).await?;
                if let Some(scheduler) = &scheduler {
                    scheduler.start().await?;
                }
                scheduler
            } else {
                None
            };
            cdx_web::serve_from_env().await?;
        }
    }

    Ok(())
}
