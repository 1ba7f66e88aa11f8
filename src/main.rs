//! report-orchestrator - Worker Entry Point
//!
//! Polls the record store for pending reports and runs each one through the
//! generation workflow, up to the configured number of concurrent runs.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use report_orchestrator::{
    config::Config,
    limiter::GenerationLimiter,
    llm::{AnthropicClient, LlmClient, ModelGateway, OpenAiClient},
    services::{CommandRenderer, CommandTextProvider, LocalObjectStore, SqliteRecordStore},
    skills::SkillRegistry,
    workflow::{run_workflow, run_workflow_with_deadline, WorkflowDeps, WorkflowSettings},
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn build_deps(config: &Config) -> anyhow::Result<WorkflowDeps> {
    let mut clients: Vec<Arc<dyn LlmClient>> = Vec::new();
    if let Some(key) = &config.anthropic_api_key {
        clients.push(Arc::new(AnthropicClient::with_base_url(
            key.clone(),
            config.anthropic_base_url.as_deref(),
            config.llm_timeout,
        )?));
    }
    if let Some(key) = &config.openai_api_key {
        clients.push(Arc::new(OpenAiClient::with_base_url(
            key.clone(),
            config.openai_base_url.as_deref(),
            config.llm_timeout,
        )?));
    }
    let gateway = ModelGateway::new(clients, config.routing.clone(), config.gateway_config());

    tokio::fs::create_dir_all(&config.data_dir).await?;
    let records = SqliteRecordStore::open(config.database_path()).await?;
    let objects = LocalObjectStore::new(&config.data_dir).await?;

    let skills = SkillRegistry::load(config.skills_dir.clone());
    info!(
        "Loaded {} skills from {}",
        skills.list_skills().len(),
        config.skills_dir.display()
    );

    Ok(WorkflowDeps {
        gateway: Arc::new(gateway),
        records: Arc::new(records),
        objects: Arc::new(objects),
        parser: Arc::new(CommandTextProvider::new(config.extract_text_cmd.clone())),
        renderer: Arc::new(CommandRenderer::new(config.render_commands.clone())),
        skills: Arc::new(skills),
        settings: WorkflowSettings::from_config(config),
    })
}

async fn async_main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "report_orchestrator=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        "Loaded configuration: data_dir={}, max_concurrent={}, poll={:?}, timeout={:?}",
        config.data_dir.display(),
        config.max_concurrent_generations,
        config.poll_interval,
        config.workflow_timeout
    );

    let deps = build_deps(&config).await?;
    let limiter = GenerationLimiter::new(config.max_concurrent_generations);
    let mut in_flight: HashSet<Uuid> = HashSet::new();
    let mut running: FuturesUnordered<BoxFuture<'static, (Uuid, Result<(), tokio::task::JoinError>)>> =
        FuturesUnordered::new();
    let mut ticker = tokio::time::interval(config.poll_interval);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Worker started");
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            Some((report_id, result)) = running.next(), if !running.is_empty() => {
                in_flight.remove(&report_id);
                if let Err(e) = result {
                    error!("Report {} | run task panicked: {}", report_id, e);
                }
            }
            _ = ticker.tick() => {
                if limiter.is_full() {
                    continue;
                }
                let pending = match deps.records.list_pending(limiter.max()).await {
                    Ok(pending) => pending,
                    Err(e) => {
                        warn!("Failed to list pending reports: {}", e);
                        continue;
                    }
                };
                for report in pending {
                    if in_flight.contains(&report.report_id) {
                        continue;
                    }
                    // Full: the report stays pending for the next poll.
                    let Some(permit) = limiter.try_permit() else {
                        break;
                    };
                    let report_id = report.report_id;
                    in_flight.insert(report_id);
                    info!(
                        "Report {} | claimed ({}/{} slots)",
                        report_id,
                        limiter.active(),
                        limiter.max()
                    );

                    let deps = deps.clone();
                    let timeout = config.workflow_timeout;
                    let handle = tokio::spawn(async move {
                        let _permit = permit;
                        match timeout {
                            Some(deadline) => {
                                run_workflow_with_deadline(
                                    &deps,
                                    report.report_id,
                                    report.user_id,
                                    report.config,
                                    deadline,
                                )
                                .await
                            }
                            None => run_workflow(&deps, report.report_id, report.user_id, report.config).await,
                        }
                    });
                    running.push(async move { (report_id, handle.await.map(|_| ())) }.boxed());
                }
            }
        }
    }

    if !running.is_empty() {
        info!("Waiting for {} running reports to finish", running.len());
        let finished: Vec<_> = running.collect().await;
        info!("{} reports finished", finished.len());
    }

    Ok(())
}
