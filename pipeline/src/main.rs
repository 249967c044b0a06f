mod classify;
mod config;
mod delivery;
mod error;
mod launcher;
mod mail;
mod monitor;
mod normalizer;
mod ocr;
mod phases;
mod prompt;
mod status;
mod store;
mod util;

use std::collections::HashMap;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::PipelineConfig;
use delivery::api::HttpDocumentsApi;
use delivery::merger::{format_plan, Merger};
use delivery::Deliverer;
use error::{PipelineError, PipelineResult};
use monitor::ResourceMonitor;
use normalizer::Normalizer;
use phases::phase2::EscalationLadder;
use phases::{WorkerCtx, PhaseStats};
use prompt::ChatCompletionsBackend;
use store::scan::{enumerate_inputs, InputItem};
use store::WorkStore;

/// Grace window for finishing the current item after SIGTERM.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "mailsift")]
#[command(about = "Distributed email archive extraction pipeline")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Start the configured instances of a phase on this machine.
    Launch { phase: u8, machine: String },
    /// Run one worker instance over an index range (spawned by launch).
    Worker {
        phase: u8,
        #[arg(long)]
        machine: String,
        #[arg(long)]
        instance: usize,
        #[arg(long)]
        start: usize,
        #[arg(long)]
        end: usize,
    },
    /// Per-phase completed/failed/deferred counts and running instances.
    Status,
    /// Stop running instances; SIGTERM first, SIGKILL after the grace window.
    Stop { machine: Option<String> },
    /// Print resource monitor output.
    Monitor,
    /// Run delivery (phase 5) over all artifacts.
    Deliver,
    /// Manual review of phase-3 failures (phase 4).
    Review,
    /// Merge duplicate correspondents on the delivery service.
    MergeCorrespondents {
        /// Execute the plan instead of printing it.
        #[arg(long)]
        apply: bool,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::Layer::default().with_ansi(false))
        .init();

    let cli = Cli::parse();
    let code = match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(command: CliCommand) -> PipelineResult<i32> {
    let cfg = PipelineConfig::load()?;
    match command {
        CliCommand::Launch { phase, machine } => launcher::launch(&cfg, phase, &machine).await,
        CliCommand::Worker {
            phase,
            machine,
            instance,
            start,
            end,
        } => run_worker(&cfg, phase, &machine, instance, start, end).await,
        CliCommand::Status => status::print_status(&cfg),
        CliCommand::Stop { machine } => launcher::stop(&cfg, machine.as_deref()).await,
        CliCommand::Monitor => run_monitor(&cfg).await,
        CliCommand::Deliver => run_delivery(&cfg).await,
        CliCommand::Review => run_review(&cfg).await,
        CliCommand::MergeCorrespondents { apply } => run_merger(&cfg, apply).await,
    }
}

/// Cancel on SIGTERM/ctrl-c; force-exit when the grace window passes.
fn install_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let terminate = async {
            #[cfg(unix)]
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
            #[cfg(not(unix))]
            std::future::pending::<()>().await;
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate => {}
        }
        tracing::info!("shutdown requested, finishing current item");
        shutdown.cancel();
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        tracing::warn!("grace window elapsed, exiting");
        std::process::exit(3);
    });
}

fn worker_ctx(cfg: &PipelineConfig, machine: &str, instance: usize) -> PipelineResult<WorkerCtx> {
    let store = WorkStore::new(&cfg.store.output_root);
    store.ensure_layout()?;
    let shutdown = CancellationToken::new();
    install_signal_handler(shutdown.clone());
    let throttle = ResourceMonitor::spawn(cfg.monitor.clone(), shutdown.clone());
    Ok(WorkerCtx {
        store,
        machine: machine.to_string(),
        instance,
        host: util::host_name(),
        stale_lock_ttl: Duration::from_secs(cfg.store.stale_lock_ttl_secs),
        throttle,
        shutdown,
    })
}

fn item_index(cfg: &PipelineConfig) -> PipelineResult<HashMap<String, InputItem>> {
    Ok(enumerate_inputs(&cfg.store.input_root)?
        .into_iter()
        .map(|item| (item.item_id.clone(), item))
        .collect())
}

fn finish(ctx: &WorkerCtx, stats: &PhaseStats) -> i32 {
    if ctx.shutdown.is_cancelled() {
        3
    } else {
        stats.exit_code()
    }
}

async fn run_worker(
    cfg: &PipelineConfig,
    phase: u8,
    machine: &str,
    instance: usize,
    start: usize,
    end: usize,
) -> PipelineResult<i32> {
    let mut ctx = worker_ctx(cfg, machine, instance)?;
    let http = reqwest::Client::new();

    let stats = match phase {
        1 => {
            let items = enumerate_inputs(&cfg.store.input_root)?;
            let slice = clamp_range(&items, start, end);
            let worker = phases::phase1::Phase1Worker::new(
                ocr::OcrClient::new(http, &cfg.ocr),
                classify::Classifier::new(&cfg.rules),
            );
            worker.run(&mut ctx, slice).await?
        }
        2 => {
            let records = ctx.store.read_failures(1)?;
            let slice = clamp_range(&records, start, end);
            let index = item_index(cfg)?;
            let backend = ChatCompletionsBackend::new(http, cfg.inference.endpoint.clone(), None);
            let worker = phases::phase2::Phase2Worker::new(
                backend,
                EscalationLadder::from_config(&cfg.inference),
            );
            worker
                .run(&mut ctx, slice, &|id: &str| index.get(id).cloned())
                .await?
        }
        3 => {
            let records = ctx.store.read_failures(2)?;
            let slice = clamp_range(&records, start, end);
            let index = item_index(cfg)?;
            let backend = ChatCompletionsBackend::new(
                http,
                cfg.external.endpoint.clone(),
                cfg.external.api_key.clone(),
            );
            let worker = phases::phase3::Phase3Worker::new(backend, &cfg.external);
            worker
                .run(&mut ctx, slice, &|id: &str| index.get(id).cloned())
                .await?
        }
        4 => {
            let records = ctx.store.read_failures(3)?;
            let slice = clamp_range(&records, start, end);
            let index = item_index(cfg)?;
            let session = phases::phase4::ReviewSession::default();
            session
                .run(&mut ctx, slice, &|id: &str| index.get(id).cloned())
                .await?
        }
        other => {
            return Err(PipelineError::Config(format!(
                "phase {other} has no worker"
            )));
        }
    };

    Ok(finish(&ctx, &stats))
}

fn clamp_range<T>(items: &[T], start: usize, end: usize) -> &[T] {
    let start = start.min(items.len());
    let end = end.min(items.len()).max(start);
    &items[start..end]
}

async fn run_review(cfg: &PipelineConfig) -> PipelineResult<i32> {
    let mut ctx = worker_ctx(cfg, "review", 0)?;
    let records = ctx.store.read_failures(3)?;
    let index = item_index(cfg)?;
    let session = phases::phase4::ReviewSession::default();
    let stats = session
        .run(&mut ctx, &records, &|id: &str| index.get(id).cloned())
        .await?;
    Ok(finish(&ctx, &stats))
}

async fn run_delivery(cfg: &PipelineConfig) -> PipelineResult<i32> {
    let token = cfg.delivery.token.as_deref().ok_or_else(|| {
        PipelineError::Config("delivery token missing (MAILSIFT_DELIVERY_TOKEN)".to_string())
    })?;
    let store = WorkStore::new(&cfg.store.output_root);
    store.ensure_layout()?;
    let artifacts = store.all_artifacts()?;
    let index = item_index(cfg)?;
    let normalizer = Normalizer::new(load_known_mappings(cfg)?);
    let api = HttpDocumentsApi::new(reqwest::Client::new(), &cfg.delivery.url, token);

    let deliverer = Deliverer::new(&api, &store, &normalizer, &cfg.delivery);
    let stats = deliverer
        .deliver_all(&artifacts, &|id: &str| index.get(id).cloned())
        .await?;

    println!(
        "delivered {} | duplicates {} | patched {} | failed {}",
        stats.delivered, stats.duplicates, stats.patched, stats.failed
    );
    Ok(if stats.failed > 0 { 2 } else { 0 })
}

async fn run_merger(cfg: &PipelineConfig, apply: bool) -> PipelineResult<i32> {
    let token = cfg.delivery.token.as_deref().ok_or_else(|| {
        PipelineError::Config("delivery token missing (MAILSIFT_DELIVERY_TOKEN)".to_string())
    })?;
    let normalizer = Normalizer::new(load_known_mappings(cfg)?);
    let api = HttpDocumentsApi::new(reqwest::Client::new(), &cfg.delivery.url, token);
    let merger = Merger::new(&api, &normalizer);

    let plan = merger
        .plan()
        .await
        .map_err(|e| anyhow::anyhow!("merge planning failed: {e}"))?;
    println!("{}", format_plan(&plan));

    if apply {
        let report = merger
            .apply(&plan)
            .await
            .map_err(|e| anyhow::anyhow!("merge failed: {e}"))?;
        println!(
            "merged {} groups, moved {} documents, deleted {} correspondents",
            report.groups_merged, report.documents_moved, report.correspondents_deleted
        );
    } else {
        println!("dry run; pass --apply to execute");
    }
    Ok(0)
}

async fn run_monitor(cfg: &PipelineConfig) -> PipelineResult<i32> {
    let shutdown = CancellationToken::new();
    install_signal_handler(shutdown.clone());
    let mut rx = ResourceMonitor::spawn(cfg.monitor.clone(), shutdown.clone());

    while !shutdown.is_cancelled() {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = rx.changed() => {
                if result.is_err() {
                    break;
                }
                println!("{}", monitor::format_snapshot(&rx.borrow()));
            }
        }
    }
    Ok(0)
}

fn load_known_mappings(cfg: &PipelineConfig) -> PipelineResult<HashMap<String, String>> {
    let Some(path) = &cfg.correspondents.known_mappings else {
        return Ok(HashMap::new());
    };
    let mappings = ::config::Config::builder()
        .add_source(::config::File::from(path.clone()))
        .build()?
        .try_deserialize::<HashMap<String, String>>()?;
    Ok(mappings)
}
