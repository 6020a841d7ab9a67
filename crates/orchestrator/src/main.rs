//! Thin CLI front door for local/manual exercising of the orchestration
//! core. The real HTTP surface is out of scope; this binary exists so the
//! core can be driven without one, grounded on the platform monitor CLI's
//! `clap::Parser`/`Subcommand` shape.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Settings;
use container_runtime::BollardRuntime;
use kv_store::RedisStore;
use llm_client::{HttpCveFeedClient, HttpLlmClient};
use orchestrator::OrchestratorCore;
use scan_core::{JobId, TemplateSelector, TriggerKind};
use tracing::info;

#[derive(Parser)]
#[command(name = "scan-orchestrator")]
#[command(about = "Automated vulnerability-scan orchestration core")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a scan against the shipped template corpus.
    Scan {
        #[arg(long)]
        target: String,

        /// Template directories to restrict the run to (omit for the full corpus).
        #[arg(long, value_delimiter = ',')]
        templates: Vec<String>,
    },
    /// Print a job's current state.
    Status {
        #[arg(long)]
        job_id: JobId,
    },
    /// Request cancellation of a running or queued job.
    Cancel {
        #[arg(long)]
        job_id: JobId,
    },
    /// Kick off a synthesis pipeline run.
    Trigger {
        #[arg(long)]
        filters: Option<String>,
    },
}

fn init_tracing(settings: &Settings) {
    let filter = tracing_subscriber::EnvFilter::new(settings.log_filter.clone());
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if settings.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.settings);
    cli.settings.validate().context("invalid settings")?;

    let runtime = Arc::new(BollardRuntime::connect(&cli.settings.container_runtime_endpoint).context("connecting to container runtime")?);
    let kv = Arc::new(RedisStore::connect(&cli.settings.kv_url).await.context("connecting to key-value store")?);
    let llm = Arc::new(HttpLlmClient::new(cli.settings.llm_endpoint.clone(), cli.settings.llm_api_key.clone(), cli.settings.llm_model.clone()));
    let cve_feed = Arc::new(HttpCveFeedClient::new(cli.settings.cve_feed_endpoint.clone()));

    let core = OrchestratorCore::new(runtime, kv, llm, cve_feed, &cli.settings);
    let recovered = core.recover_lost_jobs().await.context("recovering jobs abandoned by dead workers")?;
    if recovered > 0 {
        info!(recovered, "recovered jobs orphaned by a dead worker");
    }

    match cli.command {
        Commands::Scan { target, templates } => {
            let selector = if templates.is_empty() { TemplateSelector::All } else { TemplateSelector::Dirs(templates) };
            let (job_id, container_name) = core.submit_scan(target, selector).await?;
            println!("job_id={job_id} container_name={container_name}");
        }
        Commands::Status { job_id } => {
            let job = core.get_job(job_id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Cancel { job_id } => {
            core.cancel_job(job_id).await?;
            println!("cancelled job_id={job_id}");
        }
        Commands::Trigger { filters } => {
            let run_id = core.trigger_pipeline(TriggerKind::Manual, filters).await?;
            println!("run_id={run_id}");
        }
    }

    Ok(())
}
