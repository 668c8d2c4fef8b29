mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use cli::{Cli, Command};
use spectra::anthropic::AnthropicClient;
use spectra::config::SpectraConfig;
use spectra::cors::CorsPolicy;
use spectra::generation::{BoundedGeneration, GenerationSettings};
use spectra::job::ProjectContext;
use spectra::orchestrator::{Dispatch, JobOrchestrator};
use spectra::store::{JobStore, StoreConfig};
use spectra::{server, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SpectraConfig::load()?;

    telemetry::init(config.log_json, cli.verbose);

    let orchestrator = Arc::new(build_orchestrator(&config)?);

    match cli.command {
        Command::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.bind.clone());
            if orchestrator.store().is_networked().await {
                info!("job store: redis");
            } else {
                warn!("job store: in-memory, jobs are lost on restart");
            }
            server::serve(orchestrator, &CorsPolicy::from_config(&config), &bind).await
        }
        Command::Generate { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let context: ProjectContext = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", file.display()))?;

            let output = match orchestrator.dispatch(context).await {
                Dispatch::Template(files) => serde_json::to_string_pretty(&files)?,
                Dispatch::Queued { job_id, .. } => {
                    if let Err(err) = orchestrator.trigger(&job_id).await {
                        warn!(job_id = %job_id, error = %err, "generation failed");
                    }
                    let view = orchestrator.query(&job_id).await?;
                    serde_json::to_string_pretty(&view)?
                }
            };
            println!("{output}");
            Ok(())
        }
    }
}

fn build_orchestrator(config: &SpectraConfig) -> Result<JobOrchestrator> {
    let store = Arc::new(JobStore::new(StoreConfig::from_config(config)));
    let timeout = config.llm_timeout();
    let client = AnthropicClient::new(config.api_key.clone(), timeout)
        .context("failed to build Anthropic client")?;
    let settings = GenerationSettings {
        model: config.model.clone(),
        max_tokens: config.max_tokens,
        timeout,
        ..GenerationSettings::default()
    };
    Ok(JobOrchestrator::new(
        store,
        BoundedGeneration::new(Arc::new(client), settings),
    ))
}
