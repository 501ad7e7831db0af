use clap::{Parser, Subcommand};
use enrichment::config::Credentials;
use enrichment::errors::{EnrichmentError, PipelineError};
use enrichment::lookup::LookupKey;
use metrics_exporter_statsd::StatsdBuilder;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod config;

use config::{Config, ConfigError, LoggingConfig, MetricsConfig};

#[derive(Parser)]
#[command(name = "locus", about = "Geodata enrichment service")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve the lookup endpoint over HTTP
    Serve {
        #[arg(long, default_value = "locus.yaml")]
        config: PathBuf,
    },
    /// Run a single lookup and print the response envelope
    Lookup {
        #[arg(long, default_value = "locus.yaml")]
        config: PathBuf,
        #[arg(long)]
        address_id: String,
        #[arg(long)]
        object_id: String,
        #[arg(long)]
        area: String,
    },
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Enrichment(#[from] EnrichmentError),
    #[error(transparent)]
    Lookup(#[from] PipelineError),
    #[error("could not install metrics recorder: {0}")]
    Metrics(String),
    #[error("could not serialize response: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli.command) {
        eprintln!("locus: {e}");
        std::process::exit(1);
    }
}

fn run(command: CliCommand) -> Result<(), CliError> {
    let config_path = match &command {
        CliCommand::Serve { config } | CliCommand::Lookup { config, .. } => config.clone(),
    };
    let config = load_config(&config_path)?;
    let _sentry = init_logging(config.logging.as_ref());
    if let Some(metrics) = &config.metrics {
        init_metrics(metrics)?;
    }

    let credentials = Credentials::from_env(&config.enrichment.pipeline)
        .map_err(EnrichmentError::from)?;
    let runtime = tokio::runtime::Runtime::new()?;

    match command {
        CliCommand::Serve { .. } => {
            runtime.block_on(enrichment::run(config.enrichment, credentials))?;
        }
        CliCommand::Lookup {
            address_id,
            object_id,
            area,
            ..
        } => {
            let key = LookupKey::new(
                Some(address_id.as_str()),
                Some(object_id.as_str()),
                Some(area.as_str()),
            )?;
            let pipeline = enrichment::build_pipeline(&config.enrichment, credentials)?;
            let envelope = runtime.block_on(pipeline.run(&key))?;
            println!("{}", serde_json::to_string(&envelope)?);
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<Config, CliError> {
    let config = Config::from_file(path)?;
    config
        .enrichment
        .validate()
        .map_err(EnrichmentError::from)?;
    Ok(config)
}

fn init_logging(logging: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let guard = logging.map(|l| {
        sentry::init((
            l.sentry_dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

fn init_metrics(metrics: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(metrics.statsd_host.as_str(), metrics.statsd_port)
        .build(Some("locus"))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;
    shared::metrics_defs::describe_all(enrichment::metrics_defs::ALL_METRICS);

    tracing::info!(
        host = %metrics.statsd_host,
        port = metrics.statsd_port,
        "Reporting metrics to statsd"
    );
    Ok(())
}
