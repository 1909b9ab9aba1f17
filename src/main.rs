use aggregatord::config;
use aggregatord::coordinator::RunCoordinator;
use aggregatord::error::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "aggregatord")]
#[command(about = "Result-aggregation core for a cluster conformance harness", long_about = None)]
struct Args {
    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Override the namespace in the loaded configuration
    #[arg(long)]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("aggregatord={log_level}").parse().unwrap()),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => {
            info!("loading configuration from {}", path.display());
            config::load_from_path(path)?
        }
        None => {
            info!("loading configuration from default locations");
            config::load_from_env_or_file()?
        }
    };

    if let Some(namespace) = args.namespace {
        config.namespace = namespace;
    }

    let client = kube::Client::try_default().await.map_err(|e| {
        error!("failed to construct kube client: {e}");
        aggregatord::error::AggregatorError::Kube(e)
    })?;

    info!(
        plugins = config.plugins.len(),
        namespace = %config.namespace,
        "starting aggregator run"
    );

    let coordinator = RunCoordinator::new(config, client);
    match coordinator.run().await {
        Ok(()) => {
            info!("run completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("run ended with error: {e}");
            Err(e)
        }
    }
}
