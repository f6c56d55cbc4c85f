use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use node_rotator::cluster::KubeCluster;
use node_rotator::config::{RotationArgs, RotationConfig};
use node_rotator::rotation::{
    EventRecorder, KubeEventRecorder, NoopRecorder, Orchestrator, RunSummary,
};
use node_rotator::Error;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Rotate the managed node pool
    Run(RunArgs),
    /// Print the rotation plan without changing the cluster
    Plan(PlanArgs),
    /// Show version and build information
    Version,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Yaml,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    rotation: RotationArgs,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Write Prometheus metrics to this file when the run ends
    #[arg(long, env = "METRICS_FILE")]
    metrics_file: Option<PathBuf>,

    /// Also print the run summary to stdout in this format
    #[arg(long, value_enum)]
    summary_format: Option<OutputFormat>,
}

#[derive(Parser, Debug)]
struct PlanArgs {
    #[command(flatten)]
    rotation: RotationArgs,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    #[arg(long, short, value_enum, default_value = "yaml")]
    output: OutputFormat,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let code = match args.command {
        Commands::Version => {
            println!("node-rotator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            0
        }
        Commands::Plan(plan_args) => {
            init_tracing(plan_args.log_format);
            match run_plan(plan_args).await {
                Ok(()) => 0,
                Err(e) => {
                    tracing::error!("Plan failed: {}", e);
                    2
                }
            }
        }
        Commands::Run(run_args) => {
            init_tracing(run_args.log_format);
            match run_rotation(run_args).await {
                Ok(summary) => summary.exit_code(),
                Err(e) => {
                    tracing::error!("Rotation could not start: {}", e);
                    2
                }
            }
        }
    };
    std::process::exit(code);
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
    }
}

fn render<T: serde::Serialize>(value: &T, format: OutputFormat) -> Result<String, Error> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => serde_yaml::to_string(value)
            .map_err(|e| Error::ConfigError(format!("failed to render YAML: {e}"))),
    }
}

async fn run_plan(args: PlanArgs) -> Result<(), Error> {
    let config = RotationConfig::try_from(args.rotation)?;
    let cluster = KubeCluster::connect().await?;
    info!("Connected to Kubernetes cluster");

    let plan = Orchestrator::new(&cluster, &NoopRecorder, config)
        .plan()
        .await?;
    print!("{}", render(&plan, args.output)?);
    Ok(())
}

async fn run_rotation(args: RunArgs) -> Result<RunSummary, Error> {
    let config = RotationConfig::try_from(args.rotation)?;
    info!("Starting node-rotator v{}", env!("CARGO_PKG_VERSION"));

    if !config.startup_sleep.is_zero() {
        info!("Sleeping {}s before starting", config.startup_sleep.as_secs());
        tokio::time::sleep(config.startup_sleep).await;
    }

    let cluster = KubeCluster::connect().await?;
    info!("Connected to Kubernetes cluster");

    let recorder: Box<dyn EventRecorder> = if config.emit_events {
        Box::new(KubeEventRecorder::new(
            cluster.client().clone(),
            config.event_namespace.clone(),
        ))
    } else {
        Box::new(NoopRecorder)
    };

    let summary = Orchestrator::new(&cluster, &*recorder, config)
        .run()
        .await;
    summary.log();

    if let Some(format) = args.summary_format {
        println!("{}", render(&summary, format)?);
    }

    #[cfg(feature = "metrics")]
    if let Some(path) = &args.metrics_file {
        node_rotator::rotation::metrics::write_textfile(path)?;
        info!("Metrics written to {}", path.display());
    }
    #[cfg(not(feature = "metrics"))]
    if args.metrics_file.is_some() {
        tracing::warn!("Built without the metrics feature; --metrics-file ignored");
    }

    Ok(summary)
}
