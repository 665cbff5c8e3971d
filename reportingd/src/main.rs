use clap::{Args, Parser};
use std::path::PathBuf;

mod config;
use config::{Config, MetricsConfig, ReportingConfig};
use metrics_exporter_statsd::StatsdBuilder;
use reporting::{
    FilesystemStore, HttpUploader, PermissiveDelegate, ReportingService, ReportingStore,
};
use std::future::Future;
use std::process;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
enum CliCommand {
    /// Run the reporting daemon until interrupted
    Run(RunArgs),
    /// Show all metrics definitions as markdown table
    ShowMetrics,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("Failed to load config file: {0}")]
    ConfigLoadError(#[from] config::ConfigError),
    #[error("Invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("Failed to create runtime: {0}")]
    RuntimeError(#[from] std::io::Error),
}

fn main() {
    init_tracing();

    if let Err(e) = cli() {
        tracing::error!(error = %e, "Startup error");
        std::process::exit(1);
    }
}

fn cli() -> Result<(), CliError> {
    match CliCommand::parse() {
        CliCommand::Run(args) => {
            let config = Config::from_file(&args.base.config_file_path)?;
            init_statsd_recorder("reportingd", config.common.metrics);

            let reporting_config = config
                .reporting
                .ok_or(CliError::InvalidConfig("Missing reporting config"))?;

            run_async(run(reporting_config))?;
            Ok(())
        }
        CliCommand::ShowMetrics => {
            println!(
                "{}",
                generate_metrics_table(reporting::metrics_defs::ALL_METRICS)
            );
            Ok(())
        }
    }
}

async fn run(config: ReportingConfig) -> Result<(), std::io::Error> {
    let store: Option<Arc<dyn ReportingStore>> = config
        .store_path
        .as_ref()
        .map(|path| Arc::new(FilesystemStore::new(path)) as Arc<dyn ReportingStore>);
    let uploader = Arc::new(HttpUploader::new(config.upload_timeout_secs));

    let service = ReportingService::new(
        config.service,
        uploader,
        store,
        Arc::new(PermissiveDelegate),
    );
    tracing::info!("reporting service started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    service.on_shutdown().await;
    Ok(())
}

fn generate_metrics_table(metrics: &[reporting::metrics_defs::MetricDef]) -> String {
    let mut lines = vec![
        "| Metric | Type | Description |".to_string(),
        "|--------|------|-------------|".to_string(),
    ];
    for m in metrics {
        lines.push(format!(
            "| `{}` | {} | {} |",
            m.name,
            m.metric_type.as_str(),
            m.description
        ));
    }
    lines.join("\n")
}

pub fn init_statsd_recorder(prefix: &str, metrics_config: Option<MetricsConfig>) {
    if let Some(MetricsConfig {
        statsd_host,
        statsd_port,
    }) = metrics_config
    {
        let recorder = StatsdBuilder::from(statsd_host, statsd_port)
            .build(Some(prefix))
            .expect("Could not create StatsdRecorder");

        metrics::set_global_recorder(recorder).expect("Could not set global metrics recorder")
    }
}

fn run_async(
    fut: impl Future<Output = Result<(), impl std::error::Error>>,
) -> Result<(), CliError> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    if let Err(e) = rt.block_on(fut) {
        tracing::error!(error = %e, "Runtime error");
        process::exit(1);
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[derive(Args, Debug, Clone)]
struct BaseArgs {
    #[arg(long)]
    config_file_path: PathBuf,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    base: BaseArgs,
}
