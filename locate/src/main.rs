mod config;

use clap::{Parser, Subcommand};
use config::{CommonConfig, Config, ConfigError};
use location::{LocationError, ServiceLocationResolver};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

#[derive(Parser)]
#[command(about = "Find where services live in a deployment")]
struct Cli {
    #[arg(long, short, default_value = "locate.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Base URL of the server hosting an area
    Url {
        area_id: Uuid,
        #[arg(long)]
        access_mapping: Option<String>,
    },
    /// Base URL of the provider that serves an area
    Resolve { area_id: Uuid },
    /// A single service definition of the connected server
    Definition { service_type: String, identifier: Uuid },
    /// All service definitions, optionally of one type
    Definitions {
        #[arg(long)]
        service_type: Option<String>,
    },
    /// The connected server's access mappings
    AccessMappings,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid sentry DSN: {0}")]
    SentryDsn(#[from] sentry::types::ParseDsnError),
    #[error("could not set up statsd exporter: {0}")]
    Statsd(#[from] metrics_exporter_statsd::StatsdError),
    #[error("a metrics recorder is already installed")]
    RecorderInstalled,
    #[error(transparent)]
    Location(#[from] LocationError),
    #[error("could not serialize output: {0}")]
    Output(#[from] serde_json::Error),
}

fn init_sentry(common: &CommonConfig) -> Result<Option<sentry::ClientInitGuard>, CliError> {
    let Some(logging) = &common.logging else {
        return Ok(None);
    };

    let dsn: sentry::types::Dsn = logging.sentry_dsn.parse()?;
    Ok(Some(sentry::init(sentry::ClientOptions {
        dsn: Some(dsn),
        release: sentry::release_name!(),
        ..Default::default()
    })))
}

fn init_logging(sentry_enabled: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let sentry_layer = sentry_enabled.then(|| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(sentry_layer)
        .init();
}

fn init_metrics(common: &CommonConfig) -> Result<(), CliError> {
    let Some(metrics) = &common.metrics else {
        return Ok(());
    };

    let recorder = metrics_exporter_statsd::StatsdBuilder::from(metrics.statsd_host.clone(), metrics.statsd_port)
        .build(Some("locate"))?;
    metrics::set_global_recorder(recorder).map_err(|_| CliError::RecorderInstalled)?;

    tracing::info!(host = %metrics.statsd_host, port = metrics.statsd_port, "Sending metrics to statsd");
    Ok(())
}

async fn run(command: CliCommand, resolver: &ServiceLocationResolver, cancel: &CancellationToken) -> Result<(), CliError> {
    match command {
        CliCommand::Url {
            area_id,
            access_mapping,
        } => match resolver.service_url(area_id, access_mapping.as_deref(), cancel).await? {
            Some(url) => println!("{url}"),
            None => tracing::warn!(%area_id, "No server hosts this area"),
        },
        CliCommand::Resolve { area_id } => match resolver.resolve_provider(area_id, cancel).await? {
            Some(provider) => println!("{}", provider.base_url()),
            None => tracing::warn!(%area_id, "No server hosts this area"),
        },
        CliCommand::Definition {
            service_type,
            identifier,
        } => match resolver.find_service_definition(&service_type, identifier, cancel).await? {
            Some(definition) => println!("{}", serde_json::to_string_pretty(&definition)?),
            None => tracing::warn!(%service_type, %identifier, "Service definition not found"),
        },
        CliCommand::Definitions { service_type } => {
            let definitions = resolver
                .find_service_definitions(service_type.as_deref(), cancel)
                .await?
                .unwrap_or_default();
            println!("{}", serde_json::to_string_pretty(&definitions)?);
        }
        CliCommand::AccessMappings => {
            let mappings = resolver.access_mappings(cancel).await?;
            println!("{}", serde_json::to_string_pretty(&mappings)?);
        }
    }

    Ok(())
}

async fn execute(cli: Cli) -> Result<(), CliError> {
    let config = Config::from_file(&cli.config)?;
    let sentry_guard = init_sentry(&config.common)?;
    init_logging(sentry_guard.is_some());
    init_metrics(&config.common)?;

    let resolver = ServiceLocationResolver::from_config(&config.location)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    run(cli.command, &resolver, &cancel).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_url_command() {
        let area = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "locate",
            "--config",
            "/etc/locate.yaml",
            "url",
            &area.to_string(),
            "--access-mapping",
            "ServerAccessMapping",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("/etc/locate.yaml"));
        match cli.command {
            CliCommand::Url {
                area_id,
                access_mapping,
            } => {
                assert_eq!(area_id, area);
                assert_eq!(access_mapping.as_deref(), Some("ServerAccessMapping"));
            }
            _ => panic!("expected url command"),
        }
    }

    #[test]
    fn rejects_bad_area_id() {
        assert!(Cli::try_parse_from(["locate", "resolve", "not-a-guid"]).is_err());
    }
}
