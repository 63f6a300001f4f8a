#![cfg_attr(not(test), deny(clippy::panic))]

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use cohort_server::config;
use cohort_server::logging;
use cohort_server::persistence::JsonLinesSink;
use cohort_server::server::ExperimentServer;
use cohort_server::websocket;

/// Cohort Server -- in-memory coordination core for browser-based
/// multi-participant experiments
#[derive(Parser, Debug)]
#[command(name = "cohort-server")]
#[command(about = "A lightweight WebSocket coordination server for multi-participant experiments")]
#[command(version)]
struct Cli {
    /// Validate configuration (including the experiment scene tree) and
    /// exit without starting the server.
    #[arg(long, short = 'c', conflicts_with = "print_config")]
    validate_config: bool,

    /// Print the loaded configuration to stdout (as JSON) and exit.
    #[arg(long, conflicts_with = "validate_config")]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration from config.json / env overrides, else defaults.
    let cfg = config::load();

    if cli.print_config {
        let json = serde_json::to_string_pretty(&cfg)
            .map_err(|e| anyhow::anyhow!("Failed to serialize config: {e}"))?;
        println!("{json}");
        return Ok(());
    }

    let validation_result = cfg.experiment.validate();

    if cli.validate_config {
        match validation_result {
            Ok(()) => {
                println!("Configuration validation passed");
                println!();
                println!("Configuration summary:");
                println!("  Port: {}", cfg.port);
                println!("  Experiment: {}", cfg.experiment.experiment_id);
                println!("  Scenes: {}", cfg.experiment.scenes.len());
                println!(
                    "  Participant cap: {}",
                    cfg.experiment
                        .participant_cap
                        .map_or_else(|| "unlimited".to_string(), |c| c.to_string())
                );
                println!("  Screening required: {}", cfg.experiment.screening.required);
                println!("  Data directory: {}", cfg.server.data_dir);
                return Ok(());
            }
            Err(e) => {
                eprintln!("Configuration validation failed:\n{e}");
                std::process::exit(1);
            }
        }
    }

    // In normal operation, propagate validation errors
    validation_result?;

    logging::init_with_config(&cfg.logging);

    let port: u16 = cfg.port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, experiment = %cfg.experiment.experiment_id, "Starting cohort server");

    let sink = Arc::new(JsonLinesSink::new(cfg.server.data_dir.clone()));
    let server = ExperimentServer::new(cfg.server.clone(), cfg.experiment.clone(), sink)?;

    // Background prune loop and waitroom status heartbeat.
    tokio::spawn(server.clone().maintenance_task());
    tokio::spawn(server.clone().waitroom_status_task());

    let router = websocket::create_router(&cfg.server.cors_origins)
        .with_state(server.clone())
        .fallback(|| async {
            "Cohort Server. Use /ws for the WebSocket protocol, /healthz for liveness."
        });

    // Bind failure is an unrecoverable startup error: non-zero exit.
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        %addr,
        cors_origins = %cfg.server.cors_origins,
        "Server started - WebSocket endpoint: /ws"
    );

    let shutdown_server = server.clone();
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::error!("failed to listen for shutdown signal");
            return;
        }
        tracing::info!("shutdown signal received; draining");
        shutdown_server.shutdown().await;
    })
    .await?;

    Ok(())
}

#[cfg(test)]
mod cli_tests {
    use super::Cli;
    use clap::Parser;

    #[test]
    fn test_cli_default_no_flags() {
        let cli = Cli::try_parse_from(["cohort-server"]).unwrap();
        assert!(!cli.validate_config);
        assert!(!cli.print_config);
    }

    #[test]
    fn test_cli_validate_config_flags() {
        let cli = Cli::try_parse_from(["cohort-server", "--validate-config"]).unwrap();
        assert!(cli.validate_config);
        let cli = Cli::try_parse_from(["cohort-server", "-c"]).unwrap();
        assert!(cli.validate_config);
    }

    #[test]
    fn test_cli_validate_and_print_config_conflict() {
        let result = Cli::try_parse_from(["cohort-server", "--validate-config", "--print-config"]);
        assert!(result.is_err());
    }
}
