// modelswap - model-swapping reverse proxy for OpenAI-compatible servers
//
// Clients name a logical model; the proxy launches the matching upstream
// inference process on demand, evicts group peers when resources demand it,
// and streams bytes through unchanged.
//
// Architecture:
// - Config loader: YAML file -> validated immutable snapshot input
// - Manager: snapshot owner, request dispatch, reload orchestration
// - Instance: per-model subprocess state machine with health probing
// - Group: swap/exclusive admission policy over instances
// - Server (axum): OpenAI-compatible + management endpoints, streaming proxy
// - Event bus: broadcast channel connecting all components to /api/events

mod cli;
mod config;
mod error;
mod events;
mod group;
mod instance;
mod logging;
mod logmonitor;
mod manager;
mod ports;
mod server;
mod startup;
mod watcher;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    // Client-mode subcommands talk to a running server and exit
    match args.command {
        Some(cli::Commands::Version) => {
            println!("modelswap {}", config::VERSION);
            return Ok(());
        }
        Some(cli::Commands::Ps) => return cli::handle_ps(&args.listen).await,
        Some(cli::Commands::List) => return cli::handle_list(&args.listen).await,
        Some(cli::Commands::Serve) | None => {}
    }

    // Load configuration before logging init: the file's logLevel feeds the
    // default filter. A broken config gets one self-heal attempt, then the
    // process exits non-zero.
    let parsed = match config::load(&args.config) {
        Ok(parsed) => parsed,
        Err(first_error) => {
            eprintln!("config error in {}: {}", args.config.display(), first_error);
            if config::try_self_heal(&args.config) {
                match config::load(&args.config) {
                    Ok(parsed) => parsed,
                    Err(second_error) => {
                        eprintln!("config still invalid after self-heal: {}", second_error);
                        std::process::exit(1);
                    }
                }
            } else {
                std::process::exit(1);
            }
        }
    };

    let bus = events::EventBus::new();

    // Precedence: RUST_LOG env var > config file > default "info"
    let default_filter = format!(
        "modelswap={},tower_http=debug,axum=debug",
        parsed.settings.log_level
    );
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(logging::BusLogLayer::new(bus.clone()))
        .init();

    startup::print_startup(&parsed, &args.listen, &args.config);
    startup::log_startup(&parsed, &args.listen);

    let manager = manager::Manager::new(parsed, bus);

    // Keep the watcher handle alive for the server's lifetime
    let _watcher = if args.watch_config {
        Some(
            watcher::watch(&args.config, manager.clone())
                .context("Failed to start the config watcher")?,
        )
    } else {
        None
    };

    server::serve(&args.listen, manager, shutdown_signal()).await
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
