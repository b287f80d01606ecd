// CLI module - command-line argument parsing and handlers
//
// `serve` is the default subcommand; `ps` and `list` are thin HTTP clients
// against an already-running server, so operators can check state without
// curl incantations.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::VERSION;

/// Model-swapping proxy for OpenAI-compatible inference servers
#[derive(Parser)]
#[command(name = "modelswap")]
#[command(version = VERSION)]
#[command(about = "Model-swapping proxy for OpenAI-compatible inference servers", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to the YAML config file
    #[arg(long, global = true, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Address to bind the proxy server to
    #[arg(long, global = true, default_value = "127.0.0.1:8080")]
    pub listen: String,

    /// Reload automatically when the config file changes
    #[arg(long, global = true)]
    pub watch_config: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the proxy server (default)
    Serve,
    /// Print version information
    Version,
    /// Show instance states of a running server
    Ps,
    /// Show the models a running server exposes
    List,
}

/// `modelswap ps` - print the /running table of a live server
pub async fn handle_ps(listen: &str) -> Result<()> {
    let url = format!("http://{}/running", listen);
    let rows: Vec<serde_json::Value> = reqwest::get(&url)
        .await
        .with_context(|| format!("is a server running on {}?", listen))?
        .json()
        .await
        .context("unexpected /running payload")?;

    if rows.is_empty() {
        println!("no models configured");
        return Ok(());
    }

    println!(
        "{:<24} {:<10} {:>9}  {}",
        "ID", "STATE", "IN-FLIGHT", "READY SINCE"
    );
    for row in rows {
        println!(
            "{:<24} {:<10} {:>9}  {}",
            row["id"].as_str().unwrap_or("?"),
            row["state"].as_str().unwrap_or("?"),
            row["inFlight"].as_u64().unwrap_or(0),
            row["readyAt"].as_str().unwrap_or("-"),
        );
    }
    Ok(())
}

/// `modelswap list` - print the /v1/models listing of a live server
pub async fn handle_list(listen: &str) -> Result<()> {
    let url = format!("http://{}/v1/models", listen);
    let payload: serde_json::Value = reqwest::get(&url)
        .await
        .with_context(|| format!("is a server running on {}?", listen))?
        .json()
        .await
        .context("unexpected /v1/models payload")?;

    let Some(models) = payload["data"].as_array() else {
        println!("no models");
        return Ok(());
    };
    for model in models {
        println!("{}", model["id"].as_str().unwrap_or("?"));
    }
    Ok(())
}
