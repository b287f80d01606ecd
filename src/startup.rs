// Startup module - banner and configuration summary
//
// Printed once before the server starts accepting requests, and mirrored
// into the log stream so headless deployments record the same facts.

use std::path::Path;

use crate::config::{Config, VERSION};

/// ANSI color codes for terminal output
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const CYAN: &str = "\x1b[36m";
    pub const GREEN: &str = "\x1b[32m";
    pub const MAGENTA: &str = "\x1b[35m";
}

/// Print the startup banner and configured model summary
pub fn print_startup(config: &Config, listen: &str, config_path: &Path) {
    use colors::*;

    println!();
    println!("  {BOLD}{CYAN}modelswap{RESET} {DIM}v{VERSION}{RESET}");
    println!("  {DIM}Model-swapping proxy for OpenAI-compatible inference servers{RESET}");
    println!();
    println!("  {DIM}Config:{RESET} {GREEN}✓{RESET} {}", config_path.display());
    println!();

    for model in &config.models {
        let visibility = if model.unlisted { " (unlisted)" } else { "" };
        let ttl = if model.ttl > 0 {
            format!("ttl {}s", model.ttl)
        } else {
            "resident".to_string()
        };
        println!(
            "    {GREEN}✓{RESET} {:<24} {DIM}{}{}{RESET}",
            model.id, ttl, visibility
        );
    }
    let explicit_groups = config
        .groups
        .iter()
        .filter(|g| g.members.len() > 1)
        .count();
    if explicit_groups > 0 {
        println!();
        println!("  {DIM}{} group(s) with swap policy{RESET}", explicit_groups);
    }

    println!();
    println!("  {MAGENTA}▸{RESET} Proxy listening on {BOLD}{}{RESET}", listen);
    println!();
}

/// Mirror the startup facts into the log stream
pub fn log_startup(config: &Config, listen: &str) {
    tracing::info!("modelswap v{}", VERSION);
    tracing::info!(
        "{} model(s), {} group(s) configured",
        config.models.len(),
        config.groups.len()
    );
    tracing::info!("listening on {}", listen);
}
