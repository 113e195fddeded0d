//! Guest-side agent daemon: serves the guest control plane and keeps the
//! display host alive between sessions. Runs from boot inside the guest.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use glasshouse::config::{self, AgentConfig};
use glasshouse::control::guest::GuestControl;

/// Guest control-plane daemon
#[derive(Parser, Debug)]
#[command(name = "glasshouse-agentd", version, about = "Guest control-plane daemon")]
struct Args {
    /// Configuration directory (default: `~/.config/glasshouse`)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = glasshouse::logging::init();

    let config_dir = args.config_dir.unwrap_or_else(config::default_config_dir);
    let cfg = AgentConfig::load(&config_dir)?;
    info!(port = cfg.port, host = %cfg.host_ip, "agent starting");

    let control = GuestControl::new(cfg);
    control.spawn_display_host_watcher();
    control.serve().await
}
