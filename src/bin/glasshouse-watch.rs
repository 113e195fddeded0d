//! Guest-side per-session watcher entry point. The command line mirrors
//! what the client orchestrator composes and POSTs to `/execute`.

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser};
use tracing::info;

use glasshouse::agent::{WatchArgs, Watcher};
use glasshouse::config::{self, AgentConfig};

/// Per-session application readiness watcher
#[derive(Parser, Debug)]
#[command(name = "glasshouse-watch", version, about = "Per-session application readiness watcher")]
struct Args {
    /// Launch command or protocol URI
    #[arg(long)]
    app: String,

    /// Executable whose process and window mark the application as live
    #[arg(long)]
    mainexe: String,

    /// Keep the application window pinned topmost after foregrounding
    #[arg(long, action = ArgAction::Set, default_value_t = false)]
    always_on_top: bool,

    /// Wait out the anti-cheat pre-launch window before reporting ready
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    wait_for_anti_cheat: bool,

    /// Extra seconds before reporting ready
    #[arg(long, default_value_t = 0.0)]
    delay: f64,

    /// Executables that count as "already running"
    #[arg(long, num_args = 1..)]
    exes: Vec<String>,

    /// Executables killed before launching
    #[arg(long, num_args = 1..)]
    kill_exes: Vec<String>,

    /// Configuration directory (default: `~/.config/glasshouse`)
    #[arg(long)]
    config_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = glasshouse::logging::init();

    let config_dir = args.config_dir.unwrap_or_else(config::default_config_dir);
    let cfg = AgentConfig::load(&config_dir)?;
    info!(app = %args.app, mainexe = %args.mainexe, "watch starting");

    let watch = WatchArgs {
        app: args.app,
        mainexe: args.mainexe,
        always_on_top: args.always_on_top,
        wait_for_anti_cheat: args.wait_for_anti_cheat,
        delay: args.delay,
        exes: args.exes,
        kill_exes: args.kill_exes,
    };
    Watcher::new(cfg, watch).run().await
}
