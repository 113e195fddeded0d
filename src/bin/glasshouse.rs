//! Client-side entry point: launch one session for one application.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use glasshouse::config::{self, AppDescriptor, GpuGroup, LauncherConfig};
use glasshouse::process;
use glasshouse::progress::{ChannelProgress, ProgressEvent};
use glasshouse::session::SessionOrchestrator;

/// On-demand GPU VM session launcher
#[derive(Parser, Debug)]
#[command(name = "glasshouse", version, about = "On-demand GPU VM session launcher")]
struct Args {
    /// Application to launch: the name of a descriptor under `apps/`
    /// (without the `.json` extension)
    #[arg(short, long)]
    app: String,

    /// Configuration directory (default: `~/.config/glasshouse`)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_guard = glasshouse::logging::init();

    // One session at a time: a stale instance would still hold the
    // control-plane port.
    process::kill_stale_instances(&own_image_name()).await;

    let config_dir = args.config_dir.unwrap_or_else(config::default_config_dir);
    let desc = AppDescriptor::load(&config_dir, &args.app)?;
    let cfg = LauncherConfig::load(&config_dir)?;
    let group = GpuGroup::load(&config_dir)?;
    info!(app = %desc.name, vm = %desc.vm, "starting session");

    // Phase labels go to stdout for whatever splash wrapper is driving us.
    let (progress, mut rx) = ChannelProgress::new();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ProgressEvent::Phase(label) => println!("{label}"),
                ProgressEvent::SessionLive => println!("SESSION LIVE"),
            }
        }
    });

    let orchestrator =
        SessionOrchestrator::new(args.app, desc, cfg, group, config_dir, progress);
    let code = orchestrator.run().await?;

    drop(log_guard);
    std::process::exit(code);
}

fn own_image_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "glasshouse".to_string())
}
