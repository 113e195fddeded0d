//! Configuration loading for both sides of a session.
//!
//! Everything is plain JSON on disk, resolved relative to a config directory
//! (default `~/.config/glasshouse/`):
//!
//! - `apps/<name>.json` — one [`AppDescriptor`] per launchable application;
//! - `glasshouse.json` — [`LauncherConfig`] on the client,
//!   [`AgentConfig`] inside the guest (same filename, different shape);
//! - `gpu-vms.json` — [`GpuGroup`], the machines competing for the GPU.
//!
//! A missing or malformed file is a configuration error: fatal at startup,
//! before any side effect.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::DEFAULT_CONTROL_PORT;

// ---------------------------------------------------------------------------
// Per-application descriptor
// ---------------------------------------------------------------------------

/// One launchable application, as declared in `apps/<name>.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppDescriptor {
    /// Display name, also used as the remote-display window title.
    pub name: String,

    /// Splash image filename. Consumed by the external splash window, not
    /// by the orchestrator itself.
    #[serde(default)]
    pub splash: Option<String>,

    /// Accent colour for the splash window (`#rrggbb`).
    #[serde(default)]
    pub colour: Option<String>,

    /// Name of the target virtual machine hosting the application.
    pub vm: String,

    /// Launch command inside the guest. May be a plain command line or a
    /// `steam://` / `com.epicgames.launcher://` URI.
    pub command: String,

    /// Executable whose process and window mark the application as live.
    pub mainexe: String,

    /// Keep the application window pinned topmost after foregrounding.
    #[serde(default)]
    pub alwaysontop: bool,

    /// Wait out the anti-cheat pre-launch window (fixed 320x240 splash)
    /// before signalling readiness.
    #[serde(default = "default_true")]
    pub waitforeac: bool,

    /// Executables that count as "the application is already running".
    #[serde(default)]
    pub exes: Vec<String>,

    /// Executables killed inside the guest before launching.
    #[serde(default)]
    pub killexes: Vec<String>,

    /// USB device name fragments to pass through (case-insensitive
    /// substring match against the physical device listing).
    #[serde(default)]
    pub usb_devices: Vec<String>,

    /// Extra delay in seconds before the guest sends `/ready`.
    #[serde(default)]
    pub delay: f64,
}

fn default_true() -> bool {
    true
}

impl AppDescriptor {
    /// Load `apps/<app>.json` under `config_dir`.
    pub fn load(config_dir: &Path, app: &str) -> Result<Self> {
        let path = config_dir.join("apps").join(format!("{app}.json"));
        if !path.exists() {
            bail!("app descriptor not found: {}", path.display());
        }
        read_json(&path)
    }
}

/// Collect the `mainexe` of every descriptor in `apps/` except `current`.
///
/// Appended to the kill list so that launching one application tears down
/// whichever other one was still running in the guest.
pub fn foreign_mainexes(config_dir: &Path, current: &str) -> Result<Vec<String>> {
    let apps_dir = config_dir.join("apps");
    let mut exes = Vec::new();
    let entries = std::fs::read_dir(&apps_dir)
        .with_context(|| format!("failed to read apps dir {}", apps_dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if path.file_stem().and_then(|s| s.to_str()) == Some(current) {
            continue;
        }
        // A broken foreign descriptor should not block this session.
        match read_json::<AppDescriptor>(&path) {
            Ok(desc) => exes.push(desc.mainexe),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable app descriptor"),
        }
    }
    exes.sort();
    Ok(exes)
}

// ---------------------------------------------------------------------------
// Client-side launcher configuration
// ---------------------------------------------------------------------------

/// `glasshouse.json` on the client host.
#[derive(Debug, Clone, Deserialize)]
pub struct LauncherConfig {
    /// Port the client control plane listens on (guest calls back here).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path to the remote-display client binary.
    pub display_client_path: String,

    /// Spice port the display client connects to.
    pub display_client_port: u16,

    /// Extra arguments appended to the display client command line.
    #[serde(default)]
    pub display_client_args: Vec<String>,

    /// Environment variables set for the display client process
    /// (e.g. `GDK_BACKEND`).
    #[serde(default)]
    pub display_client_env: HashMap<String, String>,

    /// Optional command run on the client after the display client exits.
    #[serde(default)]
    pub post_session_command: Option<String>,

    /// Command sent to a sibling machine's `/execute` to hibernate it.
    #[serde(default = "default_hibernate_command")]
    pub hibernate_command: String,
}

fn default_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_hibernate_command() -> String {
    "shutdown /h".to_string()
}

impl LauncherConfig {
    pub fn load(config_dir: &Path) -> Result<Self> {
        read_json(&config_dir.join("glasshouse.json"))
    }
}

// ---------------------------------------------------------------------------
// GPU-sharing group
// ---------------------------------------------------------------------------

/// `gpu-vms.json`: the machines sharing the passthrough GPU. Running
/// members other than the target are hibernated before the target boots.
#[derive(Debug, Clone, Deserialize)]
pub struct GpuGroup {
    pub vms: Vec<String>,
}

impl GpuGroup {
    pub fn load(config_dir: &Path) -> Result<Self> {
        read_json(&config_dir.join("gpu-vms.json"))
    }

    pub fn contains(&self, vm: &str) -> bool {
        self.vms.iter().any(|v| v == vm)
    }
}

// ---------------------------------------------------------------------------
// Guest-side agent configuration
// ---------------------------------------------------------------------------

/// `glasshouse.json` inside the guest, shared by the agent daemon and the
/// per-session watcher.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Port the guest control plane listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address of the client's control plane (for `/ready` and `/terminate`).
    pub host_ip: String,
    #[serde(default = "default_port")]
    pub host_port: u16,

    /// Seconds without a keepalive before the watchdog hibernates the guest.
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout: f64,

    /// Path to the in-guest display host binary.
    pub display_host_path: String,

    /// Processes whose windows are minimised before launch.
    #[serde(default)]
    pub minimise_processes: Vec<String>,

    /// Command used to hibernate this machine when the client disappears.
    #[serde(default = "default_hibernate_command")]
    pub hibernate_command: String,

    /// Image name of the per-session watcher process. This is the
    /// "supervisor" killed by `/cancel`, `/stop` and `/disconnected`.
    #[serde(default = "default_watcher_exe")]
    pub watcher_exe: String,
}

fn default_keepalive_timeout() -> f64 {
    60.0
}

fn default_watcher_exe() -> String {
    "glasshouse-watch.exe".to_string()
}

impl AgentConfig {
    pub fn load(config_dir: &Path) -> Result<Self> {
        read_json(&config_dir.join("glasshouse.json"))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Default config directory: `$XDG_CONFIG_HOME/glasshouse` or
/// `~/.config/glasshouse`.
pub fn default_config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("glasshouse");
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join("glasshouse")
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
