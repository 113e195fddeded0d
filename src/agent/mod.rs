//! In-guest readiness watcher.
//!
//! One watcher process per session, started by the agent daemon's
//! `/execute`. It launches the application, waits for its window to become
//! genuinely interactive (including waiting out the anti-cheat pre-launch
//! splash), reports readiness to the client, then tracks liveness until the
//! application exits and tells the client to tear the session down.
//!
//! Window-manager and process-table APIs in the guest are slow and
//! occasionally lie for a poll or two, so every wait here is a bounded
//! polling loop rather than an event subscription.

pub mod phase;
pub mod window;

use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::httpc::{self, RetryPolicy};
use crate::process;
use phase::{ReadinessMachine, WatchEvent};
use statig::prelude::*;

/// Process/window appearance polls: 100 iterations at one second.
const APPEAR_ITERATIONS: u32 = 100;
const APPEAR_INTERVAL: Duration = Duration::from_secs(1);

/// Liveness poll once the session is live.
const LIVENESS_INTERVAL: Duration = Duration::from_millis(200);

/// Keepalive ping cadence to the local agent daemon.
const KEEPALIVE_EVERY: Duration = Duration::from_secs(5);

/// Settle time between the window appearing and foregrounding it.
const SETTLE: Duration = Duration::from_millis(100);

/// Grace between the application exiting and telling the client.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Arguments passed by the orchestrator through the composed command line.
#[derive(Debug, Clone)]
pub struct WatchArgs {
    /// Launch command or protocol URI.
    pub app: String,
    /// Executable whose process and window mark the application as live.
    pub mainexe: String,
    pub always_on_top: bool,
    pub wait_for_anti_cheat: bool,
    /// Extra seconds before `/ready`.
    pub delay: f64,
    /// Executables that count as "already running" (skip the launch).
    pub exes: Vec<String>,
    /// Executables killed before launching.
    pub kill_exes: Vec<String>,
}

/// How the launch command is handed to the shell. Protocol URIs need the
/// shell's `start` to route them through the registered handler.
pub fn launch_invocation(command: &str) -> String {
    if command.starts_with("steam://") || command.starts_with("com.epicgames.launcher://") {
        format!("start {command}")
    } else {
        command.to_string()
    }
}

pub struct Watcher {
    cfg: AgentConfig,
    args: WatchArgs,
    client: reqwest::Client,
}

impl Watcher {
    pub fn new(cfg: AgentConfig, args: WatchArgs) -> Self {
        Self {
            cfg,
            args,
            client: httpc::control_client(Duration::from_secs(10)),
        }
    }

    fn client_url(&self, endpoint: &str) -> String {
        format!("http://{}:{}{endpoint}", self.cfg.host_ip, self.cfg.host_port)
    }

    fn local_url(&self, endpoint: &str) -> String {
        format!("http://127.0.0.1:{}{endpoint}", self.cfg.port)
    }

    /// Run one session watch end to end.
    pub async fn run(&self) -> Result<()> {
        self.prepare().await?;

        let mut sm = ReadinessMachine {
            wait_for_anti_cheat: self.args.wait_for_anti_cheat,
        }
        .state_machine();

        self.await_process(&mut sm).await?;
        self.await_window(&mut sm).await?;

        // Ready path: let the window settle, honour the configured delay,
        // then pull the session to the front and tell the client.
        tokio::time::sleep(SETTLE).await;
        if self.args.delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(self.args.delay)).await;
        }
        let pids = process::pids_of(&self.args.mainexe).await;
        window::bring_to_foreground(&pids, self.args.always_on_top);
        self.signal_ready().await?;
        sm.handle(&WatchEvent::ReadySignalled);

        self.monitor(&mut sm).await;
        self.signal_terminate().await;
        Ok(())
    }

    /// Pre-watch setup: clear the display host and competing processes,
    /// launch the application, restart the display host at priority.
    async fn prepare(&self) -> Result<()> {
        let display_host = image_name(&self.cfg.display_host_path);
        process::kill_by_name(&display_host).await;

        if process::any_running(&self.args.exes).await {
            info!(app = %self.args.app, "application already running, skipping launch");
        } else {
            let invocation = launch_invocation(&self.args.app);
            info!(command = %invocation, "launching application");
            // Dispatched twice: the protocol handler occasionally swallows
            // the first request after a fresh boot.
            process::spawn_detached(&invocation)?;
            process::spawn_detached(&invocation)?;
        }

        for exe in &self.args.kill_exes {
            process::kill_by_name(exe).await;
        }

        window::minimise_windows(&self.cfg.minimise_processes);

        process::start_display_host(&self.cfg.display_host_path)
            .context("failed to start display host")?;
        Ok(())
    }

    async fn await_process(&self, sm: &mut StateMachine<ReadinessMachine>) -> Result<()> {
        for _ in 0..APPEAR_ITERATIONS {
            if process::is_running(&self.args.mainexe).await {
                sm.handle(&WatchEvent::ProcessRunning);
                return Ok(());
            }
            tokio::time::sleep(APPEAR_INTERVAL).await;
        }
        bail!(
            "timeout: {} did not appear within {APPEAR_ITERATIONS}s",
            self.args.mainexe
        )
    }

    /// Wait for a window owned by the target process, then wait out the
    /// anti-cheat splash if the machine entered that phase. Only windows
    /// owned by the target's pids drive the machine; whatever else holds
    /// the foreground is irrelevant. The splash wait has no iteration
    /// bound: it releases when the real window replaces it or the process
    /// goes away.
    async fn await_window(&self, sm: &mut StateMachine<ReadinessMachine>) -> Result<()> {
        for _ in 0..APPEAR_ITERATIONS {
            self.observe_target_window(sm).await;
            if !sm.state().is_awaiting_window() {
                break;
            }
            tokio::time::sleep(APPEAR_INTERVAL).await;
        }
        if sm.state().is_awaiting_window() {
            bail!(
                "timeout: no window for {} within {APPEAR_ITERATIONS}s",
                self.args.mainexe
            );
        }

        while sm.state().is_awaiting_anti_cheat() {
            tokio::time::sleep(APPEAR_INTERVAL).await;
            self.observe_target_window(sm).await;
        }
        Ok(())
    }

    /// One poll: dispatch the target's frontmost window, or its
    /// disappearance, into the machine.
    async fn observe_target_window(&self, sm: &mut StateMachine<ReadinessMachine>) {
        let pids = process::pids_of(&self.args.mainexe).await;
        if pids.is_empty() {
            sm.handle(&WatchEvent::ProcessGone);
            return;
        }
        if let Some(win) = window::main_window(&pids) {
            sm.handle(&WatchEvent::Window {
                width: win.width,
                height: win.height,
            });
        }
    }

    /// Tell the client the session is interactive. Retried; exhaustion is
    /// fatal because an unreachable client means nobody is watching.
    async fn signal_ready(&self) -> Result<()> {
        let url = self.client_url("/ready");
        httpc::get_retrying(&self.client, &url, &RetryPolicy::default())
            .await
            .context("failed to report readiness")?;
        info!("readiness reported");
        Ok(())
    }

    /// Track liveness until the application exits, feeding the local
    /// keepalive so the agent daemon knows a session is in progress.
    async fn monitor(&self, sm: &mut StateMachine<ReadinessMachine>) {
        let live_exes: &[String] = if self.args.exes.is_empty() {
            std::slice::from_ref(&self.args.mainexe)
        } else {
            &self.args.exes
        };
        let keepalive_url = self.local_url("/keepalive");
        let mut last_ping = Instant::now() - KEEPALIVE_EVERY;

        loop {
            if !process::any_running(live_exes).await {
                sm.handle(&WatchEvent::TargetExited);
                return;
            }
            if last_ping.elapsed() >= KEEPALIVE_EVERY {
                last_ping = Instant::now();
                if let Err(e) =
                    httpc::get_retrying(&self.client, &keepalive_url, &RetryPolicy::none()).await
                {
                    warn!(error = %e, "keepalive ping failed");
                }
            }
            tokio::time::sleep(LIVENESS_INTERVAL).await;
        }
    }

    /// Best effort: the client may already be gone, which is fine — its
    /// absence is what the guest-side watchdog exists for.
    async fn signal_terminate(&self) {
        tokio::time::sleep(TERMINATE_GRACE).await;
        let url = self.client_url("/terminate");
        match httpc::get_retrying(&self.client, &url, &RetryPolicy::none()).await {
            Ok(_) => info!("termination reported"),
            Err(e) => warn!(error = %e, "failed to report termination"),
        }
    }
}

/// Image name from a path that may use either separator.
fn image_name(path: &str) -> String {
    path.rsplit(['/', '\\']).next().unwrap_or(path).to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
