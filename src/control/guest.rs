//! Guest-side control plane and its background watchers.
//!
//! Endpoints: `/execute` (fire-and-forget command launch), `/cancel` and
//! `/stop` (kill the watcher plus a caller-supplied executable list),
//! `/disconnected` (arm a delayed kill, superseding any armed timer) and
//! `/keepalive` (reset the liveness watermark, lazily start the watchdog).
//!
//! The watchdog hibernates this machine once the watermark goes stale —
//! "is the client still supervising us" is deliberately decoupled from
//! "is the target application alive", which the per-session watcher tracks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{Form, State},
    routing::{get, post},
};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::control::split_exes;
use crate::process;

/// Delay between acknowledging `/execute` and actually running the command.
const EXECUTE_DELAY: Duration = Duration::from_millis(100);

/// Keepalive silence tolerated before the display-host watcher relaunches
/// the display host.
const DISPLAY_HOST_GRACE: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Disconnect timer
// ---------------------------------------------------------------------------

/// Delayed-kill timer armed by `/disconnected`. A new request
/// deterministically supersedes an in-flight one: the previous timer is
/// aborted before the replacement is armed.
#[derive(Default)]
pub struct DisconnectTimer {
    slot: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DisconnectTimer {
    pub async fn arm<F>(&self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.slot.lock().await;
        if let Some(prev) = slot.take() {
            prev.abort();
        }
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        }));
    }
}

// ---------------------------------------------------------------------------
// Control-plane state
// ---------------------------------------------------------------------------

pub struct GuestControl {
    cfg: AgentConfig,
    last_keepalive: std::sync::Mutex<Instant>,
    watchdog: std::sync::Mutex<Option<JoinHandle<()>>>,
    disconnect: DisconnectTimer,
}

impl GuestControl {
    pub fn new(cfg: AgentConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            last_keepalive: std::sync::Mutex::new(Instant::now()),
            watchdog: std::sync::Mutex::new(None),
            disconnect: DisconnectTimer::default(),
        })
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/execute", post(execute))
            .route("/cancel", post(cancel))
            .route("/stop", post(stop))
            .route("/disconnected", post(disconnected))
            .route("/keepalive", get(keepalive))
            .with_state(self)
    }

    /// Bind the guest control plane and serve until the process exits.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let port = self.cfg.port;
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind guest control plane on port {port}"))?;
        info!(port, "guest control plane listening");
        axum::serve(listener, self.router())
            .await
            .context("guest control plane exited")
    }

    fn touch_keepalive(&self) {
        *self.last_keepalive.lock().expect("keepalive lock poisoned") = Instant::now();
    }

    fn keepalive_elapsed(&self) -> Duration {
        self.last_keepalive
            .lock()
            .expect("keepalive lock poisoned")
            .elapsed()
    }

    /// Kill the watcher process plus the caller-supplied executables.
    async fn kill_targets(&self, exes: &str) {
        process::kill_by_name(&self.cfg.watcher_exe).await;
        for exe in split_exes(exes) {
            process::kill_by_name(&exe).await;
        }
    }

    /// Hibernate-on-silence watchdog. Spawned lazily by `/keepalive` so an
    /// idle guest with no session never arms it. A watchdog that has fired
    /// (and hibernated the machine) is finished; the next keepalive after
    /// resume arms a fresh one.
    fn ensure_watchdog(self: &Arc<Self>) {
        let mut slot = self.watchdog.lock().expect("watchdog lock poisoned");
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let ctl = self.clone();
        info!(timeout_secs = ctl.cfg.keepalive_timeout, "starting keepalive watchdog");
        *slot = Some(tokio::spawn(async move {
            let timeout = Duration::from_secs_f64(ctl.cfg.keepalive_timeout);
            // Check at least twice per timeout window; never slower than 1 s.
            let tick = timeout
                .div_f64(2.0)
                .clamp(Duration::from_millis(10), Duration::from_secs(1));
            loop {
                tokio::time::sleep(tick).await;
                if ctl.keepalive_elapsed() >= timeout {
                    warn!("no keepalive within timeout, hibernating");
                    if let Err(e) = process::shell_run(&ctl.cfg.hibernate_command).await {
                        error!(error = %e, "hibernate command failed");
                    }
                    return;
                }
            }
        }));
    }

    /// Relaunch the display host whenever it is gone and no client has
    /// pinged recently (i.e. outside an active session handoff).
    pub fn spawn_display_host_watcher(self: &Arc<Self>) {
        let ctl = self.clone();
        tokio::spawn(async move {
            let exe = display_host_exe(&ctl.cfg.display_host_path);
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if !process::is_running(&exe).await
                    && ctl.keepalive_elapsed() > DISPLAY_HOST_GRACE
                {
                    info!(exe = %exe, "display host not running, relaunching");
                    if let Err(e) = process::start_display_host(&ctl.cfg.display_host_path) {
                        warn!(error = %e, "failed to relaunch display host");
                    }
                }
            }
        });
    }
}

/// Image name of the display host, for process-table queries. Splits on
/// both separators: the config may hold a Windows path while tests run
/// elsewhere.
fn display_host_exe(path: &str) -> String {
    path.rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
        .to_string()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ExecuteForm {
    command: String,
}

#[derive(Deserialize)]
struct KillForm {
    exes: String,
}

#[derive(Deserialize)]
struct DisconnectForm {
    timeout: f64,
    exes: String,
}

/// Fire-and-forget: the 200 ack means "accepted", never "succeeded".
async fn execute(Form(req): Form<ExecuteForm>) -> String {
    if req.command.is_empty() {
        return "No command provided.".to_string();
    }
    info!(command = %req.command, "execute requested");
    let command = req.command.clone();
    tokio::spawn(async move {
        tokio::time::sleep(EXECUTE_DELAY).await;
        if let Err(e) = process::shell_run(&command).await {
            error!(command = %command, error = %e, "execute command failed");
        }
    });
    format!("Command '{}' will be executed.", req.command)
}

async fn cancel(State(ctl): State<Arc<GuestControl>>, Form(req): Form<KillForm>) -> &'static str {
    info!(exes = %req.exes, "cancel requested");
    ctl.kill_targets(&req.exes).await;
    "Cancelled"
}

async fn stop(State(ctl): State<Arc<GuestControl>>, Form(req): Form<KillForm>) -> &'static str {
    info!(exes = %req.exes, "stop requested");
    ctl.kill_targets(&req.exes).await;
    "Stopped"
}

async fn disconnected(
    State(ctl): State<Arc<GuestControl>>,
    Form(req): Form<DisconnectForm>,
) -> String {
    info!(timeout = req.timeout, exes = %req.exes, "disconnect timer armed");
    let inner = ctl.clone();
    let exes = req.exes.clone();
    ctl.disconnect
        .arm(Duration::from_secs_f64(req.timeout), async move {
            info!("disconnect timeout elapsed, killing session processes");
            inner.kill_targets(&exes).await;
        })
        .await;
    format!("Disconnected. Timeout: {}", req.timeout)
}

async fn keepalive(State(ctl): State<Arc<GuestControl>>) -> &'static str {
    ctl.touch_keepalive();
    ctl.ensure_watchdog();
    "Acknowledged"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
