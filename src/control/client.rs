//! Client-side control plane: the listener the in-guest watcher calls back
//! into.
//!
//! State: stopped → listening → token-received. `/ready` delivers the
//! one-shot readiness token (a repeat call is a no-op); `/terminate` kills
//! the local display-client process and then this process, whatever state
//! the session is in.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, extract::State, routing::get};
use tokio::sync::Notify;
use tracing::{error, info};

use crate::process;

pub struct ClientControl {
    port: u16,
    /// Image name of the remote-display client killed on `/terminate`.
    display_client_exe: String,
    listening: AtomicBool,
    ready: AtomicBool,
    notify: Notify,
}

impl ClientControl {
    pub fn new(port: u16, display_client_exe: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            port,
            display_client_exe: display_client_exe.into(),
            listening: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    /// Bind and start serving. Idempotent: the orchestrator may call this
    /// from more than one phase; only the first call binds.
    pub async fn ensure_listening(self: &Arc<Self>) -> Result<()> {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("failed to bind client control plane on port {}", self.port))?;
        info!(port = self.port, "client control plane listening");

        let app = self.clone().router();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "client control plane exited");
            }
        });
        Ok(())
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/ready", get(ready))
            .route("/terminate", get(terminate))
            .with_state(self)
    }

    /// Block until the readiness token has been received.
    pub async fn wait_ready(&self) {
        loop {
            // Register the waiter before checking the flag: a token landing
            // between the check and the await still wakes us, and one that
            // landed before the check is caught by the flag.
            let notified = self.notify.notified();
            if self.ready.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

async fn ready(State(ctl): State<Arc<ClientControl>>) -> &'static str {
    if ctl.ready.swap(true, Ordering::SeqCst) {
        info!("duplicate readiness token ignored");
    } else {
        info!("guest is ready");
        ctl.notify.notify_waiters();
    }
    "Session is ready."
}

async fn terminate(State(ctl): State<Arc<ClientControl>>) -> &'static str {
    info!("guest sent terminate");
    process::kill_by_name(&ctl.display_client_exe).await;

    // Let the response flush before the process goes away.
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::process::exit(0);
    });
    "Terminating."
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_ready_returns_for_a_token_that_already_arrived() {
        let control = ClientControl::new(0, "display.exe");
        ready(State(control.clone())).await;

        // No notification is pending any more; the flag alone must unblock.
        tokio::time::timeout(Duration::from_millis(200), control.wait_ready())
            .await
            .expect("wait_ready must return at once when the token is set");
        assert!(control.is_ready());
    }

    #[tokio::test]
    async fn wait_ready_wakes_on_a_late_token() {
        let control = ClientControl::new(0, "display.exe");
        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.wait_ready().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        ready(State(control.clone())).await;

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_ready must wake when the token lands")
            .unwrap();
    }
}
