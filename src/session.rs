//! Client-side session orchestrator.
//!
//! One run = one session for one target machine. Phases are strictly
//! sequential, each a bounded polling loop with its own progress label:
//! hibernate siblings, reconcile USB, boot, ask the guest to launch the
//! application, wait for the readiness token, then hand the session to the
//! remote-display client and wait for it to exit.
//!
//! A phase that exceeds its bound is fatal: the orchestrator logs, exits
//! non-zero and leaves partial progress in place. The orchestrator is
//! ephemeral per session, so a machine left running is the next session's
//! starting state, not a leak.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::{self, AppDescriptor, GpuGroup, LauncherConfig};
use crate::control::{client::ClientControl, join_exes};
use crate::hibernate::{self, HibernationCoordinator, POLL_INTERVAL, POLL_ITERATIONS};
use crate::httpc::{self, RetryPolicy};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::usb::UsbReconciler;
use crate::virt::Virsh;

pub struct SessionOrchestrator {
    app_key: String,
    desc: AppDescriptor,
    cfg: LauncherConfig,
    group: GpuGroup,
    config_dir: PathBuf,
    virsh: Virsh,
    progress: Arc<dyn ProgressSink>,
}

impl SessionOrchestrator {
    pub fn new(
        app_key: String,
        desc: AppDescriptor,
        cfg: LauncherConfig,
        group: GpuGroup,
        config_dir: PathBuf,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            app_key,
            desc,
            cfg,
            group,
            config_dir,
            virsh: Virsh::default(),
            progress,
        }
    }

    fn phase(&self, label: &str) {
        info!(app = %self.desc.name, phase = label, "phase");
        self.progress.report(ProgressEvent::Phase(label.to_string()));
    }

    /// Run the whole session. Returns the display client's exit code once
    /// the session ends.
    pub async fn run(&self) -> Result<i32> {
        let vm = self.desc.vm.clone();
        let reconciler = UsbReconciler::new(
            self.virsh.clone(),
            vm.clone(),
            self.desc.usb_devices.clone(),
        );

        let running = self.virsh.list_running().await?;
        if !running.iter().any(|v| *v == vm) {
            self.free_gpu_and_boot(&vm, &reconciler, &running).await?;
        } else {
            info!(vm = %vm, "target machine already running");
        }

        self.phase("ADDING USB DEVICES...");
        let attached = reconciler.add_declared_devices().await?;
        info!(vm = %vm, attached, "USB reconciliation complete");

        self.phase("RESOLVING ADDRESS...");
        let addr = self.resolve_addr(&vm).await?;

        // The listener must be up before the guest can possibly call back.
        let control = ClientControl::new(self.cfg.port, display_client_exe(&self.cfg));
        control.ensure_listening().await?;

        self.phase("STARTING APP...");
        self.request_launch(&addr.to_string()).await?;

        self.phase("WAITING...");
        control.ensure_listening().await?;
        control.wait_ready().await;

        self.progress.report(ProgressEvent::SessionLive);
        info!(app = %self.desc.name, "session live, launching display client");

        let monitor = reconciler.monitor()?;
        let status = self.run_display_client().await;
        monitor.stop().await;

        if let Some(post) = &self.cfg.post_session_command {
            info!(command = %post, "running post-session command");
            if let Err(e) = crate::process::shell_run(post).await {
                warn!(error = %e, "post-session command failed");
            }
        }

        let code = status?.code().unwrap_or(-1);
        info!(code, "display client exited, session over");
        Ok(code)
    }

    /// Hibernate running siblings, wipe stale passthrough entries, boot the
    /// target. Only runs when the target is not already up.
    async fn free_gpu_and_boot(
        &self,
        vm: &str,
        reconciler: &UsbReconciler,
        running: &[String],
    ) -> Result<()> {
        let siblings = hibernate::siblings_to_hibernate(running, &self.group.vms, vm);
        if !siblings.is_empty() {
            self.phase("HIBERNATING...");
            let coordinator = HibernationCoordinator::new(self.virsh.clone(), &self.cfg);
            for sibling in &siblings {
                info!(sibling = %sibling, "hibernating sibling machine");
                coordinator.hibernate(sibling).await?;
                coordinator.await_hibernated(sibling).await?;
            }
        }

        self.phase("REMOVING USB DEVICES...");
        reconciler.remove_all_passthrough().await?;

        self.phase("STARTING VM...");
        for _ in 0..POLL_ITERATIONS {
            // Reissue each round; the hypervisor refuses harmlessly once
            // the machine is up, and a lost attempt is retried this way.
            self.virsh.start(vm).await?;
            if self.virsh.is_running(vm).await? {
                info!(vm, "target machine running");
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        bail!("timeout: machine {vm} did not start within {POLL_ITERATIONS}s")
    }

    async fn resolve_addr(&self, vm: &str) -> Result<std::net::Ipv4Addr> {
        for _ in 0..POLL_ITERATIONS {
            if let Some(addr) = self.virsh.interface_addr(vm).await? {
                info!(vm, addr = %addr, "resolved machine address");
                return Ok(addr);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        bail!("timeout: no network address for machine {vm}")
    }

    /// POST the watcher launch command to the guest control plane. The ack
    /// means "accepted, outcome unreported" — readiness arrives separately.
    async fn request_launch(&self, addr: &str) -> Result<()> {
        let mut kill_exes = self.desc.killexes.clone();
        kill_exes.extend(config::foreign_mainexes(&self.config_dir, &self.app_key)?);
        let command = compose_watch_command(&self.desc, &kill_exes);

        let url = format!("http://{addr}:{}/execute", self.cfg.port);
        let client = httpc::control_client(Duration::from_secs(10));
        let body = httpc::post_form_retrying(
            &client,
            &url,
            &[("command", command)],
            &RetryPolicy::default(),
        )
        .await
        .with_context(|| format!("launch request to {url} failed"))?;

        info!(response = %body.trim(), "launch request acknowledged");
        Ok(())
    }

    async fn run_display_client(&self) -> Result<std::process::ExitStatus> {
        let mut cmd = Command::new(&self.cfg.display_client_path);
        cmd.arg(format!("spice:port={}", self.cfg.display_client_port));
        for arg in &self.cfg.display_client_args {
            cmd.arg(arg);
        }
        cmd.arg(format!("win:title={}", self.desc.name));
        for (k, v) in &self.cfg.display_client_env {
            cmd.env(k, v);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.cfg.display_client_path))?;
        child
            .wait()
            .await
            .context("failed waiting for display client")
    }
}

/// The command line the guest's `/execute` runs to start the per-session
/// watcher.
pub fn compose_watch_command(desc: &AppDescriptor, kill_exes: &[String]) -> String {
    let mut cmd = format!(
        "glasshouse-watch.exe --app \"{}\" --mainexe \"{}\" --always-on-top {} \
         --wait-for-anti-cheat {} --delay {}",
        desc.command, desc.mainexe, desc.alwaysontop, desc.waitforeac, desc.delay
    );
    if !desc.exes.is_empty() {
        cmd.push_str(" --exes ");
        cmd.push_str(&join_exes(&desc.exes));
    }
    if !kill_exes.is_empty() {
        cmd.push_str(" --kill-exes ");
        cmd.push_str(&join_exes(kill_exes));
    }
    cmd
}

/// Image name of the display client, for `/terminate`'s kill.
fn display_client_exe(cfg: &LauncherConfig) -> String {
    cfg.display_client_path
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(&cfg.display_client_path)
        .to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> AppDescriptor {
        serde_json::from_str(
            r#"{
                "name": "Rally",
                "vm": "gpu-vm1",
                "command": "steam://run/310560",
                "mainexe": "drt.exe",
                "exes": ["drt.exe"],
                "delay": 2.5
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn watch_command_carries_flags_and_quoted_lists() {
        let cmd = compose_watch_command(&descriptor(), &["other.exe".to_string()]);
        assert!(cmd.starts_with("glasshouse-watch.exe --app \"steam://run/310560\""));
        assert!(cmd.contains("--mainexe \"drt.exe\""));
        assert!(cmd.contains("--always-on-top false"));
        assert!(cmd.contains("--wait-for-anti-cheat true"));
        assert!(cmd.contains("--delay 2.5"));
        assert!(cmd.contains("--exes \"drt.exe\""));
        assert!(cmd.contains("--kill-exes \"other.exe\""));
    }

    #[test]
    fn watch_command_omits_empty_lists() {
        let mut desc = descriptor();
        desc.exes.clear();
        let cmd = compose_watch_command(&desc, &[]);
        assert!(!cmd.contains("--exes"));
        assert!(!cmd.contains("--kill-exes"));
    }

    #[test]
    fn display_client_exe_is_the_basename() {
        let cfg: LauncherConfig = serde_json::from_str(
            r#"{"display_client_path":"/usr/local/bin/looking-glass-client","display_client_port":5900}"#,
        )
        .unwrap();
        assert_eq!(display_client_exe(&cfg), "looking-glass-client");
    }
}
