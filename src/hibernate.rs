//! Hibernation coordinator for sibling machines sharing the GPU.
//!
//! A sibling that is running must give the GPU up before the target can
//! boot. The hibernate instruction goes to the sibling's own control plane
//! (it is already reachable — we never boot a machine just to hibernate
//! it) and is advisory: sending it to a machine that is already on its way
//! down is harmless. Completion is observed by polling run-state until the
//! machine disappears from the running list.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::config::LauncherConfig;
use crate::httpc::{self, RetryPolicy};
use crate::virt::Virsh;

/// Polling bound shared with the orchestrator's other phases:
/// 500 iterations at one-second intervals.
pub const POLL_ITERATIONS: u32 = 500;
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct HibernationCoordinator {
    virsh: Virsh,
    client: reqwest::Client,
    hibernate_command: String,
    control_port: u16,
}

impl HibernationCoordinator {
    pub fn new(virsh: Virsh, cfg: &LauncherConfig) -> Self {
        Self {
            virsh,
            client: httpc::control_client(Duration::from_secs(10)),
            hibernate_command: cfg.hibernate_command.clone(),
            control_port: cfg.port,
        }
    }

    /// Send the hibernate instruction to the sibling's control plane.
    /// Idempotent; the instruction is advisory.
    pub async fn hibernate(&self, vm: &str) -> Result<()> {
        let addr = self
            .virsh
            .interface_addr(vm)
            .await?
            .with_context(|| format!("no network address for running sibling {vm}"))?;
        let url = format!("http://{addr}:{}/execute", self.control_port);

        let body = httpc::post_form_retrying(
            &self.client,
            &url,
            &[("command", self.hibernate_command.clone())],
            &RetryPolicy::default(),
        )
        .await
        .with_context(|| format!("failed to send hibernate instruction to {vm}"))?;

        info!(vm, response = %body.trim(), "hibernate instruction sent");
        Ok(())
    }

    /// Poll run-state until the machine is no longer running.
    pub async fn await_hibernated(&self, vm: &str) -> Result<()> {
        for _ in 0..POLL_ITERATIONS {
            if !self.virsh.is_running(vm).await? {
                info!(vm, "sibling hibernated");
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        bail!("timeout: sibling {vm} did not hibernate within {POLL_ITERATIONS}s")
    }
}

/// Which running machines must hibernate before `target` may start:
/// running members of the GPU group, excluding the target itself.
pub fn siblings_to_hibernate(running: &[String], group: &[String], target: &str) -> Vec<String> {
    running
        .iter()
        .filter(|vm| vm.as_str() != target && group.iter().any(|g| g == *vm))
        .cloned()
        .collect()
}
