//! USB hotplug reconciler.
//!
//! Maps declared device name fragments to physical bus/device addresses,
//! keeps the target machine's persisted device definition in line with what
//! is physically plugged in, and reacts to kernel hotplug events during a
//! live session.
//!
//! Removal events from the kernel do not reliably identify which logical
//! slot was lost, so every removal is treated as "state may be stale":
//! detach everything currently attached, then re-attach everything that
//! currently matches. Expensive, but correct.

pub mod device;
pub mod hostdev;

use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::virt::Virsh;
use device::UsbDevice;

/// Reconciles one machine's USB passthrough entries against the declared
/// device set. Cheap to clone; all state lives in the hypervisor's
/// definition document.
#[derive(Debug, Clone)]
pub struct UsbReconciler {
    virsh: Virsh,
    vm: String,
    declared: Vec<String>,
}

impl UsbReconciler {
    pub fn new(virsh: Virsh, vm: impl Into<String>, declared: Vec<String>) -> Self {
        Self { virsh, vm: vm.into(), declared }
    }

    /// Wipe every USB passthrough entry from the persisted definition and
    /// re-define the machine. Run before boot so stale bus/device pairs
    /// from a previous session never block startup.
    pub async fn remove_all_passthrough(&self) -> Result<()> {
        let doc = self.virsh.dump_xml(&self.vm).await?;
        let before = hostdev::count_usb_hostdevs(&doc);
        let wiped = hostdev::strip_usb_hostdevs(&doc);

        let xml_path = std::env::temp_dir().join(format!("glasshouse-{}.xml", self.vm));
        tokio::fs::write(&xml_path, &wiped)
            .await
            .with_context(|| format!("failed to write {}", xml_path.display()))?;
        self.virsh.define(&xml_path).await?;

        info!(vm = %self.vm, removed = before, "wiped USB passthrough entries");
        Ok(())
    }

    /// Live-attach every declared device not already present, checked by
    /// bus+device pair against a fresh definition dump. Attaching a device
    /// that is already present is a no-op; a declared name with no physical
    /// match is skipped silently. Returns the number attached.
    pub async fn add_declared_devices(&self) -> Result<usize> {
        if self.declared.is_empty() || self.declared.iter().all(String::is_empty) {
            info!(vm = %self.vm, "no USB devices declared");
            return Ok(0);
        }

        let listing = device::enumerate().await?;
        let matches = device::declared_matches(&listing, &self.declared);
        if matches.is_empty() {
            info!(vm = %self.vm, "no declared USB device is currently plugged in");
            return Ok(0);
        }

        let doc = self.virsh.dump_xml(&self.vm).await?;
        let mut added = 0;
        for dev in &matches {
            if hostdev::contains_address(&doc, &dev.bus, &dev.device) {
                debug!(vm = %self.vm, bus = %dev.bus, device = %dev.device,
                       product = %dev.product, "device already attached");
                continue;
            }
            if self.attach(dev).await {
                added += 1;
            }
        }
        Ok(added)
    }

    /// One attach attempt; failures are logged and the caller moves on to
    /// the remaining devices (the next hotplug event retries them).
    async fn attach(&self, dev: &UsbDevice) -> bool {
        let fragment = hostdev::attach_fragment(dev);
        match self.virsh.attach_device(&self.vm, &fragment).await {
            Ok(true) => {
                info!(vm = %self.vm, bus = %dev.bus, device = %dev.device,
                      id = %format!("{}:{}", dev.vendor_id, dev.product_id),
                      product = %dev.product, "attached USB device");
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(vm = %self.vm, product = %dev.product, error = %e, "attach failed");
                false
            }
        }
    }

    /// Full resynchronisation after a removal event: detach every entry in
    /// the live definition, then re-attach everything currently matching.
    pub async fn resync_after_removal(&self) -> Result<()> {
        let doc = self.virsh.dump_xml(&self.vm).await?;
        for (vendor, product) in hostdev::attached_ids(&doc) {
            let fragment = hostdev::detach_fragment(&vendor, &product);
            match self.virsh.detach_device(&self.vm, &fragment).await {
                Ok(true) => info!(vm = %self.vm, id = %format!("{vendor}:{product}"), "detached USB device"),
                Ok(false) => {}
                Err(e) => warn!(vm = %self.vm, id = %format!("{vendor}:{product}"), error = %e, "detach failed"),
            }
        }
        self.add_declared_devices().await?;
        Ok(())
    }

    /// Subscribe to kernel hotplug events and reconcile on each one. Runs
    /// until [`UsbMonitor::stop`] is called.
    pub fn monitor(&self) -> Result<UsbMonitor> {
        let mut child = Command::new("udevadm")
            .args(["monitor", "--udev", "--subsystem-match=usb"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn udevadm monitor")?;

        let stdout = child
            .stdout
            .take()
            .context("udevadm monitor has no stdout")?;

        let reconciler = self.clone();
        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        warn!("udevadm monitor stream closed");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "error reading udevadm monitor");
                        return;
                    }
                };
                match parse_event_action(&line) {
                    Some(HotplugAction::Add) => {
                        debug!(vm = %reconciler.vm, "USB add event");
                        if let Err(e) = reconciler.add_declared_devices().await {
                            warn!(error = %e, "reconcile after add failed");
                        }
                    }
                    Some(HotplugAction::Remove) => {
                        debug!(vm = %reconciler.vm, "USB remove event");
                        if let Err(e) = reconciler.resync_after_removal().await {
                            warn!(error = %e, "resync after removal failed");
                        }
                    }
                    None => {}
                }
            }
        });

        info!(vm = %self.vm, "USB hotplug monitor started");
        Ok(UsbMonitor { child, task })
    }
}

/// Running hotplug subscription; owns the `udevadm` child process.
pub struct UsbMonitor {
    child: Child,
    task: JoinHandle<()>,
}

impl UsbMonitor {
    /// Tear the subscription down: abort the reconcile task and kill the
    /// udevadm child.
    pub async fn stop(mut self) {
        self.task.abort();
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "udevadm child already gone");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HotplugAction {
    Add,
    Remove,
}

/// `udevadm monitor` event lines look like
/// `UDEV  [8532.101342] add      /devices/pci0000:00/.../3-2 (usb)`.
fn parse_event_action(line: &str) -> Option<HotplugAction> {
    if !line.starts_with("UDEV") {
        return None;
    }
    let action = line.split_whitespace().nth(2)?;
    match action {
        "add" => Some(HotplugAction::Add),
        "remove" => Some(HotplugAction::Remove),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_parsing_recognises_add_and_remove() {
        let add = "UDEV  [8532.101342] add      /devices/pci0000:00/0000:00:14.0/usb3/3-2 (usb)";
        let remove = "UDEV  [8533.200111] remove   /devices/pci0000:00/0000:00:14.0/usb3/3-2 (usb)";
        assert_eq!(parse_event_action(add), Some(HotplugAction::Add));
        assert_eq!(parse_event_action(remove), Some(HotplugAction::Remove));
    }

    #[test]
    fn event_parsing_ignores_other_actions_and_banner() {
        let bind = "UDEV  [8532.11] bind     /devices/... (usb)";
        assert_eq!(parse_event_action(bind), None);
        assert_eq!(parse_event_action("monitor will print the received events for:"), None);
        assert_eq!(parse_event_action("KERNEL[8532.1] add /devices/... (usb)"), None);
    }
}
