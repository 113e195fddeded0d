//! Virtualization shell adapter: a thin wrapper over the `virsh` CLI.
//!
//! Pure synchronous calls from the hypervisor's point of view — every method
//! shells out, captures output, and returns. No state is held here; the
//! machine's run-state is always re-queried, never cached.
//!
//! Non-zero exits from *mutating* commands (`start`, `attach-device`,
//! `detach-device`) are logged rather than propagated: the orchestrator's
//! polling loops observe the real outcome, which is more trustworthy than
//! the exit code of a flaky hypervisor CLI.

use std::net::Ipv4Addr;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Handle to the hypervisor CLI. Cheap to clone; holds only the binary name
/// so tests and unusual installs can point elsewhere.
#[derive(Debug, Clone)]
pub struct Virsh {
    program: String,
}

impl Default for Virsh {
    fn default() -> Self {
        Self { program: "virsh".to_string() }
    }
}

impl Virsh {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }

    /// Names of all machines currently in the running state.
    pub async fn list_running(&self) -> Result<Vec<String>> {
        let out = self
            .capture(&["list", "--name", "--state-running"])
            .await
            .context("virsh list failed")?;
        Ok(parse_name_list(&out))
    }

    pub async fn is_running(&self, vm: &str) -> Result<bool> {
        Ok(self.list_running().await?.iter().any(|v| v == vm))
    }

    /// One `domifaddr` query; `None` when no IPv4 lease is visible yet.
    pub async fn interface_addr(&self, vm: &str) -> Result<Option<Ipv4Addr>> {
        let out = self
            .capture(&["domifaddr", vm])
            .await
            .with_context(|| format!("virsh domifaddr {vm} failed"))?;
        Ok(first_ipv4(&out))
    }

    /// Dump the machine's persisted device definition XML.
    pub async fn dump_xml(&self, vm: &str) -> Result<String> {
        self.capture(&["dumpxml", vm])
            .await
            .with_context(|| format!("virsh dumpxml {vm} failed"))
    }

    /// Replace the machine's persisted definition from a file on disk.
    pub async fn define(&self, xml_path: &Path) -> Result<()> {
        let path = xml_path.to_string_lossy().into_owned();
        self.capture(&["define", &path])
            .await
            .with_context(|| format!("virsh define {path} failed"))?;
        Ok(())
    }

    /// Issue one start attempt. A non-zero exit is logged and swallowed;
    /// the caller polls run-state for the real outcome.
    pub async fn start(&self, vm: &str) -> Result<()> {
        let status = Command::new(&self.program)
            .args(["start", vm])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .with_context(|| format!("failed to spawn virsh start {vm}"))?;
        if !status.success() {
            debug!(vm, code = status.code().unwrap_or(-1), "virsh start returned non-zero");
        }
        Ok(())
    }

    /// Live-attach a device XML fragment, persisting it into the definition.
    /// Returns whether virsh reported success.
    pub async fn attach_device(&self, vm: &str, device_xml: &str) -> Result<bool> {
        self.device_command("attach-device", vm, device_xml).await
    }

    /// Live-detach a device XML fragment, removing it from the definition.
    pub async fn detach_device(&self, vm: &str, device_xml: &str) -> Result<bool> {
        self.device_command("detach-device", vm, device_xml).await
    }

    async fn device_command(&self, verb: &str, vm: &str, device_xml: &str) -> Result<bool> {
        let mut child = Command::new(&self.program)
            .args([verb, vm, "/dev/stdin", "--persistent"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn virsh {verb} {vm}"))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(device_xml.as_bytes())
                .await
                .context("failed to write device XML to virsh stdin")?;
        }

        let out = child
            .wait_with_output()
            .await
            .with_context(|| format!("virsh {verb} {vm} did not finish"))?;

        if !out.status.success() {
            warn!(
                vm,
                verb,
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "virsh device command failed"
            );
        }
        Ok(out.status.success())
    }

    async fn capture(&self, args: &[&str]) -> Result<String> {
        let out = Command::new(&self.program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to spawn {} {:?}", self.program, args))?;
        if !out.status.success() {
            anyhow::bail!(
                "{} {:?} exited with {}: {}",
                self.program,
                args,
                out.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

// ---------------------------------------------------------------------------
// Output parsing (pure)
// ---------------------------------------------------------------------------

/// `virsh list --name` output: one name per line, blank lines interspersed.
pub fn parse_name_list(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// First IPv4 address appearing anywhere in `domifaddr` output.
///
/// The output is a table whose address column looks like
/// `192.168.122.45/24`; scanning tokens is robust against the header and
/// column drift between libvirt versions.
pub fn first_ipv4(raw: &str) -> Option<Ipv4Addr> {
    for token in raw.split_whitespace() {
        let candidate = token.split('/').next().unwrap_or(token);
        if let Ok(addr) = candidate.parse::<Ipv4Addr>() {
            return Some(addr);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_list_skips_blank_lines() {
        let raw = "gpu-vm1\n\ngpu-vm2\n  \n";
        assert_eq!(parse_name_list(raw), vec!["gpu-vm1", "gpu-vm2"]);
    }

    #[test]
    fn name_list_empty_output() {
        assert!(parse_name_list("\n\n").is_empty());
    }

    #[test]
    fn ipv4_found_in_domifaddr_table() {
        let raw = "\
 Name       MAC address          Protocol     Address
-------------------------------------------------------------
 vnet0      52:54:00:ab:cd:ef    ipv4         192.168.122.45/24
";
        assert_eq!(first_ipv4(raw), Some(Ipv4Addr::new(192, 168, 122, 45)));
    }

    #[test]
    fn ipv4_absent_while_booting() {
        let raw = " Name       MAC address          Protocol     Address\n----------\n";
        assert_eq!(first_ipv4(raw), None);
    }

    #[test]
    fn ipv4_ignores_mac_addresses() {
        // MAC octets must not be mistaken for a dotted quad.
        let raw = "vnet0 52:54:00:ab:cd:ef ipv4 10.0.0.5/24";
        assert_eq!(first_ipv4(raw), Some(Ipv4Addr::new(10, 0, 0, 5)));
    }
}
