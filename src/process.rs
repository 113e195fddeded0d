//! Process-table helpers shared by both sides of a session.
//!
//! Cross-process cancellation in this system is process killing, not
//! graceful shutdown: a `/terminate` or `/cancel` maps directly to killing
//! named executables. The underlying tools differ per platform
//! (`tasklist`/`taskkill` inside the Windows guest, `pgrep`/`pkill` on the
//! Linux client host) but the operations are the same.

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Is any of the named executables currently running?
pub async fn any_running(names: &[String]) -> bool {
    for name in names {
        if is_running(name).await {
            return true;
        }
    }
    false
}

/// Is the named executable currently in the process table? Query failures
/// are treated as "not running" — the caller's polling loop will see the
/// truth eventually.
pub async fn is_running(name: &str) -> bool {
    let result = if cfg!(windows) {
        Command::new("tasklist")
            .args(["/FI", &format!("IMAGENAME eq {name}")])
            .output()
            .await
            .map(|out| String::from_utf8_lossy(&out.stdout).contains(name))
    } else {
        Command::new("pgrep")
            .args(["-f", name])
            .output()
            .await
            .map(|out| out.status.success())
    };

    match result {
        Ok(running) => running,
        Err(e) => {
            warn!(name, error = %e, "process query failed");
            false
        }
    }
}

/// Force-kill every process with the given image name. Best effort: a
/// failure is logged, never propagated.
pub async fn kill_by_name(name: &str) {
    let result = if cfg!(windows) {
        Command::new("taskkill")
            .args(["/F", "/IM", name])
            .output()
            .await
    } else {
        Command::new("pkill").args(["-f", name]).output().await
    };

    match result {
        Ok(out) if out.status.success() => info!(name, "killed process"),
        Ok(_) => debug!(name, "no such process to kill"),
        Err(e) => warn!(name, error = %e, "failed to run kill command"),
    }
}

/// Process ids of every live instance of the named executable. Query
/// failures yield an empty list, same as "not running".
pub async fn pids_of(name: &str) -> Vec<u32> {
    let output = if cfg!(windows) {
        Command::new("tasklist")
            .args(["/FI", &format!("IMAGENAME eq {name}"), "/FO", "CSV", "/NH"])
            .output()
            .await
    } else {
        Command::new("pgrep").args(["-f", name]).output().await
    };

    match output {
        Ok(out) => {
            let listing = String::from_utf8_lossy(&out.stdout);
            if cfg!(windows) {
                parse_tasklist_csv_pids(&listing, name)
            } else {
                parse_pgrep_pids(&listing)
            }
        }
        Err(e) => {
            warn!(name, error = %e, "pid query failed");
            Vec::new()
        }
    }
}

/// CSV tasklist rows: `"game.exe","1234","Console","1","10,024 K"`.
pub fn parse_tasklist_csv_pids(listing: &str, image: &str) -> Vec<u32> {
    listing
        .lines()
        .filter_map(|line| {
            let mut cols = line.split("\",\"");
            let name = cols.next()?.trim_start_matches('"');
            if !name.eq_ignore_ascii_case(image) {
                return None;
            }
            cols.next()?.parse().ok()
        })
        .collect()
}

/// `pgrep` output: one pid per line.
pub fn parse_pgrep_pids(listing: &str) -> Vec<u32> {
    listing
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

/// Run a command line through the platform shell and wait for it.
pub async fn shell_run(command: &str) -> Result<()> {
    let status = shell(command)
        .status()
        .await
        .with_context(|| format!("failed to spawn shell for: {command}"))?;
    if !status.success() {
        warn!(command, code = status.code().unwrap_or(-1), "command exited non-zero");
    }
    Ok(())
}

/// Launch a command line detached from this process (fire and forget).
pub fn spawn_detached(command: &str) -> Result<()> {
    let mut cmd = shell(command);
    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    let child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn: {command}"))?;
    drop(child);
    Ok(())
}

fn shell(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}

/// Start the guest display host at realtime priority, detached.
pub fn start_display_host(path: &str) -> Result<()> {
    if cfg!(windows) {
        spawn_detached(&format!("start /realTime \"\" \"{path}\""))
    } else {
        spawn_detached(path)
    }
}

/// Kill every other live instance of the given image name, sparing the
/// calling process. Run at orchestrator startup so a stale session never
/// holds the control-plane port.
pub async fn kill_stale_instances(image: &str) {
    let own_pid = std::process::id();
    let output = if cfg!(windows) {
        Command::new("tasklist").output().await
    } else {
        Command::new("pgrep").args(["-f", image]).output().await
    };

    let Ok(out) = output else { return };
    let listing = String::from_utf8_lossy(&out.stdout).into_owned();

    for line in listing.lines() {
        let pid = if cfg!(windows) {
            if !line.contains(image) {
                continue;
            }
            line.split_whitespace().nth(1).and_then(|p| p.parse::<u32>().ok())
        } else {
            line.trim().parse::<u32>().ok()
        };
        let Some(pid) = pid else { continue };
        if pid == own_pid {
            continue;
        }
        info!(pid, image, "killing stale instance");
        let _ = if cfg!(windows) {
            Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/F"])
                .output()
                .await
        } else {
            Command::new("kill").arg(pid.to_string()).output().await
        };
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasklist_csv_pids_match_the_image_only() {
        let listing = "\
\"drt.exe\",\"1234\",\"Console\",\"1\",\"10,024 K\"\r
\"drt.exe\",\"5678\",\"Console\",\"1\",\"201,552 K\"\r
\"explorer.exe\",\"901\",\"Console\",\"1\",\"88,104 K\"\r
";
        assert_eq!(parse_tasklist_csv_pids(listing, "drt.exe"), vec![1234, 5678]);
        assert_eq!(parse_tasklist_csv_pids(listing, "DRT.EXE"), vec![1234, 5678]);
        assert!(parse_tasklist_csv_pids(listing, "game.exe").is_empty());
    }

    #[test]
    fn tasklist_no_match_banner_yields_nothing() {
        let listing = "INFO: No tasks are running which match the specified criteria.\r\n";
        assert!(parse_tasklist_csv_pids(listing, "drt.exe").is_empty());
    }

    #[test]
    fn pgrep_pids_one_per_line() {
        assert_eq!(parse_pgrep_pids("1234\n5678\n"), vec![1234, 5678]);
        assert!(parse_pgrep_pids("").is_empty());
    }
}
