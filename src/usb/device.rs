//! Physical USB device identification.
//!
//! Devices are enumerated with `lsusb` and matched against declared name
//! fragments by case-insensitive substring. A declared name with zero live
//! matches is normal (controllers get unplugged); it is skipped, never an
//! error.

use anyhow::{Context, Result};
use tokio::process::Command;

/// One physical USB device instance, as seen in the system listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    /// Hex vendor id without the `0x` prefix, e.g. `046d`.
    pub vendor_id: String,
    /// Hex product id without the `0x` prefix, e.g. `c52b`.
    pub product_id: String,
    /// Bus number, leading zeros preserved as printed (`003`).
    pub bus: String,
    /// Device number with leading zeros stripped (`7`, not `007`) — the
    /// form libvirt expects in the hostdev source address.
    pub device: String,
    /// Human-readable product description from the listing.
    pub product: String,
}

/// Parse one `lsusb` line:
/// `Bus 003 Device 007: ID 046d:c52b Logitech, Inc. Unifying Receiver`.
pub fn parse_lsusb_line(line: &str) -> Option<UsbDevice> {
    let mut tokens = line.split_whitespace();
    if tokens.next()? != "Bus" {
        return None;
    }
    let bus = tokens.next()?.to_string();
    if tokens.next()? != "Device" {
        return None;
    }
    let device_raw = tokens.next()?.trim_end_matches(':');
    let device = device_raw.parse::<u32>().ok()?.to_string();
    if tokens.next()? != "ID" {
        return None;
    }
    let id = tokens.next()?;
    let (vendor_id, product_id) = id.split_once(':')?;
    let product = tokens.collect::<Vec<_>>().join(" ");

    Some(UsbDevice {
        vendor_id: vendor_id.to_string(),
        product_id: product_id.to_string(),
        bus,
        device,
        product,
    })
}

/// All devices in `listing` whose line contains `fragment`
/// (case-insensitive).
pub fn matching_devices(listing: &str, fragment: &str) -> Vec<UsbDevice> {
    let needle = fragment.to_lowercase();
    listing
        .lines()
        .filter(|line| line.to_lowercase().contains(&needle))
        .filter_map(parse_lsusb_line)
        .collect()
}

/// Devices matching any of the declared fragments, deduplicated by
/// bus+device pair (one physical device can match several fragments).
pub fn declared_matches(listing: &str, declared: &[String]) -> Vec<UsbDevice> {
    let mut found: Vec<UsbDevice> = Vec::new();
    for fragment in declared {
        if fragment.is_empty() {
            continue;
        }
        for dev in matching_devices(listing, fragment) {
            if !found.iter().any(|d| d.bus == dev.bus && d.device == dev.device) {
                found.push(dev);
            }
        }
    }
    found
}

/// Run `lsusb` and return its raw listing.
pub async fn enumerate() -> Result<String> {
    let out = Command::new("lsusb")
        .output()
        .await
        .context("failed to spawn lsusb")?;
    if !out.status.success() {
        anyhow::bail!("lsusb exited with {}", out.status.code().unwrap_or(-1));
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
Bus 003 Device 001: ID 1d6b:0002 Linux Foundation 2.0 root hub
Bus 003 Device 007: ID 046d:c52b Logitech, Inc. Unifying Receiver
Bus 003 Device 012: ID 054c:0ce6 Sony Corp. Wireless Controller
Bus 001 Device 004: ID 054c:0ce6 Sony Corp. Wireless Controller
";

    #[test]
    fn parses_well_formed_line() {
        let dev =
            parse_lsusb_line("Bus 003 Device 007: ID 046d:c52b Logitech, Inc. Unifying Receiver")
                .unwrap();
        assert_eq!(dev.bus, "003");
        assert_eq!(dev.device, "7", "leading zeros must be stripped");
        assert_eq!(dev.vendor_id, "046d");
        assert_eq!(dev.product_id, "c52b");
        assert_eq!(dev.product, "Logitech, Inc. Unifying Receiver");
    }

    #[test]
    fn rejects_garbage_line() {
        assert!(parse_lsusb_line("not a usb line").is_none());
        assert!(parse_lsusb_line("").is_none());
    }

    #[test]
    fn match_is_case_insensitive() {
        let found = matching_devices(LISTING, "wireless controller");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].bus, "003");
        assert_eq!(found[1].bus, "001");
    }

    #[test]
    fn no_match_yields_empty() {
        assert!(matching_devices(LISTING, "Steering Wheel").is_empty());
    }

    #[test]
    fn declared_matches_dedups_by_bus_device() {
        // Both fragments hit the same physical Logitech receiver.
        let declared = vec!["Logitech".to_string(), "Unifying".to_string()];
        let found = declared_matches(LISTING, &declared);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn declared_matches_skips_empty_fragment() {
        let declared = vec![String::new()];
        assert!(declared_matches(LISTING, &declared).is_empty());
    }
}
