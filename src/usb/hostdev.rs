//! USB passthrough entries in a machine's device definition XML.
//!
//! The definition document is the one shared mutable resource of the
//! reconciler: every mutating operation reads the whole current document,
//! edits it, and writes it back wholesale. The functions here are the pure
//! document half of that — parsing and rewriting strings, no I/O.
//!
//! Invariant maintained throughout: at most one `<hostdev>` entry per
//! physical bus+device pair.

use super::device::UsbDevice;

const OPEN_TAG: &str = "<hostdev";
const CLOSE_TAG: &str = "</hostdev>";

/// The XML fragment passed to `attach-device` for one physical device.
pub fn attach_fragment(dev: &UsbDevice) -> String {
    format!(
        "<hostdev mode='subsystem' type='usb' managed='yes'>\n\
         \x20 <source>\n\
         \x20   <vendor id='0x{}'/>\n\
         \x20   <product id='0x{}'/>\n\
         \x20   <address bus='{}' device='{}'/>\n\
         \x20 </source>\n\
         </hostdev>\n",
        dev.vendor_id, dev.product_id, dev.bus, dev.device
    )
}

/// The XML fragment passed to `detach-device`. Detaching matches on
/// vendor+product only — after a physical unplug the bus/device pair in the
/// definition no longer corresponds to anything enumerable.
pub fn detach_fragment(vendor_id: &str, product_id: &str) -> String {
    format!(
        "<hostdev mode='subsystem' type='usb' managed='yes'>\n\
         \x20 <source>\n\
         \x20   <vendor id='0x{vendor_id}'/>\n\
         \x20   <product id='0x{product_id}'/>\n\
         \x20 </source>\n\
         </hostdev>\n"
    )
}

/// Is this `<hostdev …>` opening tag a managed USB passthrough entry?
fn is_usb_hostdev(tag: &str) -> bool {
    tag.contains("type='usb'") || tag.contains("type=\"usb\"")
}

/// Byte ranges of every USB `<hostdev>…</hostdev>` block in `doc`.
fn usb_hostdev_ranges(doc: &str) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut from = 0;
    while let Some(rel) = doc[from..].find(OPEN_TAG) {
        let start = from + rel;
        let Some(tag_end_rel) = doc[start..].find('>') else { break };
        let tag = &doc[start..start + tag_end_rel + 1];
        let Some(close_rel) = doc[start..].find(CLOSE_TAG) else { break };
        let end = start + close_rel + CLOSE_TAG.len();
        if is_usb_hostdev(tag) {
            ranges.push((start, end));
        }
        from = end;
    }
    ranges
}

/// Remove every USB passthrough entry from the document — a full wipe, not
/// a diff.
pub fn strip_usb_hostdevs(doc: &str) -> String {
    let mut out = String::with_capacity(doc.len());
    let mut cursor = 0;
    for (start, end) in usb_hostdev_ranges(doc) {
        out.push_str(&doc[cursor..start]);
        cursor = end;
    }
    out.push_str(&doc[cursor..]);
    out
}

/// Number of USB passthrough entries currently in the document.
pub fn count_usb_hostdevs(doc: &str) -> usize {
    usb_hostdev_ranges(doc).len()
}

/// Whether the document already carries an entry for this physical
/// bus+device pair.
pub fn contains_address(doc: &str, bus: &str, device: &str) -> bool {
    let single = format!("<address bus='{bus}' device='{device}'/>");
    let double = format!("<address bus=\"{bus}\" device=\"{device}\"/>");
    doc.contains(&single) || doc.contains(&double)
}

/// Vendor/product id pairs of every attached USB passthrough entry.
pub fn attached_ids(doc: &str) -> Vec<(String, String)> {
    usb_hostdev_ranges(doc)
        .into_iter()
        .filter_map(|(start, end)| {
            let block = &doc[start..end];
            let vendor = attr_value(block, "<vendor id='0x", "'")?;
            let product = attr_value(block, "<product id='0x", "'")?;
            Some((vendor, product))
        })
        .collect()
}

fn attr_value(block: &str, prefix: &str, terminator: &str) -> Option<String> {
    let start = block.find(prefix)? + prefix.len();
    let len = block[start..].find(terminator)?;
    Some(block[start..start + len].to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(bus: &str, device: &str) -> UsbDevice {
        UsbDevice {
            vendor_id: "054c".into(),
            product_id: "0ce6".into(),
            bus: bus.into(),
            device: device.into(),
            product: "Sony Corp. Wireless Controller".into(),
        }
    }

    fn doc_with(entries: &[UsbDevice]) -> String {
        let mut body = String::from("<domain><devices>\n<disk/>\n");
        for e in entries {
            body.push_str(&attach_fragment(e));
        }
        body.push_str("</devices></domain>");
        body
    }

    #[test]
    fn strip_removes_every_usb_entry() {
        let doc = doc_with(&[dev("003", "12"), dev("001", "4")]);
        assert_eq!(count_usb_hostdevs(&doc), 2);

        let wiped = strip_usb_hostdevs(&doc);
        assert_eq!(count_usb_hostdevs(&wiped), 0);
        assert!(wiped.contains("<disk/>"), "non-USB devices survive the wipe");
    }

    #[test]
    fn strip_is_idempotent() {
        let doc = doc_with(&[dev("003", "12")]);
        let once = strip_usb_hostdevs(&doc);
        let twice = strip_usb_hostdevs(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn strip_leaves_non_usb_hostdevs_alone() {
        let doc = "<devices>\
            <hostdev mode='subsystem' type='pci' managed='yes'><source/></hostdev>\
            </devices>";
        let wiped = strip_usb_hostdevs(doc);
        assert_eq!(wiped, doc, "PCI passthrough (the GPU itself) must survive");
    }

    #[test]
    fn contains_address_distinguishes_pairs() {
        let doc = doc_with(&[dev("003", "12")]);
        assert!(contains_address(&doc, "003", "12"));
        assert!(!contains_address(&doc, "003", "7"));
        assert!(!contains_address(&doc, "001", "12"));
    }

    #[test]
    fn attached_ids_reads_all_entries() {
        let mut second = dev("001", "4");
        second.vendor_id = "046d".into();
        second.product_id = "c52b".into();
        let doc = doc_with(&[dev("003", "12"), second]);

        let ids = attached_ids(&doc);
        assert_eq!(
            ids,
            vec![
                ("054c".to_string(), "0ce6".to_string()),
                ("046d".to_string(), "c52b".to_string()),
            ]
        );
    }

    #[test]
    fn attach_fragment_carries_source_address() {
        let frag = attach_fragment(&dev("003", "12"));
        assert!(frag.contains("<vendor id='0x054c'/>"));
        assert!(frag.contains("<product id='0x0ce6'/>"));
        assert!(frag.contains("<address bus='003' device='12'/>"));
    }

    #[test]
    fn detach_fragment_has_no_address() {
        let frag = detach_fragment("054c", "0ce6");
        assert!(frag.contains("<vendor id='0x054c'/>"));
        assert!(!frag.contains("<address"), "detach matches by ids only");
    }
}
