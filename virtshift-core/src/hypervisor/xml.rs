//! Targeted scanning and rewriting of libvirt domain XML.
//!
//! Definition rewriting must preserve every byte it does not deliberately
//! change, so this module edits the document textually: it locates the
//! elements it owns (`<name>`, `<uuid>`, disk `<source file=…>`,
//! `<mac address=…>`) and leaves everything else untouched. No general XML
//! model is built.

use crate::error::{Result, ShiftError};

/// A disk as declared in a domain definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskXml {
    pub source_file: String,
    pub target_dev: String,
    pub driver_type: String,
}

/// A network interface as declared in a domain definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceXml {
    pub mac_address: String,
    pub network: String,
    pub target_dev: String,
}

/// Text content of the first `<tag>…</tag>` element.
pub fn element_text<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let mut search = 0;
    while let Some(rel) = xml[search..].find(&open) {
        let start = search + rel;
        let after = start + open.len();
        // Guard against matching a longer tag name (e.g. <name> vs <nameserver>).
        match xml[after..].chars().next() {
            Some('>') => {
                let content_start = after + 1;
                let end = xml[content_start..].find(&close)?;
                return Some(&xml[content_start..content_start + end]);
            }
            Some(c) if c.is_whitespace() => {
                let gt = xml[after..].find('>')?;
                let tag_end = after + gt;
                if xml[..tag_end].ends_with('/') {
                    return Some("");
                }
                let content_start = tag_end + 1;
                let end = xml[content_start..].find(&close)?;
                return Some(&xml[content_start..content_start + end]);
            }
            _ => {
                search = after;
            }
        }
    }
    None
}

/// Replace the text content of the first `<tag>…</tag>` element.
pub fn set_element_text(xml: &str, tag: &str, new_text: &str) -> Result<String> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let missing = || ShiftError::Hypervisor {
        operation: "rewrite definition".to_string(),
        reason: format!("definition has no <{}> element", tag),
    };

    let mut search = 0;
    loop {
        let rel = xml[search..].find(&open).ok_or_else(missing)?;
        let start = search + rel;
        let after = start + open.len();
        let boundary_ok =
            matches!(xml[after..].chars().next(), Some(c) if c == '>' || c.is_whitespace());
        if !boundary_ok {
            search = after;
            continue;
        }
        let gt = xml[after..].find('>').ok_or_else(missing)?;
        let content_start = after + gt + 1;
        let end = xml[content_start..].find(&close).ok_or_else(missing)?;
        let content_end = content_start + end;
        return Ok(format!("{}{}{}", &xml[..content_start], new_text, &xml[content_end..]));
    }
}

/// Value of `attr` inside a single element's tag text.
fn attr_value<'a>(tag_text: &'a str, attr: &str) -> Option<&'a str> {
    for quote in ['\'', '"'] {
        let needle = format!("{}={}", attr, quote);
        if let Some(pos) = tag_text.find(&needle) {
            let start = pos + needle.len();
            let end = tag_text[start..].find(quote)?;
            return Some(&tag_text[start..start + end]);
        }
    }
    None
}

/// Extract `<element attr…>` tag text for the first occurrence of `element`
/// inside `block`.
fn first_tag<'a>(block: &'a str, element: &str) -> Option<&'a str> {
    let open = format!("<{}", element);
    let mut search = 0;
    while let Some(rel) = block[search..].find(&open) {
        let start = search + rel;
        let after = start + open.len();
        match block[after..].chars().next() {
            Some(c) if c.is_whitespace() || c == '>' || c == '/' => {
                let end = block[after..].find('>')?;
                return Some(&block[start..after + end + 1]);
            }
            _ => search = after,
        }
    }
    None
}

/// All `<element>…</element>` blocks of the document, including
/// self-closing forms.
fn element_blocks<'a>(xml: &'a str, element: &str) -> Vec<&'a str> {
    let open = format!("<{}", element);
    let close = format!("</{}>", element);
    let mut blocks = Vec::new();
    let mut search = 0;

    while let Some(rel) = xml[search..].find(&open) {
        let start = search + rel;
        let after = start + open.len();
        let boundary_ok =
            matches!(xml[after..].chars().next(), Some(c) if c.is_whitespace() || c == '>' || c == '/');
        if !boundary_ok {
            search = after;
            continue;
        }
        let Some(gt) = xml[after..].find('>') else { break };
        let tag_end = after + gt + 1;
        if xml[..tag_end].ends_with("/>") {
            blocks.push(&xml[start..tag_end]);
            search = tag_end;
            continue;
        }
        let Some(close_rel) = xml[tag_end..].find(&close) else { break };
        let block_end = tag_end + close_rel + close.len();
        blocks.push(&xml[start..block_end]);
        search = block_end;
    }
    blocks
}

/// Strip `<backingStore>` subtrees so their `<source>` entries are not
/// mistaken for the disk's own.
fn without_backing_store(block: &str) -> String {
    let mut out = String::with_capacity(block.len());
    let mut rest = block;
    loop {
        match rest.find("<backingStore") {
            Some(start) => {
                out.push_str(&rest[..start]);
                let after = &rest[start..];
                if let Some(end) = after.find("</backingStore>") {
                    rest = &after[end + "</backingStore>".len()..];
                } else if let Some(end) = after.find("/>") {
                    rest = &after[end + 2..];
                } else {
                    return out;
                }
            }
            None => {
                out.push_str(rest);
                return out;
            }
        }
    }
}

/// File-backed disks declared in the definition, in document order.
pub fn disks(xml: &str) -> Vec<DiskXml> {
    element_blocks(xml, "disk")
        .into_iter()
        .filter_map(|block| {
            let tag = first_tag(block, "disk")?;
            if attr_value(tag, "type") != Some("file") {
                return None;
            }
            if attr_value(tag, "device").is_some_and(|d| d == "cdrom") {
                return None;
            }
            let body = without_backing_store(block);
            let source_file = first_tag(&body, "source")
                .and_then(|t| attr_value(t, "file"))
                .map(str::to_string)?;
            let target_dev = first_tag(&body, "target")
                .and_then(|t| attr_value(t, "dev"))
                .unwrap_or_default()
                .to_string();
            let driver_type = first_tag(&body, "driver")
                .and_then(|t| attr_value(t, "type"))
                .unwrap_or("raw")
                .to_string();
            Some(DiskXml { source_file, target_dev, driver_type })
        })
        .collect()
}

/// Network interfaces declared in the definition, in document order.
pub fn interfaces(xml: &str) -> Vec<InterfaceXml> {
    element_blocks(xml, "interface")
        .into_iter()
        .filter_map(|block| {
            let mac_address =
                first_tag(block, "mac").and_then(|t| attr_value(t, "address")).map(str::to_string)?;
            let network = first_tag(block, "source")
                .and_then(|t| attr_value(t, "network").or_else(|| attr_value(t, "bridge")))
                .unwrap_or_default()
                .to_string();
            let target_dev = first_tag(block, "target")
                .and_then(|t| attr_value(t, "dev"))
                .unwrap_or_default()
                .to_string();
            Some(InterfaceXml { mac_address, network, target_dev })
        })
        .collect()
}

/// Memory in MiB from `<memory unit='…'>N</memory>`.
pub fn memory_mib(xml: &str) -> Option<u64> {
    let text = element_text(xml, "memory")?;
    let value: u64 = text.trim().parse().ok()?;
    let open = xml.find("<memory")?;
    let gt = xml[open..].find('>')?;
    let unit = attr_value(&xml[open..open + gt + 1], "unit").unwrap_or("KiB");
    let bytes = match unit {
        "b" | "bytes" => value,
        "KB" => value * 1000,
        "KiB" | "k" => value * 1024,
        "MB" => value * 1000 * 1000,
        "MiB" | "M" => value * 1024 * 1024,
        "GB" => value * 1000 * 1000 * 1000,
        "GiB" | "G" => value * 1024 * 1024 * 1024,
        _ => value * 1024,
    };
    Some(bytes / (1024 * 1024))
}

/// vCPU count from `<vcpu …>N</vcpu>`.
pub fn vcpus(xml: &str) -> Option<u32> {
    element_text(xml, "vcpu").and_then(|t| t.trim().parse().ok())
}

/// Replace one disk source path. Both quote styles are handled; the old
/// value must match exactly.
pub fn replace_source_file(xml: &str, old: &str, new: &str) -> String {
    xml.replace(&format!("file='{}'", old), &format!("file='{}'", new))
        .replace(&format!("file=\"{}\"", old), &format!("file=\"{}\"", new))
}

/// Rename a logical network (or bridge) in every interface source.
pub fn replace_network(xml: &str, old: &str, new: &str) -> String {
    xml.replace(&format!("network='{}'", old), &format!("network='{}'", new))
        .replace(&format!("network=\"{}\"", old), &format!("network=\"{}\"", new))
        .replace(&format!("bridge='{}'", old), &format!("bridge='{}'", new))
        .replace(&format!("bridge=\"{}\"", old), &format!("bridge=\"{}\"", new))
}

/// Generate a random locally-administered MAC in the KVM prefix.
pub fn random_mac() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        rng.random_range(0..=255u16),
        rng.random_range(0..=255u16),
        rng.random_range(0..=255u16)
    )
}

/// Replace every `<mac address=…>` value with a fresh random MAC. Returns
/// the rewritten document and the new addresses in document order.
pub fn regenerate_macs(xml: &str) -> (String, Vec<String>) {
    let mut out = String::with_capacity(xml.len());
    let mut new_macs = Vec::new();
    let mut rest = xml;

    while let Some(start) = rest.find("<mac") {
        let after = &rest[start + 4..];
        let boundary_ok = matches!(after.chars().next(), Some(c) if c.is_whitespace() || c == '/');
        let Some(gt) = after.find('>') else { break };
        if !boundary_ok {
            out.push_str(&rest[..start + 4]);
            rest = after;
            continue;
        }
        let tag = &rest[start..start + 4 + gt + 1];
        out.push_str(&rest[..start]);
        match attr_value(tag, "address") {
            Some(old) => {
                let mut fresh = random_mac();
                // The clone must not share any MAC with the source.
                while fresh.eq_ignore_ascii_case(old) {
                    fresh = random_mac();
                }
                out.push_str(&tag.replace(old, &fresh));
                new_macs.push(fresh);
            }
            None => out.push_str(tag),
        }
        rest = &rest[start + 4 + gt + 1..];
    }
    out.push_str(rest);
    (out, new_macs)
}
