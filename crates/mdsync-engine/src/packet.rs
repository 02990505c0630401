//! Structural checks on packets handed out by the engine.
//!
//! A packet looks like `[<kind> <args>]\n<body>\n[end]\n`. The engine
//! reports failures in-band as text starting with `error: `, so every
//! packet is checked before it is stored.

use crate::error::{EngineError, EngineResult};

const END_MARKER: &str = "[end]";

fn preview(data: &[u8]) -> String {
    let text = String::from_utf8_lossy(data);
    let mut preview: String = text.chars().take(60).collect();
    if text.chars().count() > 60 {
        preview.push_str("...");
    }
    preview
}

/// Check that `data` is a well-formed packet of the given kind.
pub fn validate_packet(data: &[u8], kind: &str) -> EngineResult<()> {
    let text = String::from_utf8_lossy(data);
    let well_formed = !text.starts_with("error: ")
        && text.starts_with(&format!("[{kind} "))
        && text.trim_end().ends_with(END_MARKER);
    if well_formed {
        Ok(())
    } else {
        Err(EngineError::PacketValidation {
            expected: kind.to_string(),
            found: preview(data),
        })
    }
}

/// Split concatenated packets after each `[end]` line.
pub fn split_packets(data: &[u8]) -> Vec<Vec<u8>> {
    let mut packets = Vec::new();
    let mut current = Vec::new();
    for line in data.split_inclusive(|b| *b == b'\n') {
        current.extend_from_slice(line);
        if line.trim_ascii() == END_MARKER.as_bytes() {
            packets.push(std::mem::take(&mut current));
        }
    }
    if current.iter().any(|b| !b.is_ascii_whitespace()) {
        packets.push(current);
    }
    packets
}

/// Header fields of a revision cert packet.
///
/// ```text
/// [rcert <revision>
///        <cert name>
///        <value>
///        <signing key>]
/// <signature>
/// [end]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertHeader {
    pub revision: String,
    pub name: String,
    pub key: String,
}

impl CertHeader {
    pub fn parse(packet: &[u8]) -> EngineResult<Self> {
        let text = String::from_utf8_lossy(packet);
        let mut lines = text.lines().map(str::trim);
        let header = (|| {
            let revision = lines.next()?.strip_prefix("[rcert ")?.trim();
            let name = lines.next()?;
            let _value = lines.next()?;
            let key = lines.next()?.trim_end_matches(']').trim();
            if revision.is_empty() || name.is_empty() || key.is_empty() {
                return None;
            }
            Some(CertHeader {
                revision: revision.to_string(),
                name: name.to_string(),
                key: key.to_string(),
            })
        })();
        header.ok_or_else(|| EngineError::PacketValidation {
            expected: "rcert".into(),
            found: preview(packet),
        })
    }
}
