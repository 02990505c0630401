//! Text encodings used on the byte-store wire.
//!
//! Parameters travel in the query string, payloads in the body:
//!
//! ```text
//! parts=<off>:<len>,<off>:<len>,...     ranged get
//! names=<a>,<b>,...  sizes=<n>,<n>,...  putmany / getmany
//! size: <n>                             stat response line
//! ```

use mdsync_types::ByteRange;

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::FileStat;

/// Characters that would break the comma-separated parameter lists.
pub fn validate_name(name: &str) -> ProtocolResult<()> {
    if name.is_empty() || name.contains([',', '\n', '\r']) {
        return Err(ProtocolError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub fn encode_parts(ranges: &[ByteRange]) -> String {
    ranges
        .iter()
        .map(|r| format!("{}:{}", r.offset, r.length))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn parse_parts(s: &str) -> ProtocolResult<Vec<ByteRange>> {
    if s.is_empty() {
        return Ok(Vec::new());
    }
    s.split(',')
        .map(|part| {
            let (off, len) = part
                .split_once(':')
                .ok_or_else(|| ProtocolError::Malformed(format!("bad range {part:?}")))?;
            let offset = off
                .parse()
                .map_err(|_| ProtocolError::Malformed(format!("bad offset {off:?}")))?;
            let length = len
                .parse()
                .map_err(|_| ProtocolError::Malformed(format!("bad length {len:?}")))?;
            Ok(ByteRange::new(offset, length))
        })
        .collect()
}

pub fn encode_sizes(sizes: &[i64]) -> String {
    sizes
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub fn parse_sizes(s: &str) -> ProtocolResult<Vec<i64>> {
    if s.trim().is_empty() {
        return Ok(Vec::new());
    }
    s.split(',')
        .map(|v| {
            v.trim()
                .parse::<i64>()
                .map_err(|_| ProtocolError::Framing(format!("bad size entry {v:?}")))
        })
        .collect()
}

pub fn encode_names(names: &[String]) -> ProtocolResult<String> {
    for name in names {
        validate_name(name)?;
    }
    Ok(names.join(","))
}

pub fn parse_names(s: &str) -> Vec<String> {
    if s.is_empty() {
        return Vec::new();
    }
    s.split(',').map(str::to_string).collect()
}

/// Concatenate files for a `putmany` body. Returns `(sizes, blob)`.
pub fn pack_many(files: &[(String, Vec<u8>)]) -> (Vec<i64>, Vec<u8>) {
    let total = files.iter().map(|(_, d)| d.len()).sum();
    let mut blob = Vec::with_capacity(total);
    let mut sizes = Vec::with_capacity(files.len());
    for (_, data) in files {
        sizes.push(data.len() as i64);
        blob.extend_from_slice(data);
    }
    (sizes, blob)
}

/// Slice a `getmany` blob according to its side-channel size list.
///
/// The sum of non-missing sizes must equal the blob length exactly, and the
/// list must have one entry per requested name; anything else is a
/// [`ProtocolError::Framing`].
pub fn split_many(expected: usize, blob: &[u8], sizes: &[i64]) -> ProtocolResult<Vec<Option<Vec<u8>>>> {
    if sizes.len() != expected {
        return Err(ProtocolError::Framing(format!(
            "expected {expected} size entries, got {}",
            sizes.len()
        )));
    }
    let mut declared: u64 = 0;
    for &size in sizes {
        if size < -1 {
            return Err(ProtocolError::Framing(format!("negative size {size}")));
        }
        if size > 0 {
            declared = declared
                .checked_add(size as u64)
                .ok_or_else(|| ProtocolError::Framing("declared sizes overflow".into()))?;
        }
    }
    if declared != blob.len() as u64 {
        return Err(ProtocolError::Framing(format!(
            "declared {declared} bytes, body has {}",
            blob.len()
        )));
    }

    let mut pos = 0usize;
    let mut out = Vec::with_capacity(sizes.len());
    for &size in sizes {
        if size < 0 {
            out.push(None);
        } else {
            let end = pos + size as usize;
            out.push(Some(blob[pos..end].to_vec()));
            pos = end;
        }
    }
    Ok(out)
}

/// Slice a ranged-get body back into its requested ranges.
pub fn split_parts(ranges: &[ByteRange], blob: &[u8]) -> ProtocolResult<Vec<(ByteRange, Vec<u8>)>> {
    let declared = ranges
        .iter()
        .try_fold(0u64, |acc, r| acc.checked_add(r.length))
        .ok_or_else(|| ProtocolError::Framing("requested range lengths overflow".into()))?;
    if declared != blob.len() as u64 {
        return Err(ProtocolError::Framing(format!(
            "requested {declared} bytes of ranges, body has {}",
            blob.len()
        )));
    }
    let mut pos = 0usize;
    Ok(ranges
        .iter()
        .map(|r| {
            let end = pos + r.length as usize;
            let data = blob[pos..end].to_vec();
            pos = end;
            (*r, data)
        })
        .collect())
}

/// Parse a `stat` response body: `key: value` lines, of which `size` is
/// required.
pub fn parse_stat(body: &[u8]) -> ProtocolResult<FileStat> {
    let text = String::from_utf8_lossy(body);
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim() == "size" {
            let size = value
                .trim()
                .parse()
                .map_err(|_| ProtocolError::Malformed(format!("bad stat size {value:?}")))?;
            return Ok(FileStat { size });
        }
    }
    Err(ProtocolError::Malformed(format!(
        "stat response without size: {text:?}"
    )))
}

pub fn encode_stat(stat: &FileStat) -> Vec<u8> {
    format!("size: {}\n", stat.size).into_bytes()
}

/// Parse a `list_files` body: one name per line.
pub fn parse_list(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body)
        .lines()
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
