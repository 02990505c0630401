use std::collections::BTreeMap;
use std::io::Read;

use mdsync_types::ByteRange;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::ranges::{self, Span, DEFAULT_MAX_GAP};
use crate::traits::{RangeStream, ReadFs};

/// Read-only store published as static files under an HTTP(S) base URL.
///
/// Ranged reads are coalesced into as few `Range` requests as possible.
/// Servers that ignore `Range` and answer `200` are handled by slicing the
/// full body.
#[derive(Clone)]
pub struct HttpFs {
    agent: ureq::Agent,
    base: String,
}

impl HttpFs {
    pub fn new(agent: ureq::Agent, base: impl Into<String>) -> Self {
        let mut base = base.into();
        if !base.ends_with('/') {
            base.push('/');
        }
        Self { agent, base }
    }

    pub fn url(&self, name: &str) -> String {
        format!("{}{name}", self.base)
    }

    fn get(&self, name: &str, range: Option<ByteRange>) -> StoreResult<Option<(u16, Vec<u8>)>> {
        let url = self.url(name);
        let mut request = self.agent.get(&url);
        if let Some(range) = range {
            request = request.set("Range", &range_header(range));
        }
        debug!(%url, ?range, "http get");
        let response = match request.call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(ureq::Error::Status(status, _)) => {
                return Err(StoreError::Transport(format!("GET {url}: HTTP {status}")))
            }
            Err(ureq::Error::Transport(e)) => {
                return Err(StoreError::Transport(format!("GET {url}: {e}")))
            }
        };
        let status = response.status();
        let mut body = Vec::new();
        response.into_reader().read_to_end(&mut body)?;
        Ok(Some((status, body)))
    }

    fn fetch_span(&self, name: &str, span: &Span) -> StoreResult<Vec<(ByteRange, Vec<u8>)>> {
        let (status, body) = self
            .get(name, Some(span.range))?
            .ok_or_else(|| StoreError::Transport(format!("{} vanished", self.url(name))))?;
        let data = if status == 206 {
            body
        } else {
            let start = (span.range.offset as usize).min(body.len());
            let end = (span.range.end() as usize).min(body.len());
            body[start..end].to_vec()
        };
        ranges::slice_span(span, &data)
    }
}

/// `Range` header value for one byte range (inclusive end).
pub fn range_header(range: ByteRange) -> String {
    format!("bytes={}-{}", range.offset, range.end().saturating_sub(1))
}

impl ReadFs for HttpFs {
    fn fetch(&self, names: &[String]) -> StoreResult<BTreeMap<String, Option<Vec<u8>>>> {
        names
            .iter()
            .map(|name| Ok((name.clone(), self.get(name, None)?.map(|(_, body)| body))))
            .collect()
    }

    fn fetch_ranges<'a>(&'a self, name: &str, ranges: &[ByteRange]) -> StoreResult<RangeStream<'a>> {
        let spans = ranges::coalesce(ranges, DEFAULT_MAX_GAP);
        debug!(name, ranges = ranges.len(), requests = spans.len(), "coalesced ranged read");
        let name = name.to_string();
        Ok(Box::new(
            spans
                .into_iter()
                .flat_map(move |span| match self.fetch_span(&name, &span) {
                    Ok(parts) => parts.into_iter().map(Ok).collect::<Vec<_>>(),
                    Err(e) => vec![Err(e)],
                }),
        ))
    }

    fn exists(&self, name: &str) -> StoreResult<bool> {
        let url = self.url(name);
        match self.agent.head(&url).call() {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(ureq::Error::Status(status, _)) => {
                Err(StoreError::Transport(format!("HEAD {url}: HTTP {status}")))
            }
            Err(ureq::Error::Transport(e)) => Err(StoreError::Transport(format!("HEAD {url}: {e}"))),
        }
    }

    fn describe(&self) -> String {
        self.base.clone()
    }
}

impl std::fmt::Debug for HttpFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFs").field("base", &self.base).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_gets_trailing_slash() {
        let fs = HttpFs::new(ureq::Agent::new(), "https://example.org/repo");
        assert_eq!(fs.url("HASHES_"), "https://example.org/repo/HASHES_");
        let fs = HttpFs::new(ureq::Agent::new(), "https://example.org/repo/");
        assert_eq!(fs.url("DATA"), "https://example.org/repo/DATA");
    }

    #[test]
    fn range_header_is_inclusive() {
        assert_eq!(range_header(ByteRange::new(0, 10)), "bytes=0-9");
        assert_eq!(range_header(ByteRange::new(100, 1)), "bytes=100-100");
    }
}
