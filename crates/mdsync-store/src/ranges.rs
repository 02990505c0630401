//! Range coalescing for backends where each round trip is expensive.
//!
//! Requested ranges are sorted and merged into spans when they overlap or
//! sit within `max_gap` bytes of each other. One request fetches a span;
//! the members are then cut back out of the span's bytes.

use mdsync_types::ByteRange;

use crate::error::{StoreError, StoreResult};

/// Gap below which two ranges share a request.
pub const DEFAULT_MAX_GAP: u64 = 4096;

/// A contiguous region covering one or more requested ranges.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Span {
    pub range: ByteRange,
    pub members: Vec<ByteRange>,
}

/// Merge `ranges` into spans ordered by offset.
pub fn coalesce(ranges: &[ByteRange], max_gap: u64) -> Vec<Span> {
    let mut sorted = ranges.to_vec();
    sorted.sort();

    let mut spans: Vec<Span> = Vec::new();
    for range in sorted {
        if let Some(last) = spans.last_mut() {
            let end = last.range.end();
            if range.offset <= end.saturating_add(max_gap) {
                let new_end = end.max(range.end());
                last.range = ByteRange::new(last.range.offset, new_end - last.range.offset);
                last.members.push(range);
                continue;
            }
        }
        spans.push(Span {
            range,
            members: vec![range],
        });
    }
    spans
}

/// Cut a span's member ranges out of the bytes fetched for it.
pub fn slice_span(span: &Span, data: &[u8]) -> StoreResult<Vec<(ByteRange, Vec<u8>)>> {
    span.members
        .iter()
        .map(|member| {
            let start = (member.offset - span.range.offset) as usize;
            let end = start + member.length as usize;
            let bytes = data.get(start..end).ok_or_else(|| {
                StoreError::Transport(format!(
                    "short read: span {} returned {} bytes, member {member} needs {end}",
                    span.range,
                    data.len()
                ))
            })?;
            Ok((*member, bytes.to_vec()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(offset: u64, length: u64) -> ByteRange {
        ByteRange::new(offset, length)
    }

    #[test]
    fn adjacent_ranges_merge() {
        let spans = coalesce(&[r(10, 5), r(0, 10)], 0);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].range, r(0, 15));
        assert_eq!(spans[0].members, vec![r(0, 10), r(10, 5)]);
    }

    #[test]
    fn distant_ranges_stay_apart() {
        let spans = coalesce(&[r(0, 4), r(100, 4)], 10);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].range, r(100, 4));
    }

    #[test]
    fn gap_within_limit_is_bridged() {
        let spans = coalesce(&[r(0, 4), r(10, 4)], 6);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].range, r(0, 14));
    }

    #[test]
    fn contained_range_does_not_shrink_span() {
        let spans = coalesce(&[r(0, 20), r(5, 2)], 0);
        assert_eq!(spans[0].range, r(0, 20));
    }

    #[test]
    fn slicing_recovers_members() {
        let spans = coalesce(&[r(2, 3), r(8, 2)], 10);
        let data = b"cdefghij";
        let parts = slice_span(&spans[0], data).unwrap();
        assert_eq!(parts[0], (r(2, 3), b"cde".to_vec()));
        assert_eq!(parts[1], (r(8, 2), b"ij".to_vec()));
    }

    #[test]
    fn short_span_data_is_an_error() {
        let spans = coalesce(&[r(0, 10)], 0);
        assert!(slice_span(&spans[0], b"abc").is_err());
    }

    #[test]
    fn empty_input() {
        assert!(coalesce(&[], 100).is_empty());
    }
}
