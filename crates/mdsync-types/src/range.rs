use std::fmt;

use serde::{Deserialize, Serialize};

/// Location of a record inside the data log: `length` bytes at `offset`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub const fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// One past the last byte covered.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.offset, self.length)
    }
}

impl From<(u64, u64)> for ByteRange {
    fn from((offset, length): (u64, u64)) -> Self {
        Self { offset, length }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_and_empty() {
        let r = ByteRange::new(10, 5);
        assert_eq!(r.end(), 15);
        assert!(!r.is_empty());
        assert!(ByteRange::new(7, 0).is_empty());
    }

    #[test]
    fn ordering_is_by_offset_first() {
        let mut ranges = vec![ByteRange::new(9, 1), ByteRange::new(0, 4), ByteRange::new(4, 2)];
        ranges.sort();
        assert_eq!(ranges[0].offset, 0);
        assert_eq!(ranges[2].offset, 9);
    }

    #[test]
    fn display() {
        assert_eq!(ByteRange::from((3, 4)).to_string(), "3+4");
    }
}
