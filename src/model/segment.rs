//! Byte-range segment of a download.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::SegmentState;

/// A contiguous byte range `[range_start, range_end)` fetched by one worker into
/// its private temp file.
///
/// `range_end` is `None` only for the open-ended serial fallback used when the
/// server does not report a size; it is filled in once the body reaches EOF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Position in the merge order (0-based).
    pub index: u32,
    /// First byte of the range (inclusive).
    pub range_start: u64,
    /// End of the range (exclusive).
    pub range_end: Option<u64>,
    /// Bytes already written to `temp_file_path`.
    pub bytes_written: u64,
    /// Private temp file owned by this segment's worker until merge.
    pub temp_file_path: PathBuf,
    /// Current state.
    pub state: SegmentState,
}

impl Segment {
    /// Creates a pending segment with no bytes written.
    #[must_use]
    pub fn new(
        index: u32,
        range_start: u64,
        range_end: Option<u64>,
        temp_file_path: PathBuf,
    ) -> Self {
        Self {
            index,
            range_start,
            range_end,
            bytes_written: 0,
            temp_file_path,
            state: SegmentState::Pending,
        }
    }

    /// Number of bytes the segment covers, when known.
    #[must_use]
    pub fn len(&self) -> Option<u64> {
        self.range_end
            .map(|end| end.saturating_sub(self.range_start))
    }

    /// Bytes still missing, when the range end is known.
    #[must_use]
    pub fn remaining(&self) -> Option<u64> {
        self.len()
            .map(|len| len.saturating_sub(self.bytes_written))
    }

    /// Absolute offset the next request starts at.
    #[must_use]
    pub fn resume_offset(&self) -> u64 {
        self.range_start.saturating_add(self.bytes_written)
    }

    /// True once the state is Done.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == SegmentState::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_len_and_remaining() {
        let mut segment = Segment::new(1, 100, Some(250), PathBuf::from("/tmp/seg-1"));
        assert_eq!(segment.len(), Some(150));
        assert_eq!(segment.remaining(), Some(150));

        segment.bytes_written = 40;
        assert_eq!(segment.remaining(), Some(110));
        assert_eq!(segment.resume_offset(), 140);
    }

    #[test]
    fn test_open_ended_segment_has_unknown_len() {
        let segment = Segment::new(0, 0, None, PathBuf::from("/tmp/seg-0"));
        assert_eq!(segment.len(), None);
        assert_eq!(segment.remaining(), None);
        assert!(!segment.is_done());
    }
}
