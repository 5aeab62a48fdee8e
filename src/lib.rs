// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate serde_derive;

mod codec;
pub mod conf;
mod download;
pub mod engine;
pub mod error;
mod filelist;
mod group;
mod hub;
mod peer;
mod proto;
mod search;
pub mod tth;

pub use download::{FailureCallback, QueueItem, SuccessCallback};
pub use engine::{Client, MainchatSink, PmSink};
pub use hub::UserInfo;
pub use proto::human_size;
pub use search::{FileType, ResultSink, SearchMode, SearchOptions, SearchRow, SizeLimit};

/// The type of a download part's index.
///
/// On the wire parts are only implied by their byte offsets, but in the source
/// code we use `usize` to be consistent with other index types in Rust.
pub type PartIndex = usize;

/// Returns the number of parts a file of the given size is divided into.
///
/// A zero-byte file has zero parts; it is written out directly without ever
/// touching the transfer queue's segment machinery.
pub(crate) fn part_count(size: u64, segment_size: u64) -> usize {
    debug_assert!(segment_size > 0);
    ((size + segment_size - 1) / segment_size) as usize
}

/// Returns the length of the part at the index for a file of the given size.
///
/// All parts are `segment_size` long except the last, which covers whatever
/// remains.
///
/// # Panics
///
/// Panics if the index multiplied by the segment size would exceed the file
/// size.
pub(crate) fn part_len(size: u64, segment_size: u64, index: PartIndex) -> u64 {
    let offset = index as u64 * segment_size;
    assert!(size > offset);
    std::cmp::min(size - offset, segment_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    // An arbitrary file size that is an exact multiple of the segment size.
    const SEGMENT_LEN: u64 = 10 * 1024 * 1024;
    const SEGMENT_MULTIPLE_SIZE: u64 = 2 * SEGMENT_LEN;

    // An arbitrary file size that is _not_ a multiple of the segment size and
    // the amount with which it overlaps the nearest exact multiple value.
    const OVERLAP: u64 = 5 * 1024 * 1024;
    const UNEVEN_SIZE: u64 = 2 * SEGMENT_LEN + OVERLAP;

    #[test]
    fn test_part_len() {
        assert_eq!(part_len(SEGMENT_MULTIPLE_SIZE, SEGMENT_LEN, 0), SEGMENT_LEN);
        assert_eq!(part_len(SEGMENT_MULTIPLE_SIZE, SEGMENT_LEN, 1), SEGMENT_LEN);

        assert_eq!(part_len(UNEVEN_SIZE, SEGMENT_LEN, 0), SEGMENT_LEN);
        assert_eq!(part_len(UNEVEN_SIZE, SEGMENT_LEN, 1), SEGMENT_LEN);
        assert_eq!(part_len(UNEVEN_SIZE, SEGMENT_LEN, 2), OVERLAP);
    }

    #[test]
    #[should_panic]
    fn test_part_len_invalid_index_panic() {
        part_len(SEGMENT_MULTIPLE_SIZE, SEGMENT_LEN, 2);
    }

    #[test]
    fn test_part_count() {
        assert_eq!(part_count(SEGMENT_MULTIPLE_SIZE, SEGMENT_LEN), 2);
        assert_eq!(part_count(UNEVEN_SIZE, SEGMENT_LEN), 3);
        assert_eq!(part_count(0, SEGMENT_LEN), 0);
        assert_eq!(part_count(1, SEGMENT_LEN), 1);
    }

    // The sum of all part lengths must equal the file size.
    #[test]
    fn test_part_lens_sum_to_size() {
        for &size in &[1, SEGMENT_LEN, SEGMENT_MULTIPLE_SIZE, UNEVEN_SIZE] {
            let total: u64 = (0..part_count(size, SEGMENT_LEN))
                .map(|i| part_len(size, SEGMENT_LEN, i))
                .sum();
            assert_eq!(total, size);
        }
    }
}
