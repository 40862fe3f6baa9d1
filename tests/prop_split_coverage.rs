//! Property tests for the file splitter: parts must always partition the
//! file exactly, whatever the size and configuration.

use artifact_transfer::{split_upload, FileSplitter, TransferConfig};
use proptest::prelude::*;

const MB: u64 = 1024 * 1024;

fn splitter(min_part_size_mb: u64) -> FileSplitter {
    FileSplitter::new(TransferConfig {
        min_part_size_mb,
        ..TransferConfig::default()
    })
}

proptest! {
    #[test]
    fn download_parts_partition_the_file(
        size in 1u64..20_000_000_000,
        min_part_size_mb in 1u64..2048,
    ) {
        let parts = splitter(min_part_size_mb).split_download(size);

        prop_assert!(!parts.is_empty());
        prop_assert_eq!(parts[0].range.start, 0);
        prop_assert_eq!(parts.last().unwrap().range.end, size - 1);

        for (i, window) in parts.windows(2).enumerate() {
            // contiguous ranges, contiguous numbering
            prop_assert_eq!(window[0].range.end + 1, window[1].range.start);
            prop_assert_eq!(window[0].part_number, i as u32);
            prop_assert_eq!(window[1].part_number, i as u32 + 1);
        }

        let total: u64 = parts.iter().map(|p| p.len()).sum();
        prop_assert_eq!(total, size);
    }

    #[test]
    fn download_parts_never_undersized(
        size in 1u64..20_000_000_000,
        min_part_size_mb in 1u64..2048,
    ) {
        let parts = splitter(min_part_size_mb).split_download(size);
        let part_size = min_part_size_mb * MB;

        if parts.len() > 1 {
            for part in &parts {
                // the residual rule guarantees no part below 1 MB, and only
                // the trailing part may be below the configured part size
                prop_assert!(part.len() >= MB);
            }
            for part in &parts[..parts.len() - 1] {
                prop_assert!(part.len() >= part_size);
            }
        }
    }

    #[test]
    fn upload_parts_partition_the_file(
        size in 1u64..10_000_000_000,
        chunk_size in (5 * MB)..100_000_000,
    ) {
        let parts = split_upload(size, chunk_size);

        prop_assert_eq!(parts[0].part_number, 1);
        prop_assert_eq!(parts[0].range.start, 0);
        prop_assert_eq!(parts.last().unwrap().range.end, size - 1);

        for (i, window) in parts.windows(2).enumerate() {
            prop_assert_eq!(window[0].range.end + 1, window[1].range.start);
            prop_assert_eq!(window[0].part_number, i as u32 + 1);
            // all parts except the last are exactly chunk-sized
            prop_assert_eq!(window[0].len(), chunk_size);
        }

        let total: u64 = parts.iter().map(|p| p.len()).sum();
        prop_assert_eq!(total, size);
    }

    #[test]
    fn small_files_are_one_download_part(size in 1u64..MB) {
        let parts = splitter(1).split_download(size);
        prop_assert_eq!(parts.len(), 1);
        prop_assert_eq!(parts[0].len(), size);
    }
}
