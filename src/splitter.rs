//! Splitting files into byte-range parts
//!
//! The download split sizes parts from configuration and absorbs a residual
//! smaller than the hard lower bound into the last part, so no connection is
//! ever spent on a tail of a few bytes. The upload split is the plain
//! fixed-size variant used by multipart uploads: the remainder simply
//! becomes the last part.

use crate::config::{TransferConfig, MIN_PART_SIZE_LOWER_BOUND};
use crate::models::{ByteRange, FilePart, UploadPart};
use tracing::debug;

/// Outcome of the download-eligibility decision
#[derive(Debug, Clone)]
pub struct SplitReport {
    pub splittable: bool,
    /// Human-readable reason when not splittable
    pub reason: Option<String>,
}

impl SplitReport {
    fn splittable() -> Self {
        SplitReport {
            splittable: true,
            reason: None,
        }
    }

    fn unsplittable(reason: impl Into<String>) -> Self {
        SplitReport {
            splittable: false,
            reason: Some(reason.into()),
        }
    }
}

/// Computes file parts from size and configuration
pub struct FileSplitter {
    config: TransferConfig,
}

impl FileSplitter {
    pub fn new(config: TransferConfig) -> Self {
        FileSplitter { config }
    }

    /// Decide whether a file is eligible for parallel download.
    ///
    /// Not eligible when the size is unknown or non-positive, the server
    /// does not advertise byte-range support, parallelism is disabled or
    /// capped at one thread, the file exceeds the configured maximum, or
    /// the part count would overflow a 32-bit part number.
    pub fn check_splittability(
        &self,
        content_length: Option<u64>,
        accepts_ranges: bool,
    ) -> SplitReport {
        let size = match content_length {
            Some(size) if size > 0 => size,
            _ => return SplitReport::unsplittable("file size is unknown or not positive"),
        };

        if !self.config.parallel_enabled && !self.config.parallel_forced {
            return SplitReport::unsplittable("parallel download is disabled");
        }

        if !accepts_ranges {
            return SplitReport::unsplittable("server does not accept byte ranges");
        }

        if self.config.max_threads == 1 {
            return SplitReport::unsplittable("maximum number of threads is 1");
        }

        if size > self.config.max_file_size_bytes() {
            return SplitReport::unsplittable(format!(
                "file size {} exceeds the maximum transferable size {}",
                size,
                self.config.max_file_size_bytes()
            ));
        }

        let part_size = self.config.min_part_size_bytes();
        if size / part_size > u32::MAX as u64 {
            return SplitReport::unsplittable("part count would not fit a 32-bit part number");
        }

        SplitReport::splittable()
    }

    /// Split a file of `size` bytes into download parts.
    ///
    /// Parts partition `[0, size)` with contiguous 0-based numbering. A
    /// residual smaller than the hard lower bound extends the last full part
    /// instead of becoming its own part.
    pub fn split_download(&self, size: u64) -> Vec<FilePart> {
        assert!(size > 0, "file size must be positive");

        let part_size = self.config.min_part_size_bytes();
        if size < part_size {
            return vec![FilePart::new(0, byte_range(0, size - 1))];
        }

        let full_parts = size / part_size;
        let residual = size % part_size;
        let extend_last = residual > 0 && residual < MIN_PART_SIZE_LOWER_BOUND;

        let mut parts = Vec::with_capacity(full_parts as usize + 1);
        for part_number in 0..full_parts {
            let start = part_number * part_size;
            let is_last_full = part_number == full_parts - 1;
            let end = if is_last_full && (extend_last || residual == 0) {
                size - 1
            } else {
                start + part_size - 1
            };
            parts.push(FilePart::new(part_number as u32, byte_range(start, end)));
        }

        if residual > 0 && !extend_last {
            let start = full_parts * part_size;
            parts.push(FilePart::new(full_parts as u32, byte_range(start, size - 1)));
        }

        debug!(
            size,
            part_size,
            parts = parts.len(),
            "split file into download parts"
        );
        parts
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }
}

/// Split a file into fixed-size upload chunks with 1-based part numbers.
/// The remainder becomes the last part as-is.
pub fn split_upload(size: u64, chunk_size: u64) -> Vec<UploadPart> {
    assert!(size > 0, "file size must be positive");
    assert!(chunk_size > 0, "chunk size must be positive");

    let n_parts = size.div_ceil(chunk_size);
    let mut parts = Vec::with_capacity(n_parts as usize);
    for index in 0..n_parts {
        let start = index * chunk_size;
        let end = (start + chunk_size - 1).min(size - 1);
        parts.push(UploadPart::new(index as u32 + 1, byte_range(start, end)));
    }
    parts
}

// start <= end holds by construction for every computed range
fn byte_range(start: u64, end: u64) -> ByteRange {
    ByteRange { start, end }
}
