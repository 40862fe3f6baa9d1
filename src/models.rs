//! Core data models for artifact transfers

use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// An inclusive byte range, as used by HTTP `Range` requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// Starting byte position (inclusive)
    pub start: u64,
    /// Ending byte position (inclusive)
    pub end: u64,
}

impl ByteRange {
    /// Create a new range; fails when `start > end`
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(TransferError::InvalidRange(format!(
                "start ({}) must be <= end ({})",
                start, end
            )));
        }
        Ok(ByteRange { start, end })
    }

    /// Number of bytes covered by this range
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false // an inclusive range always covers at least one byte
    }

    /// Render as a `Range` header value: `bytes=start-end`
    pub fn to_header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// One part of a file being downloaded in parallel.
///
/// Parts partition `[0, size)` contiguously: part numbers are 0-based with
/// no gaps, and consecutive ranges touch without overlapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilePart {
    pub part_number: u32,
    pub range: ByteRange,
}

impl FilePart {
    pub fn new(part_number: u32, range: ByteRange) -> Self {
        FilePart { part_number, range }
    }

    pub fn len(&self) -> u64 {
        self.range.len()
    }

    /// Human-readable description used in logs and part-failure errors
    pub fn description(&self) -> String {
        format!(
            "{} (bytes {}-{})",
            self.part_number, self.range.start, self.range.end
        )
    }
}

/// What the resolver learned about a source after following all redirects
#[derive(Debug, Clone)]
pub struct SourceInfo {
    /// The terminal, non-redirecting URL
    pub direct_url: String,
    /// Advertised size; some sources omit the length header
    pub content_length: Option<u64>,
    /// Storage-provided content digest, when advertised
    pub digest: Option<String>,
    /// Whether the server advertised `Accept-Ranges: bytes`
    pub accepts_ranges: bool,
}

/// Destination of one download request. Immutable once created.
#[derive(Debug, Clone)]
pub struct TransferTarget {
    pub path: PathBuf,
    pub expected_length: Option<u64>,
    pub digest: Option<String>,
}

impl TransferTarget {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TransferTarget {
            path: path.into(),
            expected_length: None,
            digest: None,
        }
    }

    pub fn with_expected_length(mut self, length: u64) -> Self {
        self.expected_length = Some(length);
        self
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }
}

/// One chunk of a multipart upload.
///
/// Part numbers are 1-based and contiguous, matching the multipart wire
/// protocol. The coordinator records the store's ETag per part number; a
/// part with a recorded ETag is never re-uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadPart {
    pub part_number: u32,
    pub range: ByteRange,
}

impl UploadPart {
    pub fn new(part_number: u32, range: ByteRange) -> Self {
        UploadPart { part_number, range }
    }

    pub fn len(&self) -> u64 {
        self.range.len()
    }
}
