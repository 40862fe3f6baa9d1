//! Configuration for the transfer engine
//!
//! Every numeric option has a documented default and bounds. Out-of-bounds
//! values do not fail the transfer: they are replaced by the default with a
//! warning, so a misconfigured build keeps working.

use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * 1024 * 1024;

/// Hard lower bound for the download part size; parts below this are never
/// worth a separate connection
pub const MIN_PART_SIZE_LOWER_BOUND: u64 = MB;

/// Multipart uploads require parts of at least 5 MB (store protocol minimum)
pub const MIN_UPLOAD_PART_SIZE: u64 = 5 * MB;

/// Download-side configuration. Immutable per transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Whether parallel download is enabled at all (default: true)
    #[serde(default = "default_true")]
    pub parallel_enabled: bool,

    /// Force parallel download even for storages that normally opt out
    /// (default: false)
    #[serde(default)]
    pub parallel_forced: bool,

    /// Maximum number of concurrent part transfers (default: 5, max: 1000)
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,

    /// Minimum part size in megabytes (default: 100, min: 1)
    #[serde(default = "default_min_part_size_mb")]
    pub min_part_size_mb: u64,

    /// Files larger than this are not downloaded in parallel (default: 1024 GB)
    #[serde(default = "default_max_file_size_gb")]
    pub max_file_size_gb: u64,

    /// Copy buffer size in kilobytes (default: 10, range: 1..=1048576).
    /// Cancellation and sibling-failure checks happen once per buffer, so
    /// this also bounds how quickly an in-flight part stops.
    #[serde(default = "default_buffer_size_kb")]
    pub buffer_size_kb: u64,

    /// Connection pool limit (default: 100, range: 1..=100000)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Per-host connection limit (default: 100, range: 1..=100000)
    #[serde(default = "default_max_connections")]
    pub max_connections_per_host: usize,

    /// Maximum redirect hops the resolver follows (default: 10)
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// On-disk layout strategy: "in-place" or "separate-part-files".
    /// Empty selects the platform default (separate part files on Windows,
    /// in-place elsewhere).
    #[serde(default)]
    pub layout: String,

    /// Build-scoped temp directory for part files
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            parallel_enabled: true,
            parallel_forced: false,
            max_threads: default_max_threads(),
            min_part_size_mb: default_min_part_size_mb(),
            max_file_size_gb: default_max_file_size_gb(),
            buffer_size_kb: default_buffer_size_kb(),
            max_connections: default_max_connections(),
            max_connections_per_host: default_max_connections(),
            max_redirects: default_max_redirects(),
            layout: String::new(),
            temp_dir: default_temp_dir(),
        }
    }
}

impl TransferConfig {
    /// Load from a YAML file and normalize
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| TransferError::Config(format!("Failed to read config file: {}", e)))?;
        let config: TransferConfig = serde_yaml::from_str(&content)
            .map_err(|e| TransferError::Config(format!("Failed to parse config file: {}", e)))?;
        Ok(config.normalized())
    }

    /// Replace out-of-bounds values with their defaults, warning about each
    pub fn normalized(mut self) -> Self {
        if self.max_threads < 1 || self.max_threads > 1000 {
            warn!(
                max_threads = self.max_threads,
                "max_threads out of bounds, falling back to default"
            );
            self.max_threads = default_max_threads();
        }
        if self.min_part_size_mb < 1 {
            warn!(
                min_part_size_mb = self.min_part_size_mb,
                "min_part_size_mb out of bounds, falling back to default"
            );
            self.min_part_size_mb = default_min_part_size_mb();
        }
        if self.buffer_size_kb < 1 || self.buffer_size_kb > 1_048_576 {
            warn!(
                buffer_size_kb = self.buffer_size_kb,
                "buffer_size_kb out of bounds, falling back to default"
            );
            self.buffer_size_kb = default_buffer_size_kb();
        }
        if self.max_connections < 1 || self.max_connections > 100_000 {
            warn!(
                max_connections = self.max_connections,
                "max_connections out of bounds, falling back to default"
            );
            self.max_connections = default_max_connections();
        }
        if self.max_connections_per_host < 1 || self.max_connections_per_host > 100_000 {
            warn!(
                max_connections_per_host = self.max_connections_per_host,
                "max_connections_per_host out of bounds, falling back to default"
            );
            self.max_connections_per_host = default_max_connections();
        }
        self
    }

    /// Effective minimum part size in bytes, never below the hard lower bound
    pub fn min_part_size_bytes(&self) -> u64 {
        (self.min_part_size_mb * MB).max(MIN_PART_SIZE_LOWER_BOUND)
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_gb * GB
    }

    pub fn buffer_size_bytes(&self) -> usize {
        (self.buffer_size_kb * KB) as usize
    }
}

/// Upload-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Files larger than this are uploaded in multiple parts
    /// (default: 100 MB, min: 5 MB)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: u64,

    /// Size of each upload part (default: 8 MB, min: 5 MB)
    #[serde(default = "default_upload_part_size")]
    pub part_size_bytes: u64,

    /// Retry attempts per operation (default: 5)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Base delay before the first retry; doubles per attempt
    /// (default: 1000 ms)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Presigned URL time-to-live requested from the issuer (default: 60 s)
    #[serde(default = "default_url_ttl_secs")]
    pub url_ttl_secs: u64,

    /// Cap for TTL doubling after an expired-link failure (default: 3600 s)
    #[serde(default = "default_extended_url_ttl_secs")]
    pub extended_url_ttl_secs: u64,

    /// Maximum object keys per presigned-URL batch request (default: 25)
    #[serde(default = "default_max_urls_per_request")]
    pub max_urls_per_request: usize,

    /// Compare the uploaded object's ETag against the locally computed
    /// digest (default: false)
    #[serde(default)]
    pub check_consistency: bool,

    /// Maximum number of concurrent part uploads (default: 5)
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_upload_part_size(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            url_ttl_secs: default_url_ttl_secs(),
            extended_url_ttl_secs: default_extended_url_ttl_secs(),
            max_urls_per_request: default_max_urls_per_request(),
            check_consistency: false,
            max_threads: default_max_threads(),
        }
    }
}

impl UploadConfig {
    /// Load from a YAML file and normalize
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| TransferError::Config(format!("Failed to read config file: {}", e)))?;
        let config: UploadConfig = serde_yaml::from_str(&content)
            .map_err(|e| TransferError::Config(format!("Failed to parse config file: {}", e)))?;
        Ok(config.normalized())
    }

    /// Replace out-of-bounds values with their defaults, warning about each
    pub fn normalized(mut self) -> Self {
        if self.part_size_bytes < MIN_UPLOAD_PART_SIZE {
            warn!(
                part_size_bytes = self.part_size_bytes,
                "part_size_bytes below the 5 MB protocol minimum, falling back to default"
            );
            self.part_size_bytes = default_upload_part_size();
        }
        if self.multipart_threshold_bytes < MIN_UPLOAD_PART_SIZE {
            warn!(
                multipart_threshold_bytes = self.multipart_threshold_bytes,
                "multipart_threshold_bytes below the 5 MB protocol minimum, falling back to default"
            );
            self.multipart_threshold_bytes = default_multipart_threshold();
        }
        if self.max_urls_per_request < 1 {
            warn!(
                max_urls_per_request = self.max_urls_per_request,
                "max_urls_per_request out of bounds, falling back to default"
            );
            self.max_urls_per_request = default_max_urls_per_request();
        }
        if self.max_threads < 1 || self.max_threads > 1000 {
            warn!(
                max_threads = self.max_threads,
                "max_threads out of bounds, falling back to default"
            );
            self.max_threads = default_max_threads();
        }
        if self.extended_url_ttl_secs < self.url_ttl_secs {
            warn!(
                extended_url_ttl_secs = self.extended_url_ttl_secs,
                "extended_url_ttl_secs below url_ttl_secs, falling back to default"
            );
            self.extended_url_ttl_secs = default_extended_url_ttl_secs();
        }
        self
    }
}

fn default_true() -> bool {
    true
}

fn default_max_threads() -> usize {
    5
}

fn default_min_part_size_mb() -> u64 {
    100
}

fn default_max_file_size_gb() -> u64 {
    1024
}

fn default_buffer_size_kb() -> u64 {
    10
}

fn default_max_connections() -> usize {
    100
}

fn default_max_redirects() -> usize {
    10
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("artifact_transfers")
}

fn default_multipart_threshold() -> u64 {
    100 * MB
}

fn default_upload_part_size() -> u64 {
    8 * MB
}

fn default_max_retries() -> usize {
    5
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_url_ttl_secs() -> u64 {
    60
}

fn default_extended_url_ttl_secs() -> u64 {
    3600
}

fn default_max_urls_per_request() -> usize {
    25
}
