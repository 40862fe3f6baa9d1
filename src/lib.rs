//! Parallel chunked HTTP artifact transfer engine.
//!
//! Downloads resolve a storage-facing URL through its redirect chain to a
//! direct URL, decide whether the file is worth splitting, and fetch byte
//! ranges concurrently into one of two on-disk layouts, finishing with an
//! atomic rename. Uploads push files to a store through presigned URLs,
//! single-shot or multipart, with TTL-adaptive retries that resume from
//! already-recorded part ETags.
//!
//! # Example
//!
//! ```no_run
//! use artifact_transfer::{
//!     DownloadCoordinator, FileSplitter, RedirectResolver, TransferConfig, TransferState,
//!     TransferTarget,
//! };
//!
//! # async fn run() -> artifact_transfer::Result<()> {
//! let config = TransferConfig::default();
//! let resolver = RedirectResolver::new(&config)?;
//! let source = resolver.resolve("https://build.example.com/artifact.zip").await?;
//!
//! let splitter = FileSplitter::new(config.clone());
//! let report = splitter.check_splittability(source.content_length, source.accepts_ranges);
//! if report.splittable {
//!     let mut target = TransferTarget::new("artifact.zip")
//!         .with_expected_length(source.content_length.unwrap_or_default());
//!     if let Some(digest) = &source.digest {
//!         target = target.with_digest(digest.clone());
//!     }
//!     let coordinator = DownloadCoordinator::new(reqwest::Client::new(), config);
//!     let state = TransferState::detached();
//!     coordinator.download(&source.direct_url, &target, state).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod download;
pub mod error;
pub mod fs_util;
pub mod models;
pub mod presign;
pub mod resolver;
pub mod retry;
pub mod splitter;
pub mod state;
pub mod transfer;
pub mod upload;

pub use config::{TransferConfig, UploadConfig};
pub use download::{DownloadCoordinator, LayoutKind};
pub use error::{Result, TransferError, UploadError};
pub use models::{ByteRange, FilePart, SourceInfo, TransferTarget, UploadPart};
pub use presign::{HttpUrlProvider, PresignedUrl, PresignedUrlCache, PresignedUrlProvider};
pub use resolver::RedirectResolver;
pub use retry::{RetryContext, RetryPolicy};
pub use splitter::{split_upload, FileSplitter, SplitReport};
pub use state::{NullProgressSink, PartFailure, ProgressSink, TransferState};
pub use upload::{UploadCoordinator, UploadOutcome};
