//! Parallel download orchestration
//!
//! The coordinator runs the same four phases for every layout:
//! `before_parts` allocates destination storage, one bounded task per part
//! issues a ranged GET and streams the body to disk, `after_parts`
//! finalizes, and `cleanup` best-effort deletes partial artifacts on any
//! failure. The two layouts differ only in where part bytes land while the
//! download is in flight.

use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::fs_util;
use crate::models::{FilePart, TransferTarget};
use crate::splitter::FileSplitter;
use crate::state::TransferState;
use crate::transfer;
use async_trait::async_trait;
use reqwest::header;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// On-disk layout used while part bytes arrive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutKind {
    /// Positioned writes into one preallocated file
    InPlace,
    /// One temp file per part, merged sequentially afterwards
    SeparatePartFiles,
}

impl LayoutKind {
    /// Resolve the configured layout name. Empty selects the platform
    /// default; an unknown name is fatal rather than silently sequential.
    pub fn from_config(config: &TransferConfig) -> Result<Self> {
        match config.layout.as_str() {
            "" => Ok(Self::platform_default()),
            "in-place" => Ok(LayoutKind::InPlace),
            "separate-part-files" => Ok(LayoutKind::SeparatePartFiles),
            other => Err(TransferError::UnknownLayout(other.to_string())),
        }
    }

    /// Windows performs poorly under concurrent positioned writes to one
    /// file, so it defaults to separate part files
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            LayoutKind::SeparatePartFiles
        } else {
            LayoutKind::InPlace
        }
    }
}

/// Everything a part task needs, shared read-only across tasks
struct DownloadContext {
    target: PathBuf,
    unfinished: PathBuf,
    size: u64,
    buffer_size: usize,
    temp_dir: PathBuf,
    state: Arc<TransferState>,
}

impl DownloadContext {
    /// Temp location of one part under the separate-part-files layout:
    /// `<temp_dir>/<file name>.part.<n>`
    fn part_file(&self, part_number: u32) -> PathBuf {
        let name = self
            .target
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("artifact"));
        fs_util::part_path(&self.temp_dir.join(name), part_number)
    }
}

#[async_trait]
trait LayoutStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Allocate destination storage before any part task starts
    async fn before_parts(&self, ctx: &DownloadContext) -> Result<()>;

    /// Stream one part's 206 body to its destination
    async fn write_part(
        &self,
        ctx: &DownloadContext,
        part: FilePart,
        response: reqwest::Response,
    ) -> Result<()>;

    /// Finalize after all parts landed successfully
    async fn after_parts(&self, ctx: &DownloadContext) -> Result<()>;

    /// Best-effort removal of partial artifacts; never returns an error so
    /// it cannot mask the failure that triggered it
    async fn cleanup(&self, ctx: &DownloadContext, parts: &[FilePart]);
}

struct InPlaceLayout;

#[async_trait]
impl LayoutStrategy for InPlaceLayout {
    fn name(&self) -> &'static str {
        "in-place"
    }

    async fn before_parts(&self, ctx: &DownloadContext) -> Result<()> {
        fs_util::reserve_file_bytes(&ctx.unfinished, ctx.size).await
    }

    async fn write_part(
        &self,
        ctx: &DownloadContext,
        part: FilePart,
        mut response: reqwest::Response,
    ) -> Result<()> {
        // each task opens its own handle; parts address disjoint ranges
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&ctx.unfinished)
            .await?;
        file.seek(SeekFrom::Start(part.range.start)).await?;

        let buffer = effective_buffer(ctx.buffer_size, part.len());
        transfer::transfer_expected_bytes(&mut response, &mut file, part.len(), buffer, &ctx.state)
            .await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn after_parts(&self, ctx: &DownloadContext) -> Result<()> {
        fs_util::atomic_rename(&ctx.unfinished, &ctx.target).await
    }

    async fn cleanup(&self, ctx: &DownloadContext, _parts: &[FilePart]) {
        fs_util::remove_quietly(&ctx.unfinished).await;
        fs_util::remove_quietly(&ctx.target).await;
    }
}

struct SeparatePartFilesLayout;

#[async_trait]
impl LayoutStrategy for SeparatePartFilesLayout {
    fn name(&self) -> &'static str {
        "separate-part-files"
    }

    async fn before_parts(&self, ctx: &DownloadContext) -> Result<()> {
        tokio::fs::create_dir_all(&ctx.temp_dir).await?;
        Ok(())
    }

    async fn write_part(
        &self,
        ctx: &DownloadContext,
        part: FilePart,
        mut response: reqwest::Response,
    ) -> Result<()> {
        let mut file = fs_util::create_file(&ctx.part_file(part.part_number)).await?;
        let buffer = effective_buffer(ctx.buffer_size, part.len());
        transfer::transfer_expected_bytes(&mut response, &mut file, part.len(), buffer, &ctx.state)
            .await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn after_parts(&self, ctx: &DownloadContext) -> Result<()> {
        fs_util::reserve_file_bytes(&ctx.unfinished, ctx.size).await?;
        let mut dest = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&ctx.unfinished)
            .await?;

        // sequential merge in part order; offsets follow from contiguity
        let mut copied_total: u64 = 0;
        let mut part_number = 0u32;
        while copied_total < ctx.size {
            let part_path = ctx.part_file(part_number);
            let expected = tokio::fs::metadata(&part_path).await?.len();
            let mut src = tokio::fs::File::open(&part_path).await?;
            copied_total += transfer::transfer_expected_file_bytes(
                &mut src,
                &mut dest,
                expected,
                ctx.buffer_size,
                &ctx.state,
            )
            .await?;
            part_number += 1;
        }
        dest.flush().await?;
        dest.sync_data().await?;
        drop(dest);

        if copied_total != ctx.size {
            return Err(TransferError::ByteCountMismatch {
                expected: ctx.size,
                actual: copied_total,
            });
        }

        fs_util::atomic_rename(&ctx.unfinished, &ctx.target).await?;
        for n in 0..part_number {
            fs_util::remove_quietly(&ctx.part_file(n)).await;
        }
        Ok(())
    }

    async fn cleanup(&self, ctx: &DownloadContext, parts: &[FilePart]) {
        fs_util::remove_quietly(&ctx.unfinished).await;
        fs_util::remove_quietly(&ctx.target).await;
        for part in parts {
            fs_util::remove_quietly(&ctx.part_file(part.part_number)).await;
        }
    }
}

fn effective_buffer(configured: usize, expected: u64) -> usize {
    (configured as u64).min(expected).max(1) as usize
}

/// Drives the concurrent part transfers of one download
pub struct DownloadCoordinator {
    client: reqwest::Client,
    config: TransferConfig,
}

impl DownloadCoordinator {
    pub fn new(client: reqwest::Client, config: TransferConfig) -> Self {
        DownloadCoordinator { client, config }
    }

    /// Download from an already-resolved direct URL into the target path,
    /// expecting exactly `target.expected_length` bytes.
    ///
    /// On failure the surfaced error is the first-recorded part failure
    /// (with its byte range) or `Interrupted`; partial artifacts are
    /// removed best-effort before returning.
    pub async fn download(
        &self,
        direct_url: &str,
        target: &TransferTarget,
        state: Arc<TransferState>,
    ) -> Result<()> {
        let size = match target.expected_length {
            Some(size) if size > 0 => size,
            _ => {
                return Err(TransferError::InvalidRange(
                    "target length must be known and positive".to_string(),
                ))
            }
        };
        let target = target.path.as_path();
        let layout = LayoutKind::from_config(&self.config)?;
        let strategy: Arc<dyn LayoutStrategy> = match layout {
            LayoutKind::InPlace => Arc::new(InPlaceLayout),
            LayoutKind::SeparatePartFiles => Arc::new(SeparatePartFilesLayout),
        };

        let splitter = FileSplitter::new(self.config.clone());
        let parts = splitter.split_download(size);
        state.set_expected(size);
        info!(
            url = direct_url,
            target = %target.display(),
            size,
            parts = parts.len(),
            layout = strategy.name(),
            "starting parallel download"
        );

        let ctx = Arc::new(DownloadContext {
            target: target.to_path_buf(),
            unfinished: fs_util::unfinished_path(target),
            size,
            buffer_size: self.config.buffer_size_bytes(),
            temp_dir: self.config.temp_dir.clone(),
            state: state.clone(),
        });

        let result = self.run_phases(direct_url, &strategy, &ctx, &parts).await;

        if let Err(err) = &result {
            warn!(target = %ctx.target.display(), error = %err, "download failed, cleaning up");
            strategy.cleanup(&ctx, &parts).await;
        }
        result
    }

    async fn run_phases(
        &self,
        direct_url: &str,
        strategy: &Arc<dyn LayoutStrategy>,
        ctx: &Arc<DownloadContext>,
        parts: &[FilePart],
    ) -> Result<()> {
        ctx.state.check_live()?;
        strategy.before_parts(ctx).await?;

        self.fetch_parts(direct_url, strategy, ctx, parts).await?;

        ctx.state.check_live()?;
        strategy.after_parts(ctx).await?;
        info!(target = %ctx.target.display(), "download complete");
        Ok(())
    }

    async fn fetch_parts(
        &self,
        direct_url: &str,
        strategy: &Arc<dyn LayoutStrategy>,
        ctx: &Arc<DownloadContext>,
        parts: &[FilePart],
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_threads));
        let mut handles = Vec::with_capacity(parts.len());
        for part in parts.iter().copied() {
            let permit_source = semaphore.clone();
            let client = self.client.clone();
            let url = direct_url.to_string();
            let ctx = ctx.clone();
            let strategy = strategy.clone();

            // the failure is latched inside the task so siblings observe it
            // on their next check_live, not only after all tasks settle
            handles.push((
                part,
                tokio::spawn(async move {
                    let _permit = match permit_source.acquire().await {
                        Ok(permit) => permit,
                        Err(e) => {
                            ctx.state.record_failure(part, TransferError::Io(e.to_string()));
                            return;
                        }
                    };
                    // a sibling may have failed while this task queued
                    if ctx.state.check_live().is_err() {
                        debug!(part = %part.description(), "skipping part, transfer already failed");
                        return;
                    }
                    if let Err(err) =
                        fetch_one_part(&client, &url, strategy.as_ref(), &ctx, part).await
                    {
                        // propagated interrupts and sibling-failure echoes
                        // must not overwrite the original cause
                        if !matches!(
                            err,
                            TransferError::Interrupted | TransferError::PartFailed { .. }
                        ) {
                            ctx.state.record_failure(part, err);
                        }
                    }
                }),
            ));
        }

        for (part, handle) in handles {
            if let Err(join_err) = handle.await {
                ctx.state.record_failure(
                    part,
                    TransferError::Io(format!("part task failed: {}", join_err)),
                );
            }
        }

        ctx.state.check_live()
    }
}

async fn fetch_one_part(
    client: &reqwest::Client,
    url: &str,
    strategy: &dyn LayoutStrategy,
    ctx: &DownloadContext,
    part: FilePart,
) -> Result<()> {
    debug!(part = %part.description(), "fetching part");
    let response = client
        .get(url)
        .header(header::RANGE, part.range.to_header_value())
        .send()
        .await?;
    TransferError::check_status(response.status().as_u16(), 206)?;
    strategy.write_part(ctx, part, response).await?;
    debug!(part = %part.description(), "part complete");
    Ok(())
}
