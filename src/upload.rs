//! Presigned uploads
//!
//! Files below the multipart threshold go up as one presigned PUT; larger
//! files are chunked and uploaded part by part under one multipart
//! transaction. Retries are resumable: an already-recorded part ETag is
//! never uploaded again, and the upload id issued on the first attempt is
//! echoed back on every later one. When the store rejects a link as
//! expired, the next attempt requests URLs with a doubled TTL.

use crate::config::UploadConfig;
use crate::error::{Result, TransferError, UploadError};
use crate::models::UploadPart;
use crate::presign::{
    MultipartAbortRequest, MultipartCompleteRequest, MultipartUrlRequest, PresignedUrl,
    PresignedUrlCache, PresignedUrlProvider,
};
use crate::resolver::header_digest;
use crate::retry::{RetryContext, RetryPolicy};
use crate::splitter::split_upload;
use reqwest::header;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

/// Result of one finished upload
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub object_key: String,
    /// ETag of the stored object; multipart completions do not return one
    pub etag: Option<String>,
}

/// Drives single-shot and multipart presigned uploads
pub struct UploadCoordinator {
    client: reqwest::Client,
    provider: Arc<dyn PresignedUrlProvider>,
    cache: Arc<PresignedUrlCache>,
    digests: HashMap<String, String>,
    config: UploadConfig,
}

impl UploadCoordinator {
    /// `object_keys` is the full set this coordinator will upload; regular
    /// URLs for them are fetched in batches and cached. `digests` carries
    /// precalculated content digests keyed by object key, used for URL
    /// issuance and the optional consistency check.
    pub fn new(
        client: reqwest::Client,
        provider: Arc<dyn PresignedUrlProvider>,
        object_keys: Vec<String>,
        digests: HashMap<String, String>,
        config: UploadConfig,
    ) -> Self {
        let cache = Arc::new(PresignedUrlCache::new(
            provider.clone(),
            object_keys,
            digests.clone(),
            Duration::from_secs(config.url_ttl_secs),
            config.max_urls_per_request,
        ));
        UploadCoordinator {
            client,
            provider,
            cache,
            digests,
            config,
        }
    }

    /// Upload one file under `object_key`, choosing single-shot or
    /// multipart by size
    pub async fn upload(
        &self,
        path: &Path,
        object_key: &str,
    ) -> std::result::Result<UploadOutcome, UploadError> {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| UploadError::new(false, TransferError::Io(e.to_string())))?
            .len();

        if size > self.config.multipart_threshold_bytes {
            info!(object_key, size, "starting multipart upload");
            self.upload_multipart(path, object_key, size).await
        } else {
            info!(object_key, size, "starting single-shot upload");
            self.upload_single_shot(path, object_key, size).await
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.max_retries as u32,
            Duration::from_millis(self.config.retry_delay_ms),
        )
    }

    fn retry_context(&self) -> RetryContext {
        RetryContext::new(
            Duration::from_secs(self.config.url_ttl_secs),
            Duration::from_secs(self.config.extended_url_ttl_secs),
        )
    }

    async fn upload_single_shot(
        &self,
        path: &Path,
        object_key: &str,
        size: u64,
    ) -> std::result::Result<UploadOutcome, UploadError> {
        let policy = self.retry_policy();
        let mut ctx = self.retry_context();
        // switches to explicit-TTL fetches once a link has expired
        let mut needs_fresh_url = false;
        let mut attempt = 0u32;

        loop {
            let result = self
                .single_shot_attempt(path, object_key, size, &mut needs_fresh_url, &ctx)
                .await;
            match result {
                Ok(etag) => {
                    self.check_consistency(object_key, &etag)
                        .map_err(|e| UploadError::new(false, e))?;
                    return Ok(UploadOutcome {
                        object_key: object_key.to_string(),
                        etag: Some(etag),
                    });
                }
                Err(err) => {
                    if err.is_url_expired() {
                        ctx.extend_ttl();
                        needs_fresh_url = true;
                    }
                    if !policy.should_retry(attempt, &err) {
                        return Err(UploadError::from_error(err));
                    }
                    warn!(object_key, attempt, error = %err, "upload attempt failed, retrying");
                    policy.sleep_before_retry(attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn single_shot_attempt(
        &self,
        path: &Path,
        object_key: &str,
        size: u64,
        needs_fresh_url: &mut bool,
        ctx: &RetryContext,
    ) -> Result<String> {
        let presigned = if *needs_fresh_url {
            *needs_fresh_url = false;
            self.cache.fresh_url_for(object_key, ctx.url_ttl()).await?
        } else {
            self.cache.url_for(object_key).await?
        };
        let url = presigned.single_url()?.to_string();

        let file = tokio::fs::File::open(path).await?;
        let response = self
            .client
            .put(&url)
            .header(header::CONTENT_LENGTH, size)
            .body(reqwest::Body::from(file))
            .send()
            .await?;

        expect_ok(response).await
    }

    async fn upload_multipart(
        &self,
        path: &Path,
        object_key: &str,
        size: u64,
    ) -> std::result::Result<UploadOutcome, UploadError> {
        let parts = split_upload(size, self.config.part_size_bytes);
        let policy = self.retry_policy();
        let mut ctx = self.retry_context();
        let mut attempt = 0u32;
        let mut custom_ttl = false;

        // survives attempts: the transaction id and every recorded ETag
        let mut upload_id: Option<String> = None;
        let mut etags: Vec<Option<String>> = vec![None; parts.len()];

        loop {
            let result = self
                .multipart_attempt(path, object_key, &parts, &mut upload_id, &mut etags, custom_ttl, &ctx)
                .await;
            match result {
                Ok(()) => {
                    return Ok(UploadOutcome {
                        object_key: object_key.to_string(),
                        etag: None,
                    });
                }
                Err(err) => {
                    if err.is_url_expired() {
                        ctx.extend_ttl();
                        custom_ttl = true;
                    }
                    if !policy.should_retry(attempt, &err) {
                        self.abandon_multipart(object_key, &mut upload_id, &mut etags)
                            .await;
                        return Err(UploadError::from_error(err));
                    }
                    let completed = etags.iter().filter(|e| e.is_some()).count();
                    warn!(
                        object_key,
                        attempt,
                        completed,
                        total = parts.len(),
                        error = %err,
                        "multipart attempt failed, retrying pending parts"
                    );
                    policy.sleep_before_retry(attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn multipart_attempt(
        &self,
        path: &Path,
        object_key: &str,
        parts: &[UploadPart],
        upload_id: &mut Option<String>,
        etags: &mut [Option<String>],
        custom_ttl: bool,
        ctx: &RetryContext,
    ) -> Result<()> {
        let pending: Vec<&UploadPart> = parts
            .iter()
            .filter(|p| etags[(p.part_number - 1) as usize].is_none())
            .collect();

        if !pending.is_empty() {
            let request = MultipartUrlRequest {
                object_key: object_key.to_string(),
                part_numbers: pending.iter().map(|p| p.part_number).collect(),
                upload_id: upload_id.clone(),
                ttl_secs: custom_ttl.then(|| ctx.url_ttl().as_secs()),
            };
            let presigned = self.provider.multipart_urls(request).await?;
            let issued_id = presigned
                .upload_id
                .clone()
                .ok_or_else(|| TransferError::Parse("issuer returned no upload id".into()))?;
            // the id issued first must be reused on every later attempt
            *upload_id = Some(issued_id);

            self.put_pending_parts(path, &pending, &presigned, etags)
                .await?;
        }

        let ordered: Vec<String> = etags
            .iter()
            .map(|e| e.clone().ok_or(TransferError::MissingEtag))
            .collect::<Result<_>>()?;
        let id = upload_id
            .clone()
            .ok_or_else(|| TransferError::Parse("completing upload without an upload id".into()))?;

        self.provider
            .complete_multipart(MultipartCompleteRequest {
                object_key: object_key.to_string(),
                upload_id: id,
                etags: ordered,
            })
            .await?;
        info!(object_key, parts = parts.len(), "multipart upload complete");
        Ok(())
    }

    /// PUT every pending part concurrently, recording ETags as they land.
    /// Returns the first failure in part order.
    async fn put_pending_parts(
        &self,
        path: &Path,
        pending: &[&UploadPart],
        presigned: &PresignedUrl,
        etags: &mut [Option<String>],
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_threads));
        let recorded: Arc<Mutex<Vec<Option<String>>>> =
            Arc::new(Mutex::new(etags.to_vec()));

        let mut handles = Vec::with_capacity(pending.len());
        for part in pending.iter().map(|p| **p) {
            let url = presigned.part_url(part.part_number)?.to_string();
            let client = self.client.clone();
            let path: PathBuf = path.to_path_buf();
            let semaphore = semaphore.clone();
            let recorded = recorded.clone();

            handles.push((
                part.part_number,
                tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire()
                        .await
                        .map_err(|e| TransferError::Io(e.to_string()))?;
                    let etag = put_one_part(&client, &path, &part, &url).await?;
                    recorded.lock().await[(part.part_number - 1) as usize] = Some(etag);
                    Ok::<(), TransferError>(())
                }),
            ));
        }

        let mut first_error: Option<TransferError> = None;
        for (part_number, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => Err(TransferError::Io(format!(
                    "part upload task failed: {}",
                    join_err
                ))),
            };
            if let Err(err) = outcome {
                debug!(part_number, error = %err, "part upload failed");
                first_error.get_or_insert(err);
            }
        }

        // keep the ETags of parts that finished even when a sibling failed
        let recorded = recorded.lock().await;
        etags.clone_from_slice(&recorded);
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Abort the transaction on permanent failure and reset the resume
    /// state; a later whole-file retry starts a fresh transaction
    async fn abandon_multipart(
        &self,
        object_key: &str,
        upload_id: &mut Option<String>,
        etags: &mut [Option<String>],
    ) {
        if let Some(id) = upload_id.take() {
            let request = MultipartAbortRequest {
                object_key: object_key.to_string(),
                upload_id: id,
            };
            if let Err(err) = self.provider.abort_multipart(request).await {
                warn!(object_key, error = %err, "failed to abort multipart upload");
            }
        }
        for etag in etags.iter_mut() {
            *etag = None;
        }
    }

    /// Compare the stored ETag with the locally precalculated digest
    fn check_consistency(&self, object_key: &str, etag: &str) -> Result<()> {
        if !self.config.check_consistency {
            return Ok(());
        }
        match self.digests.get(object_key) {
            Some(expected) if expected != etag => Err(TransferError::DigestMismatch {
                expected: expected.clone(),
                actual: etag.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// PUT one part's byte range and return its ETag
async fn put_one_part(
    client: &reqwest::Client,
    path: &Path,
    part: &UploadPart,
    url: &str,
) -> Result<String> {
    debug!(part = part.part_number, bytes = part.len(), "uploading part");
    let body = read_part(path, part).await?;
    let response = client
        .put(url)
        .header(header::CONTENT_LENGTH, part.len())
        .body(body)
        .send()
        .await?;
    expect_ok(response).await
}

/// Part sizes are bounded by configuration, so one part fits in memory and
/// stays trivially repeatable across retries
async fn read_part(path: &Path, part: &UploadPart) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(part.range.start)).await?;
    let mut buf = vec![0u8; part.len() as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Check for 200 and extract the ETag. Non-200 bodies are read as the error
/// message so expired-link rejections stay detectable.
async fn expect_ok(response: reqwest::Response) -> Result<String> {
    let status = response.status().as_u16();
    if status != 200 {
        let message = response.text().await.unwrap_or_default();
        return Err(TransferError::from_http_status(status, truncate(&message)));
    }
    header_digest(response.headers()).ok_or(TransferError::MissingEtag)
}

fn truncate(message: &str) -> String {
    const MAX: usize = 512;
    if message.len() <= MAX {
        message.to_string()
    } else {
        let mut end = MAX;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message[..end].to_string()
    }
}
