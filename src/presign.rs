//! Presigned URL issuance
//!
//! Uploads never talk to the store with credentials: a URL issuer service
//! hands out presigned URLs on request. Regular (single PUT) URLs are
//! fetched in batches and cached with a TTL; multipart URLs are fetched per
//! object as the upload progresses, echoing the upload id back so retries
//! stay inside the same multipart transaction.

use crate::error::{Result, TransferError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One issued URL; `part_number` is 1 for regular single-PUT URLs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUrlPart {
    pub url: String,
    pub part_number: u32,
}

/// Issuer response for one object key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUrl {
    pub object_key: String,
    #[serde(default)]
    pub upload_id: Option<String>,
    #[serde(default)]
    pub multipart: bool,
    pub parts: Vec<PresignedUrlPart>,
}

impl PresignedUrl {
    pub fn single(object_key: impl Into<String>, url: impl Into<String>) -> Self {
        PresignedUrl {
            object_key: object_key.into(),
            upload_id: None,
            multipart: false,
            parts: vec![PresignedUrlPart {
                url: url.into(),
                part_number: 1,
            }],
        }
    }

    /// The one URL of a regular response; fails when the issuer returned a
    /// different shape than requested
    pub fn single_url(&self) -> Result<&str> {
        match self.parts.as_slice() {
            [part] => Ok(&part.url),
            parts => Err(TransferError::Parse(format!(
                "expected exactly 1 presigned URL for {}, got {}",
                self.object_key,
                parts.len()
            ))),
        }
    }

    /// URL for one multipart part number
    pub fn part_url(&self, part_number: u32) -> Result<&str> {
        self.parts
            .iter()
            .find(|p| p.part_number == part_number)
            .map(|p| p.url.as_str())
            .ok_or_else(|| {
                TransferError::Parse(format!(
                    "no presigned URL for part {} of {}",
                    part_number, self.object_key
                ))
            })
    }
}

/// Batch request for regular URLs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUrlListRequest {
    pub object_keys: Vec<String>,
    /// Precalculated content digests keyed by object key
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub digests: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUrlListResponse {
    pub presigned_urls: Vec<PresignedUrl>,
}

/// Request for multipart part URLs; `upload_id` is absent on the first
/// call and must echo the issued id afterwards
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartUrlRequest {
    pub object_key: String,
    pub part_numbers: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartCompleteRequest {
    pub object_key: String,
    pub upload_id: String,
    /// ETags in part-number order
    pub etags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartAbortRequest {
    pub object_key: String,
    pub upload_id: String,
}

/// The issuer endpoint, seam for tests and alternative transports
#[async_trait]
pub trait PresignedUrlProvider: Send + Sync {
    /// Regular single-PUT URLs for a batch of keys
    async fn regular_urls(
        &self,
        request: PresignedUrlListRequest,
    ) -> Result<Vec<PresignedUrl>>;

    /// Part URLs (and the upload id) for one multipart object
    async fn multipart_urls(&self, request: MultipartUrlRequest) -> Result<PresignedUrl>;

    async fn complete_multipart(&self, request: MultipartCompleteRequest) -> Result<()>;

    async fn abort_multipart(&self, request: MultipartAbortRequest) -> Result<()>;
}

/// Provider talking JSON to an HTTP issuer endpoint
pub struct HttpUrlProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUrlProvider {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        HttpUrlProvider {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status().as_u16();
        TransferError::check_status(status, 200)?;
        Ok(response)
    }
}

#[async_trait]
impl PresignedUrlProvider for HttpUrlProvider {
    async fn regular_urls(
        &self,
        request: PresignedUrlListRequest,
    ) -> Result<Vec<PresignedUrl>> {
        let response = self.post("/presigned-urls", &request).await?;
        let parsed: PresignedUrlListResponse = response
            .json()
            .await
            .map_err(|e| TransferError::Parse(e.to_string()))?;
        Ok(parsed.presigned_urls)
    }

    async fn multipart_urls(&self, request: MultipartUrlRequest) -> Result<PresignedUrl> {
        let response = self.post("/presigned-urls/multipart", &request).await?;
        response
            .json()
            .await
            .map_err(|e| TransferError::Parse(e.to_string()))
    }

    async fn complete_multipart(&self, request: MultipartCompleteRequest) -> Result<()> {
        self.post("/presigned-urls/multipart/complete", &request)
            .await?;
        Ok(())
    }

    async fn abort_multipart(&self, request: MultipartAbortRequest) -> Result<()> {
        self.post("/presigned-urls/multipart/abort", &request)
            .await?;
        Ok(())
    }
}

struct CacheInner {
    urls: HashMap<String, PresignedUrl>,
    fetched_at: Option<Instant>,
}

/// TTL cache over a fixed set of object keys.
///
/// A stale cache is refreshed as a whole batch, chunked by
/// `max_urls_per_request`. The inner mutex covers the refresh, so
/// concurrent readers of a stale cache trigger exactly one fetch.
pub struct PresignedUrlCache {
    provider: Arc<dyn PresignedUrlProvider>,
    object_keys: Vec<String>,
    digests: HashMap<String, String>,
    ttl: Duration,
    max_urls_per_request: usize,
    inner: Mutex<CacheInner>,
}

impl PresignedUrlCache {
    pub fn new(
        provider: Arc<dyn PresignedUrlProvider>,
        object_keys: Vec<String>,
        digests: HashMap<String, String>,
        ttl: Duration,
        max_urls_per_request: usize,
    ) -> Self {
        PresignedUrlCache {
            provider,
            object_keys,
            digests,
            ttl,
            max_urls_per_request: max_urls_per_request.max(1),
            inner: Mutex::new(CacheInner {
                urls: HashMap::new(),
                fetched_at: None,
            }),
        }
    }

    /// URL for one key, refreshing the whole batch first when stale.
    /// A key outside the configured set fails with `UrlNotFound`.
    pub async fn url_for(&self, object_key: &str) -> Result<PresignedUrl> {
        let mut inner = self.inner.lock().await;
        let stale = match inner.fetched_at {
            Some(at) => at.elapsed() >= self.ttl,
            None => true,
        };
        if stale {
            self.refresh(&mut inner).await?;
        }
        inner
            .urls
            .get(object_key)
            .cloned()
            .ok_or_else(|| TransferError::UrlNotFound(object_key.to_string()))
    }

    /// Fetch a fresh URL for one key with an explicit TTL, bypassing and
    /// updating the cache. Used after an expired-link failure.
    pub async fn fresh_url_for(&self, object_key: &str, ttl: Duration) -> Result<PresignedUrl> {
        let request = PresignedUrlListRequest {
            object_keys: vec![object_key.to_string()],
            digests: self
                .digests
                .get(object_key)
                .map(|d| HashMap::from([(object_key.to_string(), d.clone())]))
                .unwrap_or_default(),
            ttl_secs: Some(ttl.as_secs()),
        };
        let urls = self.provider.regular_urls(request).await?;
        let url = urls
            .into_iter()
            .find(|u| u.object_key == object_key)
            .ok_or_else(|| TransferError::UrlNotFound(object_key.to_string()))?;

        let mut inner = self.inner.lock().await;
        inner.urls.insert(object_key.to_string(), url.clone());
        Ok(url)
    }

    async fn refresh(&self, inner: &mut CacheInner) -> Result<()> {
        debug!(keys = self.object_keys.len(), "refreshing presigned URL cache");
        let mut urls = HashMap::with_capacity(self.object_keys.len());
        for chunk in self.object_keys.chunks(self.max_urls_per_request) {
            let request = PresignedUrlListRequest {
                object_keys: chunk.to_vec(),
                digests: chunk
                    .iter()
                    .filter_map(|k| self.digests.get(k).map(|d| (k.clone(), d.clone())))
                    .collect(),
                ttl_secs: None,
            };
            for url in self.provider.regular_urls(request).await? {
                urls.insert(url.object_key.clone(), url);
            }
        }
        info!(urls = urls.len(), "presigned URL cache refreshed");
        inner.urls = urls;
        inner.fetched_at = Some(Instant::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        batch_sizes: Mutex<Vec<usize>>,
    }

    impl CountingProvider {
        fn new() -> Arc<Self> {
            Arc::new(CountingProvider {
                calls: AtomicUsize::new(0),
                batch_sizes: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PresignedUrlProvider for CountingProvider {
        async fn regular_urls(
            &self,
            request: PresignedUrlListRequest,
        ) -> Result<Vec<PresignedUrl>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batch_sizes.lock().await.push(request.object_keys.len());
            Ok(request
                .object_keys
                .iter()
                .map(|k| PresignedUrl::single(k.clone(), format!("https://store/{}", k)))
                .collect())
        }

        async fn multipart_urls(&self, _request: MultipartUrlRequest) -> Result<PresignedUrl> {
            unimplemented!("not used by cache tests")
        }

        async fn complete_multipart(&self, _request: MultipartCompleteRequest) -> Result<()> {
            Ok(())
        }

        async fn abort_multipart(&self, _request: MultipartAbortRequest) -> Result<()> {
            Ok(())
        }
    }

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("key-{}", i)).collect()
    }

    #[tokio::test]
    async fn test_cache_fetches_once_within_ttl() {
        let provider = CountingProvider::new();
        let cache = PresignedUrlCache::new(
            provider.clone(),
            keys(3),
            HashMap::new(),
            Duration::from_secs(60),
            25,
        );

        cache.url_for("key-0").await.unwrap();
        cache.url_for("key-1").await.unwrap();
        cache.url_for("key-2").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_refreshes_after_ttl() {
        let provider = CountingProvider::new();
        let cache = PresignedUrlCache::new(
            provider.clone(),
            keys(1),
            HashMap::new(),
            Duration::from_millis(10),
            25,
        );

        cache.url_for("key-0").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.url_for("key-0").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_chunks_large_batches() {
        let provider = CountingProvider::new();
        let cache = PresignedUrlCache::new(
            provider.clone(),
            keys(60),
            HashMap::new(),
            Duration::from_secs(60),
            25,
        );

        cache.url_for("key-59").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(*provider.batch_sizes.lock().await, vec![25, 25, 10]);
    }

    #[tokio::test]
    async fn test_unknown_key_fails() {
        let provider = CountingProvider::new();
        let cache = PresignedUrlCache::new(
            provider,
            keys(1),
            HashMap::new(),
            Duration::from_secs(60),
            25,
        );

        let err = cache.url_for("other").await.unwrap_err();
        assert!(matches!(err, TransferError::UrlNotFound(_)));
    }

    #[tokio::test]
    async fn test_fresh_url_carries_ttl() {
        let provider = CountingProvider::new();
        let cache = PresignedUrlCache::new(
            provider.clone(),
            keys(1),
            HashMap::new(),
            Duration::from_secs(60),
            25,
        );

        let url = cache
            .fresh_url_for("key-0", Duration::from_secs(120))
            .await
            .unwrap();
        assert_eq!(url.single_url().unwrap(), "https://store/key-0");
    }

    #[test]
    fn test_single_url_shape_check() {
        let mut url = PresignedUrl::single("k", "https://store/k");
        assert_eq!(url.single_url().unwrap(), "https://store/k");

        url.parts.push(PresignedUrlPart {
            url: "https://store/k?part=2".into(),
            part_number: 2,
        });
        assert!(url.single_url().is_err());
    }

    #[test]
    fn test_part_url_lookup() {
        let url = PresignedUrl {
            object_key: "k".into(),
            upload_id: Some("upl-1".into()),
            multipart: true,
            parts: vec![
                PresignedUrlPart {
                    url: "https://store/k?part=1".into(),
                    part_number: 1,
                },
                PresignedUrlPart {
                    url: "https://store/k?part=2".into(),
                    part_number: 2,
                },
            ],
        };
        assert_eq!(url.part_url(2).unwrap(), "https://store/k?part=2");
        assert!(url.part_url(3).is_err());
    }

    #[test]
    fn test_request_serialization_skips_empty_fields() {
        let request = MultipartUrlRequest {
            object_key: "k".into(),
            part_numbers: vec![1, 2],
            upload_id: None,
            ttl_secs: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("uploadId"));
        assert!(!json.contains("ttlSecs"));

        let with_id = MultipartUrlRequest {
            upload_id: Some("upl-9".into()),
            ..request
        };
        assert!(serde_json::to_string(&with_id).unwrap().contains("upl-9"));
    }
}
