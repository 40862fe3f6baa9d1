//! Redirect resolution for storage-facing download URLs
//!
//! Storage-facing endpoints answer artifact requests with redirect chains
//! that end at a direct (often presigned) URL. Automatic redirect following
//! is disabled on the HTTP client; each hop is followed manually so the
//! terminal response's metadata can be captured and its body dropped
//! unread. Every in-flight request is registered under a fresh correlation
//! id so an external interrupt can abort live connections instead of
//! waiting for timeouts.

use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::models::SourceInfo;
use reqwest::header;
use reqwest::Url;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

const REDIRECT_STATUSES: [u16; 4] = [301, 302, 303, 307];

pub fn is_redirect_status(status: u16) -> bool {
    REDIRECT_STATUSES.contains(&status)
}

type PendingRequests = Arc<Mutex<HashMap<Uuid, String>>>;

/// Removes the registry entry when the request settles, on any path out
struct PendingGuard {
    pending: PendingRequests,
    id: Uuid,
}

impl PendingGuard {
    fn register(pending: &PendingRequests, id: Uuid, url: &str) -> Self {
        let mut map = lock(pending);
        if map.insert(id, url.to_string()).is_some() {
            warn!(%id, "correlation id collision, replacing previous entry");
        }
        PendingGuard {
            pending: pending.clone(),
            id,
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.id);
    }
}

fn lock(pending: &PendingRequests) -> std::sync::MutexGuard<'_, HashMap<Uuid, String>> {
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Follows redirects to the direct URL and captures source metadata
pub struct RedirectResolver {
    client: reqwest::Client,
    max_redirects: usize,
    interrupted: Arc<AtomicBool>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    pending: PendingRequests,
}

impl RedirectResolver {
    /// Build a resolver with its own client. Redirect following must stay
    /// disabled on the client, so the resolver owns it rather than
    /// accepting an arbitrary one.
    pub fn new(config: &TransferConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(config.max_connections_per_host)
            .build()?;
        Ok(Self::with_client(client, config.max_redirects))
    }

    /// Use a preconfigured client; it must not follow redirects on its own
    pub fn with_client(client: reqwest::Client, max_redirects: usize) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        RedirectResolver {
            client,
            max_redirects,
            interrupted: Arc::new(AtomicBool::new(false)),
            cancel_tx,
            cancel_rx,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Follow redirects from `url` until a terminal response, returning the
    /// direct URL together with the length, range support and digest the
    /// terminal response advertised. The terminal body is dropped unread;
    /// the actual bytes come later through ranged requests.
    pub async fn resolve(&self, url: &str) -> Result<SourceInfo> {
        let mut current = parse_url(url)?;
        let mut hops = 0usize;

        loop {
            self.check_interrupted()?;
            let response = self.execute(self.client.get(current.clone())).await?;
            let status = response.status().as_u16();

            if is_redirect_status(status) {
                self.check_interrupted()?;
                hops += 1;
                if hops > self.max_redirects {
                    return Err(TransferError::TooManyRedirects {
                        max: self.max_redirects,
                    });
                }
                let location = response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .ok_or(TransferError::MissingLocation { status })?;
                debug!(status, %location, hop = hops, "following redirect");
                current = normalize_location(&current, &location)?;
                continue;
            }

            TransferError::check_status(status, 200)?;

            let content_length = header_u64(response.headers(), header::CONTENT_LENGTH);
            let accepts_ranges = accepts_byte_ranges(response.headers());
            let digest = header_digest(response.headers());
            drop(response);

            debug!(
                direct_url = %current,
                ?content_length,
                accepts_ranges,
                "resolved direct URL"
            );
            return Ok(SourceInfo {
                direct_url: current.to_string(),
                content_length,
                digest,
                accepts_ranges,
            });
        }
    }

    /// HEAD the URL and return the advertised digest, if any
    pub async fn fetch_digest(&self, url: &str) -> Result<Option<String>> {
        self.check_interrupted()?;
        let target = parse_url(url)?;
        let response = self.execute(self.client.head(target)).await?;
        TransferError::check_status(response.status().as_u16(), 200)?;
        Ok(header_digest(response.headers()))
    }

    /// Cancel the resolver: pending requests abort and later calls fail
    /// with `Interrupted`
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        let aborted = lock(&self.pending).len();
        if aborted > 0 {
            debug!(aborted, "aborting in-flight resolver requests");
        }
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Number of requests currently registered as in flight
    pub fn pending_requests(&self) -> usize {
        lock(&self.pending).len()
    }

    fn check_interrupted(&self) -> Result<()> {
        if self.is_interrupted() {
            return Err(TransferError::Interrupted);
        }
        Ok(())
    }

    /// Send the request under a correlation-id registration, racing it
    /// against the cancellation signal
    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let (client_req, url) = match request.build() {
            Ok(req) => {
                let url = req.url().to_string();
                (req, url)
            }
            Err(err) => return Err(err.into()),
        };

        let id = Uuid::new_v4();
        let _guard = PendingGuard::register(&self.pending, id, &url);
        let mut cancel = self.cancel_rx.clone();

        tokio::select! {
            result = self.client.execute(client_req) => Ok(result?),
            _ = cancel.changed() => Err(TransferError::Interrupted),
        }
    }
}

fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|e| TransferError::Parse(format!("invalid URL {}: {}", url, e)))
}

/// Resolve a Location value against the responding host. Absolute URLs are
/// used verbatim; host-less values resolve from the host root.
fn normalize_location(base: &Url, location: &str) -> Result<Url> {
    if let Ok(url) = Url::parse(location) {
        return Ok(url);
    }
    let rooted = if location.starts_with('/') {
        location.to_string()
    } else {
        format!("/{}", location)
    };
    base.join(&rooted)
        .map_err(|e| TransferError::Parse(format!("invalid Location {}: {}", location, e)))
}

fn header_u64(headers: &header::HeaderMap, name: header::HeaderName) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

fn accepts_byte_ranges(headers: &header::HeaderMap) -> bool {
    headers
        .get(header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("bytes"))
        .unwrap_or(false)
}

/// Dedicated digest header some storage frontends attach; the plain ETag
/// is the fallback
pub const DIGEST_HEADER: &str = "x-artifact-digest";

pub fn header_digest(headers: &header::HeaderMap) -> Option<String> {
    headers
        .get(DIGEST_HEADER)
        .or_else(|| headers.get(header::ETAG))
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_matches('"').to_string())
        .filter(|v| !v.is_empty())
}
