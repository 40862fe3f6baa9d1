//! Retry policy for upload attempts
//!
//! The policy decides *whether* to retry from the error taxonomy; the
//! context carries the mutable per-upload knobs that change between
//! attempts, currently the presigned-URL TTL.

use crate::error::TransferError;
use std::time::Duration;
use tracing::debug;

/// Attempt-count and backoff policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            max_retries,
            base_delay,
        }
    }

    /// Whether the attempt numbered `attempt` (0-based) may be followed by
    /// another one. Broken pipes never retry: the peer closed the
    /// connection on a stale link and the same URL will fail again. An
    /// expired-link 403 retries even though 403 is fatal by status; the
    /// next attempt uses a fresh URL with a doubled TTL.
    pub fn should_retry(&self, attempt: u32, error: &TransferError) -> bool {
        if attempt >= self.max_retries {
            return false;
        }
        if error.is_broken_pipe() {
            return false;
        }
        error.is_url_expired() || error.is_recoverable()
    }

    /// Exponential backoff: `base * 2^attempt`
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }

    pub async fn sleep_before_retry(&self, attempt: u32) {
        let delay = self.backoff_duration(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
        tokio::time::sleep(delay).await;
    }
}

/// Mutable state carried across the attempts of one upload.
///
/// When the store rejects a presigned URL as expired, the next batch of
/// URLs is requested with a doubled TTL, capped at the extended TTL.
#[derive(Debug, Clone)]
pub struct RetryContext {
    current_ttl: Duration,
    extended_ttl: Duration,
}

impl RetryContext {
    pub fn new(default_ttl: Duration, extended_ttl: Duration) -> Self {
        RetryContext {
            current_ttl: default_ttl,
            extended_ttl,
        }
    }

    /// TTL to request presigned URLs with on the current attempt
    pub fn url_ttl(&self) -> Duration {
        self.current_ttl
    }

    /// Double the TTL for the next attempt, up to the extended cap
    pub fn extend_ttl(&mut self) {
        let doubled = self.current_ttl.saturating_mul(2);
        self.current_ttl = doubled.min(self.extended_ttl);
        debug!(ttl_secs = self.current_ttl.as_secs(), "extended presigned URL TTL");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(5, Duration::from_millis(100))
    }

    #[test]
    fn test_retries_recoverable_errors() {
        let err = TransferError::from_http_status(503, "unavailable");
        assert!(policy().should_retry(0, &err));
        assert!(policy().should_retry(4, &err));
        assert!(!policy().should_retry(5, &err));
    }

    #[test]
    fn test_never_retries_fatal_errors() {
        let err = TransferError::from_http_status(400, "bad request");
        assert!(!policy().should_retry(0, &err));
    }

    #[test]
    fn test_retries_expired_links_but_not_plain_403() {
        let expired = TransferError::from_http_status(403, "Request has expired");
        assert!(!expired.is_recoverable());
        assert!(policy().should_retry(0, &expired));
        assert!(!policy().should_retry(5, &expired));

        let denied = TransferError::from_http_status(403, "Access denied");
        assert!(!policy().should_retry(0, &denied));
    }

    #[test]
    fn test_never_retries_broken_pipe() {
        let err = TransferError::Transport("Broken pipe (os error 32)".into());
        assert!(err.is_recoverable());
        assert!(!policy().should_retry(0, &err));
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let p = policy();
        assert_eq!(p.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(p.backoff_duration(1), Duration::from_millis(200));
        assert_eq!(p.backoff_duration(3), Duration::from_millis(800));
    }

    #[test]
    fn test_ttl_doubles_and_caps() {
        let mut ctx = RetryContext::new(Duration::from_secs(60), Duration::from_secs(3600));
        assert_eq!(ctx.url_ttl(), Duration::from_secs(60));

        ctx.extend_ttl();
        assert_eq!(ctx.url_ttl(), Duration::from_secs(120));

        for _ in 0..10 {
            ctx.extend_ttl();
        }
        assert_eq!(ctx.url_ttl(), Duration::from_secs(3600));
    }
}
