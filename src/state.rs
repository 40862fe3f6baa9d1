//! Shared state for an in-flight parallel transfer
//!
//! One `TransferState` is shared by every part worker of a download. It
//! carries the external interrupt flag, the first-failure latch and the
//! transferred-byte counter. Failures are plain latched values, not unwound
//! panics: workers record them here and the coordinator reads them back
//! after all tasks settle.

use crate::error::{Result, TransferError};
use crate::models::FilePart;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// The first part failure observed during a parallel transfer
#[derive(Debug, Clone)]
pub struct PartFailure {
    pub part: FilePart,
    pub error: TransferError,
}

impl PartFailure {
    /// Fold the failure into a transfer-level error carrying the byte range
    pub fn to_error(&self) -> TransferError {
        TransferError::PartFailed {
            part_number: self.part.part_number,
            start: self.part.range.start,
            end: self.part.range.end,
            message: self.error.to_string(),
        }
    }
}

/// Receives progress callbacks as bytes land on disk.
///
/// Implementations must be cheap: workers report from the hot copy loop.
pub trait ProgressSink: Send + Sync {
    /// Total size is known up front for splittable downloads
    fn set_expected(&self, total_bytes: u64);
    /// A buffer of `bytes` was written; deltas, not totals
    fn transferred(&self, bytes: u64);
}

/// A sink that ignores every report
#[derive(Debug, Default)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn set_expected(&self, _total_bytes: u64) {}
    fn transferred(&self, _bytes: u64) {}
}

/// Shared interrupt / failure / progress state for one transfer
pub struct TransferState {
    interrupted: AtomicBool,
    first_failure: Mutex<Option<PartFailure>>,
    transferred: AtomicU64,
    progress: Arc<dyn ProgressSink>,
}

impl TransferState {
    pub fn new(progress: Arc<dyn ProgressSink>) -> Arc<Self> {
        Arc::new(TransferState {
            interrupted: AtomicBool::new(false),
            first_failure: Mutex::new(None),
            transferred: AtomicU64::new(0),
            progress,
        })
    }

    /// State with no progress reporting
    pub fn detached() -> Arc<Self> {
        Self::new(Arc::new(NullProgressSink))
    }

    /// Request cancellation. Workers observe the flag between buffer writes.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Record a part failure. Only the first one is kept; later failures are
    /// logged and dropped so the surfaced error names the part that broke
    /// the transfer, not whichever task happened to settle last.
    pub fn record_failure(&self, part: FilePart, error: TransferError) {
        let mut slot = match self.first_failure.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_none() {
            *slot = Some(PartFailure { part, error });
        } else {
            debug!(
                part = %part.description(),
                %error,
                "dropping subsequent part failure"
            );
        }
    }

    pub fn has_failure(&self) -> bool {
        match self.first_failure.lock() {
            Ok(slot) => slot.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    pub fn first_failure(&self) -> Option<PartFailure> {
        match self.first_failure.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Fail fast between buffer writes: interrupted, or another part has
    /// already failed. Workers call this once per buffer.
    pub fn check_live(&self) -> Result<()> {
        if self.is_interrupted() {
            return Err(TransferError::Interrupted);
        }
        if let Some(failure) = self.first_failure() {
            return Err(failure.to_error());
        }
        Ok(())
    }

    pub fn set_expected(&self, total_bytes: u64) {
        self.progress.set_expected(total_bytes);
    }

    /// Add `bytes` to the running total and forward to the sink
    pub fn add_transferred(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
        self.progress.transferred(bytes);
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ByteRange;

    fn part(n: u32, start: u64, end: u64) -> FilePart {
        FilePart::new(n, ByteRange::new(start, end).unwrap())
    }

    #[test]
    fn test_interrupt_flag() {
        let state = TransferState::detached();
        assert!(!state.is_interrupted());
        assert!(state.check_live().is_ok());

        state.interrupt();
        assert!(state.is_interrupted());
        assert!(matches!(
            state.check_live(),
            Err(TransferError::Interrupted)
        ));
    }

    #[test]
    fn test_first_failure_wins() {
        let state = TransferState::detached();
        state.record_failure(part(1, 100, 199), TransferError::from_http_status(500, "a"));
        state.record_failure(part(2, 200, 299), TransferError::from_http_status(503, "b"));

        let failure = state.first_failure().unwrap();
        assert_eq!(failure.part.part_number, 1);
    }

    #[test]
    fn test_failure_error_carries_byte_range() {
        let state = TransferState::detached();
        state.record_failure(
            part(3, 300, 399),
            TransferError::from_http_status(502, "bad gateway"),
        );

        match state.check_live().unwrap_err() {
            TransferError::PartFailed {
                part_number,
                start,
                end,
                ..
            } => {
                assert_eq!(part_number, 3);
                assert_eq!(start, 300);
                assert_eq!(end, 399);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_progress_accumulates() {
        let state = TransferState::detached();
        state.add_transferred(1024);
        state.add_transferred(512);
        assert_eq!(state.transferred_bytes(), 1536);
    }

    #[test]
    fn test_progress_sink_receives_deltas() {
        struct Recorder(AtomicU64);
        impl ProgressSink for Recorder {
            fn set_expected(&self, _total: u64) {}
            fn transferred(&self, bytes: u64) {
                self.0.fetch_add(bytes, Ordering::Relaxed);
            }
        }

        let sink = Arc::new(Recorder(AtomicU64::new(0)));
        let state = TransferState::new(sink.clone());
        state.add_transferred(10);
        state.add_transferred(20);
        assert_eq!(sink.0.load(Ordering::Relaxed), 30);
    }
}
