//! Byte-exact copy loops
//!
//! All body-to-disk and file-to-file copies go through here. Writes happen
//! in buffer-sized pieces and the shared transfer state is polled before
//! every piece, so an interrupt or a sibling-part failure stops a worker
//! within one buffer, not at the end of the body.

use crate::error::{Result, TransferError};
use crate::state::TransferState;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Copy exactly `expected` bytes from an HTTP response body to `dest`.
///
/// Fails with `ByteCountMismatch` when the body is short, and as soon as it
/// runs over. Returns the number of bytes written.
pub async fn transfer_expected_bytes<W>(
    response: &mut reqwest::Response,
    dest: &mut W,
    expected: u64,
    buffer_size: usize,
    state: &Arc<TransferState>,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written: u64 = 0;
    while let Some(chunk) = response.chunk().await? {
        for piece in chunk.chunks(buffer_size) {
            state.check_live()?;
            if written + piece.len() as u64 > expected {
                return Err(TransferError::ByteCountMismatch {
                    expected,
                    actual: written + piece.len() as u64,
                });
            }
            dest.write_all(piece).await?;
            written += piece.len() as u64;
            state.add_transferred(piece.len() as u64);
        }
    }
    dest.flush().await?;

    if written != expected {
        return Err(TransferError::ByteCountMismatch {
            expected,
            actual: written,
        });
    }
    debug!(written, "body transferred");
    Ok(written)
}

/// Copy an HTTP response body to `dest` until exhaustion; used when the
/// source does not advertise a content length
pub async fn transfer_all_bytes<W>(
    response: &mut reqwest::Response,
    dest: &mut W,
    buffer_size: usize,
    state: &Arc<TransferState>,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written: u64 = 0;
    while let Some(chunk) = response.chunk().await? {
        for piece in chunk.chunks(buffer_size) {
            state.check_live()?;
            dest.write_all(piece).await?;
            written += piece.len() as u64;
            state.add_transferred(piece.len() as u64);
        }
    }
    dest.flush().await?;
    debug!(written, "body transferred to exhaustion");
    Ok(written)
}

/// Copy exactly `expected` bytes from `src` to `dest`, checking the shared
/// state between buffers. Used when merging part files into the final file.
///
/// Merge copies do not report progress: their bytes already counted when
/// they first came off the network.
pub async fn transfer_expected_file_bytes<R, W>(
    src: &mut R,
    dest: &mut W,
    expected: u64,
    buffer_size: usize,
    state: &Arc<TransferState>,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut copied: u64 = 0;
    loop {
        state.check_live()?;
        let remaining = expected - copied;
        if remaining == 0 {
            break;
        }
        let want = buf.len().min(remaining as usize);
        let n = src.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(TransferError::ByteCountMismatch {
                expected,
                actual: copied,
            });
        }
        dest.write_all(&buf[..n]).await?;
        copied += n as u64;
    }
    dest.flush().await?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_file_copy_exact() {
        let data = vec![7u8; 10_000];
        let mut src = Cursor::new(data.clone());
        let mut dest = Vec::new();
        let state = TransferState::detached();

        let copied =
            transfer_expected_file_bytes(&mut src, &mut dest, 10_000, 1024, &state)
                .await
                .unwrap();
        assert_eq!(copied, 10_000);
        assert_eq!(dest, data);
    }

    #[tokio::test]
    async fn test_file_copy_short_source() {
        let mut src = Cursor::new(vec![1u8; 100]);
        let mut dest = Vec::new();
        let state = TransferState::detached();

        let err = transfer_expected_file_bytes(&mut src, &mut dest, 200, 64, &state)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::ByteCountMismatch {
                expected: 200,
                actual: 100
            }
        ));
    }

    #[tokio::test]
    async fn test_file_copy_stops_on_interrupt() {
        let mut src = Cursor::new(vec![0u8; 1000]);
        let mut dest = Vec::new();
        let state = TransferState::detached();
        state.interrupt();

        let err = transfer_expected_file_bytes(&mut src, &mut dest, 1000, 64, &state)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Interrupted));
        assert!(dest.is_empty());
    }

    #[tokio::test]
    async fn test_file_copy_only_takes_expected() {
        // source holds more bytes than expected; copy stops at the boundary
        let mut src = Cursor::new(vec![9u8; 500]);
        let mut dest = Vec::new();
        let state = TransferState::detached();

        let copied = transfer_expected_file_bytes(&mut src, &mut dest, 300, 128, &state)
            .await
            .unwrap();
        assert_eq!(copied, 300);
        assert_eq!(dest.len(), 300);
    }
}
