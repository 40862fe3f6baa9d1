//! Filesystem helpers for staged downloads
//!
//! Downloads never write the destination name directly: bytes land in an
//! `<name>.unfinished` sibling (or `<name>.part.<n>` files) and the final
//! name appears only through an atomic rename once the content is complete.

use crate::error::{Result, TransferError};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// How many times an atomic rename is attempted before giving up. Renames
/// on network shares and on Windows can fail transiently while scanners
/// hold the source open.
pub const RENAME_ATTEMPTS: u32 = 10;

const RENAME_RETRY_DELAY_MS: u64 = 100;

/// Staging path for a whole-file download: `<name>.unfinished`
pub fn unfinished_path(target: &Path) -> PathBuf {
    appended_extension(target, "unfinished")
}

/// Staging path for one part: `<name>.part.<n>`
pub fn part_path(target: &Path, part_number: u32) -> PathBuf {
    appended_extension(target, &format!("part.{}", part_number))
}

fn appended_extension(target: &Path, suffix: &str) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Create the file together with any missing parent directories
pub async fn create_file(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(fs::File::create(path).await?)
}

/// Create the file and extend it to `size` bytes so positioned part writes
/// never race file growth
pub async fn reserve_file_bytes(path: &Path, size: u64) -> Result<()> {
    let file = create_file(path).await?;
    file.set_len(size).await?;
    file.sync_all().await?;
    debug!(path = %path.display(), size, "reserved file bytes");
    Ok(())
}

/// Move `from` over `to`, retrying transient failures a bounded number of
/// times. A pre-existing `to` is replaced.
pub async fn atomic_rename(from: &Path, to: &Path) -> Result<()> {
    let mut last_err: Option<std::io::Error> = None;
    for attempt in 1..=RENAME_ATTEMPTS {
        match fs::rename(from, to).await {
            Ok(()) => {
                if attempt > 1 {
                    debug!(
                        from = %from.display(),
                        to = %to.display(),
                        attempt,
                        "rename succeeded after retries"
                    );
                }
                return Ok(());
            }
            Err(err) => {
                warn!(
                    from = %from.display(),
                    to = %to.display(),
                    attempt,
                    error = %err,
                    "rename failed"
                );
                last_err = Some(err);
                tokio::time::sleep(std::time::Duration::from_millis(RENAME_RETRY_DELAY_MS))
                    .await;
            }
        }
    }
    Err(TransferError::Io(format!(
        "failed to rename {} to {} after {} attempts: {}",
        from.display(),
        to.display(),
        RENAME_ATTEMPTS,
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Best-effort removal of a staging file; never masks the primary error
pub async fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to remove staging file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_unfinished_path() {
        let p = unfinished_path(Path::new("/tmp/artifact.zip"));
        assert_eq!(p, Path::new("/tmp/artifact.zip.unfinished"));
    }

    #[test]
    fn test_part_path() {
        let p = part_path(Path::new("/tmp/artifact.zip"), 3);
        assert_eq!(p, Path::new("/tmp/artifact.zip.part.3"));
    }

    #[tokio::test]
    async fn test_create_file_makes_parents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a/b/c.bin");
        create_file(&path).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_reserve_file_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reserved.bin");
        reserve_file_bytes(&path, 4096).await.unwrap();
        let meta = fs::metadata(&path).await.unwrap();
        assert_eq!(meta.len(), 4096);
    }

    #[tokio::test]
    async fn test_atomic_rename_replaces_destination() {
        let dir = tempdir().unwrap();
        let from = dir.path().join("staged");
        let to = dir.path().join("final");
        fs::write(&from, b"new content").await.unwrap();
        fs::write(&to, b"old").await.unwrap();

        atomic_rename(&from, &to).await.unwrap();
        assert!(!from.exists());
        assert_eq!(fs::read(&to).await.unwrap(), b"new content");
    }

    #[tokio::test]
    async fn test_remove_quietly_missing_file() {
        let dir = tempdir().unwrap();
        // absent file must not panic or log an error-level event
        remove_quietly(&dir.path().join("nope")).await;
    }
}
