//! Atomic durable writes with bounded retry.
//!
//! Every durable record in the coordinator goes through the same path:
//! write a temp file, fsync it, then rename over the target (POSIX rename
//! atomicity). A reader polling the file never observes a torn record.
//! Write failures are retried with backoff; a persistent failure is fatal
//! to the run, since the coordinator cannot guarantee consistency once a
//! committed state fails to land on disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tracing::{debug, warn};

use crate::error::{store_err_with, Result};

#[derive(Debug, Clone)]
pub struct AtomicWriter {
    retries: u32,
    retry_delay: Duration,
}

impl Default for AtomicWriter {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl AtomicWriter {
    pub fn new(retries: u32, retry_delay: Duration) -> Self {
        Self {
            retries,
            retry_delay,
        }
    }

    /// Durably writes `content` to `path`. Retries transient failures;
    /// returns a fatal store error once the retry budget is exhausted.
    pub async fn write(&self, path: &Path, content: &str) -> Result<()> {
        let mut last_err = None;

        for attempt in 0..=self.retries {
            match self.write_once(path, content).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        attempt,
                        error = %e,
                        "Durable write failed"
                    );
                    last_err = Some(e);
                    if attempt < self.retries {
                        tokio::time::sleep(self.retry_delay * (attempt + 1)).await;
                    }
                }
            }
        }

        Err(store_err_with(
            "durable write failed after retries, halting",
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    async fn write_once(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = tmp_path_for(path);
        fs::write(&tmp_path, content).await?;

        // Sync to disk off the async runtime.
        let sync_target = tmp_path.clone();
        let synced = tokio::task::spawn_blocking(move || {
            std::fs::File::open(&sync_target).and_then(|file| file.sync_all())
        })
        .await;

        match synced {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to sync temp file to disk"),
            Err(e) => warn!(error = %e, "Sync task panicked"),
        }

        fs::rename(&tmp_path, path).await?;
        debug!(path = %path.display(), "Atomic write completed");
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Removes `*.tmp` leftovers from writes interrupted by a crash. Called
/// once per directory at startup; the renamed targets are always whole.
pub async fn recover_interrupted_writes(dir: &Path) {
    if let Ok(mut entries) = fs::read_dir(dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "tmp") {
                debug!(path = %path.display(), "Removing interrupted write");
                let _ = fs::remove_file(&path).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("record.yaml");
        let writer = AtomicWriter::default();

        writer.write(&path, "status: ok\n").await.unwrap();
        let content = fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "status: ok\n");
    }

    #[tokio::test]
    async fn test_overwrite_is_whole() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("record.yaml");
        let writer = AtomicWriter::default();

        writer.write(&path, "version: 1\n").await.unwrap();
        writer.write(&path, "version: 2\n").await.unwrap();

        let content = fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "version: 2\n");
    }

    #[tokio::test]
    async fn test_recover_removes_tmp_files() {
        let dir = TempDir::new().unwrap();
        let stale = dir.path().join("record.yaml.tmp");
        fs::write(&stale, "partial").await.unwrap();

        recover_interrupted_writes(dir.path()).await;
        assert!(!stale.exists());
    }
}
