use crate::cancel::CancelToken;
use reqwest::Client;
use std::io;
use std::path::{Path, PathBuf};
use tether_core::{DownloadTarget, Result, TetherError};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Streams an HTTP body to a file, reporting progress as it goes.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
}

impl Downloader {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| TetherError::NetworkError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Download `target` and return the destination path.
    ///
    /// `progress` receives `(bytes_since_last_update, bytes_so_far, total_bytes)`
    /// at most once per percent of the total, then once more at the end.
    /// Cancelling stops the transfer and leaves the partial file behind.
    pub async fn download<F>(
        &self,
        target: &DownloadTarget,
        mut progress: F,
        cancel: &CancelToken,
    ) -> Result<PathBuf>
    where
        F: FnMut(u64, u64, Option<u64>) + Send,
    {
        let destination = target.destination.clone();
        prepare_destination(&destination).await?;

        info!(url = %target.source_url, destination = %destination.display(), "Starting download");

        let mut response = self
            .client
            .get(&target.source_url)
            .send()
            .await
            .map_err(|e| {
                TetherError::NetworkError(format!("Failed to request {}: {}", target.source_url, e))
            })?;

        if !response.status().is_success() {
            return Err(TetherError::NetworkError(format!(
                "{} returned HTTP {}",
                target.source_url,
                response.status()
            )));
        }

        let total = response.content_length().or(target.expected_size);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&destination)
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => TetherError::PathConflict(destination.clone()),
                _ => TetherError::IoError(e),
            })?;

        let mut tracker = ProgressTracker::new(total);
        loop {
            if cancel.is_cancelled() {
                file.flush().await?;
                warn!(
                    destination = %destination.display(),
                    bytes = tracker.so_far,
                    "Download cancelled, leaving partial file"
                );
                return Err(TetherError::Cancelled);
            }

            let chunk = response
                .chunk()
                .await
                .map_err(|e| TetherError::NetworkError(format!("Failed to read body: {}", e)))?;
            let Some(chunk) = chunk else { break };

            file.write_all(&chunk).await?;
            if let Some((since, so_far)) = tracker.advance(chunk.len() as u64) {
                progress(since, so_far, total);
            }
        }
        file.flush().await?;

        let (since, so_far) = tracker.finish();
        progress(since, so_far, total);

        info!(destination = %destination.display(), bytes = so_far, "Download completed");
        Ok(destination)
    }
}

/// Fail fast on an occupied destination; create missing parents.
async fn prepare_destination(destination: &Path) -> Result<()> {
    if fs::symlink_metadata(destination).await.is_ok() {
        return Err(TetherError::PathConflict(destination.to_path_buf()));
    }

    let parent = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return Ok(()),
    };

    match fs::metadata(parent).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(TetherError::NotADirectory(parent.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(parent = %parent.display(), "Creating download directory");
            fs::create_dir_all(parent).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Decides when a progress update is due.
#[derive(Debug)]
struct ProgressTracker {
    total: Option<u64>,
    step: u64,
    so_far: u64,
    reported: u64,
}

impl ProgressTracker {
    fn new(total: Option<u64>) -> Self {
        // Without a known size every chunk is reported.
        let step = total.map(|t| (t / 100).max(1)).unwrap_or(1);
        Self {
            total,
            step,
            so_far: 0,
            reported: 0,
        }
    }

    fn advance(&mut self, bytes: u64) -> Option<(u64, u64)> {
        self.so_far += bytes;
        let pending = self.so_far - self.reported;
        // Leave the 100% update to finish().
        if pending >= self.step && Some(self.so_far) != self.total {
            self.reported = self.so_far;
            Some((pending, self.so_far))
        } else {
            None
        }
    }

    fn finish(&mut self) -> (u64, u64) {
        let pending = self.so_far - self.reported;
        self.reported = self.so_far;
        (pending, self.so_far)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Debug, Default)]
    struct Recorded {
        calls: Vec<(u64, u64, Option<u64>)>,
    }

    impl Recorded {
        fn sum_since(&self) -> u64 {
            self.calls.iter().map(|c| c.0).sum()
        }

        fn last_so_far(&self) -> u64 {
            self.calls.last().map(|c| c.1).unwrap_or_default()
        }
    }

    #[test]
    fn test_tracker_reports_at_most_once_per_percent() {
        let mut tracker = ProgressTracker::new(Some(1000));
        let mut updates = 0;
        for _ in 0..1000 {
            if tracker.advance(1).is_some() {
                updates += 1;
            }
        }
        assert!(updates <= 100);
        assert_eq!(tracker.finish(), (10, 1000));
    }

    #[test]
    fn test_tracker_unknown_total_reports_every_chunk() {
        let mut tracker = ProgressTracker::new(None);
        assert_eq!(tracker.advance(5), Some((5, 5)));
        assert_eq!(tracker.advance(7), Some((7, 12)));
        assert_eq!(tracker.finish(), (0, 12));
    }

    #[test]
    fn test_tracker_empty_body() {
        let mut tracker = ProgressTracker::new(Some(0));
        assert_eq!(tracker.finish(), (0, 0));
    }

    #[tokio::test]
    async fn test_download_writes_body_and_reports_progress() {
        let body: Vec<u8> = (0..250_000u32).map(|i| (i % 251) as u8).collect();
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/sdk.tar.gz")
            .match_header("user-agent", "tether-test/1.0")
            .with_status(200)
            .with_body(&body)
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("nested/dir/sdk.tar.gz");
        let target = DownloadTarget::new(format!("{}/sdk.tar.gz", server.url()), &dest);

        let mut recorded = Recorded::default();
        let downloader = Downloader::new("tether-test/1.0").unwrap();
        let path = downloader
            .download(
                &target,
                |since, so_far, total| recorded.calls.push((since, so_far, total)),
                &CancelToken::new(),
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(path, dest);

        let written = std::fs::read(&dest).unwrap();
        assert_eq!(written, body);

        let size = body.len() as u64;
        assert_eq!(recorded.sum_since(), size);
        assert_eq!(recorded.last_so_far(), size);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), size);
        assert!(recorded.calls.len() <= 101);
        assert_eq!(recorded.calls.last().unwrap().2, Some(size));
    }

    #[tokio::test]
    async fn test_existing_destination_is_rejected_without_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/file")
            .expect(0)
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("file");
        std::fs::write(&dest, b"already here").unwrap();

        let downloader = Downloader::new("tether-test/1.0").unwrap();
        let err = downloader
            .download(
                &DownloadTarget::new(format!("{}/file", server.url()), &dest),
                |_, _, _| {},
                &CancelToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TetherError::PathConflict(ref p) if p == &dest));
        mock.assert_async().await;
        assert_eq!(std::fs::read(&dest).unwrap(), b"already here");
    }

    #[tokio::test]
    async fn test_parent_that_is_a_file_is_rejected() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let downloader = Downloader::new("tether-test/1.0").unwrap();
        let err = downloader
            .download(
                &DownloadTarget::new("http://127.0.0.1:9/never", blocker.join("file")),
                |_, _, _| {},
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::NotADirectory(ref p) if p == &blocker));
    }

    #[tokio::test]
    async fn test_http_error_status_fails() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/missing")
            .with_status(404)
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("missing");
        let downloader = Downloader::new("tether-test/1.0").unwrap();
        let err = downloader
            .download(
                &DownloadTarget::new(format!("{}/missing", server.url()), &dest),
                |_, _, _| {},
                &CancelToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TetherError::NetworkError(_)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_cancelled_download_stops() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/big")
            .with_body(vec![b'x'; 64 * 1024])
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("big");
        let cancel = CancelToken::new();
        cancel.cancel();

        let downloader = Downloader::new("tether-test/1.0").unwrap();
        let err = downloader
            .download(
                &DownloadTarget::new(format!("{}/big", server.url()), &dest),
                |_, _, _| {},
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        // Partial file stays behind.
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn test_cancel_between_chunks_leaves_partial_file() {
        const CHUNK: usize = 4096;
        const CHUNKS: usize = 10;
        let total = (CHUNK * CHUNKS) as u64;

        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/slow")
            .with_chunked_body(|w| {
                for _ in 0..CHUNKS {
                    w.write_all(&[b'y'; CHUNK])?;
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
                Ok(())
            })
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("slow");
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let mut updates = 0;

        let downloader = Downloader::new("tether-test/1.0").unwrap();
        let err = downloader
            .download(
                &DownloadTarget::new(format!("{}/slow", server.url()), &dest)
                    .with_expected_size(total),
                |_, _, _| {
                    updates += 1;
                    trigger.cancel();
                },
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(updates, 1);
        let written = std::fs::metadata(&dest).unwrap().len();
        assert!(written > 0);
        assert!(written < total);
    }
}
