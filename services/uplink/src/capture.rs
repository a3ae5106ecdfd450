//! Frame source that replays image files from a directory.

use crate::config::CaptureConfig;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to read capture directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No image files found in {0}")]
    NoFrames(PathBuf),
}

/// Encoded image read from disk, stamped with its offset in the session.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub bytes: Bytes,
    pub offset_ms: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DirectoryCapture {
    directory: PathBuf,
    interval: Duration,
    extensions: Vec<String>,
    loop_playback: bool,
}

impl DirectoryCapture {
    pub fn new(directory: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            directory: directory.into(),
            interval,
            extensions: vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()],
            loop_playback: false,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(&config.directory, config.interval())
            .with_extensions(config.extensions.iter().cloned())
            .looping(config.loop_playback)
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|ext| ext.into().trim_start_matches('.').to_ascii_lowercase())
            .collect();
        self
    }

    pub fn looping(mut self, loop_playback: bool) -> Self {
        self.loop_playback = loop_playback;
        self
    }

    fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|allowed| *allowed == ext)
            })
            .unwrap_or(false)
    }

    /// Image files in the directory, sorted by file name.
    pub async fn list_frames(&self) -> Result<Vec<PathBuf>, CaptureError> {
        let directory_error = |source| CaptureError::Directory {
            path: self.directory.clone(),
            source,
        };

        let mut entries = tokio::fs::read_dir(&self.directory)
            .await
            .map_err(directory_error)?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(directory_error)? {
            let path = entry.path();
            let is_dir = entry
                .file_type()
                .await
                .map(|file_type| file_type.is_dir())
                .unwrap_or(false);

            if !is_dir && self.matches_extension(&path) {
                files.push(path);
            }
        }

        files.sort();
        Ok(files)
    }

    /// Send frames at the configured interval until the files run out (or
    /// forever when looping) or the receiver is dropped.
    ///
    /// Returns the number of frames sent.
    pub async fn run(&self, tx: mpsc::Sender<CapturedFrame>) -> Result<u64, CaptureError> {
        let files = self.list_frames().await?;
        if files.is_empty() {
            return Err(CaptureError::NoFrames(self.directory.clone()));
        }

        info!(
            directory = %self.directory.display(),
            files = files.len(),
            interval_ms = self.interval.as_millis() as u64,
            loop_playback = self.loop_playback,
            "Starting directory capture"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let interval_ms = self.interval.as_millis() as u64;
        let mut tick: u64 = 0;
        let mut sent: u64 = 0;

        loop {
            for path in &files {
                ticker.tick().await;
                let offset_ms = tick * interval_ms;
                tick += 1;

                let bytes = match tokio::fs::read(path).await {
                    Ok(bytes) => Bytes::from(bytes),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable frame");
                        continue;
                    }
                };

                debug!(path = %path.display(), offset_ms, "Captured frame");
                let frame = CapturedFrame {
                    bytes,
                    offset_ms,
                    path: path.clone(),
                };
                if tx.send(frame).await.is_err() {
                    debug!("Capture receiver dropped, stopping");
                    return Ok(sent);
                }
                sent += 1;
            }

            if !self.loop_playback {
                break;
            }
        }

        info!(frames = sent, "Directory capture finished");
        Ok(sent)
    }

    /// Spawn [`DirectoryCapture::run`] feeding a bounded queue.
    pub fn start(
        self,
        queue_size: usize,
    ) -> (
        mpsc::Receiver<CapturedFrame>,
        JoinHandle<Result<u64, CaptureError>>,
    ) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let handle = tokio::spawn(async move { self.run(tx).await });
        (rx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_directory(files: &[(&str, &[u8])]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, contents) in files {
            std::fs::write(dir.path().join(name), contents).unwrap();
        }
        dir
    }

    fn names(paths: &[PathBuf]) -> Vec<String> {
        paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_lists_matching_files_sorted() {
        let dir = create_test_directory(&[
            ("c.PNG", b"c"),
            ("a.jpg", b"a"),
            ("notes.txt", b"n"),
            ("b.jpeg", b"b"),
        ]);
        std::fs::create_dir(dir.path().join("nested.png")).unwrap();

        let capture = DirectoryCapture::new(dir.path(), Duration::from_millis(100));
        let files = capture.list_frames().await.unwrap();

        assert_eq!(names(&files), vec!["a.jpg", "b.jpeg", "c.PNG"]);
    }

    #[tokio::test]
    async fn test_custom_extensions() {
        let dir = create_test_directory(&[("a.jpg", b"a"), ("b.webp", b"b")]);

        let capture = DirectoryCapture::new(dir.path(), Duration::from_millis(100))
            .with_extensions([".WEBP"]);
        let files = capture.list_frames().await.unwrap();

        assert_eq!(names(&files), vec!["b.webp"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_sent_with_offsets() {
        let dir = create_test_directory(&[("001.png", b"one"), ("002.png", b"two")]);

        let capture = DirectoryCapture::new(dir.path(), Duration::from_millis(250));
        let (mut rx, handle) = capture.start(4);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(rx.recv().await.is_none());

        assert_eq!(&first.bytes[..], b"one");
        assert_eq!(first.offset_ms, 0);
        assert_eq!(&second.bytes[..], b"two");
        assert_eq!(second.offset_ms, 250);
        assert_eq!(handle.await.unwrap().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_looping_stops_when_receiver_dropped() {
        let dir = create_test_directory(&[("only.jpg", b"frame")]);

        let capture = DirectoryCapture::new(dir.path(), Duration::from_millis(100)).looping(true);
        let (mut rx, handle) = capture.start(1);

        let offsets: Vec<u64> = vec![
            rx.recv().await.unwrap().offset_ms,
            rx.recv().await.unwrap().offset_ms,
            rx.recv().await.unwrap().offset_ms,
        ];
        assert_eq!(offsets, vec![0, 100, 200]);

        drop(rx);
        let sent = handle.await.unwrap().unwrap();
        assert!(sent >= 3);
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn test_unreadable_file_is_skipped() {
        let dir = create_test_directory(&[("a.png", b"a"), ("c.png", b"c")]);
        std::os::unix::fs::symlink(dir.path().join("missing"), dir.path().join("b.png")).unwrap();

        let capture = DirectoryCapture::new(dir.path(), Duration::from_millis(100));
        let (mut rx, handle) = capture.start(4);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(rx.recv().await.is_none());

        assert_eq!(first.offset_ms, 0);
        assert_eq!(&second.bytes[..], b"c");
        assert_eq!(second.offset_ms, 200);
        assert_eq!(handle.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_directory() {
        let dir = create_test_directory(&[("readme.md", b"x")]);
        let capture = DirectoryCapture::new(dir.path(), Duration::from_millis(100));

        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            capture.run(tx).await,
            Err(CaptureError::NoFrames(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let capture = DirectoryCapture::new("/nonexistent/frames", Duration::from_millis(100));
        assert!(matches!(
            capture.list_frames().await,
            Err(CaptureError::Directory { .. })
        ));
    }
}
