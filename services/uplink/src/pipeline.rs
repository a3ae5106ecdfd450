//! Per-subject frame pipeline: change detection followed by batched upload.

use crate::batch_uploader::{BatchUploader, UploadError, UploaderStatus};
use crate::change_detector::{ChangeDetector, DetectorStats};
use crate::frame::{Frame, FrameResult, ImageSource};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// JPEG quality used when raw captures are encoded for upload.
pub const JPEG_QUALITY: u8 = 80;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Upload(#[from] UploadError),
}

/// What happened to a submitted frame.
#[derive(Debug)]
pub enum Submission {
    /// Too similar to the last admitted frame
    Skipped,
    /// Admitted and waiting in the buffer
    Buffered,
    /// Admitted and sent, together with the rest of the batch
    Uploaded(Vec<FrameResult>),
}

impl Submission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Submission::Skipped)
    }
}

pub struct FramePipeline {
    detector: Mutex<ChangeDetector>,
    uploader: BatchUploader,
    subject_id: String,
    source_id: Option<String>,
}

impl FramePipeline {
    pub fn new(
        detector: ChangeDetector,
        uploader: BatchUploader,
        subject_id: impl Into<String>,
        source_id: Option<String>,
    ) -> Self {
        Self {
            detector: Mutex::new(detector),
            uploader,
            subject_id: subject_id.into(),
            source_id,
        }
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn uploader(&self) -> &BatchUploader {
        &self.uploader
    }

    /// Run a captured image through the detector and buffer it if admitted.
    #[instrument(skip(self, image), fields(subject_id = %self.subject_id))]
    pub async fn submit(
        &self,
        image: ImageSource,
        capture_offset_ms: u64,
    ) -> Result<Submission, PipelineError> {
        if !self.detector.lock().admit(&image) {
            debug!(capture_offset_ms, "Frame skipped");
            return Ok(Submission::Skipped);
        }

        let payload = match image {
            ImageSource::Encoded(bytes) => bytes,
            ImageSource::Raw(raw) => match raw.encode_jpeg(JPEG_QUALITY) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!(
                        error = %e,
                        capture_offset_ms,
                        "Raw frame could not be encoded, sending pixels as-is"
                    );
                    raw.data
                }
            },
        };
        let frame = Frame::new(
            payload,
            self.subject_id.clone(),
            self.source_id.clone(),
            capture_offset_ms,
        );

        match self.uploader.add(frame).await? {
            Some(results) => Ok(Submission::Uploaded(results)),
            None => Ok(Submission::Buffered),
        }
    }

    /// Send whatever is buffered.
    pub async fn flush(&self) -> Result<Vec<FrameResult>, PipelineError> {
        Ok(self.uploader.flush().await?)
    }

    /// Start a new monitoring session: the next frame is always admitted and
    /// buffered frames from the previous session are discarded.
    pub fn start_session(&self) {
        self.detector.lock().reset();
        self.uploader.reset();
        info!(subject_id = %self.subject_id, "Monitoring session started");
    }

    pub fn detector_stats(&self) -> DetectorStats {
        self.detector.lock().stats()
    }

    pub fn uploader_status(&self) -> UploaderStatus {
        self.uploader.status()
    }
}

impl std::fmt::Debug for FramePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePipeline")
            .field("subject_id", &self.subject_id)
            .field("source_id", &self.source_id)
            .field("uploader", &self.uploader)
            .finish()
    }
}
