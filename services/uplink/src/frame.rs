//! Frame and image types shared by the detector, the uploader and the transport.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::error::{ImageError, ParameterError, ParameterErrorKind};
use image::ExtendedColorType;
use serde::{Deserialize, Serialize};

/// Pixel layout of a raw (already decoded) image buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb8,
    Rgba8,
}

impl PixelFormat {
    /// Bytes per pixel for this layout.
    pub fn channels(&self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 => 4,
        }
    }
}

/// A decoded pixel buffer with its source dimensions.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl RawImage {
    fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.channels()
    }

    /// Encode as JPEG for upload. Alpha is dropped.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Bytes, ImageError> {
        if self.width == 0 || self.height == 0 || self.data.len() < self.expected_len() {
            return Err(ImageError::Parameter(ParameterError::from_kind(
                ParameterErrorKind::DimensionMismatch,
            )));
        }

        let pixels = &self.data[..self.expected_len()];
        let rgb: Vec<u8> = match self.format {
            PixelFormat::Rgb8 => pixels.to_vec(),
            PixelFormat::Rgba8 => pixels
                .chunks_exact(4)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect(),
        };

        let mut encoded = Vec::new();
        JpegEncoder::new_with_quality(&mut encoded, quality).encode(
            &rgb,
            self.width,
            self.height,
            ExtendedColorType::Rgb8,
        )?;
        Ok(Bytes::from(encoded))
    }
}

/// Image input accepted by the change detector.
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// Encoded image file contents (JPEG, PNG, ...)
    Encoded(Bytes),
    /// Raw pixels straight from a capture device
    Raw(RawImage),
}

impl ImageSource {
    /// Wrap encoded image bytes.
    pub fn encoded(data: impl Into<Bytes>) -> Self {
        ImageSource::Encoded(data.into())
    }

    /// Wrap a raw pixel buffer.
    pub fn raw(data: impl Into<Bytes>, width: u32, height: u32, format: PixelFormat) -> Self {
        ImageSource::Raw(RawImage {
            data: data.into(),
            width,
            height,
            format,
        })
    }
}

/// A frame admitted for analysis.
///
/// Frames are immutable once constructed; the image payload is reference
/// counted so handing a snapshot to a transmission does not copy pixels.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Image payload sent to the analysis service
    pub image: Bytes,

    /// Subject (patient) the frame belongs to
    pub subject_id: String,

    /// Capture device, if known
    pub source_id: Option<String>,

    /// Offset of the capture within the monitoring session
    pub capture_offset_ms: u64,

    /// Wall-clock time the frame was queued
    pub enqueued_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(
        image: impl Into<Bytes>,
        subject_id: impl Into<String>,
        source_id: Option<String>,
        capture_offset_ms: u64,
    ) -> Self {
        Self {
            image: image.into(),
            subject_id: subject_id.into(),
            source_id,
            capture_offset_ms,
            enqueued_at: Utc::now(),
        }
    }

    /// Per-frame metadata record for a batch request.
    pub fn metadata(&self) -> FrameMetadata {
        FrameMetadata {
            subject_id: self.subject_id.clone(),
            source_id: self.source_id.clone().unwrap_or_default(),
            capture_offset_ms: self.capture_offset_ms,
        }
    }
}

/// Metadata record aligned positionally with the image parts of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMetadata {
    #[serde(rename = "patient_id")]
    pub subject_id: String,

    /// Empty when the frame has no source device
    #[serde(rename = "camera_id")]
    pub source_id: String,

    #[serde(rename = "timestamp_ms")]
    pub capture_offset_ms: u64,
}

/// Outcome status for a single frame of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failed,
}

/// Analysis result for one frame of a batch, in submission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameResult {
    pub index: usize,
    pub status: ResultStatus,

    /// Analysis payload, owned by the remote service
    #[serde(default)]
    pub result: Option<serde_json::Value>,

    #[serde(default)]
    pub error: Option<String>,
}

impl FrameResult {
    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

/// Response of the single-frame analysis endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub status: String,

    #[serde(default)]
    pub result_id: Option<String>,

    #[serde(default)]
    pub analysis: Option<serde_json::Value>,

    #[serde(default)]
    pub error: Option<String>,
}
