//! Change detection for incoming camera frames.
//!
//! Every frame is reduced to a small fixed-size RGB signature and compared
//! with the signature of the last admitted frame. Only frames that differ by
//! more than the configured threshold are admitted for analysis.

use crate::frame::{ImageSource, PixelFormat, RawImage};
use image::imageops::FilterType;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Signature width in pixels.
pub const SIGNATURE_WIDTH: u32 = 160;

/// Signature height in pixels.
pub const SIGNATURE_HEIGHT: u32 = 120;

/// Default admission threshold.
pub const DEFAULT_THRESHOLD: f64 = 0.15;

const SIGNATURE_CHANNELS: usize = 3;

/// Errors raised while reducing an image to a signature.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("Image decode failed: {0}")]
    DecodeFailed(#[from] image::ImageError),

    #[error("Invalid frame dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Pixel buffer too short: expected {expected} bytes, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },
}

/// Downsampled RGB pixels used only for difference scoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pixels: Vec<u8>,
}

impl Signature {
    /// Wrap packed RGB pixels.
    pub fn from_rgb(pixels: Vec<u8>) -> Self {
        Self { pixels }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.pixels
    }

    /// Mean per-channel absolute delta against `other`, normalized to [0, 1].
    ///
    /// Signatures of different sizes are maximally different.
    pub fn difference(&self, other: &Signature) -> f64 {
        if self.pixels.len() != other.pixels.len() || self.pixels.is_empty() {
            return 1.0;
        }

        let pixel_count = self.pixels.len() / SIGNATURE_CHANNELS;
        let diff_sum: f64 = self
            .pixels
            .chunks_exact(SIGNATURE_CHANNELS)
            .zip(other.pixels.chunks_exact(SIGNATURE_CHANNELS))
            .map(|(a, b)| {
                let channel_sum: u32 = a
                    .iter()
                    .zip(b.iter())
                    .map(|(x, y)| x.abs_diff(*y) as u32)
                    .sum();
                channel_sum as f64 / SIGNATURE_CHANNELS as f64
            })
            .sum();

        diff_sum / (pixel_count as f64 * 255.0)
    }
}

/// Capability that reduces an image to a fixed-size signature.
pub trait SignatureExtractor: Send + Sync {
    fn extract(&self, source: &ImageSource) -> Result<Signature, SignatureError>;
}

/// Default extractor: decodes encoded images with the `image` crate and
/// samples raw buffers down to the signature resolution.
#[derive(Debug, Default, Clone)]
pub struct DownsampleExtractor;

impl DownsampleExtractor {
    fn from_encoded(&self, data: &[u8]) -> Result<Signature, SignatureError> {
        let decoded = image::load_from_memory(data)?;
        let resized = decoded.resize_exact(SIGNATURE_WIDTH, SIGNATURE_HEIGHT, FilterType::Triangle);
        Ok(Signature::from_rgb(resized.to_rgb8().into_raw()))
    }

    /// Nearest-neighbour resize of a raw buffer, dropping alpha.
    fn from_raw(&self, raw: &RawImage) -> Result<Signature, SignatureError> {
        if raw.width == 0 || raw.height == 0 {
            return Err(SignatureError::InvalidDimensions {
                width: raw.width,
                height: raw.height,
            });
        }

        let src_channels = raw.format.channels();
        let expected = raw.width as usize * raw.height as usize * src_channels;
        if raw.data.len() < expected {
            return Err(SignatureError::BufferTooShort {
                expected,
                actual: raw.data.len(),
            });
        }

        let dst_size = (SIGNATURE_WIDTH * SIGNATURE_HEIGHT) as usize * SIGNATURE_CHANNELS;
        let mut output = vec![0u8; dst_size];

        let x_ratio = raw.width as f32 / SIGNATURE_WIDTH as f32;
        let y_ratio = raw.height as f32 / SIGNATURE_HEIGHT as f32;

        for y in 0..SIGNATURE_HEIGHT {
            for x in 0..SIGNATURE_WIDTH {
                let src_x = ((x as f32 * x_ratio) as u32).min(raw.width - 1);
                let src_y = ((y as f32 * y_ratio) as u32).min(raw.height - 1);

                let src_idx = (src_y as usize * raw.width as usize + src_x as usize) * src_channels;
                let dst_idx = (y * SIGNATURE_WIDTH + x) as usize * SIGNATURE_CHANNELS;

                output[dst_idx..dst_idx + SIGNATURE_CHANNELS]
                    .copy_from_slice(&raw.data[src_idx..src_idx + SIGNATURE_CHANNELS]);
            }
        }

        Ok(Signature::from_rgb(output))
    }
}

impl SignatureExtractor for DownsampleExtractor {
    fn extract(&self, source: &ImageSource) -> Result<Signature, SignatureError> {
        match source {
            ImageSource::Encoded(data) => self.from_encoded(data),
            ImageSource::Raw(raw) => self.from_raw(raw),
        }
    }
}

/// Counters for the change detector.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DetectorStats {
    pub frames_seen: u64,
    pub frames_admitted: u64,
    pub frames_skipped: u64,
    /// Frames admitted only because they could not be read
    pub frames_failed_open: u64,
}

impl DetectorStats {
    /// Percentage of seen frames admitted after a successful comparison.
    pub fn upload_rate(&self) -> f64 {
        percentage(self.frames_admitted, self.frames_seen)
    }

    /// Percentage of seen frames skipped as unchanged.
    pub fn reduction_rate(&self) -> f64 {
        percentage(self.frames_skipped, self.frames_seen)
    }
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

/// Decides whether a frame differs enough from the last admitted one.
pub struct ChangeDetector {
    threshold: f64,
    extractor: Box<dyn SignatureExtractor>,
    last_admitted: Option<Signature>,
    stats: DetectorStats,
}

impl ChangeDetector {
    /// Create a detector with the default extractor.
    ///
    /// An out-of-range threshold falls back to [`DEFAULT_THRESHOLD`].
    pub fn new(threshold: f64) -> Self {
        Self::with_extractor(threshold, Box::new(DownsampleExtractor))
    }

    pub fn with_extractor(threshold: f64, extractor: Box<dyn SignatureExtractor>) -> Self {
        let mut detector = Self {
            threshold: DEFAULT_THRESHOLD,
            extractor,
            last_admitted: None,
            stats: DetectorStats::default(),
        };
        detector.set_threshold(threshold);
        detector
    }

    /// Decide whether `image` should be analyzed.
    ///
    /// Unreadable input is admitted.
    pub fn admit(&mut self, image: &ImageSource) -> bool {
        self.stats.frames_seen += 1;

        let signature = match self.extractor.extract(image) {
            Ok(signature) => signature,
            Err(e) => {
                self.stats.frames_failed_open += 1;
                warn!(error = %e, "Frame could not be sampled, admitting it");
                return true;
            }
        };

        let score = match &self.last_admitted {
            None => {
                trace!("No baseline signature, admitting first frame");
                1.0
            }
            Some(previous) => signature.difference(previous),
        };

        if self.last_admitted.is_none() || score > self.threshold {
            self.last_admitted = Some(signature);
            self.stats.frames_admitted += 1;
            debug!(score, threshold = self.threshold, "Frame admitted");
            true
        } else {
            self.stats.frames_skipped += 1;
            trace!(score, threshold = self.threshold, "Frame skipped");
            false
        }
    }

    /// Difference between `image` and the last admitted frame, without
    /// changing any state. `None` when the image cannot be sampled.
    pub fn score(&self, image: &ImageSource) -> Option<f64> {
        let signature = self.extractor.extract(image).ok()?;
        Some(match &self.last_admitted {
            Some(previous) => signature.difference(previous),
            None => 1.0,
        })
    }

    /// Clear the baseline signature and all counters.
    pub fn reset(&mut self) {
        self.last_admitted = None;
        self.stats = DetectorStats::default();
    }

    pub fn stats(&self) -> DetectorStats {
        self.stats.clone()
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Update the threshold. Values outside [0, 1] are ignored.
    pub fn set_threshold(&mut self, threshold: f64) {
        if (0.0..=1.0).contains(&threshold) {
            self.threshold = threshold;
        } else {
            warn!(
                rejected = threshold,
                current = self.threshold,
                "Threshold must be within [0, 1], keeping current value"
            );
        }
    }
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl std::fmt::Debug for ChangeDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeDetector")
            .field("threshold", &self.threshold)
            .field("has_baseline", &self.last_admitted.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use tracing_test::traced_test;

    fn create_solid_frame(value: u8, width: u32, height: u32) -> ImageSource {
        let size = (width * height * 3) as usize;
        ImageSource::raw(vec![value; size], width, height, PixelFormat::Rgb8)
    }

    fn create_png(value: u8) -> ImageSource {
        let img = RgbImage::from_pixel(320, 240, Rgb([value, value, value]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        ImageSource::encoded(buf.into_inner())
    }

    #[test]
    fn test_first_frame_always_admitted() {
        let mut detector = ChangeDetector::new(0.99);
        assert!(detector.admit(&create_solid_frame(10, 640, 480)));

        let stats = detector.stats();
        assert_eq!(stats.frames_seen, 1);
        assert_eq!(stats.frames_admitted, 1);
    }

    #[test]
    fn test_identical_frames_score_zero() {
        let mut detector = ChangeDetector::new(0.01);
        let frame = create_solid_frame(90, 640, 480);

        assert!(detector.admit(&frame));
        assert_eq!(detector.score(&frame), Some(0.0));
        assert!(!detector.admit(&frame));
        assert_eq!(detector.stats().frames_skipped, 1);
    }

    #[test]
    fn test_difference_is_symmetric() {
        let a = Signature::from_rgb(vec![0, 10, 20, 30, 40, 50]);
        let b = Signature::from_rgb(vec![255, 0, 20, 30, 80, 50]);

        assert_eq!(a.difference(&b), b.difference(&a));
        assert!(a.difference(&b) > 0.0 && a.difference(&b) <= 1.0);
    }

    #[test]
    fn test_mismatched_signatures_are_maximal() {
        let a = Signature::from_rgb(vec![0; 6]);
        let b = Signature::from_rgb(vec![0; 9]);
        assert_eq!(a.difference(&b), 1.0);
    }

    #[test]
    fn test_alpha_is_ignored() {
        let extractor = DownsampleExtractor;
        let opaque = ImageSource::raw(vec![50, 60, 70, 255].repeat(16), 4, 4, PixelFormat::Rgba8);
        let clear = ImageSource::raw(vec![50, 60, 70, 0].repeat(16), 4, 4, PixelFormat::Rgba8);

        let a = extractor.extract(&opaque).unwrap();
        let b = extractor.extract(&clear).unwrap();
        assert_eq!(a.difference(&b), 0.0);
        assert_eq!(
            a.as_bytes().len(),
            (SIGNATURE_WIDTH * SIGNATURE_HEIGHT) as usize * 3
        );
    }

    #[test]
    fn test_compares_against_last_admitted_frame() {
        let mut detector = ChangeDetector::new(0.15);

        assert!(detector.admit(&create_solid_frame(100, 320, 240)));
        // Small steps stay under the threshold, but drift is measured
        // against the baseline.
        assert!(!detector.admit(&create_solid_frame(120, 320, 240)));
        assert!(!detector.admit(&create_solid_frame(135, 320, 240)));
        assert!(detector.admit(&create_solid_frame(145, 320, 240)));
    }

    #[test]
    fn test_admission_scenario() {
        let mut detector = ChangeDetector::new(0.15);
        let a = create_solid_frame(100, 640, 480);
        let b = create_solid_frame(105, 640, 480);
        let c = create_solid_frame(207, 640, 480);
        let d = create_solid_frame(100, 640, 480);

        assert!(detector.admit(&a));
        let score_b = detector.score(&b).unwrap();
        assert!((score_b - 5.0 / 255.0).abs() < 1e-9);
        assert!(!detector.admit(&b));
        assert!(detector.admit(&c));
        assert!(detector.admit(&d));

        let stats = detector.stats();
        assert_eq!(stats.frames_seen, 4);
        assert_eq!(stats.frames_admitted, 3);
        assert_eq!(stats.frames_skipped, 1);
        assert_eq!(stats.upload_rate(), 75.0);
        assert_eq!(stats.reduction_rate(), 25.0);
    }

    #[test]
    fn test_encoded_frames() {
        let mut detector = ChangeDetector::default();
        assert!(detector.admit(&create_png(30)));
        assert!(!detector.admit(&create_png(31)));
        assert!(detector.admit(&create_png(200)));
    }

    #[test]
    #[traced_test]
    fn test_unreadable_frame_fails_open() {
        let mut detector = ChangeDetector::default();
        let baseline = create_solid_frame(40, 64, 48);
        assert!(detector.admit(&baseline));

        assert!(detector.admit(&ImageSource::encoded(vec![0u8, 1, 2, 3])));
        assert!(detector.admit(&ImageSource::raw(vec![1u8; 5], 64, 48, PixelFormat::Rgb8)));
        assert!(logs_contain("admitting it"));

        // Baseline untouched by failed frames
        assert!(!detector.admit(&baseline));

        let stats = detector.stats();
        assert_eq!(stats.frames_seen, 4);
        assert_eq!(stats.frames_failed_open, 2);
        assert_eq!(stats.frames_admitted, 1);
    }

    #[test]
    fn test_reset_clears_baseline_and_counters() {
        let mut detector = ChangeDetector::default();
        let frame = create_solid_frame(70, 160, 120);
        detector.admit(&frame);
        detector.admit(&frame);

        detector.reset();
        assert_eq!(detector.stats(), DetectorStats::default());
        assert!(detector.admit(&frame));
    }

    #[test]
    fn test_threshold_update() {
        let mut detector = ChangeDetector::default();
        detector.set_threshold(0.4);
        assert_eq!(detector.threshold(), 0.4);

        detector.set_threshold(1.5);
        assert_eq!(detector.threshold(), 0.4);
        detector.set_threshold(-0.1);
        assert_eq!(detector.threshold(), 0.4);
        detector.set_threshold(f64::NAN);
        assert_eq!(detector.threshold(), 0.4);
    }

    #[test]
    fn test_invalid_initial_threshold_uses_default() {
        let detector = ChangeDetector::new(3.0);
        assert_eq!(detector.threshold(), DEFAULT_THRESHOLD);
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        let extractor = DownsampleExtractor;
        let result = extractor.extract(&ImageSource::raw(Vec::<u8>::new(), 0, 10, PixelFormat::Rgb8));
        assert!(matches!(result, Err(SignatureError::InvalidDimensions { .. })));
    }
}
