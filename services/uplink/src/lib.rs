//! Wardwatch Uplink - frame sampling, batched analysis upload and alert channel
//!
//! This library turns a continuous stream of camera frames into a reduced,
//! batched set of analysis requests and keeps a live event channel open for
//! alerts pushed back by the analysis service. It handles:
//!
//! - Change detection, so only frames that differ from the last admitted one
//!   are analyzed
//! - Batching admitted frames under size and time triggers, with at most one
//!   transmission in flight
//! - A reconnecting event channel with typed listeners
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use wardwatch_uplink::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = HttpTransport::new("http://analysis:8000", Duration::from_secs(30))?;
//!     let uploader = BatchUploader::new(Arc::new(transport), UploaderSettings::default());
//!     let pipeline = FramePipeline::new(ChangeDetector::default(), uploader, "patient-1", None);
//!
//!     let image = std::fs::read("frame.jpg")?;
//!     pipeline.submit(ImageSource::encoded(image), 0).await?;
//!     pipeline.flush().await?;
//!
//!     let channel = EventChannel::websocket("ws://analysis:8000", "patient-1", ChannelSettings::default());
//!     channel.on(EventKind::typed("alert"), |event| {
//!         println!("{:?}", event);
//!         Ok(())
//!     });
//!     channel.connect();
//!
//!     Ok(())
//! }
//! ```

pub mod batch_uploader;
pub mod capture;
pub mod change_detector;
pub mod config;
pub mod event_channel;
pub mod frame;
pub mod pipeline;
pub mod transport;

// Re-export main types
pub use batch_uploader::{
    BackgroundDrain, BatchBuffer, BatchUploader, UploadError, UploaderSettings, UploaderStatus,
};
pub use capture::{CaptureError, CapturedFrame, DirectoryCapture};
pub use change_detector::{
    ChangeDetector, DetectorStats, DownsampleExtractor, Signature, SignatureError,
    SignatureExtractor,
};
pub use config::{ConfigValidationError, UplinkConfig};
pub use event_channel::{
    ChannelError, ChannelEvent, ChannelSettings, ChannelState, Connector, EventChannel,
    EventKind, ListenerId, OutboundMessage, WebSocketConnector,
};
pub use frame::{
    AnalysisResponse, Frame, FrameMetadata, FrameResult, ImageSource, PixelFormat, RawImage,
    ResultStatus,
};
pub use pipeline::{FramePipeline, PipelineError, Submission};
pub use transport::{AnalysisTransport, HttpTransport, TransportError};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::batch_uploader::{BatchUploader, UploadError, UploaderSettings};
    pub use crate::change_detector::ChangeDetector;
    pub use crate::event_channel::{ChannelEvent, ChannelSettings, EventChannel, EventKind};
    pub use crate::frame::{Frame, FrameResult, ImageSource};
    pub use crate::pipeline::{FramePipeline, Submission};
    pub use crate::transport::{AnalysisTransport, HttpTransport};
}
