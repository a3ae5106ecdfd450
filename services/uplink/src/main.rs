//! Uplink service for Wardwatch patient monitoring
//!
//! This service replays captured camera frames, drops the ones that did not
//! change, uploads the rest to the analysis service in batches, and listens
//! for alerts on the event channel.
//!
//! # Architecture
//!
//! ```text
//! DirectoryCapture -> ChangeDetector -> BatchUploader -> Analysis Service
//!                                                            |
//!                             EventChannel <-----------------+
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with UPLINK_)
//!
//! See `config.rs` for detailed configuration options.

use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wardwatch_uplink::config::{LoggingConfig, UplinkConfig};
use wardwatch_uplink::{
    BackgroundDrain, BatchUploader, CapturedFrame, ChangeDetector, ChannelEvent, ChannelSettings,
    DirectoryCapture, EventChannel, EventKind, FramePipeline, HttpTransport, ImageSource,
    Submission, UploaderSettings,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "wardwatch-uplink",
        version = env!("CARGO_PKG_VERSION"),
        subject_id = %config.service.subject_id,
        "Starting uplink service"
    );

    // Validate configuration
    config.validate()?;

    match run(config).await {
        Ok(()) => {
            info!("Uplink service completed successfully");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Uplink service failed");
            Err(e)
        }
    }
}

/// Load configuration.
fn load_config() -> anyhow::Result<UplinkConfig> {
    // Try loading from files first, fall back to environment
    let config = UplinkConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        UplinkConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("wardwatch_uplink={}", level).parse()?)
        .add_directive("tungstenite=warn".parse()?)
        .add_directive("hyper=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Register listeners that log channel lifecycle and alerts.
fn register_listeners(channel: &EventChannel) {
    channel.on(EventKind::Connected, |_| {
        info!("Alert channel connected");
        Ok(())
    });
    channel.on(EventKind::Reconnecting, |event| {
        if let ChannelEvent::Reconnecting {
            attempt,
            max_attempts,
        } = event
        {
            warn!(attempt, max_attempts, "Alert channel reconnecting");
        }
        Ok(())
    });
    channel.on(EventKind::ReconnectFailed, |_| {
        error!("Alert channel gave up reconnecting, alerts will not be received");
        Ok(())
    });
    channel.on(EventKind::typed("alert"), |event| {
        if let ChannelEvent::Message(message) = event {
            warn!(alert = %message, "Alert received");
        }
        Ok(())
    });
}

/// Log outcomes of drains started by the fallback timer.
async fn report_background_drains(mut rx: mpsc::UnboundedReceiver<BackgroundDrain>) {
    while let Some(drain) = rx.recv().await {
        match drain.outcome {
            Ok(results) => {
                let succeeded = results.iter().filter(|r| r.is_success()).count();
                info!(
                    frames = drain.frames,
                    succeeded,
                    "Timed batch delivered"
                );
            }
            Err(e) => error!(frames = drain.frames, error = %e, "Timed batch failed"),
        }
    }
}

/// Feed captured frames through the pipeline until the source ends.
async fn process_frames(pipeline: Arc<FramePipeline>, mut rx: mpsc::Receiver<CapturedFrame>) {
    while let Some(captured) = rx.recv().await {
        match pipeline
            .submit(ImageSource::Encoded(captured.bytes), captured.offset_ms)
            .await
        {
            Ok(Submission::Uploaded(results)) => {
                let succeeded = results.iter().filter(|r| r.is_success()).count();
                info!(frames = results.len(), succeeded, "Batch delivered");
            }
            Ok(_) => {}
            Err(e) => error!(offset_ms = captured.offset_ms, error = %e, "Frame upload failed"),
        }
    }
}

/// Run the uplink until the capture ends or a shutdown signal arrives.
async fn run(config: UplinkConfig) -> anyhow::Result<()> {
    let transport = HttpTransport::new(&config.service.base_url, config.service.request_timeout())?;

    let (background_tx, background_rx) = mpsc::unbounded_channel();
    let uploader = BatchUploader::with_background_sink(
        Arc::new(transport),
        UploaderSettings::from(&config.batch),
        background_tx,
    );
    let background_handle = tokio::spawn(report_background_drains(background_rx));

    let pipeline = Arc::new(FramePipeline::new(
        ChangeDetector::new(config.detector.threshold),
        uploader,
        config.service.subject_id.clone(),
        config.service.source_id.clone(),
    ));
    pipeline.start_session();

    // Connect to the alert channel
    let channel = EventChannel::websocket(
        &config.service.events_url,
        &config.service.subject_id,
        ChannelSettings::from(&config.channel),
    );
    register_listeners(&channel);
    info!(endpoint = %channel.endpoint(), "Connecting to alert channel...");
    channel.connect();

    // Start capture
    let capture = DirectoryCapture::from_config(&config.capture);
    let (frame_rx, capture_handle) = capture.start(config.capture.queue_size);
    let mut processor_handle = tokio::spawn(process_frames(pipeline.clone(), frame_rx));

    // Wait for shutdown signal
    let shutdown_signal = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };

    let interrupted = tokio::select! {
        _ = shutdown_signal => true,
        _ = &mut processor_handle => false,
    };

    if interrupted {
        info!("Initiating graceful shutdown...");
        capture_handle.abort();
        processor_handle.abort();
    } else {
        info!("Frame source exhausted");
    }

    match capture_handle.await {
        Ok(Ok(frames)) => info!(frames, "Capture stopped"),
        Ok(Err(e)) => error!(error = %e, "Capture failed"),
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!(error = %e, "Capture task panicked"),
    }

    // Send whatever is still buffered
    match pipeline.flush().await {
        Ok(results) if !results.is_empty() => {
            info!(frames = results.len(), "Flushed remaining frames");
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "Final flush failed"),
    }

    channel.disconnect();
    background_handle.abort();

    log_final_stats(&pipeline);

    info!("Shutdown complete");
    Ok(())
}

/// Log final statistics on shutdown.
fn log_final_stats(pipeline: &FramePipeline) {
    info!("=== Final Statistics ===");

    let stats = pipeline.detector_stats();
    info!(
        frames_seen = stats.frames_seen,
        frames_admitted = stats.frames_admitted,
        frames_skipped = stats.frames_skipped,
        frames_failed_open = stats.frames_failed_open,
        upload_rate = format!("{:.1}%", stats.upload_rate()),
        reduction_rate = format!("{:.1}%", stats.reduction_rate()),
        "Change detector final stats"
    );

    let status = pipeline.uploader_status();
    info!(
        buffered = status.buffered,
        in_flight = status.in_flight,
        "Uploader final status"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_unknown_level_falls_back() {
        let config = LoggingConfig {
            level: "verbose".to_string(),
            format: "pretty".to_string(),
        };
        assert!(init_logging(&config).is_ok());
    }
}
