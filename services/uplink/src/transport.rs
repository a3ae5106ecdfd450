//! HTTP client for the remote analysis service.
//!
//! Two endpoints are consumed:
//!
//! - `POST /api/analysis/batch`: one `files` part per frame plus a `frames`
//!   part carrying the JSON metadata array, answered with one result per
//!   frame in the same order.
//! - `POST /api/analysis/analyze`: a single `file` part with the frame
//!   metadata passed as query parameters.

use crate::frame::{AnalysisResponse, Frame, FrameMetadata, FrameResult};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, instrument};

const BATCH_PATH: &str = "/api/analysis/batch";
const ANALYZE_PATH: &str = "/api/analysis/analyze";

/// Errors returned by the analysis transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Server error {status_code}: {message}")]
    Server { status_code: u16, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Expected {expected} results, service returned {actual}")]
    ResultCountMismatch { expected: usize, actual: usize },
}

/// Transmission of frames to the analysis service.
#[async_trait]
pub trait AnalysisTransport: Send + Sync {
    /// Submit frames as one batch request. Results are returned in the
    /// order the frames were given.
    async fn analyze_batch(&self, frames: &[Frame]) -> Result<Vec<FrameResult>, TransportError>;

    /// Submit a single frame outside of batching.
    async fn analyze_frame(&self, frame: &Frame) -> Result<AnalysisResponse, TransportError>;
}

/// `reqwest` based transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn image_part(frame: &Frame, index: usize) -> Result<Part, TransportError> {
        let (mime, extension) = image_kind(&frame.image);
        let part = Part::bytes(frame.image.to_vec())
            .file_name(format!("frame-{}.{}", index, extension))
            .mime_str(mime)?;
        Ok(part)
    }

    async fn read_response(response: reqwest::Response) -> Result<String, TransportError> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = error_detail(&body).unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            error!(status = status.as_u16(), message = %message, "Analysis request rejected");
            return Err(TransportError::Server {
                status_code: status.as_u16(),
                message,
            });
        }

        Ok(body)
    }
}

#[async_trait]
impl AnalysisTransport for HttpTransport {
    #[instrument(skip(self, frames), fields(frames = frames.len()))]
    async fn analyze_batch(&self, frames: &[Frame]) -> Result<Vec<FrameResult>, TransportError> {
        if frames.is_empty() {
            return Ok(Vec::new());
        }

        let metadata: Vec<FrameMetadata> = frames.iter().map(Frame::metadata).collect();

        let mut form = Form::new();
        for (index, frame) in frames.iter().enumerate() {
            form = form.part("files", Self::image_part(frame, index)?);
        }
        form = form.text("frames", serde_json::to_string(&metadata)?);

        let url = format!("{}{}", self.base_url, BATCH_PATH);
        debug!(url = %url, "Sending batch analysis request");

        let response = self.client.post(url).multipart(form).send().await?;
        let body = Self::read_response(response).await?;
        let results: Vec<FrameResult> = serde_json::from_str(&body)?;

        if results.len() != frames.len() {
            return Err(TransportError::ResultCountMismatch {
                expected: frames.len(),
                actual: results.len(),
            });
        }

        debug!(results = results.len(), "Batch analysis completed");
        Ok(results)
    }

    #[instrument(skip(self, frame), fields(subject_id = %frame.subject_id))]
    async fn analyze_frame(&self, frame: &Frame) -> Result<AnalysisResponse, TransportError> {
        let metadata = frame.metadata();
        let query = [
            ("patient_id", metadata.subject_id),
            ("camera_id", metadata.source_id),
            ("timestamp_ms", metadata.capture_offset_ms.to_string()),
        ];

        let form = Form::new().part("file", Self::image_part(frame, 0)?);

        let url = format!("{}{}", self.base_url, ANALYZE_PATH);
        debug!(url = %url, "Sending single frame analysis request");

        let response = self
            .client
            .post(url)
            .query(&query)
            .multipart(form)
            .send()
            .await?;
        let body = Self::read_response(response).await?;

        Ok(serde_json::from_str(&body)?)
    }
}

/// MIME type and file extension guessed from the image magic bytes.
fn image_kind(data: &[u8]) -> (&'static str, &'static str) {
    match image::guess_format(data) {
        Ok(format) => (
            format.to_mime_type(),
            format.extensions_str().first().copied().unwrap_or("bin"),
        ),
        Err(_) => ("application/octet-stream", "bin"),
    }
}

/// The `detail` field of an error body, if the body is JSON.
fn error_detail(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value.get("detail")?.as_str().map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    // ASCII-only header keeps the multipart body matchable as text
    const GIF_HEADER: &[u8] = b"GIF89a\x01\x00\x01\x00";

    fn create_test_frame(offset: u64, source: Option<&str>) -> Frame {
        Frame::new(GIF_HEADER.to_vec(), "patient-1", source.map(String::from), offset)
    }

    fn create_transport(url: String) -> HttpTransport {
        HttpTransport::new(url, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_batch_upload() {
        let mut server = Server::new_async().await;

        let mock = server
            .mock("POST", "/api/analysis/batch")
            .match_header(
                "content-type",
                Matcher::Regex("multipart/form-data.*".to_string()),
            )
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#"name="files"; filename="frame-0.gif""#.to_string()),
                Matcher::Regex(r#"name="files"; filename="frame-1.gif""#.to_string()),
                Matcher::Regex(
                    r#"\[\{"patient_id":"patient-1","camera_id":"cam-2","timestamp_ms":0\},\{"patient_id":"patient-1","camera_id":"","timestamp_ms":3000\}\]"#
                        .to_string(),
                ),
            ]))
            .with_status(200)
            .with_body(
                r#"[{"status":"success","index":0,"result":{"ok":true}},{"status":"failed","index":1,"error":"blurry"}]"#,
            )
            .expect(1)
            .create_async()
            .await;

        let transport = create_transport(server.url());
        let frames = vec![create_test_frame(0, Some("cam-2")), create_test_frame(3000, None)];
        let results = transport.analyze_batch(&frames).await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(results[0].is_success());
        assert_eq!(results[1].error.as_deref(), Some("blurry"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_empty_batch_sends_nothing() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/analysis/batch")
            .expect(0)
            .create_async()
            .await;

        let transport = create_transport(server.url());
        assert!(transport.analyze_batch(&[]).await.unwrap().is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_uses_detail() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/analysis/batch")
            .with_status(400)
            .with_body(r#"{"detail":"metadata count mismatch"}"#)
            .create_async()
            .await;

        let transport = create_transport(server.url());
        let result = transport.analyze_batch(&[create_test_frame(0, None)]).await;

        match result {
            Err(TransportError::Server {
                status_code,
                message,
            }) => {
                assert_eq!(status_code, 400);
                assert_eq!(message, "metadata count mismatch");
            }
            other => panic!("Expected Server error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_error_without_json_body() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/analysis/batch")
            .with_status(502)
            .with_body("Bad Gateway")
            .create_async()
            .await;

        let transport = create_transport(server.url());
        let result = transport.analyze_batch(&[create_test_frame(0, None)]).await;

        assert!(matches!(
            result,
            Err(TransportError::Server { status_code: 502, ref message }) if message == "HTTP 502"
        ));
    }

    #[tokio::test]
    async fn test_result_count_mismatch() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/analysis/batch")
            .with_status(200)
            .with_body(r#"[{"status":"success","index":0}]"#)
            .create_async()
            .await;

        let transport = create_transport(server.url());
        let frames = vec![create_test_frame(0, None), create_test_frame(1, None)];
        let result = transport.analyze_batch(&frames).await;

        assert!(matches!(
            result,
            Err(TransportError::ResultCountMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_single_frame_query_parameters() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/analysis/analyze")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("patient_id".into(), "patient-1".into()),
                Matcher::UrlEncoded("camera_id".into(), "".into()),
                Matcher::UrlEncoded("timestamp_ms".into(), "1500".into()),
            ]))
            .match_body(Matcher::Regex(r#"name="file""#.to_string()))
            .with_status(200)
            .with_body(r#"{"status":"success","result_id":"r-9","analysis":{"risk":"low"}}"#)
            .create_async()
            .await;

        let transport = create_transport(server.url());
        let response = transport
            .analyze_frame(&create_test_frame(1500, None))
            .await
            .unwrap();

        assert_eq!(response.status, "success");
        assert_eq!(response.result_id.as_deref(), Some("r-9"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_single_frame_sends_source_id() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/analysis/analyze")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("patient_id".into(), "patient-1".into()),
                Matcher::UrlEncoded("camera_id".into(), "cam-2".into()),
                Matcher::UrlEncoded("timestamp_ms".into(), "10".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"status":"success"}"#)
            .expect(1)
            .create_async()
            .await;

        let transport = create_transport(server.url());
        transport
            .analyze_frame(&create_test_frame(10, Some("cam-2")))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let transport = create_transport("http://analysis.local/".to_string());
        assert_eq!(transport.base_url(), "http://analysis.local");
    }

    #[test]
    fn test_image_kind() {
        assert_eq!(image_kind(&PNG_MAGIC), ("image/png", "png"));
        assert_eq!(image_kind(&[0xFF, 0xD8, 0xFF, 0xE0]), ("image/jpeg", "jpg"));
        assert_eq!(image_kind(b"not an image"), ("application/octet-stream", "bin"));
    }

    #[test]
    fn test_error_detail() {
        assert_eq!(error_detail(r#"{"detail":"nope"}"#).as_deref(), Some("nope"));
        assert_eq!(error_detail(r#"{"message":"nope"}"#), None);
        assert_eq!(error_detail("plain text"), None);
    }
}
