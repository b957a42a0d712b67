//! Object-detection side channel
//!
//! Painted frames are posted as JPEG to an external detection service and the
//! most recent answer is drawn over later frames. The channel is best effort:
//! playback never waits on it, at most one request is in flight, and failures
//! only cost the overlay an update.

use crate::config::DetectionConfig;
use crate::render::{draw_text, encode_jpeg, Rect, Surface, SurfaceError, GLYPH_HEIGHT};
use image::RgbaImage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

const JPEG_QUALITY: u8 = 80;
const STROKE_WIDTH: u32 = 2;
const LABEL_SCALE: u32 = 2;
const LABEL_GAP: f32 = 2.0;

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Invalid detection endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    #[error("Detection request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Snapshot encoding failed: {0}")]
    Encode(#[from] SurfaceError),
    #[error("Encoder task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BoundingBox {
    pub min: Point,
    pub max: Point,
}

/// One detected object, coordinates in pixels of the submitted image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Detection {
    #[serde(rename = "Box")]
    pub bbox: BoundingBox,
    pub score: f32,
    #[serde(rename = "ClassID")]
    pub class_id: u32,
    pub class_name: String,
}

impl Detection {
    pub fn rect(&self) -> Rect {
        Rect {
            x0: self.bbox.min.x,
            y0: self.bbox.min.y,
            x1: self.bbox.max.x,
            y1: self.bbox.max.y,
        }
    }
}

/// Outline color per class, stable across frames
pub fn class_color(class_id: u32) -> [u8; 4] {
    const PALETTE: [[u8; 4]; 6] = [
        [255, 64, 64, 255],
        [64, 255, 64, 255],
        [64, 128, 255, 255],
        [255, 224, 64, 255],
        [255, 64, 255, 255],
        [64, 255, 255, 255],
    ];
    PALETTE[class_id as usize % PALETTE.len()]
}

// ============================================================================
// Client
// ============================================================================

#[derive(Clone)]
pub struct DetectionClient {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl DetectionClient {
    pub fn new(config: &DetectionConfig) -> Result<Self, DetectionError> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Self::with_client(client, &config.endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: &str) -> Result<Self, DetectionError> {
        Ok(Self {
            client,
            endpoint: url::Url::parse(endpoint)?,
        })
    }

    pub fn endpoint(&self) -> &url::Url {
        &self.endpoint
    }

    /// POST one JPEG image; a `null` answer means nothing was found
    pub async fn detect(&self, jpeg: Vec<u8>) -> Result<Vec<Detection>, DetectionError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(jpeg)
            .send()
            .await?
            .error_for_status()?;

        let detections: Option<Vec<Detection>> = response.json().await?;
        Ok(detections.unwrap_or_default())
    }
}

// ============================================================================
// Overlay
// ============================================================================

pub struct DetectionOverlay {
    client: DetectionClient,
    min_score: f32,
    latest: Arc<Mutex<Vec<Detection>>>,
    in_flight: Arc<AtomicBool>,
    completed: Arc<AtomicU64>,
}

impl DetectionOverlay {
    pub fn new(config: &DetectionConfig) -> Result<Self, DetectionError> {
        Ok(Self::with_client(DetectionClient::new(config)?, config.min_score))
    }

    pub fn with_client(client: DetectionClient, min_score: f32) -> Self {
        Self {
            client,
            min_score,
            latest: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicBool::new(false)),
            completed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Requests answered so far, successfully or not
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn latest(&self) -> Vec<Detection> {
        self.latest.lock().clone()
    }

    /// Outline the latest detections scoring at least `min_score` and
    /// label each with its class name
    pub fn draw<S: Surface + ?Sized>(&self, surface: &mut S) -> usize {
        let latest = self.latest.lock();
        let mut drawn = 0;
        for detection in latest.iter().filter(|d| d.score >= self.min_score) {
            let color = class_color(detection.class_id);
            let rect = detection.rect();
            surface.stroke_rect(rect, color, STROKE_WIDTH);

            let label_height = (GLYPH_HEIGHT * LABEL_SCALE) as f32;
            let top = rect.y0.min(rect.y1);
            // Above the box, or just inside it when the box touches the top edge
            let label_y = if top >= label_height + LABEL_GAP {
                top - LABEL_GAP - label_height
            } else {
                top + (STROKE_WIDTH as f32) + LABEL_GAP
            };
            draw_text(
                surface,
                rect.x0.min(rect.x1),
                label_y,
                &detection.class_name,
                color,
                LABEL_SCALE,
            );
            drawn += 1;
        }
        drawn
    }

    /// Send a snapshot for detection without waiting for the answer.
    ///
    /// Returns false when a request is already in flight; the snapshot is
    /// dropped in that case. Must be called within a tokio runtime.
    pub fn submit(&self, snapshot: RgbaImage) -> bool {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return false;
        }

        let client = self.client.clone();
        let latest = Arc::clone(&self.latest);
        let in_flight = Arc::clone(&self.in_flight);
        let completed = Arc::clone(&self.completed);

        tokio::spawn(async move {
            let result = async {
                let jpeg = tokio::task::spawn_blocking(move || encode_jpeg(&snapshot, JPEG_QUALITY)).await??;
                client.detect(jpeg).await
            }
            .await;

            match result {
                Ok(detections) => {
                    debug!("detection returned {} objects", detections.len());
                    *latest.lock() = detections;
                }
                Err(e) => warn!("detection request to {} failed: {}", client.endpoint(), e),
            }
            in_flight.store(false, Ordering::Release);
            completed.fetch_add(1, Ordering::AcqRel);
        });

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::RgbaSurface;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const PERSON: &str =
        r#"[{"Box":{"Min":{"X":1,"Y":1},"Max":{"X":6,"Y":5}},"Score":0.9,"ClassID":0,"ClassName":"person"}]"#;

    /// Answer a single HTTP request with `status` and `body`; yields the raw request
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                    let headers = String::from_utf8_lossy(&request[..end]).to_lowercase();
                    let body_len = headers
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= end + 4 + body_len {
                        break;
                    }
                }
            }

            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            request
        });

        (format!("http://{}/detect", addr), handle)
    }

    fn direct_client(endpoint: &str) -> DetectionClient {
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        DetectionClient::with_client(client, endpoint).unwrap()
    }

    async fn wait_idle(overlay: &DetectionOverlay) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while overlay.completed() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_detection_json_shape() {
        let parsed: Vec<Detection> = serde_json::from_str(PERSON).unwrap();
        assert_eq!(parsed[0].class_name, "person");
        assert_eq!(parsed[0].class_id, 0);
        assert_eq!(parsed[0].rect(), Rect { x0: 1.0, y0: 1.0, x1: 6.0, y1: 5.0 });

        let none: Option<Vec<Detection>> = serde_json::from_str("null").unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_client_posts_jpeg() {
        let (endpoint, server) = serve_once("200 OK", PERSON).await;
        let detections = direct_client(&endpoint).detect(vec![0xFF, 0xD8, 0xFF, 0xD9]).await.unwrap();
        assert_eq!(detections.len(), 1);

        let request = String::from_utf8_lossy(&server.await.unwrap()).to_lowercase();
        assert!(request.starts_with("post /detect"));
        assert!(request.contains("content-type: image/jpeg"));
    }

    #[tokio::test]
    async fn test_null_response_is_empty() {
        let (endpoint, _server) = serve_once("200 OK", "null").await;
        let detections = direct_client(&endpoint).detect(vec![1, 2, 3]).await.unwrap();
        assert!(detections.is_empty());
    }

    #[tokio::test]
    async fn test_overlay_single_request_in_flight() {
        let (endpoint, _server) = serve_once("200 OK", PERSON).await;
        let overlay = DetectionOverlay::with_client(direct_client(&endpoint), 0.5);

        assert!(overlay.submit(RgbaImage::new(8, 8)));
        assert!(!overlay.submit(RgbaImage::new(8, 8)));
        wait_idle(&overlay).await;

        assert!(!overlay.is_busy());
        assert_eq!(overlay.latest().len(), 1);
    }

    #[tokio::test]
    async fn test_overlay_failure_keeps_previous_result() {
        let (endpoint, _server) = serve_once("500 Internal Server Error", "").await;
        let overlay = DetectionOverlay::with_client(direct_client(&endpoint), 0.0);
        *overlay.latest.lock() = serde_json::from_str(PERSON).unwrap();

        assert!(overlay.submit(RgbaImage::new(8, 8)));
        wait_idle(&overlay).await;

        assert!(!overlay.is_busy());
        assert_eq!(overlay.latest().len(), 1);
    }

    #[test]
    fn test_draw_filters_by_score() {
        let overlay = DetectionOverlay::with_client(direct_client("http://127.0.0.1:9/detect"), 0.5);
        let mut low: Vec<Detection> = serde_json::from_str(PERSON).unwrap();
        low[0].score = 0.2;
        low[0].class_id = 1;
        let mut detections: Vec<Detection> = serde_json::from_str(PERSON).unwrap();
        detections.extend(low);
        *overlay.latest.lock() = detections;

        let mut surface = RgbaSurface::new(8, 8);
        assert_eq!(overlay.draw(&mut surface), 1);
        assert_eq!(surface.pixel(1, 1), Some(class_color(0)));
        assert_eq!(surface.pixel(7, 7), Some([0, 0, 0, 0]));
    }

    #[test]
    fn test_draw_labels_class_name_above_box() {
        let overlay = DetectionOverlay::with_client(direct_client("http://127.0.0.1:9/detect"), 0.0);
        *overlay.latest.lock() = serde_json::from_str(
            r#"[{"Box":{"Min":{"X":10,"Y":30},"Max":{"X":40,"Y":50}},"Score":0.8,"ClassID":2,"ClassName":"cat"}]"#,
        )
        .unwrap();

        let mut surface = RgbaSurface::new(64, 64);
        assert_eq!(overlay.draw(&mut surface), 1);
        let color = class_color(2);
        let blank = Some([0, 0, 0, 0]);

        // Label occupies rows 18..28; "C" has an empty top-left dot
        assert_eq!(surface.pixel(10, 18), blank);
        assert_eq!(surface.pixel(12, 18), Some(color));
        assert_eq!(surface.pixel(10, 20), Some(color));
        // "A" starts two gap pixels after "C"
        assert_eq!(surface.pixel(20, 18), Some(color));
        assert_eq!(surface.pixel(12, 17), blank);
        assert_eq!(surface.pixel(12, 28), blank);
        assert_eq!(surface.pixel(10, 30), Some(color));
    }
}
