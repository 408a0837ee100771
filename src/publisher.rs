//! Frame publication: on-demand JPEG snapshots and the multipart MJPEG
//! transport.
//!
//! Readers never coordinate with the decode loop. Every snapshot is the most
//! recent published frame, which may repeat across calls when viewers poll
//! faster than the camera decodes; that is intended behavior, not an error.

use std::convert::Infallible;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, Rgb};
use tokio::sync::watch;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::session::Frame;
use crate::supervisor::StreamState;

/// Boundary separating MJPEG parts. Unusual enough to never occur in JPEG data.
const MJPEG_BOUNDARY: &str = "camgate_frame_9d4b1a06";

pub struct FramePublisher {
    state: watch::Receiver<StreamState>,
    quality: u8,
    // Encoded bytes keyed by frame sequence, so two reads of the same frame
    // are bit-identical and the encode cost is paid once per frame.
    cache: Mutex<Option<(u64, Bytes)>>,
}

impl FramePublisher {
    pub fn new(state: watch::Receiver<StreamState>, quality: u8) -> Self {
        Self {
            state,
            quality,
            cache: Mutex::new(None),
        }
    }

    /// Encode the latest published frame. `None` only when the camera has
    /// never produced a frame.
    pub fn snapshot(&self) -> Option<Bytes> {
        let (seq, frame) = {
            let state = self.state.borrow();
            (state.frame_seq, state.frame.clone()?)
        };

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((cached_seq, bytes)) = cache.as_ref() {
            if *cached_seq == seq {
                return Some(bytes.clone());
            }
        }

        let encoded = encode_rgb_jpeg(&frame, self.quality)?;
        *cache = Some((seq, encoded.clone()));
        Some(encoded)
    }
}

fn encode_rgb_jpeg(frame: &Frame, quality: u8) -> Option<Bytes> {
    let img: ImageBuffer<Rgb<u8>, Vec<u8>> =
        ImageBuffer::from_raw(frame.width, frame.height, frame.pixels.to_vec())?;

    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality);
    encoder.encode_image(&img).ok()?;
    Some(Bytes::from(jpeg))
}

/// Dark frame served while a camera has never delivered video.
pub fn placeholder_jpeg() -> Bytes {
    static PLACEHOLDER: OnceLock<Bytes> = OnceLock::new();
    PLACEHOLDER
        .get_or_init(|| {
            let img = ImageBuffer::from_fn(640, 480, |_, _| Rgb([32u8, 32, 40]));
            let mut jpeg = Vec::new();
            let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, 70);
            // A constant-color buffer always encodes
            let _ = encoder.encode_image(&img);
            Bytes::from(jpeg)
        })
        .clone()
}

fn multipart_chunk(jpeg: &Bytes) -> Bytes {
    let head = format!(
        "--{MJPEG_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut part = Vec::with_capacity(head.len() + jpeg.len() + 2);
    part.extend_from_slice(head.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

/// Logs viewer lifetime; dropped when the client disconnects and the
/// response stream is torn down.
struct ViewerGuard {
    camera: String,
    viewer: Uuid,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        debug!(camera = %self.camera, viewer = %self.viewer, "viewer disconnected");
    }
}

/// Continuous MJPEG response, emitting the latest snapshot at most
/// `fps_limit` times per second. Disconnected cameras get the frozen last
/// frame, never-connected cameras get the placeholder; the response itself
/// never terminates on a camera-side error.
pub fn mjpeg_response(publisher: std::sync::Arc<FramePublisher>, fps_limit: u32, camera: String) -> Response {
    let viewer = Uuid::new_v4();
    info!(camera = %camera, viewer = %viewer, "viewer connected");

    // Sub-millisecond periods are fine; a zero period would panic interval()
    let period = Duration::from_secs_f64(1.0 / f64::from(fps_limit.max(1)));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let guard = ViewerGuard { camera, viewer };
    let stream = IntervalStream::new(ticker).map(move |_| {
        let _keepalive = &guard;
        let jpeg = publisher.snapshot().unwrap_or_else(placeholder_jpeg);
        Ok::<_, Infallible>(multipart_chunk(&jpeg))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={MJPEG_BOUNDARY}"),
        )
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::PRAGMA, "no-cache")
        .body(Body::from_stream(stream))
        .expect("static MJPEG response headers")
}
