//! Single-attempt RTSP session management.
//!
//! A session represents exactly one open decode connection to one resolved
//! URL. Opening probes the camera with an RTSP DESCRIBE (which is where
//! credential and reachability failures are told apart), then hands the
//! actual decode to an ffmpeg child process emitting an MJPEG elementary
//! stream on stdout. No retry or backoff lives here; that is supervisor
//! policy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout};
use tracing::debug;

use crate::errors::SessionError;

/// One fully decoded video frame: tightly packed RGB8 plus dimensions.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Bytes,
}

/// A live decode connection. Owned exclusively by one supervisor worker.
#[async_trait]
pub trait FrameSource: Send {
    /// Block up to `timeout` for the next fully decoded frame. A timeout is
    /// a recoverable read failure, not a fatal condition.
    async fn read_frame(&mut self, timeout: Duration) -> Result<Frame, SessionError>;

    /// Release the underlying connection. Idempotent; safe after any error.
    async fn close(&mut self);
}

/// Factory for [`FrameSource`] connections. The production implementation
/// talks RTSP; tests substitute synthetic sources.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Box<dyn FrameSource>, SessionError>;
}

pub struct RtspConnector {
    transport: String,
    buffer_size: usize,
}

impl RtspConnector {
    pub fn new(transport: impl Into<String>, buffer_size: usize) -> Self {
        Self {
            transport: transport.into(),
            buffer_size: buffer_size.max(1),
        }
    }

    /// DESCRIBE the stream before spawning the decoder. This is the only
    /// point where an auth rejection is distinguishable from a dead host.
    async fn probe(&self, url: &url::Url, timeout: Duration) -> Result<(), SessionError> {
        let creds = if !url.username().is_empty() {
            Some(retina::client::Credentials {
                username: url.username().to_string(),
                password: url.password().unwrap_or("").to_string(),
            })
        } else {
            None
        };

        // retina wants credentials out of the URL itself
        let mut clean_url = url.clone();
        let _ = clean_url.set_username("");
        let _ = clean_url.set_password(None);

        let session_group = Arc::new(retina::client::SessionGroup::default());
        let options = retina::client::SessionOptions::default()
            .creds(creds)
            .session_group(session_group)
            .user_agent("camgate/0.1".to_string());

        let described = match tokio::time::timeout(
            timeout,
            retina::client::Session::describe(clean_url, options),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Err(classify_describe_error(&e)),
            Err(_) => return Err(SessionError::Timeout(timeout)),
        };

        if !described.streams().iter().any(|s| s.media() == "video") {
            return Err(SessionError::ProtocolError(
                "no video stream in DESCRIBE response".to_string(),
            ));
        }
        Ok(())
    }

    fn spawn_decoder(&self, url: &str) -> Result<Child, SessionError> {
        let rtbufsize = format!("{}k", self.buffer_size * 512);
        let args = [
            "-rtsp_transport",
            self.transport.as_str(),
            "-fflags",
            "+nobuffer+discardcorrupt",
            "-flags",
            "low_delay",
            "-avioflags",
            "direct",
            "-rtbufsize",
            rtbufsize.as_str(),
            "-i",
            url,
            "-f",
            "mjpeg",
            // High-quality intermediate; viewers get re-encoded at the
            // configured quality by the publisher.
            "-q:v",
            "2",
            "-an",
            "-",
        ];

        tokio::process::Command::new("ffmpeg")
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::Unreachable(format!("failed to spawn ffmpeg: {e}")))
    }
}

#[async_trait]
impl Connector for RtspConnector {
    async fn open(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Box<dyn FrameSource>, SessionError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| SessionError::ProtocolError(format!("invalid RTSP URL: {e}")))?;

        self.probe(&parsed, timeout).await?;
        debug!(%parsed, "DESCRIBE ok, starting decoder");

        let mut child = self.spawn_decoder(url)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::ProtocolError("decoder stdout unavailable".to_string()))?;

        let mut session = RtspSession {
            child,
            reader: BufReader::new(stdout),
            scratch: Vec::with_capacity(100_000),
            pending: None,
            closed: false,
        };

        // Require one decoded frame before declaring the URL good, so the
        // supervisor only records winners that actually produce video.
        match session.read_frame(timeout).await {
            Ok(frame) => {
                session.pending = Some(frame);
                Ok(Box::new(session))
            }
            Err(e) => {
                session.close().await;
                Err(match e {
                    SessionError::Eof | SessionError::Disconnected(_) => SessionError::ProtocolError(
                        "stream opened but produced no frames".to_string(),
                    ),
                    other => other,
                })
            }
        }
    }
}

pub struct RtspSession {
    child: Child,
    reader: BufReader<ChildStdout>,
    scratch: Vec<u8>,
    pending: Option<Frame>,
    closed: bool,
}

#[async_trait]
impl FrameSource for RtspSession {
    async fn read_frame(&mut self, timeout: Duration) -> Result<Frame, SessionError> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        if self.closed {
            return Err(SessionError::Disconnected("session closed".to_string()));
        }

        let jpeg = match tokio::time::timeout(
            timeout,
            read_jpeg(&mut self.reader, &mut self.scratch),
        )
        .await
        {
            Ok(Ok(jpeg)) => jpeg,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(SessionError::Eof)
            }
            Ok(Err(e)) => return Err(SessionError::Disconnected(e.to_string())),
            Err(_) => return Err(SessionError::Timeout(timeout)),
        };

        decode_jpeg(&jpeg)
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.child.kill().await;
    }
}

/// Pull one complete JPEG (SOI `FFD8` through EOI `FFD9`) out of an MJPEG
/// byte stream, discarding any garbage between frames.
async fn read_jpeg<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut Vec<u8>,
) -> std::io::Result<Vec<u8>> {
    buffer.clear();

    let mut chunk = [0u8; 8192];
    let mut found_start = false;

    while !found_start {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        for i in 0..n.saturating_sub(1) {
            if chunk[i] == 0xFF && chunk[i + 1] == 0xD8 {
                buffer.extend_from_slice(&chunk[i..n]);
                found_start = true;
                break;
            }
        }
    }

    // Check whether the EOI marker already arrived with the start chunk
    if let Some(end) = find_eoi(buffer, 2) {
        let jpeg = buffer[..end].to_vec();
        return Ok(jpeg);
    }

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }

        // Marker split across the chunk boundary
        if buffer.last() == Some(&0xFF) && chunk[0] == 0xD9 {
            buffer.push(0xD9);
            return Ok(std::mem::take(buffer));
        }

        let start = buffer.len();
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_eoi(buffer, start.saturating_sub(1)) {
            let jpeg = buffer[..end].to_vec();
            return Ok(jpeg);
        }
    }
}

/// Index one past the EOI marker, scanning from `from`.
fn find_eoi(data: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 1 < data.len() {
        if data[i] == 0xFF && data[i + 1] == 0xD9 {
            return Some(i + 2);
        }
        i += 1;
    }
    None
}

fn decode_jpeg(jpeg: &[u8]) -> Result<Frame, SessionError> {
    let image = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
        .map_err(|e| SessionError::DecodeError(e.to_string()))?;
    let rgb = image.to_rgb8();
    Ok(Frame {
        width: rgb.width(),
        height: rgb.height(),
        pixels: Bytes::from(rgb.into_raw()),
    })
}

fn classify_describe_error(e: &retina::Error) -> SessionError {
    let text = e.to_string();
    let lower = text.to_lowercase();
    if lower.contains("401") || lower.contains("unauthorized") || lower.contains("credentials") {
        SessionError::AuthFailed(text)
    } else if lower.contains("refused")
        || lower.contains("unreachable")
        || lower.contains("timed out")
        || lower.contains("dns")
        || lower.contains("connect")
    {
        SessionError::Unreachable(text)
    } else {
        SessionError::ProtocolError(text)
    }
}
