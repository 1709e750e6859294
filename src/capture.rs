//! Stream capture backend
//!
//! Frames are pulled from cameras by driving the `ffmpeg` binary as a
//! child process emitting MJPEG over a pipe. The `StreamOpener` /
//! `FrameStream` seams keep the media layer swappable (tests run
//! against in-memory fakes).

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};

use crate::error::{Error, Result};

/// Longest frame edge dispatched as-is; larger frames are downscaled.
pub const MAX_FRAME_EDGE: u32 = 960;

/// Safety cap on a single JPEG frame read from the pipe.
const MAX_JPEG_BYTES: usize = 32 << 20;

/// Default window for a candidate-endpoint probe.
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default window for the first frame of an opened stream.
const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// A single decoded video frame: JPEG bytes plus parsed dimensions.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Build a frame from JPEG bytes, reading dimensions from the SOF segment.
    pub fn from_jpeg(data: Vec<u8>) -> Result<Self> {
        let (width, height) = jpeg_dimensions(&data)
            .ok_or_else(|| Error::Parse("not a decodable JPEG frame".to_string()))?;
        Ok(Self {
            data,
            width,
            height,
        })
    }

    pub fn is_oversized(&self) -> bool {
        self.width.max(self.height) > MAX_FRAME_EDGE
    }

    /// Halve both dimensions when either edge exceeds the threshold.
    ///
    /// A failed re-encode dispatches the original frame rather than
    /// dropping it.
    pub fn downscaled_if_oversized(self) -> Frame {
        if !self.is_oversized() {
            return self;
        }
        match downscale_jpeg(&self.data, self.width / 2, self.height / 2) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "Frame downscale failed, dispatching original");
                self
            }
        }
    }
}

fn downscale_jpeg(data: &[u8], width: u32, height: u32) -> Result<Frame> {
    let decoded = image::load_from_memory(data)
        .map_err(|e| Error::Capture(format!("JPEG decode failed: {}", e)))?;
    let resized = decoded.resize_exact(width, height, image::imageops::FilterType::Triangle);
    let mut out = std::io::Cursor::new(Vec::new());
    resized
        .write_to(&mut out, image::ImageOutputFormat::Jpeg(85))
        .map_err(|e| Error::Capture(format!("JPEG encode failed: {}", e)))?;
    Ok(Frame {
        data: out.into_inner(),
        width,
        height,
    })
}

/// An open, continuously readable camera stream.
#[async_trait]
pub trait FrameStream: Send {
    async fn read_frame(&mut self) -> Result<Frame>;
}

/// Factory for camera streams, and the probe used during endpoint selection.
#[async_trait]
pub trait StreamOpener: Send + Sync {
    /// Open a continuous stream. Fails when the endpoint cannot deliver
    /// a first decodable frame.
    async fn open(&self, url: &str) -> Result<Box<dyn FrameStream>>;

    /// Whether the endpoint yields one decodable frame within the probe
    /// window. Never fails; failures answer `false`.
    async fn probe(&self, url: &str) -> bool;
}

/// ffmpeg-backed capture: one child process per stream, MJPEG on stdout.
pub struct FfmpegCapture {
    probe_timeout: Duration,
    open_timeout: Duration,
}

impl FfmpegCapture {
    pub fn new() -> Self {
        Self {
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }

    pub fn with_timeouts(probe_timeout: Duration, open_timeout: Duration) -> Self {
        Self {
            probe_timeout,
            open_timeout,
        }
    }

    /// Check that ffmpeg is available on this host.
    pub async fn check_ffmpeg() -> Result<String> {
        let output = Command::new("ffmpeg")
            .arg("-version")
            .output()
            .await
            .map_err(|e| Error::Capture(format!("ffmpeg not found: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Capture("ffmpeg version check failed".to_string()));
        }

        let version = String::from_utf8_lossy(&output.stdout);
        Ok(version.lines().next().unwrap_or("unknown").to_string())
    }
}

impl Default for FfmpegCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamOpener for FfmpegCapture {
    async fn open(&self, url: &str) -> Result<Box<dyn FrameStream>> {
        let mut child = spawn_ffmpeg(url, false)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Capture("ffmpeg stdout unavailable".to_string()))?;

        let mut stream = FfmpegStream {
            _child: child,
            stdout,
            buf: Vec::with_capacity(64 * 1024),
            pending: None,
        };

        // The endpoint only counts as open once it proves it can decode.
        match tokio::time::timeout(self.open_timeout, stream.next_frame()).await {
            Ok(Ok(frame)) => {
                stream.pending = Some(frame);
                Ok(Box::new(stream))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Capture(format!(
                "no frame within {}s of opening {}",
                self.open_timeout.as_secs(),
                url
            ))),
        }
    }

    async fn probe(&self, url: &str) -> bool {
        let child = match spawn_ffmpeg(url, true) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(error = %e, "Probe spawn failed");
                return false;
            }
        };

        // On timeout the future is dropped, the Child with it, and
        // kill_on_drop reaps the ffmpeg process.
        match tokio::time::timeout(self.probe_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                output.status.success()
                    && !output.stdout.is_empty()
                    && jpeg_dimensions(&output.stdout).is_some()
            }
            Ok(Err(e)) => {
                tracing::debug!(url = %url, error = %e, "Probe execution failed");
                false
            }
            Err(_) => {
                tracing::debug!(url = %url, timeout_sec = self.probe_timeout.as_secs(), "Probe timed out");
                false
            }
        }
    }
}

/// Spawn ffmpeg reading `url` and writing MJPEG to stdout.
///
/// kill_on_drop guarantees the process is reaped whenever the Child is
/// dropped, whatever the exit path of its owner.
fn spawn_ffmpeg(url: &str, single_frame: bool) -> Result<Child> {
    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-rtsp_transport", "tcp", "-i", url]);
    if single_frame {
        cmd.args(["-frames:v", "1"]);
    }
    cmd.args(["-f", "image2pipe", "-vcodec", "mjpeg", "-loglevel", "error", "-"]);
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    cmd.spawn()
        .map_err(|e| Error::Capture(format!("ffmpeg spawn failed: {}", e)))
}

struct FfmpegStream {
    _child: Child,
    stdout: ChildStdout,
    buf: Vec<u8>,
    pending: Option<Frame>,
}

impl FfmpegStream {
    async fn next_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(bytes) = extract_jpeg(&mut self.buf) {
                return Frame::from_jpeg(bytes);
            }
            if self.buf.len() > MAX_JPEG_BYTES {
                self.buf.clear();
                return Err(Error::Capture("frame exceeds size cap".to_string()));
            }
            // read_buf is cancel safe: bytes land in buf at poll time.
            let n = self
                .stdout
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| Error::Capture(format!("stream read failed: {}", e)))?;
            if n == 0 {
                return Err(Error::Capture("stream ended".to_string()));
            }
        }
    }
}

#[async_trait]
impl FrameStream for FfmpegStream {
    async fn read_frame(&mut self) -> Result<Frame> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        self.next_frame().await
    }
}

/// Pull the next complete SOI..EOI-delimited JPEG out of the pipe buffer.
fn extract_jpeg(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let soi = find_marker(buf, [0xFF, 0xD8])?;
    if soi > 0 {
        buf.drain(..soi);
    }
    let eoi = find_marker(&buf[2..], [0xFF, 0xD9])? + 2;
    Some(buf.drain(..eoi + 2).collect())
}

fn find_marker(haystack: &[u8], needle: [u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == needle)
}

/// Scan JPEG markers for a start-of-frame segment and read its dimensions.
pub fn jpeg_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    let mut i = 0usize;
    while i + 3 < data.len() {
        if data[i] != 0xFF {
            i += 1;
            continue;
        }
        let mut j = i + 1;
        while j < data.len() && data[j] == 0xFF {
            j += 1;
        }
        if j >= data.len() {
            break;
        }
        let marker = data[j];
        // Standalone markers carry no length field.
        if matches!(marker, 0x01 | 0xD8 | 0xD9) || (0xD0..=0xD7).contains(&marker) {
            i = j + 1;
            continue;
        }
        if j + 2 >= data.len() {
            break;
        }
        let seg_len = u16::from_be_bytes([data[j + 1], data[j + 2]]) as usize;
        if seg_len < 2 {
            break;
        }
        let is_sof = matches!(
            marker,
            0xC0..=0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF
        );
        if is_sof {
            // Segment layout: len(2) precision(1) height(2) width(2)
            if j + 7 >= data.len() {
                break;
            }
            let height = u16::from_be_bytes([data[j + 4], data[j + 5]]) as u32;
            let width = u16::from_be_bytes([data[j + 6], data[j + 7]]) as u32;
            if width > 0 && height > 0 {
                return Some((width, height));
            }
        }
        i = j + 1 + seg_len;
    }
    None
}
