//! Per-camera stream worker
//!
//! ## Responsibilities
//!
//! - One capture loop per camera: open once, then read frames until
//!   signaled to stop
//! - Retry mid-stream read failures with a fixed backoff; only an open
//!   failure ends the worker
//! - Downscale oversized frames and dispatch each to the frame sink,
//!   swallowing sink errors so a faulty consumer cannot kill the loop
//! - Release the capture handle unconditionally on every exit path

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::{Frame, StreamOpener};
use crate::error::Result;

/// Backoff after a failed frame read.
const READ_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Consumer of decoded frames, invoked on the owning worker's task.
///
/// Implementations must not block for long; errors cost exactly the one
/// frame and are never retried.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, camera_ip: &str, frame: Frame) -> Result<()>;
}

/// A running (or tearing down) capture worker for one camera.
pub struct StreamWorker {
    camera_ip: IpAddr,
    url: String,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl StreamWorker {
    /// Spawn the capture loop for one camera. Returns immediately; the
    /// loop runs on its own task.
    pub fn spawn(
        camera_ip: IpAddr,
        url: String,
        opener: Arc<dyn StreamOpener>,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let loop_url = url.clone();
        let join = tokio::spawn(async move {
            run_capture_loop(camera_ip, loop_url, opener, sink, token).await;
        });
        Self {
            camera_ip,
            url,
            cancel,
            join,
        }
    }

    pub fn camera_ip(&self) -> IpAddr {
        self.camera_ip
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Signal the loop to stop. Fire-and-forget; teardown completes on
    /// the worker's own task.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether the loop has exited (cleanly or not) and released its
    /// capture handle.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

async fn run_capture_loop(
    camera_ip: IpAddr,
    url: String,
    opener: Arc<dyn StreamOpener>,
    sink: Arc<dyn FrameSink>,
    cancel: CancellationToken,
) {
    let mut stream = match opener.open(&url).await {
        Ok(stream) => stream,
        Err(e) => {
            // The fleet loop sees the finished task and retries the
            // camera next cycle, endpoint selection included.
            tracing::warn!(camera_ip = %camera_ip, url = %url, error = %e, "Stream open failed");
            return;
        }
    };

    tracing::info!(camera_ip = %camera_ip, url = %url, "Stream worker running");
    let ip_str = camera_ip.to_string();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            result = stream.read_frame() => match result {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!(camera_ip = %ip_str, error = %e, "Frame read failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(READ_RETRY_BACKOFF) => {}
                    }
                    continue;
                }
            },
        };

        let frame = frame.downscaled_if_oversized();
        if let Err(e) = sink.on_frame(&ip_str, frame) {
            tracing::debug!(camera_ip = %ip_str, error = %e, "Frame sink error, frame dropped");
        }
    }

    // Capture handle released here no matter how the loop exited.
    drop(stream);
    tracing::info!(camera_ip = %camera_ip, "Stream worker stopped");
}
