//! Frame acquisition from network cameras.
//!
//! A [`FrameSource`] hands out one freshly decoded [`Frame`] per `read()`.
//! Errors returned by `read()` are fatal for the current capture session; the
//! caller decides whether to reconnect.

pub mod mjpeg;
pub mod snapshot;
#[cfg(test)]
mod testing;

use async_trait::async_trait;
use motion_watch_common::config::CameraConfig;
use motion_watch_common::frame::Frame;
use std::time::Duration;

pub use mjpeg::MjpegSource;
pub use snapshot::SnapshotSource;

#[async_trait]
pub trait FrameSource: Send {
    /// Read the next frame. May return an empty frame when the device had
    /// nothing usable; callers skip those and read again.
    async fn read(&mut self) -> Result<Frame, CaptureError>;

    /// Drop the underlying connection. Reading after release reconnects.
    fn release(&mut self);

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("camera stream ended")]
    StreamEnded,
    #[error("unknown camera mode '{0}', expected 'mjpeg' or 'snapshot'")]
    UnsupportedMode(String),
    #[error("capture device error: {0}")]
    Device(String),
}

/// Build the source selected by `camera.mode`.
pub fn open_source(config: &CameraConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
    let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
    let read_timeout = Duration::from_secs(config.read_timeout_secs);
    match config.mode.as_str() {
        "mjpeg" => Ok(Box::new(MjpegSource::new(
            &config.url,
            connect_timeout,
            read_timeout,
        ))),
        "snapshot" => {
            let fps = if config.fps > 0.0 { config.fps } else { 1.0 };
            let interval = Duration::from_secs_f64(1.0 / fps);
            Ok(Box::new(SnapshotSource::new(
                &config.url,
                interval,
                connect_timeout,
                read_timeout,
            )?))
        }
        other => Err(CaptureError::UnsupportedMode(other.to_string())),
    }
}
