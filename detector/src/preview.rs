use motion_watch_common::frame::Frame;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Observer for frames flowing through the detector. Implementations must
/// return quickly; detection waits on `show`.
pub trait FrameDisplay: Send + Sync {
    fn show(&mut self, frame: &Frame);

    /// Release the display. Called at most once by the pipeline, but must be
    /// safe to call repeatedly.
    fn close(&mut self);
}

/// Writes the latest frame to a JPEG file from a background task.
///
/// `show` only swaps the pending frame in a watch channel, at most once per
/// interval, so a slow disk never stalls detection.
pub struct PreviewDisplay {
    tx: Option<watch::Sender<Option<Frame>>>,
    writer: Option<JoinHandle<()>>,
    interval: Duration,
    last_published: Option<Instant>,
}

impl PreviewDisplay {
    /// Start the writer task. Must be called from within a tokio runtime.
    pub fn spawn(path: PathBuf, interval: Duration, quality: u8) -> Self {
        let (tx, rx) = watch::channel(None);
        let writer = tokio::spawn(run_writer(path, rx, quality));
        Self {
            tx: Some(tx),
            writer: Some(writer),
            interval,
            last_published: None,
        }
    }
}

impl FrameDisplay for PreviewDisplay {
    fn show(&mut self, frame: &Frame) {
        let Some(tx) = &self.tx else {
            return;
        };
        let due = self
            .last_published
            .map_or(true, |at| at.elapsed() >= self.interval);
        if due {
            tx.send_replace(Some(frame.clone()));
            self.last_published = Some(Instant::now());
        }
    }

    fn close(&mut self) {
        // Dropping the sender lets the writer finish its current file and exit
        if self.tx.take().is_some() {
            self.writer.take();
            info!("preview display closed");
        }
    }
}

impl Drop for PreviewDisplay {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_writer(path: PathBuf, mut rx: watch::Receiver<Option<Frame>>, quality: u8) {
    let tmp = path.with_extension("jpg.tmp");
    while rx.changed().await.is_ok() {
        let Some(frame) = rx.borrow_and_update().clone() else {
            continue;
        };
        let encoded = tokio::task::spawn_blocking(move || frame.encode_jpeg(quality)).await;
        let jpeg = match encoded {
            Ok(Ok(jpeg)) => jpeg,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to encode preview frame");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "preview encoder task failed");
                continue;
            }
        };
        if let Err(e) = write_atomically(&tmp, &path, &jpeg).await {
            warn!(error = %e, path = %path.display(), "failed to write preview");
        } else {
            debug!(bytes = jpeg.len(), "preview updated");
        }
    }
}

async fn write_atomically(tmp: &Path, path: &Path, data: &[u8]) -> std::io::Result<()> {
    tokio::fs::write(tmp, data).await?;
    tokio::fs::rename(tmp, path).await
}
