use motion_watch_capture::{CaptureError, FrameSource};
use motion_watch_common::config::DetectionConfig;
use motion_watch_common::frame::Frame;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::handoff::{self, Closer};
use crate::preview::FrameDisplay;
use crate::trigger::{AlertImage, Trigger};
use crate::window::MotionWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_window: usize,
    pub batch_size: usize,
    /// Aggregate similarity strictly below this counts as motion.
    pub alert_threshold: f64,
    pub trigger_timeout: Duration,
    pub jpeg_quality: u8,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&DetectionConfig::default())
    }
}

impl From<&DetectionConfig> for PipelineConfig {
    fn from(config: &DetectionConfig) -> Self {
        Self {
            max_window: config.max_window,
            batch_size: config.batch_size.max(1),
            alert_threshold: config.alert_threshold,
            trigger_timeout: Duration::from_secs(config.trigger_timeout_secs),
            jpeg_quality: config.jpeg_quality,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),
    #[error("pipeline cannot start from state {0:?}")]
    NotIdle(PipelineState),
    #[error("pipeline was closed before it started")]
    Closed,
    #[error("detection task failed: {0}")]
    Detection(#[from] tokio::task::JoinError),
}

/// Resources handed to the two tasks when the pipeline starts, or released by
/// `close()` if it never does.
struct Parts {
    source: Box<dyn FrameSource>,
    display: Option<Box<dyn FrameDisplay>>,
    tx: handoff::Sender<Frame>,
    rx: handoff::Receiver<Frame>,
}

/// Capture → rendezvous handoff → motion window → trigger.
///
/// `start()` runs the capture loop on the calling task and the detection loop
/// on a spawned task, and returns once both have finished. Closing the handoff
/// is the only stop signal: `close()` sets it, and so does a capture failure.
pub struct MotionPipeline {
    config: PipelineConfig,
    trigger: Option<Arc<dyn Trigger>>,
    state: Mutex<PipelineState>,
    parts: Mutex<Option<Parts>>,
    closer: Closer,
}

impl MotionPipeline {
    pub fn new(source: Box<dyn FrameSource>, config: PipelineConfig) -> Self {
        let (tx, rx, closer) = handoff::channel();
        Self {
            config,
            trigger: None,
            state: Mutex::new(PipelineState::Idle),
            parts: Mutex::new(Some(Parts {
                source,
                display: None,
                tx,
                rx,
            })),
            closer,
        }
    }

    pub fn with_trigger(mut self, trigger: Arc<dyn Trigger>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_display(mut self, display: Box<dyn FrameDisplay>) -> Self {
        if let Some(parts) = self
            .parts
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            parts.display = Some(display);
        }
        self
    }

    pub fn state(&self) -> PipelineState {
        *self.lock_state()
    }

    fn lock_state(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_parts(&self) -> Option<Parts> {
        self.parts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Run until `close()` is called or capture fails.
    pub async fn start(&self) -> Result<(), PipelineError> {
        let parts = {
            let mut state = self.lock_state();
            if *state != PipelineState::Idle {
                return Err(PipelineError::NotIdle(*state));
            }
            let Some(parts) = self.take_parts() else {
                return Err(PipelineError::Closed);
            };
            *state = PipelineState::Running;
            parts
        };
        let Parts {
            mut source,
            display,
            tx,
            rx,
        } = parts;

        info!(
            source = source.name(),
            max_window = self.config.max_window,
            batch_size = self.config.batch_size,
            alert_threshold = self.config.alert_threshold,
            trigger = ?self.trigger.as_ref().map(|t| t.name()),
            "motion pipeline running"
        );

        let detector = Detector {
            window: MotionWindow::new(self.config.max_window),
            config: self.config.clone(),
            trigger: self.trigger.clone(),
            display,
        };
        let detection = tokio::spawn(detector.run(rx));

        let captured = capture_loop(source.as_mut(), tx, &self.closer).await;
        source.release();
        let detected = detection.await;

        *self.lock_state() = PipelineState::Stopped;

        match (captured, detected) {
            (Err(e), _) => {
                error!(error = %e, "capture failed, motion pipeline stopped");
                Err(PipelineError::Capture(e))
            }
            (Ok(_), Err(e)) => {
                error!(error = %e, "detection task failed");
                Err(PipelineError::Detection(e))
            }
            (Ok(frames), Ok(evaluations)) => {
                info!(frames, evaluations, "motion pipeline stopped");
                Ok(())
            }
        }
    }

    /// Stop the pipeline and release the source and display. Safe to call
    /// any number of times, before or after `start()`.
    pub fn close(&self) {
        if self.closer.close() {
            info!("closing motion pipeline");
        }
        if let Some(parts) = self.take_parts() {
            let Parts {
                mut source,
                display,
                ..
            } = parts;
            source.release();
            if let Some(mut display) = display {
                display.close();
            }
        }
        let mut state = self.lock_state();
        if *state == PipelineState::Idle {
            *state = PipelineState::Stopped;
        }
    }
}

/// Read frames and hand them over one at a time. Returns the number of frames
/// delivered, or the capture error after closing the handoff.
async fn capture_loop(
    source: &mut dyn FrameSource,
    mut tx: handoff::Sender<Frame>,
    closer: &Closer,
) -> Result<u64, CaptureError> {
    let mut delivered = 0;
    while !closer.is_closed() {
        let frame = match source.read().await {
            Ok(frame) => frame,
            Err(e) => {
                closer.close();
                return Err(e);
            }
        };
        if frame.is_empty() {
            debug!(seq = frame.seq, "empty frame, skipping");
            tokio::task::yield_now().await;
            continue;
        }
        if tx.send(frame).await.is_err() {
            break;
        }
        delivered += 1;
    }
    Ok(delivered)
}

/// Detection side of the pipeline: owns the window, the batch counter and the
/// display.
struct Detector {
    window: MotionWindow,
    config: PipelineConfig,
    trigger: Option<Arc<dyn Trigger>>,
    display: Option<Box<dyn FrameDisplay>>,
}

impl Detector {
    async fn run(mut self, mut rx: handoff::Receiver<Frame>) -> u64 {
        let mut evaluations = 0;
        while let Some(frame) = rx.recv().await {
            self.window.append(frame);

            if let (Some(display), Some(latest)) = (self.display.as_mut(), self.window.latest()) {
                display.show(latest);
            }

            if !self.window.batch_complete(self.config.batch_size) {
                continue;
            }
            let Some(similarity) = self.score().await else {
                continue;
            };
            evaluations += 1;
            let motion = similarity < self.config.alert_threshold;
            info!(
                similarity,
                window = self.window.len(),
                motion,
                "frame similarity"
            );
            if motion {
                self.alert().await;
            }
        }

        if let Some(mut display) = self.display.take() {
            display.close();
        }
        evaluations
    }

    /// Score the window on the blocking pool and take it back afterwards.
    async fn score(&mut self) -> Option<f64> {
        let placeholder = MotionWindow::new(self.config.max_window);
        let window = std::mem::replace(&mut self.window, placeholder);
        let scored = tokio::task::spawn_blocking(move || {
            let similarity = window.aggregate_score();
            (window, similarity)
        })
        .await;
        match scored {
            Ok((window, similarity)) => {
                self.window = window;
                Some(similarity)
            }
            Err(e) => {
                error!(error = %e, "similarity scoring failed, window reset");
                None
            }
        }
    }

    async fn alert(&self) {
        let Some(trigger) = &self.trigger else {
            debug!("motion detected but no trigger registered");
            return;
        };
        let Some(frame) = self.window.latest().cloned() else {
            return;
        };
        let seq = frame.seq;
        let quality = self.config.jpeg_quality;
        let encoded =
            tokio::task::spawn_blocking(move || AlertImage::from_frame(&frame, quality)).await;
        let image = match encoded {
            Ok(Ok(image)) => image,
            Ok(Err(e)) => {
                warn!(error = %e, seq, "error converting frame to image");
                return;
            }
            Err(e) => {
                warn!(error = %e, seq, "alert encoder task failed");
                return;
            }
        };

        match tokio::time::timeout(self.config.trigger_timeout, trigger.fire(image)).await {
            Ok(Ok(())) => info!(trigger = trigger.name(), seq, "motion alert fired"),
            Ok(Err(e)) => warn!(error = %e, trigger = trigger.name(), seq, "trigger failed"),
            Err(_) => warn!(
                trigger = trigger.name(),
                timeout = ?self.config.trigger_timeout,
                seq,
                "trigger timed out"
            ),
        }
    }
}
