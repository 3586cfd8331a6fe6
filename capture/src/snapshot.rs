use async_trait::async_trait;
use chrono::Utc;
use motion_watch_common::frame::Frame;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::{CaptureError, FrameSource};

/// Polling-based source: fetches one JPEG per tick from a single-frame endpoint.
pub struct SnapshotSource {
    client: reqwest::Client,
    url: String,
    interval: Duration,
    /// Upper bound on one whole request, body included.
    read_timeout: Duration,
    // Created on first read so construction does not need a running runtime.
    ticker: Option<Interval>,
    seq: u64,
}

impl SnapshotSource {
    pub fn new(
        url: &str,
        interval: Duration,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, CaptureError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(CaptureError::HttpConnect)?;
        Ok(Self {
            client,
            url: url.to_string(),
            interval,
            read_timeout,
            ticker: None,
            seq: 0,
        })
    }
}

#[async_trait]
impl FrameSource for SnapshotSource {
    async fn read(&mut self) -> Result<Frame, CaptureError> {
        let interval = self.interval;
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        ticker.tick().await;

        let resp = self
            .client
            .get(&self.url)
            .timeout(self.read_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CaptureError::HttpStream(e)
                } else {
                    CaptureError::HttpConnect(e)
                }
            })?;
        if !resp.status().is_success() {
            return Err(CaptureError::HttpStatus(resp.status().as_u16()));
        }
        let jpeg_data = resp.bytes().await.map_err(CaptureError::HttpStream)?;

        let seq = self.seq;
        self.seq += 1;
        let now_ms = Utc::now().timestamp_millis();
        if jpeg_data.is_empty() {
            return Ok(Frame::empty(now_ms, seq));
        }
        match Frame::decode_jpeg(&jpeg_data, now_ms, seq) {
            Ok(frame) => {
                debug!(seq, bytes = jpeg_data.len(), "fetched snapshot");
                Ok(frame)
            }
            Err(e) => {
                warn!(error = %e, seq, "failed to decode snapshot, skipping");
                Ok(Frame::empty(now_ms, seq))
            }
        }
    }

    fn release(&mut self) {
        self.ticker = None;
    }

    fn name(&self) -> &str {
        "snapshot"
    }
}
