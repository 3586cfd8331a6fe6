use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use motion_watch_common::frame::Frame;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{CaptureError, FrameSource};

const DEFAULT_BOUNDARY: &str = "frame";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Parse state for the MJPEG multipart stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Looking for the boundary marker `--<boundary>\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of part headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental splitter for `multipart/x-mixed-replace` bodies.
struct PartParser {
    boundary: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
    /// Offset into `buffer` where the boundary search resumes, so that a
    /// large part is not rescanned on every chunk.
    scan_from: usize,
}

impl PartParser {
    fn new(boundary: &str) -> Self {
        Self {
            boundary: format!("--{boundary}\r\n").into_bytes(),
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            scan_from: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pop the next complete part body, if the buffer holds one.
    fn next_part(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.boundary) {
                        let _ = self.buffer.split_to(pos + self.boundary.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep the tail in case the boundary spans chunks
                        if self.buffer.len() > self.boundary.len() {
                            let _ = self.buffer.split_to(self.buffer.len() - self.boundary.len());
                        }
                        return None;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    let pos = find_subsequence(&self.buffer, HEADER_END)?;
                    let _ = self.buffer.split_to(pos + HEADER_END.len());
                    self.scan_from = 0;
                    self.state = ParseState::CollectingJpeg;
                }
                ParseState::CollectingJpeg => {
                    let Some(pos) = find_subsequence(&self.buffer[self.scan_from..], &self.boundary)
                    else {
                        self.scan_from = self.buffer.len().saturating_sub(self.boundary.len());
                        return None;
                    };
                    let jpeg_end = self.scan_from + pos;
                    // Strip trailing \r\n before boundary
                    let end = if jpeg_end >= 2
                        && self.buffer[jpeg_end - 2] == b'\r'
                        && self.buffer[jpeg_end - 1] == b'\n'
                    {
                        jpeg_end - 2
                    } else {
                        jpeg_end
                    };
                    let part = self.buffer[..end].to_vec();
                    let _ = self.buffer.split_to(jpeg_end + self.boundary.len());
                    self.state = ParseState::SeekingHeaderEnd;
                    return Some(part);
                }
            }
        }
    }
}

/// Frame source backed by an HTTP MJPEG stream.
///
/// The connection is opened lazily on the first `read()`. Parts that fail to
/// decode are logged and skipped; a zero-length part yields an empty frame.
/// A stream that stays silent for `read_timeout` fails with `HttpStream`.
pub struct MjpegSource {
    url: String,
    connect_timeout: Duration,
    read_timeout: Duration,
    stream: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    parser: PartParser,
    seq: u64,
}

impl MjpegSource {
    pub fn new(url: &str, connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            connect_timeout,
            read_timeout,
            stream: None,
            parser: PartParser::new(DEFAULT_BOUNDARY),
            seq: 0,
        }
    }

    async fn connect(&mut self) -> Result<(), CaptureError> {
        info!(url = self.url, "connecting to MJPEG stream");
        let client = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .read_timeout(self.read_timeout)
            .build()
            .map_err(CaptureError::HttpConnect)?;
        let response = client
            .get(&self.url)
            .send()
            .await
            .map_err(CaptureError::HttpConnect)?;

        if !response.status().is_success() {
            return Err(CaptureError::HttpStatus(response.status().as_u16()));
        }

        let boundary = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(boundary_from_content_type)
            .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string());

        info!(status = %response.status(), boundary, "connected to MJPEG stream");

        self.parser = PartParser::new(&boundary);
        self.stream = Some(response.bytes_stream().boxed());
        Ok(())
    }
}

#[async_trait]
impl FrameSource for MjpegSource {
    async fn read(&mut self) -> Result<Frame, CaptureError> {
        loop {
            if let Some(jpeg) = self.parser.next_part() {
                let seq = self.seq;
                self.seq += 1;
                let now_ms = Utc::now().timestamp_millis();
                if jpeg.is_empty() {
                    return Ok(Frame::empty(now_ms, seq));
                }
                match Frame::decode_jpeg(&jpeg, now_ms, seq) {
                    Ok(frame) => {
                        debug!(seq, bytes = jpeg.len(), "decoded MJPEG part");
                        return Ok(frame);
                    }
                    Err(e) => {
                        warn!(error = %e, seq, "failed to decode MJPEG part, skipping");
                        continue;
                    }
                }
            }

            let Some(stream) = self.stream.as_mut() else {
                self.connect().await?;
                continue;
            };
            match stream.next().await {
                Some(Ok(chunk)) => self.parser.push(&chunk),
                Some(Err(e)) => return Err(CaptureError::HttpStream(e)),
                None => return Err(CaptureError::StreamEnded),
            }
        }
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            info!(url = self.url, "closed MJPEG stream");
        }
        self.parser = PartParser::new(DEFAULT_BOUNDARY);
    }

    fn name(&self) -> &str {
        "mjpeg"
    }
}

/// Extract the `boundary` parameter from a multipart content type.
fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("boundary="))
        .map(|b| b.trim_matches('"').trim_start_matches("--").to_string())
        .filter(|b| !b.is_empty())
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
