use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, Rgb, RgbImage};

/// A decoded camera frame with capture metadata.
///
/// Pixels are stored as packed RGB8 rows. A frame owns its buffer outright,
/// so a source can reuse its own decode buffers without aliasing frames it
/// already handed out.
#[derive(Debug, Clone)]
pub struct Frame {
    image: RgbImage,
    pub captured_at_ms: i64,
    pub seq: u64,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            image,
            captured_at_ms,
            seq,
        }
    }

    /// Build a frame from packed RGB8 bytes. The buffer must hold exactly
    /// `width * height * 3` bytes.
    pub fn from_rgb(
        width: u32,
        height: u32,
        data: Vec<u8>,
        captured_at_ms: i64,
        seq: u64,
    ) -> Result<Self, FrameError> {
        let got = data.len();
        let image = RgbImage::from_raw(width, height, data).ok_or(FrameError::BufferSize {
            got,
            expected: width as usize * height as usize * 3,
        })?;
        Ok(Self::new(image, captured_at_ms, seq))
    }

    /// A frame where every pixel has the same color.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3], captured_at_ms: i64, seq: u64) -> Self {
        Self::new(
            RgbImage::from_pixel(width, height, Rgb(rgb)),
            captured_at_ms,
            seq,
        )
    }

    /// A zero-size frame. Sources may yield these when the device hands back
    /// nothing; downstream treats them as "no sample".
    pub fn empty(captured_at_ms: i64, seq: u64) -> Self {
        Self::new(RgbImage::new(0, 0), captured_at_ms, seq)
    }

    /// Decode a JPEG image into a frame.
    pub fn decode_jpeg(data: &[u8], captured_at_ms: i64, seq: u64) -> Result<Self, FrameError> {
        let image = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
            .map_err(FrameError::Decode)?
            .to_rgb8();
        Ok(Self::new(image, captured_at_ms, seq))
    }

    /// Encode the frame as JPEG at the given quality (1-100).
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        if self.is_empty() {
            return Err(FrameError::Empty);
        }
        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
            .encode_image(&self.image)
            .map_err(FrameError::Encode)?;
        Ok(buf)
    }

    // -- Convenience accessors --------------------------------------------------

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }

    /// Packed RGB8 pixel bytes, row-major.
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    /// File name used when the frame is exported as an alert attachment.
    pub fn export_name(&self) -> String {
        let dt = chrono::DateTime::from_timestamp_millis(self.captured_at_ms)
            .unwrap_or_else(chrono::Utc::now);
        let ts = dt.format("%Y%m%dT%H%M%S%3fZ");
        format!("motion_{ts}_{seq:06}.jpg", seq = self.seq)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("pixel buffer has {got} bytes, expected {expected}")]
    BufferSize { got: usize, expected: usize },
    #[error("cannot encode an empty frame")]
    Empty,
    #[error("failed to decode JPEG: {0}")]
    Decode(image::ImageError),
    #[error("failed to encode JPEG: {0}")]
    Encode(image::ImageError),
}
