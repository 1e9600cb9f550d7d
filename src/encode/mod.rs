//! Frame → JPEG payload.
//!
//! Downscales frames wider than the configured maximum (aspect ratio kept,
//! dimensions rounded down) and JPEG-compresses them.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use std::io::Cursor;
use thiserror::Error;

use crate::capture::Frame;
use crate::config::SessionConfig;

pub const JPEG_MIME: &str = "image/jpeg";

/// Compressed frame ready to go on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    pub data: Vec<u8>,
    pub mime_type: &'static str,
    /// Sequence number of the frame this came from
    pub seq: u64,
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("frame {seq} is empty ({width}x{height})")]
    Empty { seq: u64, width: u32, height: u32 },

    #[error("JPEG encode of frame {seq} failed: {err}")]
    Jpeg {
        seq: u64,
        #[source]
        err: image::ImageError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEncoder {
    max_width: Option<u32>,
    quality: u8,
}

impl FrameEncoder {
    /// `quality` is 0-100; values outside the codec's 1-100 range are clamped
    pub fn new(max_width: Option<u32>, quality: u8) -> Self {
        Self { max_width, quality }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.max_width, config.quality)
    }

    /// Output dimensions for a `width` x `height` frame
    pub fn target_size(&self, width: u32, height: u32) -> (u32, u32) {
        match self.max_width {
            Some(max) if max > 0 && width > max => {
                let scaled = (u64::from(height) * u64::from(max) / u64::from(width)) as u32;
                (max, scaled.max(1))
            }
            _ => (width, height),
        }
    }

    /// Consumes the frame; on failure the caller skips it and moves on
    pub fn encode(&self, frame: Frame) -> Result<EncodedPayload, EncodeError> {
        let seq = frame.seq();
        let (width, height) = (frame.width(), frame.height());
        if width == 0 || height == 0 {
            return Err(EncodeError::Empty { seq, width, height });
        }

        let (out_w, out_h) = self.target_size(width, height);
        let image = if (out_w, out_h) == (width, height) {
            frame.into_image()
        } else {
            imageops::resize(frame.image(), out_w, out_h, FilterType::Triangle)
        };

        let mut buf = Cursor::new(Vec::new());
        let encoder = JpegEncoder::new_with_quality(&mut buf, self.quality.clamp(1, 100));
        image
            .write_with_encoder(encoder)
            .map_err(|err| EncodeError::Jpeg { seq, err })?;

        Ok(EncodedPayload {
            data: buf.into_inner(),
            mime_type: JPEG_MIME,
            seq,
        })
    }
}
