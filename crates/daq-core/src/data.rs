//! Frame and image-record types.

use crate::error::DaqError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Free-form per-image metadata, keyed by well-known names.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// A single image frame.
///
/// # Storage
/// Pixels are kept as raw bytes (`Vec<u8>`).
/// - 8-bit images: 1 byte per pixel.
/// - 12/16-bit images: 2 bytes per pixel, little endian.
///
/// Rows are stored top to bottom, `width` pixels each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Bits per pixel (8, 12 or 16)
    pub bit_depth: u32,

    /// Raw pixel data
    pub data: Vec<u8>,
}

impl Frame {
    /// Create a 16-bit frame from pixel values.
    pub fn from_u16(width: u32, height: u32, pixels: &[u16]) -> Self {
        let data = pixels.iter().flat_map(|p| p.to_le_bytes()).collect();
        Self {
            width,
            height,
            bit_depth: 16,
            data,
        }
    }

    /// Create a 16-bit frame from little-endian bytes, checking the length.
    pub fn from_le_bytes(width: u32, height: u32, data: Vec<u8>) -> Result<Self, DaqError> {
        let expected = width as usize * height as usize * 2;
        if data.len() != expected {
            return Err(DaqError::FrameSizeMismatch {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            bit_depth: 16,
            data,
        })
    }

    /// Bytes per pixel for this bit depth.
    pub fn bytes_per_pixel(&self) -> usize {
        if self.bit_depth <= 8 {
            1
        } else {
            2
        }
    }

    /// Pixel value at (x, y).
    pub fn get(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }

        let idx = y as usize * self.width as usize + x as usize;
        match self.bytes_per_pixel() {
            1 => self.data.get(idx).map(|&v| u32::from(v)),
            _ => {
                let start = idx * 2;
                let bytes = self.data.get(start..start + 2)?;
                Some(u32::from(u16::from_le_bytes([bytes[0], bytes[1]])))
            }
        }
    }

    /// All pixels as 16-bit values. 8-bit frames are widened.
    pub fn pixels_u16(&self) -> Vec<u16> {
        match self.bytes_per_pixel() {
            1 => self.data.iter().map(|&v| u16::from(v)).collect(),
            _ => self
                .data
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect(),
        }
    }

    /// Mean pixel value, 0.0 for an empty frame.
    pub fn mean(&self) -> f64 {
        let pixels = self.pixels_u16();
        if pixels.is_empty() {
            return 0.0;
        }
        let sum: u64 = pixels.iter().map(|&v| u64::from(v)).sum();
        sum as f64 / pixels.len() as f64
    }
}

/// An acquired image with its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// Row-major 16-bit pixels, `height` rows of `width`
    pub pixels: Vec<u16>,
    /// Sequence number reported by the device for this image
    pub sequence: u64,
    /// Metadata snapshot taken when the image was delivered
    pub metadata: Metadata,
    /// Wall-clock time at which the image was fully received
    pub received_at: DateTime<Utc>,
}

impl ImageRecord {
    /// Build a record from a 16-bit frame.
    pub fn from_frame(frame: &Frame, sequence: u64, metadata: Metadata) -> Self {
        Self {
            width: frame.width,
            height: frame.height,
            pixels: frame.pixels_u16(),
            sequence,
            metadata,
            received_at: Utc::now(),
        }
    }

    /// Pixel value at (x, y).
    pub fn pixel(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }
}
