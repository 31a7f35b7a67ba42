//! Raw pixel layouts accepted by the camera

use serde::{Deserialize, Serialize};

use crate::CameraError;

/// Pixel layout of a camera frame.
///
/// Rows are tightly packed, with no padding between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 24-bit RGB, 3 bytes per pixel in R,G,B order, no alpha
    #[default]
    Rgb24,
    /// 32-bit ARGB, 4 bytes per pixel in A,R,G,B order
    Argb32,
}

impl PixelFormat {
    /// Returns the size in bytes of one pixel.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
            PixelFormat::Argb32 => 4,
        }
    }

    /// Payload length of a `width` x `height` frame in this format.
    ///
    /// Saturates at `usize::MAX`; use [`checked_frame_len`](Self::checked_frame_len)
    /// for geometry that has not been validated.
    pub const fn frame_len(self, width: u32, height: u32) -> usize {
        match self.checked_frame_len(width, height) {
            Some(len) => len,
            None => usize::MAX,
        }
    }

    /// Payload length, or `None` if it does not fit in `usize`.
    pub const fn checked_frame_len(self, width: u32, height: u32) -> Option<usize> {
        match (width as usize).checked_mul(height as usize) {
            Some(pixels) => pixels.checked_mul(self.bytes_per_pixel()),
            None => None,
        }
    }

    /// Numeric code stored in the shared header.
    pub const fn code(self) -> u32 {
        match self {
            PixelFormat::Rgb24 => 0,
            PixelFormat::Argb32 => 1,
        }
    }
}

impl TryFrom<u32> for PixelFormat {
    type Error = CameraError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(PixelFormat::Rgb24),
            1 => Ok(PixelFormat::Argb32),
            other => Err(CameraError::invalid_argument(format!("unsupported pixel format {other}"))),
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PixelFormat::Rgb24 => f.write_str("RGB24"),
            PixelFormat::Argb32 => f.write_str("ARGB32"),
        }
    }
}
