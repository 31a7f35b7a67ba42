//! Frame snapshots handed to consumers

use std::sync::Arc;

use super::PixelFormat;

/// A complete frame copied out of the shared buffer.
///
/// The payload is shared via `Arc` so a single snapshot can fan out to
/// several subscribers without another copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Pixel payload, `width * height * format.bytes_per_pixel()` bytes
    pub data: Arc<[u8]>,

    /// Sequence number assigned by the producer, starting at 1
    pub sequence: u64,

    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Frame {
    /// Create a new frame snapshot
    pub fn new(data: Vec<u8>, sequence: u64, width: u32, height: u32, format: PixelFormat) -> Self {
        Self { data: data.into(), sequence, width, height, format }
    }

    /// Bytes in one row of pixels.
    pub fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Pixel bytes of row `y`, or `None` past the last row.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let stride = self.stride();
        let start = y as usize * stride;
        self.data.get(start..start + stride)
    }
}
