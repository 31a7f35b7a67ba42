//! Shared header layout
//!
//! The header sits at offset 0 of the segment and the payload follows at
//! [`HEADER_LEN`]. Every field is atomic: producer and consumers live in different
//! processes and only ever touch the header through shared references.
//!
//! Consumer presence is kept per process: each slot packs a pid (high half) and
//! that process's attachment count (low half), so the slots of a consumer that
//! died can be found and dropped.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{CameraConfig, CameraError, PixelFormat, Result};

/// "VCAM" little-endian, published last during initialisation
pub(crate) const MAGIC: u32 = 0x4D41_4356;
pub(crate) const LAYOUT_VERSION: u32 = 2;
pub(crate) const HEADER_LEN: usize = 256;

/// Consumer processes whose presence can be tracked at once.
pub(crate) const MAX_CONSUMERS: usize = 16;

#[repr(C)]
pub(crate) struct SharedHeader {
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub width: AtomicU32,
    pub height: AtomicU32,
    pub format: AtomicU32,
    pub framerate_bits: AtomicU32,
    pub frame_len: AtomicU64,
    pub created_at_ms: AtomicU64,
    pub producer_pid: AtomicU32,
    /// 0 when free, otherwise the pid of the holder
    pub lock: AtomicU32,
    pub active: AtomicU32,
    pub ready: AtomicU32,
    _pad: [AtomicU32; 2],
    pub sequence: AtomicU64,
    pub last_activity_ms: AtomicU64,
    /// `pid << 32 | attachments`, 0 when free
    pub consumer_slots: [AtomicU64; MAX_CONSUMERS],
    _reserved: [AtomicU64; 6],
}

const _: () = assert!(std::mem::size_of::<SharedHeader>() == HEADER_LEN);

impl SharedHeader {
    /// Write a fresh header for `config`. Consumers only trust it once `magic` is set.
    pub fn initialize(&self, config: &CameraConfig, created_at: SystemTime) {
        self.magic.store(0, Ordering::Release);

        self.version.store(LAYOUT_VERSION, Ordering::Relaxed);
        self.width.store(config.width, Ordering::Relaxed);
        self.height.store(config.height, Ordering::Relaxed);
        self.format.store(config.format.code(), Ordering::Relaxed);
        self.framerate_bits.store(config.framerate.to_bits(), Ordering::Relaxed);
        self.frame_len.store(config.frame_len() as u64, Ordering::Relaxed);
        self.created_at_ms.store(unix_millis(created_at), Ordering::Relaxed);
        self.producer_pid.store(std::process::id(), Ordering::Relaxed);
        self.lock.store(0, Ordering::Relaxed);
        self.ready.store(0, Ordering::Relaxed);
        for slot in &self.consumer_slots {
            slot.store(0, Ordering::Relaxed);
        }
        self.sequence.store(0, Ordering::Relaxed);
        self.last_activity_ms.store(0, Ordering::Relaxed);
        self.active.store(1, Ordering::Relaxed);

        self.magic.store(MAGIC, Ordering::Release);
    }

    /// Check a header written by another process against a segment of `segment_len` bytes.
    pub fn validate(&self, name: &str, segment_len: usize) -> Result<()> {
        if self.magic.load(Ordering::Acquire) != MAGIC {
            return Err(CameraError::NotFound { name: name.to_string() });
        }

        let version = self.version.load(Ordering::Relaxed);
        if version != LAYOUT_VERSION {
            return Err(CameraError::Version { expected: LAYOUT_VERSION, found: version });
        }

        let frame_len = self.frame_len.load(Ordering::Relaxed) as usize;
        let (width, height) = (self.width.load(Ordering::Relaxed), self.height.load(Ordering::Relaxed));
        let expected = self.pixel_format()?.checked_frame_len(width, height).ok_or_else(|| {
            CameraError::memory(format!("header geometry {width}x{height} overflows"))
        })?;
        if frame_len != expected {
            return Err(CameraError::memory(format!(
                "header frame length {frame_len} does not match geometry ({expected})"
            )));
        }
        if HEADER_LEN.checked_add(frame_len).is_none_or(|needed| needed > segment_len) {
            return Err(CameraError::memory(format!(
                "segment of {segment_len} bytes cannot hold a {frame_len} byte frame"
            )));
        }
        Ok(())
    }

    pub fn pixel_format(&self) -> Result<PixelFormat> {
        PixelFormat::try_from(self.format.load(Ordering::Relaxed))
    }

    pub fn framerate(&self) -> f32 {
        f32::from_bits(self.framerate_bits.load(Ordering::Relaxed))
    }

    pub fn touch(&self) {
        self.last_activity_ms.store(unix_millis(SystemTime::now()), Ordering::Release);
    }

    pub fn last_activity(&self) -> Option<SystemTime> {
        match self.last_activity_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(UNIX_EPOCH + Duration::from_millis(ms)),
        }
    }
}

pub(crate) fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    fn zeroed() -> Box<SharedHeader> {
        // SAFETY: every field is an atomic integer, for which all-zero is valid
        unsafe { Box::new(std::mem::zeroed()) }
    }

    #[test]
    fn layout_is_stable() {
        assert_eq!(std::mem::size_of::<SharedHeader>(), 256);
        assert_eq!(std::mem::align_of::<SharedHeader>(), 8);
        assert_eq!(offset_of!(SharedHeader, frame_len), 24);
        assert_eq!(offset_of!(SharedHeader, lock), 44);
        assert_eq!(offset_of!(SharedHeader, sequence), 64);
        assert_eq!(offset_of!(SharedHeader, last_activity_ms), 72);
        assert_eq!(offset_of!(SharedHeader, consumer_slots), 80);
    }

    #[test]
    fn uninitialised_header_reads_as_missing() {
        let header = zeroed();
        assert!(matches!(header.validate("cam", 4096), Err(CameraError::NotFound { .. })));
    }

    #[test]
    fn initialised_header_validates() {
        let header = zeroed();
        let config = CameraConfig::new(8, 4).with_format(PixelFormat::Argb32).with_framerate(25.0);
        header.initialize(&config, SystemTime::now());

        header.validate("cam", HEADER_LEN + 128).expect("valid header");
        assert_eq!(header.pixel_format().unwrap(), PixelFormat::Argb32);
        assert_eq!(header.framerate(), 25.0);
        assert_eq!(header.active.load(Ordering::Relaxed), 1);
        assert!(header.last_activity().is_none());
    }

    #[test]
    fn short_segment_and_version_mismatch_are_rejected() {
        let header = zeroed();
        header.initialize(&CameraConfig::new(8, 4), SystemTime::now());
        assert!(matches!(header.validate("cam", HEADER_LEN + 10), Err(CameraError::Memory { .. })));

        header.version.store(9, Ordering::Relaxed);
        assert!(matches!(
            header.validate("cam", 4096),
            Err(CameraError::Version { expected: LAYOUT_VERSION, found: 9 })
        ));
    }

    #[test]
    fn corrupt_geometry_is_a_memory_error() {
        let header = zeroed();
        header.initialize(&CameraConfig::new(8, 4), SystemTime::now());
        header.width.store(u32::MAX, Ordering::Relaxed);
        header.height.store(u32::MAX, Ordering::Relaxed);
        header.format.store(PixelFormat::Argb32.code(), Ordering::Relaxed);
        header.frame_len.store(u64::MAX, Ordering::Relaxed);

        assert!(matches!(header.validate("cam", 4096), Err(CameraError::Memory { .. })));
    }
}
