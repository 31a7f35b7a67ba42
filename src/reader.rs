//! Consumer-side access to a camera's frame buffer
//!
//! This is the view the capture pipeline uses: it maps the segment of a running
//! producer by session name, reports when applications open or close the camera,
//! and copies out the latest frame under the shared lock.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

use crate::buffer::FrameBuffer;
use crate::config::validate_name;
use crate::shm::SessionNames;
use crate::{Frame, PixelFormat, Result, WaitResult};

/// Read-only (apart from presence) view of a running camera
pub struct CameraReader {
    buffer: FrameBuffer,
}

impl CameraReader {
    /// Open the camera published under `name` in the default runtime directory.
    pub fn open(name: &str) -> Result<Self> {
        Self::open_in(name, None)
    }

    /// Open the camera published under `name`, looking in `runtime_dir` on unix.
    pub fn open_in(name: &str, runtime_dir: Option<PathBuf>) -> Result<Self> {
        validate_name(name)?;
        let names = SessionNames::new(name, runtime_dir);
        let buffer = FrameBuffer::open(&names)?;

        info!(
            name,
            width = buffer.width(),
            height = buffer.height(),
            format = %buffer.format(),
            "Opened camera for reading"
        );
        Ok(Self { buffer })
    }

    pub fn name(&self) -> &str {
        self.buffer.name()
    }

    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.buffer.height()
    }

    pub fn format(&self) -> PixelFormat {
        self.buffer.format()
    }

    pub fn framerate(&self) -> f32 {
        self.buffer.framerate()
    }

    pub fn frame_len(&self) -> usize {
        self.buffer.frame_len()
    }

    /// Sequence number of the latest complete frame; 0 before the first.
    pub fn sequence(&self) -> u64 {
        self.buffer.sequence()
    }

    /// Whether the producer session is still alive.
    pub fn is_producer_active(&self) -> bool {
        self.buffer.is_active()
    }

    /// Report that an application opened the camera. Detaches on drop.
    pub fn attach(&self) -> Attachment<'_> {
        self.notify_attach();
        Attachment { reader: self, attached: true }
    }

    /// Raw presence increment, for callers that manage pairing themselves.
    pub fn notify_attach(&self) -> u32 {
        self.buffer.sync(None).notify_attach()
    }

    /// Raw presence decrement; saturates at zero.
    pub fn notify_detach(&self) -> u32 {
        self.buffer.sync(None).notify_detach()
    }

    pub fn consumers(&self) -> u32 {
        self.buffer.sync(None).consumers()
    }

    pub fn last_activity(&self) -> Option<SystemTime> {
        self.buffer.sync(None).last_activity()
    }

    /// Snapshot the latest complete frame, or `None` if none was sent yet.
    pub fn read(&self) -> Result<Option<Frame>> {
        self.buffer.snapshot()
    }

    /// Copy the latest complete frame into `dst` without allocating.
    ///
    /// `dst` must be exactly [`frame_len`](Self::frame_len) bytes.
    pub fn read_into(&self, dst: &mut [u8]) -> Result<Option<u64>> {
        self.buffer.read_into(dst)
    }

    /// Wait for a frame newer than `last_sequence`; `Duration::ZERO` waits forever.
    pub fn wait_for_new_frame(&self, last_sequence: u64, timeout: Duration) -> WaitResult {
        self.buffer.wait_for_new_frame(last_sequence, timeout, None)
    }
}

impl std::fmt::Debug for CameraReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraReader")
            .field("name", &self.name())
            .field("width", &self.width())
            .field("height", &self.height())
            .field("format", &self.format())
            .field("sequence", &self.sequence())
            .finish()
    }
}

/// Presence registration of one consumer; detaches when dropped
#[must_use = "dropping an Attachment detaches immediately"]
pub struct Attachment<'a> {
    reader: &'a CameraReader,
    attached: bool,
}

impl Attachment<'_> {
    /// Detach now rather than at drop.
    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.attached) {
            self.reader.notify_detach();
            debug!(name = self.reader.name(), "Attachment released");
        }
    }
}

impl Drop for Attachment<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
