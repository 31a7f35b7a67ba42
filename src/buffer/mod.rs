//! The shared frame buffer
//!
//! One segment holds exactly one frame: a [`SharedHeader`] followed by the payload.
//! There is no queue. The producer overwrites the payload in place and a slow
//! consumer simply sees the same sequence number again.
//!
//! Write protocol (producer):
//!
//! 1. take the lock word
//! 2. copy the payload
//! 3. bump `sequence`, then set `ready`
//! 4. release the lock
//!
//! Consumers take the same lock for their copy, so a reader never observes a frame
//! that is half old and half new.

mod header;

pub(crate) use header::{HEADER_LEN, MAX_CONSUMERS, SharedHeader};

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, trace};

use crate::shm::{SessionNames, SharedSegment, process_alive};
use crate::sync::{CancelSignal, POLL_INTERVAL, Synchronizer, deadline_after};
use crate::{CameraConfig, CameraError, Frame, PixelFormat, Result, WaitResult};

/// Header plus payload in a shared segment
pub(crate) struct FrameBuffer {
    segment: SharedSegment,
    name: String,
    frame_len: usize,
}

impl FrameBuffer {
    /// Allocate and initialise a buffer for `config` (producer side).
    pub fn create(names: &SessionNames, config: &CameraConfig, created_at: SystemTime) -> Result<Self> {
        let frame_len = config.frame_len();
        let segment = SharedSegment::create(names, HEADER_LEN + frame_len)?;

        let buffer = Self { segment, name: names.name.clone(), frame_len };
        buffer.header().initialize(config, created_at);

        debug!(
            name = %names.name,
            width = config.width,
            height = config.height,
            format = %config.format,
            frame_len,
            "Frame buffer initialised"
        );
        Ok(buffer)
    }

    /// Map the buffer of a running producer (consumer side).
    pub fn open(names: &SessionNames) -> Result<Self> {
        let segment = SharedSegment::open(names)?;
        if segment.len() < HEADER_LEN {
            return Err(CameraError::NotFound { name: names.name.clone() });
        }

        // SAFETY: the segment is at least HEADER_LEN bytes and page aligned
        let header = unsafe { &*(segment.as_ptr() as *const SharedHeader) };
        header.validate(&names.name, segment.len())?;
        let frame_len = header.frame_len.load(Ordering::Relaxed) as usize;

        let buffer = Self { segment, name: names.name.clone(), frame_len };
        if !buffer.is_active() {
            debug!(name = %names.name, "Segment left behind by a producer that is gone");
            return Err(CameraError::NotFound { name: names.name.clone() });
        }
        Ok(buffer)
    }

    pub fn header(&self) -> &SharedHeader {
        // SAFETY: create/open guarantee the mapping holds a full header, and the
        // mapping is page aligned, which satisfies the header's alignment.
        unsafe { &*(self.segment.as_ptr() as *const SharedHeader) }
    }

    /// Synchronization view, optionally tied to a session's cancel signal.
    pub fn sync<'a>(&'a self, cancel: Option<&'a CancelSignal>) -> Synchronizer<'a> {
        Synchronizer::new(self.header(), cancel)
    }

    fn payload(&self) -> *mut u8 {
        // SAFETY: HEADER_LEN + frame_len <= segment length, checked on create/open
        unsafe { self.segment.as_ptr().add(HEADER_LEN) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn width(&self) -> u32 {
        self.header().width.load(Ordering::Relaxed)
    }

    pub fn height(&self) -> u32 {
        self.header().height.load(Ordering::Relaxed)
    }

    pub fn format(&self) -> PixelFormat {
        self.header().pixel_format().unwrap_or_default()
    }

    pub fn framerate(&self) -> f32 {
        self.header().framerate()
    }

    /// Sequence number of the last complete frame; 0 before the first write.
    pub fn sequence(&self) -> u64 {
        self.header().sequence.load(Ordering::Acquire)
    }

    pub fn is_ready(&self) -> bool {
        self.header().ready.load(Ordering::Acquire) != 0
    }

    /// Whether the producer is alive and has not deleted the session.
    ///
    /// A producer that crashed never clears `active`, so its process is checked too.
    pub fn is_active(&self) -> bool {
        let header = self.header();
        header.active.load(Ordering::Acquire) != 0
            && process_alive(header.producer_pid.load(Ordering::Relaxed))
    }

    /// Tell consumers the producer is gone.
    pub fn deactivate(&self) {
        self.header().active.store(0, Ordering::Release);
    }

    /// Copy one frame in and publish it. Returns the new sequence number.
    pub fn write(&self, bytes: &[u8], cancel: Option<&CancelSignal>) -> Result<u64> {
        if bytes.len() != self.frame_len {
            return Err(CameraError::FrameSize { expected: self.frame_len, actual: bytes.len() });
        }

        let header = self.header();
        let _guard = self.sync(cancel).lock()?;

        // SAFETY: the payload region is frame_len bytes and the lock word gives us
        // exclusive access to it; `bytes` is ordinary process memory.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.payload(), self.frame_len);
        }
        let sequence = header.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        header.ready.store(1, Ordering::Release);

        trace!(sequence, len = bytes.len(), "Frame written");
        Ok(sequence)
    }

    /// Copy the latest complete frame into `dst`.
    ///
    /// Returns its sequence number, or `None` if nothing has been written yet.
    pub fn read_into(&self, dst: &mut [u8]) -> Result<Option<u64>> {
        if dst.len() != self.frame_len {
            return Err(CameraError::FrameSize { expected: self.frame_len, actual: dst.len() });
        }

        let header = self.header();
        let sequence = {
            let _guard = self.sync(None).lock()?;
            if !self.is_ready() {
                return Ok(None);
            }
            // SAFETY: as in `write`, with the copy direction reversed
            unsafe {
                std::ptr::copy_nonoverlapping(self.payload(), dst.as_mut_ptr(), self.frame_len);
            }
            header.sequence.load(Ordering::Acquire)
        };
        header.touch();

        trace!(sequence, "Frame read");
        Ok(Some(sequence))
    }

    /// Snapshot the latest complete frame.
    pub fn snapshot(&self) -> Result<Option<Frame>> {
        let mut data = vec![0u8; self.frame_len];
        Ok(self
            .read_into(&mut data)?
            .map(|sequence| Frame::new(data, sequence, self.width(), self.height(), self.format())))
    }

    /// Wait until a frame newer than `last_sequence` is published.
    ///
    /// `Duration::ZERO` waits without a time bound. Returns `Closed` when the
    /// producer deactivates the buffer or `cancel` fires.
    pub fn wait_for_new_frame(
        &self,
        last_sequence: u64,
        timeout: Duration,
        cancel: Option<&CancelSignal>,
    ) -> WaitResult {
        let deadline = deadline_after(timeout);
        let sync = self.sync(cancel);

        loop {
            if self.sequence() > last_sequence {
                return WaitResult::Signaled;
            }
            if !self.is_active() {
                return WaitResult::Closed;
            }

            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                return WaitResult::Timeout;
            }
            let step = now + POLL_INTERVAL;
            if sync.pause_until(deadline.map_or(step, |d| step.min(d))) {
                return WaitResult::Closed;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_utils::{exited_pid, pattern_frame, unique_session_name};
    use tempfile::TempDir;

    fn names(dir: &TempDir) -> SessionNames {
        SessionNames::new(&unique_session_name("buffer"), Some(dir.path().into()))
    }

    #[test]
    fn write_then_read_is_bit_exact() {
        let dir = TempDir::new().unwrap();
        let names = names(&dir);
        let config = CameraConfig::new(8, 4);
        let producer = FrameBuffer::create(&names, &config, SystemTime::now()).unwrap();
        let consumer = FrameBuffer::open(&names).unwrap();

        assert_eq!(consumer.frame_len(), 8 * 4 * 3);
        assert!(consumer.snapshot().unwrap().is_none(), "no frame before first write");

        let frame = pattern_frame(producer.frame_len(), 7);
        assert_eq!(producer.write(&frame, None).unwrap(), 1);

        let snapshot = consumer.snapshot().unwrap().expect("frame");
        assert_eq!(snapshot.sequence, 1);
        assert_eq!(&snapshot.data[..], &frame[..]);
        assert_eq!((snapshot.width, snapshot.height), (8, 4));
    }

    #[test]
    fn slow_reader_sees_latest_frame_only() {
        let dir = TempDir::new().unwrap();
        let names = names(&dir);
        let producer =
            FrameBuffer::create(&names, &CameraConfig::new(4, 4), SystemTime::now()).unwrap();

        for seed in 1..=5 {
            producer.write(&pattern_frame(producer.frame_len(), seed), None).unwrap();
        }

        let snapshot = producer.snapshot().unwrap().unwrap();
        assert_eq!(snapshot.sequence, 5);
        assert_eq!(&snapshot.data[..], &pattern_frame(producer.frame_len(), 5)[..]);
    }

    #[test]
    fn wrong_length_is_rejected() {
        let dir = TempDir::new().unwrap();
        let producer =
            FrameBuffer::create(&names(&dir), &CameraConfig::new(4, 4), SystemTime::now()).unwrap();

        let error = producer.write(&[0u8; 10], None).unwrap_err();
        assert!(matches!(error, CameraError::FrameSize { expected: 48, actual: 10 }));
        assert_eq!(producer.sequence(), 0);
    }

    #[test]
    fn new_frame_wait_reports_each_outcome() {
        let dir = TempDir::new().unwrap();
        let names = names(&dir);
        let producer =
            FrameBuffer::create(&names, &CameraConfig::new(4, 4), SystemTime::now()).unwrap();
        let consumer = FrameBuffer::open(&names).unwrap();

        assert_eq!(
            consumer.wait_for_new_frame(0, Duration::from_millis(20), None),
            WaitResult::Timeout
        );

        producer.write(&pattern_frame(producer.frame_len(), 1), None).unwrap();
        assert_eq!(
            consumer.wait_for_new_frame(0, Duration::from_millis(20), None),
            WaitResult::Signaled
        );

        producer.deactivate();
        assert_eq!(consumer.wait_for_new_frame(1, Duration::ZERO, None), WaitResult::Closed);
        assert!(matches!(FrameBuffer::open(&names), Err(CameraError::NotFound { .. })));
    }

    #[test]
    fn producer_that_exited_reads_as_inactive() {
        let dir = TempDir::new().unwrap();
        let names = names(&dir);
        let producer =
            FrameBuffer::create(&names, &CameraConfig::new(4, 4), SystemTime::now()).unwrap();
        let consumer = FrameBuffer::open(&names).unwrap();
        producer.write(&pattern_frame(producer.frame_len(), 1), None).unwrap();

        producer.header().producer_pid.store(exited_pid(), Ordering::Relaxed);

        assert!(!consumer.is_active());
        assert_eq!(consumer.wait_for_new_frame(1, Duration::ZERO, None), WaitResult::Closed);
        assert!(matches!(FrameBuffer::open(&names), Err(CameraError::NotFound { .. })));
    }
}
