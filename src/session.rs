//! Producer-side camera sessions
//!
//! A [`Camera`] is the single live producer for a session name. It owns the shared
//! frame buffer, the pacing state and the system-wide claim on the name, and
//! releases all of them together on [`Camera::delete`], on drop of the last handle,
//! or, through the OS, when the process dies.
//!
//! Handles are cheap clones of one shared session, so one thread can block in
//! [`Camera::wait_for_connection`] or [`Camera::send_frame`] while another deletes
//! the session; the blocked call returns promptly with a failure result.

use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, trace, warn};

use crate::buffer::FrameBuffer;
use crate::pacing::RateLimiter;
use crate::shm::{InstanceClaim, SessionNames};
use crate::sync::CancelSignal;
use crate::{CameraConfig, CameraError, PixelFormat, Result};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    /// Terminal; every operation on the handle now fails
    Deleted,
}

/// OS resources of a live session.
///
/// Field order matters: the buffer (and on unix its segment file) goes away while
/// the claim is still held, so a successor cannot have its fresh segment unlinked.
struct Resources {
    buffer: FrameBuffer,
    _claim: InstanceClaim,
}

struct CameraInner {
    config: CameraConfig,
    created_at: SystemTime,
    resources: RwLock<Option<Resources>>,
    pacer: Mutex<RateLimiter>,
    cancel: CancelSignal,
}

impl CameraInner {
    fn resources(&self) -> RwLockReadGuard<'_, Option<Resources>> {
        self.resources.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn shutdown(&self) {
        // Wake blocked callers first so they drop their read guards
        self.cancel.cancel();

        let taken = self.resources.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(resources) = taken {
            resources.buffer.deactivate();
            let frames = resources.buffer.sequence();
            drop(resources);
            info!(name = %self.config.name, frames, "Camera deleted");
        } else {
            debug!(name = %self.config.name, "Camera already deleted");
        }
    }
}

impl Drop for CameraInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to a live virtual camera session.
#[derive(Clone)]
pub struct Camera {
    inner: Arc<CameraInner>,
}

impl Camera {
    /// Create a camera session.
    ///
    /// Fails with `InvalidArgument` for bad parameters, `AlreadyExists` if another
    /// session holds the name, and `ResourceAllocation` if the OS refuses the
    /// shared resources. Creation is all-or-nothing.
    ///
    /// ```rust,no_run
    /// use virtcam::{Camera, CameraConfig, PixelFormat};
    ///
    /// # fn main() -> virtcam::Result<()> {
    /// let camera = Camera::create(CameraConfig::new(640, 480).with_format(PixelFormat::Argb32))?;
    /// let frame = vec![0u8; camera.frame_len()];
    /// camera.send_frame(&frame)?;
    /// camera.delete();
    /// # Ok(())
    /// # }
    /// ```
    pub fn create(config: CameraConfig) -> Result<Self> {
        config.validate()?;

        let names = SessionNames::new(&config.name, config.runtime_dir.clone());
        let claim = InstanceClaim::acquire(&names)?;

        let created_at = SystemTime::now();
        // On error the claim is released when it goes out of scope
        let buffer = FrameBuffer::create(&names, &config, created_at)?;

        info!(
            name = %config.name,
            width = config.width,
            height = config.height,
            format = %config.format,
            framerate = config.framerate,
            "Camera created"
        );

        let pacer = RateLimiter::new(config.framerate);
        Ok(Self {
            inner: Arc::new(CameraInner {
                config,
                created_at,
                resources: RwLock::new(Some(Resources { buffer, _claim: claim })),
                pacer: Mutex::new(pacer),
                cancel: CancelSignal::new(),
            }),
        })
    }

    /// RGB24 camera at the default 60 fps.
    pub fn new(width: u32, height: u32) -> Result<Self> {
        Self::create(CameraConfig::new(width, height))
    }

    /// Camera with an explicit framerate and pixel format.
    pub fn with_format(width: u32, height: u32, framerate: f32, format: PixelFormat) -> Result<Self> {
        Self::create(CameraConfig::new(width, height).with_framerate(framerate).with_format(format))
    }

    /// Create a camera, collapsing every failure into `None`.
    pub fn try_create(config: CameraConfig) -> Option<Self> {
        Self::create(config)
            .map_err(|e| warn!(kind = ?e.kind(), "Camera creation failed: {}", e))
            .ok()
    }

    /// End the session and release every resource. Idempotent.
    ///
    /// Threads blocked in `wait_for_connection` return `false`; threads blocked
    /// in the pacing wait of `send_frame` return `SessionDeleted`.
    pub fn delete(&self) {
        self.inner.shutdown();
    }

    pub fn state(&self) -> SessionState {
        if self.inner.resources().is_some() { SessionState::Active } else { SessionState::Deleted }
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Publish one frame.
    ///
    /// `image` must be exactly [`frame_len`](Self::frame_len) bytes of tightly packed
    /// pixels. With a non-zero framerate the call first sleeps until the frame's
    /// slot. Returns the frame's sequence number.
    pub fn send_frame(&self, image: &[u8]) -> Result<u64> {
        let expected = self.frame_len();
        if image.len() != expected {
            return Err(CameraError::FrameSize { expected, actual: image.len() });
        }
        if self.inner.cancel.is_cancelled() {
            return Err(CameraError::SessionDeleted);
        }

        self.inner.pacer.lock().unwrap_or_else(PoisonError::into_inner).gate(&self.inner.cancel)?;

        let resources = self.inner.resources();
        let resources = resources.as_ref().ok_or(CameraError::SessionDeleted)?;
        let sequence = resources.buffer.write(image, Some(&self.inner.cancel))?;
        trace!(sequence, "Frame sent");
        Ok(sequence)
    }

    /// Block until a consumer attaches.
    ///
    /// `Duration::ZERO` waits with no time bound. Returns `false` on timeout, or
    /// when the session is (or gets) deleted.
    pub fn wait_for_connection(&self, timeout: Duration) -> bool {
        let resources = self.inner.resources();
        match resources.as_ref() {
            Some(resources) => {
                resources.buffer.sync(Some(&self.inner.cancel)).wait_for_connection(timeout)
            }
            None => false,
        }
    }

    /// Async form of [`wait_for_connection`](Self::wait_for_connection).
    ///
    /// The wait runs on tokio's blocking pool so async workers are not held up.
    pub async fn wait_for_connection_async(&self, timeout: Duration) -> bool {
        let camera = self.clone();
        tokio::task::spawn_blocking(move || camera.wait_for_connection(timeout))
            .await
            .unwrap_or_else(|e| {
                warn!("Connection wait task failed: {}", e);
                false
            })
    }

    /// Whether at least one consumer is attached right now.
    pub fn is_connected(&self) -> bool {
        self.inner
            .resources()
            .as_ref()
            .is_some_and(|resources| resources.buffer.sync(None).is_connected())
    }

    /// Number of attached consumers; 0 once deleted.
    pub fn consumers(&self) -> u32 {
        self.inner.resources().as_ref().map_or(0, |r| r.buffer.sync(None).consumers())
    }

    /// When a consumer last attached, detached or read a frame.
    pub fn last_consumer_activity(&self) -> Option<SystemTime> {
        self.inner.resources().as_ref().and_then(|r| r.buffer.sync(None).last_activity())
    }

    /// Sequence number of the last frame sent; 0 before the first.
    pub fn frames_sent(&self) -> u64 {
        self.inner.resources().as_ref().map_or(0, |r| r.buffer.sequence())
    }

    pub fn config(&self) -> &CameraConfig {
        &self.inner.config
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn width(&self) -> u32 {
        self.inner.config.width
    }

    pub fn height(&self) -> u32 {
        self.inner.config.height
    }

    pub fn format(&self) -> PixelFormat {
        self.inner.config.format
    }

    pub fn framerate(&self) -> f32 {
        self.inner.config.framerate
    }

    /// Bytes expected by [`send_frame`](Self::send_frame).
    pub fn frame_len(&self) -> usize {
        self.inner.config.frame_len()
    }

    pub fn created_at(&self) -> SystemTime {
        self.inner.created_at
    }

    /// Whether two handles refer to the same session.
    pub fn same_session(&self, other: &Camera) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Camera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Camera")
            .field("name", &self.inner.config.name)
            .field("width", &self.inner.config.width)
            .field("height", &self.inner.config.height)
            .field("format", &self.inner.config.format)
            .field("framerate", &self.inner.config.framerate)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::test_utils::{pattern_frame, unique_session_name};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> CameraConfig {
        CameraConfig::new(16, 8).with_name(unique_session_name("session")).with_runtime_dir(dir.path())
    }

    #[test]
    fn second_create_fails_until_delete() {
        let _ = tracing_subscriber::fmt::try_init();
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        let first = Camera::create(config.clone()).expect("first camera");
        let second = Camera::create(config.clone()).unwrap_err();
        assert_eq!(second.kind(), ErrorKind::AlreadyExists);
        assert!(Camera::try_create(config.clone()).is_none());

        first.delete();
        let third = Camera::create(config).expect("camera after delete");
        assert!(third.is_active());
    }

    #[test]
    fn dropping_the_last_handle_releases_the_name() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        let camera = Camera::create(config.clone()).unwrap();
        let clone = camera.clone();
        drop(camera);
        assert!(Camera::create(config.clone()).is_err(), "clone keeps the session alive");

        drop(clone);
        Camera::create(config).expect("name released");
    }

    #[test]
    fn delete_is_idempotent_and_invalidates_every_handle() {
        let dir = TempDir::new().unwrap();
        let camera = Camera::create(config(&dir)).unwrap();
        let other = camera.clone();
        assert!(camera.same_session(&other));

        camera.delete();
        camera.delete();
        other.delete();

        assert_eq!(other.state(), SessionState::Deleted);
        let frame = pattern_frame(other.frame_len(), 1);
        assert!(matches!(other.send_frame(&frame), Err(CameraError::SessionDeleted)));
        assert!(!other.is_connected());
        assert!(!other.wait_for_connection(Duration::from_millis(10)));
        assert_eq!(other.frames_sent(), 0);
    }

    #[test]
    fn wrong_frame_length_is_a_precondition_violation() {
        let dir = TempDir::new().unwrap();
        let camera = Camera::create(config(&dir).with_framerate(0.0)).unwrap();

        let error = camera.send_frame(&[0u8; 7]).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::PreconditionViolation);
        assert_eq!(camera.frames_sent(), 0);
    }

    #[test]
    fn unpaced_sends_are_numbered() {
        let dir = TempDir::new().unwrap();
        let camera = Camera::create(config(&dir).with_framerate(0.0)).unwrap();

        for expected in 1..=3 {
            let frame = pattern_frame(camera.frame_len(), expected);
            assert_eq!(camera.send_frame(&frame).unwrap(), expected);
        }
        assert_eq!(camera.frames_sent(), 3);
    }

    #[test]
    fn invalid_configs_leave_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        let error = Camera::create(config.clone().with_framerate(-5.0)).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidArgument);
        Camera::create(config).expect("name was never claimed");
    }
}
