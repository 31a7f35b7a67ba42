//! Cross-process frame hand-off for virtual cameras.
//!
//! virtcam is the core of a virtual webcam: an application produces raw RGB24 or
//! ARGB32 frames, and a capture pipeline in another process consumes them as if
//! they came from a camera device. The two sides share a single-slot buffer in
//! named shared memory, so consumers always see the latest frame and never a
//! queue.
//!
//! # Features
//!
//! - **Single producer per name**: a system-wide claim rejects a second live session
//! - **Presence**: the producer can block until an application opens the camera
//! - **Pacing**: frames are released on an absolute-deadline schedule without drift
//! - **Prompt teardown**: deleting a session wakes every blocked call
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use virtcam::{Camera, CameraConfig};
//!
//! fn main() -> virtcam::Result<()> {
//!     let camera = Camera::create(CameraConfig::new(320, 240).with_framerate(30.0))?;
//!
//!     // Wait up to five seconds for an application to open the camera
//!     if camera.wait_for_connection(Duration::from_secs(5)) {
//!         let mut image = vec![0u8; camera.frame_len()];
//!         for shade in 0..=255u8 {
//!             image.fill(shade);
//!             camera.send_frame(&image)?;
//!         }
//!     }
//!     camera.delete();
//!     Ok(())
//! }
//! ```
//!
//! ## Example (consumer side)
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use futures::StreamExt;
//! use virtcam::{CameraReader, FramePump};
//!
//! #[tokio::main]
//! async fn main() -> virtcam::Result<()> {
//!     let reader = CameraReader::open("virtcam")?;
//!     let pump = FramePump::spawn(reader, Duration::from_millis(5));
//!     let mut frames = Box::pin(pump.stream());
//!
//!     while let Some(frame) = frames.next().await {
//!         println!("frame {} ({}x{})", frame.sequence, frame.width, frame.height);
//!     }
//!     Ok(())
//! }
//! ```

// Core types and error handling
pub mod config;
mod error;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Shared memory plumbing
mod buffer;
mod shm;
mod sync;

// Producer and consumer APIs
pub mod pacing;
pub mod pump;
pub mod reader;
pub mod session;

pub use config::{CameraConfig, DEFAULT_FRAMERATE, DEFAULT_SESSION_NAME, MIN_FRAMERATE};
pub use error::*;
pub use types::*;

pub use pacing::{RateLimiter, advance_deadline};
pub use pump::{FramePump, PumpChannels};
pub use reader::{Attachment, CameraReader};
pub use session::{Camera, SessionState};
pub use sync::{CancelSignal, LOCK_TIMEOUT, POLL_INTERVAL};
