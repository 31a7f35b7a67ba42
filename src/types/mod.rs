//! Core value types shared by producer and consumer.
//!
//! - [`PixelFormat`] describes the two supported raw layouts
//! - [`Frame`] is a consumer-side snapshot of the latest complete frame
//! - [`WaitResult`] reports how a bounded wait ended

mod frame;
mod pixel_format;

pub use frame::Frame;
pub use pixel_format::PixelFormat;

/// Result of waiting for something to happen in the shared buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The awaited condition was observed
    Signaled,
    /// The timeout elapsed first
    Timeout,
    /// The producer went away or the wait was cancelled
    Closed,
}
