//! Async delivery of frames to consumer pipelines
//!
//! [`FramePump`] spawns a tokio task that owns a [`CameraReader`], stays attached
//! to the camera while it runs, and publishes each new frame on a watch channel.
//! Watch semantics match the buffer itself: subscribers always see the latest
//! frame and never a backlog.

use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{CameraReader, Frame};

const MAX_ERRORS: u32 = 10;

/// Result of spawning a pump
pub struct PumpChannels {
    /// Latest frame; `None` before the first frame and after the pump stops
    pub frames: watch::Receiver<Option<Arc<Frame>>>,
    /// Cancellation token for graceful shutdown
    pub cancel: CancellationToken,
}

impl PumpChannels {
    /// Frames as a stream.
    ///
    /// Leading `None` values (no frame yet) are skipped; the stream ends at the
    /// first `None` after frames started, which marks the pump stopping.
    pub fn stream(&self) -> impl Stream<Item = Arc<Frame>> + 'static {
        WatchStream::new(self.frames.clone())
            .skip_while(|opt| {
                let is_none = opt.is_none();
                async move { is_none }
            })
            .take_while(|opt| {
                let is_some = opt.is_some();
                async move { is_some }
            })
            .filter_map(|opt| async move { opt })
    }

    /// Latest published frame, if any.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.frames.borrow().clone()
    }
}

impl Drop for PumpChannels {
    fn drop(&mut self) {
        debug!("Dropping pump channels");
        self.cancel.cancel();
    }
}

/// Spawns and manages frame pump tasks
pub struct FramePump;

impl FramePump {
    /// Spawn a pump polling `reader` every `poll_interval`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(reader: CameraReader, poll_interval: Duration) -> PumpChannels {
        let (frame_tx, frame_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let cancel_task = cancel.clone();

        tokio::spawn(async move {
            Self::pump_task(reader, frame_tx, cancel_task, poll_interval).await;
        });

        PumpChannels { frames: frame_rx, cancel }
    }

    async fn pump_task(
        reader: CameraReader,
        frame_tx: watch::Sender<Option<Arc<Frame>>>,
        cancel: CancellationToken,
        poll_interval: Duration,
    ) {
        info!(name = reader.name(), "Frame pump started");
        let attachment = reader.attach();
        let mut last_sequence = 0u64;
        let mut frame_count = 0u64;
        let mut error_count = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Frame pump cancelled");
                    break;
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }

            if reader.sequence() <= last_sequence {
                if !reader.is_producer_active() {
                    info!("Producer went away, stopping frame pump");
                    break;
                }
                continue;
            }

            match reader.read() {
                Ok(Some(frame)) => {
                    error_count = 0;
                    frame_count += 1;
                    last_sequence = frame.sequence;
                    trace!(sequence = frame.sequence, "Publishing frame");

                    if frame_tx.send(Some(Arc::new(frame))).is_err() {
                        debug!("Frame receivers dropped, shutting down");
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error_count += 1;
                    warn!("Frame read failed ({}/{}): {}", error_count, MAX_ERRORS, e);
                    if error_count >= MAX_ERRORS {
                        warn!("Too many read errors, stopping frame pump");
                        break;
                    }
                }
            }
        }

        drop(attachment);
        let _ = frame_tx.send(None);
        info!("Frame pump ended (published {} frames)", frame_count);
    }
}
