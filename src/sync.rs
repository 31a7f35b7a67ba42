//! Cross-process synchronization between producer and consumers
//!
//! Three mechanisms meet here:
//!
//! - the **lock word** in the shared header, an exclusive spin lock that serializes
//!   every frame copy in either direction
//! - the **presence slots**, one per consumer process, counting how many times that
//!   process has the capture path open
//! - the [`CancelSignal`], an in-process signal fired when a session is deleted so
//!   that every blocked caller returns promptly
//!
//! Consumers live in other processes and cannot wake the producer directly, so
//! waits are sliced into [`POLL_INTERVAL`] steps. Every step is itself a
//! cancellable wait, which keeps deletion latency at zero rather than one slice.
//!
//! Peers can die without cleaning up. A lock held by an exited process is taken
//! over, and presence slots of exited consumers are dropped when counted.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, trace, warn};

use crate::buffer::{MAX_CONSUMERS, SharedHeader};
use crate::shm::process_alive;
use crate::{CameraError, Result};

/// Granularity at which cross-process state changes are observed.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Longest a frame copy may wait for the lock before giving up.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(1);

const SPIN_LIMIT: u32 = 64;

/// How often a contended lock checks whether its holder still exists.
const HOLDER_CHECK_INTERVAL: Duration = Duration::from_millis(10);

fn current_pid() -> u32 {
    std::process::id().max(1)
}

fn pack_slot(pid: u32, attachments: u32) -> u64 {
    (u64::from(pid) << 32) | u64::from(attachments)
}

fn slot_pid(slot: u64) -> u32 {
    (slot >> 32) as u32
}

fn slot_attachments(slot: u64) -> u32 {
    slot as u32
}

/// Convert a timeout where zero means "no bound" into an absolute deadline.
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    if timeout.is_zero() { None } else { Instant::now().checked_add(timeout) }
}

/// One-shot, broadcast cancellation for blocking waits.
///
/// The signal owns the only `Sender` of a rendezvous channel. Nothing is ever sent;
/// cancelling drops the sender, which disconnects the channel and wakes every thread
/// parked in [`wait_until`](Self::wait_until) at once.
pub struct CancelSignal {
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
    cancelled: AtomicBool,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(0);
        Self { sender: Mutex::new(Some(sender)), receiver, cancelled: AtomicBool::new(false) }
    }

    /// Fire the signal. Later calls do nothing.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        if sender.is_some() {
            trace!("Cancel signal fired");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Block until `deadline` or cancellation, whichever comes first.
    ///
    /// Returns `true` if the wait ended because of cancellation.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        if self.is_cancelled() {
            return true;
        }
        match self.receiver.recv_deadline(deadline) {
            Err(RecvTimeoutError::Timeout) => self.is_cancelled(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal").field("cancelled", &self.is_cancelled()).finish()
    }
}

/// Exclusive access to the frame payload; released on drop.
pub(crate) struct BufferGuard<'a> {
    header: &'a SharedHeader,
}

impl Drop for BufferGuard<'_> {
    fn drop(&mut self) {
        self.header.lock.store(0, Ordering::Release);
    }
}

/// Synchronization view over one shared header.
pub(crate) struct Synchronizer<'a> {
    header: &'a SharedHeader,
    cancel: Option<&'a CancelSignal>,
}

impl<'a> Synchronizer<'a> {
    pub fn new(header: &'a SharedHeader, cancel: Option<&'a CancelSignal>) -> Self {
        Self { header, cancel }
    }

    /// Take the frame lock.
    ///
    /// Spins briefly, then yields. Gives up with `LockTimeout` after [`LOCK_TIMEOUT`]
    /// so a consumer that died inside its copy cannot wedge the producer, and with
    /// `SessionDeleted` if the session is cancelled meanwhile.
    pub fn lock(&self) -> Result<BufferGuard<'a>> {
        let pid = current_pid();
        let mut spins = 0u32;
        let mut deadline = None;
        let mut next_holder_check = None;

        loop {
            if self
                .header
                .lock
                .compare_exchange_weak(0, pid, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(BufferGuard { header: self.header });
            }

            if spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
                continue;
            }

            let now = Instant::now();
            if now >= *next_holder_check.get_or_insert(now) {
                next_holder_check = Some(now + HOLDER_CHECK_INTERVAL);
                if self.reclaim_from_exited_holder(pid) {
                    return Ok(BufferGuard { header: self.header });
                }
            }

            let deadline = *deadline.get_or_insert(now + LOCK_TIMEOUT);
            if now >= deadline {
                warn!(
                    holder = self.header.lock.load(Ordering::Relaxed),
                    "Frame buffer lock timed out"
                );
                return Err(CameraError::LockTimeout { duration: LOCK_TIMEOUT });
            }
            if self.cancel.is_some_and(CancelSignal::is_cancelled) {
                return Err(CameraError::SessionDeleted);
            }
            std::thread::yield_now();
        }
    }

    /// Take over the lock if its holder process no longer exists.
    ///
    /// Only the payload can be stale afterwards; `sequence` and `ready` are
    /// published after a copy completes.
    fn reclaim_from_exited_holder(&self, pid: u32) -> bool {
        let holder = self.header.lock.load(Ordering::Relaxed);
        if holder == 0 || holder == pid || process_alive(holder) {
            return false;
        }
        let reclaimed = self
            .header
            .lock
            .compare_exchange(holder, pid, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        if reclaimed {
            warn!(holder, "Reclaimed frame buffer lock from an exited process");
        }
        reclaimed
    }

    /// Record that a consumer in this process opened the capture path.
    /// Returns the new number of live attachments.
    ///
    /// At most [`MAX_CONSUMERS`] processes are tracked; attachments from further
    /// processes are logged and ignored.
    pub fn notify_attach(&self) -> u32 {
        let pid = current_pid();
        let mut tracked = self.add_to_own_slot(pid) || self.claim_free_slot(pid);
        if !tracked {
            // Counting frees the slots of exited consumers
            self.consumers();
            tracked = self.claim_free_slot(pid);
        }
        if !tracked {
            warn!(max = MAX_CONSUMERS, "No free consumer slot, attachment not tracked");
        }
        self.header.touch();

        let count = self.consumers();
        debug!(consumers = count, "Consumer attached");
        count
    }

    /// Record that a consumer in this process closed the capture path.
    /// Returns the new number of live attachments.
    pub fn notify_detach(&self) -> u32 {
        let pid = current_pid();
        let released = self.header.consumer_slots.iter().any(|slot| {
            slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
                let attachments = slot_attachments(value);
                (value != 0 && slot_pid(value) == pid && attachments > 0)
                    .then(|| if attachments == 1 { 0 } else { value - 1 })
            })
            .is_ok()
        });
        self.header.touch();

        if !released {
            warn!("Detach without a matching attach");
        }
        let count = self.consumers();
        debug!(consumers = count, "Consumer detached");
        count
    }

    fn add_to_own_slot(&self, pid: u32) -> bool {
        self.header.consumer_slots.iter().any(|slot| {
            slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
                (value != 0 && slot_pid(value) == pid && slot_attachments(value) < u32::MAX)
                    .then(|| value + 1)
            })
            .is_ok()
        })
    }

    fn claim_free_slot(&self, pid: u32) -> bool {
        self.header.consumer_slots.iter().any(|slot| {
            slot.compare_exchange(0, pack_slot(pid, 1), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        })
    }

    /// Live attachments across all consumer processes.
    ///
    /// Slots of processes that exited without detaching are freed on the way.
    pub fn consumers(&self) -> u32 {
        let own = current_pid();
        let mut total = 0u32;
        for slot in &self.header.consumer_slots {
            let value = slot.load(Ordering::Acquire);
            if value == 0 {
                continue;
            }
            let pid = slot_pid(value);
            if pid != own && !process_alive(pid) {
                if slot.compare_exchange(value, 0, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                    let attachments = slot_attachments(value);
                    warn!(pid, attachments, "Dropped presence of an exited consumer");
                }
                continue;
            }
            total = total.saturating_add(slot_attachments(value));
        }
        total
    }

    pub fn is_connected(&self) -> bool {
        self.consumers() > 0
    }

    pub fn last_activity(&self) -> Option<SystemTime> {
        self.header.last_activity()
    }

    /// Block until a consumer is attached.
    ///
    /// `Duration::ZERO` waits without a time bound. Returns `false` on timeout or
    /// when the session is cancelled.
    pub fn wait_for_connection(&self, timeout: Duration) -> bool {
        if self.is_connected() {
            return true;
        }

        let deadline = deadline_after(timeout);
        debug!(?timeout, "Waiting for a consumer to attach");

        loop {
            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                debug!("Wait for connection timed out");
                return self.is_connected();
            }

            let step = now + POLL_INTERVAL;
            let wake = deadline.map_or(step, |d| step.min(d));
            if self.pause_until(wake) {
                debug!("Wait for connection cancelled");
                return false;
            }

            if self.is_connected() {
                return true;
            }
        }
    }

    /// Sleep until `wake`. Returns `true` when cancelled.
    pub fn pause_until(&self, wake: Instant) -> bool {
        match self.cancel {
            Some(cancel) => cancel.wait_until(wake),
            None => {
                std::thread::sleep(wake.saturating_duration_since(Instant::now()));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CameraConfig;
    use crate::test_utils::exited_pid;
    use std::sync::Arc;

    fn header() -> Box<SharedHeader> {
        // SAFETY: every field is an atomic integer, for which all-zero is valid
        let header: Box<SharedHeader> = unsafe { Box::new(std::mem::zeroed()) };
        header.initialize(&CameraConfig::new(4, 4), SystemTime::now());
        header
    }

    #[test]
    fn cancel_wakes_a_parked_waiter() {
        let signal = Arc::new(CancelSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            std::thread::spawn(move || {
                let start = Instant::now();
                let cancelled = signal.wait_until(Instant::now() + Duration::from_secs(10));
                (cancelled, start.elapsed())
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        signal.cancel();
        let (cancelled, elapsed) = waiter.join().unwrap();

        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(2), "waiter took {elapsed:?}");
        assert!(signal.wait_until(Instant::now() + Duration::from_secs(10)));
    }

    #[test]
    fn uncancelled_wait_times_out() {
        let signal = CancelSignal::new();
        let start = Instant::now();
        assert!(!signal.wait_until(start + Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn lock_is_exclusive() {
        let header = header();
        let sync = Synchronizer::new(&header, None);

        let guard = sync.lock().expect("lock");
        assert_ne!(header.lock.load(Ordering::Relaxed), 0);
        drop(guard);
        assert_eq!(header.lock.load(Ordering::Relaxed), 0);
        sync.lock().expect("relock");
    }

    #[test]
    fn held_lock_aborts_on_cancel() {
        let header = header();
        header.lock.store(current_pid(), Ordering::Relaxed);

        let signal = CancelSignal::new();
        signal.cancel();
        let sync = Synchronizer::new(&header, Some(&signal));
        assert!(matches!(sync.lock(), Err(CameraError::SessionDeleted)));
    }

    #[cfg(any(unix, windows))]
    #[test]
    fn lock_of_an_exited_holder_is_reclaimed() {
        let header = header();
        header.lock.store(exited_pid(), Ordering::Relaxed);
        let sync = Synchronizer::new(&header, None);

        for _ in 0..3 {
            let start = Instant::now();
            let guard = sync.lock().expect("reclaimed lock");
            assert!(start.elapsed() < Duration::from_millis(500), "took {:?}", start.elapsed());
            assert_eq!(header.lock.load(Ordering::Relaxed), current_pid());
            drop(guard);
            header.lock.store(exited_pid(), Ordering::Relaxed);
        }
    }

    #[cfg(any(unix, windows))]
    #[test]
    fn exited_consumers_are_dropped_from_presence() {
        let header = header();
        header.consumer_slots[3].store(pack_slot(exited_pid(), 2), Ordering::Relaxed);
        let sync = Synchronizer::new(&header, None);

        assert!(!sync.is_connected());
        assert_eq!(header.consumer_slots[3].load(Ordering::Relaxed), 0, "slot freed");

        assert_eq!(sync.notify_attach(), 1);
        assert!(sync.is_connected());
    }

    #[test]
    fn attachments_share_one_slot_per_process() {
        let header = header();
        let sync = Synchronizer::new(&header, None);
        sync.notify_attach();
        sync.notify_attach();

        let used: Vec<u64> = header
            .consumer_slots
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .filter(|&value| value != 0)
            .collect();
        assert_eq!(used, vec![pack_slot(current_pid(), 2)]);
    }

    #[test]
    fn presence_counts_attaches() {
        let header = header();
        let sync = Synchronizer::new(&header, None);

        assert!(!sync.is_connected());
        assert_eq!(sync.notify_attach(), 1);
        assert_eq!(sync.notify_attach(), 2);
        assert!(sync.is_connected());
        assert_eq!(sync.notify_detach(), 1);
        assert_eq!(sync.notify_detach(), 0);
        assert!(!sync.is_connected());
        assert_eq!(sync.notify_detach(), 0, "detach saturates at zero");
        assert!(sync.last_activity().is_some());
    }

    #[test]
    fn zero_timeout_means_unbounded() {
        assert!(deadline_after(Duration::ZERO).is_none());
        assert!(deadline_after(Duration::from_millis(5)).is_some());
    }
}
