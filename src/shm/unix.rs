//! File-backed shared memory and `flock` claims for unix

use memmap2::MmapMut;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::ptr::NonNull;
use tracing::{debug, trace, warn};

use super::SessionNames;
use crate::{CameraError, Result};

/// Producer and consumer processes may run as different users in one group.
const SEGMENT_MODE: u32 = 0o660;

/// A mapped shared memory segment
pub(crate) struct SharedSegment {
    // Kept alive for the lifetime of `base`
    _map: MmapMut,
    base: NonNull<u8>,
    len: usize,
    path: PathBuf,
    /// The creator unlinks the file when dropped
    owner: bool,
}

impl SharedSegment {
    /// Create a zero-filled segment of `len` bytes, replacing any stale file.
    ///
    /// A leftover file from a crashed producer is unlinked rather than truncated:
    /// consumers that still map it keep a valid (if dead) view instead of faulting.
    pub fn create(names: &SessionNames, len: usize) -> Result<Self> {
        let path = names.segment_path();
        trace!(path = %path.display(), len, "Creating shared segment");

        match std::fs::remove_file(&path) {
            Ok(()) => warn!(path = %path.display(), "Removed stale segment from a previous producer"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CameraError::allocation_failed_with_source("frame segment", Box::new(e)));
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(SEGMENT_MODE)
            .open(&path)
            .map_err(|e| CameraError::allocation_failed_with_source("frame segment", Box::new(e)))?;

        let segment = file
            .set_len(len as u64)
            .and_then(|()| Self::map(&file))
            .map_err(|e| CameraError::allocation_failed_with_source("frame segment", Box::new(e)));

        match segment {
            Ok(mut map) => {
                let base = NonNull::new(map.as_mut_ptr())
                    .ok_or_else(|| CameraError::allocation_failed("frame segment mapping"))?;
                debug!(path = %path.display(), len, "Shared segment mapped");
                Ok(Self { _map: map, base, len, path, owner: true })
            }
            Err(e) => {
                // Nothing else refers to the half-made file yet
                let _ = std::fs::remove_file(&path);
                Err(e)
            }
        }
    }

    /// Map an existing segment created by a producer.
    pub fn open(names: &SessionNames) -> Result<Self> {
        let path = names.segment_path();
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CameraError::NotFound { name: names.name.clone() });
            }
            Err(e) => return Err(CameraError::io(format!("opening {}", path.display()), e)),
        };

        let len = file
            .metadata()
            .map_err(|e| CameraError::io(format!("reading size of {}", path.display()), e))?
            .len() as usize;
        if len == 0 {
            // Producer created the file but has not sized it yet
            return Err(CameraError::NotFound { name: names.name.clone() });
        }

        let mut map =
            Self::map(&file).map_err(|e| CameraError::io(format!("mapping {}", path.display()), e))?;
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| CameraError::memory("segment mapped at null"))?;

        debug!(path = %path.display(), len, "Opened shared segment");
        Ok(Self { _map: map, base, len, path, owner: false })
    }

    fn map(file: &File) -> std::io::Result<MmapMut> {
        // SAFETY: the segment is only ever accessed through raw pointers and atomics
        // in the header, never through references that assume exclusive access.
        unsafe { MmapMut::map_mut(file) }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if self.owner {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!(path = %self.path.display(), "Unlinked shared segment"),
                Err(e) => warn!(path = %self.path.display(), "Failed to unlink shared segment: {}", e),
            }
        }
    }
}

// SAFETY: the mapping is process-wide memory; all concurrent access goes through
// the frame buffer lock word and header atomics.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

/// Whether process `pid` still exists.
///
/// `EPERM` means the process exists but belongs to another user.
pub(crate) fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

/// Exclusive, process-lifetime claim on a session name
pub(crate) struct InstanceClaim {
    _lock: Flock<File>,
    path: PathBuf,
}

impl InstanceClaim {
    /// Claim the session name, failing with `AlreadyExists` if any open file
    /// description (in this or another process) holds it.
    pub fn acquire(names: &SessionNames) -> Result<Self> {
        std::fs::create_dir_all(&names.dir).map_err(|e| {
            CameraError::allocation_failed_with_source("runtime directory", Box::new(e))
        })?;

        let path = names.lock_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(SEGMENT_MODE)
            .open(&path)
            .map_err(|e| CameraError::allocation_failed_with_source("session claim", Box::new(e)))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                debug!(path = %path.display(), "Session claim acquired");
                Ok(Self { _lock: lock, path })
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                debug!(path = %path.display(), "Session claim held elsewhere");
                Err(CameraError::already_exists(names.name.clone()))
            }
            Err((_, errno)) => {
                Err(CameraError::allocation_failed_with_source("session claim", Box::new(errno)))
            }
        }
    }
}

impl Drop for InstanceClaim {
    fn drop(&mut self) {
        trace!(path = %self.path.display(), "Session claim released");
    }
}
