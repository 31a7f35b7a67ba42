//! Named shared memory and the system-wide session claim
//!
//! Two OS resources back every camera session:
//!
//! - a **segment**: fixed-size shared memory holding the frame buffer header and
//!   payload, found by consumers through the session name
//! - a **claim**: an exclusivity primitive owned by the producer process. The
//!   kernel releases it when the process exits, cleanly or not, which is what
//!   makes the single-producer rule crash-safe.
//!
//! | | segment | claim |
//! |---|---|---|
//! | unix | `<dir>/<name>.frame`, mapped with `memmap2` | `flock` on `<dir>/<name>.lock` |
//! | windows | page-file mapping `Local\<name>.frame.<generation>` | named mutex `Local\<name>.lock` |
//!
//! The unix lock file is never unlinked: removing it would let two producers lock
//! two different inodes under the same path.
//!
//! Windows keeps a mapping alive while any process still has it open, so each
//! producer creates a fresh, generation-named segment and publishes the
//! generation in the fixed-size `Local\<name>.index` mapping.
//!
//! Both sides record process ids in the shared header; [`process_alive`] lets the
//! survivors notice when a peer died without cleaning up.

use std::path::PathBuf;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use unix::{InstanceClaim, SharedSegment, process_alive};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use self::windows::{InstanceClaim, SharedSegment, process_alive};

#[cfg(not(any(unix, windows)))]
mod unsupported;
#[cfg(not(any(unix, windows)))]
pub(crate) use unsupported::{InstanceClaim, SharedSegment, process_alive};

/// Resolved OS names for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SessionNames {
    pub name: String,
    /// Directory holding the unix segment and lock files
    pub dir: PathBuf,
}

impl SessionNames {
    pub fn new(name: &str, runtime_dir: Option<PathBuf>) -> Self {
        Self { name: name.to_string(), dir: runtime_dir.unwrap_or_else(default_runtime_dir) }
    }

    #[cfg_attr(windows, allow(dead_code))]
    pub fn segment_path(&self) -> PathBuf {
        self.dir.join(format!("{}.frame", self.name))
    }

    #[cfg_attr(windows, allow(dead_code))]
    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(format!("{}.lock", self.name))
    }

    #[cfg_attr(not(windows), allow(dead_code))]
    pub fn segment_object(&self, generation: u64) -> String {
        format!("Local\\{}.frame.{generation:016x}", self.name)
    }

    #[cfg_attr(not(windows), allow(dead_code))]
    pub fn index_object(&self) -> String {
        format!("Local\\{}.index", self.name)
    }

    #[cfg_attr(not(windows), allow(dead_code))]
    pub fn claim_object(&self) -> String {
        format!("Local\\{}.lock", self.name)
    }
}

/// `/dev/shm` keeps segments in RAM where it exists, otherwise `/tmp`.
///
/// Never `$TMPDIR`: it is per user on some systems, and the session name must be
/// unique system-wide.
#[cfg(unix)]
pub(crate) fn default_runtime_dir() -> PathBuf {
    let shm = PathBuf::from("/dev/shm");
    if shm.is_dir() { shm } else { PathBuf::from("/tmp") }
}

/// Only the unix backend stores files; elsewhere the directory is unused.
#[cfg(not(unix))]
pub(crate) fn default_runtime_dir() -> PathBuf {
    std::env::temp_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_derive_from_session_name() {
        let names = SessionNames::new("studio", Some(PathBuf::from("/run/cams")));
        assert_eq!(names.segment_path(), PathBuf::from("/run/cams/studio.frame"));
        assert_eq!(names.lock_path(), PathBuf::from("/run/cams/studio.lock"));
        assert_eq!(names.segment_object(0x2a), "Local\\studio.frame.000000000000002a");
        assert_eq!(names.index_object(), "Local\\studio.index");
        assert_eq!(names.claim_object(), "Local\\studio.lock");
    }

    #[test]
    fn default_dir_exists() {
        assert!(default_runtime_dir().is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn default_dir_ignores_tmpdir() {
        let dir = default_runtime_dir();
        assert!(dir == PathBuf::from("/dev/shm") || dir == PathBuf::from("/tmp"), "{dir:?}");
    }

    #[cfg(any(unix, windows))]
    #[test]
    fn liveness_of_current_and_exited_processes() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(crate::test_utils::exited_pid()));
    }
}
