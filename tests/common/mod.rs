//! Helpers shared by the integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;
use virtcam::{Camera, CameraConfig, CameraReader};

#[path = "../../src/test_utils.rs"]
mod test_utils;

pub use test_utils::{exited_pid, frame_is_consistent, pattern_frame};

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// Session name unique across tests and concurrently running test binaries.
pub fn session_name(prefix: &str) -> String {
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{count}", std::process::id())
}

/// An isolated runtime directory plus a config that points into it.
pub fn isolated_config(prefix: &str, width: u32, height: u32) -> (TempDir, CameraConfig) {
    let dir = TempDir::new().expect("temp dir");
    let config = CameraConfig::new(width, height)
        .with_name(session_name(prefix))
        .with_runtime_dir(dir.path());
    (dir, config)
}

pub fn open_reader(dir: &Path, camera: &Camera) -> CameraReader {
    CameraReader::open_in(camera.name(), Some(dir.to_path_buf())).expect("reader")
}
