//! Test utilities shared by unit tests and benchmarks
//!
//! Session names are system-wide, so every test gets its own; frames carry a
//! self-describing pattern so torn copies can be detected.

#![cfg(any(test, feature = "benchmark"))]

use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// A session name no other test (or concurrent test process) is using.
pub fn unique_session_name(prefix: &str) -> String {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.subsec_nanos()).unwrap_or(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    let prefix: String = prefix.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '-').take(24).collect();
    format!("{prefix}-{}-{count}-{nanos:x}", std::process::id())
}

/// A frame of `len` bytes whose content is fully determined by `seed`.
///
/// The first eight bytes hold the seed, the rest a pattern derived from it.
pub fn pattern_frame(len: usize, seed: u64) -> Vec<u8> {
    let mut frame = vec![0u8; len];
    let header = seed.to_le_bytes();
    let split = len.min(header.len());
    frame[..split].copy_from_slice(&header[..split]);
    for (i, byte) in frame.iter_mut().enumerate().skip(header.len()) {
        *byte = pattern_byte(seed, i);
    }
    frame
}

/// Whether `frame` is exactly one [`pattern_frame`], not a mix of two.
pub fn frame_is_consistent(frame: &[u8]) -> bool {
    let Some(header) = frame.get(..8) else {
        return false;
    };
    let mut seed_bytes = [0u8; 8];
    seed_bytes.copy_from_slice(header);
    let seed = u64::from_le_bytes(seed_bytes);
    frame.iter().enumerate().skip(8).all(|(i, &byte)| byte == pattern_byte(seed, i))
}

/// Pid of a child process that has already exited and been reaped.
///
/// Runs the current test binary with `--list`, which prints and exits at once.
pub fn exited_pid() -> u32 {
    let mut child = Command::new(std::env::current_exe().expect("current exe"))
        .arg("--list")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn child");
    let pid = child.id();
    child.wait().expect("child exit");
    pid
}

fn pattern_byte(seed: u64, index: usize) -> u8 {
    (seed.wrapping_mul(31).wrapping_add(index as u64 * 7) >> 1) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_names_are_unique_and_valid() {
        let first = unique_session_name("test/with spaces");
        let second = unique_session_name("test/with spaces");
        assert_ne!(first, second);
        assert!(first.len() <= 64, "{first}");
        assert!(first.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'), "{first}");
    }

    #[test]
    fn patterns_detect_mixed_frames() {
        let a = pattern_frame(96, 1);
        let b = pattern_frame(96, 2);
        assert!(frame_is_consistent(&a));
        assert!(frame_is_consistent(&b));

        let mut torn = a.clone();
        torn[48..].copy_from_slice(&b[48..]);
        assert!(!frame_is_consistent(&torn));
    }
}
