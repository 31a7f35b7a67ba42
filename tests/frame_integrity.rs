//! Frames arrive bit-exact and never torn under concurrent access

#![cfg(any(unix, windows))]

mod common;

use common::{frame_is_consistent, isolated_config, open_reader, pattern_frame};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use virtcam::{Camera, PixelFormat, WaitResult};

#[test]
fn frames_round_trip_bit_exact() {
    for format in [PixelFormat::Rgb24, PixelFormat::Argb32] {
        let (dir, config) = isolated_config("exact", 320, 240);
        let camera = Camera::create(config.with_format(format).with_framerate(0.0)).unwrap();
        let reader = open_reader(dir.path(), &camera);

        let frame = pattern_frame(camera.frame_len(), 0xDEAD_BEEF);
        assert_eq!(camera.send_frame(&frame).unwrap(), 1);

        let received = reader.read().unwrap().expect("frame");
        assert_eq!(received.sequence, 1);
        assert_eq!(received.format, format);
        assert_eq!((received.width, received.height), (320, 240));
        assert_eq!(received.stride(), 320 * format.bytes_per_pixel());
        assert_eq!(&received.data[..], &frame[..]);
    }
}

#[test]
fn readers_only_ever_see_the_latest_frame() {
    let (dir, config) = isolated_config("latest", 16, 16);
    let camera = Camera::create(config.with_framerate(0.0)).unwrap();
    let reader = open_reader(dir.path(), &camera);

    for seed in 1..=5 {
        camera.send_frame(&pattern_frame(camera.frame_len(), seed)).unwrap();
    }

    let frame = reader.read().unwrap().unwrap();
    assert_eq!(frame.sequence, 5);
    assert_eq!(&frame.data[..], &pattern_frame(camera.frame_len(), 5)[..]);
    assert_eq!(reader.wait_for_new_frame(5, Duration::from_millis(20)), WaitResult::Timeout);
    assert_eq!(reader.wait_for_new_frame(4, Duration::from_millis(20)), WaitResult::Signaled);
}

#[test]
fn concurrent_reads_never_observe_torn_frames() {
    let (dir, config) = isolated_config("stress", 256, 192);
    let camera = Camera::create(config.with_format(PixelFormat::Argb32).with_framerate(0.0)).unwrap();
    let reader = Arc::new(open_reader(dir.path(), &camera));
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let reader = Arc::clone(&reader);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut buffer = vec![0u8; reader.frame_len()];
                let mut last = 0u64;
                let mut reads = 0u32;
                while !done.load(Ordering::Acquire) {
                    if let Some(sequence) = reader.read_into(&mut buffer).unwrap() {
                        assert!(frame_is_consistent(&buffer), "torn frame at {sequence}");
                        let seed = u64::from_le_bytes(buffer[..8].try_into().unwrap());
                        assert_eq!(seed, sequence, "payload does not match its sequence");
                        assert!(sequence >= last, "sequence went backwards");
                        last = sequence;
                        reads += 1;
                    }
                }
                reads
            })
        })
        .collect();

    for seed in 1..=500u64 {
        let sequence = camera.send_frame(&pattern_frame(camera.frame_len(), seed)).unwrap();
        assert_eq!(sequence, seed);
    }
    done.store(true, Ordering::Release);

    let total: u32 = readers.into_iter().map(|r| r.join().unwrap()).sum();
    assert!(total > 0, "readers never saw a frame");
}

#[test]
fn wrong_sized_frames_are_rejected_without_publishing() {
    let (dir, config) = isolated_config("size", 32, 32);
    let camera = Camera::create(config.with_framerate(0.0)).unwrap();
    let reader = open_reader(dir.path(), &camera);

    let short = vec![0u8; camera.frame_len() - 1];
    let long = vec![0u8; camera.frame_len() + 1];
    assert!(camera.send_frame(&short).is_err());
    assert!(camera.send_frame(&long).is_err());
    assert!(camera.send_frame(&[]).is_err());

    assert_eq!(reader.sequence(), 0);
    assert!(reader.read().unwrap().is_none());
}
