//! Page-file backed shared memory and named-mutex claims for Windows
//!
//! Both objects live in the `Local\` namespace and are reference counted by the
//! kernel: when the producer process dies its handles close and the claim is free
//! again, while consumers that still map the segment keep it alive. A successor
//! therefore never reuses a segment object. It creates a new generation and
//! publishes it in the index mapping, which is the only fixed-name segment.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, trace, warn};
use windows::Win32::Foundation::{
    CloseHandle, ERROR_ACCESS_DENIED, ERROR_ALREADY_EXISTS, GetLastError, HANDLE,
    INVALID_HANDLE_VALUE, STILL_ACTIVE,
};
use windows::Win32::System::Memory::{
    CreateFileMappingW, FILE_MAP_ALL_ACCESS, MEMORY_BASIC_INFORMATION,
    MEMORY_MAPPED_VIEW_ADDRESS, MapViewOfFile, OpenFileMappingW, PAGE_READWRITE,
    UnmapViewOfFile, VirtualQuery,
};
use windows::Win32::System::Threading::{
    CreateMutexW, GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
};
use windows::core::PCWSTR;

use super::SessionNames;
use crate::{CameraError, Result};

static GENERATION_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Process id in the high half keeps generations unique across producers.
fn next_generation() -> u64 {
    (u64::from(std::process::id()) << 32) | u64::from(GENERATION_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// The fixed-name mapping that holds the live segment generation; 0 when none.
struct SegmentIndex {
    mapping: HANDLE,
    view: NonNull<AtomicU64>,
}

impl SegmentIndex {
    fn create(names: &SessionNames) -> Result<Self> {
        let object = names.index_object();
        let mapping = unsafe {
            let wide_name = wide_string(&object);
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE,
                0,
                std::mem::size_of::<u64>() as u32,
                PCWSTR::from_raw(wide_name.as_ptr()),
            )
            .map_err(|e| CameraError::allocation_failed_with_source("segment index", Box::new(e)))?
        };
        Self::from_mapping(mapping)
    }

    fn open(names: &SessionNames) -> Result<Self> {
        let object = names.index_object();
        let mapping = unsafe {
            let wide_name = wide_string(&object);
            OpenFileMappingW(FILE_MAP_ALL_ACCESS.0, false, PCWSTR::from_raw(wide_name.as_ptr()))
                .map_err(|_| CameraError::NotFound { name: names.name.clone() })?
        };
        Self::from_mapping(mapping)
    }

    fn from_mapping(mapping: HANDLE) -> Result<Self> {
        match map_view(mapping, std::mem::size_of::<u64>()) {
            Ok(base) => Ok(Self { mapping, view: base.cast() }),
            Err(e) => {
                unsafe {
                    let _ = CloseHandle(mapping);
                }
                Err(e)
            }
        }
    }

    fn generation(&self) -> &AtomicU64 {
        // SAFETY: the view is page aligned and at least eight bytes long
        unsafe { self.view.as_ref() }
    }
}

impl Drop for SegmentIndex {
    fn drop(&mut self) {
        unsafe {
            let addr = MEMORY_MAPPED_VIEW_ADDRESS { Value: self.view.as_ptr() as *mut _ };
            let _ = UnmapViewOfFile(addr);
            let _ = CloseHandle(self.mapping);
        }
    }
}

/// A mapped view of a named file mapping
pub(crate) struct SharedSegment {
    mapping: HANDLE,
    base: NonNull<u8>,
    len: usize,
    /// Producer side: the index it published to, and the generation it wrote
    published: Option<(SegmentIndex, u64)>,
}

impl SharedSegment {
    /// Create a zero-filled mapping of `len` bytes under a new generation.
    pub fn create(names: &SessionNames, len: usize) -> Result<Self> {
        let index = SegmentIndex::create(names)?;
        let generation = next_generation();
        let object = names.segment_object(generation);
        trace!(object = %object, len, "Creating file mapping");

        let size = len as u64;
        let mapping = unsafe {
            let wide_name = wide_string(&object);
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE,
                (size >> 32) as u32,
                size as u32,
                PCWSTR::from_raw(wide_name.as_ptr()),
            )
            .map_err(|e| {
                CameraError::allocation_failed_with_source("frame segment", Box::new(e))
            })?
        };

        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            unsafe {
                let _ = CloseHandle(mapping);
            }
            return Err(CameraError::allocation_failed(format!(
                "frame segment {object} (generation already in use)"
            )));
        }

        let base = match map_view(mapping, len) {
            Ok(base) => base,
            Err(e) => {
                unsafe {
                    let _ = CloseHandle(mapping);
                }
                return Err(e);
            }
        };

        let previous = index.generation().swap(generation, Ordering::AcqRel);
        if previous != 0 {
            warn!(previous, "Replaced segment generation left by a previous producer");
        }

        debug!(object = %object, len, "File mapping created");
        Ok(Self { mapping, base, len, published: Some((index, generation)) })
    }

    /// Map the segment generation currently published for `names`.
    pub fn open(names: &SessionNames) -> Result<Self> {
        let generation = SegmentIndex::open(names)?.generation().load(Ordering::Acquire);
        if generation == 0 {
            return Err(CameraError::NotFound { name: names.name.clone() });
        }

        let object = names.segment_object(generation);
        let mapping = unsafe {
            let wide_name = wide_string(&object);
            OpenFileMappingW(FILE_MAP_ALL_ACCESS.0, false, PCWSTR::from_raw(wide_name.as_ptr()))
                .map_err(|_| CameraError::NotFound { name: names.name.clone() })?
        };

        let base = match map_view(mapping, 0) {
            Ok(base) => base,
            Err(e) => {
                unsafe {
                    let _ = CloseHandle(mapping);
                }
                return Err(e);
            }
        };

        let mut info = MEMORY_BASIC_INFORMATION::default();
        let written = unsafe {
            VirtualQuery(
                Some(base.as_ptr() as *const _),
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        let len = if written == 0 { 0 } else { info.RegionSize };

        debug!(object = %object, len, "Opened file mapping");
        Ok(Self { mapping, base, len, published: None })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

fn map_view(mapping: HANDLE, len: usize) -> Result<NonNull<u8>> {
    unsafe {
        let view = MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, len);
        NonNull::new(view.Value as *mut u8).ok_or_else(|| {
            let win_err = windows::core::Error::from_thread();
            CameraError::windows_api_error("MapViewOfFile", win_err)
        })
    }
}

/// Whether process `pid` is still running.
///
/// Access denied means the process exists but belongs to another user.
pub(crate) fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    unsafe {
        match OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) {
            Ok(handle) => {
                let mut code = 0u32;
                let running = GetExitCodeProcess(handle, &mut code).is_ok()
                    && code == STILL_ACTIVE.0 as u32;
                let _ = CloseHandle(handle);
                running
            }
            Err(e) => e.code() == ERROR_ACCESS_DENIED.to_hresult(),
        }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if let Some((index, generation)) = &self.published {
            // A successor may already have published its own generation
            let _ = index.generation().compare_exchange(
                *generation,
                0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
        unsafe {
            let addr = MEMORY_MAPPED_VIEW_ADDRESS { Value: self.base.as_ptr() as *mut _ };
            let _ = UnmapViewOfFile(addr);
            let _ = CloseHandle(self.mapping);
        }
    }
}

// SAFETY: the view is process-wide memory; all concurrent access goes through
// the frame buffer lock word and header atomics.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

/// Exclusive claim on a session name, backed by a named mutex
pub(crate) struct InstanceClaim {
    mutex: HANDLE,
}

impl InstanceClaim {
    pub fn acquire(names: &SessionNames) -> Result<Self> {
        let object = names.claim_object();
        let mutex = unsafe {
            let wide_name = wide_string(&object);
            CreateMutexW(None, false, PCWSTR::from_raw(wide_name.as_ptr())).map_err(|e| {
                CameraError::allocation_failed_with_source("session claim", Box::new(e))
            })?
        };

        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            unsafe {
                let _ = CloseHandle(mutex);
            }
            debug!(object = %object, "Session claim held elsewhere");
            return Err(CameraError::already_exists(names.name.clone()));
        }

        debug!(object = %object, "Session claim acquired");
        Ok(Self { mutex })
    }
}

impl Drop for InstanceClaim {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.mutex);
        }
    }
}

// SAFETY: kernel object handles may be used from any thread
unsafe impl Send for InstanceClaim {}
unsafe impl Sync for InstanceClaim {}

/// Convert string to null-terminated wide string for Windows APIs
fn wide_string(s: &str) -> Vec<u16> {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    OsStr::new(s).encode_wide().chain(std::iter::once(0)).collect()
}
