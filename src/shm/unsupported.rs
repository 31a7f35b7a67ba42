//! Placeholder backend for targets without shared memory support

use super::SessionNames;
use crate::{CameraError, Result};

pub(crate) struct SharedSegment {
    _private: (),
}

impl SharedSegment {
    pub fn create(_names: &SessionNames, _len: usize) -> Result<Self> {
        Err(CameraError::unsupported_platform("Shared frame buffers", "unix or Windows"))
    }

    pub fn open(_names: &SessionNames) -> Result<Self> {
        Err(CameraError::unsupported_platform("Shared frame buffers", "unix or Windows"))
    }

    pub fn as_ptr(&self) -> *mut u8 {
        std::ptr::null_mut()
    }

    pub fn len(&self) -> usize {
        0
    }
}

pub(crate) struct InstanceClaim {
    _private: (),
}

impl InstanceClaim {
    pub fn acquire(_names: &SessionNames) -> Result<Self> {
        Err(CameraError::unsupported_platform("Camera sessions", "unix or Windows"))
    }
}

/// Without a backend no peer can exist, so nothing is ever reported dead.
pub(crate) fn process_alive(_pid: u32) -> bool {
    true
}
