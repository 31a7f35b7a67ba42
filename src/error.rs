//! Error types for the virtual camera core.
//!
//! All errors implement `std::error::Error` and carry enough structured context to
//! tell a caller what went wrong and whether trying again makes sense.
//!
//! ## Error Categories
//!
//! - **Invalid arguments**: bad dimensions, framerate, session name or format code
//! - **Already exists**: another producer holds the session name
//! - **Resource allocation**: the OS refused the shared segment or the claim
//! - **Precondition violations**: wrong frame length, or use of a deleted session
//! - **Shared memory**: layout mismatches, short segments, lock timeouts
//!
//! [`CameraError::kind`] folds every variant into one of these categories.
//!
//! ```rust
//! use virtcam::{CameraError, ErrorKind};
//!
//! let error = CameraError::already_exists("virtcam");
//! assert_eq!(error.kind(), ErrorKind::AlreadyExists);
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

#[cfg(windows)]
use windows_core as core;

/// Result type alias for camera operations.
pub type Result<T, E = CameraError> = std::result::Result<T, E>;

/// Coarse classification of a [`CameraError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    AlreadyExists,
    ResourceAllocation,
    PreconditionViolation,
    Other,
}

/// Main error type for camera operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CameraError {
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("A camera named '{name}' is already active")]
    AlreadyExists { name: String },

    #[error("Failed to allocate {resource}")]
    ResourceAllocation {
        resource: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Frame size mismatch: expected {expected} bytes, got {actual}")]
    FrameSize { expected: usize, actual: usize },

    #[error("Camera session has been deleted")]
    SessionDeleted,

    #[error("No active camera named '{name}'")]
    NotFound { name: String },

    #[error("Shared layout version mismatch: expected {expected}, found {found}")]
    Version { expected: u32, found: u32 },

    #[error("Shared memory error: {reason}")]
    Memory { reason: String },

    #[error("Frame buffer lock not acquired within {duration:?}")]
    LockTimeout { duration: Duration },

    #[error("Configuration error: {details}")]
    Config { details: String },

    #[error("I/O error while {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{feature} is only available on {required_platform}")]
    UnsupportedPlatform { feature: String, required_platform: String },

    #[error("Windows API error: {operation}")]
    #[cfg(windows)]
    WindowsApi {
        operation: String,
        #[source]
        source: core::Error,
    },
}

impl CameraError {
    /// Category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CameraError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            CameraError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            CameraError::ResourceAllocation { .. } => ErrorKind::ResourceAllocation,
            CameraError::FrameSize { .. } | CameraError::SessionDeleted => {
                ErrorKind::PreconditionViolation
            }
            CameraError::NotFound { .. }
            | CameraError::Version { .. }
            | CameraError::Memory { .. }
            | CameraError::LockTimeout { .. }
            | CameraError::Config { .. }
            | CameraError::Io { .. }
            | CameraError::UnsupportedPlatform { .. } => ErrorKind::Other,
            #[cfg(windows)]
            CameraError::WindowsApi { .. } => ErrorKind::ResourceAllocation,
        }
    }

    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            CameraError::AlreadyExists { .. } => true,
            CameraError::ResourceAllocation { .. } => true,
            CameraError::NotFound { .. } => true,
            CameraError::LockTimeout { .. } => true,
            CameraError::Io { .. } => true,
            CameraError::InvalidArgument { .. } => false,
            CameraError::FrameSize { .. } => false,
            CameraError::SessionDeleted => false,
            CameraError::Version { .. } => false,
            CameraError::Memory { .. } => false,
            CameraError::Config { .. } => false,
            CameraError::UnsupportedPlatform { .. } => false,
            #[cfg(windows)]
            CameraError::WindowsApi { .. } => true,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            CameraError::InvalidArgument { .. } => vec![
                "Use a width and height that are positive multiples of four",
                "Use a finite, non-negative framerate",
                "Restrict session names to letters, digits, '-' and '_'",
            ],
            CameraError::AlreadyExists { .. } => vec![
                "Delete the existing camera before creating a new one",
                "Check for another producer process still running",
                "Retry once the other producer has exited",
            ],
            CameraError::ResourceAllocation { .. } => vec![
                "Check available shared memory",
                "Check permissions on the runtime directory",
                "Reduce the frame dimensions",
            ],
            CameraError::FrameSize { .. } => vec![
                "Pass exactly width * height * bytes-per-pixel bytes",
                "Check the pixel format the camera was created with",
            ],
            CameraError::SessionDeleted => vec![
                "Create a new camera session",
                "Stop using handles after calling delete",
            ],
            CameraError::NotFound { .. } => vec![
                "Start the producer before opening the camera",
                "Check that producer and consumer use the same session name",
            ],
            CameraError::Version { .. } => vec![
                "Rebuild producer and consumer against the same library version",
            ],
            CameraError::Memory { .. } => vec![
                "Verify shared memory is still valid",
                "Restart the producer",
            ],
            CameraError::LockTimeout { .. } => vec![
                "Check for a consumer stuck inside a frame copy",
                "Restart the consumer pipeline",
            ],
            CameraError::Config { .. } => vec![
                "Check configuration file syntax",
                "Verify field names and value types",
            ],
            CameraError::Io { .. } => vec![
                "Check file permissions",
                "Verify the runtime directory exists and is writable",
            ],
            CameraError::UnsupportedPlatform { .. } => vec![
                "Use a platform with a shared memory backend",
                "Check documentation for platform requirements",
            ],
            #[cfg(windows)]
            CameraError::WindowsApi { .. } => vec![
                "Check Windows API permissions",
                "Verify system resources availability",
            ],
        }
    }

    /// Helper constructor for invalid argument errors.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        CameraError::InvalidArgument { reason: reason.into() }
    }

    /// Helper constructor for name collisions.
    pub fn already_exists(name: impl Into<String>) -> Self {
        CameraError::AlreadyExists { name: name.into() }
    }

    /// Helper constructor for allocation failures.
    pub fn allocation_failed(resource: impl Into<String>) -> Self {
        CameraError::ResourceAllocation { resource: resource.into(), source: None }
    }

    /// Helper constructor for allocation failures with source.
    pub fn allocation_failed_with_source(
        resource: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        CameraError::ResourceAllocation { resource: resource.into(), source: Some(source) }
    }

    /// Helper constructor for I/O errors with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        CameraError::Io { context: context.into(), source }
    }

    /// Helper constructor for shared memory errors.
    pub fn memory(reason: impl Into<String>) -> Self {
        CameraError::Memory { reason: reason.into() }
    }

    /// Helper constructor for Windows API errors.
    #[cfg(windows)]
    pub fn windows_api_error(operation: impl Into<String>, source: core::Error) -> Self {
        CameraError::WindowsApi { operation: operation.into(), source }
    }

    /// Helper constructor for unsupported platform errors.
    pub fn unsupported_platform(
        feature: impl Into<String>,
        required_platform: impl Into<String>,
    ) -> Self {
        CameraError::UnsupportedPlatform {
            feature: feature.into(),
            required_platform: required_platform.into(),
        }
    }
}

impl From<std::io::Error> for CameraError {
    fn from(err: std::io::Error) -> Self {
        CameraError::Io { context: "accessing shared memory".to_string(), source: err }
    }
}

impl From<serde_yaml_ng::Error> for CameraError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        CameraError::Config { details: err.to_string() }
    }
}

#[cfg(windows)]
impl From<core::Error> for CameraError {
    fn from(err: core::Error) -> Self {
        CameraError::WindowsApi {
            operation: "Unknown Windows operation".to_string(),
            source: err,
        }
    }
}
