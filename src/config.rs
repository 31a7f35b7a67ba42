//! Camera configuration
//!
//! [`CameraConfig`] carries every creation parameter with its documented default,
//! so callers never rely on implicit default arguments. It can be built in code or
//! loaded from YAML:
//!
//! ```rust
//! use virtcam::{CameraConfig, PixelFormat};
//!
//! let config = CameraConfig::from_yaml_str("width: 640\nheight: 480\nformat: argb32\n").unwrap();
//! assert_eq!(config.framerate, 60.0);
//! assert_eq!(config.format, PixelFormat::Argb32);
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{CameraError, PixelFormat, Result};

/// Session name used when none is configured.
pub const DEFAULT_SESSION_NAME: &str = "virtcam";

/// Framerate used when none is configured.
pub const DEFAULT_FRAMERATE: f32 = 60.0;

/// Slowest paced framerate accepted: one frame per hour.
pub const MIN_FRAMERATE: f32 = 1.0 / 3600.0;

const MAX_NAME_LEN: usize = 64;

/// Creation parameters for a [`Camera`](crate::Camera).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Image width in pixels, a positive multiple of four
    pub width: u32,

    /// Image height in pixels, a positive multiple of four
    pub height: u32,

    /// Reference framerate; 0 sends every frame immediately
    #[serde(default = "default_framerate")]
    pub framerate: f32,

    #[serde(default)]
    pub format: PixelFormat,

    /// System-wide session name; only one producer may hold it at a time
    #[serde(default = "default_name")]
    pub name: String,

    /// Directory for the segment and lock files (unix only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_dir: Option<PathBuf>,
}

fn default_framerate() -> f32 {
    DEFAULT_FRAMERATE
}

fn default_name() -> String {
    DEFAULT_SESSION_NAME.to_string()
}

impl CameraConfig {
    /// RGB24 at 60 fps under the default session name.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            framerate: DEFAULT_FRAMERATE,
            format: PixelFormat::default(),
            name: default_name(),
            runtime_dir: None,
        }
    }

    pub fn with_framerate(mut self, framerate: f32) -> Self {
        self.framerate = framerate;
        self
    }

    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = Some(dir.into());
        self
    }

    /// Parse a configuration from YAML.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(yaml)?)
    }

    /// Load a configuration from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CameraError::io(format!("reading {}", path.display()), e))?;
        Self::from_yaml_str(&contents)
    }

    /// Payload length of one frame.
    pub fn frame_len(&self) -> usize {
        self.format.frame_len(self.width, self.height)
    }

    /// Check every creation precondition.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(CameraError::invalid_argument(format!(
                "dimensions must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.width % 4 != 0 || self.height % 4 != 0 {
            return Err(CameraError::invalid_argument(format!(
                "dimensions must be multiples of four, got {}x{}",
                self.width, self.height
            )));
        }
        if !self.framerate.is_finite() || self.framerate < 0.0 {
            return Err(CameraError::invalid_argument(format!(
                "framerate must be finite and non-negative, got {}",
                self.framerate
            )));
        }
        if self.framerate != 0.0 && self.framerate < MIN_FRAMERATE {
            return Err(CameraError::invalid_argument(format!(
                "framerate must be 0 or at least {MIN_FRAMERATE}, got {}",
                self.framerate
            )));
        }
        let frame_len = self.format.checked_frame_len(self.width, self.height);
        if frame_len.is_none_or(|len| len > isize::MAX as usize / 2) {
            return Err(CameraError::invalid_argument("frame is too large to map"));
        }
        validate_name(&self.name)
    }
}

/// Session names become file and kernel object names, so keep them plain.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(CameraError::invalid_argument(format!(
            "session name must be 1-{MAX_NAME_LEN} characters"
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(CameraError::invalid_argument(format!(
            "session name '{name}' may only contain letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn multiples_of_four_are_accepted(w in 1u32..512, h in 1u32..512) {
            let config = CameraConfig::new(w * 4, h * 4);
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn non_multiples_of_four_are_rejected(w in 1u32..2048, h in 1u32..2048) {
            prop_assume!(w % 4 != 0 || h % 4 != 0);
            let error = CameraConfig::new(w, h).validate().unwrap_err();
            prop_assert_eq!(error.kind(), ErrorKind::InvalidArgument);
        }

        #[test]
        fn bad_names_are_rejected(name in "[a-z]{0,4}[ ./\\\\:][a-z]{0,4}") {
            let config = CameraConfig::new(64, 64).with_name(name);
            prop_assert!(config.validate().is_err());
        }
    }

    #[test]
    fn zero_dimensions_are_rejected() {
        assert!(CameraConfig::new(0, 480).validate().is_err());
        assert!(CameraConfig::new(640, 0).validate().is_err());
    }

    #[test]
    fn framerate_must_be_finite_and_non_negative() {
        let base = CameraConfig::new(320, 240);
        assert!(base.clone().with_framerate(0.0).validate().is_ok());
        assert!(base.clone().with_framerate(-1.0).validate().is_err());
        assert!(base.clone().with_framerate(1e-30).validate().is_err());
        assert!(base.clone().with_framerate(f32::NAN).validate().is_err());
        assert!(base.with_framerate(f32::INFINITY).validate().is_err());
    }

    #[test]
    fn yaml_defaults_apply() {
        let config = CameraConfig::from_yaml_str("width: 320\nheight: 240\n").unwrap();
        assert_eq!(config, CameraConfig::new(320, 240));
        assert_eq!(config.frame_len(), 320 * 240 * 3);
    }

    #[test]
    fn yaml_overrides_every_field() {
        let yaml = "width: 64\nheight: 32\nframerate: 0\nformat: argb32\nname: studio-cam\nruntime_dir: /tmp/cams\n";
        let config = CameraConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.framerate, 0.0);
        assert_eq!(config.format, PixelFormat::Argb32);
        assert_eq!(config.name, "studio-cam");
        assert_eq!(config.runtime_dir.as_deref(), Some(Path::new("/tmp/cams")));
    }

    #[test]
    fn malformed_yaml_is_a_config_error() {
        let error = CameraConfig::from_yaml_str("width: [").unwrap_err();
        assert!(matches!(error, CameraError::Config { .. }));
    }
}
