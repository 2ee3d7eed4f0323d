//! TOML configuration.
//!
//! ```toml
//! buffer_count = 4
//! frame_timeout_ms = 1000
//! timeout_budget = 5
//! refresh_policy = "retire"
//!
//! [format]
//! width = 1280
//! height = 720
//! fps = 30
//! pixel_format = "MJPG"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CameraError, Result};
use crate::format::FormatRequest;
use crate::mapped::CaptureSettings;
use crate::service::RefreshPolicy;

/// Capture configuration. Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    /// Format new feeds request.
    pub format: FormatRequest,
    /// Buffers mapped per mapped-buffer activation.
    pub buffer_count: u32,
    /// Wait for one filled buffer, in milliseconds.
    pub frame_timeout_ms: u64,
    /// Consecutive timeouts before a capture is declared stalled.
    pub timeout_budget: u32,
    /// What refresh does with feeds of vanished devices.
    pub refresh_policy: RefreshPolicy,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            format: FormatRequest::default(),
            buffer_count: 4,
            frame_timeout_ms: 1000,
            timeout_budget: 5,
            refresh_policy: RefreshPolicy::default(),
        }
    }
}

impl CaptureConfig {
    /// Read and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        log::debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|err| CameraError::Config(err.to_string()))?;
        config.validated()
    }

    /// Check ranges. A buffer count below 2 is raised with a warning; other
    /// out-of-range values are errors.
    pub fn validated(mut self) -> Result<Self> {
        let format = &self.format;
        if format.width == 0 || format.height == 0 {
            return Err(CameraError::Config(format!(
                "resolution {}x{} must be non-zero",
                format.width, format.height
            )));
        }
        if format.fps == 0 {
            return Err(CameraError::Config("fps must be non-zero".to_owned()));
        }
        if self.frame_timeout_ms == 0 {
            return Err(CameraError::Config(
                "frame_timeout_ms must be non-zero".to_owned(),
            ));
        }
        if self.timeout_budget == 0 {
            return Err(CameraError::Config(
                "timeout_budget must be at least 1".to_owned(),
            ));
        }
        if self.buffer_count < 2 {
            log::warn!("buffer_count {} raised to 2", self.buffer_count);
            self.buffer_count = 2;
        }
        Ok(self)
    }

    /// Capture-loop settings for mapped-buffer backends.
    pub fn settings(&self) -> CaptureSettings {
        CaptureSettings {
            buffer_count: self.buffer_count,
            frame_timeout: Duration::from_millis(self.frame_timeout_ms),
            timeout_budget: self.timeout_budget,
        }
        .normalized()
    }
}
