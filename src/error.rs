//! Error types for capture, conversion and feed lifecycle.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::format::{FourCC, FormatRequest};
use crate::traits::BackendState;

/// Error type for camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// The device node could not be opened (not found, permission denied).
    #[error("failed to open device {device}: {reason}")]
    DeviceOpen {
        /// Device path or label.
        device: String,
        /// What the OS or driver reported.
        reason: String,
    },

    /// The device is already in use by another process or backend.
    #[error("device {0} is busy")]
    DeviceBusy(String),

    /// The device rejected every format we asked for.
    #[error("no acceptable format for {request}: {reason}")]
    FormatNegotiation {
        /// The request that could not be satisfied.
        request: FormatRequest,
        /// Why the last attempt failed.
        reason: String,
    },

    /// Mapping or allocating capture buffers failed.
    #[error("buffer allocation failed: {0}")]
    Allocation(String),

    /// The platform device reference could not be wrapped as a USB handle.
    #[error("failed to wrap USB device: {0}")]
    TransportWrap(String),

    /// A streaming handle could not be opened over the USB device.
    #[error("failed to open video stream: {0}")]
    StreamOpen(String),

    /// No filled buffer arrived within the timeout.
    #[error("no frame within {0:?}")]
    CaptureTimeout(Duration),

    /// Too many consecutive timeouts; the activation is abandoned.
    #[error("capture stalled after {timeouts} consecutive timeouts")]
    CaptureStalled {
        /// Number of consecutive timeouts observed.
        timeouts: u32,
    },

    /// The converter has no path from this encoding to RGB.
    #[error("unsupported pixel format {0}")]
    UnsupportedFormat(FourCC),

    /// A compressed payload could not be decoded.
    #[error("frame conversion failed: {0}")]
    Conversion(String),

    /// Payload length does not match the declared dimensions.
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    TruncatedFrame {
        /// Bytes the declared dimensions require.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// An operation was called in a backend state that does not allow it.
    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The backend state at the time.
        state: BackendState,
    },

    /// A buffer was handed back that the consumer did not hold, or the
    /// driver returned one that was not queued.
    #[error("buffer ownership violated: {0}")]
    BufferOwnership(String),

    /// Error during a streaming operation.
    #[error("stream error: {0}")]
    Stream(String),

    /// The capture thread could not be spawned or did not exit cleanly.
    #[error("capture thread: {0}")]
    CaptureThread(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A frame did not contain the expected test pattern.
    #[error("validation failed: {0}")]
    Validation(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CameraError {
    /// Errors that only cost the current frame; capture continues.
    #[must_use]
    pub const fn is_frame_local(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedFormat(_) | Self::Conversion(_) | Self::TruncatedFrame { .. }
        )
    }

    /// Errors the capture loop retries within its timeout budget.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::CaptureTimeout(_))
    }
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// A backend failure surfaced through a feed operation.
#[derive(Debug, Error)]
#[error("feed {feed}: {source}")]
pub struct FeedError {
    /// Name of the feed that failed.
    pub feed: String,
    /// The originating error, shared with the feed's recorded last error.
    #[source]
    pub source: Arc<CameraError>,
}

impl FeedError {
    pub(crate) fn new(feed: &str, source: Arc<CameraError>) -> Self {
        Self {
            feed: feed.to_owned(),
            source,
        }
    }

    /// The backend error behind this failure.
    pub fn cause(&self) -> &CameraError {
        &self.source
    }
}
