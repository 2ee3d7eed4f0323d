//! Core traits for the capture backend abstraction.

use std::time::Duration;

use crate::error::{CameraError, Result};
use crate::feed::FrameSink;
use crate::format::{FormatRequest, StreamFormat};

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

/// A buffer the driver has filled, borrowed from its queue.
#[derive(Debug)]
pub struct FilledBuffer<'a> {
    /// Slot index within the queue.
    pub index: usize,
    /// Bytes the driver wrote.
    pub data: &'a [u8],
    /// Driver frame sequence number.
    pub sequence: u32,
}

/// Driver side of a set of mapped capture buffers.
///
/// Unmapping happens when the queue is dropped.
pub trait BufferQueue {
    /// Number of buffers the driver granted.
    fn buffer_count(&self) -> usize;

    /// Bound how long [`BufferQueue::dequeue`] waits for a filled buffer.
    fn set_timeout(&mut self, timeout: Duration);

    /// Hand every buffer to the driver and turn streaming on.
    fn stream_on(&mut self) -> Result<()>;

    /// Wait for the driver to fill a buffer.
    ///
    /// Returns `CameraError::CaptureTimeout` when nothing arrives in time.
    fn dequeue(&mut self) -> Result<FilledBuffer<'_>>;

    /// Return buffer `index` to the driver's free queue.
    fn enqueue(&mut self, index: usize) -> Result<()>;

    /// Turn streaming off; the driver gives every buffer back.
    fn stream_off(&mut self) -> Result<()>;
}

/// Abstraction over a memory-mapped capture device.
pub trait CameraDevice: Send {
    /// The buffer queue returned by `request_buffers`.
    type Queue<'a>: BufferQueue
    where
        Self: 'a;

    /// Get device capabilities.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Formats the device reports. Size and rate ranges contribute their
    /// bounds and the point nearest `request`. May be empty if the device
    /// cannot enumerate.
    fn supported_formats(&self, request: &FormatRequest) -> Result<Vec<StreamFormat>>;

    /// Get current format.
    fn format(&self) -> Result<StreamFormat>;

    /// Set capture format. Returns the actual format set by the driver.
    fn set_format(&mut self, format: &StreamFormat) -> Result<StreamFormat>;

    /// Map `count` driver buffers for streaming.
    fn request_buffers(&mut self, count: u32) -> Result<Self::Queue<'_>>;
}

/// Lifecycle of a capture backend.
///
/// `Closed -> Opened -> FormatNegotiated -> Streaming -> Opened -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// No device handle held.
    Closed,
    /// Device handle held, no format agreed.
    Opened,
    /// Format agreed, not streaming.
    FormatNegotiated,
    /// Frames are being delivered.
    Streaming,
}

/// The capability set every capture backend provides.
pub trait CaptureBackend: Send {
    /// Human-readable device label for logs and feed names.
    fn label(&self) -> &str;

    /// Current lifecycle state.
    fn state(&self) -> BackendState;

    /// Acquire the device handle.
    fn open(&mut self) -> Result<()>;

    /// Agree a stream format with the device. The result may differ from
    /// the request; the result is what the feed reports.
    fn negotiate_format(&mut self, request: &FormatRequest) -> Result<StreamFormat>;

    /// Start delivering decoded frames into `sink`.
    fn start(&mut self, sink: FrameSink) -> Result<()>;

    /// Stop delivery. Returns only once no further frame can be published
    /// and every buffer has been reclaimed.
    fn stop(&mut self) -> Result<()>;

    /// Release the device handle.
    fn close(&mut self) -> Result<()>;
}

pub(crate) fn check_state(
    operation: &'static str,
    state: BackendState,
    allowed: &[BackendState],
) -> Result<()> {
    if allowed.contains(&state) {
        Ok(())
    } else {
        Err(CameraError::InvalidState { operation, state })
    }
}
