//! USB-stream capture backend: a UVC-style device whose frames arrive on a
//! thread owned by the transport library.
//!
//! The transport is reached through two traits. [`UsbTransport`] is the
//! process-wide context (one per service, shared by every backend built from
//! it) that turns a platform file descriptor into a USB handle and opens a
//! video stream on it. [`UvcStream`] lists and probes formats and runs the
//! callback loop. Frames handed to the callback are only valid for the duration of
//! the call, so conversion and publishing happen before it returns.

use std::os::fd::RawFd;
use std::sync::Arc;

use crate::convert::convert;
use crate::error::{CameraError, Result};
use crate::feed::FrameSink;
use crate::format::{rank_candidates, FormatRequest, FourCC, StreamFormat};
use crate::traits::{check_state, BackendState, CaptureBackend};

/// Encodings probed when a request accepts any. Compressed first: many UVC
/// devices only reach their advertised rates in MJPEG.
pub const USB_PRIORITY: [FourCC; 2] = [FourCC::MJPG, FourCC::YUYV];

/// A frame as the transport delivers it. Borrowed for one callback only.
#[derive(Debug)]
pub struct TransportFrame<'a> {
    /// Payload bytes.
    pub data: &'a [u8],
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Payload encoding.
    pub fourcc: FourCC,
    /// Transport frame counter.
    pub sequence: u32,
}

/// Invoked by the transport once per delivered frame, on its own thread.
pub type FrameCallback = Box<dyn FnMut(&TransportFrame<'_>) + Send>;

/// A streaming handle opened over a USB device.
pub trait UvcStream: Send {
    /// Formats the device's descriptors advertise. May be empty.
    fn supported_formats(&self) -> Result<Vec<StreamFormat>>;

    /// Ask the device whether it can stream `format`. Returns what it
    /// would actually deliver.
    fn probe_format(&mut self, format: &StreamFormat) -> Result<StreamFormat>;

    /// Begin streaming `format`, invoking `callback` for every frame.
    fn start_streaming(&mut self, format: &StreamFormat, callback: FrameCallback) -> Result<()>;

    /// Stop streaming. Blocks until the last in-flight callback returned.
    fn stop_streaming(&mut self);
}

/// Process-wide USB transport context.
pub trait UsbTransport: Send + Sync + 'static {
    /// Wrapped USB device handle. Released on drop.
    type Device: Send;
    /// Streaming handle. Closed on drop.
    type Stream: UvcStream;

    /// Wrap a platform-provided file descriptor as a USB device handle.
    fn wrap_sys_device(&self, fd: RawFd) -> Result<Self::Device>;

    /// Open a video stream over a wrapped device.
    fn open_stream(&self, device: &Self::Device) -> Result<Self::Stream>;
}

/// Capture backend over a UVC-style transport.
pub struct UsbStreamBackend<T: UsbTransport> {
    transport: Arc<T>,
    fd: RawFd,
    label: String,
    // Declared before `device`: the stream must close before the handle.
    stream: Option<T::Stream>,
    device: Option<T::Device>,
    format: Option<StreamFormat>,
    state: BackendState,
}

impl<T: UsbTransport> UsbStreamBackend<T> {
    /// Create a closed backend for the device behind `fd`.
    pub fn new(transport: Arc<T>, fd: RawFd, label: &str) -> Self {
        Self {
            transport,
            fd,
            label: label.to_owned(),
            stream: None,
            device: None,
            format: None,
            state: BackendState::Closed,
        }
    }

    fn stream_mut(&mut self, operation: &'static str) -> Result<&mut T::Stream> {
        let state = self.state;
        self.stream
            .as_mut()
            .ok_or(CameraError::InvalidState { operation, state })
    }
}

impl<T: UsbTransport> CaptureBackend for UsbStreamBackend<T> {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> BackendState {
        self.state
    }

    fn open(&mut self) -> Result<()> {
        check_state("open", self.state, &[BackendState::Closed])?;

        let device = self
            .transport
            .wrap_sys_device(self.fd)
            .map_err(|err| match err {
                CameraError::TransportWrap(_) | CameraError::DeviceBusy(_) => err,
                other => CameraError::TransportWrap(other.to_string()),
            })?;
        // On failure the wrapped handle is released when `device` drops.
        let stream = self
            .transport
            .open_stream(&device)
            .map_err(|err| match err {
                CameraError::StreamOpen(_) | CameraError::DeviceBusy(_) => err,
                other => CameraError::StreamOpen(other.to_string()),
            })?;

        self.device = Some(device);
        self.stream = Some(stream);
        self.state = BackendState::Opened;
        log::info!("{}: opened USB stream (fd {})", self.label, self.fd);
        Ok(())
    }

    fn negotiate_format(&mut self, request: &FormatRequest) -> Result<StreamFormat> {
        check_state(
            "negotiate format",
            self.state,
            &[BackendState::Opened, BackendState::FormatNegotiated],
        )?;
        let label = self.label.clone();
        let stream = self.stream_mut("negotiate format")?;

        let supported = stream.supported_formats().unwrap_or_else(|err| {
            log::debug!("{label}: format descriptors unavailable: {err}");
            Vec::new()
        });

        let mut reason = "device offers no convertible format".to_owned();
        for candidate in rank_candidates(request, &supported, &USB_PRIORITY) {
            match stream.probe_format(&candidate) {
                Ok(actual) if request.pixel_format.accepts(actual.fourcc) => {
                    log::info!("{label}: negotiated {actual} for {request}");
                    self.format = Some(actual);
                    self.state = BackendState::FormatNegotiated;
                    return Ok(actual);
                }
                Ok(actual) => reason = format!("device offered {actual} for {candidate}"),
                Err(err) => {
                    log::debug!("{label}: probe {candidate}: {err}");
                    reason = err.to_string();
                }
            }
        }

        Err(CameraError::FormatNegotiation {
            request: *request,
            reason,
        })
    }

    fn start(&mut self, sink: FrameSink) -> Result<()> {
        check_state("start", self.state, &[BackendState::FormatNegotiated])?;
        let format = self.format.ok_or(CameraError::InvalidState {
            operation: "start",
            state: self.state,
        })?;

        let callback: FrameCallback = Box::new(move |frame: &TransportFrame<'_>| {
            match convert(frame.data, frame.width, frame.height, frame.fourcc) {
                Ok(decoded) => sink.publish(decoded.with_sequence(frame.sequence)),
                Err(err) => sink.drop_frame(&err),
            }
        });
        self.stream_mut("start")?.start_streaming(&format, callback)?;

        self.state = BackendState::Streaming;
        log::debug!("{}: streaming {format}", self.label);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        check_state("stop", self.state, &[BackendState::Streaming])?;
        self.stream_mut("stop")?.stop_streaming();
        self.format = None;
        self.state = BackendState::Opened;
        log::debug!("{}: streaming stopped", self.label);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        check_state(
            "close",
            self.state,
            &[BackendState::Opened, BackendState::FormatNegotiated],
        )?;
        self.stream = None;
        self.device = None;
        self.format = None;
        self.state = BackendState::Closed;
        log::debug!("{}: closed", self.label);
        Ok(())
    }
}

impl<T: UsbTransport> Drop for UsbStreamBackend<T> {
    fn drop(&mut self) {
        if self.state == BackendState::Streaming {
            if let Some(stream) = self.stream.as_mut() {
                stream.stop_streaming();
            }
        }
        self.stream = None;
        self.device = None;
    }
}
