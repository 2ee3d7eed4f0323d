//! Mapped-buffer capture backend: a V4L2-style device driven by our own
//! capture thread.

use std::mem;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::{allocate, BufferPool};
use crate::capture_thread::{CaptureThread, StopSignal};
use crate::convert::convert_with_stride;
use crate::device::V4L2Device;
use crate::error::{CameraError, Result};
use crate::feed::FrameSink;
use crate::format::{rank_candidates, FormatRequest, FourCC, StreamFormat};
use crate::traits::{check_state, BackendState, BufferQueue, CameraDevice, CaptureBackend};

/// Encodings tried when a request accepts any, best first.
pub const MAPPED_PRIORITY: [FourCC; 4] = [FourCC::YUYV, FourCC::MJPG, FourCC::RGB3, FourCC::BGR3];

/// Opens device nodes for a [`MappedBackend`].
pub trait DeviceOpener: Send + Sync + 'static {
    /// The device type this opener produces.
    type Device: CameraDevice + 'static;

    /// Open the node at `path`.
    fn open(&self, path: &Path) -> Result<Self::Device>;
}

/// Opens real V4L2 nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2Opener;

impl DeviceOpener for V4l2Opener {
    type Device = V4L2Device;

    fn open(&self, path: &Path) -> Result<V4L2Device> {
        V4L2Device::open(path)
    }
}

/// Tunables of the capture loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Buffers to map. At least 2.
    pub buffer_count: u32,
    /// How long one wait for a filled buffer may take.
    pub frame_timeout: Duration,
    /// Consecutive timeouts tolerated before the capture is declared stalled.
    pub timeout_budget: u32,
}

impl CaptureSettings {
    /// Clamp values into their valid ranges.
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            buffer_count: self.buffer_count.max(2),
            frame_timeout: self.frame_timeout.max(Duration::from_millis(1)),
            timeout_budget: self.timeout_budget.max(1),
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            buffer_count: 4,
            frame_timeout: Duration::from_secs(1),
            timeout_budget: 5,
        }
    }
}

enum DeviceSlot<D> {
    Closed,
    Idle(D),
    Streaming(CaptureThread<D>),
}

/// Capture backend over memory-mapped driver buffers.
///
/// The device moves into the capture thread while streaming and comes back
/// when the thread is joined.
pub struct MappedBackend<O: DeviceOpener> {
    opener: Arc<O>,
    path: PathBuf,
    label: String,
    settings: CaptureSettings,
    state: BackendState,
    slot: DeviceSlot<O::Device>,
    format: Option<StreamFormat>,
}

impl<O: DeviceOpener> MappedBackend<O> {
    /// Create a closed backend for the node at `path`.
    pub fn new(opener: Arc<O>, path: &Path, settings: CaptureSettings) -> Self {
        Self {
            opener,
            path: path.to_owned(),
            label: path.display().to_string(),
            settings: settings.normalized(),
            state: BackendState::Closed,
            slot: DeviceSlot::Closed,
            format: None,
        }
    }

    /// Negotiated format, while one is agreed.
    pub const fn format(&self) -> Option<StreamFormat> {
        self.format
    }

    fn device_mut(&mut self, operation: &'static str) -> Result<&mut O::Device> {
        match &mut self.slot {
            DeviceSlot::Idle(device) => Ok(device),
            _ => Err(CameraError::InvalidState {
                operation,
                state: self.state,
            }),
        }
    }
}

impl<O: DeviceOpener> CaptureBackend for MappedBackend<O> {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> BackendState {
        self.state
    }

    fn open(&mut self) -> Result<()> {
        check_state("open", self.state, &[BackendState::Closed])?;
        let device = self.opener.open(&self.path)?;
        let caps = device.capabilities();
        log::info!("{}: opened {} ({})", self.label, caps.card, caps.driver);

        self.slot = DeviceSlot::Idle(device);
        self.state = BackendState::Opened;
        Ok(())
    }

    fn negotiate_format(&mut self, request: &FormatRequest) -> Result<StreamFormat> {
        check_state(
            "negotiate format",
            self.state,
            &[BackendState::Opened, BackendState::FormatNegotiated],
        )?;
        let label = self.label.clone();
        let device = self.device_mut("negotiate format")?;

        let supported = device.supported_formats(request).unwrap_or_else(|err| {
            log::debug!("{label}: format enumeration unavailable: {err}");
            Vec::new()
        });
        let candidates = rank_candidates(request, &supported, &MAPPED_PRIORITY);

        let mut reason = "device offers no convertible format".to_owned();
        for candidate in candidates {
            match device.set_format(&candidate) {
                Ok(actual) if request.pixel_format.accepts(actual.fourcc) => {
                    if actual.with_stride(0) != candidate {
                        log::debug!("{label}: asked for {candidate}, driver chose {actual}");
                    }
                    log::info!("{label}: negotiated {actual} for {request}");
                    self.format = Some(actual);
                    self.state = BackendState::FormatNegotiated;
                    return Ok(actual);
                }
                Ok(actual) => reason = format!("driver substituted {actual} for {candidate}"),
                Err(err @ CameraError::DeviceBusy(_)) => return Err(err),
                Err(err) => reason = err.to_string(),
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
        let DeviceSlot::Idle(device) = mem::replace(&mut self.slot, DeviceSlot::Closed) else {
            return Err(CameraError::InvalidState {
                operation: "start",
                state: self.state,
            });
        };

        let settings = self.settings;
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let spawned = CaptureThread::spawn(&format!("capture-{}", self.label), move |stop| {
            run_capture(device, format, settings, &stop, &sink, &ready_tx)
        });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(err) => {
                // The device went down with the unspawned closure.
                self.state = BackendState::Closed;
                self.format = None;
                return Err(err);
            }
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.slot = DeviceSlot::Streaming(thread);
                self.state = BackendState::Streaming;
                Ok(())
            }
            Ok(Err(err)) => {
                match thread.stop() {
                    Ok(device) => self.slot = DeviceSlot::Idle(device),
                    Err(join_err) => {
                        log::error!("{}: {join_err}", self.label);
                        self.state = BackendState::Closed;
                        self.format = None;
                    }
                }
                Err(err)
            }
            Err(_) => {
                self.state = BackendState::Closed;
                self.format = None;
                Err(thread.stop().err().unwrap_or_else(|| {
                    CameraError::CaptureThread("exited before streaming".to_owned())
                }))
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        check_state("stop", self.state, &[BackendState::Streaming])?;
        let DeviceSlot::Streaming(thread) = mem::replace(&mut self.slot, DeviceSlot::Closed) else {
            return Err(CameraError::InvalidState {
                operation: "stop",
                state: self.state,
            });
        };

        self.format = None;
        match thread.stop() {
            Ok(device) => {
                self.slot = DeviceSlot::Idle(device);
                self.state = BackendState::Opened;
                log::debug!("{}: streaming stopped", self.label);
                Ok(())
            }
            Err(err) => {
                self.state = BackendState::Closed;
                Err(err)
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        check_state(
            "close",
            self.state,
            &[BackendState::Opened, BackendState::FormatNegotiated],
        )?;
        self.slot = DeviceSlot::Closed;
        self.format = None;
        self.state = BackendState::Closed;
        log::debug!("{}: closed", self.label);
        Ok(())
    }
}

/// Body of the capture thread. Always hands the device back.
fn run_capture<D: CameraDevice>(
    mut device: D,
    format: StreamFormat,
    settings: CaptureSettings,
    stop: &StopSignal,
    sink: &FrameSink,
    ready: &SyncSender<Result<()>>,
) -> D {
    stream_frames(&mut device, &format, &settings, stop, sink, ready);
    device
}

fn stream_frames<D: CameraDevice>(
    device: &mut D,
    format: &StreamFormat,
    settings: &CaptureSettings,
    stop: &StopSignal,
    sink: &FrameSink,
    ready: &SyncSender<Result<()>>,
) {
    let mut pool = match prepare_pool(device, settings) {
        Ok(pool) => pool,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let outcome = capture_loop(&mut pool, format, settings.timeout_budget, stop, sink);
    if let Err(err) = pool.teardown() {
        log::warn!("{}: buffer teardown: {err}", sink.feed_name());
    }
    if let Err(err) = outcome {
        sink.fail(err);
    }
}

fn prepare_pool<'a, D: CameraDevice>(
    device: &'a mut D,
    settings: &CaptureSettings,
) -> Result<BufferPool<D::Queue<'a>>> {
    let mut pool = allocate(device, settings.buffer_count)?;
    log::debug!("mapped {} buffers", pool.capacity());
    pool.set_timeout(settings.frame_timeout);
    if let Err(err) = pool.start() {
        if let Err(teardown) = pool.teardown() {
            log::debug!("teardown after failed start: {teardown}");
        }
        return Err(err);
    }
    Ok(pool)
}

/// Pull filled buffers until `stop` is raised or the capture fails.
///
/// Each buffer goes back to the driver as soon as it is converted. Frames
/// that cannot be converted are dropped. Timeouts are retried until
/// `timeout_budget` of them happen in a row.
pub fn capture_loop<Q: BufferQueue>(
    pool: &mut BufferPool<Q>,
    format: &StreamFormat,
    timeout_budget: u32,
    stop: &StopSignal,
    sink: &FrameSink,
) -> Result<()> {
    let mut consecutive = 0u32;

    while !stop.is_raised() {
        let buffer = match pool.acquire() {
            Ok(buffer) => buffer,
            Err(err) if err.is_transient() => {
                consecutive += 1;
                sink.capture_timeout(&err, consecutive);
                if consecutive >= timeout_budget {
                    return Err(CameraError::CaptureStalled {
                        timeouts: consecutive,
                    });
                }
                continue;
            }
            Err(err) => return Err(err),
        };
        consecutive = 0;

        let sequence = buffer.sequence();
        let decoded = convert_with_stride(
            buffer.data(),
            format.width,
            format.height,
            format.fourcc,
            format.stride,
        );
        let token = buffer.into_token();
        pool.release(token)?;

        match decoded {
            Ok(frame) => sink.publish(frame.with_sequence(sequence)),
            Err(err) if err.is_frame_local() => sink.drop_frame(&err),
            Err(err) => return Err(err),
        }
    }

    Ok(())
}
