//! V4L2 device implementation using the v4l crate.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use v4l::buffer::Type;
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::{CaptureStream as _, Stream as _};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Fraction};

use crate::error::{CameraError, Result};
use crate::format::{FormatRequest, FourCC, StreamFormat};
use crate::traits::{BufferQueue, CameraDevice, DeviceCapabilities, FilledBuffer};

const EBUSY: i32 = 16;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// V4L2 device implementation wrapping the v4l crate.
pub struct V4L2Device {
    device: Device,
    capabilities: DeviceCapabilities,
    path: PathBuf,
}

impl V4L2Device {
    /// Open a V4L2 device node such as `/dev/video0`.
    ///
    /// Nodes that cannot capture or stream (metadata nodes, output-only
    /// devices) are rejected.
    pub fn open(path: &Path) -> Result<Self> {
        let label = path.display().to_string();
        let device = Device::with_path(path).map_err(|err| open_error(&label, &err))?;

        let caps = device
            .query_caps()
            .map_err(|err| open_error(&label, &err))?;

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
        };

        if !(capabilities.can_capture && capabilities.can_stream) {
            return Err(CameraError::DeviceOpen {
                device: label,
                reason: format!("{} cannot stream video capture", capabilities.card),
            });
        }

        log::debug!(
            "{label}: opened {} ({}, {})",
            capabilities.card,
            capabilities.driver,
            capabilities.bus_info
        );
        Ok(Self {
            device,
            capabilities,
            path: path.to_owned(),
        })
    }

    fn label(&self) -> String {
        self.path.display().to_string()
    }

    fn frame_rates(&self, fourcc: v4l::FourCC, width: u32, height: u32, wanted: u32) -> Vec<u32> {
        match self.device.enum_frameintervals(fourcc, width, height) {
            Ok(intervals) => {
                candidate_rates(intervals.into_iter().map(|interval| interval.interval), wanted)
            }
            Err(_) => Vec::new(),
        }
    }

    fn current_fps(&self) -> u32 {
        self.device
            .params()
            .map(|params| fps_of(params.interval))
            .unwrap_or(0)
    }
}

impl CameraDevice for V4L2Device {
    type Queue<'a> = V4l2Queue<'a>;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn supported_formats(&self, request: &FormatRequest) -> Result<Vec<StreamFormat>> {
        let descriptions = self
            .device
            .enum_formats()
            .map_err(|err| CameraError::Stream(err.to_string()))?;

        let mut formats = Vec::new();
        for description in descriptions {
            let Ok(sizes) = self.device.enum_framesizes(description.fourcc) else {
                continue;
            };
            for size in sizes {
                for (width, height) in candidate_sizes(&size.size, request) {
                    let fourcc = FourCC::from(description.fourcc);
                    let rates = self.frame_rates(description.fourcc, width, height, request.fps);
                    if rates.is_empty() {
                        // Intervals not enumerable; ask for the requested rate.
                        formats.push(StreamFormat::new(width, height, fourcc, request.fps));
                    }
                    for fps in rates {
                        formats.push(StreamFormat::new(width, height, fourcc, fps));
                    }
                }
            }
        }
        Ok(formats)
    }

    fn format(&self) -> Result<StreamFormat> {
        let fmt = self
            .device
            .format()
            .map_err(|err| CameraError::Stream(err.to_string()))?;
        Ok(
            StreamFormat::new(fmt.width, fmt.height, FourCC::from(fmt.fourcc), self.current_fps())
                .with_stride(fmt.stride),
        )
    }

    fn set_format(&mut self, format: &StreamFormat) -> Result<StreamFormat> {
        let label = self.label();
        let mut fmt = self
            .device
            .format()
            .map_err(|err| stream_error(&label, &err))?;

        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();

        let fmt = self
            .device
            .set_format(&fmt)
            .map_err(|err| stream_error(&label, &err))?;

        // Not every driver lets us pick a rate; report what it runs at.
        let fps = if format.fps == 0 {
            self.current_fps()
        } else {
            match self.device.set_params(&Parameters::with_fps(format.fps)) {
                Ok(params) => fps_of(params.interval),
                Err(err) => {
                    log::debug!("{label}: frame rate not settable: {err}");
                    self.current_fps()
                }
            }
        };

        Ok(StreamFormat::new(
            fmt.width,
            fmt.height,
            FourCC::from(fmt.fourcc),
            if fps == 0 { format.fps } else { fps },
        )
        .with_stride(fmt.stride))
    }

    fn request_buffers(&mut self, count: u32) -> Result<Self::Queue<'_>> {
        let label = self.label();
        let stream = Stream::with_buffers(&self.device, Type::VideoCapture, count)
            .map_err(|err| stream_error(&label, &err))?;

        Ok(V4l2Queue {
            stream,
            count: count as usize,
            cursor: 0,
            held: None,
            started: false,
            restart: false,
            timeout: DEFAULT_TIMEOUT,
        })
    }
}

/// mmap buffer queue of a [`V4L2Device`].
///
/// The v4l stream queues every buffer and issues STREAMON on its first
/// dequeue, and re-queues the previous buffer on each later one. This
/// adapter tracks which slot the consumer holds so the pool's ownership
/// checks see the same order the driver uses: buffers come back FIFO.
pub struct V4l2Queue<'a> {
    stream: Stream<'a>,
    count: usize,
    cursor: usize,
    held: Option<usize>,
    started: bool,
    restart: bool,
    timeout: Duration,
}

impl BufferQueue for V4l2Queue<'_> {
    fn buffer_count(&self) -> usize {
        self.count
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        self.stream.set_timeout(timeout);
    }

    fn stream_on(&mut self) -> Result<()> {
        self.started = true;
        self.restart = false;
        self.cursor = 0;
        Ok(())
    }

    fn dequeue(&mut self) -> Result<FilledBuffer<'_>> {
        if !self.started {
            return Err(CameraError::Stream("dequeue before stream on".to_owned()));
        }
        if let Some(index) = self.held {
            return Err(CameraError::BufferOwnership(format!(
                "buffer {index} still held by consumer"
            )));
        }
        if self.restart {
            // A timed-out wait leaves the previous buffer queued; stopping
            // hands every buffer back so the next call queues them all again.
            self.stream
                .stop()
                .map_err(|err| CameraError::Stream(err.to_string()))?;
            self.restart = false;
            self.cursor = 0;
        }

        let (data, meta) = match self.stream.next() {
            Ok(next) => next,
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                self.restart = true;
                return Err(CameraError::CaptureTimeout(self.timeout));
            }
            Err(err) => return Err(CameraError::Stream(err.to_string())),
        };

        let index = self.cursor;
        self.cursor = (self.cursor + 1) % self.count;
        self.held = Some(index);

        // The mapping is page-sized; only `bytesused` of it is frame.
        let used = (meta.bytesused as usize).min(data.len());
        Ok(FilledBuffer {
            index,
            data: data.get(..used).unwrap_or(data.as_slice()),
            sequence: meta.sequence,
        })
    }

    fn enqueue(&mut self, index: usize) -> Result<()> {
        match self.held {
            Some(held) if held == index => {
                self.held = None;
                Ok(())
            }
            _ => Err(CameraError::BufferOwnership(format!(
                "buffer {index} is not held"
            ))),
        }
    }

    fn stream_off(&mut self) -> Result<()> {
        self.started = false;
        self.restart = false;
        self.held = None;
        self.stream
            .stop()
            .map_err(|err| CameraError::Stream(err.to_string()))
    }
}

/// Sizes worth asking for from one frame-size entry. A range yields its
/// bounds and the size nearest the request.
fn candidate_sizes(size: &FrameSizeEnum, request: &FormatRequest) -> Vec<(u32, u32)> {
    match size {
        FrameSizeEnum::Discrete(discrete) => vec![(discrete.width, discrete.height)],
        FrameSizeEnum::Stepwise(step) => {
            let nearest = (
                snap(request.width, step.min_width, step.max_width, step.step_width),
                snap(request.height, step.min_height, step.max_height, step.step_height),
            );
            let mut sizes = vec![
                (step.min_width, step.min_height),
                nearest,
                (step.max_width, step.max_height),
            ];
            sizes.dedup();
            sizes
        }
    }
}

/// Rates worth asking for. A range yields its bounds and `wanted` clamped
/// into it.
fn candidate_rates<I>(intervals: I, wanted: u32) -> Vec<u32>
where
    I: IntoIterator<Item = FrameIntervalEnum>,
{
    let mut rates: Vec<u32> = intervals
        .into_iter()
        .flat_map(|interval| match interval {
            FrameIntervalEnum::Discrete(fraction) => vec![fps_of(fraction)],
            FrameIntervalEnum::Stepwise(step) => {
                // The shortest interval is the fastest rate.
                let fastest = fps_of(step.min);
                let slowest = fps_of(step.max);
                let (low, high) = (slowest.min(fastest), slowest.max(fastest));
                vec![low, wanted.clamp(low, high), high]
            }
        })
        .filter(|fps| *fps > 0)
        .collect();
    rates.sort_unstable();
    rates.dedup();
    rates
}

/// Clamp `value` into `[min, max]` and round it to the nearest step from
/// `min`.
fn snap(value: u32, min: u32, max: u32, step: u32) -> u32 {
    let max = max.max(min);
    let clamped = value.clamp(min, max);
    if step <= 1 {
        return clamped;
    }
    let down = min + (clamped - min) / step * step;
    match down.checked_add(step) {
        Some(up) if up <= max && up - clamped < clamped - down => up,
        _ => down,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn fps_of(interval: Fraction) -> u32 {
    if interval.numerator == 0 {
        0
    } else {
        (f64::from(interval.denominator) / f64::from(interval.numerator)).round() as u32
    }
}

fn open_error(device: &str, err: &io::Error) -> CameraError {
    if err.raw_os_error() == Some(EBUSY) {
        CameraError::DeviceBusy(device.to_owned())
    } else {
        CameraError::DeviceOpen {
            device: device.to_owned(),
            reason: err.to_string(),
        }
    }
}

fn stream_error(device: &str, err: &io::Error) -> CameraError {
    if err.raw_os_error() == Some(EBUSY) {
        CameraError::DeviceBusy(device.to_owned())
    } else {
        CameraError::Stream(err.to_string())
    }
}

/// A capture node found on this host.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Device node path.
    pub path: PathBuf,
    /// Node index (`/dev/videoN`).
    pub index: usize,
    /// Driver-reported name, if readable.
    pub name: Option<String>,
}

/// List V4L2 nodes present right now.
pub fn list_nodes() -> Vec<NodeInfo> {
    let mut nodes: Vec<NodeInfo> = v4l::context::enum_devices()
        .into_iter()
        .map(|node| NodeInfo {
            path: node.path().to_owned(),
            index: node.index(),
            name: node.name(),
        })
        .collect();
    nodes.sort_by_key(|node| node.index);
    nodes
}
