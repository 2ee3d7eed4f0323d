//! Instrumented fakes for testing without hardware.

use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};

use crate::convert::{convert, DecodedFrame};
use crate::error::{CameraError, Result};
use crate::feed::{CameraFeed, FeedId, FeedRegistry};
use crate::format::{FormatRequest, FourCC, StreamFormat};
use crate::mapped::DeviceOpener;
use crate::traits::{BufferQueue, CameraDevice, DeviceCapabilities, FilledBuffer};
use crate::usb::{FrameCallback, TransportFrame, UsbTransport, UvcStream};

/// How a mock queue behaves once streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueScript {
    /// Deliver a frame on every dequeue.
    Frames,
    /// Never deliver; every dequeue times out.
    AlwaysTimeout,
    /// Time out this many times, then deliver frames.
    TimeoutsThenFrames(u32),
    /// Fail to turn streaming on.
    FailStreamOn,
    /// Refuse to map buffers.
    FailAllocation,
    /// Deliver payloads too short for the format.
    ShortFrames,
}

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

/// Every buffer event a mock device saw, shared across its clones.
#[derive(Debug, Default)]
pub struct BufferLedger {
    /// Buffer sets mapped.
    pub allocations: usize,
    /// Buffers handed to a consumer.
    pub dequeued: usize,
    /// Buffers handed back.
    pub released: usize,
    /// Buffer sets unmapped.
    pub freed: usize,
    /// Ownership rules that were broken.
    pub violations: Vec<String>,
}

/// Mock device for testing without hardware.
#[derive(Clone)]
pub struct MockDevice {
    capabilities: DeviceCapabilities,
    format: StreamFormat,
    supported: Vec<StreamFormat>,
    script: QueueScript,
    pattern: TestPattern,
    busy: bool,
    row_padding: u32,
    frame_interval: Duration,
    frame_count: Arc<AtomicU64>,
    ledger: Arc<Mutex<BufferLedger>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Create a new mock device with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                can_capture: true,
                can_stream: true,
            },
            format: StreamFormat::new(640, 480, FourCC::YUYV, 30),
            supported: Vec::new(),
            script: QueueScript::Frames,
            pattern: TestPattern::ColorBars,
            busy: false,
            row_padding: 0,
            frame_interval: Duration::from_millis(1),
            frame_count: Arc::new(AtomicU64::new(0)),
            ledger: Arc::new(Mutex::new(BufferLedger::default())),
        }
    }

    /// Set the current format.
    #[must_use]
    pub const fn with_format(mut self, format: StreamFormat) -> Self {
        self.format = format;
        self
    }

    /// Formats the device reports. Empty means it cannot enumerate and
    /// accepts whatever it is asked for.
    #[must_use]
    pub fn with_supported(mut self, supported: Vec<StreamFormat>) -> Self {
        self.supported = supported;
        self
    }

    /// Queue behaviour.
    #[must_use]
    pub const fn with_script(mut self, script: QueueScript) -> Self {
        self.script = script;
        self
    }

    /// Pattern written into delivered frames.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Report the device as in use by someone else.
    #[must_use]
    pub const fn with_busy(mut self) -> Self {
        self.busy = true;
        self
    }

    /// Pad every raw row with `bytes` of driver padding.
    #[must_use]
    pub const fn with_row_padding(mut self, bytes: u32) -> Self {
        self.row_padding = bytes;
        self
    }

    /// Shared buffer ledger.
    pub fn ledger(&self) -> Arc<Mutex<BufferLedger>> {
        Arc::clone(&self.ledger)
    }

    fn record<F: FnOnce(&mut BufferLedger)>(&self, event: F) {
        let mut ledger = self
            .ledger
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        event(&mut ledger);
    }

    /// Driver-style adjustment: keep the encoding if supported, snap to the
    /// nearest size and rate. Unknown encodings are replaced.
    fn adjust(&self, wanted: &StreamFormat) -> StreamFormat {
        let same_fourcc: Vec<&StreamFormat> = self
            .supported
            .iter()
            .filter(|format| format.fourcc == wanted.fourcc)
            .collect();
        let pool: Vec<&StreamFormat> = if same_fourcc.is_empty() {
            self.supported.iter().collect()
        } else {
            same_fourcc
        };

        pool.into_iter()
            .min_by_key(|format| {
                (
                    format.width.abs_diff(wanted.width) + format.height.abs_diff(wanted.height),
                    format.fps.abs_diff(wanted.fps),
                )
            })
            .copied()
            .unwrap_or(*wanted)
    }
}

impl CameraDevice for MockDevice {
    type Queue<'a> = MockQueue<'a>;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn supported_formats(&self, _request: &FormatRequest) -> Result<Vec<StreamFormat>> {
        Ok(self.supported.clone())
    }

    fn format(&self) -> Result<StreamFormat> {
        Ok(self.format)
    }

    fn set_format(&mut self, format: &StreamFormat) -> Result<StreamFormat> {
        if self.busy {
            return Err(CameraError::DeviceBusy("mock".to_owned()));
        }
        let adjusted = self.adjust(format);
        self.format = match row_bytes(&adjusted) {
            Some(row) if self.row_padding > 0 => adjusted.with_stride(row + self.row_padding),
            _ => adjusted,
        };
        Ok(self.format)
    }

    fn request_buffers(&mut self, count: u32) -> Result<Self::Queue<'_>> {
        if self.script == QueueScript::FailAllocation {
            return Err(CameraError::Allocation("mock refused to map".to_owned()));
        }
        self.record(|ledger| ledger.allocations += 1);

        let size = frame_size(&self.format);
        let timeouts_left = match self.script {
            QueueScript::TimeoutsThenFrames(count) => count,
            _ => 0,
        };
        Ok(MockQueue {
            buffers: vec![vec![0; size]; count as usize],
            free: VecDeque::new(),
            streaming: false,
            timeout: Duration::from_secs(1),
            timeouts_left,
            device: self,
        })
    }
}

/// Mock buffer queue recording every ownership transfer.
pub struct MockQueue<'a> {
    device: &'a MockDevice,
    buffers: Vec<Vec<u8>>,
    free: VecDeque<usize>,
    streaming: bool,
    timeout: Duration,
    timeouts_left: u32,
}

impl MockQueue<'_> {
    fn time_out(&self) -> Result<FilledBuffer<'_>> {
        thread::sleep(self.timeout);
        Err(CameraError::CaptureTimeout(self.timeout))
    }
}

impl BufferQueue for MockQueue<'_> {
    fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn stream_on(&mut self) -> Result<()> {
        if self.device.script == QueueScript::FailStreamOn {
            return Err(CameraError::Stream("mock refused STREAMON".to_owned()));
        }
        self.free = (0..self.buffers.len()).collect();
        self.streaming = true;
        Ok(())
    }

    fn dequeue(&mut self) -> Result<FilledBuffer<'_>> {
        if !self.streaming {
            self.device
                .record(|ledger| ledger.violations.push("dequeue while stopped".to_owned()));
            return Err(CameraError::Stream("not streaming".to_owned()));
        }
        if self.device.script == QueueScript::AlwaysTimeout {
            return self.time_out();
        }
        if self.timeouts_left > 0 {
            self.timeouts_left -= 1;
            return self.time_out();
        }
        let Some(index) = self.free.pop_front() else {
            self.device
                .record(|ledger| ledger.violations.push("dequeue with no queued buffer".to_owned()));
            return Err(CameraError::Stream("no queued buffer".to_owned()));
        };

        thread::sleep(self.device.frame_interval);
        let mut frame = pad_rows(
            generate_test_frame(&self.device.format, self.device.pattern),
            &self.device.format,
        );
        if self.device.script == QueueScript::ShortFrames {
            frame.truncate(frame.len() / 2);
        }
        #[allow(clippy::cast_possible_truncation)]
        let sequence = self.device.frame_count.fetch_add(1, Ordering::SeqCst) as u32;
        self.device.record(|ledger| ledger.dequeued += 1);

        let buffer = self
            .buffers
            .get_mut(index)
            .ok_or_else(|| CameraError::Stream(format!("no buffer {index}")))?;
        buffer.clear();
        buffer.extend_from_slice(&frame);

        Ok(FilledBuffer {
            index,
            data: buffer.as_slice(),
            sequence,
        })
    }

    fn enqueue(&mut self, index: usize) -> Result<()> {
        if self.free.contains(&index) {
            self.device
                .record(|ledger| ledger.violations.push(format!("buffer {index} released twice")));
            return Err(CameraError::BufferOwnership(format!("{index} already queued")));
        }
        // Scribble over the memory so a stale reader would see garbage.
        if let Some(buffer) = self.buffers.get_mut(index) {
            buffer.fill(0xDB);
        }
        self.free.push_back(index);
        self.device.record(|ledger| ledger.released += 1);
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.streaming = false;
        self.free.clear();
        Ok(())
    }
}

impl Drop for MockQueue<'_> {
    fn drop(&mut self) {
        let streaming = self.streaming;
        self.device.record(|ledger| {
            ledger.freed += 1;
            if streaming {
                ledger.violations.push("buffers unmapped while streaming".to_owned());
            }
        });
    }
}

/// Opens clones of one mock device.
pub struct MockOpener {
    device: MockDevice,
    fail: bool,
    opens: AtomicUsize,
}

impl MockOpener {
    /// Every open returns a clone of `device`.
    pub const fn new(device: MockDevice) -> Self {
        Self {
            device,
            fail: false,
            opens: AtomicUsize::new(0),
        }
    }

    /// Every open fails as if the node vanished.
    #[must_use]
    pub const fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Number of successful opens.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl DeviceOpener for MockOpener {
    type Device = MockDevice;

    fn open(&self, path: &Path) -> Result<MockDevice> {
        if self.fail {
            return Err(CameraError::DeviceOpen {
                device: path.display().to_string(),
                reason: "No such file or directory".to_owned(),
            });
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(self.device.clone())
    }
}

/// Fake UVC transport. Frames are pushed in with [`MockTransport::deliver`].
pub struct MockTransport {
    supported: Vec<StreamFormat>,
    fail_wrap: bool,
    fail_stream: bool,
    live: Arc<AtomicUsize>,
    callback: Arc<Mutex<Option<FrameCallback>>>,
}

impl MockTransport {
    /// A transport whose streams advertise and accept exactly these
    /// formats, rate aside.
    pub fn new(supported: Vec<StreamFormat>) -> Self {
        Self {
            supported,
            fail_wrap: false,
            fail_stream: false,
            live: Arc::new(AtomicUsize::new(0)),
            callback: Arc::new(Mutex::new(None)),
        }
    }

    /// Wrapping any descriptor fails.
    #[must_use]
    pub const fn failing_wrap(mut self) -> Self {
        self.fail_wrap = true;
        self
    }

    /// Opening a stream fails.
    #[must_use]
    pub const fn failing_stream(mut self) -> Self {
        self.fail_stream = true;
        self
    }

    /// Wrapped handles not yet released.
    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Act as the transport thread: hand one frame to the streaming
    /// callback. Returns `false` if nothing is streaming.
    pub fn deliver(&self, data: &[u8], format: StreamFormat, sequence: u32) -> bool {
        let mut slot = self
            .callback
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(callback) = slot.as_mut() else {
            return false;
        };
        // The buffer is reused once the callback returns.
        let mut transfer = data.to_vec();
        callback(&TransportFrame {
            data: &transfer,
            width: format.width,
            height: format.height,
            fourcc: format.fourcc,
            sequence,
        });
        transfer.fill(0);
        true
    }
}

/// Wrapped USB handle of a [`MockTransport`].
pub struct MockUsbHandle {
    live: Arc<AtomicUsize>,
}

impl Drop for MockUsbHandle {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Stream handle of a [`MockTransport`].
pub struct MockUvcStream {
    supported: Vec<StreamFormat>,
    callback: Arc<Mutex<Option<FrameCallback>>>,
}

impl UvcStream for MockUvcStream {
    fn supported_formats(&self) -> Result<Vec<StreamFormat>> {
        Ok(self.supported.clone())
    }

    fn probe_format(&mut self, format: &StreamFormat) -> Result<StreamFormat> {
        self.supported
            .iter()
            .filter(|supported| {
                supported.fourcc == format.fourcc
                    && supported.width == format.width
                    && supported.height == format.height
            })
            .min_by_key(|supported| supported.fps.abs_diff(format.fps))
            .copied()
            .ok_or_else(|| CameraError::Stream(format!("probe rejected {format}")))
    }

    fn start_streaming(&mut self, _format: &StreamFormat, callback: FrameCallback) -> Result<()> {
        *self
            .callback
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(callback);
        Ok(())
    }

    fn stop_streaming(&mut self) {
        // Taking the lock waits out a callback in flight.
        self.callback
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
    }
}

impl UsbTransport for MockTransport {
    type Device = MockUsbHandle;
    type Stream = MockUvcStream;

    fn wrap_sys_device(&self, fd: RawFd) -> Result<MockUsbHandle> {
        if self.fail_wrap {
            return Err(CameraError::TransportWrap(format!("fd {fd} is not a USB device")));
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(MockUsbHandle {
            live: Arc::clone(&self.live),
        })
    }

    fn open_stream(&self, _device: &MockUsbHandle) -> Result<MockUvcStream> {
        if self.fail_stream {
            return Err(CameraError::StreamOpen("no streaming interface".to_owned()));
        }
        Ok(MockUvcStream {
            supported: self.supported.clone(),
            callback: Arc::clone(&self.callback),
        })
    }
}

/// In-memory feed registry.
#[derive(Default)]
pub struct MemoryRegistry {
    next: AtomicU64,
    feeds: Mutex<HashMap<FeedId, Arc<CameraFeed>>>,
    notified: Mutex<Vec<(FeedId, u32)>>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registered feed count.
    pub fn len(&self) -> usize {
        self.lock_feeds().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.lock_feeds().is_empty()
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: FeedId) -> bool {
        self.lock_feeds().contains_key(&id)
    }

    /// Every `(feed, sequence)` notification received so far.
    pub fn notified(&self) -> Vec<(FeedId, u32)> {
        self.notified
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn lock_feeds(&self) -> std::sync::MutexGuard<'_, HashMap<FeedId, Arc<CameraFeed>>> {
        self.feeds
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl FeedRegistry for MemoryRegistry {
    fn register(&self, feed: Arc<CameraFeed>) -> FeedId {
        let id = FeedId(self.next.fetch_add(1, Ordering::SeqCst));
        self.lock_feeds().insert(id, feed);
        id
    }

    fn unregister(&self, id: FeedId) {
        let removed = self.lock_feeds().remove(&id);
        drop(removed);
    }

    fn notify_frame(&self, id: FeedId, frame: Arc<DecodedFrame>) {
        self.notified
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((id, frame.sequence()));
    }
}

fn frame_size(format: &StreamFormat) -> usize {
    let pixels = format.width as usize * format.height as usize;
    let packed = match format.fourcc {
        FourCC::RGB3 | FourCC::BGR3 => pixels * 3,
        // Compressed frames fit comfortably in the raw size.
        _ => pixels * 2,
    };
    packed.max(format.stride as usize * format.height as usize)
}

/// Bytes in one unpadded row, for raw encodings.
fn row_bytes(format: &StreamFormat) -> Option<u32> {
    match format.fourcc {
        FourCC::YUYV => Some(format.width * 2),
        FourCC::RGB3 | FourCC::BGR3 => Some(format.width * 3),
        _ => None,
    }
}

/// Spread packed rows `format.stride` bytes apart, padding with 0xAA.
fn pad_rows(frame: Vec<u8>, format: &StreamFormat) -> Vec<u8> {
    let Some(row) = row_bytes(format).map(|row| row as usize) else {
        return frame;
    };
    let stride = format.stride as usize;
    if stride <= row || row == 0 {
        return frame;
    }
    let mut padded = Vec::with_capacity(stride * format.height as usize);
    for line in frame.chunks_exact(row) {
        padded.extend_from_slice(line);
        padded.resize(padded.len() + stride - row, 0xAA);
    }
    padded
}

/// Generate a frame of `pattern` in the encoding of `format`.
pub fn generate_test_frame(format: &StreamFormat, pattern: TestPattern) -> Vec<u8> {
    let mut yuyv = vec![0u8; format.width as usize * format.height as usize * 2];
    match pattern {
        TestPattern::ColorBars => generate_color_bars(&mut yuyv, format.width, format.height),
        TestPattern::Gradient => generate_gradient(&mut yuyv, format.width, format.height),
        TestPattern::Solid(y, u, v) => generate_solid(&mut yuyv, y, u, v),
    }

    match format.fourcc {
        FourCC::YUYV => yuyv,
        fourcc => {
            let rgb = convert(&yuyv, format.width, format.height, FourCC::YUYV)
                .map(DecodedFrame::into_rgb)
                .unwrap_or_default();
            match fourcc {
                FourCC::MJPG => encode_jpeg(&rgb, format.width, format.height),
                FourCC::BGR3 => rgb
                    .chunks_exact(3)
                    .flat_map(|pixel| pixel.iter().rev().copied())
                    .collect(),
                _ => rgb,
            }
        }
    }
}

/// A solid YUYV frame.
pub fn solid_yuyv(width: u32, height: u32, y: u8, u: u8, v: u8) -> Vec<u8> {
    let mut data = vec![0u8; width as usize * height as usize * 2];
    generate_solid(&mut data, y, u, v);
    data
}

/// A solid-color JPEG.
pub fn jpeg_frame(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, image::Rgb(rgb));
    encode_jpeg(image.as_raw(), width, height)
}

fn encode_jpeg(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let mut out = Vec::new();
    if let Err(err) =
        JpegEncoder::new_with_quality(&mut out, 95).encode(rgb, width, height, ExtendedColorType::Rgb8)
    {
        log::error!("mock jpeg encode: {err}");
    }
    out
}

/// YUYV values for the 8 SMPTE bars: white, yellow, cyan, green, magenta,
/// red, blue, black.
const BARS_YUV: [(u8, u8, u8); 8] = [
    (235, 128, 128),
    (210, 16, 146),
    (170, 166, 16),
    (145, 54, 34),
    (106, 202, 222),
    (81, 90, 240),
    (41, 240, 110),
    (16, 128, 128),
];

fn generate_color_bars(data: &mut [u8], width: u32, height: u32) {
    let bar_width = (width / 8).max(1);
    let row_bytes = width as usize * 2;

    for row in data.chunks_exact_mut(row_bytes).take(height as usize) {
        for (pair, group) in row.chunks_exact_mut(4).enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let x = (pair * 2) as u32;
            let bar = ((x / bar_width) as usize).min(BARS_YUV.len() - 1);
            let (y, u, v) = BARS_YUV.get(bar).copied().unwrap_or((16, 128, 128));
            group.copy_from_slice(&[y, u, y, v]);
        }
    }
}

fn generate_gradient(data: &mut [u8], width: u32, height: u32) {
    let row_bytes = width as usize * 2;

    for row in data.chunks_exact_mut(row_bytes).take(height as usize) {
        for (pair, group) in row.chunks_exact_mut(4).enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let y = ((pair as u32 * 2 * 255) / width) as u8;
            group.copy_from_slice(&[y, 128, y, 128]);
        }
    }
}

fn generate_solid(data: &mut [u8], y: u8, u: u8, v: u8) {
    for group in data.chunks_exact_mut(4) {
        group.copy_from_slice(&[y, u, y, v]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_device_creation() {
        let device = MockDevice::new();
        assert_eq!(device.capabilities().driver, "mock");
        assert!(device.capabilities().can_capture);
        assert!(device.capabilities().can_stream);
    }

    #[test]
    fn test_set_format_snaps_to_supported() {
        let mut device = MockDevice::new().with_supported(vec![
            StreamFormat::new(320, 240, FourCC::YUYV, 30),
            StreamFormat::new(1280, 720, FourCC::YUYV, 10),
        ]);
        let actual = device
            .set_format(&StreamFormat::new(1280, 700, FourCC::YUYV, 30))
            .expect("set_format");
        assert_eq!(actual, StreamFormat::new(1280, 720, FourCC::YUYV, 10));
        assert_eq!(device.format().expect("format"), actual);
    }

    #[test]
    fn test_queue_hands_out_buffers_in_order() {
        let mut device = MockDevice::new().with_format(StreamFormat::new(8, 2, FourCC::YUYV, 30));
        let ledger = device.ledger();
        {
            let mut queue = device.request_buffers(3).expect("queue");
            queue.stream_on().expect("stream on");
            let first = queue.dequeue().expect("dequeue").index;
            queue.enqueue(first).expect("enqueue");
            assert!(queue.enqueue(first).is_err());
            queue.stream_off().expect("stream off");
        }
        let ledger = ledger.lock().expect("ledger");
        assert_eq!(ledger.freed, 1);
        assert_eq!(ledger.violations, vec!["buffer 0 released twice".to_owned()]);
    }

    #[test]
    fn test_row_padding_sets_stride() {
        let mut device = MockDevice::new().with_row_padding(16);
        let actual = device
            .set_format(&StreamFormat::new(8, 2, FourCC::YUYV, 30))
            .expect("set_format");
        assert_eq!(actual.stride, 8 * 2 + 16);

        let mut queue = device.request_buffers(2).expect("queue");
        queue.stream_on().expect("stream on");
        assert_eq!(queue.dequeue().expect("dequeue").data.len(), 32 * 2);
    }

    #[test]
    fn test_color_bars_pattern() {
        let format = StreamFormat::new(640, 480, FourCC::YUYV, 30);
        let data = generate_test_frame(&format, TestPattern::ColorBars);
        assert_eq!(data.len(), 640 * 480 * 2);
        // First bar is white.
        assert_eq!(data[0], 235);
    }

    #[test]
    fn test_gradient_pattern() {
        let format = StreamFormat::new(640, 480, FourCC::YUYV, 30);
        let data = generate_test_frame(&format, TestPattern::Gradient);
        assert!(data[0] < 10);
        let last_row_start = 479 * 640 * 2;
        assert!(data[last_row_start + 638 * 2] > 200);
    }

    #[test]
    fn test_mjpeg_pattern_decodes() {
        let format = StreamFormat::new(32, 16, FourCC::MJPG, 30);
        let data = generate_test_frame(&format, TestPattern::Solid(128, 128, 128));
        let frame = convert(&data, 32, 16, FourCC::MJPG).expect("decode");
        let (r, g, b) = frame.pixel_at(4, 4).expect("pixel");
        assert!(r.abs_diff(128) < 8 && g.abs_diff(128) < 8 && b.abs_diff(128) < 8);
    }
}
