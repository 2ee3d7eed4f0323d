//! camfeed: camera feeds over two capture backends.
//!
//! A [`CameraFeed`] wraps a capture backend, either V4L2 memory-mapped
//! capture ([`MappedBackend`]) or a UVC-style USB transport
//! ([`UsbStreamBackend`]), and keeps the most recent decoded RGB frame for
//! consumers. A [`CameraService`] discovers devices, builds feeds for them
//! and keeps a [`FeedRegistry`] in step with hot-plug events.
//!
//! Driver access sits behind traits so everything above it can be tested
//! with mock devices.

pub mod buffer;
pub mod capture_thread;
pub mod config;
pub mod convert;
pub mod device;
pub mod error;
pub mod feed;
pub mod format;
pub mod mapped;
pub mod service;
pub mod traits;
pub mod usb;
pub mod validation;

#[cfg(test)]
pub mod mock;

pub use config::CaptureConfig;
pub use convert::{convert, convert_with_stride, DecodedFrame};
pub use device::V4L2Device;
pub use error::{CameraError, FeedError, Result};
pub use feed::{CameraFeed, FeedId, FeedRegistry, FeedState, FeedStats, FrameSink};
pub use format::{FormatRequest, FourCC, PixelPreference, StreamFormat};
pub use mapped::{CaptureSettings, MappedBackend, V4l2Opener};
pub use service::{
    CameraService, DeviceDescriptor, DeviceId, DeviceLocator, RefreshPolicy, RefreshReport,
};
pub use traits::{BackendState, CameraDevice, CaptureBackend, DeviceCapabilities};
pub use usb::{UsbStreamBackend, UsbTransport, UvcStream};
