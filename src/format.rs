//! Pixel encodings, stream formats and format negotiation.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::CameraError;

/// Pixel format representation (e.g., YUYV, MJPG, RGB3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
    /// BGR3 pixel format (24-bit BGR).
    pub const BGR3: Self = Self::new(b"BGR3");
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            let ch = if byte.is_ascii_graphic() || byte == b' ' {
                char::from(byte)
            } else {
                '.'
            };
            write!(f, "{ch}")?;
        }
        Ok(())
    }
}

impl FromStr for FourCC {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| CameraError::Config(format!("pixel format {s:?} is not a FourCC")))?;
        Ok(Self(bytes))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// A negotiated stream format. Immutable once a backend reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamFormat {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel encoding of the raw frames.
    pub fourcc: FourCC,
    /// Frame rate in frames per second.
    pub fps: u32,
    /// Bytes per row of a raw payload, padding included. 0 means rows are
    /// tightly packed.
    pub stride: u32,
}

impl StreamFormat {
    /// Create a new stream format with tightly packed rows.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC, fps: u32) -> Self {
        Self {
            width,
            height,
            fourcc,
            fps,
            stride: 0,
        }
    }

    /// The same format with rows `stride` bytes apart.
    #[must_use]
    pub const fn with_stride(mut self, stride: u32) -> Self {
        self.stride = stride;
        self
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} {} @ {}fps",
            self.width, self.height, self.fourcc, self.fps
        )
    }
}

/// Requested pixel encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum PixelPreference {
    /// Any encoding the converter understands, in backend priority order.
    #[default]
    Any,
    /// Exactly this encoding.
    Exact(FourCC),
}

impl PixelPreference {
    /// Whether frames in `fourcc` satisfy this preference and can be
    /// converted.
    #[must_use]
    pub fn accepts(self, fourcc: FourCC) -> bool {
        let wanted = match self {
            Self::Any => true,
            Self::Exact(wanted) => wanted == fourcc,
        };
        wanted && crate::convert::supports(fourcc)
    }

    /// Encodings to try, given a backend's priority order.
    #[must_use]
    pub fn candidates(self, priority: &[FourCC]) -> Vec<FourCC> {
        match self {
            Self::Any => priority.to_vec(),
            Self::Exact(fourcc) => vec![fourcc],
        }
    }
}

impl FromStr for PixelPreference {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("any") {
            Ok(Self::Any)
        } else {
            s.to_ascii_uppercase().parse().map(Self::Exact)
        }
    }
}

impl TryFrom<String> for PixelPreference {
    type Error = CameraError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for PixelPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any"),
            Self::Exact(fourcc) => write!(f, "{fourcc}"),
        }
    }
}

/// What a feed asks a device for. The negotiated result may differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FormatRequest {
    /// Target horizontal resolution.
    pub width: u32,
    /// Target vertical resolution.
    pub height: u32,
    /// Target frame rate.
    pub fps: u32,
    /// Preferred encoding or "any".
    pub pixel_format: PixelPreference,
}

impl FormatRequest {
    /// Create a request for any pixel encoding.
    #[must_use]
    pub const fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps,
            pixel_format: PixelPreference::Any,
        }
    }

    /// Restrict the request to one pixel encoding.
    #[must_use]
    pub const fn with_pixel_format(mut self, pixel_format: PixelPreference) -> Self {
        self.pixel_format = pixel_format;
        self
    }

    /// The request expressed as a concrete format in `fourcc`.
    #[must_use]
    pub const fn as_format(&self, fourcc: FourCC) -> StreamFormat {
        StreamFormat::new(self.width, self.height, fourcc, self.fps)
    }
}

impl Default for FormatRequest {
    fn default() -> Self {
        Self::new(640, 480, 30)
    }
}

impl fmt::Display for FormatRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} {} @ {}fps",
            self.width, self.height, self.pixel_format, self.fps
        )
    }
}

/// Order the formats a device supports by closeness to `request`.
///
/// Resolution distance dominates, then the backend's encoding priority,
/// then frame-rate distance. Formats the request does not accept are
/// dropped. When `supported` is empty (the device cannot enumerate), the
/// request itself is returned once per acceptable encoding.
#[must_use]
pub fn rank_candidates(
    request: &FormatRequest,
    supported: &[StreamFormat],
    priority: &[FourCC],
) -> Vec<StreamFormat> {
    let allowed = request.pixel_format.candidates(priority);

    if supported.is_empty() {
        return allowed
            .into_iter()
            .map(|fourcc| request.as_format(fourcc))
            .collect();
    }

    let mut ranked: Vec<StreamFormat> = supported
        .iter()
        .filter(|format| allowed.contains(&format.fourcc))
        .copied()
        .collect();

    ranked.sort_by_key(|format| {
        let resolution = u64::from(format.width.abs_diff(request.width))
            + u64::from(format.height.abs_diff(request.height));
        let encoding = allowed
            .iter()
            .position(|fourcc| *fourcc == format.fourcc)
            .unwrap_or(usize::MAX);
        let rate = format.fps.abs_diff(request.fps);
        (resolution, encoding, rate)
    });
    ranked.dedup();
    ranked
}
