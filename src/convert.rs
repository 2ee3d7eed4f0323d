//! Frame conversion from raw device encodings to packed RGB.

use std::borrow::Cow;

use image::ImageFormat;

use crate::error::{CameraError, Result};
use crate::format::FourCC;

/// A converted, self-contained RGB image.
///
/// The pixel data is heap-allocated per frame and never aliases driver memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    width: u32,
    height: u32,
    sequence: u32,
    data: Vec<u8>,
}

impl DecodedFrame {
    /// Frame width in pixels.
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Frame height in pixels.
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Driver sequence number of the raw frame this was decoded from.
    pub const fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Interleaved RGB bytes, exactly `width * height * 3` long.
    pub fn rgb(&self) -> &[u8] {
        &self.data
    }

    /// Consume the frame and return its RGB bytes.
    pub fn into_rgb(self) -> Vec<u8> {
        self.data
    }

    /// Tag the frame with the driver sequence number.
    #[must_use]
    pub const fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    /// Get RGB values for a pixel at the specified coordinates.
    ///
    /// Returns `None` if the coordinates fall outside the frame.
    pub fn pixel_at(&self, x: u32, y: u32) -> Option<(u8, u8, u8)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        match self.data.get(offset..offset + 3)? {
            [r, g, b] => Some((*r, *g, *b)),
            _ => None,
        }
    }
}

/// Whether [`convert`] has a path from `fourcc` to RGB.
pub fn supports(fourcc: FourCC) -> bool {
    [FourCC::YUYV, FourCC::MJPG, FourCC::RGB3, FourCC::BGR3].contains(&fourcc)
}

/// Convert a tightly packed raw frame into an RGB image of the declared
/// dimensions.
///
/// Raw encodings must carry exactly the bytes the dimensions require.
/// Compressed payloads must decode to exactly the declared dimensions. On
/// any error nothing is produced.
pub fn convert(raw: &[u8], width: u32, height: u32, fourcc: FourCC) -> Result<DecodedFrame> {
    convert_with_stride(raw, width, height, fourcc, 0)
}

/// Like [`convert`], for raw frames whose rows are `stride` bytes apart.
///
/// The payload must be exactly `stride * height` bytes; the padding at the
/// end of each row is discarded. A stride of 0, or one shorter than a row,
/// means rows are packed. Compressed encodings ignore the stride.
pub fn convert_with_stride(
    raw: &[u8],
    width: u32,
    height: u32,
    fourcc: FourCC,
    stride: u32,
) -> Result<DecodedFrame> {
    let rows = Rows {
        width: width as usize,
        height: height as usize,
        stride: stride as usize,
    };

    let data = match fourcc {
        FourCC::YUYV => yuyv_to_rgb(&rows.unpadded(raw, 2)?),
        FourCC::RGB3 => rows.unpadded(raw, 3)?.into_owned(),
        FourCC::BGR3 => bgr_to_rgb(&rows.unpadded(raw, 3)?),
        FourCC::MJPG => decode_jpeg(raw, width, height)?,
        other => return Err(CameraError::UnsupportedFormat(other)),
    };

    Ok(DecodedFrame {
        width,
        height,
        sequence: 0,
        data,
    })
}

/// Row layout of a raw payload.
struct Rows {
    width: usize,
    height: usize,
    stride: usize,
}

impl Rows {
    /// The payload with row padding removed. Any length other than
    /// `stride * height` is rejected.
    fn unpadded<'a>(&self, raw: &'a [u8], bytes_per_pixel: usize) -> Result<Cow<'a, [u8]>> {
        let row = self.width * bytes_per_pixel;
        let stride = self.stride.max(row);
        let expected = stride * self.height;
        if raw.len() != expected {
            return Err(CameraError::TruncatedFrame {
                expected,
                actual: raw.len(),
            });
        }
        if stride == row || row == 0 {
            return Ok(Cow::Borrowed(raw));
        }

        let mut packed = Vec::with_capacity(row * self.height);
        for line in raw.chunks_exact(stride) {
            packed.extend(line.iter().take(row));
        }
        Ok(Cow::Owned(packed))
    }
}

/// Expand packed 4:2:2 `[Y0 U Y1 V]` groups into two RGB pixels each.
fn yuyv_to_rgb(raw: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(raw.len() / 2 * 3);
    let mut groups = raw.chunks_exact(4);

    for group in &mut groups {
        if let [y0, u, y1, v] = *group {
            let (r, g, b) = yuv_to_rgb(y0, u, v);
            rgb.extend_from_slice(&[r, g, b]);
            let (r, g, b) = yuv_to_rgb(y1, u, v);
            rgb.extend_from_slice(&[r, g, b]);
        }
    }
    // Odd pixel count: the last pixel has no V sample.
    if let [y0, u] = *groups.remainder() {
        let (r, g, b) = yuv_to_rgb(y0, u, 128);
        rgb.extend_from_slice(&[r, g, b]);
    }

    rgb
}

/// Convert YUV values to RGB.
///
/// Uses the ITU-R BT.601 conversion formula.
#[allow(clippy::many_single_char_names)]
pub(crate) fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y_f = f32::from(y);
    let u_f = f32::from(u) - 128.0;
    let v_f = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v_f, y_f);
    let g = 0.714_14f32.mul_add(-v_f, 0.344_14f32.mul_add(-u_f, y_f));
    let b = 1.772f32.mul_add(u_f, y_f);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let clamp = |val: f32| -> u8 { val.round().clamp(0.0, 255.0) as u8 };

    (clamp(r), clamp(g), clamp(b))
}

fn bgr_to_rgb(raw: &[u8]) -> Vec<u8> {
    let mut rgb = raw.to_vec();
    for pixel in rgb.chunks_exact_mut(3) {
        pixel.swap(0, 2);
    }
    rgb
}

fn decode_jpeg(raw: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let image = image::load_from_memory_with_format(raw, ImageFormat::Jpeg)
        .map_err(|err| CameraError::Conversion(err.to_string()))?;
    let rgb = image.into_rgb8();

    if rgb.width() != width || rgb.height() != height {
        return Err(CameraError::TruncatedFrame {
            expected: width as usize * height as usize * 3,
            actual: rgb.as_raw().len(),
        });
    }
    Ok(rgb.into_raw())
}
