//! Frame validation utilities for test pattern verification.
//!
//! These check decoded frames against the patterns the mock device and the
//! vivid virtual driver produce. Useful for integration testing.

use crate::convert::DecodedFrame;
use crate::error::{CameraError, Result};

/// Expected RGB values for SMPTE color bars (8 bars).
///
/// Colors in order: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
const SMPTE_COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 235, 235),
    (235, 235, 11),
    (12, 236, 237),
    (13, 237, 13),
    (237, 13, 237),
    (238, 14, 13),
    (15, 15, 239),
    (16, 16, 16),
];

/// Tolerance for RGB color matching (YUV->RGB rounding, JPEG loss).
const COLOR_TOLERANCE: u8 = 15;

/// Validates that a frame contains the SMPTE color bar pattern.
///
/// Samples the center of each of the 8 vertical bars on the middle row.
pub fn validate_color_bars(frame: &DecodedFrame) -> Result<()> {
    let bar_width = frame.width() / 8;
    let center_y = frame.height() / 2;
    if bar_width == 0 {
        return Err(CameraError::Validation(format!(
            "frame {}px wide is too narrow for 8 bars",
            frame.width()
        )));
    }

    for (bar, expected) in (0u32..).zip(SMPTE_COLOR_BARS) {
        let sample_x = bar * bar_width + bar_width / 2;
        let actual = sample(frame, sample_x, center_y)?;

        if !colors_match(actual, expected, COLOR_TOLERANCE) {
            return Err(CameraError::Validation(format!(
                "color bar {bar} at ({sample_x}, {center_y}): \
                 expected RGB{expected:?}, got RGB{actual:?}"
            )));
        }
    }

    Ok(())
}

/// Validates that a frame contains a horizontal gradient.
///
/// Luminance along the middle row must not fall (beyond rounding) from left
/// to right and must rise by at least 50 overall.
pub fn validate_gradient(frame: &DecodedFrame) -> Result<()> {
    let center_y = frame.height() / 2;
    let mut first: Option<f32> = None;
    let mut previous: Option<f32> = None;

    for x in (0..frame.width()).step_by(10) {
        let luminance = luma(sample(frame, x, center_y)?);

        if let Some(prev) = previous {
            if luminance < prev - 1.0 {
                return Err(CameraError::Validation(format!(
                    "gradient falls at x={x}: luminance {luminance} < previous {prev}"
                )));
            }
        }
        first.get_or_insert(luminance);
        previous = Some(luminance);
    }

    let change = match (first, previous) {
        (Some(first), Some(last)) => last - first,
        _ => 0.0,
    };
    if change < 50.0 {
        return Err(CameraError::Validation(format!(
            "luminance changes by {change} across the frame, expected at least 50"
        )));
    }

    Ok(())
}

/// Validates that every pixel of a frame is `expected` within `tolerance`.
pub fn validate_solid(frame: &DecodedFrame, expected: (u8, u8, u8), tolerance: u8) -> Result<()> {
    let mismatch = frame
        .rgb()
        .chunks_exact(3)
        .position(|pixel| match *pixel {
            [r, g, b] => !colors_match((r, g, b), expected, tolerance),
            _ => true,
        });

    match mismatch {
        None => Ok(()),
        Some(index) => {
            #[allow(clippy::cast_possible_truncation)]
            let x = (index % frame.width() as usize) as u32;
            #[allow(clippy::cast_possible_truncation)]
            let y = (index / frame.width() as usize) as u32;
            let actual = sample(frame, x, y)?;
            Err(CameraError::Validation(format!(
                "pixel ({x}, {y}) is RGB{actual:?}, expected RGB{expected:?}"
            )))
        }
    }
}

/// Validates that frame sequence numbers strictly increase.
///
/// Gaps are allowed: the feed keeps only the latest frame, so a reader
/// polling it sees a subset of what the driver delivered. A repeated or
/// backwards sequence number is an error.
pub fn validate_increasing_sequence(frames: &[DecodedFrame]) -> Result<()> {
    if frames.is_empty() {
        return Err(CameraError::Validation(
            "cannot validate an empty frame sequence".to_owned(),
        ));
    }

    for (index, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            if curr.sequence() <= prev.sequence() {
                return Err(CameraError::Validation(format!(
                    "frame {}: sequence {} does not follow {}",
                    index + 1,
                    curr.sequence(),
                    prev.sequence()
                )));
            }
        }
    }

    Ok(())
}

fn sample(frame: &DecodedFrame, x: u32, y: u32) -> Result<(u8, u8, u8)> {
    frame
        .pixel_at(x, y)
        .ok_or_else(|| CameraError::Validation(format!("no pixel at ({x}, {y})")))
}

/// Rec. 601 luma.
fn luma((r, g, b): (u8, u8, u8)) -> f32 {
    0.114f32.mul_add(f32::from(b), 0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)))
}

fn colors_match(actual: (u8, u8, u8), expected: (u8, u8, u8), tolerance: u8) -> bool {
    actual.0.abs_diff(expected.0) <= tolerance
        && actual.1.abs_diff(expected.1) <= tolerance
        && actual.2.abs_diff(expected.2) <= tolerance
}
