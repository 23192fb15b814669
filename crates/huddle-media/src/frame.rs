//! Raw frame types shared by capture, decode and consumers.
//!
//! Video frames are planar I420 with an explicit stride per plane. The
//! rotation tag travels with the frame; pixels are never rotated in place.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    None,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn degrees(self) -> u16 {
        match self {
            Rotation::None => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    pub fn from_degrees(degrees: u16) -> Option<Self> {
        match degrees {
            0 => Some(Rotation::None),
            90 => Some(Rotation::Deg90),
            180 => Some(Rotation::Deg180),
            270 => Some(Rotation::Deg270),
            _ => None,
        }
    }

    pub(crate) fn to_wire(self) -> u8 {
        (self.degrees() / 90) as u8
    }

    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        Self::from_degrees(u16::from(value) * 90)
    }
}

/// Luma/chroma quantization range of an I420 frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub enum ColorRange {
    /// Y in 16..=235, UV in 16..=240.
    #[default]
    Limited,
    /// Y and UV in 0..=255.
    Full,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("{plane} stride {stride} is smaller than the row width {min}")]
    StrideTooSmall {
        plane: &'static str,
        stride: u32,
        min: u32,
    },
    #[error("{plane} plane holds {actual} bytes, expected at least {expected}")]
    PlaneTooShort {
        plane: &'static str,
        actual: usize,
        expected: usize,
    },
    #[error("invalid audio format: {0}")]
    InvalidAudioFormat(String),
}

/// A planar I420 video frame.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    width: u32,
    height: u32,
    y: Bytes,
    u: Bytes,
    v: Bytes,
    stride_y: u32,
    stride_u: u32,
    stride_v: u32,
    pub rotation: Rotation,
    pub color_range: ColorRange,
    pub timestamp_us: u64,
}

fn plane_len(stride: u32, row_width: u32, rows: u32) -> usize {
    if rows == 0 {
        return 0;
    }
    (stride as usize)
        .saturating_mul(rows as usize - 1)
        .saturating_add(row_width as usize)
}

/// Luma and chroma plane sizes of a packed frame. Dimensions whose total
/// size does not fit in `usize` are rejected.
fn packed_plane_lens(width: u32, height: u32) -> Result<(usize, usize), FrameError> {
    let y_len = (width as usize).checked_mul(height as usize);
    let c_len = (width.div_ceil(2) as usize).checked_mul(height.div_ceil(2) as usize);
    match (y_len, c_len) {
        (Some(y_len), Some(c_len))
            if c_len
                .checked_mul(2)
                .and_then(|c| c.checked_add(y_len))
                .is_some() =>
        {
            Ok((y_len, c_len))
        }
        _ => Err(FrameError::InvalidDimensions { width, height }),
    }
}

fn check_plane(
    plane: &'static str,
    data: &Bytes,
    stride: u32,
    row_width: u32,
    rows: u32,
) -> Result<(), FrameError> {
    if stride < row_width {
        return Err(FrameError::StrideTooSmall {
            plane,
            stride,
            min: row_width,
        });
    }
    let expected = plane_len(stride, row_width, rows);
    if data.len() < expected {
        return Err(FrameError::PlaneTooShort {
            plane,
            actual: data.len(),
            expected,
        });
    }
    Ok(())
}

impl VideoFrame {
    /// Build a frame from three planes, validating strides and plane sizes.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        width: u32,
        height: u32,
        y: Bytes,
        u: Bytes,
        v: Bytes,
        stride_y: u32,
        stride_u: u32,
        stride_v: u32,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::InvalidDimensions { width, height });
        }
        let cw = width.div_ceil(2);
        let ch = height.div_ceil(2);
        check_plane("y", &y, stride_y, width, height)?;
        check_plane("u", &u, stride_u, cw, ch)?;
        check_plane("v", &v, stride_v, cw, ch)?;

        Ok(Self {
            width,
            height,
            y,
            u,
            v,
            stride_y,
            stride_u,
            stride_v,
            rotation: Rotation::None,
            color_range: ColorRange::Limited,
            timestamp_us: 0,
        })
    }

    /// Build a frame from a tightly packed I420 buffer (Y then U then V).
    pub fn from_packed(width: u32, height: u32, data: Bytes) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::InvalidDimensions { width, height });
        }
        let (y_len, c_len) = packed_plane_lens(width, height)?;
        if data.len() < y_len + 2 * c_len {
            return Err(FrameError::PlaneTooShort {
                plane: "packed",
                actual: data.len(),
                expected: y_len + 2 * c_len,
            });
        }
        let y = data.slice(0..y_len);
        let u = data.slice(y_len..y_len + c_len);
        let v = data.slice(y_len + c_len..y_len + 2 * c_len);
        let cw = width.div_ceil(2);
        Self::new(width, height, y, u, v, width, cw, cw)
    }

    /// A frame where every pixel has the same YUV value.
    pub fn filled(width: u32, height: u32, yuv: (u8, u8, u8)) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::InvalidDimensions { width, height });
        }
        let (y_len, c_len) = packed_plane_lens(width, height)?;
        let mut data = BytesMut::with_capacity(y_len + 2 * c_len);
        data.resize(y_len, yuv.0);
        data.resize(y_len + c_len, yuv.1);
        data.resize(y_len + 2 * c_len, yuv.2);
        Self::from_packed(width, height, data.freeze())
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_color_range(mut self, range: ColorRange) -> Self {
        self.color_range = range;
        self
    }

    pub fn with_timestamp(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn chroma_width(&self) -> u32 {
        self.width.div_ceil(2)
    }

    pub fn chroma_height(&self) -> u32 {
        self.height.div_ceil(2)
    }

    pub fn y(&self) -> &Bytes {
        &self.y
    }

    pub fn u(&self) -> &Bytes {
        &self.u
    }

    pub fn v(&self) -> &Bytes {
        &self.v
    }

    /// (Y, U, V) strides in bytes.
    pub fn strides(&self) -> (u32, u32, u32) {
        (self.stride_y, self.stride_u, self.stride_v)
    }

    /// Size after applying the rotation tag.
    pub fn display_size(&self) -> (u32, u32) {
        match self.rotation {
            Rotation::Deg90 | Rotation::Deg270 => (self.height, self.width),
            Rotation::None | Rotation::Deg180 => (self.width, self.height),
        }
    }

    /// Mutate the pixel data in place. Plane slices keep their strides.
    pub fn with_planes_mut<F>(&mut self, f: F)
    where
        F: FnOnce(&mut [u8], &mut [u8], &mut [u8]),
    {
        let mut y = BytesMut::from(&self.y[..]);
        let mut u = BytesMut::from(&self.u[..]);
        let mut v = BytesMut::from(&self.v[..]);
        f(&mut y, &mut u, &mut v);
        self.y = y.freeze();
        self.u = u.freeze();
        self.v = v.freeze();
    }

    /// Copy the visible pixels into a tightly packed I420 buffer.
    pub fn to_packed(&self) -> Vec<u8> {
        let cw = self.chroma_width();
        let ch = self.chroma_height();
        let mut out = Vec::with_capacity(
            self.width as usize * self.height as usize + 2 * cw as usize * ch as usize,
        );
        copy_rows(&mut out, &self.y, self.stride_y, self.width, self.height);
        copy_rows(&mut out, &self.u, self.stride_u, cw, ch);
        copy_rows(&mut out, &self.v, self.stride_v, cw, ch);
        out
    }

    /// Convert to packed RGB24 (BT.601), honoring the color range.
    pub fn to_rgb24(&self) -> Vec<u8> {
        let w = self.width as usize;
        let h = self.height as usize;
        let (sy, su, sv) = (
            self.stride_y as usize,
            self.stride_u as usize,
            self.stride_v as usize,
        );
        let mut rgb = vec![0u8; w * h * 3];

        for row in 0..h {
            for col in 0..w {
                let y_raw = self.y[row * sy + col] as f32;
                let u_raw = self.u[(row / 2) * su + (col / 2)] as f32 - 128.0;
                let v_raw = self.v[(row / 2) * sv + (col / 2)] as f32 - 128.0;

                let (y, u, v) = match self.color_range {
                    ColorRange::Full => (y_raw, u_raw, v_raw),
                    ColorRange::Limited => (
                        (y_raw - 16.0) * 255.0 / 219.0,
                        u_raw * 255.0 / 224.0,
                        v_raw * 255.0 / 224.0,
                    ),
                };

                let out = (row * w + col) * 3;
                rgb[out] = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
                rgb[out + 1] = (y - 0.344136 * u - 0.714136 * v).clamp(0.0, 255.0) as u8;
                rgb[out + 2] = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
            }
        }
        rgb
    }
}

fn copy_rows(out: &mut Vec<u8>, plane: &[u8], stride: u32, row_width: u32, rows: u32) {
    for row in 0..rows as usize {
        let start = row * stride as usize;
        out.extend_from_slice(&plane[start..start + row_width as usize]);
    }
}

/// Interleaved signed 16-bit PCM.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
    pub sample_rate: u32,
    pub channels: u16,
    pub timestamp_us: u64,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16) -> Result<Self, FrameError> {
        if sample_rate == 0 {
            return Err(FrameError::InvalidAudioFormat("sample rate is zero".into()));
        }
        if !(1..=2).contains(&channels) {
            return Err(FrameError::InvalidAudioFormat(format!(
                "unsupported channel count {channels}"
            )));
        }
        if samples.len() % channels as usize != 0 {
            return Err(FrameError::InvalidAudioFormat(
                "sample count is not a multiple of the channel count".into(),
            ));
        }
        Ok(Self {
            samples: samples.into(),
            sample_rate,
            channels,
            timestamp_us: 0,
        })
    }

    pub fn with_timestamp(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn samples_per_channel(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration_us(&self) -> u64 {
        self.samples_per_channel() as u64 * 1_000_000 / u64::from(self.sample_rate)
    }

    /// Loudness on a 0–9 scale. 0 is silence, 9 is full scale.
    ///
    /// RMS is mapped linearly over a 60 dB window below full scale.
    pub fn level(&self) -> u8 {
        if self.samples.is_empty() {
            return 0;
        }
        let sum: f64 = self.samples.iter().map(|&s| f64::from(s).powi(2)).sum();
        let rms = (sum / self.samples.len() as f64).sqrt();
        if rms < 1.0 {
            return 0;
        }
        let dbfs = 20.0 * (rms / 32768.0).log10();
        let scaled = ((dbfs + 60.0) / 60.0 * 9.0).round();
        scaled.clamp(0.0, 9.0) as u8
    }

    /// Samples multiplied by `gain`, saturating at the i16 range.
    pub fn scaled(&self, gain: f32) -> Vec<i16> {
        self.samples
            .iter()
            .map(|&s| (f32::from(s) * gain).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_packed_dimensions_are_rejected() {
        let err =
            VideoFrame::from_packed(u32::MAX, u32::MAX, Bytes::from(vec![0u8; 16])).unwrap_err();
        assert!(matches!(err, FrameError::InvalidDimensions { .. }));
        assert!(VideoFrame::filled(u32::MAX, u32::MAX, (0, 0, 0)).is_err());
    }

    #[test]
    fn rejects_short_planes() {
        let err = VideoFrame::new(
            4,
            4,
            Bytes::from(vec![0u8; 15]),
            Bytes::from(vec![0u8; 4]),
            Bytes::from(vec![0u8; 4]),
            4,
            2,
            2,
        )
        .unwrap_err();
        assert!(matches!(err, FrameError::PlaneTooShort { plane: "y", .. }));
    }

    #[test]
    fn rejects_stride_narrower_than_row() {
        let err = VideoFrame::new(
            4,
            2,
            Bytes::from(vec![0u8; 8]),
            Bytes::from(vec![0u8; 2]),
            Bytes::from(vec![0u8; 2]),
            3,
            2,
            2,
        )
        .unwrap_err();
        assert!(matches!(err, FrameError::StrideTooSmall { plane: "y", .. }));
    }

    #[test]
    fn padded_strides_pack_to_visible_pixels() {
        // 2x2 frame with 4-byte luma stride and 2-byte chroma stride.
        let y = Bytes::from(vec![1, 2, 9, 9, 3, 4]);
        let u = Bytes::from(vec![5]);
        let v = Bytes::from(vec![6]);
        let frame = VideoFrame::new(2, 2, y, u, v, 4, 2, 2).unwrap();
        assert_eq!(frame.to_packed(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn odd_dimensions_round_chroma_up() {
        let frame = VideoFrame::filled(3, 3, (16, 128, 128)).unwrap();
        assert_eq!(frame.chroma_width(), 2);
        assert_eq!(frame.chroma_height(), 2);
        assert_eq!(frame.to_packed().len(), 9 + 4 + 4);
    }

    #[test]
    fn rotation_swaps_display_size() {
        let frame = VideoFrame::filled(640, 360, (16, 128, 128))
            .unwrap()
            .with_rotation(Rotation::Deg90);
        assert_eq!(frame.display_size(), (360, 640));
        assert_eq!(Rotation::from_degrees(270), Some(Rotation::Deg270));
        assert_eq!(Rotation::from_degrees(45), None);
    }

    #[test]
    fn limited_range_black_and_white_map_to_extremes() {
        let black = VideoFrame::filled(2, 2, (16, 128, 128)).unwrap();
        assert!(black.to_rgb24().iter().all(|&c| c == 0));

        let white = VideoFrame::filled(2, 2, (235, 128, 128)).unwrap();
        assert!(white.to_rgb24().iter().all(|&c| c == 255));

        let full_white = VideoFrame::filled(2, 2, (255, 128, 128))
            .unwrap()
            .with_color_range(ColorRange::Full);
        assert!(full_white.to_rgb24().iter().all(|&c| c == 255));
    }

    #[test]
    fn planes_can_be_mutated() {
        let mut frame = VideoFrame::filled(2, 2, (16, 128, 128)).unwrap();
        frame.with_planes_mut(|y, _, _| y.fill(200));
        assert!(frame.y().iter().all(|&b| b == 200));
    }

    #[test]
    fn audio_level_spans_zero_to_nine() {
        let silence = AudioFrame::new(vec![0; 480], 48_000, 1).unwrap();
        assert_eq!(silence.level(), 0);

        let loud = AudioFrame::new(vec![i16::MAX; 480], 48_000, 1).unwrap();
        assert_eq!(loud.level(), 9);

        let quiet = AudioFrame::new(vec![100; 480], 48_000, 1).unwrap();
        assert!(quiet.level() < 3);
    }

    #[test]
    fn audio_rejects_bad_layout() {
        assert!(AudioFrame::new(vec![0; 3], 48_000, 2).is_err());
        assert!(AudioFrame::new(vec![0; 4], 0, 1).is_err());
        assert!(AudioFrame::new(vec![0; 4], 48_000, 3).is_err());
    }

    #[test]
    fn audio_duration_and_gain() {
        let frame = AudioFrame::new(vec![1000; 960], 48_000, 2).unwrap();
        assert_eq!(frame.duration_us(), 10_000);
        assert_eq!(frame.scaled(0.5)[0], 500);
        assert_eq!(frame.scaled(0.0)[0], 0);
    }
}
