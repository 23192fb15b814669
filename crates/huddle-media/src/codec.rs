//! Encoder/decoder seam.
//!
//! The shipped codecs are lossless packetizers: I420 planes and PCM samples
//! behind a small header. A compressing codec plugs in through the same
//! traits.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frame::{AudioFrame, ColorRange, FrameError, Rotation, VideoFrame};
use crate::stream::StreamKind;

const RAW_VIDEO_VERSION: u8 = 1;
const VIDEO_HEADER_LEN: usize = 1 + 4 + 4 + 1 + 1 + 8;
const AUDIO_HEADER_LEN: usize = 4 + 2 + 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload truncated: {0} bytes")]
    Truncated(usize),
    #[error("unsupported payload version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// One encoded unit travelling over the media plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub kind: StreamKind,
    pub sequence: u64,
    pub timestamp_us: u64,
    pub keyframe: bool,
    pub payload: Bytes,
}

pub trait VideoEncoder: Send {
    fn encode(&mut self, frame: &VideoFrame) -> Result<Bytes, CodecError>;
}

pub trait VideoDecoder: Send {
    fn decode(&mut self, payload: &[u8]) -> Result<VideoFrame, CodecError>;
}

pub trait AudioEncoder: Send {
    fn encode(&mut self, frame: &AudioFrame) -> Result<Bytes, CodecError>;
}

pub trait AudioDecoder: Send {
    fn decode(&mut self, payload: &[u8]) -> Result<AudioFrame, CodecError>;
}

/// Assigns monotonically increasing sequence numbers to encoded payloads.
#[derive(Debug)]
pub struct Packetizer {
    kind: StreamKind,
    next_sequence: u64,
}

impl Packetizer {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            next_sequence: 0,
        }
    }

    pub fn packetize(&mut self, payload: Bytes, timestamp_us: u64, keyframe: bool) -> EncodedPacket {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        EncodedPacket {
            kind: self.kind,
            sequence,
            timestamp_us,
            keyframe,
            payload,
        }
    }
}

/// Uncompressed I420 packetizer.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawVideoCodec;

impl VideoEncoder for RawVideoCodec {
    fn encode(&mut self, frame: &VideoFrame) -> Result<Bytes, CodecError> {
        let packed = frame.to_packed();
        let mut buf = BytesMut::with_capacity(VIDEO_HEADER_LEN + packed.len());
        buf.put_u8(RAW_VIDEO_VERSION);
        buf.put_u32(frame.width());
        buf.put_u32(frame.height());
        buf.put_u8(frame.rotation.to_wire());
        buf.put_u8(match frame.color_range {
            ColorRange::Limited => 0,
            ColorRange::Full => 1,
        });
        buf.put_u64(frame.timestamp_us);
        buf.put_slice(&packed);
        Ok(buf.freeze())
    }
}

impl VideoDecoder for RawVideoCodec {
    fn decode(&mut self, payload: &[u8]) -> Result<VideoFrame, CodecError> {
        if payload.len() < VIDEO_HEADER_LEN {
            return Err(CodecError::Truncated(payload.len()));
        }
        let mut cursor = payload;
        let version = cursor.get_u8();
        if version != RAW_VIDEO_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let width = cursor.get_u32();
        let height = cursor.get_u32();
        let rotation =
            Rotation::from_wire(cursor.get_u8()).ok_or(CodecError::MalformedHeader("rotation"))?;
        let color_range = match cursor.get_u8() {
            0 => ColorRange::Limited,
            1 => ColorRange::Full,
            _ => return Err(CodecError::MalformedHeader("color range")),
        };
        let timestamp_us = cursor.get_u64();

        let frame = VideoFrame::from_packed(width, height, Bytes::copy_from_slice(cursor))?
            .with_rotation(rotation)
            .with_color_range(color_range)
            .with_timestamp(timestamp_us);
        Ok(frame)
    }
}

/// Little-endian 16-bit PCM packetizer.
#[derive(Debug, Default, Clone, Copy)]
pub struct PcmCodec;

impl AudioEncoder for PcmCodec {
    fn encode(&mut self, frame: &AudioFrame) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(AUDIO_HEADER_LEN + frame.samples().len() * 2);
        buf.put_u32(frame.sample_rate);
        buf.put_u16(frame.channels);
        buf.put_u64(frame.timestamp_us);
        for &sample in frame.samples() {
            buf.put_i16_le(sample);
        }
        Ok(buf.freeze())
    }
}

impl AudioDecoder for PcmCodec {
    fn decode(&mut self, payload: &[u8]) -> Result<AudioFrame, CodecError> {
        if payload.len() < AUDIO_HEADER_LEN || (payload.len() - AUDIO_HEADER_LEN) % 2 != 0 {
            return Err(CodecError::Truncated(payload.len()));
        }
        let mut cursor = payload;
        let sample_rate = cursor.get_u32();
        let channels = cursor.get_u16();
        let timestamp_us = cursor.get_u64();
        let mut samples = Vec::with_capacity(cursor.len() / 2);
        while cursor.has_remaining() {
            samples.push(cursor.get_i16_le());
        }
        Ok(AudioFrame::new(samples, sample_rate, channels)?.with_timestamp(timestamp_us))
    }
}
