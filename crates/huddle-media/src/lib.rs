//! Media plumbing for the huddle engine.
//!
//! Raw I420/PCM frame types, the encoder/decoder seam, and the fan-out of
//! decoded frames to subscribed consumers. This crate has no notion of a
//! session; `huddle-core` drives it.

pub mod codec;
pub mod fanout;
pub mod frame;
pub mod limiter;
pub mod stats;
pub mod stream;
pub mod subscription;

pub use codec::{
    AudioDecoder, AudioEncoder, CodecError, EncodedPacket, Packetizer, PcmCodec, RawVideoCodec,
    VideoDecoder, VideoEncoder,
};
pub use fanout::{ConsumerId, FanoutRouter, MediaPayload, RawDataConsumer, RawDataStatus};
pub use frame::{AudioFrame, ColorRange, FrameError, Rotation, VideoFrame};
pub use limiter::{CallRateLimiter, RateLimit};
pub use stats::{NetworkQuality, StatsTracker, StreamStatistics};
pub use stream::{Resolution, StreamKey, StreamKind};
pub use subscription::{SubscribeError, SubscriptionId, SubscriptionLimits, SubscriptionManager};
