//! Huddle conferencing client engine.
//!
//! Session lifecycle, roster, media pipelines and the capability helpers
//! built on them. Pure Rust with no platform dependencies; consumed by
//! native UI shells through the `huddle-ffi` bindings.

pub mod audio;
pub mod audio_playout;
pub mod auth;
pub mod camera_control;
pub mod chat;
pub mod command;
pub mod config;
pub mod errors;
pub mod events;
pub mod file_transfer;
pub mod media;
pub mod recording;
pub mod roster;
pub mod session;
pub mod settings;
pub mod share;
pub mod subsession;
pub mod transport;
pub mod video;

#[cfg(test)]
mod test_support;

pub use audio::AudioHelper;
pub use audio_playout::AudioPlayoutBuffer;
pub use auth::{Credentials, JoinOptions, JoinRequest, Role, TokenIssuer};
pub use camera_control::{CameraControlResponder, RemoteCameraControlHelper};
pub use chat::ChatHelper;
pub use command::CommandChannel;
pub use config::{EngineConfig, ReconnectPolicy};
pub use errors::{Disposition, ErrorCategory, HuddleError};
pub use events::{EventEmitter, HuddleEvent};
pub use file_transfer::FileTransferHelper;
pub use media::MediaEngine;
pub use recording::{RecordingHelper, TranscriptionHelper};
pub use roster::Roster;
pub use session::SessionEngine;
pub use settings::{Settings, SettingsStore};
pub use share::ShareHelper;
pub use subsession::{HelpRequest, SubSessionHelper};
pub use transport::{LocalHub, SignalingTransport};
pub use video::{VideoHelper, VideoPreference};

pub use huddle_media::{
    AudioFrame, ColorRange, NetworkQuality, RawDataStatus, Resolution, Rotation, StreamKey,
    StreamKind, StreamStatistics, VideoFrame,
};
