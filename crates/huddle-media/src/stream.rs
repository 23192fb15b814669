use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of media a user can publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Audio,
    Video,
    ShareNormal,
    ShareCamera,
    SharePureAudio,
}

impl StreamKind {
    pub fn is_share(self) -> bool {
        matches!(
            self,
            StreamKind::ShareNormal | StreamKind::ShareCamera | StreamKind::SharePureAudio
        )
    }

    /// Whether decoded frames of this kind are video frames.
    pub fn carries_video(self) -> bool {
        matches!(
            self,
            StreamKind::Video | StreamKind::ShareNormal | StreamKind::ShareCamera
        )
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamKind::Audio => "audio",
            StreamKind::Video => "video",
            StreamKind::ShareNormal => "share",
            StreamKind::ShareCamera => "share-camera",
            StreamKind::SharePureAudio => "share-audio",
        };
        f.write_str(name)
    }
}

/// Identifies one media stream: the publishing user and the stream kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub user_id: u64,
    pub kind: StreamKind,
}

impl StreamKey {
    /// User id reserved for the aggregate "every remote speaker" audio key.
    pub const ALL_USERS: u64 = 0;

    pub fn new(user_id: u64, kind: StreamKind) -> Self {
        Self { user_id, kind }
    }

    pub fn video(user_id: u64) -> Self {
        Self::new(user_id, StreamKind::Video)
    }

    pub fn audio(user_id: u64) -> Self {
        Self::new(user_id, StreamKind::Audio)
    }

    /// Audio of all remote users, frame by frame as they are decoded.
    pub fn all_audio() -> Self {
        Self::new(Self::ALL_USERS, StreamKind::Audio)
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.kind)
    }
}

/// Requested receive resolution for a video subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    P90,
    P180,
    #[default]
    P360,
    P720,
    P1080,
    Auto,
}

impl Resolution {
    /// 720p and above count against the high-resolution cap.
    pub fn is_high(self) -> bool {
        matches!(self, Resolution::P720 | Resolution::P1080)
    }

    /// Only one subscription may hold this tier at a time.
    pub fn is_exclusive(self) -> bool {
        matches!(self, Resolution::P1080)
    }

    /// Nominal frame height, `None` for `Auto`.
    pub fn height(self) -> Option<u32> {
        match self {
            Resolution::P90 => Some(90),
            Resolution::P180 => Some(180),
            Resolution::P360 => Some(360),
            Resolution::P720 => Some(720),
            Resolution::P1080 => Some(1080),
            Resolution::Auto => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_kinds() {
        assert!(StreamKind::ShareCamera.is_share());
        assert!(!StreamKind::Video.is_share());
        assert!(!StreamKind::SharePureAudio.carries_video());
    }

    #[test]
    fn tiers() {
        assert!(Resolution::P720.is_high());
        assert!(Resolution::P1080.is_exclusive());
        assert!(!Resolution::P720.is_exclusive());
        assert_eq!(Resolution::Auto.height(), None);
    }

    #[test]
    fn key_display() {
        assert_eq!(StreamKey::video(7).to_string(), "7/video");
    }
}
