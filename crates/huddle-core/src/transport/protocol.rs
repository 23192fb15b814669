//! Signaling wire format. Signals travel as JSON text frames.

use bytes::Bytes;
use huddle_media::{EncodedPacket, StreamKind};
use serde::{Deserialize, Serialize};

use crate::events::{
    CameraMove, ChatMessage, ChatPrivilege, HelpRequestResult, LeaveReason, MediaState, RecordingStatus,
    SubSessionInfo, SubSessionStatus, SubSessionUser, TranscriptMessage, TranscriptionStatus,
    UserInfo,
};

use super::TransportError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingAction {
    Start,
    Stop,
    Pause,
    Resume,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SubSessionRequest {
    Commit { names: Vec<String> },
    Withdraw,
    Start,
    Stop,
    Join { sub_session_id: String },
    ReturnToMain,
    RequestHelp,
    Broadcast { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CameraControlRequest {
    /// Ask `user_id` for control of their camera.
    Request { user_id: u64 },
    /// The camera owner answers a pending request.
    Respond { requester_id: u64, approve: bool },
    Move { user_id: u64, action: CameraMove, range: u32 },
    GiveUp { user_id: u64 },
    /// The camera owner takes control back.
    Revoke,
}

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientSignal {
    Leave,
    EndSession,
    RemoveUser { user_id: u64 },
    AssignHost { user_id: u64 },
    SetManager { user_id: u64, manager: bool },
    Rename { user_id: u64, name: String },
    SetAudio { connected: bool, muted: bool },
    MuteUser { user_id: u64 },
    AskUnmute { user_id: u64 },
    MuteAll { allow_unmute_by_self: bool },
    UnmuteAll,
    AllowUnmuteBySelf { allowed: bool },
    SetVideo { on: bool },
    SetShare { kind: StreamKind, state: MediaState },
    LockShare { locked: bool },
    Spotlight { user_id: u64, on: bool },
    UnspotlightAll,
    Chat { id: String, to: Option<u64>, text: String },
    SetChatPrivilege { privilege: ChatPrivilege },
    Command { to: Option<u64>, payload: String },
    FileChunk(FileChunk),
    Recording { action: RecordingAction },
    Transcription { start: bool, language: Option<String> },
    SubSession(SubSessionRequest),
    HelpRequestResult {
        request_id: String,
        requester_id: u64,
        result: HelpRequestResult,
    },
    CameraControl(CameraControlRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub transfer_id: String,
    pub to: Option<u64>,
    pub name: String,
    pub total_size: u64,
    pub offset: u64,
    /// Base64 of the chunk bytes.
    pub data: String,
    pub last: bool,
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerSignal {
    UserJoined { users: Vec<UserInfo> },
    UserLeft { user_ids: Vec<u64> },
    HostChanged { user_id: u64 },
    ManagerChanged { user_id: u64, manager: bool },
    UserRenamed { user_id: u64, name: String },
    AudioStatus { user_id: u64, connected: bool, muted: bool },
    UnmuteRequested { by: u64 },
    UnmuteBySelfAllowed { allowed: bool },
    VideoStatus { user_id: u64, on: bool },
    ShareStatus { user_id: u64, kind: StreamKind, state: MediaState },
    ShareLocked { locked: bool },
    Spotlight { user_ids: Vec<u64> },
    Chat { message: ChatMessage },
    ChatPrivilege { privilege: ChatPrivilege },
    Command { from: u64, payload: String },
    FileChunk { from: u64, chunk: FileChunk },
    RecordingStatus { status: RecordingStatus },
    TranscriptionStatus { status: TranscriptionStatus },
    Transcript { message: TranscriptMessage },
    SubSessionStatus {
        status: SubSessionStatus,
        sub_sessions: Vec<SubSessionInfo>,
    },
    SubSessionFailed { status: SubSessionStatus, message: String },
    SubSessionUsers {
        sub_session_id: String,
        users: Vec<SubSessionUser>,
    },
    /// The receiver moved between the main session and a sub-session.
    /// `roster` is the roster of the place it moved into.
    Relocated {
        sub_session_id: Option<String>,
        roster: Vec<UserInfo>,
    },
    HelpRequested {
        request_id: String,
        requester_id: u64,
        requester_name: String,
        sub_session_id: String,
        sub_session_name: String,
    },
    HelpRequestResult { result: HelpRequestResult },
    SubSessionBroadcast { from_name: String, message: String },
    CameraControlRequested { by: u64 },
    CameraControlResult { user_id: u64, approved: bool },
    CameraMove { by: u64, action: CameraMove, range: u32 },
    CameraControlReleased { user_id: u64, controller_id: u64 },
    Removed { reason: LeaveReason },
    Error { code: u32, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransferPolicy {
    pub enabled: bool,
    /// Lowercase extensions without the dot.
    pub blocked_extensions: Vec<String>,
    pub max_bytes: u64,
}

impl Default for FileTransferPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            blocked_extensions: vec!["exe".into(), "bat".into(), "sh".into(), "msi".into()],
            max_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Session-wide switches as known at join time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionPolicy {
    pub chat_privilege: ChatPrivilege,
    pub share_locked: bool,
    pub allow_unmute_by_self: bool,
    pub file_transfer: FileTransferPolicy,
    pub recording: RecordingStatus,
    pub transcription: TranscriptionStatus,
    pub spotlighted: Vec<u64>,
    pub sub_session_status: SubSessionStatus,
    pub sub_sessions: Vec<SubSessionInfo>,
}

/// Opaque credential for resuming a dropped link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeToken(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub session_id: String,
    pub session_name: String,
    pub user_id: u64,
    pub resume_token: ResumeToken,
    pub roster: Vec<UserInfo>,
    pub password_protected: bool,
    pub policy: SessionPolicy,
}

/// One encoded media unit together with its publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPacket {
    pub sender_id: u64,
    pub packet: EncodedPacket,
}

pub fn encode_signal<T: Serialize>(signal: &T) -> Result<Bytes, TransportError> {
    serde_json::to_vec(signal)
        .map(Bytes::from)
        .map_err(|e| TransportError::Protocol(e.to_string()))
}

pub fn decode_signal<T: for<'de> Deserialize<'de>>(frame: &[u8]) -> Result<T, TransportError> {
    serde_json::from_slice(frame).map_err(|e| TransportError::Protocol(e.to_string()))
}
