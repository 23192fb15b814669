//! UniFFI bindings for huddle-core.
//!
//! Provides a HuddleClient object that wraps the SessionEngine, its helpers
//! and the settings store into a single FFI-safe interface. Clients meet on
//! a LoopbackHub, the in-process signaling server.

use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use huddle_core::events::{
    CameraMove as CoreCameraMove, ChatEvent as CoreChatEvent, ChatMessage as CoreChatMessage, HuddleEvent as CoreHuddleEvent,
    LeaveReason as CoreLeaveReason, MediaEvent as CoreMediaEvent, MediaState as CoreMediaState,
    RecordingEvent as CoreRecordingEvent, RecordingStatus as CoreRecordingStatus,
    RosterEvent as CoreRosterEvent, SessionEvent as CoreSessionEvent,
    SessionInfo as CoreSessionInfo, SessionState as CoreSessionState,
    ShareEvent as CoreShareEvent, SubSessionEvent as CoreSubSessionEvent,
    TranscriptionEvent as CoreTranscriptionEvent, UserInfo as CoreUserInfo,
};
use huddle_core::media::ports::{
    AudioFrameSender, AudioSourcePort, VideoFrameSender, VideoSourcePort,
};
use huddle_core::{
    AudioFrame, Disposition, EngineConfig, HuddleError, JoinOptions, JoinRequest, Role,
    StreamKind, VideoFrame,
};

uniffi::setup_scaffolding!();

const ENGINE_CONFIG_FILE: &str = "engine.json";

// ── Namespace functions ──────────────────────────────────────────────

/// Initialize tracing/logging. Call once from the host before using HuddleClient.
#[uniffi::export]
pub fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("huddle_core=debug,huddle_media=info,huddle_ffi=debug")
        });
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .init();
    });
}

// ── FFI-safe type conversions ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Enum)]
pub enum LeaveReason {
    BySelf,
    KickedByHost,
    EndedByHost,
    NetworkError,
    Unknown,
}

impl From<CoreLeaveReason> for LeaveReason {
    fn from(r: CoreLeaveReason) -> Self {
        match r {
            CoreLeaveReason::BySelf => Self::BySelf,
            CoreLeaveReason::KickedByHost => Self::KickedByHost,
            CoreLeaveReason::EndedByHost => Self::EndedByHost,
            CoreLeaveReason::NetworkError => Self::NetworkError,
            CoreLeaveReason::Unknown => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Enum)]
pub enum SessionState {
    Idle,
    Joining,
    InSession,
    Reconnecting { attempt: u32 },
    Left { reason: LeaveReason },
}

impl From<CoreSessionState> for SessionState {
    fn from(s: CoreSessionState) -> Self {
        match s {
            CoreSessionState::Idle => Self::Idle,
            CoreSessionState::Joining => Self::Joining,
            CoreSessionState::InSession => Self::InSession,
            CoreSessionState::Reconnecting { attempt } => Self::Reconnecting { attempt },
            CoreSessionState::Left(reason) => Self::Left {
                reason: reason.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Enum)]
pub enum MediaState {
    Off,
    On,
    Paused,
}

impl From<CoreMediaState> for MediaState {
    fn from(s: CoreMediaState) -> Self {
        match s {
            CoreMediaState::Off => Self::Off,
            CoreMediaState::On => Self::On,
            CoreMediaState::Paused => Self::Paused,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Enum)]
pub enum RecordingStatus {
    Stopped,
    Recording,
    Paused,
}

impl From<CoreRecordingStatus> for RecordingStatus {
    fn from(s: CoreRecordingStatus) -> Self {
        match s {
            CoreRecordingStatus::Stopped => Self::Stopped,
            CoreRecordingStatus::Recording => Self::Recording,
            CoreRecordingStatus::Paused => Self::Paused,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum VideoResolution {
    P90,
    P180,
    P360,
    P720,
    P1080,
    Auto,
}

impl From<huddle_core::Resolution> for VideoResolution {
    fn from(r: huddle_core::Resolution) -> Self {
        use huddle_core::Resolution;
        match r {
            Resolution::P90 => Self::P90,
            Resolution::P180 => Self::P180,
            Resolution::P360 => Self::P360,
            Resolution::P720 => Self::P720,
            Resolution::P1080 => Self::P1080,
            Resolution::Auto => Self::Auto,
        }
    }
}

impl From<VideoResolution> for huddle_core::Resolution {
    fn from(r: VideoResolution) -> Self {
        match r {
            VideoResolution::P90 => Self::P90,
            VideoResolution::P180 => Self::P180,
            VideoResolution::P360 => Self::P360,
            VideoResolution::P720 => Self::P720,
            VideoResolution::P1080 => Self::P1080,
            VideoResolution::Auto => Self::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum CaptureKind {
    Audio,
    Video,
    Share,
}

impl From<StreamKind> for CaptureKind {
    fn from(k: StreamKind) -> Self {
        match k {
            StreamKind::Audio => Self::Audio,
            StreamKind::Video => Self::Video,
            _ => Self::Share,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum CameraMove {
    Left,
    Right,
    Up,
    Down,
    ZoomIn,
    ZoomOut,
}

impl From<CoreCameraMove> for CameraMove {
    fn from(m: CoreCameraMove) -> Self {
        match m {
            CoreCameraMove::Left => Self::Left,
            CoreCameraMove::Right => Self::Right,
            CoreCameraMove::Up => Self::Up,
            CoreCameraMove::Down => Self::Down,
            CoreCameraMove::ZoomIn => Self::ZoomIn,
            CoreCameraMove::ZoomOut => Self::ZoomOut,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct SessionInfo {
    pub session_id: String,
    pub name: String,
    pub my_user_id: u64,
    pub password_protected: bool,
}

impl From<CoreSessionInfo> for SessionInfo {
    fn from(i: CoreSessionInfo) -> Self {
        Self {
            session_id: i.session_id,
            name: i.name,
            my_user_id: i.my_user_id,
            password_protected: i.password_protected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct UserInfo {
    pub user_id: u64,
    pub name: String,
    pub custom_id: Option<String>,
    pub is_host: bool,
    pub is_manager: bool,
    pub audio_connected: bool,
    pub is_muted: bool,
    pub audio_level: u8,
    pub video_on: bool,
    pub share_state: MediaState,
    pub in_sub_session: bool,
    pub spotlighted: bool,
}

impl From<CoreUserInfo> for UserInfo {
    fn from(u: CoreUserInfo) -> Self {
        Self {
            user_id: u.user_id,
            name: u.name,
            custom_id: u.custom_id,
            is_host: u.is_host,
            is_manager: u.is_manager,
            audio_connected: u.audio.connected,
            is_muted: u.audio.muted,
            audio_level: u.audio_level,
            video_on: u.video_on,
            share_state: u.share.state.into(),
            in_sub_session: u.in_sub_session,
            spotlighted: u.spotlighted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: u64,
    pub sender_name: String,
    pub receiver_id: Option<u64>,
    pub text: String,
    pub timestamp_ms: u64,
}

impl From<CoreChatMessage> for ChatMessage {
    fn from(m: CoreChatMessage) -> Self {
        Self {
            id: m.id,
            sender_id: m.sender_id,
            sender_name: m.sender_name,
            receiver_id: m.receiver_id,
            text: m.text,
            timestamp_ms: m.timestamp_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct Settings {
    pub display_name: Option<String>,
    pub transcription_language: Option<String>,
    pub mic_enabled_on_join: bool,
    pub camera_enabled_on_join: bool,
    pub preferred_resolution: VideoResolution,
}

impl From<huddle_core::Settings> for Settings {
    fn from(s: huddle_core::Settings) -> Self {
        Self {
            display_name: s.display_name,
            transcription_language: s.transcription_language,
            mic_enabled_on_join: s.mic_enabled_on_join,
            camera_enabled_on_join: s.camera_enabled_on_join,
            preferred_resolution: s.preferred_resolution.into(),
        }
    }
}

/// Flattened view of the engine events. Events without a dedicated
/// variant arrive as `Other` with a debug description.
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Enum)]
pub enum HuddleEvent {
    StateChanged { state: SessionState },
    Joined { info: SessionInfo },
    Left { reason: LeaveReason },
    PasswordRequired { wrong: bool },
    RequestFailed { code: u32, message: String },
    CommandReceived { sender_id: u64, payload: String },
    UsersJoined { users: Vec<UserInfo> },
    UsersLeft { user_ids: Vec<u64> },
    HostChanged { user_id: u64 },
    UserRenamed { user_id: u64, name: String },
    AudioStatusChanged { user_id: u64, connected: bool, muted: bool },
    UnmuteRequested { by: u64 },
    VideoStatusChanged { user_id: u64, on: bool },
    SpotlightChanged { user_ids: Vec<u64> },
    CaptureStarted { kind: CaptureKind },
    CaptureStopped { kind: CaptureKind },
    CameraControlRequested { by: u64 },
    CameraControlResult { user_id: u64, approved: bool },
    CameraMoveRequested { by: u64, action: CameraMove, range: u32 },
    CameraControlReleased { user_id: u64, controller_id: u64 },
    ShareStatusChanged { user_id: u64, state: MediaState },
    ShareLockChanged { locked: bool },
    ChatMessageReceived { message: ChatMessage },
    RecordingStatusChanged { status: RecordingStatus },
    TranscriptReceived { speaker_name: String, text: String, language: String },
    SubSessionEntered { sub_session_id: Option<String> },
    SubSessionBroadcast { from_name: String, message: String },
    Other { description: String },
}

impl From<CoreHuddleEvent> for HuddleEvent {
    fn from(e: CoreHuddleEvent) -> Self {
        match e {
            CoreHuddleEvent::Session(s) => match s {
                CoreSessionEvent::StateChanged(state) => Self::StateChanged {
                    state: state.into(),
                },
                CoreSessionEvent::Joined(info) => Self::Joined { info: info.into() },
                CoreSessionEvent::Left(reason) => Self::Left {
                    reason: reason.into(),
                },
                CoreSessionEvent::PasswordRequired { wrong } => Self::PasswordRequired { wrong },
                CoreSessionEvent::RequestFailed { code, message } => {
                    Self::RequestFailed { code, message }
                }
                CoreSessionEvent::CommandReceived { sender_id, payload } => {
                    Self::CommandReceived { sender_id, payload }
                }
            },
            CoreHuddleEvent::Roster(CoreRosterEvent::UsersJoined(users)) => Self::UsersJoined {
                users: users.into_iter().map(UserInfo::from).collect(),
            },
            CoreHuddleEvent::Roster(CoreRosterEvent::UsersLeft(users)) => Self::UsersLeft {
                user_ids: users.into_iter().map(|u| u.user_id).collect(),
            },
            CoreHuddleEvent::Roster(CoreRosterEvent::HostChanged { user_id }) => {
                Self::HostChanged { user_id }
            }
            CoreHuddleEvent::Roster(CoreRosterEvent::UserRenamed { user_id, name }) => {
                Self::UserRenamed { user_id, name }
            }
            CoreHuddleEvent::Media(CoreMediaEvent::AudioStatusChanged { user_id, status }) => {
                Self::AudioStatusChanged {
                    user_id,
                    connected: status.connected,
                    muted: status.muted,
                }
            }
            CoreHuddleEvent::Media(CoreMediaEvent::UnmuteRequested { by }) => {
                Self::UnmuteRequested { by }
            }
            CoreHuddleEvent::Media(CoreMediaEvent::VideoStatusChanged { user_id, on }) => {
                Self::VideoStatusChanged { user_id, on }
            }
            CoreHuddleEvent::Media(CoreMediaEvent::SpotlightChanged(user_ids)) => {
                Self::SpotlightChanged { user_ids }
            }
            CoreHuddleEvent::Media(CoreMediaEvent::CaptureStarted(kind)) => Self::CaptureStarted {
                kind: kind.into(),
            },
            CoreHuddleEvent::Media(CoreMediaEvent::CaptureStopped(kind)) => Self::CaptureStopped {
                kind: kind.into(),
            },
            CoreHuddleEvent::Media(CoreMediaEvent::CameraControlRequested { by }) => {
                Self::CameraControlRequested { by }
            }
            CoreHuddleEvent::Media(CoreMediaEvent::CameraControlResult { user_id, approved }) => {
                Self::CameraControlResult { user_id, approved }
            }
            CoreHuddleEvent::Media(CoreMediaEvent::CameraMoveRequested { by, action, range }) => {
                Self::CameraMoveRequested {
                    by,
                    action: action.into(),
                    range,
                }
            }
            CoreHuddleEvent::Media(CoreMediaEvent::CameraControlReleased {
                user_id,
                controller_id,
            }) => Self::CameraControlReleased {
                user_id,
                controller_id,
            },
            CoreHuddleEvent::Share(CoreShareEvent::StatusChanged { user_id, state, .. }) => {
                Self::ShareStatusChanged {
                    user_id,
                    state: state.into(),
                }
            }
            CoreHuddleEvent::Share(CoreShareEvent::LockChanged(locked)) => {
                Self::ShareLockChanged { locked }
            }
            CoreHuddleEvent::Chat(CoreChatEvent::MessageReceived(message)) => {
                Self::ChatMessageReceived {
                    message: message.into(),
                }
            }
            CoreHuddleEvent::Recording(CoreRecordingEvent::StatusChanged(status)) => {
                Self::RecordingStatusChanged {
                    status: status.into(),
                }
            }
            CoreHuddleEvent::Transcription(CoreTranscriptionEvent::Message(m)) => {
                Self::TranscriptReceived {
                    speaker_name: m.speaker_name,
                    text: m.text,
                    language: m.language,
                }
            }
            CoreHuddleEvent::SubSession(CoreSubSessionEvent::Entered { sub_session_id }) => {
                Self::SubSessionEntered { sub_session_id }
            }
            CoreHuddleEvent::SubSession(CoreSubSessionEvent::BroadcastMessage {
                from_name,
                message,
            }) => Self::SubSessionBroadcast { from_name, message },
            other => Self::Other {
                description: format!("{other:?}"),
            },
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────

/// Engine errors grouped by what the caller can do about them.
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum HuddleFfiError {
    #[error("[{code}] {msg}")]
    Retryable { code: u32, category: String, msg: String },
    #[error("[{code}] {msg}")]
    UserActionable { code: u32, category: String, msg: String },
    #[error("[{code}] {msg}")]
    Terminal { code: u32, category: String, msg: String },
}

impl HuddleFfiError {
    pub fn code(&self) -> u32 {
        match self {
            Self::Retryable { code, .. }
            | Self::UserActionable { code, .. }
            | Self::Terminal { code, .. } => *code,
        }
    }
}

impl From<HuddleError> for HuddleFfiError {
    fn from(e: HuddleError) -> Self {
        tracing::error!(code = e.code(), "HuddleError: {e}");
        let code = e.code();
        let category = format!("{:?}", e.category());
        let msg = e.to_string();
        match e.disposition() {
            Disposition::Retryable => Self::Retryable { code, category, msg },
            Disposition::UserActionable => Self::UserActionable { code, category, msg },
            Disposition::Terminal => Self::Terminal { code, category, msg },
        }
    }
}

// ── Callback interface ────────────────────────────────────────────────

#[uniffi::export(callback_interface)]
pub trait HuddleEventListener: Send + Sync {
    fn on_event(&self, event: HuddleEvent);
}

// ── Bridge listener: FFI callback → core listener ─────────────────────

struct BridgeListener {
    ffi_listener: Box<dyn HuddleEventListener>,
}

impl huddle_core::events::HuddleEventListener for BridgeListener {
    fn on_event(&self, event: CoreHuddleEvent) {
        self.ffi_listener.on_event(event.into());
    }
}

/// A host-side capture device. `on_start` means frames are wanted; push
/// them with `push_video_frame` or `push_audio_frame` until `on_stop`.
#[uniffi::export(callback_interface)]
pub trait CaptureSource: Send + Sync {
    fn on_start(&self);
    fn on_stop(&self);
}

// ── Bridge sources: FFI callback → core source ports ──────────────────

struct BridgeVideoSource {
    callback: Box<dyn CaptureSource>,
    sender: Arc<Mutex<Option<VideoFrameSender>>>,
}

impl VideoSourcePort for BridgeVideoSource {
    fn on_start(&self, sender: VideoFrameSender) {
        *self.sender.lock().expect("video sender lock poisoned") = Some(sender);
        self.callback.on_start();
    }

    fn on_stop(&self) {
        self.sender.lock().expect("video sender lock poisoned").take();
        self.callback.on_stop();
    }
}

struct BridgeAudioSource {
    callback: Box<dyn CaptureSource>,
    sender: Arc<Mutex<Option<AudioFrameSender>>>,
}

impl AudioSourcePort for BridgeAudioSource {
    fn on_start(&self, sender: AudioFrameSender) {
        *self.sender.lock().expect("audio sender lock poisoned") = Some(sender);
        self.callback.on_start();
    }

    fn on_stop(&self) {
        self.sender.lock().expect("audio sender lock poisoned").take();
        self.callback.on_stop();
    }
}

// ── LoopbackHub: in-process signaling server ──────────────────────────

#[derive(uniffi::Object)]
pub struct LoopbackHub {
    hub: huddle_core::LocalHub,
}

#[uniffi::export]
impl LoopbackHub {
    #[uniffi::constructor]
    pub fn new(sdk_key: String, sdk_secret: String) -> Result<Arc<Self>, HuddleFfiError> {
        let hub = huddle_core::LocalHub::new(&sdk_key, &sdk_secret)?;
        Ok(Arc::new(Self { hub }))
    }

    /// Mint a two-hour session token signed with the hub's secret.
    pub fn issue_token(&self, session_name: String, as_host: bool) -> Result<String, HuddleFfiError> {
        let role = if as_host { Role::Host } else { Role::Participant };
        let token = self.hub.issuer().issue(
            session_name.trim(),
            role,
            None,
            huddle_core::auth::token_lifetime(),
        )?;
        Ok(token)
    }

    pub fn session_users(&self, session_name: String) -> Vec<UserInfo> {
        self.hub
            .session_users(&session_name)
            .into_iter()
            .map(UserInfo::from)
            .collect()
    }
}

// ── HuddleClient: main FFI object ─────────────────────────────────────

#[derive(uniffi::Object)]
pub struct HuddleClient {
    hub: Arc<LoopbackHub>,
    engine: huddle_core::SessionEngine,
    settings: huddle_core::SettingsStore,
    video_sender: Arc<Mutex<Option<VideoFrameSender>>>,
    audio_sender: Arc<Mutex<Option<AudioFrameSender>>>,
    rt: tokio::runtime::Runtime,
}

fn load_engine_config(data_dir: &Path) -> Result<EngineConfig, HuddleError> {
    let path = data_dir.join(ENGINE_CONFIG_FILE);
    if path.exists() {
        EngineConfig::from_json_file(&path)
    } else {
        Ok(EngineConfig::default())
    }
}

#[uniffi::export]
impl HuddleClient {
    /// `data_dir` holds `settings.json` and an optional `engine.json`.
    #[uniffi::constructor]
    pub fn new(data_dir: String, hub: Arc<LoopbackHub>) -> Result<Arc<Self>, HuddleFfiError> {
        tracing::debug!(%data_dir, "HuddleClient::new");
        let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
        let config = load_engine_config(Path::new(&data_dir))?;
        let settings = huddle_core::SettingsStore::new(&data_dir);
        let engine = {
            let _guard = rt.enter();
            huddle_core::SessionEngine::new(config, Arc::new(hub.hub.clone()))
        };
        if let Some(language) = settings.get().transcription_language {
            if let Err(e) = engine.transcription().set_spoken_language(&language) {
                tracing::warn!("stored transcription language ignored: {e}");
            }
        }
        Ok(Arc::new(Self {
            hub,
            engine,
            settings,
            video_sender: Arc::default(),
            audio_sender: Arc::default(),
            rt,
        }))
    }

    pub fn add_listener(&self, listener: Box<dyn HuddleEventListener>) {
        let bridge = Arc::new(BridgeListener {
            ffi_listener: listener,
        });
        self.engine.events().add_listener(bridge);
    }

    // Session --------------------------------------------------------------

    /// Join with a token minted by the hub. `user_name` falls back to the
    /// stored display name; audio and video follow the join preferences.
    pub fn join(
        &self,
        session_name: String,
        user_name: Option<String>,
        password: Option<String>,
        as_host: bool,
    ) -> Result<SessionInfo, HuddleFfiError> {
        let token = self.hub.issue_token(session_name.clone(), as_host)?;
        self.join_with_token(session_name, user_name, token, password)
    }

    pub fn join_with_token(
        &self,
        session_name: String,
        user_name: Option<String>,
        token: String,
        password: Option<String>,
    ) -> Result<SessionInfo, HuddleFfiError> {
        let settings = self.settings.get();
        let user_name = user_name.or(settings.display_name).unwrap_or_default();
        let mut request = JoinRequest::with_token(session_name, user_name, token).with_options(
            JoinOptions {
                connect_audio: settings.mic_enabled_on_join,
                mute_audio: false,
                start_video: settings.camera_enabled_on_join,
            },
        );
        if let Some(password) = password {
            request = request.with_password(password);
        }
        let info = self.rt.block_on(self.engine.join(request))?;
        Ok(info.into())
    }

    pub fn provide_password(&self, password: String) -> Result<(), HuddleFfiError> {
        Ok(self.engine.provide_password(&password)?)
    }

    pub fn cancel_password(&self) -> Result<(), HuddleFfiError> {
        Ok(self.engine.cancel_password()?)
    }

    pub fn leave(&self, end_for_all: bool) -> Result<(), HuddleFfiError> {
        Ok(self.rt.block_on(self.engine.leave(end_for_all))?)
    }

    pub fn state(&self) -> SessionState {
        self.engine.state().into()
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.engine.session_info().map(SessionInfo::from)
    }

    pub fn myself(&self) -> Option<UserInfo> {
        self.engine.myself().map(UserInfo::from)
    }

    pub fn users(&self) -> Vec<UserInfo> {
        self.engine.users().into_iter().map(UserInfo::from).collect()
    }

    pub fn assign_host(&self, user_id: u64) -> Result<(), HuddleFfiError> {
        Ok(self.engine.assign_host(user_id)?)
    }

    pub fn set_manager(&self, user_id: u64, manager: bool) -> Result<(), HuddleFfiError> {
        Ok(self.engine.set_manager(user_id, manager)?)
    }

    pub fn remove_user(&self, user_id: u64) -> Result<(), HuddleFfiError> {
        Ok(self.engine.remove_user(user_id)?)
    }

    pub fn rename_user(&self, user_id: u64, name: String) -> Result<(), HuddleFfiError> {
        Ok(self.engine.rename_user(user_id, &name)?)
    }

    // Capture devices ------------------------------------------------------

    /// Register a host camera. Registering an existing id replaces it.
    pub fn register_camera(&self, id: String, name: String, source: Box<dyn CaptureSource>) {
        let bridge = BridgeVideoSource {
            callback: source,
            sender: self.video_sender.clone(),
        };
        self.engine.devices().register_camera(&id, &name, Arc::new(bridge));
    }

    pub fn register_microphone(&self, id: String, name: String, source: Box<dyn CaptureSource>) {
        let bridge = BridgeAudioSource {
            callback: source,
            sender: self.audio_sender.clone(),
        };
        self.engine.devices().register_microphone(&id, &name, Arc::new(bridge));
    }

    /// Push one packed I420 frame from the running camera.
    pub fn push_video_frame(
        &self,
        width: u32,
        height: u32,
        data: Vec<u8>,
        timestamp_us: u64,
    ) -> Result<(), HuddleFfiError> {
        let sender = self
            .video_sender
            .lock()
            .expect("video sender lock poisoned")
            .clone()
            .ok_or(HuddleError::VideoModuleNotReady)?;
        let frame = VideoFrame::from_packed(width, height, Bytes::from(data))
            .map_err(|e| HuddleError::InvalidParameter(e.to_string()))?
            .with_timestamp(timestamp_us);
        Ok(sender.send(frame)?)
    }

    /// Push interleaved 16-bit PCM from the running microphone.
    pub fn push_audio_frame(
        &self,
        samples: Vec<i16>,
        sample_rate: u32,
        channels: u16,
        timestamp_us: u64,
    ) -> Result<(), HuddleFfiError> {
        let sender = self
            .audio_sender
            .lock()
            .expect("audio sender lock poisoned")
            .clone()
            .ok_or(HuddleError::AudioModuleNotReady)?;
        let frame = AudioFrame::new(samples, sample_rate, channels)
            .map_err(|e| HuddleError::InvalidParameter(e.to_string()))?
            .with_timestamp(timestamp_us);
        Ok(sender.send(frame)?)
    }

    // Audio ----------------------------------------------------------------

    pub fn start_audio(&self) -> Result<(), HuddleFfiError> {
        let _guard = self.rt.enter();
        Ok(self.engine.audio().start_audio()?)
    }

    pub fn stop_audio(&self) -> Result<(), HuddleFfiError> {
        let _guard = self.rt.enter();
        Ok(self.engine.audio().stop_audio()?)
    }

    /// `None` targets the local user.
    pub fn mute(&self, user_id: Option<u64>) -> Result<(), HuddleFfiError> {
        Ok(self.engine.audio().mute(user_id)?)
    }

    pub fn unmute(&self, user_id: Option<u64>) -> Result<(), HuddleFfiError> {
        Ok(self.engine.audio().unmute(user_id)?)
    }

    pub fn is_muted(&self) -> bool {
        self.engine.audio().is_muted()
    }

    pub fn mute_all(&self, allow_unmute_by_self: bool) -> Result<(), HuddleFfiError> {
        Ok(self.engine.audio().mute_all(allow_unmute_by_self)?)
    }

    pub fn unmute_all(&self) -> Result<(), HuddleFfiError> {
        Ok(self.engine.audio().unmute_all()?)
    }

    /// Drain up to `max_samples` of mixed remote audio for the speaker.
    pub fn pull_playout(&self, max_samples: u32) -> Vec<i16> {
        let mut out = vec![0i16; max_samples as usize];
        let n = self.engine.audio().playout_buffer().pull_samples(&mut out);
        out.truncate(n);
        out
    }

    // Video and share ------------------------------------------------------

    pub fn start_video(&self) -> Result<(), HuddleFfiError> {
        let _guard = self.rt.enter();
        Ok(self.engine.video().start_video()?)
    }

    pub fn stop_video(&self) -> Result<(), HuddleFfiError> {
        let _guard = self.rt.enter();
        Ok(self.engine.video().stop_video()?)
    }

    pub fn is_video_on(&self) -> bool {
        self.engine.video().is_video_on()
    }

    pub fn spotlight(&self, user_id: u64) -> Result<(), HuddleFfiError> {
        Ok(self.engine.video().spotlight(user_id)?)
    }

    pub fn unspotlight(&self, user_id: u64) -> Result<(), HuddleFfiError> {
        Ok(self.engine.video().unspotlight(user_id)?)
    }

    // Remote camera control -----------------------------------------------

    pub fn request_camera_control(&self, user_id: u64) -> Result<(), HuddleFfiError> {
        Ok(self.engine.remote_camera_control(user_id).request_control()?)
    }

    pub fn give_up_camera_control(&self, user_id: u64) -> Result<(), HuddleFfiError> {
        Ok(self.engine.remote_camera_control(user_id).give_up_control()?)
    }

    /// `range` is 10..=100.
    pub fn move_camera(
        &self,
        user_id: u64,
        action: CameraMove,
        range: u32,
    ) -> Result<(), HuddleFfiError> {
        let control = self.engine.remote_camera_control(user_id);
        let moved = match action {
            CameraMove::Left => control.turn_left(range),
            CameraMove::Right => control.turn_right(range),
            CameraMove::Up => control.turn_up(range),
            CameraMove::Down => control.turn_down(range),
            CameraMove::ZoomIn => control.zoom_in(range),
            CameraMove::ZoomOut => control.zoom_out(range),
        };
        Ok(moved?)
    }

    pub fn answer_camera_control(
        &self,
        requester_id: u64,
        approve: bool,
    ) -> Result<(), HuddleFfiError> {
        let responder = self.engine.camera_control_requests();
        let answered = if approve {
            responder.approve(requester_id)
        } else {
            responder.decline(requester_id)
        };
        Ok(answered?)
    }

    pub fn revoke_camera_control(&self) -> Result<(), HuddleFfiError> {
        Ok(self.engine.camera_control_requests().revoke()?)
    }

    pub fn stop_share(&self) -> Result<(), HuddleFfiError> {
        let _guard = self.rt.enter();
        Ok(self.engine.share().stop()?)
    }

    pub fn lock_share(&self, locked: bool) -> Result<(), HuddleFfiError> {
        Ok(self.engine.share().lock_share(locked)?)
    }

    pub fn is_share_locked(&self) -> bool {
        self.engine.share().is_share_locked()
    }

    // Chat and commands ----------------------------------------------------

    /// Returns the id of the sent message. `None` sends to everyone.
    pub fn send_chat_message(&self, text: String, to: Option<u64>) -> Result<String, HuddleFfiError> {
        let chat = self.engine.chat();
        let id = match to {
            Some(user_id) => chat.send_to_user(user_id, &text)?,
            None => chat.send_to_all(&text)?,
        };
        Ok(id)
    }

    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        self.engine
            .chat()
            .messages()
            .into_iter()
            .map(ChatMessage::from)
            .collect()
    }

    pub fn send_command(&self, payload: String, to: Option<u64>) -> Result<(), HuddleFfiError> {
        Ok(self.engine.command_channel().send(&payload, to)?)
    }

    // Recording and transcription ------------------------------------------

    pub fn start_recording(&self) -> Result<(), HuddleFfiError> {
        Ok(self.engine.recording().start()?)
    }

    pub fn stop_recording(&self) -> Result<(), HuddleFfiError> {
        Ok(self.engine.recording().stop()?)
    }

    pub fn recording_status(&self) -> RecordingStatus {
        self.engine.recording().status().into()
    }

    pub fn start_transcription(&self) -> Result<(), HuddleFfiError> {
        Ok(self.engine.transcription().start()?)
    }

    pub fn stop_transcription(&self) -> Result<(), HuddleFfiError> {
        Ok(self.engine.transcription().stop()?)
    }

    // Sub-sessions ---------------------------------------------------------

    pub fn join_sub_session(&self, sub_session_id: String) -> Result<(), HuddleFfiError> {
        Ok(self.engine.sub_sessions().join(&sub_session_id)?)
    }

    pub fn return_to_main_session(&self) -> Result<(), HuddleFfiError> {
        Ok(self.engine.sub_sessions().return_to_main()?)
    }

    pub fn request_help(&self) -> Result<(), HuddleFfiError> {
        Ok(self.engine.sub_sessions().request_help()?)
    }

    // Settings -------------------------------------------------------------

    pub fn get_settings(&self) -> Settings {
        self.settings.get().into()
    }

    pub fn set_display_name(&self, name: Option<String>) {
        self.settings.set_display_name(name);
    }

    /// Also applies to the next transcription started.
    pub fn set_transcription_language(&self, lang: Option<String>) -> Result<(), HuddleFfiError> {
        if let Some(lang) = &lang {
            self.engine.transcription().set_spoken_language(lang)?;
        }
        self.settings.set_transcription_language(lang);
        Ok(())
    }

    pub fn set_mic_enabled_on_join(&self, enabled: bool) {
        self.settings.set_mic_enabled_on_join(enabled);
    }

    pub fn set_camera_enabled_on_join(&self, enabled: bool) {
        self.settings.set_camera_enabled_on_join(enabled);
    }

    pub fn set_preferred_resolution(&self, resolution: VideoResolution) {
        self.settings.set_preferred_resolution(resolution.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<HuddleEvent>>>,
    }

    impl HuddleEventListener for Recorder {
        fn on_event(&self, event: HuddleEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[derive(Default)]
    struct FakeCapture {
        running: Arc<Mutex<bool>>,
    }

    impl CaptureSource for FakeCapture {
        fn on_start(&self) {
            *self.running.lock().unwrap() = true;
        }

        fn on_stop(&self) {
            *self.running.lock().unwrap() = false;
        }
    }

    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn client(hub: &Arc<LoopbackHub>) -> (Arc<HuddleClient>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let client = HuddleClient::new(dir.path().display().to_string(), hub.clone()).unwrap();
        client.set_mic_enabled_on_join(false);
        (client, dir)
    }

    #[test]
    fn errors_keep_code_and_disposition() {
        let e = HuddleFfiError::from(HuddleError::NotInSession);
        assert_eq!(e.code(), 6002);
        assert!(matches!(e, HuddleFfiError::Terminal { ref category, .. } if category == "Session"));

        let e = HuddleFfiError::from(HuddleError::CallTooFrequently);
        assert!(matches!(e, HuddleFfiError::Retryable { code: 8, .. }));

        let e = HuddleFfiError::from(HuddleError::NoUserName);
        assert!(matches!(e, HuddleFfiError::UserActionable { code: 1502, .. }));
    }

    #[test]
    fn states_convert() {
        assert_eq!(
            SessionState::from(CoreSessionState::Reconnecting { attempt: 2 }),
            SessionState::Reconnecting { attempt: 2 }
        );
        assert_eq!(
            SessionState::from(CoreSessionState::Left(CoreLeaveReason::KickedByHost)),
            SessionState::Left {
                reason: LeaveReason::KickedByHost
            }
        );
    }

    #[test]
    fn two_clients_chat_through_the_hub() {
        let hub = LoopbackHub::new("key".into(), "secret".into()).unwrap();
        let (alice, _alice_dir) = client(&hub);
        let (bob, _bob_dir) = client(&hub);
        let recorder = Recorder::default();
        let bob_events = recorder.events.clone();
        bob.add_listener(Box::new(recorder));

        assert_eq!(alice.state(), SessionState::Idle);
        assert!(alice.leave(false).is_err());

        let info = alice
            .join("standup".into(), Some("Alice".into()), None, true)
            .unwrap();
        assert_eq!(info.name, "standup");
        bob.join("standup".into(), Some("Bob".into()), None, false)
            .unwrap();
        assert_eq!(bob.state(), SessionState::InSession);
        wait_until(|| alice.users().len() == 2);
        assert_eq!(hub.session_users("standup".into()).len(), 2);
        assert!(alice.myself().unwrap().is_host);

        alice.send_chat_message("hello".into(), None).unwrap();
        wait_until(|| {
            bob_events.lock().unwrap().iter().any(|e| {
                matches!(e, HuddleEvent::ChatMessageReceived { message } if message.text == "hello")
            })
        });
        assert_eq!(bob.chat_messages()[0].sender_name, "Alice");

        bob.leave(false).unwrap();
        assert_eq!(
            bob.state(),
            SessionState::Left {
                reason: LeaveReason::BySelf
            }
        );
        wait_until(|| alice.users().len() == 1);
        alice.leave(true).unwrap();
    }

    #[test]
    fn display_name_comes_from_settings() {
        let hub = LoopbackHub::new("key".into(), "secret".into()).unwrap();
        let (client, dir) = client(&hub);

        let err = client.join("room".into(), None, None, false).unwrap_err();
        assert_eq!(err.code(), 1502);
        assert_eq!(client.state(), SessionState::Idle);

        client.set_display_name(Some("Carol".into()));
        client.join("room".into(), None, None, false).unwrap();
        assert_eq!(client.myself().unwrap().name, "Carol");
        client.leave(false).unwrap();

        assert!(client.set_transcription_language(Some("not valid".into())).is_err());
        client.set_transcription_language(Some("de-DE".into())).unwrap();
        let reopened = HuddleClient::new(dir.path().display().to_string(), hub.clone()).unwrap();
        assert_eq!(reopened.get_settings().display_name.as_deref(), Some("Carol"));
        assert_eq!(
            reopened.get_settings().transcription_language.as_deref(),
            Some("de-DE")
        );
    }

    #[test]
    fn host_capture_sources_feed_the_pipelines() {
        let hub = LoopbackHub::new("key".into(), "secret".into()).unwrap();
        let (alice, _alice_dir) = client(&hub);
        let (bob, _bob_dir) = client(&hub);
        let recorder = Recorder::default();
        let alice_events = recorder.events.clone();
        alice.add_listener(Box::new(recorder));

        let camera = FakeCapture::default();
        let camera_running = camera.running.clone();
        alice.register_camera("cam-0".into(), "Front".into(), Box::new(camera));
        let mic = FakeCapture::default();
        let mic_running = mic.running.clone();
        alice.register_microphone("mic-0".into(), "Built-in".into(), Box::new(mic));

        alice.join("daily".into(), Some("Alice".into()), None, true).unwrap();
        bob.join("daily".into(), Some("Bob".into()), None, false).unwrap();
        let alice_id = alice.myself().unwrap().user_id;
        assert!(alice.push_video_frame(8, 4, vec![16; 48], 0).is_err());

        alice.start_video().unwrap();
        wait_until(|| {
            alice_events.lock().unwrap().iter().any(|e| {
                matches!(e, HuddleEvent::CaptureStarted { kind: CaptureKind::Video })
            })
        });
        wait_until(|| *camera_running.lock().unwrap());
        alice.push_video_frame(8, 4, vec![16; 48], 1_000).unwrap();
        assert!(alice.push_video_frame(8, 4, vec![16; 10], 2_000).is_err());
        wait_until(|| bob.users().iter().any(|u| u.user_id == alice_id && u.video_on));

        let bob_id = bob.myself().unwrap().user_id;
        bob.request_camera_control(alice_id).unwrap();
        wait_until(|| {
            alice_events.lock().unwrap().iter().any(|e| {
                matches!(e, HuddleEvent::CameraControlRequested { by } if *by == bob_id)
            })
        });
        alice.answer_camera_control(bob_id, true).unwrap();
        wait_until(|| bob.move_camera(alice_id, CameraMove::Left, 20).is_ok());
        wait_until(|| {
            alice_events.lock().unwrap().iter().any(|e| {
                matches!(e, HuddleEvent::CameraMoveRequested { action: CameraMove::Left, range: 20, .. })
            })
        });

        alice.start_audio().unwrap();
        wait_until(|| *mic_running.lock().unwrap());
        alice.push_audio_frame(vec![0; 480], 48_000, 1, 0).unwrap();

        alice.stop_video().unwrap();
        wait_until(|| !*camera_running.lock().unwrap());
        wait_until(|| {
            alice_events.lock().unwrap().iter().any(|e| {
                matches!(e, HuddleEvent::CaptureStopped { kind: CaptureKind::Video })
            })
        });
        assert!(alice.push_video_frame(8, 4, vec![16; 48], 3_000).is_err());

        bob.leave(false).unwrap();
        alice.leave(true).unwrap();
    }
}
