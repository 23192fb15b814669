use std::sync::{Arc, RwLock, mpsc};

use huddle_media::{NetworkQuality, StreamKey, StreamKind, SubscribeError};
use serde::{Deserialize, Serialize};

/// Events emitted by the engine, grouped by concern.
#[derive(Debug, Clone)]
pub enum HuddleEvent {
    Session(SessionEvent),
    Roster(RosterEvent),
    Media(MediaEvent),
    Share(ShareEvent),
    Chat(ChatEvent),
    Recording(RecordingEvent),
    Transcription(TranscriptionEvent),
    SubSession(SubSessionEvent),
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Joined(SessionInfo),
    Left(LeaveReason),
    /// The session is password protected. `wrong` is set when a password
    /// was supplied and rejected.
    PasswordRequired { wrong: bool },
    /// A request accepted locally was refused by the server.
    RequestFailed { code: u32, message: String },
    CommandReceived { sender_id: u64, payload: String },
}

#[derive(Debug, Clone)]
pub enum RosterEvent {
    UsersJoined(Vec<UserInfo>),
    UsersLeft(Vec<UserInfo>),
    HostChanged { user_id: u64 },
    ManagerChanged { user_id: u64, is_manager: bool },
    UserRenamed { user_id: u64, name: String },
    /// The whole roster was replaced, e.g. when moving into a sub-session.
    Reset(Vec<UserInfo>),
}

#[derive(Debug, Clone)]
pub enum MediaEvent {
    AudioStatusChanged { user_id: u64, status: AudioStatus },
    AudioLevelChanged { user_id: u64, level: u8 },
    /// The host asks the local user to unmute.
    UnmuteRequested { by: u64 },
    UnmuteBySelfAllowed(bool),
    VideoStatusChanged { user_id: u64, on: bool },
    NetworkQualityChanged {
        user_id: u64,
        kind: StreamKind,
        quality: NetworkQuality,
    },
    SpotlightChanged(Vec<u64>),
    CaptureStarted(StreamKind),
    /// Emitted once the capture device has been released.
    CaptureStopped(StreamKind),
    SubscribeFailed { key: StreamKey, reason: SubscribeError },
    /// `by` asks to steer the local camera.
    CameraControlRequested { by: u64 },
    /// Answer from `user_id` to our control request.
    CameraControlResult { user_id: u64, approved: bool },
    /// The controller moved the local camera.
    CameraMoveRequested { by: u64, action: CameraMove, range: u32 },
    /// `controller_id` no longer steers `user_id`'s camera.
    CameraControlReleased { user_id: u64, controller_id: u64 },
}

/// Pan, tilt and zoom steps a remote controller can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraMove {
    Left,
    Right,
    Up,
    Down,
    ZoomIn,
    ZoomOut,
}

#[derive(Debug, Clone)]
pub enum ShareEvent {
    StatusChanged {
        user_id: u64,
        kind: StreamKind,
        state: MediaState,
    },
    LockChanged(bool),
}

#[derive(Debug, Clone)]
pub enum ChatEvent {
    MessageReceived(ChatMessage),
    PrivilegeChanged(ChatPrivilege),
    FileTransferProgress {
        transfer_id: String,
        status: FileTransferStatus,
    },
    FileReceived(ReceivedFile),
}

#[derive(Debug, Clone)]
pub enum RecordingEvent {
    StatusChanged(RecordingStatus),
}

#[derive(Debug, Clone)]
pub enum TranscriptionEvent {
    StatusChanged(TranscriptionStatus),
    Message(TranscriptMessage),
}

#[derive(Debug, Clone)]
pub enum SubSessionEvent {
    StatusChanged {
        status: SubSessionStatus,
        sub_sessions: Vec<SubSessionInfo>,
    },
    /// An attempt failed; the primary status is unchanged.
    OperationFailed { status: SubSessionStatus, message: String },
    UsersUpdated {
        sub_session_id: String,
        users: Vec<SubSessionUser>,
    },
    /// The local user moved. `None` means back in the main session.
    Entered { sub_session_id: Option<String> },
    HelpRequested(HelpRequestInfo),
    HelpRequestResult(HelpRequestResult),
    BroadcastMessage { from_name: String, message: String },
}

// ---------------------------------------------------------------------------
// Data types carried by events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Joining,
    InSession,
    Reconnecting { attempt: u32 },
    Left(LeaveReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    BySelf,
    KickedByHost,
    EndedByHost,
    NetworkError,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub name: String,
    pub my_user_id: u64,
    pub password_protected: bool,
}

/// Lifecycle of one media stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaState {
    #[default]
    Off,
    On,
    Paused,
}

impl MediaState {
    /// `Off → Paused` is the only forbidden move; repeating a state is a no-op.
    pub fn can_transition(self, to: MediaState) -> bool {
        !matches!((self, to), (MediaState::Off, MediaState::Paused))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AudioStatus {
    /// Joined the audio channel.
    pub connected: bool,
    pub muted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShareStatus {
    pub kind: Option<StreamKind>,
    pub state: MediaState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkLevels {
    pub audio: NetworkQuality,
    pub video: NetworkQuality,
    pub share: NetworkQuality,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: u64,
    pub name: String,
    #[serde(default)]
    pub custom_id: Option<String>,
    #[serde(default)]
    pub is_host: bool,
    #[serde(default)]
    pub is_manager: bool,
    #[serde(default)]
    pub audio: AudioStatus,
    #[serde(default)]
    pub audio_level: u8,
    #[serde(default)]
    pub video_on: bool,
    #[serde(default)]
    pub share: ShareStatus,
    #[serde(default)]
    pub network: NetworkLevels,
    #[serde(default)]
    pub in_sub_session: bool,
    #[serde(default)]
    pub spotlighted: bool,
}

impl UserInfo {
    pub fn new(user_id: u64, name: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
            custom_id: None,
            is_host: false,
            is_manager: false,
            audio: AudioStatus::default(),
            audio_level: 0,
            video_on: false,
            share: ShareStatus::default(),
            network: NetworkLevels::default(),
            in_sub_session: false,
            spotlighted: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatPrivilege {
    #[default]
    PublicAndPrivate,
    PublicOnly,
    NoOne,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: u64,
    pub sender_name: String,
    /// `None` for messages sent to everyone.
    pub receiver_id: Option<u64>,
    pub text: String,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileTransferStatus {
    Ready,
    Transferring { sent: u64, total: u64 },
    Done,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub transfer_id: String,
    pub sender_id: u64,
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    #[default]
    Stopped,
    Recording,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionStatus {
    #[default]
    Stopped,
    Connecting,
    Started,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub speaker_id: u64,
    pub speaker_name: String,
    pub text: String,
    pub language: String,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubSessionStatus {
    #[default]
    None,
    Committed,
    Withdrawn,
    Started,
    Stopping,
    Stopped,
    CommitFailed,
    WithdrawFailed,
    StartFailed,
    StopFailed,
}

impl SubSessionStatus {
    pub fn is_running(self) -> bool {
        matches!(self, SubSessionStatus::Started | SubSessionStatus::Stopping)
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            SubSessionStatus::CommitFailed
                | SubSessionStatus::WithdrawFailed
                | SubSessionStatus::StartFailed
                | SubSessionStatus::StopFailed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubSessionUser {
    pub user_id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubSessionInfo {
    pub id: String,
    pub name: String,
    pub users: Vec<SubSessionUser>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HelpRequestResult {
    /// Delivered; the host has no other request open.
    Idle,
    /// The host is handling another request.
    Busy,
    Ignore,
    HostAlreadyInSubSession,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelpRequestInfo {
    pub request_id: String,
    pub requester_id: u64,
    pub requester_name: String,
    pub sub_session_id: String,
    pub sub_session_name: String,
}

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

/// Receives every event. Implementations must be Send + Sync; they are
/// called from the event-delivery thread.
pub trait HuddleEventListener: Send + Sync {
    fn on_event(&self, event: HuddleEvent);
}

pub trait SessionObserver: Send + Sync {
    fn on_session_event(&self, event: &SessionEvent);
}

pub trait RosterObserver: Send + Sync {
    fn on_roster_event(&self, event: &RosterEvent);
}

pub trait MediaObserver: Send + Sync {
    fn on_media_event(&self, event: &MediaEvent);
}

pub trait ShareObserver: Send + Sync {
    fn on_share_event(&self, event: &ShareEvent);
}

pub trait ChatObserver: Send + Sync {
    fn on_chat_event(&self, event: &ChatEvent);
}

pub trait RecordingObserver: Send + Sync {
    fn on_recording_event(&self, event: &RecordingEvent);
}

pub trait TranscriptionObserver: Send + Sync {
    fn on_transcription_event(&self, event: &TranscriptionEvent);
}

pub trait SubSessionObserver: Send + Sync {
    fn on_sub_session_event(&self, event: &SubSessionEvent);
}

/// Routes each event to the catch-all listeners and to the observers of
/// its concern.
#[derive(Default)]
pub struct ObserverRegistry {
    listeners: Vec<Arc<dyn HuddleEventListener>>,
    streams: Vec<tokio::sync::mpsc::UnboundedSender<HuddleEvent>>,
    session: Vec<Arc<dyn SessionObserver>>,
    roster: Vec<Arc<dyn RosterObserver>>,
    media: Vec<Arc<dyn MediaObserver>>,
    share: Vec<Arc<dyn ShareObserver>>,
    chat: Vec<Arc<dyn ChatObserver>>,
    recording: Vec<Arc<dyn RecordingObserver>>,
    transcription: Vec<Arc<dyn TranscriptionObserver>>,
    sub_session: Vec<Arc<dyn SubSessionObserver>>,
}

impl ObserverRegistry {
    /// Returns `false` if an async stream receiver has gone away.
    fn dispatch(&self, event: &HuddleEvent) -> bool {
        match event {
            HuddleEvent::Session(e) => self.session.iter().for_each(|o| o.on_session_event(e)),
            HuddleEvent::Roster(e) => self.roster.iter().for_each(|o| o.on_roster_event(e)),
            HuddleEvent::Media(e) => self.media.iter().for_each(|o| o.on_media_event(e)),
            HuddleEvent::Share(e) => self.share.iter().for_each(|o| o.on_share_event(e)),
            HuddleEvent::Chat(e) => self.chat.iter().for_each(|o| o.on_chat_event(e)),
            HuddleEvent::Recording(e) => {
                self.recording.iter().for_each(|o| o.on_recording_event(e))
            }
            HuddleEvent::Transcription(e) => self
                .transcription
                .iter()
                .for_each(|o| o.on_transcription_event(e)),
            HuddleEvent::SubSession(e) => self
                .sub_session
                .iter()
                .for_each(|o| o.on_sub_session_event(e)),
        }
        for listener in &self.listeners {
            listener.on_event(event.clone());
        }
        let mut all_open = true;
        for stream in &self.streams {
            all_open &= stream.send(event.clone()).is_ok();
        }
        all_open
    }

    fn prune_streams(&mut self) {
        self.streams.retain(|s| !s.is_closed());
    }
}

/// Queues events and delivers them on a dedicated thread, so emitting
/// never runs observer code on the caller's task.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<HuddleEvent>,
    registry: Arc<RwLock<ObserverRegistry>>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<HuddleEvent>();
        let registry = Arc::new(RwLock::new(ObserverRegistry::default()));
        let delivery = registry.clone();

        std::thread::Builder::new()
            .name("huddle-events".into())
            .spawn(move || {
                for event in rx {
                    let all_open = delivery.read().expect("observer lock poisoned").dispatch(&event);
                    if !all_open {
                        delivery.write().expect("observer lock poisoned").prune_streams();
                    }
                }
                tracing::debug!("event delivery thread exited");
            })
            .expect("failed to spawn event delivery thread");

        Self { tx, registry }
    }

    pub fn emit(&self, event: HuddleEvent) {
        if self.tx.send(event).is_err() {
            tracing::warn!("event delivery thread is gone, event dropped");
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn HuddleEventListener>) {
        self.registry().listeners.push(listener);
    }

    /// Async view of the event stream. Closed receivers are pruned.
    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<HuddleEvent> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.registry().streams.push(tx);
        rx
    }

    pub fn add_session_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.registry().session.push(observer);
    }

    pub fn add_roster_observer(&self, observer: Arc<dyn RosterObserver>) {
        self.registry().roster.push(observer);
    }

    pub fn add_media_observer(&self, observer: Arc<dyn MediaObserver>) {
        self.registry().media.push(observer);
    }

    pub fn add_share_observer(&self, observer: Arc<dyn ShareObserver>) {
        self.registry().share.push(observer);
    }

    pub fn add_chat_observer(&self, observer: Arc<dyn ChatObserver>) {
        self.registry().chat.push(observer);
    }

    pub fn add_recording_observer(&self, observer: Arc<dyn RecordingObserver>) {
        self.registry().recording.push(observer);
    }

    pub fn add_transcription_observer(&self, observer: Arc<dyn TranscriptionObserver>) {
        self.registry().transcription.push(observer);
    }

    pub fn add_sub_session_observer(&self, observer: Arc<dyn SubSessionObserver>) {
        self.registry().sub_session.push(observer);
    }

    fn registry(&self) -> std::sync::RwLockWriteGuard<'_, ObserverRegistry> {
        self.registry.write().expect("observer lock poisoned")
    }
}
