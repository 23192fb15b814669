//! Session lifecycle: join, the signaling event loop, reconnection and
//! leave. Owns the roster and everything else learned from the server.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use bytes::Bytes;
use huddle_media::{CallRateLimiter, RawDataStatus, StreamKey};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::audio::AudioHelper;
use crate::auth::JoinRequest;
use crate::camera_control::{CameraControlResponder, CameraControlState, RemoteCameraControlHelper};
use crate::chat::ChatHelper;
use crate::command::CommandChannel;
use crate::config::EngineConfig;
use crate::errors::HuddleError;
use crate::events::{
    AudioStatus, ChatEvent, ChatMessage, EventEmitter, HelpRequestInfo, HelpRequestResult,
    HuddleEvent, LeaveReason, MediaEvent, MediaState, RecordingEvent, RosterEvent, SessionEvent,
    SessionInfo, SessionState, ShareEvent, ShareStatus, SubSessionEvent,
    TranscriptMessage, TranscriptionEvent, UserInfo,
};
use crate::file_transfer::{self, FileStore, FileTransferHelper};
use crate::media::devices::DeviceRegistry;
use crate::media::{CodecProvider, MediaEngine, RawCodecs};
use crate::recording::{RecordingHelper, TranscriptionHelper};
use crate::roster::Roster;
use crate::share::ShareHelper;
use crate::subsession::{SubSessionHelper, SubSessionState};
use crate::transport::{
    ClientSignal, ConnectRequest, ResumeToken, ServerSignal, SessionPolicy, SignalChannel,
    SignalingTransport, TransportError, TransportLink, decode_signal,
};
use crate::video::VideoHelper;

/// Everything known about the current session.
pub(crate) struct SessionContext {
    pub state: SessionState,
    pub info: Option<SessionInfo>,
    pub roster: Roster,
    pub policy: SessionPolicy,
    pub resume_token: Option<ResumeToken>,
    pub sub: SubSessionState,
    pub chat: Vec<ChatMessage>,
    pub transcripts: Vec<TranscriptMessage>,
    /// Survives leaving; applied to the next transcription start.
    pub transcription_language: Option<String>,
    pub files: FileStore,
    pub camera: CameraControlState,
}

impl SessionContext {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
            info: None,
            roster: Roster::new(),
            policy: SessionPolicy::default(),
            resume_token: None,
            sub: SubSessionState::default(),
            chat: Vec::new(),
            transcripts: Vec::new(),
            transcription_language: None,
            files: FileStore::default(),
            camera: CameraControlState::default(),
        }
    }

    fn clear(&mut self, state: SessionState) {
        let language = self.transcription_language.take();
        *self = Self::new();
        self.state = state;
        self.transcription_language = language;
    }

    pub fn my_id(&self) -> Option<u64> {
        self.roster.myself_id()
    }

    pub fn am_host(&self) -> bool {
        self.roster.myself().is_some_and(|u| u.is_host)
    }

    pub fn am_privileged(&self) -> bool {
        self.my_id().is_some_and(|id| self.roster.is_privileged(id))
    }
}

enum Reconnect {
    Resumed(mpsc::UnboundedReceiver<Bytes>),
    /// The session was left while the link was down.
    Abandoned,
    Failed,
}

pub(crate) struct Shared {
    pub config: EngineConfig,
    pub emitter: EventEmitter,
    pub media: MediaEngine,
    transport: Arc<dyn SignalingTransport>,
    ctx: Mutex<SessionContext>,
    link: RwLock<Option<SignalChannel>>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    password_tx: Mutex<Option<oneshot::Sender<Option<String>>>>,
    join_lock: tokio::sync::Mutex<()>,
    pub command_limiter: CallRateLimiter,
}

impl Shared {
    pub fn ctx(&self) -> MutexGuard<'_, SessionContext> {
        self.ctx.lock().expect("session lock poisoned")
    }

    pub fn emit(&self, event: HuddleEvent) {
        self.emitter.emit(event);
    }

    /// The context, if media and signaling requests are accepted right now.
    pub fn require_in_session(&self) -> Result<MutexGuard<'_, SessionContext>, HuddleError> {
        let ctx = self.ctx();
        match ctx.state {
            SessionState::InSession => Ok(ctx),
            SessionState::Reconnecting { .. } => Err(HuddleError::Reconnecting),
            _ => Err(HuddleError::NotInSession),
        }
    }

    pub fn send(&self, signal: ClientSignal) -> Result<(), HuddleError> {
        let link = self.link.read().expect("link lock poisoned");
        let channel = link.as_ref().ok_or(HuddleError::NotInSession)?;
        channel.send(&signal).map_err(HuddleError::from)
    }

    fn set_state(&self, state: SessionState) {
        self.ctx().state = state;
        self.emit(HuddleEvent::Session(SessionEvent::StateChanged(state)));
    }

    // ---------------------------------------------------------------------
    // Join
    // ---------------------------------------------------------------------

    async fn connect(
        &self,
        request: &JoinRequest,
        token: String,
    ) -> Result<TransportLink, HuddleError> {
        let mut password = request.password.clone();
        let mut wrong_attempts = 0;
        loop {
            let attempt = ConnectRequest {
                session_name: request.session_name.trim().to_string(),
                user_name: request.user_name.clone(),
                token: token.clone(),
                password: password.clone(),
                custom_user_id: request.custom_user_id.clone(),
            };
            let wrong = match self.transport.connect(attempt).await {
                Ok(link) => return Ok(link),
                Err(TransportError::PasswordRequired) => false,
                Err(TransportError::PasswordWrong) => true,
                Err(e) => return Err(e.into()),
            };
            if wrong {
                wrong_attempts += 1;
                if wrong_attempts >= self.config.max_password_attempts {
                    return Err(HuddleError::PasswordWrong);
                }
            }
            password = Some(self.prompt_password(wrong).await?);
        }
    }

    async fn prompt_password(&self, wrong: bool) -> Result<String, HuddleError> {
        let (tx, rx) = oneshot::channel();
        *self.password_tx.lock().expect("password lock poisoned") = Some(tx);
        self.emit(HuddleEvent::Session(SessionEvent::PasswordRequired { wrong }));

        let answer = tokio::time::timeout(self.config.password_prompt_timeout(), rx).await;
        self.password_tx.lock().expect("password lock poisoned").take();
        match answer {
            Ok(Ok(Some(password))) => Ok(password),
            Ok(Ok(None)) | Ok(Err(_)) => Err(HuddleError::NeedPassword),
            Err(_) => {
                tracing::warn!("password prompt timed out");
                Err(HuddleError::NeedPassword)
            }
        }
    }

    fn answer_password(&self, answer: Option<String>) -> Result<(), HuddleError> {
        let tx = self
            .password_tx
            .lock()
            .expect("password lock poisoned")
            .take()
            .ok_or_else(|| HuddleError::WrongUsage("no password prompt is pending".into()))?;
        tx.send(answer)
            .map_err(|_| HuddleError::WrongUsage("password prompt already closed".into()))
    }

    /// Adopt a freshly connected link and start the event loop.
    fn install(self: &Arc<Self>, link: TransportLink) -> SessionInfo {
        let TransportLink {
            welcome,
            signals_tx,
            signals_rx,
            media_tx,
            media_rx,
        } = link;
        let info = SessionInfo {
            session_id: welcome.session_id.clone(),
            name: welcome.session_name.clone(),
            my_user_id: welcome.user_id,
            password_protected: welcome.password_protected,
        };
        let others: Vec<UserInfo> = {
            let mut ctx = self.ctx();
            ctx.clear(SessionState::InSession);
            ctx.roster.reset(welcome.roster, welcome.user_id);
            ctx.policy = welcome.policy;
            ctx.resume_token = Some(welcome.resume_token);
            ctx.info = Some(info.clone());
            ctx.roster.remote_users().cloned().collect()
        };
        *self.link.write().expect("link lock poisoned") = Some(SignalChannel::new(signals_tx));
        self.media.attach_link(media_tx, media_rx);

        self.emit(HuddleEvent::Session(SessionEvent::StateChanged(
            SessionState::InSession,
        )));
        self.emit(HuddleEvent::Session(SessionEvent::Joined(info.clone())));
        if !others.is_empty() {
            self.emit(HuddleEvent::Roster(RosterEvent::UsersJoined(others)));
        }

        let handle = tokio::spawn(event_loop(self.clone(), signals_rx));
        *self.loop_task.lock().expect("loop lock poisoned") = Some(handle);
        tracing::info!(session = %info.name, user_id = info.my_user_id, "joined session");
        info
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    /// Claim the transition to `Left`. Only the winner tears down.
    fn begin_teardown(&self, reason: LeaveReason) -> bool {
        let mut ctx = self.ctx();
        match ctx.state {
            SessionState::InSession | SessionState::Reconnecting { .. } => {
                ctx.state = SessionState::Left(reason);
                true
            }
            _ => false,
        }
    }

    async fn finish_teardown(&self, reason: LeaveReason) {
        self.link.write().expect("link lock poisoned").take();
        self.media.shutdown().await;
        self.ctx().clear(SessionState::Left(reason));
        self.emit(HuddleEvent::Session(SessionEvent::StateChanged(
            SessionState::Left(reason),
        )));
        self.emit(HuddleEvent::Session(SessionEvent::Left(reason)));
        tracing::info!(?reason, "session left");
    }

    // ---------------------------------------------------------------------
    // Reconnect
    // ---------------------------------------------------------------------

    async fn reconnect(&self) -> Reconnect {
        let token = {
            let mut ctx = self.ctx();
            if ctx.state != SessionState::InSession {
                return Reconnect::Abandoned;
            }
            ctx.state = SessionState::Reconnecting { attempt: 1 };
            ctx.resume_token.clone()
        };
        let Some(token) = token else {
            return Reconnect::Failed;
        };
        self.link.write().expect("link lock poisoned").take();
        self.media.freeze();
        tracing::warn!("signaling link lost, reconnecting");

        let policy = self.config.reconnect;
        let deadline = Instant::now() + policy.timeout();
        let mut attempt = 1;
        loop {
            {
                let mut ctx = self.ctx();
                if !matches!(ctx.state, SessionState::Reconnecting { .. }) {
                    return Reconnect::Abandoned;
                }
                ctx.state = SessionState::Reconnecting { attempt };
            }
            self.emit(HuddleEvent::Session(SessionEvent::StateChanged(
                SessionState::Reconnecting { attempt },
            )));

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(attempt, "reconnect timed out");
                return Reconnect::Failed;
            }
            tokio::time::sleep(policy.delay(attempt).min(deadline - now)).await;

            match self.transport.resume(&token).await {
                Ok(link) => {
                    return match self.resume_with(link) {
                        Some(rx) => Reconnect::Resumed(rx),
                        None => Reconnect::Abandoned,
                    };
                }
                Err(e) if e.is_retryable() && Instant::now() < deadline => {
                    tracing::debug!(attempt, "reconnect attempt failed: {e}");
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(attempt, "reconnect failed: {e}");
                    return Reconnect::Failed;
                }
            }
        }
    }

    fn resume_with(&self, link: TransportLink) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        let TransportLink {
            welcome,
            signals_tx,
            signals_rx,
            media_tx,
            media_rx,
        } = link;
        let reset = {
            let mut ctx = self.ctx();
            if !matches!(ctx.state, SessionState::Reconnecting { .. }) {
                return None;
            }
            let reset = (ctx.roster.users() != welcome.roster.as_slice()).then(|| {
                ctx.roster.reset(welcome.roster.clone(), welcome.user_id);
                welcome.roster.clone()
            });
            let in_sub_session = welcome
                .roster
                .iter()
                .any(|u| u.user_id == welcome.user_id && u.in_sub_session);
            if !in_sub_session {
                ctx.sub.current = None;
            }
            ctx.policy = welcome.policy;
            ctx.resume_token = Some(welcome.resume_token);
            ctx.state = SessionState::InSession;
            reset
        };
        *self.link.write().expect("link lock poisoned") = Some(SignalChannel::new(signals_tx));
        self.media.attach_link(media_tx, media_rx);

        self.emit(HuddleEvent::Session(SessionEvent::StateChanged(
            SessionState::InSession,
        )));
        if let Some(users) = reset {
            self.emit(HuddleEvent::Roster(RosterEvent::Reset(users)));
        }
        tracing::info!("reconnected");
        Some(signals_rx)
    }

    // ---------------------------------------------------------------------
    // Server signals
    // ---------------------------------------------------------------------

    /// Apply one server signal. Returns a reason when the server ended our
    /// participation.
    fn apply(&self, signal: ServerSignal) -> Option<LeaveReason> {
        let mut out: Vec<HuddleEvent> = Vec::new();
        let mut reply = None;
        {
            let mut ctx = self.ctx();
            let me = ctx.my_id();
            match signal {
                ServerSignal::UserJoined { users } => {
                    let added: Vec<UserInfo> = users
                        .into_iter()
                        .filter(|u| ctx.roster.add_user(u.clone()))
                        .collect();
                    if !added.is_empty() {
                        out.push(HuddleEvent::Roster(RosterEvent::UsersJoined(added)));
                    }
                }
                ServerSignal::UserLeft { user_ids } => {
                    let removed: Vec<UserInfo> = user_ids
                        .iter()
                        .filter_map(|id| ctx.roster.remove_user(*id))
                        .collect();
                    for user in &removed {
                        self.media.drop_user(user.user_id);
                        ctx.camera.forget_user(user.user_id);
                    }
                    if !removed.is_empty() {
                        out.push(HuddleEvent::Roster(RosterEvent::UsersLeft(removed)));
                    }
                }
                ServerSignal::HostChanged { user_id } => {
                    if !ctx.roster.set_host(user_id) {
                        ctx.roster.clear_host();
                    }
                    out.push(HuddleEvent::Roster(RosterEvent::HostChanged { user_id }));
                }
                ServerSignal::ManagerChanged { user_id, manager } => {
                    ctx.roster.set_manager(user_id, manager);
                    out.push(HuddleEvent::Roster(RosterEvent::ManagerChanged {
                        user_id,
                        is_manager: manager,
                    }));
                }
                ServerSignal::UserRenamed { user_id, name } => {
                    if let Some(user) = ctx.roster.user_mut(user_id) {
                        user.name = name.clone();
                    }
                    out.push(HuddleEvent::Roster(RosterEvent::UserRenamed { user_id, name }));
                }
                ServerSignal::AudioStatus {
                    user_id,
                    connected,
                    muted,
                } => {
                    let status = AudioStatus { connected, muted };
                    if let Some(user) = ctx.roster.user_mut(user_id) {
                        user.audio = status;
                    }
                    if Some(user_id) == me && self.media.is_audio_started() {
                        let _ = self.media.set_audio_muted(muted);
                    }
                    out.push(HuddleEvent::Media(MediaEvent::AudioStatusChanged {
                        user_id,
                        status,
                    }));
                }
                ServerSignal::UnmuteRequested { by } => {
                    out.push(HuddleEvent::Media(MediaEvent::UnmuteRequested { by }));
                }
                ServerSignal::UnmuteBySelfAllowed { allowed } => {
                    ctx.policy.allow_unmute_by_self = allowed;
                    out.push(HuddleEvent::Media(MediaEvent::UnmuteBySelfAllowed(allowed)));
                }
                ServerSignal::VideoStatus { user_id, on } => {
                    if let Some(user) = ctx.roster.user_mut(user_id) {
                        user.video_on = on;
                    }
                    if Some(user_id) != me {
                        let status = if on { RawDataStatus::On } else { RawDataStatus::Off };
                        self.media.publish_status(StreamKey::video(user_id), status);
                    }
                    out.push(HuddleEvent::Media(MediaEvent::VideoStatusChanged { user_id, on }));
                }
                ServerSignal::ShareStatus {
                    user_id,
                    kind,
                    state,
                } => {
                    if let Some(user) = ctx.roster.user_mut(user_id) {
                        user.share = ShareStatus {
                            kind: (state != MediaState::Off).then_some(kind),
                            state,
                        };
                    }
                    if Some(user_id) == me {
                        // Forced off by a share lock.
                        if state == MediaState::Off && self.media.share_kind() == Some(kind) {
                            self.media.stop_share();
                        }
                    } else {
                        let status = match state {
                            MediaState::On => RawDataStatus::On,
                            MediaState::Off | MediaState::Paused => RawDataStatus::Off,
                        };
                        self.media.publish_status(StreamKey::new(user_id, kind), status);
                    }
                    out.push(HuddleEvent::Share(ShareEvent::StatusChanged {
                        user_id,
                        kind,
                        state,
                    }));
                }
                ServerSignal::ShareLocked { locked } => {
                    ctx.policy.share_locked = locked;
                    out.push(HuddleEvent::Share(ShareEvent::LockChanged(locked)));
                }
                ServerSignal::Spotlight { user_ids } => {
                    ctx.roster.set_spotlighted(&user_ids);
                    ctx.policy.spotlighted = user_ids.clone();
                    out.push(HuddleEvent::Media(MediaEvent::SpotlightChanged(user_ids)));
                }
                ServerSignal::Chat { message } => {
                    ctx.chat.push(message.clone());
                    out.push(HuddleEvent::Chat(ChatEvent::MessageReceived(message)));
                }
                ServerSignal::ChatPrivilege { privilege } => {
                    ctx.policy.chat_privilege = privilege;
                    out.push(HuddleEvent::Chat(ChatEvent::PrivilegeChanged(privilege)));
                }
                ServerSignal::Command { from, payload } => {
                    out.push(HuddleEvent::Session(SessionEvent::CommandReceived {
                        sender_id: from,
                        payload,
                    }));
                }
                ServerSignal::FileChunk { from, chunk } => {
                    let max_bytes = ctx.policy.file_transfer.max_bytes;
                    out.extend(
                        file_transfer::accept_chunk(&mut ctx.files, from, chunk, max_bytes)
                            .into_iter()
                            .map(HuddleEvent::Chat),
                    );
                }
                ServerSignal::RecordingStatus { status } => {
                    ctx.policy.recording = status;
                    out.push(HuddleEvent::Recording(RecordingEvent::StatusChanged(status)));
                }
                ServerSignal::TranscriptionStatus { status } => {
                    ctx.policy.transcription = status;
                    out.push(HuddleEvent::Transcription(TranscriptionEvent::StatusChanged(
                        status,
                    )));
                }
                ServerSignal::Transcript { message } => {
                    ctx.transcripts.push(message.clone());
                    out.push(HuddleEvent::Transcription(TranscriptionEvent::Message(message)));
                }
                ServerSignal::SubSessionStatus {
                    status,
                    sub_sessions,
                } => {
                    ctx.policy.sub_session_status = status;
                    ctx.policy.sub_sessions = sub_sessions.clone();
                    ctx.sub.on_status(status);
                    out.push(HuddleEvent::SubSession(SubSessionEvent::StatusChanged {
                        status,
                        sub_sessions,
                    }));
                }
                ServerSignal::SubSessionFailed { status, message } => {
                    ctx.sub.on_failure(status);
                    out.push(HuddleEvent::SubSession(SubSessionEvent::OperationFailed {
                        status,
                        message,
                    }));
                }
                ServerSignal::SubSessionUsers {
                    sub_session_id,
                    users,
                } => {
                    if let Some(sub) = ctx
                        .policy
                        .sub_sessions
                        .iter_mut()
                        .find(|s| s.id == sub_session_id)
                    {
                        sub.users = users.clone();
                    }
                    out.push(HuddleEvent::SubSession(SubSessionEvent::UsersUpdated {
                        sub_session_id,
                        users,
                    }));
                }
                ServerSignal::Relocated {
                    sub_session_id,
                    roster,
                } => {
                    if let Some(me) = me {
                        let previous: Vec<u64> =
                            ctx.roster.users().iter().map(|u| u.user_id).collect();
                        ctx.roster.reset(roster.clone(), me);
                        for id in previous.into_iter().filter(|id| !ctx.roster.contains(*id)) {
                            self.media.drop_user(id);
                        }
                        ctx.sub.current = sub_session_id.clone();
                        tracing::info!(sub_session = ?sub_session_id, users = roster.len(), "relocated");
                        out.push(HuddleEvent::Roster(RosterEvent::Reset(roster)));
                        out.push(HuddleEvent::SubSession(SubSessionEvent::Entered {
                            sub_session_id,
                        }));
                    }
                }
                ServerSignal::HelpRequested {
                    request_id,
                    requester_id,
                    requester_name,
                    sub_session_id,
                    sub_session_name,
                } => {
                    let result = if ctx.sub.help_dialog.is_some() {
                        HelpRequestResult::Busy
                    } else {
                        let info = HelpRequestInfo {
                            request_id: request_id.clone(),
                            requester_id,
                            requester_name,
                            sub_session_id,
                            sub_session_name,
                        };
                        ctx.sub.help_dialog = Some(info.clone());
                        out.push(HuddleEvent::SubSession(SubSessionEvent::HelpRequested(info)));
                        HelpRequestResult::Idle
                    };
                    reply = Some(ClientSignal::HelpRequestResult {
                        request_id,
                        requester_id,
                        result,
                    });
                }
                ServerSignal::HelpRequestResult { result } => {
                    out.push(HuddleEvent::SubSession(SubSessionEvent::HelpRequestResult(
                        result,
                    )));
                }
                ServerSignal::SubSessionBroadcast { from_name, message } => {
                    out.push(HuddleEvent::SubSession(SubSessionEvent::BroadcastMessage {
                        from_name,
                        message,
                    }));
                }
                ServerSignal::CameraControlRequested { by } => {
                    ctx.camera.on_requested(by);
                    out.push(HuddleEvent::Media(MediaEvent::CameraControlRequested { by }));
                }
                ServerSignal::CameraControlResult { user_id, approved } => {
                    ctx.camera.on_result(user_id, approved);
                    out.push(HuddleEvent::Media(MediaEvent::CameraControlResult {
                        user_id,
                        approved,
                    }));
                }
                ServerSignal::CameraMove { by, action, range } => {
                    out.push(HuddleEvent::Media(MediaEvent::CameraMoveRequested {
                        by,
                        action,
                        range,
                    }));
                }
                ServerSignal::CameraControlReleased {
                    user_id,
                    controller_id,
                } => {
                    ctx.camera.on_released(me, user_id, controller_id);
                    out.push(HuddleEvent::Media(MediaEvent::CameraControlReleased {
                        user_id,
                        controller_id,
                    }));
                }
                ServerSignal::Removed { reason } => {
                    tracing::info!(?reason, "removed from session");
                    return Some(reason);
                }
                ServerSignal::Error { code, message } => {
                    tracing::debug!(code, "request refused by server: {message}");
                    out.push(HuddleEvent::Session(SessionEvent::RequestFailed { code, message }));
                }
            }
        }
        if let Some(signal) = reply {
            if let Err(e) = self.send(signal) {
                tracing::warn!("failed to answer help request: {e}");
            }
        }
        out.into_iter().for_each(|event| self.emit(event));
        None
    }
}

async fn event_loop(shared: Arc<Shared>, mut signals: mpsc::UnboundedReceiver<Bytes>) {
    loop {
        while let Some(frame) = signals.recv().await {
            let signal = match decode_signal::<ServerSignal>(&frame) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::warn!("undecodable server signal: {e}");
                    continue;
                }
            };
            if let Some(reason) = shared.apply(signal) {
                if shared.begin_teardown(reason) {
                    shared.loop_task.lock().expect("loop lock poisoned").take();
                    shared.finish_teardown(reason).await;
                }
                return;
            }
        }

        match shared.reconnect().await {
            Reconnect::Resumed(rx) => signals = rx,
            Reconnect::Abandoned => return,
            Reconnect::Failed => {
                if shared.begin_teardown(LeaveReason::NetworkError) {
                    shared.loop_task.lock().expect("loop lock poisoned").take();
                    shared.finish_teardown(LeaveReason::NetworkError).await;
                }
                return;
            }
        }
    }
}

/// Entry point of the engine: one session at a time, with capability
/// helpers for each feature area.
#[derive(Clone)]
pub struct SessionEngine {
    shared: Arc<Shared>,
}

impl SessionEngine {
    pub fn new(config: EngineConfig, transport: Arc<dyn SignalingTransport>) -> Self {
        Self::with_codecs(config, transport, Arc::new(RawCodecs))
    }

    pub fn with_codecs(
        config: EngineConfig,
        transport: Arc<dyn SignalingTransport>,
        codecs: Arc<dyn CodecProvider>,
    ) -> Self {
        let emitter = EventEmitter::new();
        let media = MediaEngine::with_codecs(&config, emitter.clone(), codecs);
        let command_limiter = CallRateLimiter::new(config.command_rate);
        Self {
            shared: Arc::new(Shared {
                config,
                emitter,
                media,
                transport,
                ctx: Mutex::new(SessionContext::new()),
                link: RwLock::new(None),
                loop_task: Mutex::new(None),
                password_tx: Mutex::new(None),
                join_lock: tokio::sync::Mutex::new(()),
                command_limiter,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn events(&self) -> &EventEmitter {
        &self.shared.emitter
    }

    pub fn media(&self) -> &MediaEngine {
        &self.shared.media
    }

    pub fn devices(&self) -> &DeviceRegistry {
        self.shared.media.devices()
    }

    pub fn audio(&self) -> AudioHelper {
        AudioHelper::new(self.shared.clone())
    }

    pub fn video(&self) -> VideoHelper {
        VideoHelper::new(self.shared.clone())
    }

    pub fn share(&self) -> ShareHelper {
        ShareHelper::new(self.shared.clone())
    }

    pub fn chat(&self) -> ChatHelper {
        ChatHelper::new(self.shared.clone())
    }

    pub fn command_channel(&self) -> CommandChannel {
        CommandChannel::new(self.shared.clone())
    }

    pub fn file_transfer(&self) -> FileTransferHelper {
        FileTransferHelper::new(self.shared.clone())
    }

    pub fn recording(&self) -> RecordingHelper {
        RecordingHelper::new(self.shared.clone())
    }

    pub fn transcription(&self) -> TranscriptionHelper {
        TranscriptionHelper::new(self.shared.clone())
    }

    pub fn sub_sessions(&self) -> SubSessionHelper {
        SubSessionHelper::new(self.shared.clone())
    }

    /// Steer `user_id`'s camera once they approve.
    pub fn remote_camera_control(&self, user_id: u64) -> RemoteCameraControlHelper {
        RemoteCameraControlHelper::new(self.shared.clone(), user_id)
    }

    pub fn camera_control_requests(&self) -> CameraControlResponder {
        CameraControlResponder::new(self.shared.clone())
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Validate, connect and enter the session. Validation errors leave the
    /// state untouched; any later failure ends in `Left(Unknown)`.
    pub async fn join(&self, request: JoinRequest) -> Result<SessionInfo, HuddleError> {
        let _joining = self
            .shared
            .join_lock
            .try_lock()
            .map_err(|_| HuddleError::AlreadyInProgress)?;
        if matches!(
            self.state(),
            SessionState::Joining | SessionState::InSession | SessionState::Reconnecting { .. }
        ) {
            return Err(HuddleError::WrongUsage("already in a session".into()));
        }
        request.validate(&self.shared.config)?;
        let token = request.resolve_token()?;

        self.shared.set_state(SessionState::Joining);
        tracing::info!(session = %request.session_name, user = %request.user_name, "joining session");
        let link = match self.shared.connect(&request, token).await {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(session = %request.session_name, code = e.code(), "join failed: {e}");
                self.shared.set_state(SessionState::Left(LeaveReason::Unknown));
                self.shared
                    .emit(HuddleEvent::Session(SessionEvent::Left(LeaveReason::Unknown)));
                return Err(e);
            }
        };
        let info = self.shared.install(link);

        let options = request.options;
        if options.connect_audio {
            if let Err(e) = self.audio().start_with(options.mute_audio) {
                tracing::warn!("audio on join failed: {e}");
            }
        }
        if options.start_video {
            if let Err(e) = self.video().start_video() {
                tracing::warn!("video on join failed: {e}");
            }
        }
        Ok(info)
    }

    /// Answer a `PasswordRequired` prompt.
    pub fn provide_password(&self, password: &str) -> Result<(), HuddleError> {
        if password.is_empty() {
            return Err(HuddleError::InvalidPassword);
        }
        self.shared.answer_password(Some(password.to_string()))
    }

    /// Give up on a password prompt; the join fails with `NeedPassword`.
    pub fn cancel_password(&self) -> Result<(), HuddleError> {
        self.shared.answer_password(None)
    }

    /// Leave, or end the session for everyone (host only). Returns once all
    /// pipelines are stopped.
    pub async fn leave(&self, end_for_all: bool) -> Result<(), HuddleError> {
        {
            let ctx = self.shared.ctx();
            if !matches!(
                ctx.state,
                SessionState::InSession | SessionState::Reconnecting { .. }
            ) {
                return Err(HuddleError::NotInSession);
            }
            if end_for_all && !ctx.am_host() {
                return Err(HuddleError::NoRights);
            }
        }
        if !self.shared.begin_teardown(LeaveReason::BySelf) {
            return Ok(());
        }
        let signal = if end_for_all {
            ClientSignal::EndSession
        } else {
            ClientSignal::Leave
        };
        if let Err(e) = self.shared.send(signal) {
            tracing::debug!("leave not delivered: {e}");
        }
        if let Some(task) = self.shared.loop_task.lock().expect("loop lock poisoned").take() {
            task.abort();
        }
        self.shared.finish_teardown(LeaveReason::BySelf).await;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.shared.ctx().state
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.shared.ctx().info.clone()
    }

    fn with_live_stats(&self, mut user: UserInfo) -> UserInfo {
        user.audio_level = self.shared.media.audio_level(user.user_id);
        user.network = self.shared.media.network_levels(user.user_id);
        user
    }

    pub fn myself(&self) -> Option<UserInfo> {
        let user = self.shared.ctx().roster.myself().cloned();
        user.map(|u| self.with_live_stats(u))
    }

    pub fn users(&self) -> Vec<UserInfo> {
        let users = self.shared.ctx().roster.users().to_vec();
        users.into_iter().map(|u| self.with_live_stats(u)).collect()
    }

    pub fn remote_users(&self) -> Vec<UserInfo> {
        let users: Vec<UserInfo> = self.shared.ctx().roster.remote_users().cloned().collect();
        users.into_iter().map(|u| self.with_live_stats(u)).collect()
    }

    pub fn user(&self, user_id: u64) -> Option<UserInfo> {
        let user = self.shared.ctx().roster.user(user_id).cloned();
        user.map(|u| self.with_live_stats(u))
    }

    pub fn host(&self) -> Option<UserInfo> {
        self.shared.ctx().roster.host().cloned()
    }

    pub fn managers(&self) -> Vec<UserInfo> {
        self.shared
            .ctx()
            .roster
            .managers()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn is_host(&self) -> bool {
        self.shared.ctx().am_host()
    }

    pub fn is_manager(&self) -> bool {
        self.shared
            .ctx()
            .roster
            .myself()
            .is_some_and(|u| u.is_manager)
    }

    // ---------------------------------------------------------------------
    // Host actions
    // ---------------------------------------------------------------------

    fn check_target(ctx: &SessionContext, user_id: u64) -> Result<(), HuddleError> {
        if !ctx.roster.contains(user_id) {
            return Err(HuddleError::InvalidParameter(format!("unknown user {user_id}")));
        }
        if ctx.my_id() == Some(user_id) {
            return Err(HuddleError::InvalidParameter("cannot target yourself".into()));
        }
        Ok(())
    }

    pub fn assign_host(&self, user_id: u64) -> Result<(), HuddleError> {
        {
            let ctx = self.shared.require_in_session()?;
            if !ctx.am_host() {
                return Err(HuddleError::NoRights);
            }
            Self::check_target(&ctx, user_id)?;
        }
        self.shared.send(ClientSignal::AssignHost { user_id })
    }

    pub fn set_manager(&self, user_id: u64, manager: bool) -> Result<(), HuddleError> {
        {
            let ctx = self.shared.require_in_session()?;
            if !ctx.am_host() {
                return Err(HuddleError::NoRights);
            }
            Self::check_target(&ctx, user_id)?;
        }
        self.shared.send(ClientSignal::SetManager { user_id, manager })
    }

    pub fn remove_user(&self, user_id: u64) -> Result<(), HuddleError> {
        {
            let ctx = self.shared.require_in_session()?;
            if !ctx.am_privileged() {
                return Err(HuddleError::NoRights);
            }
            Self::check_target(&ctx, user_id)?;
            if ctx.roster.user(user_id).is_some_and(|u| u.is_host) {
                return Err(HuddleError::NoRights);
            }
        }
        self.shared.send(ClientSignal::RemoveUser { user_id })
    }

    /// Rename yourself, or anyone when host.
    pub fn rename_user(&self, user_id: u64, name: &str) -> Result<(), HuddleError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(HuddleError::InvalidParameter("name must not be empty".into()));
        }
        {
            let ctx = self.shared.require_in_session()?;
            if !ctx.roster.contains(user_id) {
                return Err(HuddleError::InvalidParameter(format!("unknown user {user_id}")));
            }
            if ctx.my_id() != Some(user_id) && !ctx.am_host() {
                return Err(HuddleError::NoRights);
            }
        }
        self.shared.send(ClientSignal::Rename {
            user_id,
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::auth::{Credentials, Role};
    use crate::test_support::{fast_config, hub, join, join_with, request, wait_for, wait_until};
    use crate::transport::{HubConfig, LocalHub};

    #[tokio::test]
    async fn two_users_meet_mute_and_part() {
        let hub = hub();
        let (a, mut a_events) = join(&hub, "S1", "A", Role::Host).await;
        assert_eq!(a.users().len(), 1);
        assert!(a.is_host());

        let (b, mut b_events) = join(&hub, "S1", "B", Role::Participant).await;
        let b_id = b.myself().unwrap().user_id;
        wait_for(&mut a_events, |e| {
            matches!(e, HuddleEvent::Roster(RosterEvent::UsersJoined(users)) if users[0].user_id == b_id)
        })
        .await;
        let names: Vec<String> = a.users().into_iter().map(|u| u.name).collect();
        assert_eq!(names, vec!["A", "B"]);

        a.audio().mute(Some(b_id)).unwrap();
        wait_for(&mut b_events, |e| {
            matches!(e, HuddleEvent::Media(MediaEvent::AudioStatusChanged { user_id, status }) if *user_id == b_id && status.muted)
        })
        .await;
        assert!(b.myself().unwrap().audio.muted);

        b.leave(false).await.unwrap();
        assert_eq!(b.state(), SessionState::Left(LeaveReason::BySelf));
        wait_for(&mut a_events, |e| {
            matches!(e, HuddleEvent::Roster(RosterEvent::UsersLeft(users)) if users[0].user_id == b_id)
        })
        .await;
        assert_eq!(a.users().len(), 1);
        assert_eq!(a.host().unwrap().name, "A");
    }

    #[tokio::test]
    async fn validation_failure_keeps_state() {
        let hub = hub();
        let engine = SessionEngine::new(fast_config(), Arc::new(hub.clone()));
        let mut bad = request(&hub, "S1", "A", Role::Host);
        bad.user_name = " ".into();
        assert_eq!(engine.join(bad).await.unwrap_err(), HuddleError::NoUserName);
        assert_eq!(engine.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn rejected_join_ends_in_left_unknown() {
        let hub = hub();
        let engine = SessionEngine::new(fast_config(), Arc::new(hub.clone()));
        let mut req = request(&hub, "S1", "A", Role::Host);
        req.credentials = Credentials::KeySecret {
            key: "key".into(),
            secret: "not-the-secret".into(),
            role: Role::Host,
        };
        assert_eq!(
            engine.join(req).await.unwrap_err(),
            HuddleError::AuthWrongKeyOrSecret
        );
        assert_eq!(engine.state(), SessionState::Left(LeaveReason::Unknown));
    }

    #[tokio::test]
    async fn password_prompt_round_trip() {
        let hub = hub();
        let (_a, _) = join_with(&hub, request(&hub, "S1", "A", Role::Host).with_password("pw")).await;

        let engine = SessionEngine::new(fast_config(), Arc::new(hub.clone()));
        let mut events = engine.events().subscribe();
        let joiner = engine.clone();
        let join = tokio::spawn(async move {
            joiner.join(request(&hub, "S1", "B", Role::Participant)).await
        });

        wait_for(&mut events, |e| {
            matches!(e, HuddleEvent::Session(SessionEvent::PasswordRequired { wrong: false }))
        })
        .await;
        engine.provide_password("nope").unwrap();
        wait_for(&mut events, |e| {
            matches!(e, HuddleEvent::Session(SessionEvent::PasswordRequired { wrong: true }))
        })
        .await;
        engine.provide_password("pw").unwrap();

        let info = join.await.unwrap().unwrap();
        assert!(info.password_protected);
        assert_eq!(engine.state(), SessionState::InSession);
    }

    #[tokio::test]
    async fn cancelled_password_prompt_fails_the_join() {
        let hub = hub();
        let (_a, _) = join_with(&hub, request(&hub, "S1", "A", Role::Host).with_password("pw")).await;

        let engine = SessionEngine::new(fast_config(), Arc::new(hub.clone()));
        let mut events = engine.events().subscribe();
        let joiner = engine.clone();
        let join = tokio::spawn(async move {
            joiner.join(request(&hub, "S1", "B", Role::Participant)).await
        });
        wait_for(&mut events, |e| {
            matches!(e, HuddleEvent::Session(SessionEvent::PasswordRequired { .. }))
        })
        .await;
        engine.cancel_password().unwrap();
        assert_eq!(join.await.unwrap().unwrap_err(), HuddleError::NeedPassword);
        assert_eq!(engine.state(), SessionState::Left(LeaveReason::Unknown));
    }

    #[tokio::test]
    async fn reconnect_within_window_keeps_roster() {
        let hub = hub();
        let (a, _) = join(&hub, "S1", "A", Role::Host).await;
        let (b, mut b_events) = join(&hub, "S1", "B", Role::Participant).await;
        wait_until(|| a.users().len() == 2).await;
        let before = b.users();
        let b_id = b.myself().unwrap().user_id;

        hub.set_reachable(false);
        assert!(hub.drop_connection(b_id));
        wait_for(&mut b_events, |e| {
            matches!(e, HuddleEvent::Session(SessionEvent::StateChanged(SessionState::Reconnecting { attempt: 2 })))
        })
        .await;
        assert_eq!(b.users(), before);
        assert!(b.media().is_frozen());
        assert_eq!(b.audio().start_audio(), Err(HuddleError::Reconnecting));
        hub.set_reachable(true);

        wait_for(&mut b_events, |e| {
            matches!(e, HuddleEvent::Session(SessionEvent::StateChanged(SessionState::InSession)))
        })
        .await;
        assert_eq!(b.users(), before);
        assert!(!b.media().is_frozen());
        assert_eq!(hub.session_users("S1").len(), 2);

        // The resumed link carries signals again.
        a.chat().send_to_all("still there?").unwrap();
        wait_for(&mut b_events, |e| {
            matches!(e, HuddleEvent::Chat(ChatEvent::MessageReceived(m)) if m.text == "still there?")
        })
        .await;
    }

    #[tokio::test]
    async fn reconnect_past_window_leaves_with_network_error() {
        let hub = LocalHub::with_config(
            "key",
            "secret",
            HubConfig {
                resume_window: Duration::from_millis(50),
                ..HubConfig::default()
            },
        )
        .unwrap();
        let (_a, _) = join(&hub, "S1", "A", Role::Host).await;
        let (b, mut b_events) = join(&hub, "S1", "B", Role::Participant).await;
        let b_id = b.myself().unwrap().user_id;

        hub.set_reachable(false);
        assert!(hub.drop_connection(b_id));
        tokio::time::sleep(Duration::from_millis(120)).await;
        hub.set_reachable(true);

        wait_for(&mut b_events, |e| {
            matches!(e, HuddleEvent::Session(SessionEvent::Left(LeaveReason::NetworkError)))
        })
        .await;
        assert_eq!(b.state(), SessionState::Left(LeaveReason::NetworkError));
        assert!(b.users().is_empty());
        assert_eq!(hub.session_users("S1").len(), 1);
    }

    #[tokio::test]
    async fn host_handover_keeps_one_host() {
        let hub = hub();
        let (a, _) = join(&hub, "S1", "A", Role::Host).await;
        let (b, mut b_events) = join(&hub, "S1", "B", Role::Participant).await;
        let b_id = b.myself().unwrap().user_id;
        wait_until(|| a.users().len() == 2).await;

        assert_eq!(b.assign_host(a.myself().unwrap().user_id), Err(HuddleError::NoRights));
        a.assign_host(b_id).unwrap();
        wait_for(&mut b_events, |e| {
            matches!(e, HuddleEvent::Roster(RosterEvent::HostChanged { user_id }) if *user_id == b_id)
        })
        .await;
        assert!(b.is_host());
        assert_eq!(b.users().iter().filter(|u| u.is_host).count(), 1);
        wait_until(|| !a.is_host()).await;
    }

    #[tokio::test]
    async fn kicked_user_is_told_why() {
        let hub = hub();
        let (a, _) = join(&hub, "S1", "A", Role::Host).await;
        let (b, mut b_events) = join(&hub, "S1", "B", Role::Participant).await;
        let b_id = b.myself().unwrap().user_id;
        wait_until(|| a.users().len() == 2).await;

        a.remove_user(b_id).unwrap();
        wait_for(&mut b_events, |e| {
            matches!(e, HuddleEvent::Session(SessionEvent::Left(LeaveReason::KickedByHost)))
        })
        .await;
        assert_eq!(b.state(), SessionState::Left(LeaveReason::KickedByHost));
        assert_eq!(b.audio().start_audio(), Err(HuddleError::NotInSession));
    }

    #[tokio::test]
    async fn ending_requires_host_and_removes_everyone() {
        let hub = hub();
        let (a, _) = join(&hub, "S1", "A", Role::Host).await;
        let (b, mut b_events) = join(&hub, "S1", "B", Role::Participant).await;
        wait_until(|| a.users().len() == 2).await;

        assert_eq!(b.leave(true).await, Err(HuddleError::NoRights));
        a.leave(true).await.unwrap();
        wait_for(&mut b_events, |e| {
            matches!(e, HuddleEvent::Session(SessionEvent::Left(LeaveReason::EndedByHost)))
        })
        .await;
        assert!(hub.session_users("S1").is_empty());
    }

    #[tokio::test]
    async fn server_refusals_surface_as_events() {
        let hub = hub();
        let (a, mut a_events) = join(&hub, "S1", "A", Role::Host).await;
        a.rename_user(a.myself().unwrap().user_id, "Alice").unwrap();
        wait_for(&mut a_events, |e| {
            matches!(e, HuddleEvent::Roster(RosterEvent::UserRenamed { name, .. }) if name == "Alice")
        })
        .await;
        assert_eq!(a.myself().unwrap().name, "Alice");

        a.shared.send(ClientSignal::AssignHost { user_id: 999 }).unwrap();
        let expected = HuddleError::InvalidParameter(String::new()).code();
        wait_for(&mut a_events, |e| {
            matches!(e, HuddleEvent::Session(SessionEvent::RequestFailed { code, .. }) if *code == expected)
        })
        .await;
    }
}
