//! In-process signaling server.
//!
//! `LocalHub` owns the authoritative state of every session it hosts and
//! talks to clients over the same channels a network transport would use.
//! It backs loopback calls and every multi-client test.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::auth::{Role, TokenIssuer};
use crate::errors::HuddleError;
use crate::events::{
    ChatMessage, ChatPrivilege, HelpRequestResult, LeaveReason, MediaState, RecordingStatus,
    SubSessionInfo, SubSessionStatus, SubSessionUser, TranscriptMessage, TranscriptionStatus,
    UserInfo,
};

use super::protocol::{
    CameraControlRequest, ClientSignal, FileTransferPolicy, MediaPacket, RecordingAction, ResumeToken, ServerSignal,
    SessionPolicy, SubSessionRequest, Welcome, decode_signal, encode_signal,
};
use super::{ConnectRequest, SignalingTransport, TransportError, TransportLink};

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How long a dropped member is kept for `resume`.
    pub resume_window: Duration,
    /// Delay between "stopping" and members returning to the main session.
    pub stop_countdown: Duration,
    pub media_queue_depth: usize,
    pub max_spotlighted_users: usize,
    pub max_sub_sessions: usize,
    pub file_transfer: FileTransferPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            resume_window: Duration::from_secs(30),
            stop_countdown: Duration::from_secs(10),
            media_queue_depth: 256,
            max_spotlighted_users: 9,
            max_sub_sessions: 50,
            file_transfer: FileTransferPolicy::default(),
        }
    }
}

struct MemberLink {
    signals: mpsc::UnboundedSender<Bytes>,
    media: mpsc::Sender<MediaPacket>,
    reader: AbortHandle,
}

struct Member {
    info: UserInfo,
    /// Sub-session the member is in; `None` for the main session.
    location: Option<String>,
    link: Option<MemberLink>,
    epoch: u64,
    resume_token: ResumeToken,
    /// Muted by the host with self-unmute disallowed.
    mute_locked: bool,
}

impl Member {
    fn deliver(&self, frame: &Bytes) {
        if let Some(link) = &self.link {
            let _ = link.signals.send(frame.clone());
        }
    }

    fn drop_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.reader.abort();
        }
    }
}

fn encode(signal: &ServerSignal) -> Option<Bytes> {
    match encode_signal(signal) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::warn!("hub failed to encode signal: {e}");
            None
        }
    }
}

#[derive(Default)]
struct Effects {
    released: Vec<ResumeToken>,
    close_room: bool,
    stop_countdown: bool,
}

/// Who steers a member's camera. Unapproved grants are pending requests.
#[derive(Debug, Clone, Copy)]
struct CameraGrant {
    controller: u64,
    approved: bool,
}

struct Room {
    name: String,
    session_id: String,
    password: Option<String>,
    members: Vec<Member>,
    policy: SessionPolicy,
    /// Keyed by camera owner.
    camera_grants: HashMap<u64, CameraGrant>,
}

impl Room {
    fn new(name: &str, password: Option<String>, config: &HubConfig) -> Self {
        Self {
            name: name.to_string(),
            session_id: uuid::Uuid::new_v4().to_string(),
            password,
            members: Vec::new(),
            policy: SessionPolicy {
                allow_unmute_by_self: true,
                file_transfer: config.file_transfer.clone(),
                ..SessionPolicy::default()
            },
            camera_grants: HashMap::new(),
        }
    }

    fn member(&self, id: u64) -> Option<&Member> {
        self.members.iter().find(|m| m.info.user_id == id)
    }

    fn member_mut(&mut self, id: u64) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.info.user_id == id)
    }

    fn location_of(&self, id: u64) -> Option<String> {
        self.member(id).and_then(|m| m.location.clone())
    }

    fn is_host(&self, id: u64) -> bool {
        self.member(id).is_some_and(|m| m.info.is_host)
    }

    fn is_privileged(&self, id: u64) -> bool {
        self.member(id)
            .is_some_and(|m| m.info.is_host || m.info.is_manager)
    }

    fn send_to(&self, id: u64, signal: &ServerSignal) {
        if let (Some(member), Some(frame)) = (self.member(id), encode(signal)) {
            member.deliver(&frame);
        }
    }

    fn send_scope(&self, location: &Option<String>, except: Option<u64>, signal: &ServerSignal) {
        let Some(frame) = encode(signal) else { return };
        self.members
            .iter()
            .filter(|m| &m.location == location && Some(m.info.user_id) != except)
            .for_each(|m| m.deliver(&frame));
    }

    fn send_all(&self, signal: &ServerSignal) {
        let Some(frame) = encode(signal) else { return };
        self.members.iter().for_each(|m| m.deliver(&frame));
    }

    fn scope_roster(&self, location: &Option<String>) -> Vec<UserInfo> {
        self.members
            .iter()
            .filter(|m| &m.location == location)
            .map(|m| m.info.clone())
            .collect()
    }

    fn sub_session_users(&self, id: &str) -> Vec<SubSessionUser> {
        self.members
            .iter()
            .filter(|m| m.location.as_deref() == Some(id))
            .map(|m| SubSessionUser {
                user_id: m.info.user_id,
                name: m.info.name.clone(),
            })
            .collect()
    }

    fn sub_session_snapshot(&self) -> Vec<SubSessionInfo> {
        self.policy
            .sub_sessions
            .iter()
            .map(|s| SubSessionInfo {
                id: s.id.clone(),
                name: s.name.clone(),
                users: self.sub_session_users(&s.id),
            })
            .collect()
    }

    fn policy_snapshot(&self) -> SessionPolicy {
        SessionPolicy {
            sub_sessions: self.sub_session_snapshot(),
            ..self.policy.clone()
        }
    }

    fn welcome(&self, user_id: u64) -> Option<Welcome> {
        let member = self.member(user_id)?;
        Some(Welcome {
            session_id: self.session_id.clone(),
            session_name: self.name.clone(),
            user_id,
            resume_token: member.resume_token.clone(),
            roster: self.scope_roster(&member.location),
            password_protected: self.password.is_some(),
            policy: self.policy_snapshot(),
        })
    }

    fn broadcast_sub_session_status(&self) {
        self.send_all(&ServerSignal::SubSessionStatus {
            status: self.policy.sub_session_status,
            sub_sessions: self.sub_session_snapshot(),
        });
    }

    fn sub_session_failed(&self, to: u64, status: SubSessionStatus, message: &str) {
        self.send_to(
            to,
            &ServerSignal::SubSessionFailed {
                status,
                message: message.to_string(),
            },
        );
    }

    fn reassign_host(&mut self) {
        if self.members.is_empty() || self.members.iter().any(|m| m.info.is_host) {
            return;
        }
        let idx = self
            .members
            .iter()
            .position(|m| m.info.is_manager)
            .unwrap_or(0);
        let member = &mut self.members[idx];
        member.info.is_host = true;
        member.info.is_manager = false;
        let user_id = member.info.user_id;
        tracing::info!(session = %self.name, user_id, "host reassigned");
        self.send_all(&ServerSignal::HostChanged { user_id });
    }

    fn remove_member(&mut self, id: u64) -> Option<Member> {
        let idx = self.members.iter().position(|m| m.info.user_id == id)?;
        let mut member = self.members.remove(idx);
        member.drop_link();

        self.send_scope(
            &member.location,
            None,
            &ServerSignal::UserLeft { user_ids: vec![id] },
        );
        if let Some(sub_id) = &member.location {
            self.send_all(&ServerSignal::SubSessionUsers {
                sub_session_id: sub_id.clone(),
                users: self.sub_session_users(sub_id),
            });
        }
        if member.info.spotlighted {
            self.policy.spotlighted.retain(|u| *u != id);
            self.send_all(&ServerSignal::Spotlight {
                user_ids: self.policy.spotlighted.clone(),
            });
        }
        self.release_cameras_of(id);
        if member.info.is_host {
            self.reassign_host();
        }
        tracing::info!(session = %self.name, user_id = id, "member removed");
        Some(member)
    }

    fn relocate(&mut self, id: u64, to: Option<String>) {
        if self.member(id).is_none_or(|m| m.location == to) {
            return;
        }
        self.release_cameras_of(id);
        let Some(member) = self.member_mut(id) else { return };
        let from = std::mem::replace(&mut member.location, to.clone());
        member.info.in_sub_session = to.is_some();
        let info = member.info.clone();

        self.send_scope(&from, Some(id), &ServerSignal::UserLeft { user_ids: vec![id] });
        self.send_scope(&to, Some(id), &ServerSignal::UserJoined { users: vec![info] });
        self.send_to(
            id,
            &ServerSignal::Relocated {
                sub_session_id: to.clone(),
                roster: self.scope_roster(&to),
            },
        );
        for sub_id in [from, to].into_iter().flatten() {
            self.send_all(&ServerSignal::SubSessionUsers {
                users: self.sub_session_users(&sub_id),
                sub_session_id: sub_id,
            });
        }
    }

    fn finish_stop(&mut self) {
        if self.policy.sub_session_status != SubSessionStatus::Stopping {
            return;
        }
        let located: Vec<u64> = self
            .members
            .iter()
            .filter(|m| m.location.is_some())
            .map(|m| m.info.user_id)
            .collect();
        for id in located {
            self.relocate(id, None);
        }
        self.policy.sub_session_status = SubSessionStatus::Stopped;
        self.policy.sub_sessions.clear();
        self.broadcast_sub_session_status();
    }

    fn release_camera(&mut self, owner: u64) -> Option<CameraGrant> {
        let grant = self.camera_grants.remove(&owner)?;
        let released = ServerSignal::CameraControlReleased {
            user_id: owner,
            controller_id: grant.controller,
        };
        self.send_to(owner, &released);
        self.send_to(grant.controller, &released);
        Some(grant)
    }

    /// Drop every grant `id` takes part in, as owner or as controller.
    fn release_cameras_of(&mut self, id: u64) {
        let owners: Vec<u64> = self
            .camera_grants
            .iter()
            .filter(|(owner, grant)| **owner == id || grant.controller == id)
            .map(|(owner, _)| *owner)
            .collect();
        for owner in owners {
            self.release_camera(owner);
        }
    }

    fn apply_camera_control(
        &mut self,
        from: u64,
        request: CameraControlRequest,
    ) -> Result<(), HuddleError> {
        match request {
            CameraControlRequest::Request { user_id } => {
                let owner = self
                    .member(user_id)
                    .filter(|m| user_id != from && m.location == self.location_of(from))
                    .ok_or_else(|| {
                        HuddleError::InvalidParameter(format!("cannot control user {user_id}"))
                    })?;
                let video_on = owner.info.video_on;
                // Busy cameras and cameras without video refuse right away.
                let answer = match self.camera_grants.get(&user_id) {
                    _ if !video_on => Some(false),
                    Some(grant) if grant.controller != from => Some(false),
                    Some(grant) if grant.approved => Some(true),
                    _ => None,
                };
                if let Some(approved) = answer {
                    tracing::debug!(
                        session = %self.name,
                        owner = user_id,
                        from,
                        approved,
                        "camera control answered by hub"
                    );
                    self.send_to(from, &ServerSignal::CameraControlResult { user_id, approved });
                    return Ok(());
                }
                self.camera_grants.insert(
                    user_id,
                    CameraGrant {
                        controller: from,
                        approved: false,
                    },
                );
                self.send_to(user_id, &ServerSignal::CameraControlRequested { by: from });
            }
            CameraControlRequest::Respond {
                requester_id,
                approve,
            } => {
                let grant = self
                    .camera_grants
                    .get_mut(&from)
                    .filter(|g| g.controller == requester_id && !g.approved)
                    .ok_or_else(|| {
                        HuddleError::InvalidParameter(format!(
                            "no camera control request from {requester_id}"
                        ))
                    })?;
                if approve {
                    grant.approved = true;
                } else {
                    self.camera_grants.remove(&from);
                }
                tracing::debug!(
                    session = %self.name,
                    owner = from,
                    requester_id,
                    approve,
                    "camera control answered"
                );
                self.send_to(
                    requester_id,
                    &ServerSignal::CameraControlResult {
                        user_id: from,
                        approved: approve,
                    },
                );
            }
            CameraControlRequest::Move {
                user_id,
                action,
                range,
            } => {
                let controls = self
                    .camera_grants
                    .get(&user_id)
                    .is_some_and(|g| g.controller == from && g.approved);
                if !controls {
                    return Err(HuddleError::NoRights);
                }
                self.send_to(
                    user_id,
                    &ServerSignal::CameraMove {
                        by: from,
                        action,
                        range,
                    },
                );
            }
            CameraControlRequest::GiveUp { user_id } => {
                if !self
                    .camera_grants
                    .get(&user_id)
                    .is_some_and(|g| g.controller == from)
                {
                    return Err(HuddleError::WrongUsage("camera is not controlled".into()));
                }
                self.release_camera(user_id);
            }
            CameraControlRequest::Revoke => {
                if self.release_camera(from).is_none() {
                    return Err(HuddleError::WrongUsage("camera is not controlled".into()));
                }
            }
        }
        Ok(())
    }

    fn require_privileged(&self, from: u64) -> Result<(), HuddleError> {
        if self.is_privileged(from) {
            Ok(())
        } else {
            Err(HuddleError::NoRights)
        }
    }

    fn apply(
        &mut self,
        from: u64,
        signal: ClientSignal,
        config: &HubConfig,
    ) -> Result<Effects, HuddleError> {
        let mut effects = Effects::default();
        match signal {
            ClientSignal::Leave => {
                if let Some(member) = self.remove_member(from) {
                    effects.released.push(member.resume_token);
                }
            }
            ClientSignal::EndSession => {
                if !self.is_host(from) {
                    return Err(HuddleError::NoRights);
                }
                let ended = ServerSignal::Removed {
                    reason: LeaveReason::EndedByHost,
                };
                if let Some(frame) = encode(&ended) {
                    self.members
                        .iter()
                        .filter(|m| m.info.user_id != from)
                        .for_each(|m| m.deliver(&frame));
                }
                for mut member in self.members.drain(..) {
                    member.drop_link();
                    effects.released.push(member.resume_token);
                }
                effects.close_room = true;
            }
            ClientSignal::RemoveUser { user_id } => {
                self.require_privileged(from)?;
                if user_id == from || self.is_host(user_id) {
                    return Err(HuddleError::NoRights);
                }
                if self.member(user_id).is_none() {
                    return Err(HuddleError::InvalidParameter(format!("unknown user {user_id}")));
                }
                self.send_to(
                    user_id,
                    &ServerSignal::Removed {
                        reason: LeaveReason::KickedByHost,
                    },
                );
                if let Some(member) = self.remove_member(user_id) {
                    effects.released.push(member.resume_token);
                }
            }
            ClientSignal::AssignHost { user_id } => {
                if !self.is_host(from) {
                    return Err(HuddleError::NoRights);
                }
                if self.member(user_id).is_none() {
                    return Err(HuddleError::InvalidParameter(format!("unknown user {user_id}")));
                }
                for member in &mut self.members {
                    member.info.is_host = member.info.user_id == user_id;
                    if member.info.is_host {
                        member.info.is_manager = false;
                    }
                }
                self.send_all(&ServerSignal::HostChanged { user_id });
            }
            ClientSignal::SetManager { user_id, manager } => {
                if !self.is_host(from) || self.is_host(user_id) {
                    return Err(HuddleError::NoRights);
                }
                let member = self.member_mut(user_id).ok_or_else(|| {
                    HuddleError::InvalidParameter(format!("unknown user {user_id}"))
                })?;
                member.info.is_manager = manager;
                self.send_all(&ServerSignal::ManagerChanged { user_id, manager });
            }
            ClientSignal::Rename { user_id, name } => {
                if user_id != from && !self.is_host(from) {
                    return Err(HuddleError::NoRights);
                }
                if name.trim().is_empty() {
                    return Err(HuddleError::InvalidParameter("empty name".into()));
                }
                let member = self.member_mut(user_id).ok_or_else(|| {
                    HuddleError::InvalidParameter(format!("unknown user {user_id}"))
                })?;
                member.info.name = name.clone();
                self.send_all(&ServerSignal::UserRenamed { user_id, name });
            }
            ClientSignal::SetAudio { connected, muted } => {
                let privileged = self.is_privileged(from);
                let Some(member) = self.member_mut(from) else {
                    return Ok(effects);
                };
                if !muted && member.mute_locked && !privileged {
                    return Err(HuddleError::NoRights);
                }
                member.info.audio.connected = connected;
                member.info.audio.muted = muted;
                let location = member.location.clone();
                self.send_scope(
                    &location,
                    None,
                    &ServerSignal::AudioStatus {
                        user_id: from,
                        connected,
                        muted,
                    },
                );
            }
            ClientSignal::MuteUser { user_id } => {
                self.require_privileged(from)?;
                let member = self.member_mut(user_id).ok_or_else(|| {
                    HuddleError::InvalidParameter(format!("unknown user {user_id}"))
                })?;
                member.info.audio.muted = true;
                let connected = member.info.audio.connected;
                let location = member.location.clone();
                self.send_scope(
                    &location,
                    None,
                    &ServerSignal::AudioStatus {
                        user_id,
                        connected,
                        muted: true,
                    },
                );
            }
            ClientSignal::AskUnmute { user_id } => {
                self.require_privileged(from)?;
                let member = self.member_mut(user_id).ok_or_else(|| {
                    HuddleError::InvalidParameter(format!("unknown user {user_id}"))
                })?;
                member.mute_locked = false;
                self.send_to(user_id, &ServerSignal::UnmuteRequested { by: from });
            }
            ClientSignal::MuteAll {
                allow_unmute_by_self,
            } => {
                self.require_privileged(from)?;
                self.policy.allow_unmute_by_self = allow_unmute_by_self;
                let mut changed = Vec::new();
                for member in self.members.iter_mut().filter(|m| m.info.user_id != from) {
                    member.info.audio.muted = true;
                    member.mute_locked = !allow_unmute_by_self;
                    changed.push((member.location.clone(), member.info.user_id, member.info.audio));
                }
                for (location, user_id, audio) in changed {
                    self.send_scope(
                        &location,
                        None,
                        &ServerSignal::AudioStatus {
                            user_id,
                            connected: audio.connected,
                            muted: audio.muted,
                        },
                    );
                }
                self.send_all(&ServerSignal::UnmuteBySelfAllowed {
                    allowed: allow_unmute_by_self,
                });
            }
            ClientSignal::UnmuteAll => {
                self.require_privileged(from)?;
                let mut asked = Vec::new();
                for member in self.members.iter_mut().filter(|m| m.info.user_id != from) {
                    member.mute_locked = false;
                    if member.info.audio.muted {
                        asked.push(member.info.user_id);
                    }
                }
                for user_id in asked {
                    self.send_to(user_id, &ServerSignal::UnmuteRequested { by: from });
                }
            }
            ClientSignal::AllowUnmuteBySelf { allowed } => {
                self.require_privileged(from)?;
                self.policy.allow_unmute_by_self = allowed;
                if allowed {
                    self.members.iter_mut().for_each(|m| m.mute_locked = false);
                }
                self.send_all(&ServerSignal::UnmuteBySelfAllowed { allowed });
            }
            ClientSignal::SetVideo { on } => {
                let Some(member) = self.member_mut(from) else {
                    return Ok(effects);
                };
                member.info.video_on = on;
                let was_spotlighted = member.info.spotlighted && !on;
                if was_spotlighted {
                    member.info.spotlighted = false;
                }
                let location = member.location.clone();
                self.send_scope(&location, None, &ServerSignal::VideoStatus { user_id: from, on });
                if !on {
                    self.release_camera(from);
                }
                if was_spotlighted {
                    self.policy.spotlighted.retain(|u| *u != from);
                    self.send_all(&ServerSignal::Spotlight {
                        user_ids: self.policy.spotlighted.clone(),
                    });
                }
            }
            ClientSignal::SetShare { kind, state } => {
                if state != MediaState::Off && self.policy.share_locked && !self.is_privileged(from)
                {
                    return Err(HuddleError::ShareLocked);
                }
                let Some(member) = self.member_mut(from) else {
                    return Ok(effects);
                };
                member.info.share.kind = (state != MediaState::Off).then_some(kind);
                member.info.share.state = state;
                let location = member.location.clone();
                self.send_scope(
                    &location,
                    None,
                    &ServerSignal::ShareStatus {
                        user_id: from,
                        kind,
                        state,
                    },
                );
            }
            ClientSignal::LockShare { locked } => {
                self.require_privileged(from)?;
                self.policy.share_locked = locked;
                self.send_all(&ServerSignal::ShareLocked { locked });
                if locked {
                    let mut stopped = Vec::new();
                    for member in &mut self.members {
                        let privileged = member.info.is_host || member.info.is_manager;
                        if privileged || member.info.share.state == MediaState::Off {
                            continue;
                        }
                        if let Some(kind) = member.info.share.kind.take() {
                            stopped.push((member.location.clone(), member.info.user_id, kind));
                        }
                        member.info.share.state = MediaState::Off;
                    }
                    for (location, user_id, kind) in stopped {
                        self.send_scope(
                            &location,
                            None,
                            &ServerSignal::ShareStatus {
                                user_id,
                                kind,
                                state: MediaState::Off,
                            },
                        );
                    }
                }
            }
            ClientSignal::Spotlight { user_id, on } => {
                self.require_privileged(from)?;
                let already = self.policy.spotlighted.contains(&user_id);
                if on {
                    let member = self.member(user_id).ok_or(HuddleError::SpotlightNotEligible)?;
                    if !member.info.video_on {
                        return Err(HuddleError::SpotlightUserWithoutVideo);
                    }
                    if !already && self.policy.spotlighted.len() >= config.max_spotlighted_users {
                        return Err(HuddleError::SpotlightTooMany);
                    }
                    if !already {
                        self.policy.spotlighted.push(user_id);
                    }
                } else {
                    if !already {
                        return Err(HuddleError::SpotlightUserNotSpotlighted);
                    }
                    self.policy.spotlighted.retain(|u| *u != user_id);
                }
                if let Some(member) = self.member_mut(user_id) {
                    member.info.spotlighted = on;
                }
                self.send_all(&ServerSignal::Spotlight {
                    user_ids: self.policy.spotlighted.clone(),
                });
            }
            ClientSignal::UnspotlightAll => {
                self.require_privileged(from)?;
                self.policy.spotlighted.clear();
                self.members.iter_mut().for_each(|m| m.info.spotlighted = false);
                self.send_all(&ServerSignal::Spotlight { user_ids: vec![] });
            }
            ClientSignal::Chat { id, to, text } => {
                let privileged = self.is_privileged(from);
                match self.policy.chat_privilege {
                    ChatPrivilege::NoOne if !privileged => return Err(HuddleError::NoRights),
                    ChatPrivilege::PublicOnly if to.is_some() && !privileged => {
                        return Err(HuddleError::NoRights);
                    }
                    _ => {}
                }
                let Some(sender) = self.member(from) else {
                    return Ok(effects);
                };
                let location = sender.location.clone();
                let message = ChatMessage {
                    id,
                    sender_id: from,
                    sender_name: sender.info.name.clone(),
                    receiver_id: to,
                    text,
                    timestamp_ms: chrono::Utc::now().timestamp_millis().max(0) as u64,
                };
                let signal = ServerSignal::Chat { message };
                match to {
                    Some(target) => {
                        if self.location_of(target) != location || self.member(target).is_none() {
                            return Err(HuddleError::InvalidParameter(format!(
                                "user {target} is not reachable"
                            )));
                        }
                        self.send_to(target, &signal);
                        self.send_to(from, &signal);
                    }
                    None => self.send_scope(&location, None, &signal),
                }
            }
            ClientSignal::SetChatPrivilege { privilege } => {
                self.require_privileged(from)?;
                self.policy.chat_privilege = privilege;
                self.send_all(&ServerSignal::ChatPrivilege { privilege });
            }
            ClientSignal::Command { to, payload } => {
                let signal = ServerSignal::Command { from, payload };
                match to {
                    Some(target) => {
                        if self.member(target).is_none() {
                            return Err(HuddleError::InvalidParameter(format!(
                                "unknown user {target}"
                            )));
                        }
                        self.send_to(target, &signal);
                    }
                    None => {
                        let location = self.location_of(from);
                        self.send_scope(&location, Some(from), &signal);
                    }
                }
            }
            ClientSignal::FileChunk(chunk) => {
                if !self.policy.file_transfer.enabled {
                    return Err(HuddleError::FileTransfer("file transfer is disabled".into()));
                }
                let to = chunk.to;
                let signal = ServerSignal::FileChunk { from, chunk };
                match to {
                    Some(target) => self.send_to(target, &signal),
                    None => {
                        let location = self.location_of(from);
                        self.send_scope(&location, Some(from), &signal);
                    }
                }
            }
            ClientSignal::Recording { action } => {
                if !self.is_host(from) {
                    return Err(HuddleError::NoRights);
                }
                let current = self.policy.recording;
                let next = match (action, current) {
                    (RecordingAction::Start, RecordingStatus::Stopped) => RecordingStatus::Recording,
                    (RecordingAction::Start, _) => return Err(HuddleError::AlreadyInProgress),
                    (RecordingAction::Stop, RecordingStatus::Stopped) => {
                        return Err(HuddleError::NoRecordingInProgress);
                    }
                    (RecordingAction::Stop, _) => RecordingStatus::Stopped,
                    (RecordingAction::Pause, RecordingStatus::Recording) => RecordingStatus::Paused,
                    (RecordingAction::Resume, RecordingStatus::Paused) => {
                        RecordingStatus::Recording
                    }
                    (RecordingAction::Pause | RecordingAction::Resume, _) => {
                        return Err(HuddleError::NoRecordingInProgress);
                    }
                };
                self.policy.recording = next;
                self.send_all(&ServerSignal::RecordingStatus { status: next });
            }
            ClientSignal::Transcription { start, language } => {
                let current = self.policy.transcription;
                if start && current == TranscriptionStatus::Stopped {
                    tracing::debug!(session = %self.name, ?language, "transcription starting");
                    self.send_all(&ServerSignal::TranscriptionStatus {
                        status: TranscriptionStatus::Connecting,
                    });
                    self.policy.transcription = TranscriptionStatus::Started;
                    self.send_all(&ServerSignal::TranscriptionStatus {
                        status: TranscriptionStatus::Started,
                    });
                } else if !start && current != TranscriptionStatus::Stopped {
                    self.policy.transcription = TranscriptionStatus::Stopped;
                    self.send_all(&ServerSignal::TranscriptionStatus {
                        status: TranscriptionStatus::Stopped,
                    });
                }
            }
            ClientSignal::SubSession(request) => {
                self.apply_sub_session(from, request, config, &mut effects)?;
            }
            ClientSignal::HelpRequestResult {
                request_id,
                requester_id,
                result,
            } => {
                tracing::debug!(session = %self.name, %request_id, ?result, "help request answered");
                self.send_to(requester_id, &ServerSignal::HelpRequestResult { result });
            }
            ClientSignal::CameraControl(request) => {
                self.apply_camera_control(from, request)?;
            }
        }
        Ok(effects)
    }

    fn apply_sub_session(
        &mut self,
        from: u64,
        request: SubSessionRequest,
        config: &HubConfig,
        effects: &mut Effects,
    ) -> Result<(), HuddleError> {
        let status = self.policy.sub_session_status;
        match request {
            SubSessionRequest::Commit { names } => {
                self.require_privileged(from)?;
                if matches!(status, SubSessionStatus::Started | SubSessionStatus::Stopping) {
                    self.sub_session_failed(from, SubSessionStatus::CommitFailed, "sub-sessions are running");
                    return Ok(());
                }
                if names.is_empty()
                    || names.len() > config.max_sub_sessions
                    || names.iter().any(|n| n.trim().is_empty())
                {
                    self.sub_session_failed(from, SubSessionStatus::CommitFailed, "invalid sub-session list");
                    return Ok(());
                }
                if status == SubSessionStatus::Committed {
                    self.policy.sub_session_status = SubSessionStatus::Withdrawn;
                    self.broadcast_sub_session_status();
                    self.policy.sub_sessions.clear();
                }
                self.policy.sub_sessions = names
                    .into_iter()
                    .map(|name| SubSessionInfo {
                        id: uuid::Uuid::new_v4().to_string(),
                        name,
                        users: Vec::new(),
                    })
                    .collect();
                self.policy.sub_session_status = SubSessionStatus::Committed;
                self.broadcast_sub_session_status();
            }
            SubSessionRequest::Withdraw => {
                self.require_privileged(from)?;
                if status != SubSessionStatus::Committed {
                    self.sub_session_failed(from, SubSessionStatus::WithdrawFailed, "nothing committed");
                    return Ok(());
                }
                self.policy.sub_session_status = SubSessionStatus::Withdrawn;
                self.policy.sub_sessions.clear();
                self.broadcast_sub_session_status();
            }
            SubSessionRequest::Start => {
                self.require_privileged(from)?;
                if status != SubSessionStatus::Committed {
                    self.sub_session_failed(from, SubSessionStatus::StartFailed, "nothing committed");
                    return Ok(());
                }
                self.policy.sub_session_status = SubSessionStatus::Started;
                self.broadcast_sub_session_status();
            }
            SubSessionRequest::Stop => {
                self.require_privileged(from)?;
                if status != SubSessionStatus::Started {
                    self.sub_session_failed(from, SubSessionStatus::StopFailed, "sub-sessions are not running");
                    return Ok(());
                }
                self.policy.sub_session_status = SubSessionStatus::Stopping;
                self.broadcast_sub_session_status();
                effects.stop_countdown = true;
            }
            SubSessionRequest::Join { sub_session_id } => {
                if status != SubSessionStatus::Started {
                    return Err(HuddleError::WrongUsage("sub-sessions are not running".into()));
                }
                if !self.policy.sub_sessions.iter().any(|s| s.id == sub_session_id) {
                    return Err(HuddleError::InvalidParameter(format!(
                        "unknown sub-session {sub_session_id}"
                    )));
                }
                self.relocate(from, Some(sub_session_id));
            }
            SubSessionRequest::ReturnToMain => {
                if self.location_of(from).is_none() {
                    return Err(HuddleError::WrongUsage("not in a sub-session".into()));
                }
                self.relocate(from, None);
            }
            SubSessionRequest::RequestHelp => {
                let Some(member) = self.member(from) else { return Ok(()) };
                let Some(sub_id) = member.location.clone() else {
                    return Err(HuddleError::WrongUsage("not in a sub-session".into()));
                };
                let requester_name = member.info.name.clone();
                let Some(host) = self.members.iter().find(|m| m.info.is_host) else {
                    self.send_to(
                        from,
                        &ServerSignal::HelpRequestResult {
                            result: HelpRequestResult::Ignore,
                        },
                    );
                    return Ok(());
                };
                if host.location.is_some() {
                    self.send_to(
                        from,
                        &ServerSignal::HelpRequestResult {
                            result: HelpRequestResult::HostAlreadyInSubSession,
                        },
                    );
                    return Ok(());
                }
                let host_id = host.info.user_id;
                let sub_session_name = self
                    .policy
                    .sub_sessions
                    .iter()
                    .find(|s| s.id == sub_id)
                    .map(|s| s.name.clone())
                    .unwrap_or_default();
                self.send_to(
                    host_id,
                    &ServerSignal::HelpRequested {
                        request_id: uuid::Uuid::new_v4().to_string(),
                        requester_id: from,
                        requester_name,
                        sub_session_id: sub_id,
                        sub_session_name,
                    },
                );
            }
            SubSessionRequest::Broadcast { message } => {
                self.require_privileged(from)?;
                if status != SubSessionStatus::Started {
                    return Err(HuddleError::WrongUsage("sub-sessions are not running".into()));
                }
                let from_name = self.member(from).map(|m| m.info.name.clone()).unwrap_or_default();
                let Some(frame) = encode(&ServerSignal::SubSessionBroadcast { from_name, message })
                else {
                    return Ok(());
                };
                self.members
                    .iter()
                    .filter(|m| m.location.is_some())
                    .for_each(|m| m.deliver(&frame));
            }
        }
        Ok(())
    }
}

struct HubState {
    sessions: HashMap<String, Room>,
    tokens: HashMap<ResumeToken, (String, u64)>,
    reachable: bool,
    sdk_enabled: bool,
    next_user_id: u64,
    next_epoch: u64,
}

struct HubInner {
    issuer: TokenIssuer,
    config: HubConfig,
    state: Mutex<HubState>,
}

/// In-process signaling server implementing [`SignalingTransport`].
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for LocalHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHub")
            .field("issuer", &self.inner.issuer)
            .finish_non_exhaustive()
    }
}

impl LocalHub {
    pub fn new(sdk_key: &str, sdk_secret: &str) -> Result<Self, HuddleError> {
        Self::with_config(sdk_key, sdk_secret, HubConfig::default())
    }

    pub fn with_config(
        sdk_key: &str,
        sdk_secret: &str,
        config: HubConfig,
    ) -> Result<Self, HuddleError> {
        Ok(Self {
            inner: Arc::new(HubInner {
                issuer: TokenIssuer::new(sdk_key, sdk_secret)?,
                config,
                state: Mutex::new(HubState {
                    sessions: HashMap::new(),
                    tokens: HashMap::new(),
                    reachable: true,
                    sdk_enabled: true,
                    next_user_id: 1,
                    next_epoch: 1,
                }),
            }),
        })
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.inner.issuer
    }

    /// Users of the main session of `session_name`, in join order.
    pub fn session_users(&self, session_name: &str) -> Vec<UserInfo> {
        self.lock()
            .sessions
            .get(session_name)
            .map(|room| room.scope_roster(&None))
            .unwrap_or_default()
    }

    pub fn sub_sessions(&self, session_name: &str) -> (SubSessionStatus, Vec<SubSessionInfo>) {
        self.lock()
            .sessions
            .get(session_name)
            .map(|room| (room.policy.sub_session_status, room.sub_session_snapshot()))
            .unwrap_or_default()
    }

    /// Sever a member's link from the server side. The member stays in the
    /// roster for the resume window.
    pub fn drop_connection(&self, user_id: u64) -> bool {
        let mut state = self.lock();
        let Some((name, room)) = state
            .sessions
            .iter_mut()
            .find(|(_, room)| room.member(user_id).is_some())
        else {
            return false;
        };
        let name = name.clone();
        let Some(member) = room.member_mut(user_id) else { return false };
        member.drop_link();
        let epoch = member.epoch;
        drop(state);
        tracing::info!(session = %name, user_id, "connection dropped");
        self.schedule_expiry(name, user_id, epoch);
        true
    }

    /// While unreachable, `connect` and `resume` fail as a network would.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    pub fn set_sdk_enabled(&self, enabled: bool) {
        self.lock().sdk_enabled = enabled;
    }

    /// Emit a transcript line for `speaker_id` if transcription is running
    /// in that user's session.
    pub fn publish_transcript(&self, speaker_id: u64, text: &str, language: &str) -> bool {
        let state = self.lock();
        let Some(room) = state.sessions.values().find(|r| r.member(speaker_id).is_some()) else {
            return false;
        };
        if room.policy.transcription != TranscriptionStatus::Started {
            return false;
        }
        let speaker_name = room
            .member(speaker_id)
            .map(|m| m.info.name.clone())
            .unwrap_or_default();
        room.send_all(&ServerSignal::Transcript {
            message: TranscriptMessage {
                speaker_id,
                speaker_name,
                text: text.to_string(),
                language: language.to_string(),
                timestamp_ms: chrono::Utc::now().timestamp_millis().max(0) as u64,
            },
        });
        true
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.inner.state.lock().expect("hub state lock poisoned")
    }

    /// Wire a fresh link to `user_id` and start serving it.
    fn open_link(&self, state: &mut HubState, session: &str, user_id: u64) -> Option<TransportLink> {
        let epoch = state.next_epoch;
        state.next_epoch += 1;

        let (up_signals_tx, up_signals_rx) = mpsc::unbounded_channel();
        let (down_signals_tx, down_signals_rx) = mpsc::unbounded_channel();
        let (up_media_tx, up_media_rx) = mpsc::channel(self.inner.config.media_queue_depth);
        let (down_media_tx, down_media_rx) = mpsc::channel(self.inner.config.media_queue_depth);

        let reader = tokio::spawn(serve_link(
            self.clone(),
            session.to_string(),
            user_id,
            epoch,
            up_signals_rx,
            up_media_rx,
        ));

        let room = state.sessions.get_mut(session)?;
        let member = room.member_mut(user_id)?;
        member.drop_link();
        member.epoch = epoch;
        member.link = Some(MemberLink {
            signals: down_signals_tx,
            media: down_media_tx,
            reader: reader.abort_handle(),
        });
        let welcome = room.welcome(user_id)?;
        Some(TransportLink {
            welcome,
            signals_tx: up_signals_tx,
            signals_rx: down_signals_rx,
            media_tx: up_media_tx,
            media_rx: down_media_rx,
        })
    }

    fn handle_signal(&self, session: &str, from: u64, signal: ClientSignal) {
        let mut state = self.lock();
        let HubState {
            sessions, tokens, ..
        } = &mut *state;
        let Some(room) = sessions.get_mut(session) else { return };
        if room.member(from).is_none() {
            return;
        }
        match room.apply(from, signal, &self.inner.config) {
            Ok(effects) => {
                for token in &effects.released {
                    tokens.remove(token);
                }
                if effects.close_room || room.members.is_empty() {
                    tracing::info!(session, "session closed");
                    sessions.remove(session);
                } else if effects.stop_countdown {
                    let hub = self.clone();
                    let session = session.to_string();
                    let countdown = self.inner.config.stop_countdown;
                    tokio::spawn(async move {
                        tokio::time::sleep(countdown).await;
                        if let Some(room) = hub.lock().sessions.get_mut(&session) {
                            room.finish_stop();
                        }
                    });
                }
            }
            Err(e) => {
                tracing::debug!(session, user_id = from, code = e.code(), "request refused: {e}");
                room.send_to(
                    from,
                    &ServerSignal::Error {
                        code: e.code(),
                        message: e.to_string(),
                    },
                );
            }
        }
    }

    fn relay_media(&self, session: &str, from: u64, packet: MediaPacket) {
        let state = self.lock();
        let Some(room) = state.sessions.get(session) else { return };
        let Some(sender) = room.member(from) else { return };
        for member in room
            .members
            .iter()
            .filter(|m| m.location == sender.location && m.info.user_id != from)
        {
            if let Some(link) = &member.link {
                // A full downlink drops the packet like a congested network would.
                let _ = link.media.try_send(packet.clone());
            }
        }
    }

    fn link_lost(&self, session: &str, user_id: u64, epoch: u64) {
        {
            let mut state = self.lock();
            let Some(member) = state
                .sessions
                .get_mut(session)
                .and_then(|room| room.member_mut(user_id))
            else {
                return;
            };
            if member.epoch != epoch {
                return;
            }
            member.link = None;
        }
        tracing::info!(session, user_id, "link lost, holding member for resume");
        self.schedule_expiry(session.to_string(), user_id, epoch);
    }

    fn schedule_expiry(&self, session: String, user_id: u64, epoch: u64) {
        let hub = self.clone();
        let window = self.inner.config.resume_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let mut state = hub.lock();
            let HubState {
                sessions, tokens, ..
            } = &mut *state;
            let Some(room) = sessions.get_mut(&session) else { return };
            let expired = room
                .member(user_id)
                .is_some_and(|m| m.epoch == epoch && m.link.is_none());
            if !expired {
                return;
            }
            tracing::info!(session = %session, user_id, "resume window elapsed");
            if let Some(member) = room.remove_member(user_id) {
                tokens.remove(&member.resume_token);
            }
            if room.members.is_empty() {
                sessions.remove(&session);
            }
        });
    }
}

async fn serve_link(
    hub: LocalHub,
    session: String,
    user_id: u64,
    epoch: u64,
    mut signals: mpsc::UnboundedReceiver<Bytes>,
    mut media: mpsc::Receiver<MediaPacket>,
) {
    let mut media_open = true;
    loop {
        tokio::select! {
            frame = signals.recv() => match frame {
                Some(frame) => match decode_signal::<ClientSignal>(&frame) {
                    Ok(signal) => hub.handle_signal(&session, user_id, signal),
                    Err(e) => tracing::warn!(session = %session, user_id, "bad client signal: {e}"),
                },
                None => break,
            },
            packet = media.recv(), if media_open => match packet {
                Some(packet) => hub.relay_media(&session, user_id, MediaPacket { sender_id: user_id, ..packet }),
                None => media_open = false,
            },
        }
    }
    hub.link_lost(&session, user_id, epoch);
}

#[async_trait]
impl SignalingTransport for LocalHub {
    async fn connect(&self, request: ConnectRequest) -> Result<TransportLink, TransportError> {
        let mut state = self.lock();
        if !state.reachable {
            return Err(TransportError::Unreachable("hub offline".into()));
        }
        if !state.sdk_enabled {
            return Err(TransportError::Rejected(HuddleError::AuthDisabled));
        }
        let claims = self
            .inner
            .issuer
            .verify(&request.token)
            .map_err(TransportError::Rejected)?;
        if claims.tpc != request.session_name {
            return Err(TransportError::Rejected(
                HuddleError::TokenMismatchedSessionName,
            ));
        }

        let password = request.password.clone().filter(|p| !p.is_empty());
        let room = state
            .sessions
            .entry(request.session_name.clone())
            .or_insert_with(|| {
                tracing::info!(session = %request.session_name, "session created");
                Room::new(&request.session_name, password.clone(), &self.inner.config)
            });
        if let Some(expected) = &room.password {
            match &password {
                None => return Err(TransportError::PasswordRequired),
                Some(given) if given != expected => return Err(TransportError::PasswordWrong),
                Some(_) => {}
            }
        }

        let user_id = state.next_user_id;
        state.next_user_id += 1;
        let resume_token = ResumeToken(uuid::Uuid::new_v4().to_string());
        state
            .tokens
            .insert(resume_token.clone(), (request.session_name.clone(), user_id));

        let Some(room) = state.sessions.get_mut(&request.session_name) else {
            return Err(TransportError::Closed);
        };
        let mut info = UserInfo::new(user_id, request.user_name.clone());
        info.custom_id = claims.user_identity.clone().or(request.custom_user_id.clone());
        info.is_host = claims.role() == Some(Role::Host) && !room.members.iter().any(|m| m.info.is_host);

        room.send_scope(&None, None, &ServerSignal::UserJoined {
            users: vec![info.clone()],
        });
        room.members.push(Member {
            info,
            location: None,
            link: None,
            epoch: 0,
            resume_token,
            mute_locked: false,
        });
        tracing::info!(session = %request.session_name, user_id, "member joined");

        self.open_link(&mut state, &request.session_name, user_id)
            .ok_or(TransportError::Closed)
    }

    async fn resume(&self, token: &ResumeToken) -> Result<TransportLink, TransportError> {
        let mut state = self.lock();
        if !state.reachable {
            return Err(TransportError::Unreachable("hub offline".into()));
        }
        let (session, user_id) = state
            .tokens
            .get(token)
            .cloned()
            .ok_or(TransportError::ResumeRejected)?;
        tracing::info!(session = %session, user_id, "member resumed");
        self.open_link(&mut state, &session, user_id)
            .ok_or(TransportError::ResumeRejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CameraMove;
    use chrono::Duration as TokenTtl;

    fn hub() -> LocalHub {
        LocalHub::new("key", "secret").unwrap()
    }

    fn request(hub: &LocalHub, session: &str, name: &str, role: Role) -> ConnectRequest {
        ConnectRequest {
            session_name: session.into(),
            user_name: name.into(),
            token: hub.issuer().issue(session, role, None, TokenTtl::hours(1)).unwrap(),
            password: None,
            custom_user_id: None,
        }
    }

    async fn next_signal(link: &mut TransportLink) -> ServerSignal {
        let frame = tokio::time::timeout(Duration::from_secs(1), link.signals_rx.recv())
            .await
            .expect("signal timeout")
            .expect("link closed");
        decode_signal(&frame).unwrap()
    }

    fn send(link: &TransportLink, signal: ClientSignal) {
        link.signals_tx.send(encode_signal(&signal).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn first_host_token_gets_the_host_role() {
        let hub = hub();
        let a = hub.connect(request(&hub, "S1", "A", Role::Host)).await.unwrap();
        let b = hub.connect(request(&hub, "S1", "B", Role::Host)).await.unwrap();
        assert!(a.welcome.roster[0].is_host);
        let roster = b.welcome.roster;
        assert_eq!(roster.len(), 2);
        assert_eq!(roster.iter().filter(|u| u.is_host).count(), 1);
    }

    #[tokio::test]
    async fn rejects_bad_tokens_and_passwords() {
        let hub = hub();
        let other = TokenIssuer::new("key", "wrong").unwrap();
        let mut req = request(&hub, "S1", "A", Role::Host);
        req.token = other.issue("S1", Role::Host, None, TokenTtl::hours(1)).unwrap();
        assert_eq!(
            hub.connect(req).await.unwrap_err(),
            TransportError::Rejected(HuddleError::AuthWrongKeyOrSecret)
        );

        let mut req = request(&hub, "S1", "A", Role::Host);
        req.password = Some("pw".into());
        let _a = hub.connect(req).await.unwrap();

        let req = request(&hub, "S1", "B", Role::Participant);
        assert_eq!(hub.connect(req.clone()).await.unwrap_err(), TransportError::PasswordRequired);
        let wrong = ConnectRequest {
            password: Some("nope".into()),
            ..req.clone()
        };
        assert_eq!(hub.connect(wrong).await.unwrap_err(), TransportError::PasswordWrong);
        let right = ConnectRequest {
            password: Some("pw".into()),
            ..req
        };
        assert!(hub.connect(right).await.unwrap().welcome.password_protected);

        hub.set_sdk_enabled(false);
        assert_eq!(
            hub.connect(request(&hub, "S2", "C", Role::Host)).await.unwrap_err(),
            TransportError::Rejected(HuddleError::AuthDisabled)
        );
    }

    #[tokio::test]
    async fn host_leaving_hands_over_to_a_manager() {
        let hub = hub();
        let a = hub.connect(request(&hub, "S1", "A", Role::Host)).await.unwrap();
        let mut b = hub.connect(request(&hub, "S1", "B", Role::Participant)).await.unwrap();
        let c = hub.connect(request(&hub, "S1", "C", Role::Participant)).await.unwrap();
        let c_id = c.welcome.user_id;

        send(&a, ClientSignal::SetManager { user_id: c_id, manager: true });
        assert!(matches!(next_signal(&mut b).await, ServerSignal::UserJoined { .. }));
        assert_eq!(
            next_signal(&mut b).await,
            ServerSignal::ManagerChanged { user_id: c_id, manager: true }
        );

        send(&a, ClientSignal::Leave);
        assert!(matches!(next_signal(&mut b).await, ServerSignal::UserLeft { .. }));
        assert_eq!(next_signal(&mut b).await, ServerSignal::HostChanged { user_id: c_id });
        let users = hub.session_users("S1");
        assert_eq!(users.iter().filter(|u| u.is_host).count(), 1);
    }

    async fn next_matching(
        link: &mut TransportLink,
        wanted: impl Fn(&ServerSignal) -> bool,
    ) -> ServerSignal {
        loop {
            let signal = next_signal(link).await;
            if wanted(&signal) {
                return signal;
            }
        }
    }

    fn camera(request: CameraControlRequest) -> ClientSignal {
        ClientSignal::CameraControl(request)
    }

    #[tokio::test]
    async fn camera_grant_follows_its_controller() {
        let hub = hub();
        let mut a = hub.connect(request(&hub, "S1", "A", Role::Host)).await.unwrap();
        let mut b = hub.connect(request(&hub, "S1", "B", Role::Participant)).await.unwrap();
        let mut c = hub.connect(request(&hub, "S1", "C", Role::Participant)).await.unwrap();
        let (a_id, b_id, c_id) = (a.welcome.user_id, b.welcome.user_id, c.welcome.user_id);

        send(&c, camera(CameraControlRequest::Move {
            user_id: b_id,
            action: CameraMove::Left,
            range: 10,
        }));
        assert_eq!(
            next_matching(&mut c, |s| matches!(s, ServerSignal::Error { .. })).await,
            ServerSignal::Error {
                code: HuddleError::NoRights.code(),
                message: HuddleError::NoRights.to_string()
            }
        );

        send(&b, ClientSignal::SetVideo { on: true });
        next_matching(&mut a, |s| matches!(s, ServerSignal::VideoStatus { on: true, .. })).await;
        next_matching(&mut c, |s| matches!(s, ServerSignal::VideoStatus { on: true, .. })).await;

        send(&a, camera(CameraControlRequest::Request { user_id: b_id }));
        assert_eq!(
            next_matching(&mut b, |s| matches!(s, ServerSignal::CameraControlRequested { .. })).await,
            ServerSignal::CameraControlRequested { by: a_id }
        );
        send(&c, camera(CameraControlRequest::Request { user_id: b_id }));
        assert_eq!(
            next_matching(&mut c, |s| matches!(s, ServerSignal::CameraControlResult { .. })).await,
            ServerSignal::CameraControlResult { user_id: b_id, approved: false }
        );

        send(&b, camera(CameraControlRequest::Respond { requester_id: a_id, approve: true }));
        assert_eq!(
            next_matching(&mut a, |s| matches!(s, ServerSignal::CameraControlResult { .. })).await,
            ServerSignal::CameraControlResult { user_id: b_id, approved: true }
        );
        send(&a, camera(CameraControlRequest::Move {
            user_id: b_id,
            action: CameraMove::ZoomOut,
            range: 30,
        }));
        assert_eq!(
            next_matching(&mut b, |s| matches!(s, ServerSignal::CameraMove { .. })).await,
            ServerSignal::CameraMove { by: a_id, action: CameraMove::ZoomOut, range: 30 }
        );

        // The controller leaving frees the camera for the next request.
        send(&a, ClientSignal::Leave);
        assert_eq!(
            next_matching(&mut b, |s| matches!(s, ServerSignal::CameraControlReleased { .. })).await,
            ServerSignal::CameraControlReleased { user_id: b_id, controller_id: a_id }
        );
        send(&c, camera(CameraControlRequest::Request { user_id: b_id }));
        assert_eq!(
            next_matching(&mut b, |s| matches!(s, ServerSignal::CameraControlRequested { .. })).await,
            ServerSignal::CameraControlRequested { by: c_id }
        );
    }

    #[tokio::test]
    async fn participants_cannot_use_host_actions() {
        let hub = hub();
        let a = hub.connect(request(&hub, "S1", "A", Role::Host)).await.unwrap();
        let mut b = hub.connect(request(&hub, "S1", "B", Role::Participant)).await.unwrap();
        send(&b, ClientSignal::MuteUser { user_id: a.welcome.user_id });
        assert_eq!(
            next_signal(&mut b).await,
            ServerSignal::Error {
                code: HuddleError::NoRights.code(),
                message: HuddleError::NoRights.to_string()
            }
        );
    }

    #[tokio::test]
    async fn dropped_member_is_held_then_resumed() {
        let hub = LocalHub::with_config(
            "key",
            "secret",
            HubConfig {
                resume_window: Duration::from_millis(100),
                ..HubConfig::default()
            },
        )
        .unwrap();
        let _a = hub.connect(request(&hub, "S1", "A", Role::Host)).await.unwrap();
        let mut b = hub.connect(request(&hub, "S1", "B", Role::Participant)).await.unwrap();
        let b_id = b.welcome.user_id;

        assert!(hub.drop_connection(b_id));
        assert!(b.signals_rx.recv().await.is_none());
        assert_eq!(hub.session_users("S1").len(), 2);

        let resumed = hub.resume(&b.welcome.resume_token).await.unwrap();
        assert_eq!(resumed.welcome.user_id, b_id);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hub.session_users("S1").len(), 2);

        drop(resumed);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(hub.session_users("S1").len(), 1);
        assert_eq!(
            hub.resume(&b.welcome.resume_token).await.unwrap_err(),
            TransportError::ResumeRejected
        );
    }

    #[tokio::test]
    async fn media_stays_inside_its_scope() {
        use huddle_media::{EncodedPacket, StreamKind};

        let hub = hub();
        let a = hub.connect(request(&hub, "S1", "A", Role::Host)).await.unwrap();
        let mut b = hub.connect(request(&hub, "S1", "B", Role::Participant)).await.unwrap();
        let packet = EncodedPacket {
            kind: StreamKind::Audio,
            sequence: 1,
            timestamp_us: 0,
            keyframe: true,
            payload: Bytes::from_static(b"x"),
        };
        a.media_tx
            .send(MediaPacket { sender_id: 0, packet: packet.clone() })
            .await
            .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), b.media_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.sender_id, a.welcome.user_id);
        assert_eq!(got.packet, packet);
    }
}
