//! Sub-sessions (breakout rooms): staging, commit, start/stop, moving
//! between rooms and help requests.
//!
//! The server runs the authoritative state machine. The client keeps the
//! prepare list, the last known status and at most one open help dialog.

use std::sync::Arc;

use crate::errors::HuddleError;
use crate::events::{HelpRequestInfo, HelpRequestResult, SubSessionInfo, SubSessionStatus};
use crate::session::Shared;
use crate::transport::{ClientSignal, SubSessionRequest};

#[derive(Debug, Default)]
pub(crate) struct SubSessionState {
    pub prepare: Vec<String>,
    /// A commit was sent and its outcome has not arrived yet.
    pub commit_pending: bool,
    /// Sub-session the local user is in.
    pub current: Option<String>,
    pub last_failure: Option<SubSessionStatus>,
    pub help_dialog: Option<HelpRequestInfo>,
}

impl SubSessionState {
    pub fn on_status(&mut self, status: SubSessionStatus) {
        match status {
            SubSessionStatus::Committed if self.commit_pending => {
                self.commit_pending = false;
                self.prepare.clear();
            }
            SubSessionStatus::None | SubSessionStatus::Withdrawn | SubSessionStatus::Stopped => {
                self.help_dialog = None;
            }
            _ => {}
        }
    }

    pub fn on_failure(&mut self, status: SubSessionStatus) {
        if status == SubSessionStatus::CommitFailed {
            self.commit_pending = false;
        }
        self.last_failure = Some(status);
    }
}

/// Sub-session capability object, obtained from
/// [`SessionEngine::sub_sessions`](crate::SessionEngine::sub_sessions).
#[derive(Clone)]
pub struct SubSessionHelper {
    shared: Arc<Shared>,
}

impl SubSessionHelper {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn send(&self, request: SubSessionRequest) -> Result<(), HuddleError> {
        self.shared.send(ClientSignal::SubSession(request))
    }

    fn require_privileged(&self) -> Result<(), HuddleError> {
        let ctx = self.shared.require_in_session()?;
        if ctx.am_privileged() {
            Ok(())
        } else {
            Err(HuddleError::NoRights)
        }
    }

    // Prepare list -------------------------------------------------------

    pub fn add_to_prepare_list(&self, name: &str) -> Result<(), HuddleError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(HuddleError::InvalidParameter("sub-session name is empty".into()));
        }
        let mut ctx = self.shared.ctx();
        if ctx.sub.prepare.len() >= self.shared.config.max_sub_sessions {
            return Err(HuddleError::InvalidParameter(format!(
                "at most {} sub-sessions",
                self.shared.config.max_sub_sessions
            )));
        }
        ctx.sub.prepare.push(name.to_string());
        Ok(())
    }

    /// Removes the first entry with this name.
    pub fn remove_from_prepare_list(&self, name: &str) -> bool {
        let mut ctx = self.shared.ctx();
        match ctx.sub.prepare.iter().position(|n| n == name.trim()) {
            Some(idx) => {
                ctx.sub.prepare.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn clear_prepare_list(&self) {
        self.shared.ctx().sub.prepare.clear();
    }

    pub fn prepare_list(&self) -> Vec<String> {
        self.shared.ctx().sub.prepare.clone()
    }

    // Coordinator --------------------------------------------------------

    /// Replace the committed set with the prepare list. The list is cleared
    /// once the server confirms; a refusal arrives as
    /// `SubSessionEvent::OperationFailed`.
    pub fn commit(&self) -> Result<(), HuddleError> {
        let names = {
            let mut ctx = self.shared.require_in_session()?;
            if !ctx.am_privileged() {
                return Err(HuddleError::NoRights);
            }
            if ctx.sub.prepare.is_empty() {
                return Err(HuddleError::InvalidParameter("prepare list is empty".into()));
            }
            ctx.sub.commit_pending = true;
            ctx.sub.prepare.clone()
        };
        tracing::info!(count = names.len(), "committing sub-sessions");
        let sent = self.send(SubSessionRequest::Commit { names });
        if sent.is_err() {
            self.shared.ctx().sub.commit_pending = false;
        }
        sent
    }

    pub fn withdraw(&self) -> Result<(), HuddleError> {
        self.require_privileged()?;
        self.send(SubSessionRequest::Withdraw)
    }

    pub fn start(&self) -> Result<(), HuddleError> {
        self.require_privileged()?;
        self.send(SubSessionRequest::Start)
    }

    /// Members return to the main session after the stopping countdown.
    pub fn stop(&self) -> Result<(), HuddleError> {
        self.require_privileged()?;
        self.send(SubSessionRequest::Stop)
    }

    /// Message shown to everyone currently in a sub-session.
    pub fn broadcast_message(&self, message: &str) -> Result<(), HuddleError> {
        if message.trim().is_empty() {
            return Err(HuddleError::InvalidParameter("message is empty".into()));
        }
        {
            let ctx = self.shared.require_in_session()?;
            if !ctx.am_privileged() {
                return Err(HuddleError::NoRights);
            }
            if !ctx.policy.sub_session_status.is_running() {
                return Err(HuddleError::WrongUsage("sub-sessions are not running".into()));
            }
        }
        self.send(SubSessionRequest::Broadcast {
            message: message.to_string(),
        })
    }

    // Participants -------------------------------------------------------

    pub fn join(&self, sub_session_id: &str) -> Result<(), HuddleError> {
        {
            let ctx = self.shared.require_in_session()?;
            if ctx.policy.sub_session_status != SubSessionStatus::Started {
                return Err(HuddleError::WrongUsage("sub-sessions are not running".into()));
            }
            if !ctx.policy.sub_sessions.iter().any(|s| s.id == sub_session_id) {
                return Err(HuddleError::InvalidParameter(format!(
                    "unknown sub-session {sub_session_id}"
                )));
            }
            if ctx.sub.current.as_deref() == Some(sub_session_id) {
                return Ok(());
            }
        }
        self.send(SubSessionRequest::Join {
            sub_session_id: sub_session_id.to_string(),
        })
    }

    pub fn return_to_main(&self) -> Result<(), HuddleError> {
        self.require_in_sub_session()?;
        self.send(SubSessionRequest::ReturnToMain)
    }

    /// Ask the host for help. The outcome arrives as
    /// `SubSessionEvent::HelpRequestResult`.
    pub fn request_help(&self) -> Result<(), HuddleError> {
        self.require_in_sub_session()?;
        self.send(SubSessionRequest::RequestHelp)
    }

    fn require_in_sub_session(&self) -> Result<(), HuddleError> {
        let ctx = self.shared.require_in_session()?;
        if ctx.sub.current.is_none() {
            return Err(HuddleError::WrongUsage("not in a sub-session".into()));
        }
        Ok(())
    }

    // State --------------------------------------------------------------

    pub fn status(&self) -> SubSessionStatus {
        self.shared.ctx().policy.sub_session_status
    }

    /// The committed set with current members.
    pub fn committed(&self) -> Vec<SubSessionInfo> {
        self.shared.ctx().policy.sub_sessions.clone()
    }

    pub fn last_failure(&self) -> Option<SubSessionStatus> {
        self.shared.ctx().sub.last_failure
    }

    pub fn is_started(&self) -> bool {
        self.status() == SubSessionStatus::Started
    }

    pub fn current_sub_session(&self) -> Option<SubSessionInfo> {
        let ctx = self.shared.ctx();
        let id = ctx.sub.current.as_ref()?;
        ctx.policy.sub_sessions.iter().find(|s| &s.id == id).cloned()
    }

    /// The open help dialog, if any.
    pub fn pending_help_request(&self) -> Option<HelpRequest> {
        let info = self.shared.ctx().sub.help_dialog.clone()?;
        Some(HelpRequest {
            shared: self.shared.clone(),
            info,
        })
    }
}

/// A help request shown to the host. Resolving it closes the dialog.
pub struct HelpRequest {
    shared: Arc<Shared>,
    info: HelpRequestInfo,
}

impl HelpRequest {
    pub fn info(&self) -> &HelpRequestInfo {
        &self.info
    }

    fn close(&self) -> Result<(), HuddleError> {
        let mut ctx = self.shared.require_in_session()?;
        match &ctx.sub.help_dialog {
            Some(open) if open.request_id == self.info.request_id => {
                ctx.sub.help_dialog = None;
                Ok(())
            }
            _ => Err(HuddleError::WrongUsage("help request already resolved".into())),
        }
    }

    pub fn ignore(self) -> Result<(), HuddleError> {
        self.close()?;
        self.shared.send(ClientSignal::HelpRequestResult {
            request_id: self.info.request_id.clone(),
            requester_id: self.info.requester_id,
            result: HelpRequestResult::Ignore,
        })
    }

    /// Go to the requester's sub-session.
    pub fn join_sub_session(self) -> Result<(), HuddleError> {
        self.close()?;
        self.shared.send(ClientSignal::SubSession(SubSessionRequest::Join {
            sub_session_id: self.info.sub_session_id.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::auth::Role;
    use crate::events::{HuddleEvent, RosterEvent, SubSessionEvent};
    use crate::test_support::{join, wait_for, wait_until};
    use crate::transport::{HubConfig, LocalHub};

    fn status_is(status: SubSessionStatus) -> impl Fn(&HuddleEvent) -> bool {
        move |e| {
            matches!(e, HuddleEvent::SubSession(SubSessionEvent::StatusChanged { status: s, .. }) if *s == status)
        }
    }

    #[test]
    fn commit_confirmation_clears_the_prepare_list() {
        let mut state = SubSessionState {
            prepare: vec!["R1".into()],
            commit_pending: true,
            ..SubSessionState::default()
        };
        state.on_status(SubSessionStatus::Withdrawn);
        assert_eq!(state.prepare.len(), 1);
        state.on_status(SubSessionStatus::Committed);
        assert!(state.prepare.is_empty());
        assert!(!state.commit_pending);

        state.commit_pending = true;
        state.on_failure(SubSessionStatus::CommitFailed);
        assert!(!state.commit_pending);
        assert_eq!(state.last_failure, Some(SubSessionStatus::CommitFailed));
    }

    #[tokio::test]
    async fn second_commit_withdraws_the_first_set() {
        let hub = LocalHub::new("key", "secret").unwrap();
        let (a, mut events) = join(&hub, "S1", "A", Role::Host).await;
        let subs = a.sub_sessions();

        subs.add_to_prepare_list("R1").unwrap();
        subs.add_to_prepare_list("R2").unwrap();
        subs.commit().unwrap();
        wait_for(&mut events, status_is(SubSessionStatus::Committed)).await;
        assert!(subs.prepare_list().is_empty());
        let first: Vec<String> = subs.committed().into_iter().map(|s| s.id).collect();
        assert_eq!(first.len(), 2);

        subs.add_to_prepare_list("R3").unwrap();
        subs.commit().unwrap();
        wait_for(&mut events, status_is(SubSessionStatus::Withdrawn)).await;
        wait_for(&mut events, status_is(SubSessionStatus::Committed)).await;

        let (status, committed) = hub.sub_sessions("S1");
        assert_eq!(status, SubSessionStatus::Committed);
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].name, "R3");
        assert!(!first.contains(&committed[0].id));
        assert_eq!(subs.committed(), committed);
    }

    #[tokio::test]
    async fn participants_cannot_coordinate() {
        let hub = LocalHub::new("key", "secret").unwrap();
        let (_a, _) = join(&hub, "S1", "A", Role::Host).await;
        let (b, _) = join(&hub, "S1", "B", Role::Participant).await;
        let subs = b.sub_sessions();
        subs.add_to_prepare_list("R1").unwrap();
        assert_eq!(subs.commit(), Err(HuddleError::NoRights));
        assert_eq!(subs.start(), Err(HuddleError::NoRights));
        assert!(matches!(subs.join("nope"), Err(HuddleError::WrongUsage(_))));
        assert!(matches!(subs.request_help(), Err(HuddleError::WrongUsage(_))));
    }

    #[tokio::test]
    async fn start_failure_keeps_status() {
        let hub = LocalHub::new("key", "secret").unwrap();
        let (a, mut events) = join(&hub, "S1", "A", Role::Host).await;
        a.sub_sessions().start().unwrap();
        wait_for(&mut events, |e| {
            matches!(
                e,
                HuddleEvent::SubSession(SubSessionEvent::OperationFailed {
                    status: SubSessionStatus::StartFailed,
                    ..
                })
            )
        })
        .await;
        assert_eq!(a.sub_sessions().status(), SubSessionStatus::None);
        assert_eq!(a.sub_sessions().last_failure(), Some(SubSessionStatus::StartFailed));
    }

    #[tokio::test]
    async fn joining_swaps_the_roster_and_stop_brings_everyone_back() {
        let hub = LocalHub::with_config(
            "key",
            "secret",
            HubConfig {
                stop_countdown: Duration::from_millis(30),
                ..HubConfig::default()
            },
        )
        .unwrap();
        let (a, mut a_events) = join(&hub, "S1", "A", Role::Host).await;
        let (b, mut b_events) = join(&hub, "S1", "B", Role::Participant).await;
        let b_id = b.myself().unwrap().user_id;

        a.sub_sessions().add_to_prepare_list("R1").unwrap();
        a.sub_sessions().commit().unwrap();
        wait_for(&mut a_events, status_is(SubSessionStatus::Committed)).await;
        a.sub_sessions().start().unwrap();
        wait_for(&mut b_events, status_is(SubSessionStatus::Started)).await;

        let room = b.sub_sessions().committed()[0].id.clone();
        b.sub_sessions().join(&room).unwrap();
        wait_for(&mut b_events, |e| {
            matches!(e, HuddleEvent::SubSession(SubSessionEvent::Entered { sub_session_id: Some(_) }))
        })
        .await;
        assert_eq!(b.users().len(), 1);
        assert_eq!(b.sub_sessions().current_sub_session().unwrap().name, "R1");
        wait_for(&mut a_events, |e| {
            matches!(e, HuddleEvent::Roster(RosterEvent::UsersLeft(users)) if users[0].user_id == b_id)
        })
        .await;
        assert_eq!(a.users().len(), 1);

        b.sub_sessions().broadcast_message("hi").unwrap_err();
        a.sub_sessions().broadcast_message("two minutes left").unwrap();
        wait_for(&mut b_events, |e| {
            matches!(e, HuddleEvent::SubSession(SubSessionEvent::BroadcastMessage { message, .. }) if message == "two minutes left")
        })
        .await;

        a.sub_sessions().stop().unwrap();
        wait_for(&mut b_events, |e| {
            matches!(e, HuddleEvent::SubSession(SubSessionEvent::Entered { sub_session_id: None }))
        })
        .await;
        assert_eq!(b.users().len(), 2);
        assert!(b.sub_sessions().current_sub_session().is_none());
        wait_until(|| a.sub_sessions().status() == SubSessionStatus::Stopped).await;
        assert_eq!(a.users().len(), 2);
    }

    #[tokio::test]
    async fn host_keeps_one_help_dialog_open() {
        let hub = LocalHub::new("key", "secret").unwrap();
        let (a, mut a_events) = join(&hub, "S1", "A", Role::Host).await;
        let (b, mut b_events) = join(&hub, "S1", "B", Role::Participant).await;
        let (c, mut c_events) = join(&hub, "S1", "C", Role::Participant).await;

        a.sub_sessions().add_to_prepare_list("R1").unwrap();
        a.sub_sessions().commit().unwrap();
        wait_for(&mut a_events, status_is(SubSessionStatus::Committed)).await;
        a.sub_sessions().start().unwrap();
        wait_for(&mut b_events, status_is(SubSessionStatus::Started)).await;
        wait_for(&mut c_events, status_is(SubSessionStatus::Started)).await;
        let room = a.sub_sessions().committed()[0].id.clone();

        for (user, events) in [(&b, &mut b_events), (&c, &mut c_events)] {
            user.sub_sessions().join(&room).unwrap();
            wait_for(events, |e| {
                matches!(e, HuddleEvent::SubSession(SubSessionEvent::Entered { sub_session_id: Some(_) }))
            })
            .await;
        }

        b.sub_sessions().request_help().unwrap();
        wait_for(&mut b_events, |e| {
            matches!(e, HuddleEvent::SubSession(SubSessionEvent::HelpRequestResult(HelpRequestResult::Idle)))
        })
        .await;
        wait_for(&mut a_events, |e| {
            matches!(e, HuddleEvent::SubSession(SubSessionEvent::HelpRequested(info)) if info.requester_name == "B")
        })
        .await;

        c.sub_sessions().request_help().unwrap();
        wait_for(&mut c_events, |e| {
            matches!(e, HuddleEvent::SubSession(SubSessionEvent::HelpRequestResult(HelpRequestResult::Busy)))
        })
        .await;

        let request = a.sub_sessions().pending_help_request().unwrap();
        assert_eq!(request.info().requester_name, "B");
        request.join_sub_session().unwrap();
        wait_for(&mut a_events, |e| {
            matches!(e, HuddleEvent::SubSession(SubSessionEvent::Entered { sub_session_id: Some(id) }) if *id == room)
        })
        .await;
        assert!(a.sub_sessions().pending_help_request().is_none());
        assert_eq!(a.users().len(), 3);
    }
}
