use std::sync::Arc;

use crate::errors::HuddleError;
use crate::events::{ChatMessage, ChatPrivilege};
use crate::session::Shared;
use crate::transport::ClientSignal;

/// In-session chat. Sent messages come back through the server and are
/// stored and announced like any other message.
#[derive(Clone)]
pub struct ChatHelper {
    shared: Arc<Shared>,
}

impl ChatHelper {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn send(&self, to: Option<u64>, text: &str) -> Result<String, HuddleError> {
        if text.trim().is_empty() {
            return Err(HuddleError::InvalidParameter("message is empty".into()));
        }
        {
            let ctx = self.shared.require_in_session()?;
            let privileged = ctx.am_privileged();
            match (ctx.policy.chat_privilege, to) {
                (ChatPrivilege::NoOne, _) if !privileged => return Err(HuddleError::NoRights),
                (ChatPrivilege::PublicOnly, Some(_)) if !privileged => {
                    return Err(HuddleError::NoRights);
                }
                _ => {}
            }
            if let Some(target) = to {
                if ctx.my_id() == Some(target) {
                    return Err(HuddleError::InvalidParameter("cannot message yourself".into()));
                }
                if !ctx.roster.contains(target) {
                    return Err(HuddleError::InvalidParameter(format!("unknown user {target}")));
                }
            }
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.shared.send(ClientSignal::Chat {
            id: id.clone(),
            to,
            text: text.to_string(),
        })?;
        Ok(id)
    }

    /// Returns the id the message will carry once delivered.
    pub fn send_to_all(&self, text: &str) -> Result<String, HuddleError> {
        self.send(None, text)
    }

    pub fn send_to_user(&self, user_id: u64, text: &str) -> Result<String, HuddleError> {
        self.send(Some(user_id), text)
    }

    /// Messages of the current session, oldest first.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.shared.ctx().chat.clone()
    }

    pub fn set_privilege(&self, privilege: ChatPrivilege) -> Result<(), HuddleError> {
        if !self.shared.require_in_session()?.am_privileged() {
            return Err(HuddleError::NoRights);
        }
        self.shared.send(ClientSignal::SetChatPrivilege { privilege })
    }

    pub fn privilege(&self) -> ChatPrivilege {
        self.shared.ctx().policy.chat_privilege
    }
}
