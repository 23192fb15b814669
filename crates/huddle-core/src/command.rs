use std::sync::Arc;

use crate::errors::HuddleError;
use crate::session::Shared;
use crate::transport::ClientSignal;

/// Application-defined text messages between clients. They are not shown
/// as chat; receivers get `SessionEvent::CommandReceived`.
#[derive(Clone)]
pub struct CommandChannel {
    shared: Arc<Shared>,
}

impl CommandChannel {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Send `payload` to one user, or to everyone else with `None`.
    pub fn send(&self, payload: &str, target: Option<u64>) -> Result<(), HuddleError> {
        let limit = self.shared.config.max_command_bytes;
        if payload.is_empty() || payload.len() > limit {
            return Err(HuddleError::InvalidParameter(format!(
                "command payload must be 1..={limit} bytes, got {}",
                payload.len()
            )));
        }
        {
            let ctx = self.shared.require_in_session()?;
            if let Some(target) = target {
                if ctx.my_id() == Some(target) || !ctx.roster.contains(target) {
                    return Err(HuddleError::InvalidParameter(format!(
                        "user {target} cannot receive commands"
                    )));
                }
            }
        }
        if !self.shared.command_limiter.try_acquire() {
            return Err(HuddleError::CallTooFrequently);
        }
        self.shared.send(ClientSignal::Command {
            to: target,
            payload: payload.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use huddle_media::RateLimit;

    use crate::auth::Role;
    use crate::config::EngineConfig;
    use crate::events::{HuddleEvent, SessionEvent};
    use crate::session::SessionEngine;
    use crate::test_support::{fast_config, hub, join, request, wait_for, wait_until};

    #[tokio::test]
    async fn commands_reach_the_target_only() {
        let hub = hub();
        let (a, mut a_events) = join(&hub, "S1", "A", Role::Host).await;
        let (b, mut b_events) = join(&hub, "S1", "B", Role::Participant).await;
        let a_id = a.myself().unwrap().user_id;
        let b_id = b.myself().unwrap().user_id;
        wait_until(|| a.users().len() == 2).await;

        a.command_channel().send(r#"{"op":"raise_hand"}"#, Some(b_id)).unwrap();
        let got = wait_for(&mut b_events, |e| {
            matches!(e, HuddleEvent::Session(SessionEvent::CommandReceived { .. }))
        })
        .await;
        assert!(matches!(
            got,
            HuddleEvent::Session(SessionEvent::CommandReceived { sender_id, ref payload })
                if sender_id == a_id && payload.contains("raise_hand")
        ));

        b.command_channel().send("ping", None).unwrap();
        wait_for(&mut a_events, |e| {
            matches!(e, HuddleEvent::Session(SessionEvent::CommandReceived { payload, .. }) if payload == "ping")
        })
        .await;

        let channel = a.command_channel();
        assert!(channel.send("", None).is_err());
        assert!(channel.send(&"x".repeat(1025), None).is_err());
        assert!(channel.send("self", Some(a_id)).is_err());
    }

    #[tokio::test]
    async fn bursts_are_rate_limited() {
        let hub = hub();
        let config = EngineConfig {
            command_rate: RateLimit {
                max_calls: 2,
                window_ms: 60_000,
            },
            ..fast_config()
        };
        let engine = SessionEngine::new(config, Arc::new(hub.clone()));
        engine.join(request(&hub, "S1", "A", Role::Host)).await.unwrap();

        let channel = engine.command_channel();
        channel.send("1", None).unwrap();
        channel.send("2", None).unwrap();
        assert_eq!(channel.send("3", None), Err(HuddleError::CallTooFrequently));
    }
}
