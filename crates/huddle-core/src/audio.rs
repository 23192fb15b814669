use std::sync::Arc;

use huddle_media::{Resolution, StreamKey};

use crate::audio_playout::AudioPlayoutBuffer;
use crate::errors::HuddleError;
use crate::media::ports::{AudioSourcePort, RawDataConsumer};
use crate::session::Shared;
use crate::transport::ClientSignal;

/// Microphone, mute control and raw audio access for the current session.
///
/// Local mute changes are applied to the pipeline right away and echoed by
/// the server; unmuting waits for the echo since the host may forbid it.
#[derive(Clone)]
pub struct AudioHelper {
    shared: Arc<Shared>,
}

impl AudioHelper {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn require_privileged_target(&self, user_id: u64) -> Result<(), HuddleError> {
        let ctx = self.shared.require_in_session()?;
        if !ctx.am_privileged() {
            return Err(HuddleError::NoRights);
        }
        if !ctx.roster.contains(user_id) {
            return Err(HuddleError::InvalidParameter(format!("unknown user {user_id}")));
        }
        Ok(())
    }

    fn is_self(&self, user_id: Option<u64>) -> bool {
        user_id.is_none() || user_id == self.shared.ctx().my_id()
    }

    /// Join the audio channel unmuted.
    pub fn start_audio(&self) -> Result<(), HuddleError> {
        self.start_with(false)
    }

    pub fn start_with(&self, muted: bool) -> Result<(), HuddleError> {
        self.shared.require_in_session()?;
        self.shared.media.start_audio(muted)?;
        tracing::info!(muted, "audio started");
        self.shared.send(ClientSignal::SetAudio {
            connected: true,
            muted,
        })
    }

    pub fn stop_audio(&self) -> Result<(), HuddleError> {
        self.shared.require_in_session()?;
        if !self.shared.media.stop_audio() {
            return Err(HuddleError::AudioModuleNotReady);
        }
        tracing::info!("audio stopped");
        self.shared.send(ClientSignal::SetAudio {
            connected: false,
            muted: true,
        })
    }

    pub fn is_audio_started(&self) -> bool {
        self.shared.media.is_audio_started()
    }

    /// Mute yourself (`None`) or, as host or manager, another user.
    pub fn mute(&self, user_id: Option<u64>) -> Result<(), HuddleError> {
        if self.is_self(user_id) {
            self.shared.require_in_session()?;
            self.shared.media.set_audio_muted(true)?;
            return self.shared.send(ClientSignal::SetAudio {
                connected: true,
                muted: true,
            });
        }
        let Some(user_id) = user_id else {
            return Ok(());
        };
        self.require_privileged_target(user_id)?;
        self.shared.send(ClientSignal::MuteUser { user_id })
    }

    /// Unmute yourself, or ask another user to unmute.
    pub fn unmute(&self, user_id: Option<u64>) -> Result<(), HuddleError> {
        if self.is_self(user_id) {
            self.shared.require_in_session()?;
            if !self.shared.media.is_audio_started() {
                return Err(HuddleError::AudioModuleNotReady);
            }
            return self.shared.send(ClientSignal::SetAudio {
                connected: true,
                muted: false,
            });
        }
        let Some(user_id) = user_id else {
            return Ok(());
        };
        self.require_privileged_target(user_id)?;
        self.shared.send(ClientSignal::AskUnmute { user_id })
    }

    pub fn is_muted(&self) -> bool {
        self.shared
            .ctx()
            .roster
            .myself()
            .is_none_or(|u| u.audio.muted)
    }

    /// Mute everyone else. With `allow_unmute_by_self == false` they stay
    /// muted until asked to unmute.
    pub fn mute_all(&self, allow_unmute_by_self: bool) -> Result<(), HuddleError> {
        self.require_privileged()?;
        self.shared.send(ClientSignal::MuteAll {
            allow_unmute_by_self,
        })
    }

    pub fn unmute_all(&self) -> Result<(), HuddleError> {
        self.require_privileged()?;
        self.shared.send(ClientSignal::UnmuteAll)
    }

    pub fn allow_unmute_by_self(&self, allowed: bool) -> Result<(), HuddleError> {
        self.require_privileged()?;
        self.shared.send(ClientSignal::AllowUnmuteBySelf { allowed })
    }

    pub fn is_unmute_by_self_allowed(&self) -> bool {
        self.shared.ctx().policy.allow_unmute_by_self
    }

    fn require_privileged(&self) -> Result<(), HuddleError> {
        if self.shared.require_in_session()?.am_privileged() {
            Ok(())
        } else {
            Err(HuddleError::NoRights)
        }
    }

    // Raw audio ----------------------------------------------------------

    fn stream_key(&self, user_id: Option<u64>) -> Result<StreamKey, HuddleError> {
        let ctx = self.shared.require_in_session()?;
        match user_id {
            None => Ok(StreamKey::all_audio()),
            Some(id) if ctx.roster.contains(id) => Ok(StreamKey::audio(id)),
            Some(id) => Err(HuddleError::InvalidParameter(format!("unknown user {id}"))),
        }
    }

    /// Receive decoded PCM of one user, or the mixed stream with `None`.
    pub fn subscribe(
        &self,
        consumer: Arc<dyn RawDataConsumer>,
        user_id: Option<u64>,
    ) -> Result<(), HuddleError> {
        let key = self.stream_key(user_id)?;
        self.shared
            .media
            .subscribe(consumer, key, Resolution::Auto)
            .map(|_| ())
    }

    pub fn unsubscribe(
        &self,
        consumer: &Arc<dyn RawDataConsumer>,
        user_id: Option<u64>,
    ) -> Result<(), HuddleError> {
        let key = match user_id {
            None => StreamKey::all_audio(),
            Some(id) => StreamKey::audio(id),
        };
        self.shared.media.unsubscribe(consumer, &key)
    }

    // Playback and devices -----------------------------------------------

    /// 0.0 is silent, 10.0 plays at the received level.
    pub fn set_user_playback_volume(&self, user_id: u64, volume: f32) -> Result<(), HuddleError> {
        self.shared.media.set_playback_volume(user_id, volume)
    }

    pub fn user_playback_volume(&self, user_id: u64) -> f32 {
        self.shared.media.playback_volume(user_id)
    }

    pub fn select_microphone(&self, device_id: &str) -> Result<(), HuddleError> {
        self.shared.media.select_microphone(device_id)
    }

    pub fn set_output_route(&self, device_id: &str) -> Result<(), HuddleError> {
        self.shared.media.devices().set_output_route(device_id)
    }

    pub fn output_route(&self) -> Option<String> {
        self.shared.media.devices().output_route()
    }

    /// Replace the microphone. Takes effect on the next start.
    pub fn set_audio_source(&self, source: Option<Arc<dyn AudioSourcePort>>) {
        self.shared.media.set_audio_source(source);
    }

    /// Latest level (0-9) heard from a user.
    pub fn audio_level(&self, user_id: u64) -> u8 {
        self.shared.media.audio_level(user_id)
    }

    /// Mixed remote audio, for the platform's playback callback.
    pub fn playout_buffer(&self) -> Arc<AudioPlayoutBuffer> {
        self.shared.media.playout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::auth::Role;
    use crate::events::{HuddleEvent, MediaEvent, SessionEvent};
    use crate::test_support::{FakeSource, hub, join, wait_for, wait_until};

    #[tokio::test]
    async fn start_needs_a_microphone() {
        let hub = hub();
        let (a, _) = join(&hub, "S1", "A", Role::Host).await;
        let audio = a.audio();
        assert!(matches!(
            audio.start_audio(),
            Err(HuddleError::DeviceUnavailable(_))
        ));
        assert_eq!(audio.stop_audio(), Err(HuddleError::AudioModuleNotReady));
        assert_eq!(audio.unmute(None), Err(HuddleError::AudioModuleNotReady));

        let mic = Arc::new(FakeSource::default());
        a.devices().register_microphone("mic-1", "Built-in", mic.clone());
        audio.start_with(true).unwrap();
        assert!(mic.is_running());
        assert!(a.devices().is_leased("mic-1"));
        wait_until(|| a.myself().is_some_and(|u| u.audio.connected && u.audio.muted)).await;

        audio.stop_audio().unwrap();
        wait_until(|| !a.devices().is_leased("mic-1")).await;
        wait_until(|| a.myself().is_some_and(|u| !u.audio.connected)).await;
    }

    #[tokio::test]
    async fn locked_mute_needs_the_host() {
        let hub = hub();
        let (a, _) = join(&hub, "S1", "A", Role::Host).await;
        let (b, mut b_events) = join(&hub, "S1", "B", Role::Participant).await;
        let a_id = a.myself().unwrap().user_id;
        let b_id = b.myself().unwrap().user_id;
        wait_until(|| a.users().len() == 2).await;

        b.audio().set_audio_source(Some(Arc::new(FakeSource::default())));
        b.audio().start_audio().unwrap();
        assert_eq!(b.audio().mute_all(true), Err(HuddleError::NoRights));
        assert_eq!(b.audio().mute(Some(a_id)), Err(HuddleError::NoRights));

        a.audio().mute_all(false).unwrap();
        wait_for(&mut b_events, |e| {
            matches!(e, HuddleEvent::Media(MediaEvent::AudioStatusChanged { user_id, status }) if *user_id == b_id && status.muted)
        })
        .await;
        assert!(b.audio().is_muted());
        assert!(!b.audio().is_unmute_by_self_allowed());

        b.audio().unmute(None).unwrap();
        let refused = HuddleError::NoRights.code();
        wait_for(&mut b_events, |e| {
            matches!(e, HuddleEvent::Session(SessionEvent::RequestFailed { code, .. }) if *code == refused)
        })
        .await;
        assert!(b.audio().is_muted());

        a.audio().unmute(Some(b_id)).unwrap();
        wait_for(&mut b_events, |e| {
            matches!(e, HuddleEvent::Media(MediaEvent::UnmuteRequested { by }) if *by == a_id)
        })
        .await;
        b.audio().unmute(None).unwrap();
        wait_until(|| !b.audio().is_muted()).await;
    }

    #[tokio::test]
    async fn playback_volume_is_bounded() {
        let hub = hub();
        let (a, _) = join(&hub, "S1", "A", Role::Host).await;
        let audio = a.audio();
        assert_eq!(audio.user_playback_volume(5), 10.0);
        audio.set_user_playback_volume(5, 2.5).unwrap();
        assert_eq!(audio.user_playback_volume(5), 2.5);
        assert!(audio.set_user_playback_volume(5, 11.0).is_err());

        assert!(audio.set_output_route("speaker").is_err());
        a.devices().register_speaker("speaker", "Speaker");
        audio.set_output_route("speaker").unwrap();
        assert_eq!(audio.output_route().as_deref(), Some("speaker"));
    }
}
