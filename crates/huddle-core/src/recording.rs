//! Cloud recording and live transcription controls.

use std::sync::Arc;

use crate::errors::HuddleError;
use crate::events::{RecordingStatus, TranscriptMessage, TranscriptionStatus};
use crate::session::Shared;
use crate::transport::{ClientSignal, RecordingAction};

/// Host-only control of the session recording.
#[derive(Clone)]
pub struct RecordingHelper {
    shared: Arc<Shared>,
}

impl RecordingHelper {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn request(&self, action: RecordingAction) -> Result<(), HuddleError> {
        {
            let ctx = self.shared.require_in_session()?;
            if !ctx.am_host() {
                return Err(HuddleError::NoRights);
            }
            let status = ctx.policy.recording;
            match (&action, status) {
                (RecordingAction::Start, RecordingStatus::Stopped) => {}
                (RecordingAction::Start, _) => return Err(HuddleError::AlreadyInProgress),
                (RecordingAction::Stop, RecordingStatus::Stopped)
                | (RecordingAction::Pause, RecordingStatus::Stopped | RecordingStatus::Paused)
                | (RecordingAction::Resume, RecordingStatus::Stopped | RecordingStatus::Recording) => {
                    return Err(HuddleError::NoRecordingInProgress);
                }
                _ => {}
            }
        }
        tracing::info!(?action, "recording request");
        self.shared.send(ClientSignal::Recording { action })
    }

    pub fn start(&self) -> Result<(), HuddleError> {
        self.request(RecordingAction::Start)
    }

    pub fn stop(&self) -> Result<(), HuddleError> {
        self.request(RecordingAction::Stop)
    }

    pub fn pause(&self) -> Result<(), HuddleError> {
        self.request(RecordingAction::Pause)
    }

    pub fn resume(&self) -> Result<(), HuddleError> {
        self.request(RecordingAction::Resume)
    }

    pub fn status(&self) -> RecordingStatus {
        self.shared.ctx().policy.recording
    }
}

/// Live transcription of the session audio.
#[derive(Clone)]
pub struct TranscriptionHelper {
    shared: Arc<Shared>,
}

impl TranscriptionHelper {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Starts in the spoken language set beforehand, if any.
    pub fn start(&self) -> Result<(), HuddleError> {
        let language = {
            let ctx = self.shared.require_in_session()?;
            if ctx.policy.transcription != TranscriptionStatus::Stopped {
                return Err(HuddleError::AlreadyInProgress);
            }
            ctx.transcription_language.clone()
        };
        self.shared.send(ClientSignal::Transcription {
            start: true,
            language,
        })
    }

    pub fn stop(&self) -> Result<(), HuddleError> {
        {
            let ctx = self.shared.require_in_session()?;
            if ctx.policy.transcription == TranscriptionStatus::Stopped {
                return Err(HuddleError::WrongUsage("transcription is not running".into()));
            }
        }
        self.shared.send(ClientSignal::Transcription {
            start: false,
            language: None,
        })
    }

    pub fn status(&self) -> TranscriptionStatus {
        self.shared.ctx().policy.transcription
    }

    /// BCP 47 tag such as `en` or `fr-FR`. Kept across sessions.
    pub fn set_spoken_language(&self, language: &str) -> Result<(), HuddleError> {
        let language = language.trim();
        if language.is_empty() || !language.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(HuddleError::InvalidParameter(format!(
                "invalid language tag {language:?}"
            )));
        }
        self.shared.ctx().transcription_language = Some(language.to_string());
        Ok(())
    }

    pub fn spoken_language(&self) -> Option<String> {
        self.shared.ctx().transcription_language.clone()
    }

    /// Transcript lines received in this session, oldest first.
    pub fn history(&self) -> Vec<TranscriptMessage> {
        self.shared.ctx().transcripts.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::auth::Role;
    use crate::events::{HuddleEvent, RecordingEvent, TranscriptionEvent};
    use crate::test_support::{hub, join, wait_for, wait_until};

    #[tokio::test]
    async fn recording_follows_the_host() {
        let hub = hub();
        let (a, mut a_events) = join(&hub, "S1", "A", Role::Host).await;
        let (b, _) = join(&hub, "S1", "B", Role::Participant).await;
        wait_until(|| a.users().len() == 2).await;

        let recording = a.recording();
        assert_eq!(b.recording().start(), Err(HuddleError::NoRights));
        assert_eq!(recording.stop(), Err(HuddleError::NoRecordingInProgress));
        assert_eq!(recording.pause(), Err(HuddleError::NoRecordingInProgress));

        recording.start().unwrap();
        wait_for(&mut a_events, |e| {
            matches!(e, HuddleEvent::Recording(RecordingEvent::StatusChanged(RecordingStatus::Recording)))
        })
        .await;
        assert_eq!(recording.start(), Err(HuddleError::AlreadyInProgress));
        assert_eq!(recording.resume(), Err(HuddleError::NoRecordingInProgress));

        recording.pause().unwrap();
        wait_until(|| b.recording().status() == RecordingStatus::Paused).await;
        recording.resume().unwrap();
        wait_until(|| recording.status() == RecordingStatus::Recording).await;
        recording.stop().unwrap();
        wait_until(|| b.recording().status() == RecordingStatus::Stopped).await;
    }

    #[tokio::test]
    async fn transcripts_are_kept_in_order() {
        let hub = hub();
        let (a, mut a_events) = join(&hub, "S1", "A", Role::Host).await;
        let a_id = a.myself().unwrap().user_id;
        let transcription = a.transcription();

        assert!(transcription.set_spoken_language("en US").is_err());
        transcription.set_spoken_language("fr-FR").unwrap();
        assert!(transcription.stop().is_err());
        assert!(!hub.publish_transcript(a_id, "ignored", "fr-FR"));

        transcription.start().unwrap();
        wait_for(&mut a_events, |e| {
            matches!(e, HuddleEvent::Transcription(TranscriptionEvent::StatusChanged(TranscriptionStatus::Connecting)))
        })
        .await;
        wait_until(|| transcription.status() == TranscriptionStatus::Started).await;
        assert_eq!(transcription.start(), Err(HuddleError::AlreadyInProgress));

        assert!(hub.publish_transcript(a_id, "bonjour", "fr-FR"));
        assert!(hub.publish_transcript(a_id, "tout le monde", "fr-FR"));
        wait_until(|| transcription.history().len() == 2).await;
        let lines: Vec<String> = transcription.history().into_iter().map(|m| m.text).collect();
        assert_eq!(lines, vec!["bonjour", "tout le monde"]);
        assert_eq!(transcription.history()[0].speaker_name, "A");

        transcription.stop().unwrap();
        wait_until(|| transcription.status() == TranscriptionStatus::Stopped).await;

        a.leave(false).await.unwrap();
        assert_eq!(transcription.spoken_language().as_deref(), Some("fr-FR"));
        assert!(transcription.history().is_empty());
    }
}
