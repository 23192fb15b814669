use std::sync::Arc;

use huddle_media::{RawDataStatus, Resolution, StreamKey, StreamKind, StreamStatistics};

use crate::errors::HuddleError;
use crate::events::MediaState;
use crate::media::ports::{AudioSourcePort, RawDataConsumer, ShareSourcePort};
use crate::session::Shared;
use crate::transport::ClientSignal;

const SHARE_KINDS: [StreamKind; 3] = [
    StreamKind::ShareNormal,
    StreamKind::ShareCamera,
    StreamKind::SharePureAudio,
];

/// Screen, camera and audio sharing.
#[derive(Clone)]
pub struct ShareHelper {
    shared: Arc<Shared>,
}

impl ShareHelper {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn check_allowed(&self) -> Result<(), HuddleError> {
        let ctx = self.shared.require_in_session()?;
        if ctx.policy.share_locked && !ctx.am_privileged() {
            return Err(HuddleError::ShareLocked);
        }
        Ok(())
    }

    /// Announce a share whose pipeline was just started. The pipeline is
    /// torn down again if the announcement cannot be sent.
    fn announce(&self, kind: StreamKind) -> Result<(), HuddleError> {
        let sent = self.shared.send(ClientSignal::SetShare {
            kind,
            state: MediaState::On,
        });
        match sent {
            Ok(()) => {
                tracing::info!(?kind, "share started");
                Ok(())
            }
            Err(e) => {
                self.shared.media.stop_share();
                Err(e)
            }
        }
    }

    pub fn start_share(&self, source: Arc<dyn ShareSourcePort>) -> Result<(), HuddleError> {
        self.check_allowed()?;
        self.shared.media.start_share(source)?;
        self.announce(StreamKind::ShareNormal)
    }

    /// Share a second camera, e.g. a document camera.
    pub fn start_share_camera(&self, device_id: Option<&str>) -> Result<(), HuddleError> {
        self.check_allowed()?;
        self.shared.media.start_share_camera(device_id)?;
        self.announce(StreamKind::ShareCamera)
    }

    /// Share computer audio without any picture.
    pub fn start_share_audio(&self, source: Arc<dyn AudioSourcePort>) -> Result<(), HuddleError> {
        self.check_allowed()?;
        self.shared.media.start_share_audio(source)?;
        self.announce(StreamKind::SharePureAudio)
    }

    pub fn pause(&self) -> Result<(), HuddleError> {
        self.shared.require_in_session()?;
        let kind = self.shared.media.set_share_sending(false)?;
        self.shared.send(ClientSignal::SetShare {
            kind,
            state: MediaState::Paused,
        })
    }

    pub fn resume(&self) -> Result<(), HuddleError> {
        self.shared.require_in_session()?;
        let kind = self.shared.media.set_share_sending(true)?;
        self.shared.send(ClientSignal::SetShare {
            kind,
            state: MediaState::On,
        })
    }

    pub fn stop(&self) -> Result<(), HuddleError> {
        self.shared.require_in_session()?;
        let kind = self.shared.media.stop_share().ok_or(HuddleError::NotSharing)?;
        tracing::info!(?kind, "share stopped");
        self.shared.send(ClientSignal::SetShare {
            kind,
            state: MediaState::Off,
        })
    }

    /// Locking stops every share from a participant without privileges.
    pub fn lock_share(&self, locked: bool) -> Result<(), HuddleError> {
        if !self.shared.require_in_session()?.am_privileged() {
            return Err(HuddleError::NoRights);
        }
        self.shared.send(ClientSignal::LockShare { locked })
    }

    pub fn is_share_locked(&self) -> bool {
        self.shared.ctx().policy.share_locked
    }

    pub fn is_sharing_out(&self) -> bool {
        self.shared.media.share_kind().is_some()
    }

    pub fn is_share_paused(&self) -> bool {
        self.shared.media.is_share_paused()
    }

    pub fn is_other_sharing(&self) -> bool {
        self.shared
            .ctx()
            .roster
            .remote_users()
            .any(|u| u.share.state != MediaState::Off)
    }

    /// Users currently sharing, with the kind of their share.
    pub fn sharing_users(&self) -> Vec<(u64, StreamKind)> {
        self.shared
            .ctx()
            .roster
            .users()
            .iter()
            .filter(|u| u.share.state != MediaState::Off)
            .filter_map(|u| u.share.kind.map(|kind| (u.user_id, kind)))
            .collect()
    }

    // Remote shares ------------------------------------------------------

    pub fn subscribe(&self, consumer: Arc<dyn RawDataConsumer>, user_id: u64) -> Result<(), HuddleError> {
        let (key, state) = {
            let ctx = self.shared.require_in_session()?;
            let user = ctx.roster.user(user_id).ok_or_else(|| {
                HuddleError::InvalidParameter(format!("unknown user {user_id}"))
            })?;
            let kind = user
                .share
                .kind
                .ok_or(HuddleError::NoData(StreamKind::ShareNormal))?;
            (StreamKey::new(user_id, kind), user.share.state)
        };
        self.shared.media.subscribe(consumer.clone(), key, Resolution::Auto)?;
        let status = match state {
            MediaState::On => RawDataStatus::On,
            MediaState::Off | MediaState::Paused => RawDataStatus::Off,
        };
        consumer.on_raw_data_status(&key, status);
        Ok(())
    }

    pub fn unsubscribe(
        &self,
        consumer: &Arc<dyn RawDataConsumer>,
        user_id: u64,
    ) -> Result<(), HuddleError> {
        let key = SHARE_KINDS
            .into_iter()
            .map(|kind| StreamKey::new(user_id, kind))
            .find(|key| self.shared.media.is_subscribed(consumer, key))
            .unwrap_or_else(|| StreamKey::new(user_id, StreamKind::ShareNormal));
        self.shared.media.unsubscribe(consumer, &key)
    }

    pub fn statistics(&self, user_id: u64) -> Option<StreamStatistics> {
        SHARE_KINDS
            .into_iter()
            .find_map(|kind| self.shared.media.statistics(&StreamKey::new(user_id, kind)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::auth::Role;
    use crate::events::{HuddleEvent, ShareEvent};
    use crate::test_support::{Collector, FakeSource, hub, join, video_frame, wait_for, wait_until};

    #[tokio::test]
    async fn lock_stops_participant_shares() {
        let hub = hub();
        let (a, mut a_events) = join(&hub, "S1", "A", Role::Host).await;
        let (b, _) = join(&hub, "S1", "B", Role::Participant).await;
        let b_id = b.myself().unwrap().user_id;
        wait_until(|| a.users().len() == 2).await;

        let screen = Arc::new(FakeSource::default());
        b.share().start_share(screen.clone()).unwrap();
        assert_eq!(
            b.share().start_share(screen.clone()),
            Err(HuddleError::AlreadyInProgress)
        );
        wait_for(&mut a_events, |e| {
            matches!(e, HuddleEvent::Share(ShareEvent::StatusChanged { user_id, state: MediaState::On, .. }) if *user_id == b_id)
        })
        .await;
        assert!(a.share().is_other_sharing());
        assert_eq!(a.share().sharing_users(), vec![(b_id, StreamKind::ShareNormal)]);

        assert_eq!(b.share().lock_share(true), Err(HuddleError::NoRights));
        a.share().lock_share(true).unwrap();
        wait_until(|| !screen.is_running()).await;
        wait_until(|| b.share().is_share_locked()).await;
        assert!(!b.share().is_sharing_out());
        assert_eq!(b.share().stop(), Err(HuddleError::NotSharing));
        assert_eq!(
            b.share().start_share(Arc::new(FakeSource::default())),
            Err(HuddleError::ShareLocked)
        );

        // The host shares regardless.
        a.share().start_share(Arc::new(FakeSource::default())).unwrap();
        assert!(a.share().is_sharing_out());
    }

    #[tokio::test]
    async fn paused_share_reports_off_to_viewers() {
        let hub = hub();
        let (a, _) = join(&hub, "S1", "A", Role::Host).await;
        let (b, _) = join(&hub, "S1", "B", Role::Participant).await;
        let a_id = a.myself().unwrap().user_id;
        wait_until(|| b.users().len() == 2).await;

        let viewer = Arc::new(Collector::default());
        assert_eq!(
            b.share().subscribe(viewer.clone(), a_id),
            Err(HuddleError::NoData(StreamKind::ShareNormal))
        );

        let screen = Arc::new(FakeSource::default());
        a.share().start_share(screen.clone()).unwrap();
        wait_until(|| b.share().sharing_users() == vec![(a_id, StreamKind::ShareNormal)]).await;
        b.share().subscribe(viewer.clone(), a_id).unwrap();
        wait_until(|| viewer.last_status() == Some(RawDataStatus::On)).await;

        assert!(screen.push_video(video_frame(90)));
        wait_until(|| viewer.video_count() == 1).await;

        a.share().pause().unwrap();
        assert!(a.share().is_share_paused());
        wait_until(|| viewer.last_status() == Some(RawDataStatus::Off)).await;
        assert!(screen.push_video(video_frame(91)));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(viewer.video_count(), 1);

        a.share().resume().unwrap();
        wait_until(|| viewer.last_status() == Some(RawDataStatus::On)).await;

        let viewer: Arc<dyn RawDataConsumer> = viewer;
        b.share().unsubscribe(&viewer, a_id).unwrap();
        assert!(b.share().unsubscribe(&viewer, a_id).is_err());

        a.share().stop().unwrap();
        wait_until(|| !screen.is_running()).await;
    }
}
