use std::sync::Arc;

use huddle_media::{RawDataStatus, Resolution, StreamKey, StreamStatistics};
use serde::{Deserialize, Serialize};

use crate::errors::HuddleError;
use crate::media::LOCAL_USER_ID;
use crate::media::ports::{RawDataConsumer, VideoPreprocessor, VideoSourcePort};
use crate::session::{SessionContext, Shared};
use crate::transport::ClientSignal;

const MAX_FRAME_RATE: u32 = 60;

/// Frame-rate bounds for the outgoing camera stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoPreference {
    pub min_fps: u32,
    pub max_fps: u32,
}

impl Default for VideoPreference {
    fn default() -> Self {
        Self {
            min_fps: 1,
            max_fps: 30,
        }
    }
}

impl VideoPreference {
    pub fn validate(&self) -> Result<(), HuddleError> {
        if self.min_fps == 0 || self.min_fps > self.max_fps || self.max_fps > MAX_FRAME_RATE {
            return Err(HuddleError::InvalidParameter(format!(
                "frame rate bounds {}..={} must lie within 1..={MAX_FRAME_RATE}",
                self.min_fps, self.max_fps
            )));
        }
        Ok(())
    }
}

/// Camera, preview, remote video and spotlight.
#[derive(Clone)]
pub struct VideoHelper {
    shared: Arc<Shared>,
}

impl VideoHelper {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Start sending the camera. A running preview is promoted.
    pub fn start_video(&self) -> Result<(), HuddleError> {
        self.shared.require_in_session()?;
        self.shared.media.start_video(true)?;
        tracing::info!("video started");
        self.shared.send(ClientSignal::SetVideo { on: true })
    }

    /// Stop sending and release the camera.
    pub fn stop_video(&self) -> Result<(), HuddleError> {
        self.shared.require_in_session()?;
        if !self.shared.media.is_capturing_video() {
            return Err(HuddleError::VideoModuleNotReady);
        }
        let was_sending = self.shared.media.stop_video(false);
        tracing::info!("video stopped");
        if was_sending {
            self.shared.send(ClientSignal::SetVideo { on: false })?;
        }
        Ok(())
    }

    /// Capture for the local preview only. Works outside a session.
    pub fn start_preview(&self) -> Result<(), HuddleError> {
        self.shared.media.start_video(false).map(|_| ())
    }

    /// Returns `false` if there was no preview-only capture to stop.
    pub fn stop_preview(&self) -> bool {
        self.shared.media.stop_preview()
    }

    pub fn is_video_on(&self) -> bool {
        self.shared.media.is_video_sending()
    }

    /// Move the capture to `device_id`, or to the next camera. Returns the
    /// id of the camera now in use.
    pub async fn switch_camera(&self, device_id: Option<&str>) -> Result<String, HuddleError> {
        self.shared.media.switch_camera(device_id).await
    }

    pub fn set_video_source(&self, source: Option<Arc<dyn VideoSourcePort>>) {
        self.shared.media.set_video_source(source);
    }

    pub fn set_preprocessor(&self, preprocessor: Option<Arc<dyn VideoPreprocessor>>) {
        self.shared.media.set_preprocessor(preprocessor);
    }

    /// Frames arriving faster than `max_fps` are dropped before encoding.
    pub fn set_video_preference(&self, preference: VideoPreference) -> Result<(), HuddleError> {
        preference.validate()?;
        self.shared.media.set_max_frame_rate(preference.max_fps);
        tracing::debug!(?preference, "video preference set");
        Ok(())
    }

    // Remote video -------------------------------------------------------

    /// Key of `user_id`'s camera stream; your own id maps to the preview.
    fn stream_key(ctx: &SessionContext, user_id: u64) -> Result<StreamKey, HuddleError> {
        if ctx.my_id() == Some(user_id) {
            return Ok(StreamKey::video(LOCAL_USER_ID));
        }
        if !ctx.roster.contains(user_id) {
            return Err(HuddleError::InvalidParameter(format!("unknown user {user_id}")));
        }
        Ok(StreamKey::video(user_id))
    }

    pub fn subscribe(
        &self,
        consumer: Arc<dyn RawDataConsumer>,
        user_id: u64,
        resolution: Resolution,
    ) -> Result<(), HuddleError> {
        let (key, video_on) = {
            let ctx = self.shared.require_in_session()?;
            let key = Self::stream_key(&ctx, user_id)?;
            let video_on = ctx.roster.user(user_id).is_some_and(|u| u.video_on);
            (key, video_on)
        };
        self.shared.media.subscribe(consumer.clone(), key, resolution)?;
        // Only the new consumer learns the current state; others already have it.
        if key.user_id != LOCAL_USER_ID {
            let status = if video_on { RawDataStatus::On } else { RawDataStatus::Off };
            consumer.on_raw_data_status(&key, status);
        }
        Ok(())
    }

    pub fn unsubscribe(
        &self,
        consumer: &Arc<dyn RawDataConsumer>,
        user_id: u64,
    ) -> Result<(), HuddleError> {
        let key = {
            let ctx = self.shared.ctx();
            if ctx.my_id() == Some(user_id) {
                StreamKey::video(LOCAL_USER_ID)
            } else {
                StreamKey::video(user_id)
            }
        };
        self.shared.media.unsubscribe(consumer, &key)
    }

    pub fn set_resolution(
        &self,
        consumer: &Arc<dyn RawDataConsumer>,
        user_id: u64,
        resolution: Resolution,
    ) -> Result<(), HuddleError> {
        let key = Self::stream_key(&self.shared.ctx(), user_id)?;
        self.shared.media.set_resolution(consumer, &key, resolution)
    }

    pub fn statistics(&self, user_id: u64) -> Option<StreamStatistics> {
        self.shared.media.statistics(&StreamKey::video(user_id))
    }

    // Spotlight ----------------------------------------------------------

    pub fn spotlight(&self, user_id: u64) -> Result<(), HuddleError> {
        {
            let ctx = self.shared.require_in_session()?;
            if !ctx.am_privileged() {
                return Err(HuddleError::NoRights);
            }
            if ctx.roster.len() < 2 {
                return Err(HuddleError::SpotlightNotEnoughUsers);
            }
            let user = ctx
                .roster
                .user(user_id)
                .ok_or(HuddleError::SpotlightNotEligible)?;
            if !user.video_on {
                return Err(HuddleError::SpotlightUserWithoutVideo);
            }
            let spotlighted = &ctx.policy.spotlighted;
            if !spotlighted.contains(&user_id)
                && spotlighted.len() >= self.shared.config.max_spotlighted_users
            {
                return Err(HuddleError::SpotlightTooMany);
            }
        }
        self.shared.send(ClientSignal::Spotlight { user_id, on: true })
    }

    pub fn unspotlight(&self, user_id: u64) -> Result<(), HuddleError> {
        {
            let ctx = self.shared.require_in_session()?;
            if !ctx.am_privileged() {
                return Err(HuddleError::NoRights);
            }
            if !ctx.policy.spotlighted.contains(&user_id) {
                return Err(HuddleError::SpotlightUserNotSpotlighted);
            }
        }
        self.shared.send(ClientSignal::Spotlight { user_id, on: false })
    }

    pub fn unspotlight_all(&self) -> Result<(), HuddleError> {
        if !self.shared.require_in_session()?.am_privileged() {
            return Err(HuddleError::NoRights);
        }
        self.shared.send(ClientSignal::UnspotlightAll)
    }

    /// In spotlight order.
    pub fn spotlighted_users(&self) -> Vec<u64> {
        self.shared.ctx().policy.spotlighted.clone()
    }
}
