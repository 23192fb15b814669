//! Local media engine: capture devices, send pipelines, the receive worker
//! and the subscription fan-out, independent of any session logic.

pub mod devices;
mod pipeline;
pub mod ports;
mod receive;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use huddle_media::{
    AudioDecoder, AudioEncoder, FanoutRouter, MediaPayload, NetworkQuality, PcmCodec,
    RawDataConsumer, RawDataStatus, RawVideoCodec, Resolution, StreamKey, StreamKind,
    StreamStatistics, SubscriptionId, SubscriptionManager, VideoDecoder, VideoEncoder,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::audio_playout::AudioPlayoutBuffer;
use crate::config::EngineConfig;
use crate::errors::HuddleError;
use crate::events::{EventEmitter, HuddleEvent, MediaEvent, NetworkLevels};
use crate::transport::MediaPacket;

use devices::DeviceRegistry;
use pipeline::{
    AudioPipelineSpec, PipelineContext, PipelineSource, SendPipeline, SharedPreprocessor, Uplink,
    VideoPipelineSpec, spawn_audio, spawn_video,
};
use ports::{AudioSourcePort, ShareSourcePort, VideoPreprocessor, VideoSourcePort};
use receive::{ReceiveShared, receive_worker};

/// Stream key owner used for the local preview and local capture taps.
pub const LOCAL_USER_ID: u64 = u64::MAX;

/// Creates encoders and decoders for the pipelines.
pub trait CodecProvider: Send + Sync {
    fn video_encoder(&self, kind: StreamKind) -> Box<dyn VideoEncoder>;
    fn video_decoder(&self, kind: StreamKind) -> Box<dyn VideoDecoder>;
    fn audio_encoder(&self) -> Box<dyn AudioEncoder>;
    fn audio_decoder(&self) -> Box<dyn AudioDecoder>;
}

/// The lossless packetizers shipped with `huddle-media`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodecs;

impl CodecProvider for RawCodecs {
    fn video_encoder(&self, _kind: StreamKind) -> Box<dyn VideoEncoder> {
        Box::new(RawVideoCodec)
    }

    fn video_decoder(&self, _kind: StreamKind) -> Box<dyn VideoDecoder> {
        Box::new(RawVideoCodec)
    }

    fn audio_encoder(&self) -> Box<dyn AudioEncoder> {
        Box::new(PcmCodec)
    }

    fn audio_decoder(&self) -> Box<dyn AudioDecoder> {
        Box::new(PcmCodec)
    }
}

#[derive(Default)]
struct Slots {
    audio: Option<SendPipeline>,
    video: Option<SendPipeline>,
    share: Option<SendPipeline>,
}

struct ReceiveTask {
    cancel_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct MediaEngine {
    shared: ReceiveShared,
    subscriptions: Mutex<SubscriptionManager>,
    devices: DeviceRegistry,
    uplink: Arc<Uplink>,
    slots: Mutex<Slots>,
    receiver: Mutex<Option<ReceiveTask>>,
    preprocessor: SharedPreprocessor,
    max_fps: Arc<AtomicU32>,
    video_source: RwLock<Option<Arc<dyn VideoSourcePort>>>,
    audio_source: RwLock<Option<Arc<dyn AudioSourcePort>>>,
    queue_depth: usize,
}

impl MediaEngine {
    pub fn new(config: &EngineConfig, emitter: EventEmitter) -> Self {
        Self::with_codecs(config, emitter, Arc::new(RawCodecs))
    }

    pub fn with_codecs(
        config: &EngineConfig,
        emitter: EventEmitter,
        codecs: Arc<dyn CodecProvider>,
    ) -> Self {
        let router = Arc::new(FanoutRouter::new());
        let subscriptions = SubscriptionManager::new(router.clone(), config.subscriptions);
        Self {
            shared: ReceiveShared {
                router,
                playout: Arc::new(AudioPlayoutBuffer::new()),
                volumes: Arc::default(),
                levels: Arc::default(),
                stats: Arc::default(),
                codecs,
                emitter,
            },
            subscriptions: Mutex::new(subscriptions),
            devices: DeviceRegistry::new(),
            uplink: Arc::new(Uplink::default()),
            slots: Mutex::new(Slots::default()),
            receiver: Mutex::new(None),
            preprocessor: Arc::new(RwLock::new(None)),
            max_fps: Arc::new(AtomicU32::new(0)),
            video_source: RwLock::new(None),
            audio_source: RwLock::new(None),
            queue_depth: config.send_queue_depth,
        }
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn router(&self) -> &Arc<FanoutRouter> {
        &self.shared.router
    }

    pub fn playout(&self) -> Arc<AudioPlayoutBuffer> {
        self.shared.playout.clone()
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().expect("media slots lock poisoned")
    }

    fn subscriptions(&self) -> MutexGuard<'_, SubscriptionManager> {
        self.subscriptions
            .lock()
            .expect("subscription lock poisoned")
    }

    fn context(&self) -> PipelineContext {
        PipelineContext {
            router: self.shared.router.clone(),
            uplink: self.uplink.clone(),
            queue_depth: self.queue_depth,
        }
    }

    fn emit(&self, event: MediaEvent) {
        self.shared.emitter.emit(HuddleEvent::Media(event));
    }

    /// Shut a pipeline down in the background; `CaptureStopped` follows
    /// once its device is released.
    fn retire(&self, pipeline: SendPipeline) {
        let emitter = self.shared.emitter.clone();
        let kind = pipeline.kind();
        tokio::spawn(async move {
            pipeline.shutdown().await;
            emitter.emit(HuddleEvent::Media(MediaEvent::CaptureStopped(kind)));
        });
    }

    // ---------------------------------------------------------------------
    // Link
    // ---------------------------------------------------------------------

    /// Route encoded output to `media_tx` and start decoding `media_rx`.
    pub(crate) fn attach_link(
        &self,
        media_tx: mpsc::Sender<MediaPacket>,
        media_rx: mpsc::Receiver<MediaPacket>,
    ) {
        self.stop_receiver();
        self.uplink.attach(media_tx);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(receive_worker(self.shared.clone(), media_rx, cancel_rx));
        *self.receiver.lock().expect("receiver lock poisoned") =
            Some(ReceiveTask { cancel_tx, handle });
    }

    /// Outgoing frames are dropped before encoding until the next attach.
    pub(crate) fn freeze(&self) {
        self.uplink.freeze(true);
    }

    pub fn is_frozen(&self) -> bool {
        self.uplink.is_frozen()
    }

    fn stop_receiver(&self) {
        if let Some(task) = self.receiver.lock().expect("receiver lock poisoned").take() {
            let _ = task.cancel_tx.send(true);
            task.handle.abort();
        }
    }

    // ---------------------------------------------------------------------
    // Audio
    // ---------------------------------------------------------------------

    pub fn set_audio_source(&self, source: Option<Arc<dyn AudioSourcePort>>) {
        *self.audio_source.write().expect("audio source lock poisoned") = source;
    }

    /// Start the microphone (or the custom audio source). A running
    /// pipeline only has its mute state updated.
    pub fn start_audio(&self, muted: bool) -> Result<(), HuddleError> {
        let mut slots = self.slots();
        if let Some(pipeline) = &slots.audio {
            pipeline.set_sending(!muted);
            return Ok(());
        }
        let custom = self
            .audio_source
            .read()
            .expect("audio source lock poisoned")
            .clone();
        let (source, lease) = match custom {
            Some(source) => (source, None),
            None => {
                let (lease, source) = self.devices.lease_microphone(None)?;
                (source, Some(lease))
            }
        };
        let pipeline = spawn_audio(
            &self.context(),
            AudioPipelineSpec {
                kind: StreamKind::Audio,
                local_key: StreamKey::audio(LOCAL_USER_ID),
                sending: !muted,
                encoder: self.shared.codecs.audio_encoder(),
                lease,
            },
            source,
        );
        slots.audio = Some(pipeline);
        drop(slots);
        self.emit(MediaEvent::CaptureStarted(StreamKind::Audio));
        Ok(())
    }

    pub fn stop_audio(&self) -> bool {
        let pipeline = self.slots().audio.take();
        match pipeline {
            Some(pipeline) => {
                self.retire(pipeline);
                true
            }
            None => false,
        }
    }

    pub fn set_audio_muted(&self, muted: bool) -> Result<(), HuddleError> {
        match &self.slots().audio {
            Some(pipeline) => {
                pipeline.set_sending(!muted);
                Ok(())
            }
            None => Err(HuddleError::AudioModuleNotReady),
        }
    }

    pub fn is_audio_started(&self) -> bool {
        self.slots().audio.is_some()
    }

    pub fn select_microphone(&self, device_id: &str) -> Result<(), HuddleError> {
        self.devices.select_microphone(device_id)
    }

    /// 0.0 silences the user, 10.0 plays at the received level.
    pub fn set_playback_volume(&self, user_id: u64, volume: f32) -> Result<(), HuddleError> {
        if !(0.0..=10.0).contains(&volume) {
            return Err(HuddleError::InvalidParameter(format!(
                "playback volume {volume} outside 0..=10"
            )));
        }
        self.shared
            .volumes
            .write()
            .expect("volume lock poisoned")
            .insert(user_id, volume);
        Ok(())
    }

    pub fn playback_volume(&self, user_id: u64) -> f32 {
        self.shared
            .volumes
            .read()
            .expect("volume lock poisoned")
            .get(&user_id)
            .copied()
            .unwrap_or(10.0)
    }

    pub fn audio_level(&self, user_id: u64) -> u8 {
        self.shared
            .levels
            .read()
            .expect("levels lock poisoned")
            .get(&user_id)
            .copied()
            .unwrap_or(0)
    }

    // ---------------------------------------------------------------------
    // Video
    // ---------------------------------------------------------------------

    pub fn set_video_source(&self, source: Option<Arc<dyn VideoSourcePort>>) {
        *self.video_source.write().expect("video source lock poisoned") = source;
    }

    pub fn set_preprocessor(&self, preprocessor: Option<Arc<dyn VideoPreprocessor>>) {
        *self.preprocessor.write().expect("preprocessor lock poisoned") = preprocessor;
    }

    fn spawn_camera(&self, device_id: Option<&str>, sending: bool) -> Result<SendPipeline, HuddleError> {
        let custom = self
            .video_source
            .read()
            .expect("video source lock poisoned")
            .clone();
        let (source, lease) = match custom {
            Some(source) => (source, None),
            None => {
                let (lease, source) = self.devices.lease_camera(device_id)?;
                (source, Some(lease))
            }
        };
        Ok(spawn_video(
            &self.context(),
            VideoPipelineSpec {
                kind: StreamKind::Video,
                local_key: StreamKey::video(LOCAL_USER_ID),
                sending,
                encoder: self.shared.codecs.video_encoder(StreamKind::Video),
                preprocessor: Some(self.preprocessor.clone()),
                max_fps: Some(self.max_fps.clone()),
                lease,
            },
            PipelineSource::Video(source),
        ))
    }

    /// Cap the camera's encoded frame rate; 0 removes the cap. Applies to
    /// the running capture immediately.
    pub fn set_max_frame_rate(&self, fps: u32) {
        self.max_fps.store(fps, Ordering::Relaxed);
    }

    pub fn max_frame_rate(&self) -> u32 {
        self.max_fps.load(Ordering::Relaxed)
    }

    /// Start capture. With `sending == false` frames only reach the local
    /// preview tap. Returns `true` when a new pipeline was created.
    pub fn start_video(&self, sending: bool) -> Result<bool, HuddleError> {
        let mut slots = self.slots();
        if let Some(pipeline) = &slots.video {
            if sending {
                pipeline.set_sending(true);
            }
            return Ok(false);
        }
        let pipeline = self.spawn_camera(None, sending)?;
        slots.video = Some(pipeline);
        drop(slots);
        self.emit(MediaEvent::CaptureStarted(StreamKind::Video));
        Ok(true)
    }

    /// Stop sending. The capture keeps running only if `keep_preview`.
    pub fn stop_video(&self, keep_preview: bool) -> bool {
        let mut slots = self.slots();
        let Some(pipeline) = &slots.video else {
            return false;
        };
        let was_sending = pipeline.is_sending();
        if keep_preview {
            pipeline.set_sending(false);
            return was_sending;
        }
        if let Some(pipeline) = slots.video.take() {
            drop(slots);
            self.retire(pipeline);
        }
        was_sending
    }

    /// Tear down a preview-only capture. A sending capture is left alone.
    pub fn stop_preview(&self) -> bool {
        let mut slots = self.slots();
        if slots.video.as_ref().is_some_and(|p| !p.is_sending()) {
            if let Some(pipeline) = slots.video.take() {
                drop(slots);
                self.retire(pipeline);
                return true;
            }
        }
        false
    }

    pub fn is_video_sending(&self) -> bool {
        self.slots().video.as_ref().is_some_and(|p| p.is_sending())
    }

    pub fn is_capturing_video(&self) -> bool {
        self.slots().video.is_some()
    }

    pub fn camera_device(&self) -> Option<String> {
        self.slots()
            .video
            .as_ref()
            .and_then(|p| p.device_id().map(str::to_string))
    }

    /// Move the running capture to `device_id`, or to the next registered
    /// camera. The old capture is fully stopped before the new one starts.
    pub async fn switch_camera(&self, device_id: Option<&str>) -> Result<String, HuddleError> {
        let (current, sending) = {
            let slots = self.slots();
            let pipeline = slots.video.as_ref().ok_or(HuddleError::VideoModuleNotReady)?;
            let current = pipeline.device_id().map(str::to_string).ok_or_else(|| {
                HuddleError::WrongUsage("capture runs from a custom video source".into())
            })?;
            (current, pipeline.is_sending())
        };
        let target = match device_id {
            Some(id) => id.to_string(),
            None => {
                let cameras = self.devices.list(devices::DeviceKind::Camera);
                let idx = cameras.iter().position(|d| d.id == current).unwrap_or(0);
                cameras
                    .get((idx + 1) % cameras.len().max(1))
                    .map(|d| d.id.clone())
                    .ok_or_else(|| HuddleError::DeviceUnavailable("camera".into()))?
            }
        };
        if target == current {
            return Ok(current);
        }
        if !self
            .devices
            .list(devices::DeviceKind::Camera)
            .iter()
            .any(|d| d.id == target)
        {
            return Err(HuddleError::DeviceUnavailable(target));
        }

        let old = self.slots().video.take();
        if let Some(old) = old {
            old.shutdown().await;
            self.emit(MediaEvent::CaptureStopped(StreamKind::Video));
        }
        self.devices.select_camera(&target)?;
        let pipeline = self.spawn_camera(Some(&target), sending)?;
        self.slots().video = Some(pipeline);
        self.emit(MediaEvent::CaptureStarted(StreamKind::Video));
        tracing::info!(from = %current, to = %target, "camera switched");
        Ok(target)
    }

    // ---------------------------------------------------------------------
    // Share
    // ---------------------------------------------------------------------

    fn install_share(&self, slots: &mut Slots, pipeline: SendPipeline) {
        let kind = pipeline.kind();
        slots.share = Some(pipeline);
        self.emit(MediaEvent::CaptureStarted(kind));
    }

    pub fn start_share(&self, source: Arc<dyn ShareSourcePort>) -> Result<(), HuddleError> {
        let mut slots = self.slots();
        if slots.share.is_some() {
            return Err(HuddleError::AlreadyInProgress);
        }
        let pipeline = spawn_video(
            &self.context(),
            VideoPipelineSpec {
                kind: StreamKind::ShareNormal,
                local_key: StreamKey::new(LOCAL_USER_ID, StreamKind::ShareNormal),
                sending: true,
                encoder: self.shared.codecs.video_encoder(StreamKind::ShareNormal),
                preprocessor: None,
                max_fps: None,
                lease: None,
            },
            PipelineSource::Share(source),
        );
        self.install_share(&mut slots, pipeline);
        Ok(())
    }

    /// Share a camera as screen content. The camera used for the regular
    /// video stream cannot be shared at the same time.
    pub fn start_share_camera(&self, device_id: Option<&str>) -> Result<(), HuddleError> {
        let mut slots = self.slots();
        if slots.share.is_some() {
            return Err(HuddleError::AlreadyInProgress);
        }
        if let Some(video_device) = slots.video.as_ref().and_then(|p| p.device_id()) {
            if device_id.is_none_or(|id| id == video_device) {
                return Err(HuddleError::ShareCameraConflict);
            }
        }
        let (lease, source) = self.devices.lease_camera(device_id)?;
        let pipeline = spawn_video(
            &self.context(),
            VideoPipelineSpec {
                kind: StreamKind::ShareCamera,
                local_key: StreamKey::new(LOCAL_USER_ID, StreamKind::ShareCamera),
                sending: true,
                encoder: self.shared.codecs.video_encoder(StreamKind::ShareCamera),
                preprocessor: None,
                max_fps: None,
                lease: Some(lease),
            },
            PipelineSource::Video(source),
        );
        self.install_share(&mut slots, pipeline);
        Ok(())
    }

    pub fn start_share_audio(&self, source: Arc<dyn AudioSourcePort>) -> Result<(), HuddleError> {
        let mut slots = self.slots();
        if slots.share.is_some() {
            return Err(HuddleError::AlreadyInProgress);
        }
        let pipeline = spawn_audio(
            &self.context(),
            AudioPipelineSpec {
                kind: StreamKind::SharePureAudio,
                local_key: StreamKey::new(LOCAL_USER_ID, StreamKind::SharePureAudio),
                sending: true,
                encoder: self.shared.codecs.audio_encoder(),
                lease: None,
            },
            source,
        );
        self.install_share(&mut slots, pipeline);
        Ok(())
    }

    pub fn set_share_sending(&self, sending: bool) -> Result<StreamKind, HuddleError> {
        match &self.slots().share {
            Some(pipeline) => {
                pipeline.set_sending(sending);
                Ok(pipeline.kind())
            }
            None => Err(HuddleError::NotSharing),
        }
    }

    /// Returns the kind of the share that was stopped.
    pub fn stop_share(&self) -> Option<StreamKind> {
        let pipeline = self.slots().share.take()?;
        let kind = pipeline.kind();
        self.retire(pipeline);
        Some(kind)
    }

    pub fn share_kind(&self) -> Option<StreamKind> {
        self.slots().share.as_ref().map(|p| p.kind())
    }

    pub fn is_share_paused(&self) -> bool {
        self.slots().share.as_ref().is_some_and(|p| !p.is_sending())
    }

    // ---------------------------------------------------------------------
    // Subscriptions and receive side
    // ---------------------------------------------------------------------

    /// Caps are checked synchronously; a refusal is also reported as
    /// `MediaEvent::SubscribeFailed`.
    pub fn subscribe(
        &self,
        consumer: Arc<dyn RawDataConsumer>,
        key: StreamKey,
        resolution: Resolution,
    ) -> Result<SubscriptionId, HuddleError> {
        let result = self.subscriptions().subscribe(key, resolution, consumer);
        result.map_err(|reason| {
            tracing::debug!(stream = %key, ?reason, "subscribe refused");
            self.emit(MediaEvent::SubscribeFailed { key, reason });
            HuddleError::Subscribe(reason)
        })
    }

    pub fn unsubscribe(
        &self,
        consumer: &Arc<dyn RawDataConsumer>,
        key: &StreamKey,
    ) -> Result<(), HuddleError> {
        Ok(self.subscriptions().unsubscribe(consumer, key)?)
    }

    pub fn set_resolution(
        &self,
        consumer: &Arc<dyn RawDataConsumer>,
        key: &StreamKey,
        resolution: Resolution,
    ) -> Result<(), HuddleError> {
        Ok(self.subscriptions().set_resolution(consumer, key, resolution)?)
    }

    pub fn is_subscribed(&self, consumer: &Arc<dyn RawDataConsumer>, key: &StreamKey) -> bool {
        self.subscriptions().is_subscribed(consumer, key)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions().count()
    }

    /// Tell consumers of `key` that the stream started or stopped.
    pub fn publish_status(&self, key: StreamKey, status: RawDataStatus) {
        self.shared.router.publish(&key, MediaPayload::Status(status));
    }

    /// Forget everything received from a user who left.
    pub fn drop_user(&self, user_id: u64) {
        for kind in [
            StreamKind::Video,
            StreamKind::ShareNormal,
            StreamKind::ShareCamera,
            StreamKind::SharePureAudio,
            StreamKind::Audio,
        ] {
            let key = StreamKey::new(user_id, kind);
            self.publish_status(key, RawDataStatus::Off);
        }
        self.subscriptions().drop_user(user_id);
        self.shared.playout.remove_source(user_id);
        self.shared
            .stats
            .lock()
            .expect("stats lock poisoned")
            .retain(|key, _| key.user_id != user_id);
        self.shared
            .levels
            .write()
            .expect("levels lock poisoned")
            .remove(&user_id);
    }

    pub fn statistics(&self, key: &StreamKey) -> Option<StreamStatistics> {
        self.shared
            .stats
            .lock()
            .expect("stats lock poisoned")
            .get_mut(key)
            .map(|tracker| tracker.snapshot(Instant::now()))
    }

    pub fn network_levels(&self, user_id: u64) -> NetworkLevels {
        let stats = self.shared.stats.lock().expect("stats lock poisoned");
        let quality = |kinds: &[StreamKind]| {
            kinds
                .iter()
                .filter_map(|k| stats.get(&StreamKey::new(user_id, *k)))
                .map(|t| t.quality())
                .find(|q| *q != NetworkQuality::Unknown)
                .unwrap_or_default()
        };
        NetworkLevels {
            audio: quality(&[StreamKind::Audio]),
            video: quality(&[StreamKind::Video]),
            share: quality(&[
                StreamKind::ShareNormal,
                StreamKind::ShareCamera,
                StreamKind::SharePureAudio,
            ]),
        }
    }

    /// Audio levels of every user heard so far.
    pub(crate) fn levels(&self) -> HashMap<u64, u8> {
        self.shared.levels.read().expect("levels lock poisoned").clone()
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    /// Stop every pipeline and subscription and forget received state.
    /// Waits until all capture devices are released.
    pub async fn shutdown(&self) {
        let pipelines: Vec<SendPipeline> = {
            let mut slots = self.slots();
            [slots.audio.take(), slots.video.take(), slots.share.take()]
                .into_iter()
                .flatten()
                .collect()
        };
        for pipeline in pipelines {
            let kind = pipeline.kind();
            pipeline.shutdown().await;
            self.emit(MediaEvent::CaptureStopped(kind));
        }
        self.stop_receiver();
        self.uplink.detach();
        self.subscriptions().clear();
        self.shared.router.clear();
        self.shared.playout.clear();
        self.shared.stats.lock().expect("stats lock poisoned").clear();
        self.shared.levels.write().expect("levels lock poisoned").clear();
        tracing::debug!("media engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use huddle_media::VideoFrame;

    use crate::events::HuddleEvent;
    use crate::media::ports::VideoFrameSender;

    #[derive(Default)]
    struct TestCamera {
        sender: Mutex<Option<VideoFrameSender>>,
        starts: AtomicUsize,
    }

    impl VideoSourcePort for TestCamera {
        fn on_start(&self, sender: VideoFrameSender) {
            self.starts.fetch_add(1, Ordering::SeqCst);
            *self.sender.lock().unwrap() = Some(sender);
        }
        fn on_stop(&self) {
            self.sender.lock().unwrap().take();
        }
    }

    struct Preview {
        frames: Mutex<Vec<u64>>,
    }

    impl RawDataConsumer for Preview {
        fn on_video_frame(&self, _key: &StreamKey, frame: &VideoFrame) {
            self.frames.lock().unwrap().push(frame.timestamp_us);
        }
    }

    fn engine() -> MediaEngine {
        MediaEngine::new(&EngineConfig::default(), EventEmitter::new())
    }

    async fn wait_stopped(rx: &mut tokio::sync::mpsc::UnboundedReceiver<HuddleEvent>) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(event, HuddleEvent::Media(MediaEvent::CaptureStopped(StreamKind::Video))) {
                return;
            }
        }
    }

    #[tokio::test]
    async fn preview_frames_reach_local_consumers() {
        let engine = engine();
        let camera = Arc::new(TestCamera::default());
        engine.devices().register_camera("cam", "Cam", camera.clone());
        assert!(engine.start_video(false).unwrap());

        let preview = Arc::new(Preview {
            frames: Mutex::new(Vec::new()),
        });
        engine
            .subscribe(preview.clone(), StreamKey::video(LOCAL_USER_ID), Resolution::P360)
            .unwrap();
        let sender = camera.sender.lock().unwrap().clone().unwrap();
        for ts in 1..=3 {
            sender
                .send(VideoFrame::filled(4, 4, (16, 128, 128)).unwrap().with_timestamp(ts))
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*preview.frames.lock().unwrap(), vec![1, 2, 3]);
        assert!(!engine.is_video_sending());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn stop_releases_device_after_ack() {
        let engine = engine();
        let mut events = engine.shared.emitter.subscribe();
        engine
            .devices()
            .register_camera("cam", "Cam", Arc::new(TestCamera::default()));
        engine.start_video(true).unwrap();
        assert!(engine.devices().is_leased("cam"));

        assert!(engine.stop_video(false));
        wait_stopped(&mut events).await;
        assert!(!engine.devices().is_leased("cam"));
    }

    #[tokio::test]
    async fn switch_camera_quiesces_the_old_device() {
        let engine = engine();
        let front = Arc::new(TestCamera::default());
        let back = Arc::new(TestCamera::default());
        engine.devices().register_camera("front", "Front", front.clone());
        engine.devices().register_camera("back", "Back", back.clone());
        engine.start_video(true).unwrap();
        assert_eq!(engine.camera_device().as_deref(), Some("front"));

        assert_eq!(engine.switch_camera(None).await.unwrap(), "back");
        assert!(!engine.devices().is_leased("front"));
        assert!(engine.devices().is_leased("back"));
        assert!(front.sender.lock().unwrap().is_none());
        assert_eq!(back.starts.load(Ordering::SeqCst), 1);
        assert!(engine.is_video_sending());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn share_camera_conflicts_with_video_capture() {
        let engine = engine();
        engine
            .devices()
            .register_camera("cam", "Cam", Arc::new(TestCamera::default()));
        engine.start_video(true).unwrap();
        assert_eq!(
            engine.start_share_camera(None).unwrap_err(),
            HuddleError::ShareCameraConflict
        );
        assert_eq!(engine.set_share_sending(false).unwrap_err(), HuddleError::NotSharing);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn volume_is_bounded() {
        let engine = engine();
        assert!(engine.set_playback_volume(3, 11.0).is_err());
        engine.set_playback_volume(3, 2.5).unwrap();
        assert_eq!(engine.playback_volume(3), 2.5);
        assert_eq!(engine.playback_volume(4), 10.0);
    }

    #[tokio::test]
    async fn starting_without_devices_fails() {
        let engine = engine();
        assert!(matches!(
            engine.start_audio(false),
            Err(HuddleError::DeviceUnavailable(_))
        ));
        assert!(matches!(
            engine.start_video(true),
            Err(HuddleError::DeviceUnavailable(_))
        ));
    }
}
