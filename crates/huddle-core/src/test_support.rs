//! Fixtures shared by the crate's tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use huddle_media::{AudioFrame, RawDataConsumer, RawDataStatus, StreamKey, VideoFrame};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::auth::{JoinRequest, Role};
use crate::config::{EngineConfig, ReconnectPolicy};
use crate::events::HuddleEvent;
use crate::media::ports::{
    AudioFrameSender, AudioSourcePort, ShareSourcePort, VideoFrameSender, VideoSourcePort,
};
use crate::session::SessionEngine;
use crate::transport::LocalHub;

pub(crate) const KEY: &str = "key";
pub(crate) const SECRET: &str = "secret";
const WAIT: Duration = Duration::from_secs(3);

pub(crate) fn hub() -> LocalHub {
    LocalHub::new(KEY, SECRET).expect("hub")
}

pub(crate) fn fast_config() -> EngineConfig {
    EngineConfig {
        reconnect: ReconnectPolicy {
            initial_delay_ms: 10,
            backoff_coefficient: 2.0,
            max_delay_ms: 80,
            timeout_ms: 3_000,
            jitter: 0.0,
        },
        password_prompt_timeout_ms: 2_000,
        ..EngineConfig::default()
    }
}

pub(crate) fn request(hub: &LocalHub, session: &str, name: &str, role: Role) -> JoinRequest {
    let token = hub
        .issuer()
        .issue(session, role, None, chrono::Duration::hours(1))
        .expect("token");
    JoinRequest::with_token(session, name, token)
}

pub(crate) async fn join_with(
    hub: &LocalHub,
    request: JoinRequest,
) -> (SessionEngine, UnboundedReceiver<HuddleEvent>) {
    let engine = SessionEngine::new(fast_config(), Arc::new(hub.clone()));
    let events = engine.events().subscribe();
    engine.join(request).await.expect("join");
    (engine, events)
}

pub(crate) async fn join(
    hub: &LocalHub,
    session: &str,
    name: &str,
    role: Role,
) -> (SessionEngine, UnboundedReceiver<HuddleEvent>) {
    join_with(hub, request(hub, session, name, role)).await
}

/// Skip events until one matches. Panics after a few seconds.
pub(crate) async fn wait_for<F>(rx: &mut UnboundedReceiver<HuddleEvent>, matches: F) -> HuddleEvent
where
    F: Fn(&HuddleEvent) -> bool,
{
    let found = tokio::time::timeout(WAIT, async {
        while let Some(event) = rx.recv().await {
            if matches(&event) {
                return Some(event);
            }
        }
        None
    })
    .await;
    match found {
        Ok(Some(event)) => event,
        Ok(None) => panic!("event stream closed"),
        Err(_) => panic!("timed out waiting for event"),
    }
}

pub(crate) async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A source that keeps the sender it is handed, for any media kind.
#[derive(Default)]
pub(crate) struct FakeSource {
    video: Mutex<Option<VideoFrameSender>>,
    audio: Mutex<Option<AudioFrameSender>>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

impl FakeSource {
    pub fn push_video(&self, frame: VideoFrame) -> bool {
        let sender = self.video.lock().unwrap().clone();
        sender.is_some_and(|s| s.send(frame).is_ok())
    }

    pub fn push_audio(&self, frame: AudioFrame) -> bool {
        let sender = self.audio.lock().unwrap().clone();
        sender.is_some_and(|s| s.send(frame).is_ok())
    }

    pub fn is_running(&self) -> bool {
        self.starts.load(Ordering::SeqCst) > self.stops.load(Ordering::SeqCst)
    }

    fn stopped(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

impl VideoSourcePort for FakeSource {
    fn on_start(&self, sender: VideoFrameSender) {
        *self.video.lock().unwrap() = Some(sender);
        self.starts.fetch_add(1, Ordering::SeqCst);
    }
    fn on_stop(&self) {
        self.stopped();
    }
}

impl ShareSourcePort for FakeSource {
    fn on_start(&self, sender: VideoFrameSender) {
        *self.video.lock().unwrap() = Some(sender);
        self.starts.fetch_add(1, Ordering::SeqCst);
    }
    fn on_stop(&self) {
        self.stopped();
    }
}

impl AudioSourcePort for FakeSource {
    fn on_start(&self, sender: AudioFrameSender) {
        *self.audio.lock().unwrap() = Some(sender);
        self.starts.fetch_add(1, Ordering::SeqCst);
    }
    fn on_stop(&self) {
        self.stopped();
    }
}

/// Records everything delivered to it.
#[derive(Default)]
pub(crate) struct Collector {
    pub video: Mutex<Vec<(StreamKey, VideoFrame)>>,
    pub audio: Mutex<Vec<(u64, AudioFrame)>>,
    pub statuses: Mutex<Vec<(StreamKey, RawDataStatus)>>,
}

impl Collector {
    pub fn video_count(&self) -> usize {
        self.video.lock().unwrap().len()
    }

    pub fn audio_count(&self) -> usize {
        self.audio.lock().unwrap().len()
    }

    pub fn last_status(&self) -> Option<RawDataStatus> {
        self.statuses.lock().unwrap().last().map(|(_, s)| *s)
    }
}

impl RawDataConsumer for Collector {
    fn on_video_frame(&self, key: &StreamKey, frame: &VideoFrame) {
        self.video.lock().unwrap().push((*key, frame.clone()));
    }

    fn on_audio_frame(&self, user_id: u64, frame: &AudioFrame) {
        self.audio.lock().unwrap().push((user_id, frame.clone()));
    }

    fn on_raw_data_status(&self, key: &StreamKey, status: RawDataStatus) {
        self.statuses.lock().unwrap().push((*key, status));
    }
}

pub(crate) fn video_frame(luma: u8) -> VideoFrame {
    VideoFrame::filled(8, 4, (luma, 128, 128)).expect("frame")
}

pub(crate) fn audio_frame(sample: i16) -> AudioFrame {
    AudioFrame::new(vec![sample; 480], 48_000, 1).expect("frame")
}
