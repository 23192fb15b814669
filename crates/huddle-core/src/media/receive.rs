//! Receive worker: decode, measure, fan out, mix.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use huddle_media::{
    AudioDecoder, FanoutRouter, MediaPayload, NetworkQuality, StatsTracker, StreamKey, StreamKind,
    VideoDecoder,
};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::audio_playout::AudioPlayoutBuffer;
use crate::events::{EventEmitter, HuddleEvent, MediaEvent};
use crate::transport::MediaPacket;

use super::CodecProvider;

pub(crate) type StatsTable = Arc<Mutex<HashMap<StreamKey, StatsTracker>>>;

/// State shared between the receive worker and the media helpers.
#[derive(Clone)]
pub(crate) struct ReceiveShared {
    pub router: Arc<FanoutRouter>,
    pub playout: Arc<AudioPlayoutBuffer>,
    /// Playback volume per user, 0.0 to 10.0; 10 is unity gain.
    pub volumes: Arc<RwLock<HashMap<u64, f32>>>,
    pub levels: Arc<RwLock<HashMap<u64, u8>>>,
    pub stats: StatsTable,
    pub codecs: Arc<dyn CodecProvider>,
    pub emitter: EventEmitter,
}

struct ReceiveWorker {
    shared: ReceiveShared,
    video_decoders: HashMap<StreamKey, Box<dyn VideoDecoder>>,
    audio_decoders: HashMap<StreamKey, Box<dyn AudioDecoder>>,
    qualities: HashMap<StreamKey, NetworkQuality>,
}

pub(crate) async fn receive_worker(
    shared: ReceiveShared,
    mut media: mpsc::Receiver<MediaPacket>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let mut worker = ReceiveWorker {
        shared,
        video_decoders: HashMap::new(),
        audio_decoders: HashMap::new(),
        qualities: HashMap::new(),
    };
    let mut received: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel_rx.changed() => break,
            packet = media.recv() => match packet {
                Some(packet) => {
                    received += 1;
                    worker.handle(packet);
                }
                None => break,
            },
        }
    }
    tracing::debug!(received, "receive worker exited");
}

impl ReceiveWorker {
    fn handle(&mut self, packet: MediaPacket) {
        let key = StreamKey::new(packet.sender_id, packet.packet.kind);
        self.measure(key, packet.packet.sequence, packet.packet.payload.len());

        match key.kind {
            StreamKind::Audio | StreamKind::SharePureAudio => self.play_audio(key, &packet),
            StreamKind::Video | StreamKind::ShareNormal | StreamKind::ShareCamera => {
                self.render_video(key, &packet)
            }
        }
    }

    fn measure(&mut self, key: StreamKey, sequence: u64, bytes: usize) {
        let quality = {
            let mut stats = self.shared.stats.lock().expect("stats lock poisoned");
            let tracker = stats.entry(key).or_default();
            tracker.record(Instant::now(), sequence, bytes);
            tracker.quality()
        };
        let previous = self.qualities.insert(key, quality);
        if previous != Some(quality) {
            self.shared
                .emitter
                .emit(HuddleEvent::Media(MediaEvent::NetworkQualityChanged {
                    user_id: key.user_id,
                    kind: key.kind,
                    quality,
                }));
        }
    }

    fn play_audio(&mut self, key: StreamKey, packet: &MediaPacket) {
        let codecs = self.shared.codecs.clone();
        let decoder = self
            .audio_decoders
            .entry(key)
            .or_insert_with(|| codecs.audio_decoder());
        let frame = match decoder.decode(&packet.packet.payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(stream = %key, "audio decode failed: {e}");
                return;
            }
        };

        if key.kind == StreamKind::Audio {
            let level = frame.level();
            let previous = self
                .shared
                .levels
                .write()
                .expect("levels lock poisoned")
                .insert(key.user_id, level);
            if previous != Some(level) {
                self.shared
                    .emitter
                    .emit(HuddleEvent::Media(MediaEvent::AudioLevelChanged {
                        user_id: key.user_id,
                        level,
                    }));
            }
        }

        let volume = self
            .shared
            .volumes
            .read()
            .expect("volume lock poisoned")
            .get(&key.user_id)
            .copied()
            .unwrap_or(10.0);
        if volume > 0.0 {
            self.shared.playout.mix(key.user_id, &frame.scaled(volume / 10.0));
        }

        let router = &self.shared.router;
        let payload = MediaPayload::Audio {
            user_id: key.user_id,
            frame,
        };
        if key.kind == StreamKind::Audio {
            router.publish(&StreamKey::all_audio(), payload.clone());
        }
        router.publish(&key, payload);
    }

    fn render_video(&mut self, key: StreamKey, packet: &MediaPacket) {
        if !self.shared.router.has_consumers(&key) {
            if self.video_decoders.remove(&key).is_some() {
                tracing::debug!(stream = %key, "last consumer gone, decoder released");
            }
            return;
        }
        let codecs = self.shared.codecs.clone();
        let decoder = self.video_decoders.entry(key).or_insert_with(|| {
            tracing::debug!(stream = %key, "decoder created");
            codecs.video_decoder(key.kind)
        });
        match decoder.decode(&packet.packet.payload) {
            Ok(frame) => {
                if let Some(tracker) = self
                    .shared
                    .stats
                    .lock()
                    .expect("stats lock poisoned")
                    .get_mut(&key)
                {
                    tracker.set_dimensions(frame.width(), frame.height());
                }
                self.shared.router.publish(&key, MediaPayload::Video(frame));
            }
            Err(e) => tracing::warn!(stream = %key, "video decode failed: {e}"),
        }
    }
}
