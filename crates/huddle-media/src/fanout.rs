//! Decoded-frame fan-out.
//!
//! One broadcast channel per stream key. Every consumer attached to a key
//! receives each decoded frame once, in capture order. A consumer that
//! falls behind skips frames instead of stalling the decoder.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};

use crate::frame::{AudioFrame, VideoFrame};
use crate::stream::StreamKey;

const DEFAULT_CAPACITY: usize = 64;

/// Whether a stream currently produces raw data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawDataStatus {
    On,
    Off,
}

#[derive(Debug, Clone)]
pub enum MediaPayload {
    Video(VideoFrame),
    Audio { user_id: u64, frame: AudioFrame },
    Status(RawDataStatus),
}

/// Sink for decoded frames. Called from a delivery task, never from the
/// decoder itself.
pub trait RawDataConsumer: Send + Sync {
    fn on_video_frame(&self, _key: &StreamKey, _frame: &VideoFrame) {}
    fn on_audio_frame(&self, _user_id: u64, _frame: &AudioFrame) {}
    fn on_raw_data_status(&self, _key: &StreamKey, _status: RawDataStatus) {}
}

/// Identity of a consumer object, derived from its allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(usize);

impl ConsumerId {
    pub fn of(consumer: &Arc<dyn RawDataConsumer>) -> Self {
        Self(Arc::as_ptr(consumer) as *const () as usize)
    }
}

struct StreamEntry {
    tx: broadcast::Sender<MediaPayload>,
    consumers: HashSet<ConsumerId>,
    created_at: Instant,
}

/// Routes decoded frames from the receive path to registered consumers.
pub struct FanoutRouter {
    streams: RwLock<HashMap<StreamKey, StreamEntry>>,
    capacity: usize,
    negotiations: AtomicU64,
}

impl Default for FanoutRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl FanoutRouter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` is the number of frames a slow consumer may lag before it
    /// starts skipping.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            negotiations: AtomicU64::new(0),
        }
    }

    /// Register a consumer on a stream. The first consumer opens the decode
    /// path; later consumers share it.
    pub fn attach(&self, key: StreamKey, consumer: ConsumerId) -> broadcast::Receiver<MediaPayload> {
        let mut streams = self.streams.write().expect("fanout lock poisoned");
        let entry = streams.entry(key).or_insert_with(|| {
            self.negotiations.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(stream = %key, "decode path opened");
            let (tx, _) = broadcast::channel(self.capacity);
            StreamEntry {
                tx,
                consumers: HashSet::new(),
                created_at: Instant::now(),
            }
        });
        entry.consumers.insert(consumer);
        tracing::debug!(
            stream = %key,
            consumers = entry.consumers.len(),
            "consumer attached"
        );
        entry.tx.subscribe()
    }

    /// Remove a consumer. Returns `true` when it was the last one and the
    /// stream entry was torn down.
    pub fn detach(&self, key: &StreamKey, consumer: ConsumerId) -> bool {
        let mut streams = self.streams.write().expect("fanout lock poisoned");
        let Some(entry) = streams.get_mut(key) else {
            return false;
        };
        entry.consumers.remove(&consumer);
        if entry.consumers.is_empty() {
            if let Some(entry) = streams.remove(key) {
                tracing::debug!(
                    stream = %key,
                    lifetime_ms = entry.created_at.elapsed().as_millis() as u64,
                    "decode path closed"
                );
            }
            return true;
        }
        false
    }

    /// Deliver one payload to every consumer of `key`. Returns how many
    /// receivers were reached.
    pub fn publish(&self, key: &StreamKey, payload: MediaPayload) -> usize {
        let streams = self.streams.read().expect("fanout lock poisoned");
        match streams.get(key) {
            Some(entry) => entry.tx.send(payload).unwrap_or(0),
            None => 0,
        }
    }

    pub fn has_consumers(&self, key: &StreamKey) -> bool {
        self.streams
            .read()
            .expect("fanout lock poisoned")
            .contains_key(key)
    }

    pub fn consumer_count(&self, key: &StreamKey) -> usize {
        self.streams
            .read()
            .expect("fanout lock poisoned")
            .get(key)
            .map_or(0, |e| e.consumers.len())
    }

    /// Number of decode paths opened since creation.
    pub fn negotiations(&self) -> u64 {
        self.negotiations.load(Ordering::Relaxed)
    }

    /// Drop every stream entry. Receivers observe a closed channel.
    pub fn clear(&self) {
        self.streams.write().expect("fanout lock poisoned").clear();
    }
}

/// Pump frames from a fan-out receiver into one consumer until cancelled
/// or the stream entry goes away.
pub(crate) async fn delivery_loop(
    key: StreamKey,
    mut rx: broadcast::Receiver<MediaPayload>,
    consumer: Arc<dyn RawDataConsumer>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    tracing::debug!(stream = %key, "delivery loop started");
    let mut delivered: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel_rx.changed() => {
                tracing::debug!(stream = %key, "delivery loop cancelled");
                break;
            }
            msg = rx.recv() => {
                match msg {
                    Ok(MediaPayload::Video(frame)) => {
                        delivered += 1;
                        if delivered == 1 {
                            tracing::info!(
                                stream = %key,
                                width = frame.width(),
                                height = frame.height(),
                                "first video frame delivered"
                            );
                        }
                        consumer.on_video_frame(&key, &frame);
                    }
                    Ok(MediaPayload::Audio { user_id, frame }) => {
                        delivered += 1;
                        consumer.on_audio_frame(user_id, &frame);
                    }
                    Ok(MediaPayload::Status(status)) => consumer.on_raw_data_status(&key, status),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(stream = %key, skipped, "consumer lagging, frames skipped");
                    }
                    Err(RecvError::Closed) => {
                        tracing::debug!(stream = %key, "stream closed");
                        break;
                    }
                }
            }
        }
    }

    tracing::debug!(stream = %key, delivered, "delivery loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::stream::StreamKind;

    #[derive(Default)]
    struct Recorder {
        timestamps: Mutex<Vec<u64>>,
    }

    impl RawDataConsumer for Recorder {
        fn on_video_frame(&self, _key: &StreamKey, frame: &VideoFrame) {
            self.timestamps.lock().unwrap().push(frame.timestamp_us);
        }
    }

    fn frame(ts: u64) -> MediaPayload {
        MediaPayload::Video(VideoFrame::filled(2, 2, (16, 128, 128)).unwrap().with_timestamp(ts))
    }

    #[test]
    fn second_consumer_shares_decode_path() {
        let router = FanoutRouter::new();
        let key = StreamKey::video(1);
        let a: Arc<dyn RawDataConsumer> = Arc::new(Recorder::default());
        let b: Arc<dyn RawDataConsumer> = Arc::new(Recorder::default());

        let _ra = router.attach(key, ConsumerId::of(&a));
        let _rb = router.attach(key, ConsumerId::of(&b));
        assert_eq!(router.negotiations(), 1);
        assert_eq!(router.consumer_count(&key), 2);

        assert!(!router.detach(&key, ConsumerId::of(&a)));
        assert!(router.detach(&key, ConsumerId::of(&b)));
        assert!(!router.has_consumers(&key));
    }

    #[test]
    fn publish_without_consumers_is_dropped() {
        let router = FanoutRouter::new();
        assert_eq!(router.publish(&StreamKey::video(1), frame(0)), 0);
    }

    #[tokio::test]
    async fn every_consumer_sees_capture_order() {
        let router = Arc::new(FanoutRouter::new());
        let key = StreamKey::new(3, StreamKind::ShareNormal);
        let recorders: Vec<Arc<Recorder>> = (0..3).map(|_| Arc::new(Recorder::default())).collect();
        let mut cancels = Vec::new();
        let mut handles = Vec::new();

        for recorder in &recorders {
            let consumer: Arc<dyn RawDataConsumer> = recorder.clone();
            let rx = router.attach(key, ConsumerId::of(&consumer));
            let (cancel_tx, cancel_rx) = watch::channel(false);
            cancels.push(cancel_tx);
            handles.push(tokio::spawn(delivery_loop(key, rx, consumer, cancel_rx)));
        }

        for ts in 0..20 {
            assert_eq!(router.publish(&key, frame(ts)), 3);
        }
        router.clear();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .unwrap()
                .unwrap();
        }

        let expected: Vec<u64> = (0..20).collect();
        for recorder in recorders {
            assert_eq!(*recorder.timestamps.lock().unwrap(), expected);
        }
    }
}
