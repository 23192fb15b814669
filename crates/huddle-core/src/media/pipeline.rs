//! Send pipelines: source → preprocessor → local tap → encoder → uplink.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use huddle_media::{
    AudioEncoder, AudioFrame, FanoutRouter, MediaPayload, Packetizer, StreamKey, StreamKind,
    VideoEncoder, VideoFrame,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::transport::MediaPacket;

use super::devices::DeviceLease;
use super::ports::{
    AudioFrameSender, AudioSourcePort, ShareSourcePort, VideoFrameSender, VideoPreprocessor,
    VideoSourcePort,
};

const KEYFRAME_INTERVAL: u64 = 30;

pub(crate) type SharedPreprocessor = Arc<RwLock<Option<Arc<dyn VideoPreprocessor>>>>;

/// Outgoing half of the media link. Frozen while the session reconnects.
#[derive(Default)]
pub(crate) struct Uplink {
    tx: RwLock<Option<mpsc::Sender<MediaPacket>>>,
    frozen: AtomicBool,
}

impl Uplink {
    pub(crate) fn attach(&self, tx: mpsc::Sender<MediaPacket>) {
        *self.tx.write().expect("uplink lock poisoned") = Some(tx);
        self.frozen.store(false, Ordering::SeqCst);
    }

    pub(crate) fn detach(&self) {
        *self.tx.write().expect("uplink lock poisoned") = None;
    }

    pub(crate) fn freeze(&self, frozen: bool) {
        self.frozen.store(frozen, Ordering::SeqCst);
    }

    pub(crate) fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Returns `false` when the packet was dropped.
    pub(crate) fn forward(&self, packet: huddle_media::EncodedPacket) -> bool {
        if self.is_frozen() {
            return false;
        }
        let guard = self.tx.read().expect("uplink lock poisoned");
        match guard.as_ref() {
            Some(tx) => tx
                .try_send(MediaPacket {
                    sender_id: 0,
                    packet,
                })
                .is_ok(),
            None => false,
        }
    }
}

#[derive(Clone)]
pub(crate) enum PipelineSource {
    Video(Arc<dyn VideoSourcePort>),
    Share(Arc<dyn ShareSourcePort>),
    Audio(Arc<dyn AudioSourcePort>),
}

impl PipelineSource {
    fn stop(&self) {
        match self {
            PipelineSource::Video(s) => s.on_stop(),
            PipelineSource::Share(s) => s.on_stop(),
            PipelineSource::Audio(s) => s.on_stop(),
        }
    }
}

/// A running send pipeline. Owns the worker task and the device lease.
pub(crate) struct SendPipeline {
    kind: StreamKind,
    source: PipelineSource,
    sending_tx: watch::Sender<bool>,
    cancel_tx: watch::Sender<bool>,
    worker: JoinHandle<()>,
    lease: Option<DeviceLease>,
}

impl SendPipeline {
    pub(crate) fn kind(&self) -> StreamKind {
        self.kind
    }

    pub(crate) fn source(&self) -> &PipelineSource {
        &self.source
    }

    pub(crate) fn device_id(&self) -> Option<&str> {
        self.lease.as_ref().map(|l| l.device_id())
    }

    /// `false` keeps the local tap running but stops sending, e.g. when
    /// muted, paused, or previewing.
    pub(crate) fn set_sending(&self, sending: bool) {
        self.sending_tx.send_replace(sending);
    }

    pub(crate) fn is_sending(&self) -> bool {
        *self.sending_tx.borrow()
    }

    /// Stop the source, wait for the worker to drain, then release the
    /// device.
    pub(crate) async fn shutdown(self) {
        let _ = self.cancel_tx.send(true);
        self.source.stop();
        if let Err(e) = self.worker.await {
            if e.is_panic() {
                tracing::error!(kind = %self.kind, "send worker panicked");
            }
        }
        drop(self.lease);
        tracing::debug!(kind = %self.kind, "send pipeline shut down");
    }
}

pub(crate) struct PipelineContext {
    pub router: Arc<FanoutRouter>,
    pub uplink: Arc<Uplink>,
    pub queue_depth: usize,
}

pub(crate) struct VideoPipelineSpec {
    pub kind: StreamKind,
    pub local_key: StreamKey,
    pub sending: bool,
    pub encoder: Box<dyn VideoEncoder>,
    pub preprocessor: Option<SharedPreprocessor>,
    /// Upper bound on encoded frames per second; 0 means uncapped.
    pub max_fps: Option<Arc<AtomicU32>>,
    pub lease: Option<DeviceLease>,
}

pub(crate) fn spawn_video(
    ctx: &PipelineContext,
    spec: VideoPipelineSpec,
    source: PipelineSource,
) -> SendPipeline {
    let (frames_tx, frames_rx) = mpsc::channel(ctx.queue_depth.max(1));
    let (sending_tx, sending_rx) = watch::channel(spec.sending);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let worker = tokio::spawn(video_worker(
        VideoWorker {
            kind: spec.kind,
            local_key: spec.local_key,
            encoder: spec.encoder,
            preprocessor: spec.preprocessor,
            max_fps: spec.max_fps,
            router: ctx.router.clone(),
            uplink: ctx.uplink.clone(),
        },
        frames_rx,
        sending_rx,
        cancel_rx,
    ));

    let sender = VideoFrameSender::new(spec.kind, frames_tx);
    match &source {
        PipelineSource::Video(s) => s.on_start(sender),
        PipelineSource::Share(s) => s.on_start(sender),
        PipelineSource::Audio(_) => {
            tracing::error!(kind = %spec.kind, "audio source handed to a video pipeline");
        }
    }
    tracing::info!(kind = %spec.kind, sending = spec.sending, "video pipeline started");

    SendPipeline {
        kind: spec.kind,
        source,
        sending_tx,
        cancel_tx,
        worker,
        lease: spec.lease,
    }
}

struct VideoWorker {
    kind: StreamKind,
    local_key: StreamKey,
    encoder: Box<dyn VideoEncoder>,
    preprocessor: Option<SharedPreprocessor>,
    max_fps: Option<Arc<AtomicU32>>,
    router: Arc<FanoutRouter>,
    uplink: Arc<Uplink>,
}

impl VideoWorker {
    /// Whether a frame at `timestamp_us` comes too soon after `last_us`.
    fn over_frame_rate(&self, last_us: Option<u64>, timestamp_us: u64) -> bool {
        let fps = self
            .max_fps
            .as_ref()
            .map_or(0, |fps| fps.load(Ordering::Relaxed));
        match (fps, last_us) {
            (0, _) | (_, None) => false,
            (fps, Some(last)) => timestamp_us.saturating_sub(last) < 1_000_000 / u64::from(fps),
        }
    }

    fn preprocess(&self, frame: &mut VideoFrame) {
        let Some(shared) = &self.preprocessor else { return };
        let current = shared.read().ok().and_then(|guard| guard.clone());
        if let Some(preprocessor) = current {
            preprocessor.process(frame);
        }
    }
}

async fn video_worker(
    mut worker: VideoWorker,
    mut frames: mpsc::Receiver<VideoFrame>,
    sending: watch::Receiver<bool>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let mut packetizer = Packetizer::new(worker.kind);
    let mut encoded: u64 = 0;
    let mut last_sent_us: Option<u64> = None;

    loop {
        let mut frame = tokio::select! {
            biased;
            _ = cancel_rx.changed() => break,
            next = frames.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
        };

        worker.preprocess(&mut frame);
        worker
            .router
            .publish(&worker.local_key, MediaPayload::Video(frame.clone()));

        if !*sending.borrow() || worker.uplink.is_frozen() {
            continue;
        }
        if worker.over_frame_rate(last_sent_us, frame.timestamp_us) {
            continue;
        }
        let keyframe = encoded % KEYFRAME_INTERVAL == 0;
        match worker.encoder.encode(&frame) {
            Ok(payload) => {
                encoded += 1;
                last_sent_us = Some(frame.timestamp_us);
                worker
                    .uplink
                    .forward(packetizer.packetize(payload, frame.timestamp_us, keyframe));
            }
            Err(e) => tracing::warn!(kind = %worker.kind, "video encode failed: {e}"),
        }
    }
    tracing::debug!(kind = %worker.kind, encoded, "video worker exited");
}

pub(crate) struct AudioPipelineSpec {
    pub kind: StreamKind,
    pub local_key: StreamKey,
    pub sending: bool,
    pub encoder: Box<dyn AudioEncoder>,
    pub lease: Option<DeviceLease>,
}

pub(crate) fn spawn_audio(
    ctx: &PipelineContext,
    spec: AudioPipelineSpec,
    source: Arc<dyn AudioSourcePort>,
) -> SendPipeline {
    let (frames_tx, frames_rx) = mpsc::channel(ctx.queue_depth.max(1));
    let (sending_tx, sending_rx) = watch::channel(spec.sending);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let worker = tokio::spawn(audio_worker(
        spec.kind,
        spec.local_key,
        spec.encoder,
        ctx.router.clone(),
        ctx.uplink.clone(),
        frames_rx,
        sending_rx,
        cancel_rx,
    ));
    source.on_start(AudioFrameSender::new(spec.kind, frames_tx));
    tracing::info!(kind = %spec.kind, sending = spec.sending, "audio pipeline started");

    SendPipeline {
        kind: spec.kind,
        source: PipelineSource::Audio(source),
        sending_tx,
        cancel_tx,
        worker,
        lease: spec.lease,
    }
}

#[allow(clippy::too_many_arguments)]
async fn audio_worker(
    kind: StreamKind,
    local_key: StreamKey,
    mut encoder: Box<dyn AudioEncoder>,
    router: Arc<FanoutRouter>,
    uplink: Arc<Uplink>,
    mut frames: mpsc::Receiver<AudioFrame>,
    sending: watch::Receiver<bool>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let mut packetizer = Packetizer::new(kind);
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel_rx.changed() => break,
            next = frames.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
        };

        router.publish(
            &local_key,
            MediaPayload::Audio {
                user_id: local_key.user_id,
                frame: frame.clone(),
            },
        );
        if !*sending.borrow() || uplink.is_frozen() {
            continue;
        }
        match encoder.encode(&frame) {
            Ok(payload) => {
                uplink.forward(packetizer.packetize(payload, frame.timestamp_us, true));
            }
            Err(e) => tracing::warn!(kind = %kind, "audio encode failed: {e}"),
        }
    }
    tracing::debug!(kind = %kind, "audio worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use huddle_media::{RawVideoCodec, VideoDecoder};

    #[derive(Default)]
    struct CapturingSource {
        sender: Mutex<Option<VideoFrameSender>>,
        stopped: AtomicBool,
    }

    impl VideoSourcePort for CapturingSource {
        fn on_start(&self, sender: VideoFrameSender) {
            *self.sender.lock().unwrap() = Some(sender);
        }
        fn on_stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    struct Brighten;

    impl VideoPreprocessor for Brighten {
        fn process(&self, frame: &mut VideoFrame) {
            frame.with_planes_mut(|y, _, _| y.iter_mut().for_each(|p| *p = 200));
        }
    }

    fn context(uplink: Arc<Uplink>) -> PipelineContext {
        PipelineContext {
            router: Arc::new(FanoutRouter::new()),
            uplink,
            queue_depth: 8,
        }
    }

    #[tokio::test]
    async fn frames_are_preprocessed_encoded_and_forwarded() {
        let uplink = Arc::new(Uplink::default());
        let (tx, mut rx) = mpsc::channel(8);
        uplink.attach(tx);
        let ctx = context(uplink);
        let source = Arc::new(CapturingSource::default());
        let preprocessor: SharedPreprocessor = Arc::new(RwLock::new(Some(Arc::new(Brighten))));

        let pipeline = spawn_video(
            &ctx,
            VideoPipelineSpec {
                kind: StreamKind::Video,
                local_key: StreamKey::video(u64::MAX),
                sending: true,
                encoder: Box::new(RawVideoCodec),
                preprocessor: Some(preprocessor),
                max_fps: None,
                lease: None,
            },
            PipelineSource::Video(source.clone()),
        );

        let sender = source.sender.lock().unwrap().clone().unwrap();
        sender
            .send(VideoFrame::filled(4, 4, (16, 128, 128)).unwrap().with_timestamp(7))
            .unwrap();

        let packet = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(packet.packet.keyframe);
        assert_eq!(packet.packet.sequence, 0);
        let decoded = RawVideoCodec.decode(&packet.packet.payload).unwrap();
        assert_eq!(decoded.timestamp_us, 7);
        assert!(decoded.y().iter().all(|p| *p == 200));

        pipeline.shutdown().await;
        assert!(source.stopped.load(Ordering::SeqCst));
        assert!(sender.is_closed());
    }

    #[tokio::test]
    async fn preview_only_and_frozen_pipelines_send_nothing() {
        let uplink = Arc::new(Uplink::default());
        let (tx, mut rx) = mpsc::channel(8);
        uplink.attach(tx);
        let ctx = context(uplink.clone());
        let source = Arc::new(CapturingSource::default());
        let pipeline = spawn_video(
            &ctx,
            VideoPipelineSpec {
                kind: StreamKind::Video,
                local_key: StreamKey::video(u64::MAX),
                sending: false,
                encoder: Box::new(RawVideoCodec),
                preprocessor: None,
                max_fps: None,
                lease: None,
            },
            PipelineSource::Video(source.clone()),
        );
        let sender = source.sender.lock().unwrap().clone().unwrap();
        let frame = VideoFrame::filled(2, 2, (16, 128, 128)).unwrap();

        sender.send(frame.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        uplink.freeze(true);
        pipeline.set_sending(true);
        sender.send(frame.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        uplink.freeze(false);
        sender.send(frame).unwrap();
        let packet = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.packet.sequence, 0);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn frame_rate_cap_drops_early_frames() {
        let uplink = Arc::new(Uplink::default());
        let (tx, mut rx) = mpsc::channel(8);
        uplink.attach(tx);
        let ctx = context(uplink);
        let source = Arc::new(CapturingSource::default());
        let pipeline = spawn_video(
            &ctx,
            VideoPipelineSpec {
                kind: StreamKind::Video,
                local_key: StreamKey::video(u64::MAX),
                sending: true,
                encoder: Box::new(RawVideoCodec),
                preprocessor: None,
                max_fps: Some(Arc::new(AtomicU32::new(10))),
                lease: None,
            },
            PipelineSource::Video(source.clone()),
        );
        let sender = source.sender.lock().unwrap().clone().unwrap();
        let frame = VideoFrame::filled(2, 2, (16, 128, 128)).unwrap();
        for ts in [0, 50_000, 100_000] {
            sender.send(frame.clone().with_timestamp(ts)).unwrap();
        }

        let mut timestamps = Vec::new();
        for _ in 0..2 {
            let packet = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            timestamps.push(packet.packet.timestamp_us);
        }
        assert_eq!(timestamps, vec![0, 100_000]);
        pipeline.shutdown().await;
        assert!(rx.try_recv().is_err());
    }
}
