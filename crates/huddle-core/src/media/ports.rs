//! Plug points for custom media.
//!
//! A source port is handed a frame sender when its pipeline starts and is
//! told when it stops. Frames pushed after stop are refused.

use huddle_media::{AudioFrame, StreamKind, VideoFrame};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::errors::HuddleError;

pub use huddle_media::{RawDataConsumer, RawDataStatus};

fn module_not_ready(kind: StreamKind) -> HuddleError {
    match kind {
        StreamKind::Audio => HuddleError::AudioModuleNotReady,
        StreamKind::Video => HuddleError::VideoModuleNotReady,
        _ => HuddleError::ShareModuleNotReady,
    }
}

fn map_send_error<T>(kind: StreamKind, e: TrySendError<T>) -> HuddleError {
    match e {
        TrySendError::Full(_) => HuddleError::SendTooFrequently,
        TrySendError::Closed(_) => module_not_ready(kind),
    }
}

/// Pushes raw video frames into a send pipeline.
#[derive(Debug, Clone)]
pub struct VideoFrameSender {
    kind: StreamKind,
    tx: mpsc::Sender<VideoFrame>,
}

impl VideoFrameSender {
    pub(crate) fn new(kind: StreamKind, tx: mpsc::Sender<VideoFrame>) -> Self {
        Self { kind, tx }
    }

    /// Fails with `SendTooFrequently` when the pipeline queue is full.
    pub fn send(&self, frame: VideoFrame) -> Result<(), HuddleError> {
        self.tx
            .try_send(frame)
            .map_err(|e| map_send_error(self.kind, e))
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Pushes raw PCM into a send pipeline.
#[derive(Debug, Clone)]
pub struct AudioFrameSender {
    kind: StreamKind,
    tx: mpsc::Sender<AudioFrame>,
}

impl AudioFrameSender {
    pub(crate) fn new(kind: StreamKind, tx: mpsc::Sender<AudioFrame>) -> Self {
        Self { kind, tx }
    }

    pub fn send(&self, frame: AudioFrame) -> Result<(), HuddleError> {
        self.tx
            .try_send(frame)
            .map_err(|e| map_send_error(self.kind, e))
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Replaces the camera as the origin of outgoing video.
pub trait VideoSourcePort: Send + Sync {
    fn on_start(&self, sender: VideoFrameSender);
    fn on_stop(&self);
}

/// Replaces the microphone as the origin of outgoing audio.
pub trait AudioSourcePort: Send + Sync {
    fn on_start(&self, sender: AudioFrameSender);
    fn on_stop(&self);
}

/// Origin of a screen or window share.
pub trait ShareSourcePort: Send + Sync {
    fn on_start(&self, sender: VideoFrameSender);
    fn on_stop(&self);
}

/// Runs on every captured frame before the local preview and the encoder.
pub trait VideoPreprocessor: Send + Sync {
    fn process(&self, frame: &mut VideoFrame);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_reports_too_frequent() {
        let (tx, _rx) = mpsc::channel(1);
        let sender = VideoFrameSender::new(StreamKind::Video, tx);
        let frame = VideoFrame::filled(4, 4, (16, 128, 128)).unwrap();
        assert!(sender.send(frame.clone()).is_ok());
        assert_eq!(sender.send(frame), Err(HuddleError::SendTooFrequently));
    }

    #[test]
    fn closed_pipeline_reports_module_not_ready() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = AudioFrameSender::new(StreamKind::Audio, tx);
        let frame = AudioFrame::new(vec![0; 480], 48_000, 1).unwrap();
        assert_eq!(sender.send(frame), Err(HuddleError::AudioModuleNotReady));
        assert!(sender.is_closed());

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let share = VideoFrameSender::new(StreamKind::ShareNormal, tx);
        let frame = VideoFrame::filled(2, 2, (0, 0, 0)).unwrap();
        assert_eq!(share.send(frame), Err(HuddleError::ShareModuleNotReady));
    }
}
