//! Signaling and media transport seam.
//!
//! A transport hands the session a [`TransportLink`]: the welcome snapshot
//! plus two JSON signal channels and two media channels. The inbound signal
//! channel closing is how a dropped connection shows up.

mod hub;
pub mod protocol;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::errors::HuddleError;

pub use hub::{HubConfig, LocalHub};
pub use protocol::{
    CameraControlRequest, ClientSignal, FileChunk, FileTransferPolicy, MediaPacket, RecordingAction, ResumeToken,
    ServerSignal, SessionPolicy, SubSessionRequest, Welcome, decode_signal, encode_signal,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The server refused the credentials or the request.
    #[error("rejected: {0}")]
    Rejected(HuddleError),
    #[error("session password required")]
    PasswordRequired,
    #[error("session password is wrong")]
    PasswordWrong,
    #[error("server unreachable: {0}")]
    Unreachable(String),
    #[error("resume rejected")]
    ResumeRejected,
    #[error("link closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether a reconnect attempt may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Unreachable(_) | TransportError::Closed)
    }
}

impl From<TransportError> for HuddleError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Rejected(inner) => inner,
            TransportError::PasswordRequired => HuddleError::NeedPassword,
            TransportError::PasswordWrong => HuddleError::PasswordWrong,
            other => HuddleError::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub session_name: String,
    pub user_name: String,
    pub token: String,
    pub password: Option<String>,
    pub custom_user_id: Option<String>,
}

pub struct TransportLink {
    pub welcome: Welcome,
    pub signals_tx: mpsc::UnboundedSender<Bytes>,
    pub signals_rx: mpsc::UnboundedReceiver<Bytes>,
    pub media_tx: mpsc::Sender<MediaPacket>,
    pub media_rx: mpsc::Receiver<MediaPacket>,
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink")
            .field("session_id", &self.welcome.session_id)
            .field("user_id", &self.welcome.user_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<TransportLink, TransportError>;

    /// Re-establish a dropped link without re-joining.
    async fn resume(&self, token: &ResumeToken) -> Result<TransportLink, TransportError>;
}

/// Outbound half of the signaling link.
#[derive(Debug, Clone)]
pub struct SignalChannel {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl SignalChannel {
    pub fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { tx }
    }

    pub fn send(&self, signal: &ClientSignal) -> Result<(), TransportError> {
        let frame = encode_signal(signal)?;
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    /// `None` targets every other member of the sender's scope.
    pub fn send_command(&self, payload: String, to: Option<u64>) -> Result<(), TransportError> {
        self.send(&ClientSignal::Command { to, payload })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_into_the_taxonomy() {
        assert_eq!(
            HuddleError::from(TransportError::Rejected(HuddleError::AuthDisabled)),
            HuddleError::AuthDisabled
        );
        assert_eq!(
            HuddleError::from(TransportError::PasswordRequired),
            HuddleError::NeedPassword
        );
        assert!(matches!(
            HuddleError::from(TransportError::Closed),
            HuddleError::Transport(_)
        ));
        assert!(TransportError::Unreachable("down".into()).is_retryable());
        assert!(!TransportError::ResumeRejected.is_retryable());
    }

    #[tokio::test]
    async fn signal_channel_encodes_json() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = SignalChannel::new(tx);
        channel.send_command("ping".into(), Some(3)).unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(
            decode_signal::<ClientSignal>(&frame).unwrap(),
            ClientSignal::Command {
                to: Some(3),
                payload: "ping".into()
            }
        );
        drop(rx);
        assert_eq!(channel.send(&ClientSignal::Leave), Err(TransportError::Closed));
    }
}
