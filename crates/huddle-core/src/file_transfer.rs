//! In-session file transfer: chunked base64 over the signaling link.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;

use crate::errors::HuddleError;
use crate::events::{ChatEvent, FileTransferStatus, HuddleEvent, ReceivedFile};
use crate::session::Shared;
use crate::transport::{ClientSignal, FileChunk};

struct Incoming {
    sender_id: u64,
    name: String,
    total: u64,
    data: Vec<u8>,
}

/// Transfers being received and files waiting to be collected.
#[derive(Default)]
pub(crate) struct FileStore {
    incoming: HashMap<String, Incoming>,
    received: HashMap<String, (ReceivedFile, Bytes)>,
}

fn progress(transfer_id: &str, status: FileTransferStatus) -> ChatEvent {
    ChatEvent::FileTransferProgress {
        transfer_id: transfer_id.to_string(),
        status,
    }
}

/// Append one received chunk. Returns the events to emit.
pub(crate) fn accept_chunk(
    store: &mut FileStore,
    from: u64,
    chunk: FileChunk,
    max_bytes: u64,
) -> Vec<ChatEvent> {
    let id = chunk.transfer_id.clone();
    let fail = |store: &mut FileStore, reason: String| {
        store.incoming.remove(&id);
        tracing::warn!(transfer_id = %id, sender_id = from, "incoming file dropped: {reason}");
        vec![progress(&id, FileTransferStatus::Failed(reason))]
    };

    if chunk.total_size > max_bytes {
        return fail(store, format!("{} bytes exceeds the size limit", chunk.total_size));
    }
    let data = match STANDARD.decode(chunk.data.as_bytes()) {
        Ok(data) => data,
        Err(e) => return fail(store, format!("bad chunk encoding: {e}")),
    };

    let mut events = Vec::new();
    if !store.incoming.contains_key(&id) {
        if chunk.offset != 0 {
            return fail(store, "transfer started mid-file".into());
        }
        events.push(progress(&id, FileTransferStatus::Ready));
        store.incoming.insert(
            id.clone(),
            Incoming {
                sender_id: from,
                name: chunk.name.clone(),
                total: chunk.total_size,
                data: Vec::with_capacity(chunk.total_size as usize),
            },
        );
    }
    let Some(entry) = store.incoming.get_mut(&id) else {
        return events;
    };
    if entry.sender_id != from || chunk.offset != entry.data.len() as u64 {
        return fail(store, "chunk out of order".into());
    }
    entry.data.extend_from_slice(&data);
    let sent = entry.data.len() as u64;
    let total = entry.total;
    if sent > total {
        return fail(store, "more data than announced".into());
    }
    events.push(progress(&id, FileTransferStatus::Transferring { sent, total }));

    if chunk.last {
        if sent != total {
            return fail(store, format!("truncated at {sent} of {total} bytes"));
        }
        if let Some(done) = store.incoming.remove(&id) {
            let info = ReceivedFile {
                transfer_id: id.clone(),
                sender_id: done.sender_id,
                name: done.name,
                size: done.total,
            };
            tracing::info!(transfer_id = %id, sender_id = from, size = info.size, "file received");
            store
                .received
                .insert(id.clone(), (info.clone(), Bytes::from(done.data)));
            events.push(ChatEvent::FileReceived(info));
            events.push(progress(&id, FileTransferStatus::Done));
        }
    }
    events
}

/// Sends files to one user or everyone, within the session's file policy.
#[derive(Clone)]
pub struct FileTransferHelper {
    shared: Arc<Shared>,
}

impl FileTransferHelper {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn emit(&self, transfer_id: &str, status: FileTransferStatus) {
        self.shared
            .emit(HuddleEvent::Chat(progress(transfer_id, status)));
    }

    /// Send `data` as `name`. Returns the transfer id; progress is reported
    /// through `ChatEvent::FileTransferProgress`.
    pub fn send(&self, name: &str, data: &[u8], target: Option<u64>) -> Result<String, HuddleError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(HuddleError::InvalidParameter("file name is empty".into()));
        }
        {
            let ctx = self.shared.require_in_session()?;
            let policy = &ctx.policy.file_transfer;
            if !policy.enabled {
                return Err(HuddleError::FileTransfer("file transfer is disabled".into()));
            }
            let extension = Path::new(name)
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase);
            if extension.is_some_and(|ext| policy.blocked_extensions.contains(&ext)) {
                return Err(HuddleError::FileTypeBlocked);
            }
            if data.len() as u64 > policy.max_bytes {
                return Err(HuddleError::FileSizeLimited);
            }
            if let Some(target) = target {
                if !ctx.roster.contains(target) || ctx.my_id() == Some(target) {
                    return Err(HuddleError::InvalidParameter(format!(
                        "user {target} cannot receive files"
                    )));
                }
            }
        }

        let transfer_id = uuid::Uuid::new_v4().to_string();
        let total = data.len() as u64;
        self.emit(&transfer_id, FileTransferStatus::Ready);
        tracing::info!(%transfer_id, file = %name, total, ?target, "sending file");

        let chunk_bytes = self.shared.config.file_chunk_bytes.max(1);
        let mut chunks = data.chunks(chunk_bytes).peekable();
        let mut offset = 0u64;
        if chunks.peek().is_none() {
            self.send_chunk(&transfer_id, name, target, total, 0, &[], true)?;
        }
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            self.send_chunk(&transfer_id, name, target, total, offset, chunk, last)?;
            offset += chunk.len() as u64;
            self.emit(
                &transfer_id,
                FileTransferStatus::Transferring { sent: offset, total },
            );
        }
        self.emit(&transfer_id, FileTransferStatus::Done);
        Ok(transfer_id)
    }

    #[allow(clippy::too_many_arguments)]
    fn send_chunk(
        &self,
        transfer_id: &str,
        name: &str,
        to: Option<u64>,
        total_size: u64,
        offset: u64,
        data: &[u8],
        last: bool,
    ) -> Result<(), HuddleError> {
        let signal = ClientSignal::FileChunk(FileChunk {
            transfer_id: transfer_id.to_string(),
            to,
            name: name.to_string(),
            total_size,
            offset,
            data: STANDARD.encode(data),
            last,
        });
        self.shared.send(signal).inspect_err(|e| {
            self.emit(transfer_id, FileTransferStatus::Failed(e.to_string()));
        })
    }

    /// Collect a completed incoming file. Each file can be taken once.
    pub fn take_received(&self, transfer_id: &str) -> Option<(ReceivedFile, Bytes)> {
        self.shared.ctx().files.received.remove(transfer_id)
    }

    pub fn received_files(&self) -> Vec<ReceivedFile> {
        self.shared
            .ctx()
            .files
            .received
            .values()
            .map(|(info, _)| info.clone())
            .collect()
    }
}
