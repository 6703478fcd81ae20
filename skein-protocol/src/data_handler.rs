//! Data handler: dispatch of inbound bulk streams to awaiting receivers.
//!
//! A receiver registers a one-shot waiter keyed by the pushing peer's id
//! and names the local target path. When the stream arrives, missing
//! parent directories are created, the bytes are written to the target,
//! the file is closed, and the waiter resolves with the resulting
//! [`FileInfo`]. A disk write error resolves the waiter with that failure.
//!
//! Only one inbound stream per peer is tracked. A stream arriving with no
//! waiter registered is drained and dropped silently; the sender's own
//! retry (or timeout) deals with it. A stream that breaks mid-transfer
//! puts the waiter back so the sender's retry can still fulfil it.
//!
//! The upload registry is the serving half: it maps tokens to local files
//! so a download request from a peer can be answered by pushing the file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use skein_core::{EndpointId, MessageId};

use crate::completion::{Completer, WaitHandle, completion};
use crate::error::{ProtocolError, ProtocolResult};
use crate::frames::DataTransfer;

/// Write chunk size for inbound streams.
const RECEIVE_CHUNK_SIZE: usize = 64 * 1024;

/// What an inbound stream produced on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Where the bytes were written.
    pub path: PathBuf,
    /// How many bytes were written.
    pub len: u64,
}

struct PendingReceive {
    target: PathBuf,
    completer: Completer<FileInfo>,
}

type PendingMap = Arc<Mutex<HashMap<EndpointId, PendingReceive>>>;

/// Dispatcher for inbound bulk streams.
pub struct DataHandler {
    pending: PendingMap,
}

impl DataHandler {
    /// Create an empty handler.
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a one-shot waiter for a stream pushed by `from`, to be
    /// written to `target`.
    ///
    /// Dropping the waiter deregisters it.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::DuplicateRegistration`] when a stream from the
    /// same peer is already awaited.
    pub fn forward_data(
        &self,
        from: EndpointId,
        target: impl Into<PathBuf>,
        timeout: Duration,
    ) -> ProtocolResult<DataWaiter> {
        let (completer, handle) = completion();
        {
            let mut pending = self.pending.lock();
            // An entry whose waiter is gone (timed out mid-stream) is
            // stale and may be replaced.
            if let Some(existing) = pending.get(&from)
                && !existing.completer.is_abandoned()
            {
                return Err(ProtocolError::DuplicateRegistration {
                    what: format!("inbound stream from {}", from),
                });
            }
            pending.insert(
                from,
                PendingReceive {
                    target: target.into(),
                    completer,
                },
            );
        }
        Ok(DataWaiter {
            key: from,
            handle: Some(handle),
            timeout,
            pending: self.pending.clone(),
        })
    }

    /// Consume one announced stream from the data plane.
    ///
    /// Returns true when the stream was stored and should be acknowledged.
    /// Returns false when it was dropped (no waiter, or a fault); the
    /// caller must not acknowledge and should drop the connection, since
    /// an unconsumed tail leaves the plane out of framing.
    pub async fn process_stream<R: AsyncRead + Unpin>(
        &self,
        preamble: &DataTransfer,
        reader: &mut R,
    ) -> bool {
        let Some(receive) = self.pending.lock().remove(&preamble.sender) else {
            tracing::debug!(
                sender = %preamble.sender,
                len = preamble.total_len,
                "stream with no registered waiter, dropping"
            );
            return false;
        };

        match write_to_disk(&receive.target, preamble.total_len, reader).await {
            Ok(info) => {
                tracing::debug!(
                    sender = %preamble.sender,
                    path = %info.path.display(),
                    len = info.len,
                    "stored inbound stream"
                );
                receive.completer.fulfil(info);
                true
            }
            Err(StreamFault::Disk(err)) => {
                tracing::warn!(
                    sender = %preamble.sender,
                    error = %err,
                    "disk write failed for inbound stream"
                );
                receive.completer.fail(ProtocolError::Io(err.to_string()));
                false
            }
            Err(StreamFault::Transfer(err)) => {
                // The connection broke mid-stream. Re-register the waiter
                // so the sender's retry can still fulfil it.
                tracing::debug!(
                    sender = %preamble.sender,
                    error = %err,
                    "inbound stream broke, keeping waiter for the retry"
                );
                self.pending.lock().entry(preamble.sender).or_insert(receive);
                false
            }
        }
    }

    /// Cancel the waiter registered for `id`, if any.
    pub fn on_endpoint_signed_off(&self, id: EndpointId) {
        let removed = self.pending.lock().remove(&id);
        if let Some(receive) = removed {
            receive.completer.cancel();
        }
    }

    /// Cancel every registered waiter; the local channel is closing.
    pub fn on_local_channel_closed(&self) {
        let drained: Vec<PendingReceive> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, receive)| receive).collect()
        };
        for receive in drained {
            receive.completer.cancel();
        }
    }

    /// Number of registered waiters.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Default for DataHandler {
    fn default() -> Self {
        Self::new()
    }
}

enum StreamFault {
    /// Creating or writing the target file failed.
    Disk(std::io::Error),
    /// The inbound stream itself broke.
    Transfer(std::io::Error),
}

async fn write_to_disk<R: AsyncRead + Unpin>(
    target: &PathBuf,
    total_len: u64,
    reader: &mut R,
) -> Result<FileInfo, StreamFault> {
    if let Some(parent) = target.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(StreamFault::Disk)?;
    }
    let mut file = tokio::fs::File::create(target)
        .await
        .map_err(StreamFault::Disk)?;

    let mut remaining = total_len;
    let mut buf = vec![0u8; RECEIVE_CHUNK_SIZE];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let read = reader
            .read(&mut buf[..want])
            .await
            .map_err(StreamFault::Transfer)?;
        if read == 0 {
            return Err(StreamFault::Transfer(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended before announced length",
            )));
        }
        file.write_all(&buf[..read])
            .await
            .map_err(StreamFault::Disk)?;
        remaining -= read as u64;
    }
    file.flush().await.map_err(StreamFault::Disk)?;
    drop(file);

    Ok(FileInfo {
        path: target.clone(),
        len: total_len,
    })
}

/// A registered wait for one inbound stream.
///
/// Deregisters itself when dropped.
pub struct DataWaiter {
    key: EndpointId,
    handle: Option<WaitHandle<FileInfo>>,
    timeout: Duration,
    pending: PendingMap,
}

impl DataWaiter {
    /// Wait for the stored file, the configured timeout, or cancellation.
    pub async fn wait(mut self) -> ProtocolResult<FileInfo> {
        match self.handle.take() {
            Some(handle) => handle.wait(self.timeout).await,
            None => Err(ProtocolError::Cancelled),
        }
    }
}

impl Drop for DataWaiter {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.key);
    }
}

/// Registry of local files a peer may request by token.
pub struct UploadRegistry {
    entries: Mutex<HashMap<MessageId, PathBuf>>,
}

impl UploadRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a file for download and return its token.
    pub fn register_upload(&self, path: impl Into<PathBuf>) -> MessageId {
        let token = MessageId::random();
        self.entries.lock().insert(token, path.into());
        token
    }

    /// Remove a registration. Returns false when the token is unknown.
    pub fn deregister_upload(&self, token: MessageId) -> bool {
        self.entries.lock().remove(&token).is_some()
    }

    /// Resolve a token to its registered path.
    pub fn resolve(&self, token: MessageId) -> Option<PathBuf> {
        self.entries.lock().get(&token).cloned()
    }
}

impl Default for UploadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preamble(sender: u128, total_len: u64) -> DataTransfer {
        DataTransfer {
            sender: EndpointId::from_value(sender),
            id: MessageId::from_value(1),
            total_len,
        }
    }

    #[tokio::test]
    async fn stream_is_written_and_waiter_fulfilled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("nested").join("incoming.bin");
        let handler = DataHandler::new();
        let sender = EndpointId::from_value(1);

        let waiter = handler
            .forward_data(sender, &target, Duration::from_secs(1))
            .expect("register");

        let payload = vec![0xCDu8; 2048];
        let mut reader = std::io::Cursor::new(payload.clone());
        let accepted = handler.process_stream(&preamble(1, 2048), &mut reader).await;
        assert!(accepted);

        let info = waiter.wait().await.expect("file info");
        assert_eq!(info.len, 2048);
        assert_eq!(info.path, target);

        let written = tokio::fs::read(&target).await.expect("read back");
        assert_eq!(written, payload);
        assert_eq!(handler.pending_count(), 0);
    }

    #[tokio::test]
    async fn stream_without_waiter_is_dropped() {
        let handler = DataHandler::new();
        let mut reader = std::io::Cursor::new(vec![1u8; 16]);
        let accepted = handler.process_stream(&preamble(1, 16), &mut reader).await;
        assert!(!accepted);
    }

    #[tokio::test]
    async fn second_registration_per_peer_is_rejected() {
        let handler = DataHandler::new();
        let sender = EndpointId::from_value(1);

        let _first = handler
            .forward_data(sender, "a.bin", Duration::from_secs(1))
            .expect("first");
        let second = handler.forward_data(sender, "b.bin", Duration::from_secs(1));
        assert!(matches!(
            second,
            Err(ProtocolError::DuplicateRegistration { .. })
        ));
    }

    #[tokio::test]
    async fn broken_stream_keeps_the_waiter_for_the_retry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("incoming.bin");
        let handler = DataHandler::new();
        let sender = EndpointId::from_value(1);

        let waiter = handler
            .forward_data(sender, &target, Duration::from_secs(1))
            .expect("register");

        // Announce 32 bytes but provide only 8: the stream breaks early.
        let mut truncated = std::io::Cursor::new(vec![7u8; 8]);
        let accepted = handler.process_stream(&preamble(1, 32), &mut truncated).await;
        assert!(!accepted);
        assert_eq!(handler.pending_count(), 1);

        // The retry delivers the full stream and fulfils the waiter.
        let mut full = std::io::Cursor::new(vec![7u8; 32]);
        let accepted = handler.process_stream(&preamble(1, 32), &mut full).await;
        assert!(accepted);

        let info = waiter.wait().await.expect("file info");
        assert_eq!(info.len, 32);
    }

    #[tokio::test]
    async fn sign_off_cancels_the_waiter() {
        let handler = DataHandler::new();
        let sender = EndpointId::from_value(1);

        let waiter = handler
            .forward_data(sender, "x.bin", Duration::from_secs(5))
            .expect("register");
        handler.on_endpoint_signed_off(sender);

        let result = waiter.wait().await;
        assert!(matches!(result, Err(ProtocolError::Cancelled)));
        assert_eq!(handler.pending_count(), 0);
    }

    #[tokio::test]
    async fn dropped_waiter_deregisters() {
        let handler = DataHandler::new();
        let sender = EndpointId::from_value(1);

        let waiter = handler
            .forward_data(sender, "x.bin", Duration::from_secs(5))
            .expect("register");
        drop(waiter);
        assert_eq!(handler.pending_count(), 0);

        // With the waiter gone the stream is dropped silently.
        let mut reader = std::io::Cursor::new(vec![1u8; 4]);
        assert!(!handler.process_stream(&preamble(1, 4), &mut reader).await);
    }

    #[test]
    fn upload_registry_roundtrip() {
        let uploads = UploadRegistry::new();
        let token = uploads.register_upload("/tmp/report.bin");

        assert_eq!(uploads.resolve(token), Some(PathBuf::from("/tmp/report.bin")));
        assert!(uploads.deregister_upload(token));
        assert!(!uploads.deregister_upload(token));
        assert_eq!(uploads.resolve(token), None);
    }
}
