//! Restoring channels: fault-surviving senders for one remote address.
//!
//! A restoring channel wraps one transport stream. On first use, and
//! whenever a prior send left the stream faulted, a fresh stream is created
//! under the channel's creation lock. Sends are attempted up to the given
//! number of total attempts; every failed attempt tears the stream down so
//! the next one re-establishes it.
//!
//! The data-plane variant streams a preamble container, the announced raw
//! bytes, and then waits for the receiver's acknowledgement container. A
//! seekable source is rewound to its starting position before each retry;
//! a non-seekable source that faulted after bytes were consumed cannot be
//! retried and the send fails immediately.

use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use skein_core::{ChannelTemplate, MessageCodec, NetworkAddress};

use crate::error::{ProtocolError, ProtocolResult};
use crate::frames::{DataAck, DataTransfer, Frame};
use crate::wire;

/// Read chunk size for streaming bulk data.
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Fault-surviving sender for message frames to one remote address.
pub struct RestoringMessageChannel<T: ChannelTemplate, C: MessageCodec> {
    template: T,
    codec: C,
    remote: NetworkAddress,
    connect_timeout: Duration,
    /// Creation lock and stream owner. Holding this across the write also
    /// keeps concurrent frames from interleaving on the wire.
    stream: Mutex<Option<T::Stream>>,
}

impl<T: ChannelTemplate, C: MessageCodec> RestoringMessageChannel<T, C> {
    /// Create a channel for one remote message address. No stream is
    /// created until the first send.
    pub fn new(template: T, codec: C, remote: NetworkAddress, connect_timeout: Duration) -> Self {
        Self {
            template,
            codec,
            remote,
            connect_timeout,
            stream: Mutex::new(None),
        }
    }

    /// The remote address this channel sends to.
    pub fn remote(&self) -> NetworkAddress {
        self.remote
    }

    /// Whether a stream is currently established.
    pub async fn is_open(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Send one frame with at most `retries` total attempts.
    ///
    /// `retries = 0` never touches the transport. Each failed attempt
    /// tears the stream down; the next attempt re-establishes it.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::SendFailed`] once the attempt budget is exhausted.
    pub async fn send(&self, frame: &Frame, retries: u32) -> ProtocolResult<()> {
        let bytes = frame.encode(&self.codec)?;

        let mut guard = self.stream.lock().await;
        for attempt in 1..=retries {
            if guard.is_none() {
                match self.establish().await {
                    Ok(stream) => *guard = Some(stream),
                    Err(err) => {
                        tracing::debug!(
                            remote = %self.remote,
                            attempt,
                            error = %err,
                            "message channel connect failed"
                        );
                        continue;
                    }
                }
            }

            let Some(stream) = guard.as_mut() else {
                continue;
            };
            match write_fully(stream, &bytes).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::debug!(
                        remote = %self.remote,
                        attempt,
                        error = %err,
                        "message send faulted, dropping stream"
                    );
                    *guard = None;
                }
            }
        }

        Err(ProtocolError::SendFailed {
            addr: self.remote,
            attempts: retries,
        })
    }

    /// Drop the stream, shutting it down best-effort.
    pub async fn close(&self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.shutdown().await;
        }
    }

    async fn establish(&self) -> std::io::Result<T::Stream> {
        match tokio::time::timeout(self.connect_timeout, self.template.connect(&self.remote)).await
        {
            Ok(result) => result,
            Err(_elapsed) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            )),
        }
    }
}

async fn write_fully<S: tokio::io::AsyncWrite + Unpin>(
    stream: &mut S,
    bytes: &[u8],
) -> std::io::Result<()> {
    stream.write_all(bytes).await?;
    stream.flush().await
}

/// Fault-surviving sender for bulk streams to one remote data address.
pub struct RestoringDataChannel<T: ChannelTemplate, C: MessageCodec> {
    template: T,
    codec: C,
    remote: NetworkAddress,
    connect_timeout: Duration,
    ack_timeout: Duration,
    stream: Mutex<Option<T::Stream>>,
}

impl<T: ChannelTemplate, C: MessageCodec> RestoringDataChannel<T, C> {
    /// Create a channel for one remote data address.
    pub fn new(
        template: T,
        codec: C,
        remote: NetworkAddress,
        connect_timeout: Duration,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            template,
            codec,
            remote,
            connect_timeout,
            ack_timeout,
            stream: Mutex::new(None),
        }
    }

    /// The remote address this channel sends to.
    pub fn remote(&self) -> NetworkAddress {
        self.remote
    }

    /// Whether a stream is currently established.
    pub async fn is_open(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Push one bulk stream with at most `retries` total attempts.
    ///
    /// The send succeeds only when every byte was written and the remote
    /// acknowledged receipt of the full length. On a fault, a seekable
    /// source is rewound and retried; a non-seekable source that was
    /// already partially consumed fails immediately.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::SendFailed`] once the attempt budget is exhausted
    /// or a partially consumed source cannot be rewound.
    pub async fn send_stream(
        &self,
        preamble: DataTransfer,
        source: &mut DataSource,
        retries: u32,
    ) -> ProtocolResult<()> {
        let preamble_bytes = wire::encode_container(&self.codec.encode(&preamble)?)?;

        let mut guard = self.stream.lock().await;
        let mut attempts_made = 0u32;
        for attempt in 1..=retries {
            if attempt > 1 && source.consumed() > 0 {
                if source.is_seekable() {
                    source.rewind().await?;
                } else {
                    // A partially drained source cannot be replayed.
                    tracing::debug!(
                        remote = %self.remote,
                        "non-seekable source faulted mid-send, giving up"
                    );
                    break;
                }
            }
            attempts_made = attempt;

            if guard.is_none() {
                match self.establish().await {
                    Ok(stream) => *guard = Some(stream),
                    Err(err) => {
                        tracing::debug!(
                            remote = %self.remote,
                            attempt,
                            error = %err,
                            "data channel connect failed"
                        );
                        continue;
                    }
                }
            }

            let Some(stream) = guard.as_mut() else {
                continue;
            };
            match self
                .push_once(stream, &preamble_bytes, preamble, source)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::debug!(
                        remote = %self.remote,
                        attempt,
                        error = %err,
                        "data send faulted, dropping stream"
                    );
                    *guard = None;
                }
            }
        }

        Err(ProtocolError::SendFailed {
            addr: self.remote,
            attempts: attempts_made,
        })
    }

    /// Drop the stream, shutting it down best-effort.
    pub async fn close(&self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.shutdown().await;
        }
    }

    async fn establish(&self) -> std::io::Result<T::Stream> {
        match tokio::time::timeout(self.connect_timeout, self.template.connect(&self.remote)).await
        {
            Ok(result) => result,
            Err(_elapsed) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            )),
        }
    }

    /// One complete attempt: preamble, raw bytes, acknowledgement.
    async fn push_once(
        &self,
        stream: &mut T::Stream,
        preamble_bytes: &[u8],
        preamble: DataTransfer,
        source: &mut DataSource,
    ) -> std::io::Result<()> {
        stream.write_all(preamble_bytes).await?;

        let mut remaining = preamble.total_len;
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let read = source.read_chunk(&mut buf[..want]).await?;
            if read == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "source ended before announced length",
                ));
            }
            stream.write_all(&buf[..read]).await?;
            remaining -= read as u64;
        }
        stream.flush().await?;

        let ack = self.read_ack(stream).await?;
        if ack.id != preamble.id || ack.received != preamble.total_len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "receiver acknowledged a different transfer",
            ));
        }
        Ok(())
    }

    async fn read_ack(&self, stream: &mut T::Stream) -> std::io::Result<DataAck> {
        let deadline = tokio::time::Instant::now() + self.ack_timeout;
        let mut buffer = Vec::with_capacity(64);
        let mut chunk = [0u8; 256];
        loop {
            if let Some((payload, _consumed)) =
                wire::try_decode_container(&buffer).map_err(into_io_error)?
            {
                return self.codec.decode(&payload).map_err(into_io_error);
            }
            let read = tokio::time::timeout_at(deadline, stream.read(&mut chunk))
                .await
                .map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "acknowledgement timed out")
                })??;
            if read == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed before acknowledgement",
                ));
            }
            buffer.extend_from_slice(&chunk[..read]);
        }
    }
}

fn into_io_error<E: std::error::Error + Send + Sync + 'static>(err: E) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, err)
}

/// A bulk payload being pushed to a peer.
///
/// File-backed sources are seekable and can be replayed after a transport
/// fault; arbitrary readers are not and fail fast instead.
pub struct DataSource {
    kind: SourceKind,
    origin: u64,
    consumed: u64,
    len: u64,
}

enum SourceKind {
    File(tokio::fs::File),
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl DataSource {
    /// Open a file as a seekable source covering its full length.
    ///
    /// # Errors
    ///
    /// Propagates the underlying open/metadata failures.
    pub async fn file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        Ok(Self {
            kind: SourceKind::File(file),
            origin: 0,
            consumed: 0,
            len,
        })
    }

    /// Wrap an arbitrary reader as a non-seekable source of `len` bytes.
    pub fn reader(reader: impl AsyncRead + Send + Unpin + 'static, len: u64) -> Self {
        Self {
            kind: SourceKind::Reader(Box::new(reader)),
            origin: 0,
            consumed: 0,
            len,
        }
    }

    /// Total number of bytes this source provides.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the source provides no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the source can be rewound after a fault.
    pub fn is_seekable(&self) -> bool {
        matches!(self.kind, SourceKind::File(_))
    }

    /// Bytes consumed since the recorded start position.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub(crate) async fn rewind(&mut self) -> std::io::Result<()> {
        match &mut self.kind {
            SourceKind::File(file) => {
                file.seek(SeekFrom::Start(self.origin)).await?;
                self.consumed = 0;
                Ok(())
            }
            SourceKind::Reader(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "source is not seekable",
            )),
        }
    }

    pub(crate) async fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let read = match &mut self.kind {
            SourceKind::File(file) => file.read(buf).await?,
            SourceKind::Reader(reader) => reader.read(buf).await?,
        };
        self.consumed += read as u64;
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::{ChannelListener, EndpointId, JsonCodec, MessageId, TcpChannelTemplate};
    use std::io;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::frames::FrameBody;

    /// Template that counts connect calls and always refuses.
    #[derive(Clone)]
    struct RefusingTemplate {
        connects: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl ChannelTemplate for RefusingTemplate {
        type Stream = tokio::net::TcpStream;
        type Listener = skein_core::TcpListener;

        async fn connect(&self, _addr: &NetworkAddress) -> io::Result<Self::Stream> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        }

        async fn bind(&self, _addr: &NetworkAddress) -> io::Result<Self::Listener> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "bind unused"))
        }
    }

    fn loopback(port: u16) -> NetworkAddress {
        NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[tokio::test]
    async fn zero_retries_never_touches_the_transport() {
        let connects = Arc::new(AtomicUsize::new(0));
        let template = RefusingTemplate {
            connects: connects.clone(),
        };
        let channel = RestoringMessageChannel::new(
            template,
            JsonCodec,
            loopback(9),
            Duration::from_millis(100),
        );

        let frame = Frame::new(EndpointId::from_value(1), FrameBody::Success);
        let result = channel.send(&frame, 0).await;

        assert!(matches!(
            result,
            Err(ProtocolError::SendFailed { attempts: 0, .. })
        ));
        assert_eq!(connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retry_budget_bounds_connect_attempts() {
        let connects = Arc::new(AtomicUsize::new(0));
        let template = RefusingTemplate {
            connects: connects.clone(),
        };
        let channel = RestoringMessageChannel::new(
            template,
            JsonCodec,
            loopback(9),
            Duration::from_millis(100),
        );

        let frame = Frame::new(EndpointId::from_value(1), FrameBody::Success);
        let result = channel.send(&frame, 3).await;

        assert!(matches!(
            result,
            Err(ProtocolError::SendFailed { attempts: 3, .. })
        ));
        assert_eq!(connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn message_send_reaches_a_listener() {
        let template = TcpChannelTemplate::new();
        let listener = template.bind(&loopback(0)).await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let server = tokio::spawn(async move {
            let (mut stream, _peer) = listener.accept().await.expect("accept");
            let mut buffer = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let read = tokio::io::AsyncReadExt::read(&mut stream, &mut chunk)
                    .await
                    .expect("read");
                if read == 0 {
                    break;
                }
                buffer.extend_from_slice(&chunk[..read]);
                if let Some((payload, _)) =
                    wire::try_decode_container(&buffer).expect("container")
                {
                    return Frame::decode(&JsonCodec, &payload).expect("frame");
                }
            }
            panic!("connection closed before a full frame arrived");
        });

        let channel =
            RestoringMessageChannel::new(template, JsonCodec, addr, Duration::from_secs(1));
        let frame = Frame::new(EndpointId::from_value(7), FrameBody::Success);
        channel.send(&frame, 1).await.expect("send");
        assert!(channel.is_open().await);

        let received = server.await.expect("server task");
        assert_eq!(received, frame);

        channel.close().await;
        assert!(!channel.is_open().await);
    }

    #[tokio::test]
    async fn non_seekable_source_cannot_rewind() {
        let data = b"0123456789".to_vec();
        let mut source = DataSource::reader(std::io::Cursor::new(data), 10);
        assert!(!source.is_seekable());

        let mut buf = [0u8; 4];
        let read = source.read_chunk(&mut buf).await.expect("read");
        assert_eq!(read, 4);
        assert_eq!(source.consumed(), 4);

        assert!(source.rewind().await.is_err());
    }

    #[tokio::test]
    async fn file_source_rewinds_to_origin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("payload.bin");
        tokio::fs::write(&path, b"abcdef").await.expect("write");

        let mut source = DataSource::file(&path).await.expect("open");
        assert!(source.is_seekable());
        assert_eq!(source.len(), 6);

        let mut buf = [0u8; 3];
        source.read_chunk(&mut buf).await.expect("read");
        assert_eq!(&buf, b"abc");

        source.rewind().await.expect("rewind");
        assert_eq!(source.consumed(), 0);
        source.read_chunk(&mut buf).await.expect("read");
        assert_eq!(&buf, b"abc");
    }

    #[tokio::test]
    async fn data_send_zero_retries_fails_without_transport() {
        let connects = Arc::new(AtomicUsize::new(0));
        let template = RefusingTemplate {
            connects: connects.clone(),
        };
        let channel = RestoringDataChannel::new(
            template,
            JsonCodec,
            loopback(9),
            Duration::from_millis(100),
            Duration::from_millis(100),
        );

        let mut source = DataSource::reader(std::io::Cursor::new(vec![0u8; 8]), 8);
        let preamble = DataTransfer {
            sender: EndpointId::from_value(1),
            id: MessageId::from_value(2),
            total_len: 8,
        };
        let result = channel.send_stream(preamble, &mut source, 0).await;

        assert!(matches!(
            result,
            Err(ProtocolError::SendFailed { attempts: 0, .. })
        ));
        assert_eq!(connects.load(Ordering::SeqCst), 0);
    }
}
