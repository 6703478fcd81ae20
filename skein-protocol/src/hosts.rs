//! Receiver hosts: the inbound side of one connection point.
//!
//! A host owns one listener and an accept loop. Every accepted stream gets
//! its own read task which parses wire containers incrementally and hands
//! the content up: decoded frames on the message plane, announced streams
//! on the data plane. A wire fault tears down the single connection, never
//! the host; accept faults count against a restart window and stop the
//! host for good once the budget is spent.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use skein_core::{ChannelListener, MessageCodec, NetworkAddress};

use crate::data_handler::DataHandler;
use crate::frames::{DataAck, DataTransfer, Frame};
use crate::wire;

/// Read buffer chunk size for connection tasks.
const READ_CHUNK_SIZE: usize = 4096;

/// Callback invoked with every decoded message-plane frame.
pub type FrameSink = Arc<dyn Fn(Frame) + Send + Sync>;

/// Limits on how often a host may fault before it stops.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    /// Faults tolerated inside the window.
    pub max_restarts: u32,
    /// Window over which faults are counted.
    pub window: std::time::Duration,
}

/// A running receiver host; aborting the task on drop releases the
/// listener.
pub struct HostHandle {
    local: NetworkAddress,
    task: JoinHandle<()>,
}

impl HostHandle {
    /// The address this host is bound to.
    pub fn local_addr(&self) -> NetworkAddress {
        self.local
    }

    /// Stop the host, releasing the listener.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for HostHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn the message-plane host for one bound listener.
pub fn spawn_message_host<L, C>(
    listener: L,
    codec: C,
    on_frame: FrameSink,
    policy: RestartPolicy,
) -> std::io::Result<HostHandle>
where
    L: ChannelListener,
    C: MessageCodec,
{
    let local = listener.local_addr()?;
    let task = tokio::spawn(async move {
        run_message_host(listener, codec, on_frame, policy).await;
    });
    Ok(HostHandle { local, task })
}

/// Spawn the data-plane host for one bound listener.
pub fn spawn_data_host<L, C>(
    listener: L,
    codec: C,
    data_handler: Arc<DataHandler>,
    policy: RestartPolicy,
) -> std::io::Result<HostHandle>
where
    L: ChannelListener,
    C: MessageCodec,
{
    let local = listener.local_addr()?;
    let task = tokio::spawn(async move {
        run_data_host(listener, codec, data_handler, policy).await;
    });
    Ok(HostHandle { local, task })
}

/// Tracks accept faults against the restart window.
struct RestartWindow {
    policy: RestartPolicy,
    faults: Vec<tokio::time::Instant>,
}

impl RestartWindow {
    fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            faults: Vec::new(),
        }
    }

    /// Record a fault; returns the count inside the window when the budget
    /// is spent and the host must stop.
    fn record_fault(&mut self) -> Option<u32> {
        let now = tokio::time::Instant::now();
        self.faults.push(now);
        self.faults
            .retain(|at| now.duration_since(*at) <= self.policy.window);
        let count = self.faults.len() as u32;
        (count > self.policy.max_restarts).then_some(count)
    }
}

async fn run_message_host<L, C>(listener: L, codec: C, on_frame: FrameSink, policy: RestartPolicy)
where
    L: ChannelListener,
    C: MessageCodec,
{
    let mut window = RestartWindow::new(policy);
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                tracing::debug!(%remote, "message host accepted connection");
                let codec = codec.clone();
                let on_frame = on_frame.clone();
                tokio::spawn(async move {
                    run_message_connection(stream, remote, codec, on_frame).await;
                });
            }
            Err(err) => {
                tracing::warn!(error = %err, "message host accept faulted");
                if let Some(restarts) = window.record_fault() {
                    let fatal = crate::error::ProtocolError::MaxRestarts { restarts };
                    tracing::error!(error = %fatal, "message host stopping");
                    return;
                }
                // Brief pause so a persistently failing listener does not
                // spin the accept loop.
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}

async fn run_message_connection<S, C>(
    mut stream: S,
    remote: NetworkAddress,
    codec: C,
    on_frame: FrameSink,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    C: MessageCodec,
{
    let mut buffer: Vec<u8> = Vec::with_capacity(READ_CHUNK_SIZE);
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let read = match stream.read(&mut chunk).await {
            Ok(0) => {
                tracing::debug!(%remote, "message connection closed by peer");
                return;
            }
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(%remote, error = %err, "message connection read faulted");
                return;
            }
        };
        buffer.extend_from_slice(&chunk[..read]);

        loop {
            match wire::try_decode_container(&buffer) {
                Ok(Some((payload, consumed))) => {
                    buffer.drain(..consumed);
                    match Frame::decode(&codec, &payload) {
                        Ok(frame) => on_frame(frame),
                        Err(err) => {
                            tracing::warn!(
                                %remote,
                                error = %err,
                                "undecodable frame, tearing down connection"
                            );
                            return;
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(
                        %remote,
                        error = %err,
                        "wire fault, tearing down connection"
                    );
                    return;
                }
            }
        }
    }
}

async fn run_data_host<L, C>(
    listener: L,
    codec: C,
    data_handler: Arc<DataHandler>,
    policy: RestartPolicy,
) where
    L: ChannelListener,
    C: MessageCodec,
{
    let mut window = RestartWindow::new(policy);
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                tracing::debug!(%remote, "data host accepted connection");
                let codec = codec.clone();
                let data_handler = data_handler.clone();
                tokio::spawn(async move {
                    run_data_connection(stream, remote, codec, data_handler).await;
                });
            }
            Err(err) => {
                tracing::warn!(error = %err, "data host accept faulted");
                if let Some(restarts) = window.record_fault() {
                    let fatal = crate::error::ProtocolError::MaxRestarts { restarts };
                    tracing::error!(error = %fatal, "data host stopping");
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}

async fn run_data_connection<S, C>(
    mut stream: S,
    remote: NetworkAddress,
    codec: C,
    data_handler: Arc<DataHandler>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    C: MessageCodec,
{
    let mut buffer: Vec<u8> = Vec::with_capacity(READ_CHUNK_SIZE);
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        // Accumulate until one preamble container is complete.
        let preamble: DataTransfer = loop {
            match wire::try_decode_container(&buffer) {
                Ok(Some((payload, consumed))) => {
                    buffer.drain(..consumed);
                    match codec.decode(&payload) {
                        Ok(preamble) => break preamble,
                        Err(err) => {
                            tracing::warn!(
                                %remote,
                                error = %err,
                                "undecodable data preamble, tearing down connection"
                            );
                            return;
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(%remote, error = %err, "wire fault on data plane");
                    return;
                }
            }
            match stream.read(&mut chunk).await {
                Ok(0) => return,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(err) => {
                    tracing::debug!(%remote, error = %err, "data connection read faulted");
                    return;
                }
            }
        };

        // The raw bytes follow: what is already buffered, then the stream.
        let mut body = BufferedReader {
            buffered: std::mem::take(&mut buffer),
            offset: 0,
            inner: &mut stream,
        };
        let accepted = data_handler.process_stream(&preamble, &mut body).await;
        let leftover = body.into_leftover();
        buffer = leftover;

        if !accepted {
            // Unconsumed bytes may remain in flight; framing is gone.
            return;
        }

        let ack = DataAck {
            id: preamble.id,
            received: preamble.total_len,
        };
        let Ok(ack_payload) = codec.encode(&ack) else {
            return;
        };
        let Ok(ack_container) = wire::encode_container(&ack_payload) else {
            return;
        };
        if let Err(err) = stream.write_all(&ack_container).await {
            tracing::debug!(%remote, error = %err, "failed to acknowledge stream");
            return;
        }
        if stream.flush().await.is_err() {
            return;
        }
    }
}

/// Reader that serves already-buffered bytes before the live stream.
struct BufferedReader<'a, S> {
    buffered: Vec<u8>,
    offset: usize,
    inner: &'a mut S,
}

impl<'a, S> BufferedReader<'a, S> {
    /// Bytes that were buffered but never consumed.
    fn into_leftover(self) -> Vec<u8> {
        if self.offset >= self.buffered.len() {
            Vec::new()
        } else {
            self.buffered[self.offset..].to_vec()
        }
    }
}

impl<'a, S: tokio::io::AsyncRead + Unpin> tokio::io::AsyncRead for BufferedReader<'a, S> {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.buffered.len() {
            let available = &this.buffered[this.offset..];
            let take = available.len().min(buf.remaining());
            buf.put_slice(&available[..take]);
            this.offset += take;
            return std::task::Poll::Ready(Ok(()));
        }
        std::pin::Pin::new(&mut *this.inner).poll_read(cx, buf)
    }
}
