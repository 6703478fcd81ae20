//! Bulk data transfer scenarios: the download round-trip through the
//! upload registry, fault-and-rewind retries for seekable sources, and
//! the fail-fast path for non-seekable sources.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use skein_protocol::hosts::{RestartPolicy, spawn_data_host};
use skein_protocol::{
    ChannelListener, ChannelTemplate, DataHandler, DataSource, DataTransfer, EndpointId,
    JsonCodec, MessageId, NetworkAddress, ProtocolConfig, ProtocolDescription, ProtocolError,
    ProtocolInformation, ProtocolLayer, ProtocolVersion, SendingEndpoint, TcpChannelTemplate,
};

const ONE_MIB: usize = 1024 * 1024;

fn payload_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ---------------------------------------------------------------------------
// Fault-injecting template: the first connection's writes fault after a
// byte budget is spent; later connections are clean.
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct FaultyTemplate {
    inner: TcpChannelTemplate,
    budget: Arc<Mutex<Option<u64>>>,
}

impl FaultyTemplate {
    fn faulting_after(bytes: u64) -> Self {
        Self {
            inner: TcpChannelTemplate::new(),
            budget: Arc::new(Mutex::new(Some(bytes))),
        }
    }
}

#[async_trait]
impl ChannelTemplate for FaultyTemplate {
    type Stream = FaultyStream;
    type Listener = FaultyListener;

    async fn connect(&self, addr: &NetworkAddress) -> io::Result<Self::Stream> {
        let stream = self.inner.connect(addr).await?;
        Ok(FaultyStream {
            inner: stream,
            budget: self.budget.clone(),
        })
    }

    async fn bind(&self, _addr: &NetworkAddress) -> io::Result<Self::Listener> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "bind unused"))
    }
}

// The faulty side only dials out in these tests; accepting is unused.
struct FaultyListener;

#[async_trait]
impl ChannelListener for FaultyListener {
    type Stream = FaultyStream;

    async fn accept(&self) -> io::Result<(Self::Stream, NetworkAddress)> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "accept unused"))
    }

    fn local_addr(&self) -> io::Result<NetworkAddress> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "accept unused"))
    }
}

struct FaultyStream {
    inner: tokio::net::TcpStream,
    budget: Arc<Mutex<Option<u64>>>,
}

impl tokio::io::AsyncRead for FaultyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for FaultyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut budget = this.budget.lock();
        match budget.as_mut() {
            Some(0) => {
                // Budget spent: fault once, then run clean.
                *budget = None;
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "injected fault",
                )))
            }
            Some(remaining) => {
                let allowed = (*remaining).min(buf.len() as u64) as usize;
                match Pin::new(&mut this.inner).poll_write(cx, &buf[..allowed]) {
                    Poll::Ready(Ok(written)) => {
                        *remaining -= written as u64;
                        Poll::Ready(Ok(written))
                    }
                    other => other,
                }
            }
            None => Pin::new(&mut this.inner).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

// ---------------------------------------------------------------------------
// Receiving side shared by the push tests.
// ---------------------------------------------------------------------------

struct Receiver {
    data_handler: Arc<DataHandler>,
    peer_info: ProtocolInformation,
    _host: skein_protocol::HostHandle,
}

async fn receiver() -> Receiver {
    let template = TcpChannelTemplate::new();
    let loopback = NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let listener = template.bind(&loopback).await.expect("bind data listener");
    let data_handler = Arc::new(DataHandler::new());
    let host = spawn_data_host(
        listener,
        JsonCodec,
        data_handler.clone(),
        RestartPolicy {
            max_restarts: 5,
            window: Duration::from_secs(10),
        },
    )
    .expect("spawn data host");

    let peer_info = ProtocolInformation::new(
        ProtocolVersion::new(1, 0),
        // No message host in these tests; the data address is what counts.
        NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1),
        host.local_addr(),
    );
    Receiver {
        data_handler,
        peer_info,
        _host: host,
    }
}

fn pool<T: ChannelTemplate>(template: T) -> SendingEndpoint<T, JsonCodec> {
    SendingEndpoint::new(
        template,
        JsonCodec,
        Duration::from_millis(500),
        Duration::from_secs(2),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn seekable_stream_survives_a_mid_send_fault() {
    let receiver = receiver().await;
    let sender_id = EndpointId::from_value(1);
    let dir = tempfile::tempdir().expect("tempdir");

    let payload = payload_pattern(ONE_MIB);
    let source_path = dir.path().join("outgoing.bin");
    tokio::fs::write(&source_path, &payload).await.expect("write source");

    let target = dir.path().join("incoming.bin");
    let waiter = receiver
        .data_handler
        .forward_data(sender_id, &target, Duration::from_secs(10))
        .expect("register waiter");

    // The first connection faults after 100 KiB.
    let pool = pool(FaultyTemplate::faulting_after(100 * 1024));
    let mut source = DataSource::file(&source_path).await.expect("open source");
    let preamble = DataTransfer {
        sender: sender_id,
        id: MessageId::from_value(7),
        total_len: source.len(),
    };
    pool.send_stream(&receiver.peer_info, preamble, &mut source, 3)
        .await
        .expect("retry should recover");

    let info = waiter.wait().await.expect("file info");
    assert_eq!(info.len, ONE_MIB as u64);

    // Exactly one complete file arrives.
    let written = tokio::fs::read(&target).await.expect("read back");
    assert_eq!(written.len(), payload.len());
    assert_eq!(written, payload);
}

#[tokio::test(flavor = "multi_thread")]
async fn single_attempt_fault_surfaces_send_failed() {
    let receiver = receiver().await;
    let sender_id = EndpointId::from_value(1);
    let dir = tempfile::tempdir().expect("tempdir");

    let payload = payload_pattern(ONE_MIB);
    let source_path = dir.path().join("outgoing.bin");
    tokio::fs::write(&source_path, &payload).await.expect("write source");

    let _waiter = receiver
        .data_handler
        .forward_data(sender_id, dir.path().join("incoming.bin"), Duration::from_secs(5))
        .expect("register waiter");

    let pool = pool(FaultyTemplate::faulting_after(100 * 1024));
    let mut source = DataSource::file(&source_path).await.expect("open source");
    let preamble = DataTransfer {
        sender: sender_id,
        id: MessageId::from_value(7),
        total_len: source.len(),
    };
    let result = pool
        .send_stream(&receiver.peer_info, preamble, &mut source, 1)
        .await;

    assert!(matches!(
        result,
        Err(ProtocolError::SendFailed { attempts: 1, .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn non_seekable_source_fails_without_further_retries() {
    let receiver = receiver().await;
    let sender_id = EndpointId::from_value(1);

    let payload = payload_pattern(ONE_MIB);
    let _waiter = receiver
        .data_handler
        .forward_data(
            sender_id,
            std::env::temp_dir().join("skein-non-seekable.bin"),
            Duration::from_secs(5),
        )
        .expect("register waiter");

    let pool = pool(FaultyTemplate::faulting_after(100 * 1024));
    let mut source = DataSource::reader(io::Cursor::new(payload), ONE_MIB as u64);
    let preamble = DataTransfer {
        sender: sender_id,
        id: MessageId::from_value(7),
        total_len: ONE_MIB as u64,
    };
    let result = pool
        .send_stream(&receiver.peer_info, preamble, &mut source, 3)
        .await;

    // The partially drained source cannot rewind: one attempt, no more.
    assert!(matches!(
        result,
        Err(ProtocolError::SendFailed { attempts: 1, .. })
    ));
}

// ---------------------------------------------------------------------------
// Full download round-trip through two layers.
// ---------------------------------------------------------------------------

type TcpLayer = ProtocolLayer<TcpChannelTemplate>;

async fn connected_pair() -> (Arc<TcpLayer>, Arc<TcpLayer>) {
    let build = || {
        Arc::new(
            ProtocolLayer::builder(TcpChannelTemplate::new())
                .with_config(ProtocolConfig::local_network())
                .with_description(ProtocolDescription::from_subjects(["files"]))
                .build(),
        )
    };
    let a = build();
    let b = build();
    a.open().await.expect("open a");
    b.open().await.expect("open b");
    a.contact(b.local_endpoint_information().expect("b info"))
        .expect("contact");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if a.registry().can_communicate_with(b.endpoint_id())
            && b.registry().can_communicate_with(a.endpoint_id())
        {
            return (a, b);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pair did not reach approval");
}

#[tokio::test(flavor = "multi_thread")]
async fn download_round_trip_through_the_upload_registry() {
    let (a, b) = connected_pair().await;
    let dir = tempfile::tempdir().expect("tempdir");

    let payload = payload_pattern(256 * 1024);
    let served = dir.path().join("served.bin");
    tokio::fs::write(&served, &payload).await.expect("write served");
    let token = b.register_upload(&served);

    let target = dir.path().join("fetched.bin");
    let info = a
        .transfer_data(
            b.endpoint_id(),
            token,
            &target,
            CancellationToken::new(),
            2,
            Duration::from_secs(10),
        )
        .await
        .expect("download");

    assert_eq!(info.len, payload.len() as u64);
    let fetched = tokio::fs::read(&target).await.expect("read back");
    assert_eq!(fetched, payload);

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn download_with_unknown_token_times_out() {
    let (a, b) = connected_pair().await;
    let dir = tempfile::tempdir().expect("tempdir");

    let result = a
        .transfer_data(
            b.endpoint_id(),
            MessageId::from_value(404),
            dir.path().join("never.bin"),
            CancellationToken::new(),
            1,
            Duration::from_millis(500),
        )
        .await;

    assert!(matches!(result, Err(ProtocolError::Timeout)));

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_resolves_the_transfer_future() {
    let (a, b) = connected_pair().await;
    let dir = tempfile::tempdir().expect("tempdir");

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel_clone.cancel();
    });

    let result = a
        .transfer_data(
            b.endpoint_id(),
            MessageId::from_value(404),
            dir.path().join("never.bin"),
            cancel,
            1,
            Duration::from_secs(30),
        )
        .await;

    assert!(matches!(result, Err(ProtocolError::Cancelled)));

    a.close().await;
    b.close().await;
}
