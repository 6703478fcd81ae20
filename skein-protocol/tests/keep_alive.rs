//! Keep-alive eviction: a peer that dies without saying goodbye accrues
//! missed probes until the monitor removes it, while a healthy peer is
//! left alone.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use skein_protocol::{
    ProtocolConfig, ProtocolDescription, ProtocolLayer, TcpChannelTemplate,
};

type TcpLayer = ProtocolLayer<TcpChannelTemplate>;

/// Aggressive probing so eviction happens within a test-sized window.
fn fast_monitor_config() -> ProtocolConfig {
    ProtocolConfig {
        keep_alive_interval: Duration::from_millis(100),
        max_time_between_connection_confirmations: Duration::from_millis(100),
        wait_for_response_timeout: Duration::from_millis(300),
        max_missed_keep_alive_signals: 2,
        connect_timeout: Duration::from_millis(300),
        ..ProtocolConfig::default()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn layer() -> Arc<TcpLayer> {
    init_tracing();
    Arc::new(
        ProtocolLayer::builder(TcpChannelTemplate::new())
            .with_config(fast_monitor_config())
            .with_description(ProtocolDescription::from_subjects(["files"]))
            .build(),
    )
}

async fn connected_pair() -> (Arc<TcpLayer>, Arc<TcpLayer>) {
    let a = layer();
    let b = layer();
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
async fn killed_peer_is_evicted_after_missed_probes() {
    let (a, b) = connected_pair().await;
    let b_id = b.endpoint_id();

    let disconnected = Arc::new(AtomicUsize::new(0));
    let count = disconnected.clone();
    a.on_peer_disconnected(Arc::new(move |_id| {
        count.fetch_add(1, Ordering::SeqCst);
    }));

    // Kill b without a goodbye: hosts and listeners vanish, no
    // disconnect frame is ever sent.
    drop(b);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while tokio::time::Instant::now() < deadline
        && a.registry().can_communicate_with(b_id)
    {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(
        !a.registry().can_communicate_with(b_id),
        "unresponsive peer should have been evicted"
    );
    assert!(!a.registry().has_been_contacted(b_id));

    // Eviction is one removal: the disconnected signal fired exactly once.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(disconnected.load(Ordering::SeqCst), 1);

    a.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn healthy_peer_survives_monitoring() {
    let (a, b) = connected_pair().await;

    let disconnected = Arc::new(AtomicUsize::new(0));
    let count = disconnected.clone();
    a.on_peer_disconnected(Arc::new(move |_id| {
        count.fetch_add(1, Ordering::SeqCst);
    }));

    // Several probe cycles pass; the peer answers every one.
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(a.registry().can_communicate_with(b.endpoint_id()));
    assert!(b.registry().can_communicate_with(a.endpoint_id()));
    assert_eq!(disconnected.load(Ordering::SeqCst), 0);

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn probe_payload_is_echoed_back() {
    let (a, b) = connected_pair().await;

    let reply = a
        .verify_connection(
            b.endpoint_id(),
            Duration::from_secs(2),
            Some("health-check".to_string()),
        )
        .await
        .expect("verification reply");

    match reply.body {
        skein_protocol::FrameBody::ConnectionVerificationResponse { payload } => {
            assert_eq!(payload.as_deref(), Some("health-check"));
        }
        other => panic!("unexpected verification reply: {:?}", other),
    }

    a.close().await;
    b.close().await;
}
