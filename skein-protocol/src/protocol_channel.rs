//! Protocol channel: per-version receiver hosts and sender pools for one
//! transport template.
//!
//! `open()` stands up a message host, a data host and a sender pool for
//! every supported protocol version and records the locally chosen
//! connection points. `close()` sends a best-effort farewell to every
//! approved peer, then tears the hosts and senders down and clears the
//! connection points.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use skein_core::{
    ChannelTemplate, EndpointId, MessageCodec, MessageId, NetworkAddress, ProtocolInformation,
    ProtocolVersion,
};

use crate::channel::DataSource;
use crate::config::ProtocolConfig;
use crate::data_handler::DataHandler;
use crate::error::{ProtocolError, ProtocolResult};
use crate::frames::{DataTransfer, Frame, FrameBody};
use crate::hosts::{FrameSink, HostHandle, RestartPolicy, spawn_data_host, spawn_message_host};
use crate::registry::EndpointRegistry;
use crate::sending::SendingEndpoint;

/// Farewell sends are fire-and-forget: one attempt, failures ignored.
const FAREWELL_ATTEMPTS: u32 = 1;

struct VersionSlot<T: ChannelTemplate, C: MessageCodec> {
    info: ProtocolInformation,
    senders: Arc<SendingEndpoint<T, C>>,
    message_host: HostHandle,
    data_host: HostHandle,
}

/// Owner of everything version-specific for one transport template.
pub struct ProtocolChannel<T: ChannelTemplate, C: MessageCodec> {
    template: T,
    codec: C,
    local_id: EndpointId,
    supported: Vec<ProtocolVersion>,
    config: ProtocolConfig,
    slots: Mutex<HashMap<ProtocolVersion, VersionSlot<T, C>>>,
}

impl<T: ChannelTemplate, C: MessageCodec> ProtocolChannel<T, C> {
    /// Create a closed channel for the given versions.
    pub fn new(
        template: T,
        codec: C,
        local_id: EndpointId,
        mut supported: Vec<ProtocolVersion>,
        config: ProtocolConfig,
    ) -> Self {
        supported.sort();
        supported.dedup();
        Self {
            template,
            codec,
            local_id,
            supported,
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// The versions this channel can host.
    pub fn supported_versions(&self) -> Vec<ProtocolVersion> {
        self.supported.clone()
    }

    /// Whether `open()` has stood the hosts up.
    pub fn is_open(&self) -> bool {
        !self.slots.lock().is_empty()
    }

    /// Bind and start the hosts for every supported version.
    ///
    /// Decoded message frames are handed to `on_frame`; announced data
    /// streams go to `data_handler`. The pinned `tcp_port` (when
    /// configured) applies to the first version's message host; everything
    /// else is auto-assigned.
    ///
    /// # Errors
    ///
    /// Fails when a listener cannot be bound, or with
    /// [`ProtocolError::DuplicateRegistration`] when already open.
    pub async fn open(
        &self,
        on_frame: FrameSink,
        data_handler: Arc<DataHandler>,
    ) -> ProtocolResult<()> {
        if self.is_open() {
            return Err(ProtocolError::DuplicateRegistration {
                what: "protocol channel is already open".to_string(),
            });
        }

        let policy = RestartPolicy {
            max_restarts: self.config.max_host_restarts,
            window: self.config.host_restart_window,
        };
        let base = self.config.tcp_base_address;

        let mut opened = Vec::with_capacity(self.supported.len());
        for (index, version) in self.supported.iter().enumerate() {
            let message_port = if index == 0 {
                self.config.tcp_port.unwrap_or(0)
            } else {
                0
            };

            let message_listener = self
                .template
                .bind(&NetworkAddress::new(base, message_port))
                .await?;
            let data_listener = self.template.bind(&NetworkAddress::new(base, 0)).await?;

            let message_host = spawn_message_host(
                message_listener,
                self.codec.clone(),
                on_frame.clone(),
                policy,
            )?;
            let data_host = spawn_data_host(
                data_listener,
                self.codec.clone(),
                data_handler.clone(),
                policy,
            )?;

            let info = ProtocolInformation::new(
                *version,
                message_host.local_addr(),
                data_host.local_addr(),
            );
            tracing::debug!(
                version = %version,
                message = %info.message_address,
                data = %info.data_address,
                "protocol channel hosting version"
            );

            opened.push(VersionSlot {
                info,
                senders: Arc::new(SendingEndpoint::new(
                    self.template.clone(),
                    self.codec.clone(),
                    self.config.connect_timeout,
                    self.config.wait_for_response_timeout,
                )),
                message_host,
                data_host,
            });
        }

        let mut slots = self.slots.lock();
        for slot in opened {
            slots.insert(slot.info.version, slot);
        }
        Ok(())
    }

    /// Send a farewell to every approved peer, then tear everything down
    /// and clear the local connection points.
    pub async fn close(&self, registry: &EndpointRegistry) {
        // Best-effort goodbyes first: one attempt each, failures ignored.
        for peer in registry.approved_endpoints() {
            let farewell = Frame::new(self.local_id, FrameBody::EndpointDisconnect);
            if let Err(err) = self
                .send(&peer.protocol, &farewell, FAREWELL_ATTEMPTS)
                .await
            {
                tracing::debug!(peer = %peer.id, error = %err, "farewell not delivered");
            }
        }

        let drained: Vec<VersionSlot<T, C>> = {
            let mut slots = self.slots.lock();
            slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in drained {
            slot.message_host.shutdown();
            slot.data_host.shutdown();
            slot.senders.close_all().await;
        }
    }

    /// The local connection points, one per supported version.
    pub fn local_connection_points(&self) -> Vec<ProtocolInformation> {
        let mut points: Vec<ProtocolInformation> = self
            .slots
            .lock()
            .values()
            .map(|slot| slot.info.clone())
            .collect();
        points.sort_by_key(|info| info.version);
        points
    }

    /// The local connection point for one version, if hosted.
    pub fn local_connection_point_for(
        &self,
        version: ProtocolVersion,
    ) -> Option<ProtocolInformation> {
        self.slots.lock().get(&version).map(|slot| slot.info.clone())
    }

    /// Send one frame to a peer connection point, using the sender pool
    /// for the peer's version. `retries` is the total number of attempts.
    pub async fn send(
        &self,
        peer: &ProtocolInformation,
        frame: &Frame,
        retries: u32,
    ) -> ProtocolResult<()> {
        let senders = self.sender_pool_for(peer.version)?;
        senders.send(peer, frame, retries).await
    }

    /// Push a local file to a peer's data connection point.
    ///
    /// Cancellation aborts the push and drops the peer's channel pair so a
    /// half-written stream never lingers.
    pub async fn transfer_data(
        &self,
        peer: &ProtocolInformation,
        path: &Path,
        cancel: CancellationToken,
        retries: u32,
    ) -> ProtocolResult<()> {
        let senders = self.sender_pool_for(peer.version)?;
        let mut source = DataSource::file(path).await?;
        let preamble = DataTransfer {
            sender: self.local_id,
            id: MessageId::random(),
            total_len: source.len(),
        };

        tokio::select! {
            result = senders.send_stream(peer, preamble, &mut source, retries) => result,
            _ = cancel.cancelled() => {
                senders.close_channel_to(peer).await;
                Err(ProtocolError::Cancelled)
            }
        }
    }

    /// Drop the outbound channel pair for one peer connection point.
    pub async fn close_channels_to(&self, peer: &ProtocolInformation) {
        if let Ok(senders) = self.sender_pool_for(peer.version) {
            senders.close_channel_to(peer).await;
        }
    }

    fn sender_pool_for(
        &self,
        version: ProtocolVersion,
    ) -> ProtocolResult<Arc<SendingEndpoint<T, C>>> {
        self.slots
            .lock()
            .get(&version)
            .map(|slot| slot.senders.clone())
            .ok_or(ProtocolError::VersionMismatch { offered: version })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::{JsonCodec, TcpChannelTemplate};

    fn channel(versions: Vec<ProtocolVersion>) -> ProtocolChannel<TcpChannelTemplate, JsonCodec> {
        ProtocolChannel::new(
            TcpChannelTemplate::new(),
            JsonCodec,
            EndpointId::from_value(1),
            versions,
            ProtocolConfig::local_network(),
        )
    }

    #[tokio::test]
    async fn open_hosts_every_version() {
        let versions = vec![ProtocolVersion::new(1, 0), ProtocolVersion::new(2, 0)];
        let channel = channel(versions.clone());
        let data_handler = Arc::new(DataHandler::new());

        channel
            .open(Arc::new(|_frame| {}), data_handler)
            .await
            .expect("open");

        let points = channel.local_connection_points();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].version, versions[0]);
        assert_eq!(points[1].version, versions[1]);
        for point in &points {
            assert_ne!(point.message_address.port, 0);
            assert_ne!(point.data_address.port, 0);
            assert_ne!(point.message_address.port, point.data_address.port);
        }

        assert!(channel
            .local_connection_point_for(ProtocolVersion::new(1, 0))
            .is_some());
        assert!(channel
            .local_connection_point_for(ProtocolVersion::new(9, 9))
            .is_none());

        let registry = EndpointRegistry::new();
        channel.close(&registry).await;
        assert!(channel.local_connection_points().is_empty());
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn opening_twice_is_rejected() {
        let channel = channel(vec![ProtocolVersion::new(1, 0)]);
        let data_handler = Arc::new(DataHandler::new());

        channel
            .open(Arc::new(|_frame| {}), data_handler.clone())
            .await
            .expect("open");
        let second = channel.open(Arc::new(|_frame| {}), data_handler).await;
        assert!(matches!(
            second,
            Err(ProtocolError::DuplicateRegistration { .. })
        ));
    }

    #[tokio::test]
    async fn send_to_unhosted_version_is_a_version_mismatch() {
        let channel = channel(vec![ProtocolVersion::new(1, 0)]);
        let data_handler = Arc::new(DataHandler::new());
        channel
            .open(Arc::new(|_frame| {}), data_handler)
            .await
            .expect("open");

        let peer = ProtocolInformation::new(
            ProtocolVersion::new(3, 0),
            NetworkAddress::parse("127.0.0.1:9000").expect("addr"),
            NetworkAddress::parse("127.0.0.1:9001").expect("addr"),
        );
        let frame = Frame::new(EndpointId::from_value(1), FrameBody::Success);
        let result = channel.send(&peer, &frame, 1).await;
        assert!(matches!(
            result,
            Err(ProtocolError::VersionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn pinned_port_applies_to_first_version() {
        let port = {
            // Grab a port the OS considers free right now.
            let probe = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("probe bind");
            probe.local_addr().expect("probe addr").port()
        };

        let channel = ProtocolChannel::new(
            TcpChannelTemplate::new(),
            JsonCodec,
            EndpointId::from_value(1),
            vec![ProtocolVersion::new(1, 0)],
            ProtocolConfig::local_network().with_tcp_port(port),
        );
        let data_handler = Arc::new(DataHandler::new());
        channel
            .open(Arc::new(|_frame| {}), data_handler)
            .await
            .expect("open");

        let points = channel.local_connection_points();
        assert_eq!(points[0].message_address.port, port);
    }
}
