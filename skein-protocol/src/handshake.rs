//! Handshake conductor: drives two-party negotiation to approval or
//! rejection.
//!
//! Either endpoint may initiate. The exchange is a symmetric
//! double-connect: each side sends `EndpointConnect` on first contact, and
//! each side answers a received connect with `EndpointConnectResponse`
//! carrying its own information and accept bit. A side is terminal once it
//! has both sent and received an accept bit; both true approves the peer,
//! anything else removes it silently. Duplicate and concurrent initiation
//! folds into the one in-flight negotiation per peer, and any state times
//! out into rejection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use skein_core::{
    ChannelTemplate, DiscoveryInformation, EndpointId, EndpointInformation, MessageCodec,
    ProtocolDescription, ProtocolInformation, highest_shared_version,
};

use crate::error::{ProtocolError, ProtocolResult};
use crate::frames::{Frame, FrameBody};
use crate::message_handler::MessageHandler;
use crate::protocol_channel::ProtocolChannel;
use crate::registry::EndpointRegistry;

/// Handshake frames get a small fixed retry budget; the negotiation
/// timeout deals with everything beyond that.
const HANDSHAKE_SEND_ATTEMPTS: u32 = 2;

/// Decides whether a peer's description makes a connection worth having.
pub type ApprovalPolicy = Arc<dyn Fn(&ProtocolDescription) -> bool + Send + Sync>;

/// What this process advertises about itself during handshakes.
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    /// This process's identity.
    pub id: EndpointId,
    /// The capabilities this process offers.
    pub description: ProtocolDescription,
    /// How the discovery layer advertises this process.
    pub discovery: DiscoveryInformation,
}

#[derive(Default)]
struct Negotiation {
    /// The accept bit we put in our response, once we answered.
    sent_accept: Option<bool>,
    /// The accept bit the peer put in its response, once it arrived.
    received_accept: Option<bool>,
    /// The peer's description, from whichever frame carried it first.
    peer_description: Option<ProtocolDescription>,
    /// Whether our own connect leg is already running.
    exchange_running: bool,
}

/// Per-peer negotiation state machine.
pub struct HandshakeConductor<T: ChannelTemplate, C: MessageCodec> {
    local: LocalEndpoint,
    registry: Arc<EndpointRegistry>,
    handler: Arc<MessageHandler>,
    channel: Arc<ProtocolChannel<T, C>>,
    policy: ApprovalPolicy,
    timeout: Duration,
    negotiations: Mutex<HashMap<EndpointId, Negotiation>>,
}

impl<T: ChannelTemplate, C: MessageCodec> HandshakeConductor<T, C> {
    /// Create a conductor.
    pub fn new(
        local: LocalEndpoint,
        registry: Arc<EndpointRegistry>,
        handler: Arc<MessageHandler>,
        channel: Arc<ProtocolChannel<T, C>>,
        policy: ApprovalPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            local,
            registry,
            handler,
            channel,
            policy,
            timeout,
            negotiations: Mutex::new(HashMap::new()),
        }
    }

    /// Install the inbound-connect filter on the message handler.
    ///
    /// Response frames ride the response-correlation path and need no
    /// filter.
    pub fn install(self: &Arc<Self>, handler: &MessageHandler) {
        let conductor = Arc::downgrade(self);
        handler.act_on_arrival(
            Arc::new(|frame| matches!(frame.body, FrameBody::EndpointConnect { .. })),
            Arc::new(move |frame| {
                if let Some(conductor) = conductor.upgrade() {
                    tokio::spawn(async move {
                        conductor.handle_connect(frame).await;
                    });
                }
                Ok(())
            }),
        );
    }

    /// First contact from the discovery layer.
    ///
    /// Folding rules: a peer that is already known is not an error, the
    /// ongoing negotiation simply continues.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::VersionMismatch`] when the discovered connection
    /// point speaks a version this process does not host.
    pub fn initiate(self: &Arc<Self>, peer: EndpointInformation) -> ProtocolResult<()> {
        if peer.id == self.local.id {
            return Ok(());
        }
        if !self
            .channel
            .supported_versions()
            .contains(&peer.protocol.version)
        {
            return Err(ProtocolError::VersionMismatch {
                offered: peer.protocol.version,
            });
        }
        if self.registry.can_communicate_with(peer.id) {
            return Ok(());
        }

        let peer_id = peer.id;
        let peer_protocol = peer.protocol.clone();
        if !self.registry.try_add(peer) {
            tracing::debug!(peer = %peer_id, "peer already known, folding initiation");
        }
        self.begin_exchange(peer_id, peer_protocol);
        Ok(())
    }

    /// Number of negotiations currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.negotiations.lock().len()
    }

    /// Start our connect leg towards a peer unless it is already running.
    fn begin_exchange(self: &Arc<Self>, peer_id: EndpointId, peer_protocol: ProtocolInformation) {
        {
            let mut negotiations = self.negotiations.lock();
            let entry = negotiations.entry(peer_id).or_default();
            if entry.exchange_running {
                return;
            }
            entry.exchange_running = true;
        }

        let conductor = self.clone();
        tokio::spawn(async move {
            conductor.run_exchange(peer_id, peer_protocol).await;
        });

        // Watchdog: a negotiation that never concludes is rejected. The
        // response waiter bounds our own leg; this bounds the peer's.
        let conductor = Arc::downgrade(self);
        let watchdog_after = self.timeout * 2;
        tokio::spawn(async move {
            tokio::time::sleep(watchdog_after).await;
            if let Some(conductor) = conductor.upgrade() {
                conductor.reject(peer_id, "negotiation timed out");
            }
        });
    }

    /// Our connect leg: send `EndpointConnect`, wait for the response,
    /// record the peer's information and accept bit.
    async fn run_exchange(self: Arc<Self>, peer_id: EndpointId, peer_protocol: ProtocolInformation) {
        let frame = Frame::new(
            self.local.id,
            FrameBody::EndpointConnect {
                discovery: self.local.discovery.clone(),
                candidates: self.channel.local_connection_points(),
                description: self.local.description.clone(),
            },
        );

        let waiter = match self
            .handler
            .forward_response(peer_id, frame.header.id, self.timeout)
        {
            Ok(waiter) => waiter,
            Err(err) => {
                tracing::warn!(peer = %peer_id, error = %err, "cannot register handshake waiter");
                self.reject(peer_id, "waiter registration failed");
                return;
            }
        };

        if let Err(err) = self
            .channel
            .send(&peer_protocol, &frame, HANDSHAKE_SEND_ATTEMPTS)
            .await
        {
            tracing::debug!(peer = %peer_id, error = %err, "connect frame not delivered");
            self.reject(peer_id, "connect send failed");
            return;
        }

        match waiter.wait().await {
            Ok(response) => {
                let FrameBody::EndpointConnectResponse {
                    discovery,
                    candidates,
                    description,
                    accepted,
                } = response.body
                else {
                    tracing::warn!(peer = %peer_id, "connect answered with a non-handshake frame");
                    self.reject(peer_id, "malformed handshake response");
                    return;
                };
                self.on_peer_response(peer_id, discovery, candidates, description, accepted);
            }
            Err(ProtocolError::Timeout) => {
                tracing::debug!(peer = %peer_id, "handshake response timed out");
                self.reject(peer_id, "response timeout");
            }
            Err(err) => {
                tracing::debug!(peer = %peer_id, error = %err, "handshake wait ended");
                self.reject(peer_id, "response wait cancelled");
            }
        }
    }

    /// Inbound `EndpointConnect`: register or reconcile the peer, answer
    /// with our information and accept bit, and make sure our own connect
    /// leg runs too.
    async fn handle_connect(self: Arc<Self>, frame: Frame) {
        let sender = frame.header.sender;
        let connect_id = frame.header.id;
        let FrameBody::EndpointConnect {
            discovery,
            candidates,
            description,
        } = frame.body
        else {
            return;
        };
        if sender == self.local.id {
            return;
        }

        let ours = self.channel.supported_versions();
        let theirs: Vec<_> = candidates.iter().map(|info| info.version).collect();
        let Some(version) = highest_shared_version(&ours, &theirs) else {
            // No shared generation to even answer on: silent rejection.
            tracing::debug!(peer = %sender, "no shared protocol version, rejecting");
            self.reject(sender, "no shared version");
            return;
        };
        let Some(chosen) = candidates.into_iter().find(|info| info.version == version) else {
            return;
        };

        // A duplicate connect from an already approved peer only needs the
        // idempotent re-acknowledgement.
        if self.registry.can_communicate_with(sender) {
            self.answer_connect(sender, connect_id, &chosen, true).await;
            return;
        }

        let info = EndpointInformation::new(sender, discovery, chosen.clone());
        if !self.registry.try_add(info.clone()) {
            // Known from discovery or a concurrent initiation: reconcile
            // the provisional connection point with the negotiated one.
            self.registry.try_update(info);
        }

        let accepted = (self.policy)(&description);
        let need_exchange = {
            let mut negotiations = self.negotiations.lock();
            let entry = negotiations.entry(sender).or_default();
            entry.peer_description = Some(description);
            entry.sent_accept = Some(accepted);
            let need = !entry.exchange_running;
            if need {
                entry.exchange_running = true;
            }
            need
        };

        self.answer_connect(sender, connect_id, &chosen, accepted).await;

        if need_exchange {
            let conductor = self.clone();
            let peer_protocol = chosen.clone();
            tokio::spawn(async move {
                conductor.run_exchange(sender, peer_protocol).await;
            });
            let conductor = Arc::downgrade(&self);
            let watchdog_after = self.timeout * 2;
            tokio::spawn(async move {
                tokio::time::sleep(watchdog_after).await;
                if let Some(conductor) = conductor.upgrade() {
                    conductor.reject(sender, "negotiation timed out");
                }
            });
        }

        self.try_conclude(sender);
    }

    async fn answer_connect(
        &self,
        peer_id: EndpointId,
        connect_id: skein_core::MessageId,
        peer_protocol: &ProtocolInformation,
        accepted: bool,
    ) {
        let response = Frame::response_to(
            self.local.id,
            connect_id,
            FrameBody::EndpointConnectResponse {
                discovery: self.local.discovery.clone(),
                candidates: self.channel.local_connection_points(),
                description: self.local.description.clone(),
                accepted,
            },
        );
        if let Err(err) = self
            .channel
            .send(peer_protocol, &response, HANDSHAKE_SEND_ATTEMPTS)
            .await
        {
            tracing::debug!(peer = %peer_id, error = %err, "connect response not delivered");
        }
    }

    /// The peer's `EndpointConnectResponse` arrived on our connect leg.
    fn on_peer_response(
        &self,
        peer_id: EndpointId,
        discovery: DiscoveryInformation,
        candidates: Vec<ProtocolInformation>,
        description: ProtocolDescription,
        accepted: bool,
    ) {
        let ours = self.channel.supported_versions();
        let theirs: Vec<_> = candidates.iter().map(|info| info.version).collect();
        if let Some(version) = highest_shared_version(&ours, &theirs)
            && let Some(chosen) = candidates.into_iter().find(|info| info.version == version)
        {
            // Reconcile the provisional connection point from discovery
            // with the negotiated one; frozen (and refused) once approved.
            let info = EndpointInformation::new(peer_id, discovery, chosen);
            self.registry.try_update(info);
        }

        {
            let mut negotiations = self.negotiations.lock();
            let entry = negotiations.entry(peer_id).or_default();
            entry.received_accept = Some(accepted);
            if entry.peer_description.is_none() {
                entry.peer_description = Some(description);
            }
        }
        self.try_conclude(peer_id);
    }

    /// Conclude once both accept bits are known.
    fn try_conclude(&self, peer_id: EndpointId) {
        let outcome = {
            let mut negotiations = self.negotiations.lock();
            let Some(entry) = negotiations.get(&peer_id) else {
                return;
            };
            let (Some(sent), Some(received)) = (entry.sent_accept, entry.received_accept) else {
                return;
            };
            let description = entry.peer_description.clone();
            negotiations.remove(&peer_id);
            (sent && received, description)
        };

        match outcome {
            (true, Some(description)) => {
                if self.registry.try_start_approval(peer_id, description)
                    && self.registry.try_complete_approval(peer_id)
                {
                    tracing::debug!(peer = %peer_id, "handshake approved");
                } else {
                    tracing::debug!(peer = %peer_id, "approval transition refused");
                }
            }
            _ => {
                tracing::debug!(peer = %peer_id, "handshake rejected");
                self.registry.try_remove(peer_id);
            }
        }
    }

    /// Abort a pending negotiation; a handshake failure is a silent
    /// removal, never an error.
    fn reject(&self, peer_id: EndpointId, reason: &str) {
        let pending = self.negotiations.lock().remove(&peer_id).is_some();
        if pending {
            tracing::debug!(peer = %peer_id, reason, "handshake rejected");
            self.registry.try_remove(peer_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::{JsonCodec, NetworkAddress, ProtocolVersion, TcpChannelTemplate};
    use std::net::{IpAddr, Ipv4Addr};

    fn conductor_under_test(
        supported: Vec<ProtocolVersion>,
    ) -> Arc<HandshakeConductor<TcpChannelTemplate, JsonCodec>> {
        let registry = Arc::new(EndpointRegistry::new());
        let handler = Arc::new(MessageHandler::new(registry.clone()));
        let local = LocalEndpoint {
            id: EndpointId::from_value(1),
            description: ProtocolDescription::from_subjects(["files"]),
            discovery: DiscoveryInformation::new(NetworkAddress::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                0,
            )),
        };
        let channel = Arc::new(ProtocolChannel::new(
            TcpChannelTemplate::new(),
            JsonCodec,
            local.id,
            supported,
            crate::config::ProtocolConfig::local_network(),
        ));
        let description = local.description.clone();
        Arc::new(HandshakeConductor::new(
            local,
            registry,
            handler,
            channel,
            Arc::new(move |theirs| description.shares_subject_with(theirs)),
            Duration::from_millis(500),
        ))
    }

    fn peer(id: u128, version: ProtocolVersion) -> EndpointInformation {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        EndpointInformation::new(
            EndpointId::from_value(id),
            DiscoveryInformation::new(NetworkAddress::new(ip, 4499)),
            ProtocolInformation::new(
                version,
                NetworkAddress::new(ip, 4500),
                NetworkAddress::new(ip, 4501),
            ),
        )
    }

    #[tokio::test]
    async fn initiate_rejects_unsupported_version() {
        let conductor = conductor_under_test(vec![ProtocolVersion::new(1, 0)]);
        let result = conductor.initiate(peer(2, ProtocolVersion::new(9, 0)));
        assert!(matches!(
            result,
            Err(ProtocolError::VersionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn initiate_ignores_self() {
        let conductor = conductor_under_test(vec![ProtocolVersion::new(1, 0)]);
        let me = peer(1, ProtocolVersion::new(1, 0));
        conductor.initiate(me).expect("self contact is a no-op");
        assert_eq!(conductor.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_initiation_folds_into_one_exchange() {
        let conductor = conductor_under_test(vec![ProtocolVersion::new(1, 0)]);
        let remote = peer(2, ProtocolVersion::new(1, 0));

        conductor.initiate(remote.clone()).expect("first");
        conductor.initiate(remote).expect("second folds");
        assert_eq!(conductor.in_flight_count(), 1);
    }
}
