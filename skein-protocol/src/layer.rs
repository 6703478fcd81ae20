//! Protocol layer: the public façade over the protocol plane.
//!
//! Composes the endpoint registry, the message and data handlers, the
//! per-version protocol channel, the handshake conductor and the
//! connection monitor into one object. Built-in filters answer keep-alive
//! probes, honor disconnect notifications, drive handshakes and serve
//! download requests; an admitted frame nothing consumed is answered with
//! an unknown-message-type reply.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use skein_core::{
    ChannelTemplate, DiscoveryInformation, EndpointId, EndpointInformation, JsonCodec,
    MessageCodec, MessageId, NetworkAddress, ProtocolDescription, ProtocolInformation,
    ProtocolVersion,
};

use crate::config::ProtocolConfig;
use crate::data_handler::{DataHandler, FileInfo, UploadRegistry};
use crate::error::{ProtocolError, ProtocolResult};
use crate::frames::{Frame, FrameBody};
use crate::handshake::{ApprovalPolicy, HandshakeConductor, LocalEndpoint};
use crate::message_handler::{Dispatch, FrameAction, FrameFilter, MessageHandler};
use crate::monitor::{ConnectionMonitor, ConnectionVerifier};
use crate::protocol_channel::ProtocolChannel;
use crate::registry::{EndpointRegistry, EndpointSignal};

/// Attempts used for replies the layer produces on its own (probe echoes,
/// unknown-frame replies, download acknowledgements).
const REPLY_ATTEMPTS: u32 = 1;

/// Attempts used when pushing a requested upload.
const UPLOAD_ATTEMPTS: u32 = 3;

/// Everything the façade and the monitor share.
pub(crate) struct LayerCore<T: ChannelTemplate, C: MessageCodec> {
    local: LocalEndpoint,
    config: ProtocolConfig,
    registry: Arc<EndpointRegistry>,
    handler: Arc<MessageHandler>,
    data_handler: Arc<DataHandler>,
    uploads: Arc<UploadRegistry>,
    channel: Arc<ProtocolChannel<T, C>>,
}

impl<T: ChannelTemplate, C: MessageCodec> LayerCore<T, C> {
    fn resolve(&self, endpoint: EndpointId) -> ProtocolResult<EndpointInformation> {
        if !self.registry.can_communicate_with(endpoint) {
            return Err(ProtocolError::EndpointNotContactable { endpoint });
        }
        self.registry
            .connection_for(endpoint)
            .ok_or(ProtocolError::EndpointNotContactable { endpoint })
    }

    async fn send_to(
        &self,
        endpoint: EndpointId,
        body: FrameBody,
        retries: u32,
    ) -> ProtocolResult<MessageId> {
        let info = self.resolve(endpoint)?;
        let frame = Frame::new(self.local.id, body);
        self.channel.send(&info.protocol, &frame, retries).await?;
        Ok(frame.header.id)
    }

    async fn send_and_wait(
        &self,
        endpoint: EndpointId,
        body: FrameBody,
        retries: u32,
        timeout: Duration,
    ) -> ProtocolResult<Frame> {
        let info = self.resolve(endpoint)?;
        let frame = Frame::new(self.local.id, body);
        // Register before sending: a response can never race its waiter.
        let waiter = self
            .handler
            .forward_response(endpoint, frame.header.id, timeout)?;
        self.channel.send(&info.protocol, &frame, retries).await?;
        waiter.wait().await
    }

    async fn reply(&self, to: EndpointId, in_response_to: MessageId, body: FrameBody) {
        let Some(info) = self.registry.connection_for(to) else {
            return;
        };
        let frame = Frame::response_to(self.local.id, in_response_to, body);
        if let Err(err) = self
            .channel
            .send(&info.protocol, &frame, REPLY_ATTEMPTS)
            .await
        {
            tracing::debug!(peer = %to, error = %err, "reply not delivered");
        }
    }
}

#[async_trait::async_trait]
impl<T: ChannelTemplate, C: MessageCodec> ConnectionVerifier for LayerCore<T, C> {
    async fn verify(
        &self,
        endpoint: EndpointId,
        timeout: Duration,
        payload: Option<String>,
    ) -> ProtocolResult<()> {
        self.send_and_wait(
            endpoint,
            FrameBody::ConnectionVerification { payload },
            REPLY_ATTEMPTS,
            timeout,
        )
        .await
        .map(|_reply| ())
    }
}

/// The protocol plane's public entry point.
///
/// # Example
///
/// ```ignore
/// let layer = ProtocolLayer::builder(TcpChannelTemplate::new())
///     .with_description(ProtocolDescription::from_subjects(["files"]))
///     .build();
/// layer.open().await?;
/// layer.contact(discovered_peer)?;
/// ```
pub struct ProtocolLayer<T: ChannelTemplate, C: MessageCodec = JsonCodec> {
    core: Arc<LayerCore<T, C>>,
    conductor: Arc<HandshakeConductor<T, C>>,
    monitor: Arc<ConnectionMonitor<LayerCore<T, C>>>,
}

impl<T: ChannelTemplate> ProtocolLayer<T, JsonCodec> {
    /// Start building a layer over the given transport template.
    pub fn builder(template: T) -> ProtocolLayerBuilder<T, JsonCodec> {
        ProtocolLayerBuilder::new(template)
    }
}

impl<T: ChannelTemplate, C: MessageCodec> ProtocolLayer<T, C> {
    /// This process's endpoint identity.
    pub fn endpoint_id(&self) -> EndpointId {
        self.core.local.id
    }

    /// The capabilities this process advertises.
    pub fn description(&self) -> &ProtocolDescription {
        &self.core.local.description
    }

    /// The registry of known peers.
    pub fn registry(&self) -> &EndpointRegistry {
        &self.core.registry
    }

    /// Bind the hosts for every supported version and start monitoring.
    ///
    /// # Errors
    ///
    /// Fails when a listener cannot be bound or when already open.
    pub async fn open(&self) -> ProtocolResult<()> {
        let core = Arc::downgrade(&self.core);
        let on_frame: Arc<dyn Fn(Frame) + Send + Sync> = Arc::new(move |frame: Frame| {
            let Some(core) = core.upgrade() else {
                return;
            };
            dispatch_frame(core, frame);
        });

        self.core
            .channel
            .open(on_frame, self.core.data_handler.clone())
            .await?;
        self.monitor.start();
        tracing::debug!(endpoint = %self.core.local.id, "protocol layer open");
        Ok(())
    }

    /// Say goodbye to every approved peer, tear the hosts down and cancel
    /// every outstanding waiter.
    pub async fn close(&self) {
        self.monitor.stop();
        self.core.channel.close(&self.core.registry).await;
        self.core.handler.on_local_channel_closed();
        self.core.data_handler.on_local_channel_closed();
        tracing::debug!(endpoint = %self.core.local.id, "protocol layer closed");
    }

    /// First contact with a peer surfaced by the discovery layer.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::VersionMismatch`] when the peer was discovered
    /// with a version this process does not host.
    pub fn contact(&self, peer: EndpointInformation) -> ProtocolResult<()> {
        self.conductor.initiate(peer)
    }

    /// Send one message to an approved peer. `retries` is the total
    /// number of attempts. Returns the message id, which a response will
    /// carry in its `in_response_to` header field.
    pub async fn send_to(
        &self,
        endpoint: EndpointId,
        body: FrameBody,
        retries: u32,
    ) -> ProtocolResult<MessageId> {
        self.core.send_to(endpoint, body, retries).await
    }

    /// Answer a previously received message. The reply carries
    /// `in_response_to` and resolves the sender's waiter.
    pub async fn respond_to(
        &self,
        endpoint: EndpointId,
        in_response_to: MessageId,
        body: FrameBody,
        retries: u32,
    ) -> ProtocolResult<MessageId> {
        let info = self.core.resolve(endpoint)?;
        let frame = Frame::response_to(self.core.local.id, in_response_to, body);
        self.core.channel.send(&info.protocol, &frame, retries).await?;
        Ok(frame.header.id)
    }

    /// Send one message and wait for its response.
    pub async fn send_and_wait(
        &self,
        endpoint: EndpointId,
        body: FrameBody,
        retries: u32,
        timeout: Duration,
    ) -> ProtocolResult<Frame> {
        self.core.send_and_wait(endpoint, body, retries, timeout).await
    }

    /// Ask a peer to stream a registered upload to this process.
    ///
    /// Pairs an inbound-stream waiter with a download request; resolves
    /// once the bytes are on disk at `target`, on timeout, or when
    /// `cancel` fires.
    pub async fn transfer_data(
        &self,
        endpoint: EndpointId,
        token: MessageId,
        target: impl Into<PathBuf>,
        cancel: CancellationToken,
        retries: u32,
        timeout: Duration,
    ) -> ProtocolResult<FileInfo> {
        let target = target.into();
        let hint = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let waiter = self
            .core
            .data_handler
            .forward_data(endpoint, &target, timeout)?;
        self.core
            .send_to(
                endpoint,
                FrameBody::DataDownloadRequest { token, target: hint },
                retries,
            )
            .await?;

        tokio::select! {
            result = waiter.wait() => result,
            _ = cancel.cancelled() => Err(ProtocolError::Cancelled),
        }
    }

    /// Push a local file to an approved peer's data plane.
    pub async fn push_data(
        &self,
        endpoint: EndpointId,
        path: &Path,
        cancel: CancellationToken,
        retries: u32,
    ) -> ProtocolResult<()> {
        let info = self.core.resolve(endpoint)?;
        self.core
            .channel
            .transfer_data(&info.protocol, path, cancel, retries)
            .await
    }

    /// Probe an approved peer with a keep-alive round-trip.
    pub async fn verify_connection(
        &self,
        endpoint: EndpointId,
        timeout: Duration,
        payload: Option<String>,
    ) -> ProtocolResult<Frame> {
        self.core
            .send_and_wait(
                endpoint,
                FrameBody::ConnectionVerification { payload },
                REPLY_ATTEMPTS,
                timeout,
            )
            .await
    }

    /// Register a local file a peer may request; returns the token to
    /// hand to that peer.
    pub fn register_upload(&self, path: impl Into<PathBuf>) -> MessageId {
        self.core.uploads.register_upload(path)
    }

    /// Remove an upload registration.
    pub fn deregister_upload(&self, token: MessageId) -> bool {
        self.core.uploads.deregister_upload(token)
    }

    /// Install an application filter on the message handler.
    pub fn act_on_arrival(&self, filter: FrameFilter, action: FrameAction) {
        self.core.handler.act_on_arrival(filter, action);
    }

    /// Install or replace the last-chance fallback action.
    pub fn act_on_last_chance(&self, action: FrameAction) {
        self.core.handler.act_on_last_chance(action);
    }

    /// Register a callback fired when a peer reaches Approved.
    pub fn on_peer_connected(&self, signal: EndpointSignal) {
        self.core.registry.notify_on_connected(signal);
    }

    /// Register a callback fired before a peer is removed.
    pub fn on_peer_disconnecting(&self, signal: EndpointSignal) {
        self.core.registry.notify_on_disconnecting(signal);
    }

    /// Register a callback fired after a peer was removed.
    pub fn on_peer_disconnected(&self, signal: EndpointSignal) {
        self.core.registry.notify_on_disconnected(signal);
    }

    /// The local connection points, one per supported version.
    pub fn local_connection_points(&self) -> Vec<ProtocolInformation> {
        self.core.channel.local_connection_points()
    }

    /// The local connection point for one version, if hosted.
    pub fn local_connection_point_for(
        &self,
        version: ProtocolVersion,
    ) -> Option<ProtocolInformation> {
        self.core.channel.local_connection_point_for(version)
    }

    /// The discovery record other processes can use to contact this one,
    /// built from the first hosted connection point.
    pub fn local_endpoint_information(&self) -> Option<EndpointInformation> {
        let points = self.core.channel.local_connection_points();
        let first = points.first()?.clone();
        Some(EndpointInformation::new(
            self.core.local.id,
            self.core.local.discovery.clone(),
            first,
        ))
    }
}

/// Route one decoded frame through the message handler and answer the
/// unknown-frame case.
fn dispatch_frame<T: ChannelTemplate, C: MessageCodec>(core: Arc<LayerCore<T, C>>, frame: Frame) {
    let header = frame.header;
    match core.handler.process_message(frame) {
        Dispatch::Unhandled => {
            tracing::debug!(
                sender = %header.sender,
                "no filter matched, answering with unknown message type"
            );
            tokio::spawn(async move {
                core.reply(header.sender, header.id, FrameBody::UnknownMessageType)
                    .await;
            });
        }
        Dispatch::Response | Dispatch::Refused | Dispatch::Filtered | Dispatch::LastChance => {}
    }
}

/// Install the layer's built-in filters.
fn install_builtin_filters<T: ChannelTemplate, C: MessageCodec>(
    core: &Arc<LayerCore<T, C>>,
    conductor: &Arc<HandshakeConductor<T, C>>,
) {
    conductor.install(&core.handler);

    // Keep-alive probes are answered by echoing the payload.
    let weak: Weak<LayerCore<T, C>> = Arc::downgrade(core);
    core.handler.act_on_arrival(
        Arc::new(|frame| matches!(frame.body, FrameBody::ConnectionVerification { .. })),
        Arc::new(move |frame| {
            let Some(core) = weak.upgrade() else {
                return Ok(());
            };
            let sender = frame.header.sender;
            let probe_id = frame.header.id;
            let FrameBody::ConnectionVerification { payload } = frame.body else {
                return Ok(());
            };
            tokio::spawn(async move {
                core.reply(
                    sender,
                    probe_id,
                    FrameBody::ConnectionVerificationResponse { payload },
                )
                .await;
            });
            Ok(())
        }),
    );

    // A peer signing off cancels its waiters and leaves the registry.
    let weak: Weak<LayerCore<T, C>> = Arc::downgrade(core);
    core.handler.act_on_arrival(
        Arc::new(|frame| matches!(frame.body, FrameBody::EndpointDisconnect)),
        Arc::new(move |frame| {
            let Some(core) = weak.upgrade() else {
                return Ok(());
            };
            let sender = frame.header.sender;
            tracing::debug!(peer = %sender, "peer signed off");
            core.handler.on_endpoint_signed_off(sender);
            core.data_handler.on_endpoint_signed_off(sender);
            core.registry.try_remove(sender);
            Ok(())
        }),
    );

    // Download requests resolve against the upload registry and push the
    // file back over the requester's data plane.
    let weak: Weak<LayerCore<T, C>> = Arc::downgrade(core);
    core.handler.act_on_arrival(
        Arc::new(|frame| matches!(frame.body, FrameBody::DataDownloadRequest { .. })),
        Arc::new(move |frame| {
            let Some(core) = weak.upgrade() else {
                return Ok(());
            };
            let sender = frame.header.sender;
            let request_id = frame.header.id;
            let FrameBody::DataDownloadRequest { token, target } = frame.body else {
                return Ok(());
            };
            tokio::spawn(async move {
                let Some(path) = core.uploads.resolve(token) else {
                    tracing::debug!(peer = %sender, %token, "download request for unknown token");
                    core.reply(
                        sender,
                        request_id,
                        FrameBody::Failure {
                            reason: "unknown upload token".to_string(),
                        },
                    )
                    .await;
                    return;
                };
                let Some(info) = core.registry.connection_for(sender) else {
                    return;
                };
                tracing::debug!(peer = %sender, target, "pushing requested upload");
                let push = core
                    .channel
                    .transfer_data(
                        &info.protocol,
                        &path,
                        CancellationToken::new(),
                        UPLOAD_ATTEMPTS,
                    )
                    .await;
                let reply = match push {
                    Ok(()) => FrameBody::Success,
                    Err(err) => {
                        tracing::warn!(peer = %sender, error = %err, "upload push failed");
                        FrameBody::Failure {
                            reason: err.to_string(),
                        }
                    }
                };
                core.reply(sender, request_id, reply).await;
            });
            Ok(())
        }),
    );

    // Removal from any path (sign-off, eviction, explicit) cancels the
    // waiters and outbound channels belonging to the peer.
    let weak: Weak<LayerCore<T, C>> = Arc::downgrade(core);
    core.registry.notify_on_disconnecting(Arc::new(move |id| {
        let Some(core) = weak.upgrade() else {
            return;
        };
        if let Some(info) = core.registry.connection_for(id) {
            tokio::spawn(async move {
                core.channel.close_channels_to(&info.protocol).await;
            });
        }
    }));
    let weak: Weak<LayerCore<T, C>> = Arc::downgrade(core);
    core.registry.notify_on_disconnected(Arc::new(move |id| {
        let Some(core) = weak.upgrade() else {
            return;
        };
        core.handler.on_endpoint_signed_off(id);
        core.data_handler.on_endpoint_signed_off(id);
    }));
}

/// Builder for [`ProtocolLayer`].
pub struct ProtocolLayerBuilder<T: ChannelTemplate, C: MessageCodec = JsonCodec> {
    template: T,
    codec: C,
    config: ProtocolConfig,
    description: ProtocolDescription,
    versions: Vec<ProtocolVersion>,
    policy: Option<ApprovalPolicy>,
    discovery_address: Option<NetworkAddress>,
    probe_payload: Option<String>,
}

impl<T: ChannelTemplate> ProtocolLayerBuilder<T, JsonCodec> {
    /// Start a builder with the default JSON codec, version 1.0 and an
    /// empty description.
    pub fn new(template: T) -> Self {
        Self {
            template,
            codec: JsonCodec,
            config: ProtocolConfig::default(),
            description: ProtocolDescription::new(),
            versions: vec![ProtocolVersion::new(1, 0)],
            policy: None,
            discovery_address: None,
            probe_payload: None,
        }
    }
}

impl<T: ChannelTemplate, C: MessageCodec> ProtocolLayerBuilder<T, C> {
    /// Use a different payload codec.
    pub fn with_codec<C2: MessageCodec>(self, codec: C2) -> ProtocolLayerBuilder<T, C2> {
        ProtocolLayerBuilder {
            template: self.template,
            codec,
            config: self.config,
            description: self.description,
            versions: self.versions,
            policy: self.policy,
            discovery_address: self.discovery_address,
            probe_payload: self.probe_payload,
        }
    }

    /// Apply a configuration.
    pub fn with_config(mut self, config: ProtocolConfig) -> Self {
        self.config = config;
        self
    }

    /// Advertise these capabilities.
    pub fn with_description(mut self, description: ProtocolDescription) -> Self {
        self.description = description;
        self
    }

    /// Host these protocol versions.
    pub fn with_supported_versions(mut self, versions: Vec<ProtocolVersion>) -> Self {
        self.versions = versions;
        self
    }

    /// Decide approvals with a custom policy instead of the default
    /// subject-intersection check.
    pub fn with_approval_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Advertise this discovery address in handshakes.
    pub fn with_discovery_address(mut self, address: NetworkAddress) -> Self {
        self.discovery_address = Some(address);
        self
    }

    /// Attach an application payload to every keep-alive probe.
    pub fn with_probe_payload(mut self, payload: impl Into<String>) -> Self {
        self.probe_payload = Some(payload.into());
        self
    }

    /// Assemble the layer. Nothing touches the network until `open()`.
    pub fn build(self) -> ProtocolLayer<T, C> {
        let local = LocalEndpoint {
            id: EndpointId::random(),
            description: self.description,
            discovery: DiscoveryInformation::new(self.discovery_address.unwrap_or(
                NetworkAddress::new(self.config.tcp_base_address, 0),
            )),
        };

        let registry = Arc::new(EndpointRegistry::new());
        let handler = Arc::new(MessageHandler::new(registry.clone()));
        let data_handler = Arc::new(DataHandler::new());
        let uploads = Arc::new(UploadRegistry::new());
        let channel = Arc::new(ProtocolChannel::new(
            self.template,
            self.codec,
            local.id,
            self.versions,
            self.config.clone(),
        ));

        let policy = self.policy.unwrap_or_else(|| {
            let ours = local.description.clone();
            Arc::new(move |theirs: &ProtocolDescription| ours.shares_subject_with(theirs))
        });

        let core = Arc::new(LayerCore {
            local: local.clone(),
            config: self.config,
            registry: registry.clone(),
            handler: handler.clone(),
            data_handler,
            uploads,
            channel: channel.clone(),
        });

        let conductor = Arc::new(HandshakeConductor::new(
            local,
            registry.clone(),
            handler.clone(),
            channel,
            policy,
            core.config.wait_for_response_timeout,
        ));
        install_builtin_filters(&core, &conductor);

        let mut monitor = ConnectionMonitor::new(core.clone(), registry, &core.config);
        if let Some(payload) = self.probe_payload {
            monitor = monitor.with_probe_payload(payload);
        }
        let monitor = Arc::new(monitor);
        if let Err(err) = monitor.register(&handler) {
            // Unreachable for a freshly built monitor; log and carry on.
            tracing::error!(error = %err, "monitor registration failed");
        }

        ProtocolLayer {
            core,
            conductor,
            monitor,
        }
    }
}
