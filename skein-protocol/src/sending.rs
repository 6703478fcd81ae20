//! Sending endpoint: per-peer pool of outbound channels.
//!
//! For every peer connection point the pool holds at most one message
//! channel and one data channel, created lazily on first use and dropped
//! together on [`SendingEndpoint::close_channel_to`]. Creation and removal
//! serialize on the pool lock; transmission happens on the channels'
//! own locks, so sends to different peers proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use skein_core::{ChannelTemplate, MessageCodec, ProtocolInformation};

use crate::channel::{DataSource, RestoringDataChannel, RestoringMessageChannel};
use crate::error::ProtocolResult;
use crate::frames::{DataTransfer, Frame};

struct ChannelPair<T: ChannelTemplate, C: MessageCodec> {
    message: Arc<RestoringMessageChannel<T, C>>,
    data: Arc<RestoringDataChannel<T, C>>,
}

impl<T: ChannelTemplate, C: MessageCodec> Clone for ChannelPair<T, C> {
    fn clone(&self) -> Self {
        Self {
            message: self.message.clone(),
            data: self.data.clone(),
        }
    }
}

/// Pool of outbound channel pairs, one per peer connection point.
pub struct SendingEndpoint<T: ChannelTemplate, C: MessageCodec> {
    template: T,
    codec: C,
    connect_timeout: Duration,
    ack_timeout: Duration,
    channels: Mutex<HashMap<ProtocolInformation, ChannelPair<T, C>>>,
}

impl<T: ChannelTemplate, C: MessageCodec> SendingEndpoint<T, C> {
    /// Create an empty pool.
    pub fn new(template: T, codec: C, connect_timeout: Duration, ack_timeout: Duration) -> Self {
        Self {
            template,
            codec,
            connect_timeout,
            ack_timeout,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Send one frame to a peer, creating the message channel on first use.
    ///
    /// `retries` is the total number of attempts.
    pub async fn send(
        &self,
        peer: &ProtocolInformation,
        frame: &Frame,
        retries: u32,
    ) -> ProtocolResult<()> {
        let pair = self.pair_for(peer);
        pair.message.send(frame, retries).await
    }

    /// Push one bulk stream to a peer, creating the data channel on first
    /// use.
    ///
    /// `retries` is the total number of attempts.
    pub async fn send_stream(
        &self,
        peer: &ProtocolInformation,
        preamble: DataTransfer,
        source: &mut DataSource,
        retries: u32,
    ) -> ProtocolResult<()> {
        let pair = self.pair_for(peer);
        pair.data.send_stream(preamble, source, retries).await
    }

    /// Drop both channels to a peer, releasing their streams.
    ///
    /// Returns false when no channels were open for the peer.
    pub async fn close_channel_to(&self, peer: &ProtocolInformation) -> bool {
        let removed = self.channels.lock().remove(peer);
        match removed {
            Some(pair) => {
                pair.message.close().await;
                pair.data.close().await;
                tracing::debug!(peer = %peer.message_address, "closed channel pair");
                true
            }
            None => false,
        }
    }

    /// Drop every channel in the pool.
    pub async fn close_all(&self) {
        let drained: Vec<ChannelPair<T, C>> =
            self.channels.lock().drain().map(|(_, pair)| pair).collect();
        for pair in drained {
            pair.message.close().await;
            pair.data.close().await;
        }
    }

    /// Number of peers with a channel pair in the pool.
    pub fn open_channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    fn pair_for(&self, peer: &ProtocolInformation) -> ChannelPair<T, C> {
        let mut channels = self.channels.lock();
        channels
            .entry(peer.clone())
            .or_insert_with(|| ChannelPair {
                message: Arc::new(RestoringMessageChannel::new(
                    self.template.clone(),
                    self.codec.clone(),
                    peer.message_address,
                    self.connect_timeout,
                )),
                data: Arc::new(RestoringDataChannel::new(
                    self.template.clone(),
                    self.codec.clone(),
                    peer.data_address,
                    self.connect_timeout,
                    self.ack_timeout,
                )),
            })
            .clone()
    }
}
