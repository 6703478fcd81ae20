//! Message handler: dispatch of incoming frames.
//!
//! Dispatch order for every frame:
//!
//! 1. The channel-integrity signal fires (the monitor uses any received
//!    traffic to reset its failure counter).
//! 2. Responses resolve their registered waiter; an unmatched response is
//!    dropped silently.
//! 3. The admission filter refuses everything from a sender that is not
//!    Approved, except handshake frames and the disconnect notification.
//! 4. Filters run in insertion order; the first match consumes the frame.
//! 5. An unmatched frame goes to the last-chance action, if installed.
//!
//! Waiter fulfilment and filter actions run outside the handler lock;
//! filters are copied out of the lock before invocation, so an action may
//! register new waiters or send traffic. An action that fails is logged
//! and absorbed; a single misbehaving handler never takes down the
//! dispatch loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use skein_core::{EndpointId, MessageId};

use crate::completion::{Completer, WaitHandle, completion};
use crate::error::{ProtocolError, ProtocolResult};
use crate::frames::{Frame, FrameBody};
use crate::registry::EndpointRegistry;

/// Predicate deciding whether a filter consumes a frame.
pub type FrameFilter = Arc<dyn Fn(&Frame) -> bool + Send + Sync>;

/// Action invoked with a consumed frame.
pub type FrameAction = Arc<dyn Fn(Frame) -> ProtocolResult<()> + Send + Sync>;

/// Callback fired with the sender of any received frame.
pub type IntegritySignal = Arc<dyn Fn(EndpointId) + Send + Sync>;

/// How [`MessageHandler::process_message`] disposed of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The frame was a response: a waiter was fulfilled, or the frame was
    /// dropped because nobody was waiting for it.
    Response,
    /// The sender is not approved and the frame was refused.
    Refused,
    /// A filter consumed the frame.
    Filtered,
    /// The last-chance action consumed the frame.
    LastChance,
    /// Nothing consumed the frame; the caller should answer with
    /// an unknown-message-type reply.
    Unhandled,
}

struct HandlerState {
    waiters: HashMap<(EndpointId, MessageId), Completer<Frame>>,
    filters: Vec<(FrameFilter, FrameAction)>,
    last_chance: Option<FrameAction>,
    integrity: Vec<IntegritySignal>,
}

/// Dispatcher for all incoming message-plane frames.
pub struct MessageHandler {
    registry: Arc<EndpointRegistry>,
    state: Arc<Mutex<HandlerState>>,
}

impl MessageHandler {
    /// Create a handler gating admission on the given registry.
    pub fn new(registry: Arc<EndpointRegistry>) -> Self {
        Self {
            registry,
            state: Arc::new(Mutex::new(HandlerState {
                waiters: HashMap::new(),
                filters: Vec::new(),
                last_chance: None,
                integrity: Vec::new(),
            })),
        }
    }

    /// Register a waiter for the response to `in_response_to` coming from
    /// `expected_sender`.
    ///
    /// The returned waiter resolves with the matching frame, a timeout, or
    /// cancellation (peer sign-off or local close). Dropping the waiter
    /// deregisters it.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::DuplicateRegistration`] when a waiter for the same
    /// `(sender, message)` pair already exists.
    pub fn forward_response(
        &self,
        expected_sender: EndpointId,
        in_response_to: MessageId,
        timeout: Duration,
    ) -> ProtocolResult<ResponseWaiter> {
        let key = (expected_sender, in_response_to);
        let (completer, handle) = completion();
        {
            let mut state = self.state.lock();
            if state.waiters.contains_key(&key) {
                return Err(ProtocolError::DuplicateRegistration {
                    what: format!("response waiter for {} from {}", in_response_to, expected_sender),
                });
            }
            state.waiters.insert(key, completer);
        }
        Ok(ResponseWaiter {
            key,
            handle: Some(handle),
            timeout,
            state: self.state.clone(),
        })
    }

    /// Install a filter with its action. Filters are evaluated in
    /// insertion order; each frame is expected to match exactly one.
    pub fn act_on_arrival(&self, filter: FrameFilter, action: FrameAction) {
        self.state.lock().filters.push((filter, action));
    }

    /// Install or replace the single last-chance fallback action.
    pub fn act_on_last_chance(&self, action: FrameAction) {
        self.state.lock().last_chance = Some(action);
    }

    /// Register a callback fired with the sender of every received frame.
    pub fn notify_on_confirm_channel_integrity(&self, signal: IntegritySignal) {
        self.state.lock().integrity.push(signal);
    }

    /// Entry point for incoming frames. Safe to call from the transport's
    /// receive task; never blocks on locks held across I/O.
    pub fn process_message(&self, frame: Frame) -> Dispatch {
        let sender = frame.header.sender;

        let integrity = self.state.lock().integrity.clone();
        for signal in &integrity {
            signal(sender);
        }

        if let Some(in_response_to) = frame.header.in_response_to {
            let completer = self.state.lock().waiters.remove(&(sender, in_response_to));
            match completer {
                Some(completer) => {
                    completer.fulfil(frame);
                }
                None => {
                    tracing::debug!(
                        %sender,
                        %in_response_to,
                        "response without a waiter, dropping"
                    );
                }
            }
            return Dispatch::Response;
        }

        let admitted = self.registry.can_communicate_with(sender)
            || frame.body.is_handshake()
            || matches!(frame.body, FrameBody::EndpointDisconnect);
        if !admitted {
            tracing::debug!(%sender, kind = frame.body.kind(), "refused frame from unapproved sender");
            return Dispatch::Refused;
        }

        let filters = self.state.lock().filters.clone();
        for (filter, action) in &filters {
            if filter(&frame) {
                let kind = frame.body.kind();
                if let Err(err) = action(frame) {
                    tracing::warn!(%sender, kind, error = %err, "filter action failed");
                }
                return Dispatch::Filtered;
            }
        }

        let last_chance = self.state.lock().last_chance.clone();
        if let Some(action) = last_chance {
            let kind = frame.body.kind();
            if let Err(err) = action(frame) {
                tracing::warn!(%sender, kind, error = %err, "last-chance action failed");
            }
            return Dispatch::LastChance;
        }

        Dispatch::Unhandled
    }

    /// Cancel every waiter expecting a response from `id`.
    pub fn on_endpoint_signed_off(&self, id: EndpointId) {
        let cancelled: Vec<Completer<Frame>> = {
            let mut state = self.state.lock();
            let keys: Vec<(EndpointId, MessageId)> = state
                .waiters
                .keys()
                .filter(|(sender, _)| *sender == id)
                .copied()
                .collect();
            keys.into_iter()
                .filter_map(|key| state.waiters.remove(&key))
                .collect()
        };
        if !cancelled.is_empty() {
            tracing::debug!(endpoint = %id, count = cancelled.len(), "cancelling waiters for signed-off peer");
        }
        for completer in cancelled {
            completer.cancel();
        }
    }

    /// Cancel every waiter; the local channel is closing.
    pub fn on_local_channel_closed(&self) {
        let cancelled: Vec<Completer<Frame>> = {
            let mut state = self.state.lock();
            state.waiters.drain().map(|(_, completer)| completer).collect()
        };
        for completer in cancelled {
            completer.cancel();
        }
    }

    /// Number of registered waiters.
    pub fn pending_waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

/// A registered wait for one response frame.
///
/// Deregisters itself when dropped, so an abandoned wait never leaks its
/// map entry.
pub struct ResponseWaiter {
    key: (EndpointId, MessageId),
    handle: Option<WaitHandle<Frame>>,
    timeout: Duration,
    state: Arc<Mutex<HandlerState>>,
}

impl ResponseWaiter {
    /// Wait for the response, the configured timeout, or cancellation.
    pub async fn wait(mut self) -> ProtocolResult<Frame> {
        match self.handle.take() {
            Some(handle) => handle.wait(self.timeout).await,
            None => Err(ProtocolError::Cancelled),
        }
    }
}

impl Drop for ResponseWaiter {
    fn drop(&mut self) {
        self.state.lock().waiters.remove(&self.key);
    }
}
