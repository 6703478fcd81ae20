//! Connection monitor: periodic liveness probing and eviction.
//!
//! Every approved peer carries `{next_probe_at, consecutive_failures}`.
//! Each tick probes the peers whose deadline passed with a verification
//! round-trip; a success resets the counter and pushes the deadline out, a
//! failure increments it, and crossing the configured maximum evicts the
//! peer through the registry. Any incoming traffic counts as a
//! confirmation and resets the counter, so busy peers are not probed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use skein_core::EndpointId;

use crate::config::ProtocolConfig;
use crate::error::{ProtocolError, ProtocolResult};
use crate::message_handler::MessageHandler;
use crate::registry::EndpointRegistry;

/// The probe round-trip the monitor drives; implemented by the protocol
/// layer with a keep-alive frame.
#[async_trait]
pub trait ConnectionVerifier: Send + Sync + 'static {
    /// Send one verification probe and wait for its reply.
    async fn verify(
        &self,
        endpoint: EndpointId,
        timeout: Duration,
        payload: Option<String>,
    ) -> ProtocolResult<()>;
}

#[derive(Debug, Clone, Copy)]
struct ProbeState {
    next_probe_at: Instant,
    consecutive_failures: u32,
}

/// Periodic liveness monitor over all approved peers.
pub struct ConnectionMonitor<V: ConnectionVerifier> {
    verifier: Arc<V>,
    registry: Arc<EndpointRegistry>,
    keep_alive_interval: Duration,
    confirmation_interval: Duration,
    probe_timeout: Duration,
    max_missed: u32,
    probe_payload: Option<String>,
    connections: Arc<Mutex<HashMap<EndpointId, ProbeState>>>,
    registered: AtomicBool,
    tick_task: Mutex<Option<JoinHandle<()>>>,
}

impl<V: ConnectionVerifier> ConnectionMonitor<V> {
    /// Create a monitor; it does nothing until registered and started.
    pub fn new(verifier: Arc<V>, registry: Arc<EndpointRegistry>, config: &ProtocolConfig) -> Self {
        Self {
            verifier,
            registry,
            keep_alive_interval: config.keep_alive_interval,
            confirmation_interval: config.max_time_between_connection_confirmations,
            probe_timeout: config.wait_for_response_timeout,
            max_missed: config.max_missed_keep_alive_signals,
            probe_payload: None,
            connections: Arc::new(Mutex::new(HashMap::new())),
            registered: AtomicBool::new(false),
            tick_task: Mutex::new(None),
        }
    }

    /// Attach an application-supplied payload to every probe.
    pub fn with_probe_payload(mut self, payload: impl Into<String>) -> Self {
        self.probe_payload = Some(payload.into());
        self
    }

    /// Hook the monitor into a message handler and the registry.
    ///
    /// One-shot per monitor: a second registration is refused.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::DuplicateRegistration`] on a repeated call.
    pub fn register(self: &Arc<Self>, handler: &MessageHandler) -> ProtocolResult<()> {
        if self.registered.swap(true, Ordering::SeqCst) {
            return Err(ProtocolError::DuplicateRegistration {
                what: "connection monitor is already registered".to_string(),
            });
        }

        // Incoming traffic of any kind confirms the channel.
        let monitor = Arc::downgrade(self);
        handler.notify_on_confirm_channel_integrity(Arc::new(move |id| {
            if let Some(monitor) = monitor.upgrade() {
                monitor.on_confirm_channel_integrity(id);
            }
        }));

        // Track peers from approval to removal.
        let monitor = Arc::downgrade(self);
        self.registry.notify_on_connected(Arc::new(move |id| {
            if let Some(monitor) = monitor.upgrade() {
                monitor.track(id);
            }
        }));
        let monitor = Arc::downgrade(self);
        self.registry.notify_on_disconnected(Arc::new(move |id| {
            if let Some(monitor) = monitor.upgrade() {
                monitor.untrack(id);
            }
        }));
        Ok(())
    }

    /// Start the tick loop.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.tick_task.lock();
        if slot.is_some() {
            return;
        }
        let monitor = Arc::downgrade(self);
        let interval = self.keep_alive_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(monitor) = monitor.upgrade() else {
                    return;
                };
                monitor.tick();
            }
        }));
    }

    /// Stop the tick loop. In-flight probes finish on their own.
    pub fn stop(&self) {
        if let Some(task) = self.tick_task.lock().take() {
            task.abort();
        }
    }

    /// Reset the failure counter for a peer: its channel just carried
    /// traffic, so probing it now would be noise.
    pub fn on_confirm_channel_integrity(&self, id: EndpointId) {
        let mut connections = self.connections.lock();
        if let Some(state) = connections.get_mut(&id) {
            state.consecutive_failures = 0;
            state.next_probe_at = Instant::now() + self.confirmation_interval;
        }
    }

    /// Number of peers currently tracked.
    pub fn tracked_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Consecutive failures recorded for a peer.
    pub fn failures_for(&self, id: EndpointId) -> Option<u32> {
        self.connections
            .lock()
            .get(&id)
            .map(|state| state.consecutive_failures)
    }

    fn track(&self, id: EndpointId) {
        self.connections.lock().insert(
            id,
            ProbeState {
                next_probe_at: Instant::now() + self.confirmation_interval,
                consecutive_failures: 0,
            },
        );
    }

    fn untrack(&self, id: EndpointId) {
        self.connections.lock().remove(&id);
    }

    /// One monitor tick: dispatch a probe for every peer whose deadline
    /// passed. Probes run concurrently; a slow peer never delays the rest.
    fn tick(self: &Arc<Self>) {
        let now = Instant::now();
        let due: Vec<EndpointId> = {
            let mut connections = self.connections.lock();
            connections
                .iter_mut()
                .filter(|(_, state)| state.next_probe_at <= now)
                .map(|(id, state)| {
                    // Provisional push so the probe is not re-dispatched
                    // while in flight; the outcome sets the real deadline.
                    state.next_probe_at = now + self.probe_timeout + self.keep_alive_interval;
                    *id
                })
                .collect()
        };

        for id in due {
            let monitor = self.clone();
            tokio::spawn(async move {
                monitor.probe(id).await;
            });
        }
    }

    async fn probe(self: Arc<Self>, id: EndpointId) {
        let result = self
            .verifier
            .verify(id, self.probe_timeout, self.probe_payload.clone())
            .await;

        let evict = {
            let mut connections = self.connections.lock();
            let Some(state) = connections.get_mut(&id) else {
                return;
            };
            match result {
                Ok(()) => {
                    state.consecutive_failures = 0;
                    state.next_probe_at = Instant::now() + self.confirmation_interval;
                    false
                }
                Err(err) => {
                    state.consecutive_failures += 1;
                    state.next_probe_at = Instant::now() + self.keep_alive_interval;
                    tracing::debug!(
                        peer = %id,
                        failures = state.consecutive_failures,
                        error = %err,
                        "verification probe failed"
                    );
                    state.consecutive_failures > self.max_missed
                }
            }
        };

        if evict {
            tracing::warn!(peer = %id, "peer exceeded missed keep-alive budget, evicting");
            self.registry.try_remove(id);
        }
    }
}
