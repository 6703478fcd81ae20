//! Endpoint registry: the four-state lifecycle store for known peers.
//!
//! An endpoint is in exactly one of Contacted, WaitingForApproval or
//! Approved; an endpoint not present at all is Absent. All mutators are
//! serialized on the registry lock; predicates take the same lock briefly
//! and therefore always observe a consistent snapshot. Signals are fired
//! strictly outside the lock, so a signal handler may call back into the
//! registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use skein_core::{EndpointId, EndpointInformation, ProtocolDescription};

/// Callback invoked with the id of the endpoint a signal concerns.
pub type EndpointSignal = Arc<dyn Fn(EndpointId) + Send + Sync>;

#[derive(Debug, Clone)]
enum Phase {
    /// Address known, no description yet.
    Contacted,
    /// Description known, handshake in flight.
    WaitingForApproval(ProtocolDescription),
    /// Handshake completed on both sides; ready for traffic.
    Approved(ProtocolDescription),
}

#[derive(Debug, Clone)]
struct Entry {
    info: EndpointInformation,
    phase: Phase,
    /// Set while a removal is in flight: the entry stays readable so
    /// disconnecting observers can send farewell traffic, but no mutator
    /// may touch it any more.
    removing: bool,
}

#[derive(Default)]
struct Signals {
    connected: Vec<EndpointSignal>,
    disconnecting: Vec<EndpointSignal>,
    disconnected: Vec<EndpointSignal>,
}

/// Store of all known peers and their lifecycle state.
pub struct EndpointRegistry {
    entries: Mutex<HashMap<EndpointId, Entry>>,
    signals: Mutex<Signals>,
}

impl EndpointRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            signals: Mutex::new(Signals::default()),
        }
    }

    /// Add a newly contacted endpoint.
    ///
    /// Fails when the id is already known in any state; an existing entry
    /// is never silently replaced.
    pub fn try_add(&self, info: EndpointInformation) -> bool {
        let id = info.id;
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return false;
        }
        tracing::debug!(endpoint = %id, "endpoint contacted");
        entries.insert(
            id,
            Entry {
                info,
                phase: Phase::Contacted,
                removing: false,
            },
        );
        true
    }

    /// Attach a description and move a Contacted endpoint into
    /// WaitingForApproval. Fails from any other state.
    pub fn try_start_approval(&self, id: EndpointId, description: ProtocolDescription) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) if !entry.removing && matches!(entry.phase, Phase::Contacted) => {
                entry.phase = Phase::WaitingForApproval(description);
                true
            }
            _ => false,
        }
    }

    /// Move a WaitingForApproval endpoint into Approved. Fails from any
    /// other state. Fires `on_connected` after the lock is released.
    pub fn try_complete_approval(&self, id: EndpointId) -> bool {
        let approved = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&id) {
                Some(entry) if !entry.removing => {
                    let Phase::WaitingForApproval(description) = entry.phase.clone() else {
                        return false;
                    };
                    entry.phase = Phase::Approved(description);
                    true
                }
                _ => false,
            }
        };
        if approved {
            tracing::debug!(endpoint = %id, "endpoint approved");
            self.fire(self.connected_signals(), id);
        }
        approved
    }

    /// Replace the stored addresses of a Contacted or WaitingForApproval
    /// endpoint. The addresses of an Approved endpoint are frozen.
    pub fn try_update(&self, info: EndpointInformation) -> bool {
        let id = info.id;
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) if !entry.removing && !matches!(entry.phase, Phase::Approved(_)) => {
                entry.info = info;
                true
            }
            _ => false,
        }
    }

    /// Remove an endpoint from any state.
    ///
    /// Fires `on_disconnecting` before the entry is mutated and
    /// `on_disconnected` after, each exactly once. Returns false when the
    /// id is unknown or already being removed, in which case no signal
    /// fires.
    pub fn try_remove(&self, id: EndpointId) -> bool {
        {
            let mut entries = self.entries.lock();
            match entries.get_mut(&id) {
                Some(entry) if !entry.removing => entry.removing = true,
                _ => return false,
            }
        }

        // The entry is still readable here: disconnecting observers may
        // resolve the peer and send farewell traffic.
        self.fire(self.disconnecting_signals(), id);

        self.entries.lock().remove(&id);
        tracing::debug!(endpoint = %id, "endpoint removed");

        self.fire(self.disconnected_signals(), id);
        true
    }

    /// The stored record for an endpoint in any state.
    pub fn connection_for(&self, id: EndpointId) -> Option<EndpointInformation> {
        self.entries.lock().get(&id).map(|e| e.info.clone())
    }

    /// The accepted description of an endpoint, once one is attached.
    pub fn description_for(&self, id: EndpointId) -> Option<ProtocolDescription> {
        self.entries.lock().get(&id).and_then(|e| match &e.phase {
            Phase::Contacted => None,
            Phase::WaitingForApproval(d) | Phase::Approved(d) => Some(d.clone()),
        })
    }

    /// Whether the endpoint is known in any state.
    pub fn has_been_contacted(&self, id: EndpointId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    /// Whether the endpoint is waiting for handshake completion.
    pub fn is_waiting_for_approval(&self, id: EndpointId) -> bool {
        matches!(
            self.entries.lock().get(&id).map(|e| &e.phase),
            Some(Phase::WaitingForApproval(_))
        )
    }

    /// Whether the endpoint is approved for non-handshake traffic.
    pub fn can_communicate_with(&self, id: EndpointId) -> bool {
        matches!(
            self.entries.lock().get(&id).map(|e| &e.phase),
            Some(Phase::Approved(_))
        )
    }

    /// Records of all approved endpoints.
    pub fn approved_endpoints(&self) -> Vec<EndpointInformation> {
        self.entries
            .lock()
            .values()
            .filter(|e| matches!(e.phase, Phase::Approved(_)))
            .map(|e| e.info.clone())
            .collect()
    }

    /// Number of known endpoints in any state.
    pub fn known_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Register a callback fired after an endpoint reaches Approved.
    pub fn notify_on_connected(&self, signal: EndpointSignal) {
        self.signals.lock().connected.push(signal);
    }

    /// Register a callback fired before a removal mutates the registry.
    /// Observers that need to send farewell traffic register here.
    pub fn notify_on_disconnecting(&self, signal: EndpointSignal) {
        self.signals.lock().disconnecting.push(signal);
    }

    /// Register a callback fired after a removal completed. Observers that
    /// drop per-peer resources register here.
    pub fn notify_on_disconnected(&self, signal: EndpointSignal) {
        self.signals.lock().disconnected.push(signal);
    }

    fn connected_signals(&self) -> Vec<EndpointSignal> {
        self.signals.lock().connected.clone()
    }

    fn disconnecting_signals(&self) -> Vec<EndpointSignal> {
        self.signals.lock().disconnecting.clone()
    }

    fn disconnected_signals(&self) -> Vec<EndpointSignal> {
        self.signals.lock().disconnected.clone()
    }

    fn fire(&self, signals: Vec<EndpointSignal>, id: EndpointId) {
        for signal in signals {
            signal(id);
        }
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}
