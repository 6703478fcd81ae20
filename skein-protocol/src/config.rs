//! Configuration for the protocol plane.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Configuration for one protocol layer instance.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Pin the first version's message listener to this port instead of
    /// letting the substrate auto-assign one.
    pub tcp_port: Option<u16>,

    /// Local address to bind listeners on. Defaults to the loopback
    /// address; deployments that should be reachable from other machines
    /// override this with a routable address.
    pub tcp_base_address: IpAddr,

    /// How long a registered response waiter lives before it resolves with
    /// a timeout. Also bounds handshake negotiation.
    pub wait_for_response_timeout: Duration,

    /// How long an approved peer may go unprobed. Any confirmed traffic
    /// pushes the next probe out by this much.
    pub max_time_between_connection_confirmations: Duration,

    /// Consecutive failed probes tolerated before an approved peer is
    /// evicted.
    pub max_missed_keep_alive_signals: u32,

    /// Tick period of the connection monitor loop.
    pub keep_alive_interval: Duration,

    /// Timeout for establishing one transport stream.
    pub connect_timeout: Duration,

    /// Receiver-host faults tolerated inside [`Self::host_restart_window`]
    /// before the host stops for good.
    pub max_host_restarts: u32,

    /// Window over which receiver-host faults are counted.
    pub host_restart_window: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            tcp_port: None,
            tcp_base_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            wait_for_response_timeout: Duration::from_secs(5),
            max_time_between_connection_confirmations: Duration::from_secs(5),
            max_missed_keep_alive_signals: 5,
            keep_alive_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            max_host_restarts: 5,
            host_restart_window: Duration::from_secs(10),
        }
    }
}

impl ProtocolConfig {
    /// Configuration tuned for low-latency local networks.
    pub fn local_network() -> Self {
        Self {
            wait_for_response_timeout: Duration::from_secs(1),
            max_time_between_connection_confirmations: Duration::from_secs(2),
            max_missed_keep_alive_signals: 3,
            keep_alive_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }

    /// Configuration tuned for high-latency WAN links.
    pub fn wan_network() -> Self {
        Self {
            wait_for_response_timeout: Duration::from_secs(30),
            max_time_between_connection_confirmations: Duration::from_secs(60),
            max_missed_keep_alive_signals: 5,
            keep_alive_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            ..Self::default()
        }
    }

    /// Pin the first version's message listener port.
    pub fn with_tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = Some(port);
        self
    }

    /// Override the local bind address.
    pub fn with_base_address(mut self, addr: IpAddr) -> Self {
        self.tcp_base_address = addr;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_no_pinned_port() {
        let config = ProtocolConfig::default();
        assert!(config.tcp_port.is_none());
        assert!(config.tcp_base_address.is_loopback());
    }

    #[test]
    fn local_network_is_tighter_than_default() {
        let local = ProtocolConfig::local_network();
        let default = ProtocolConfig::default();
        assert!(local.keep_alive_interval < default.keep_alive_interval);
        assert!(local.wait_for_response_timeout < default.wait_for_response_timeout);
    }

    #[test]
    fn builders_apply() {
        let config = ProtocolConfig::default()
            .with_tcp_port(4500)
            .with_base_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.tcp_port, Some(4500));
        assert_eq!(config.tcp_base_address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }
}
