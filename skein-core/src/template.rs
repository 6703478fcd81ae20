//! Transport substrate contract.
//!
//! A [`ChannelTemplate`] describes one transport family (TCP today; a
//! named-pipe or in-memory template is the same shape) from which the
//! protocol plane instantiates concrete message and data channels per
//! protocol version. The plane owns framing, retry and lifecycle; the
//! template only produces byte streams and listeners.
//!
//! The contract the protocol plane relies on:
//!
//! - one listener per (template, protocol version, plane);
//! - one client-initiated stream per (local peer, remote peer, version)
//!   for messages and another for data;
//! - a faulted stream is observable through I/O errors and recoverable by
//!   asking the template for a fresh stream;
//! - delivery is at-least-once for a single successful write; callers
//!   handle retry.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::NetworkAddress;

/// One transport family from which channels are instantiated.
///
/// Cloning a template is cheap; every sender pool and receiver host holds
/// its own copy.
#[async_trait]
pub trait ChannelTemplate: Clone + Send + Sync + 'static {
    /// The byte stream this template produces.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    /// The listener this template produces.
    type Listener: ChannelListener<Stream = Self::Stream>;

    /// Open an outbound stream to a remote connection point.
    async fn connect(&self, addr: &NetworkAddress) -> io::Result<Self::Stream>;

    /// Bind a listener on a local connection point.
    ///
    /// Binding to port 0 asks the substrate for an auto-assigned port; the
    /// actual port is available through [`ChannelListener::local_addr`].
    async fn bind(&self, addr: &NetworkAddress) -> io::Result<Self::Listener>;
}

/// A listener accepting inbound streams for one connection point.
#[async_trait]
pub trait ChannelListener: Send + Sync + 'static {
    /// The byte stream this listener produces.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Accept a single inbound stream, returning it with the remote address.
    async fn accept(&self) -> io::Result<(Self::Stream, NetworkAddress)>;

    /// The address this listener is actually bound to.
    fn local_addr(&self) -> io::Result<NetworkAddress>;
}

/// TCP transport family over the Tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct TcpChannelTemplate;

impl TcpChannelTemplate {
    /// Create a new TCP template.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChannelTemplate for TcpChannelTemplate {
    type Stream = tokio::net::TcpStream;
    type Listener = TcpListener;

    async fn connect(&self, addr: &NetworkAddress) -> io::Result<Self::Stream> {
        let stream = tokio::net::TcpStream::connect(std::net::SocketAddr::from(*addr)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn bind(&self, addr: &NetworkAddress) -> io::Result<Self::Listener> {
        let listener = tokio::net::TcpListener::bind(std::net::SocketAddr::from(*addr)).await?;
        Ok(TcpListener { inner: listener })
    }
}

/// Wrapper for the Tokio TCP listener implementing [`ChannelListener`].
#[derive(Debug)]
pub struct TcpListener {
    inner: tokio::net::TcpListener,
}

#[async_trait]
impl ChannelListener for TcpListener {
    type Stream = tokio::net::TcpStream;

    async fn accept(&self) -> io::Result<(Self::Stream, NetworkAddress)> {
        let (stream, addr) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, NetworkAddress::from(addr)))
    }

    fn local_addr(&self) -> io::Result<NetworkAddress> {
        Ok(NetworkAddress::from(self.inner.local_addr()?))
    }
}
