//! The network seam between a worker and its target.
//!
//! A [`Transport`] knows how to reach the endpoint and hands each worker an
//! exclusively-owned [`Connection`]. The production transport is connected
//! UDP, [`Udp`]. Writes are fire-and-forget: nothing is read back.

use std::{
    fmt, io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
};

use async_trait::async_trait;
use tokio::net::{UdpSocket, lookup_host};
use tracing::trace;

/// The largest payload a single UDP datagram may carry over IPv4.
pub const MAX_DATAGRAM_BYTES: usize = 65_507;

#[async_trait]
/// Source of outbound connections, shared by every worker.
pub trait Transport: Send + Sync + fmt::Debug {
    /// The connection type handed to each worker.
    type Connection: Connection;

    /// Open one connection to the endpoint.
    async fn connect(&self) -> io::Result<Self::Connection>;

    /// The endpoint, for diagnostics.
    fn endpoint(&self) -> &str;
}

#[async_trait]
/// A single worker's connection. Dropping it closes it.
pub trait Connection: Send {
    /// Write `datagram` as one transmission, returning the bytes written.
    async fn transmit(&mut self, datagram: &[u8]) -> io::Result<usize>;
}

#[derive(Debug, Clone)]
/// Connected UDP transport.
pub struct Udp {
    addr: String,
}

impl Udp {
    /// Create a new [`Udp`] transport for `addr`, a `host:port` string.
    ///
    /// Resolution is deferred to [`Transport::connect`] so that a bad address
    /// surfaces as a per-worker connection failure.
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Transport for Udp {
    type Connection = UdpConnection;

    async fn connect(&self) -> io::Result<UdpConnection> {
        let peer = lookup_host(self.addr.as_str()).await?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{} did not resolve to any address", self.addr),
            )
        })?;
        let local: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        trace!("UDP socket {:?} connected to {peer}", socket.local_addr());
        Ok(UdpConnection { socket })
    }

    fn endpoint(&self) -> &str {
        &self.addr
    }
}

#[derive(Debug)]
/// A UDP socket connected to the endpoint.
pub struct UdpConnection {
    socket: UdpSocket,
}

#[async_trait]
impl Connection for UdpConnection {
    async fn transmit(&mut self, datagram: &[u8]) -> io::Result<usize> {
        self.socket.send(datagram).await
    }
}
