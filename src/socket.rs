//! Datagram transport seam.
//!
//! [`Transport`] is the byte-level interface the sender and receiver loops
//! talk to. [`UdpTransport`] is the production implementation over a tokio
//! `UdpSocket`; [`crate::simulator::Simulator`] wraps any transport with a
//! fault model for tests. All protocol logic lives elsewhere; this module
//! owns only byte I/O and error classification.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;

/// A shared, connectionless datagram endpoint.
///
/// Every method takes `&self` so one transport can be shared by the sender
/// task and all receiver tasks.
pub trait Transport: Send + Sync + 'static {
    /// Send one datagram to `dest`.
    fn send_datagram(
        &self,
        bytes: &[u8],
        dest: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send;

    /// Wait until a datagram may be readable, for at most `timeout`.
    ///
    /// `Ok(false)` means the wait timed out. Readiness can be spurious, so
    /// callers must treat a following `WouldBlock` as "nothing yet".
    fn wait_readable(&self, timeout: Duration) -> impl Future<Output = io::Result<bool>> + Send;

    /// Non-blocking receive into `buf`; `WouldBlock` when nothing is queued.
    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> SocketAddr;
}

// ---------------------------------------------------------------------------
// UdpTransport
// ---------------------------------------------------------------------------

/// The real network.
#[derive(Debug)]
pub struct UdpTransport {
    /// Address this socket is bound to (filled in after the OS assigns an
    /// ephemeral port).
    local_addr: SocketAddr,
    inner: UdpSocket,
}

impl UdpTransport {
    /// Bind a new socket to `addr`.
    ///
    /// Passing port 0 lets the OS choose an ephemeral port.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let inner = UdpSocket::bind(addr).await?;
        let local_addr = inner.local_addr()?;
        log::debug!("[socket] bound {local_addr}");
        Ok(Self { local_addr, inner })
    }
}

impl Transport for UdpTransport {
    async fn send_datagram(&self, bytes: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(bytes, dest).await
    }

    async fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        match tokio::time::timeout(timeout, self.inner.readable()).await {
            Ok(ready) => ready.map(|()| true),
            Err(_elapsed) => Ok(false),
        }
    }

    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.try_recv_from(buf)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// `true` for errors a send or receive loop should log and retry past.
///
/// A peer that has not bound its socket yet (ICMP port unreachable surfacing
/// as `ConnectionRefused`/`ConnectionReset`) is routine here: retransmission
/// covers it.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
    )
}
