//! UDP listener plumbing.
//!
//! Sessions talk to their sockets through the [`Listener`] capability so
//! the pipeline can be driven by in-memory listeners in tests. The
//! handler shares one client-facing [`UdpListener`] across all sessions;
//! each session owns a server-facing one.

use async_trait::async_trait;
use std::{
    io,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
};
use tokio::{net::UdpSocket, sync::Notify};

/// Send-side capability of a datagram socket.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn send(&self, data: &[u8], to: SocketAddr) -> io::Result<()>;

    /// Tears the listener down. Pending and future receives resolve to
    /// "closed"; sends fail.
    fn close(&self);
}

/// A [`Listener`] over a bound UDP socket.
pub struct UdpListener {
    socket: UdpSocket,
    shutdown: Notify,
    closed: AtomicBool,
}

impl UdpListener {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind(addr).await?,
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Waits for the next datagram. Returns `None` once the listener is
    /// closed.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        tokio::select! {
            _ = self.shutdown.notified() => Ok(None),
            received = self.socket.recv_from(buf) => received.map(Some),
        }
    }
}

#[async_trait]
impl Listener for UdpListener {
    async fn send(&self, data: &[u8], to: SocketAddr) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.socket.send_to(data, to).await.map(|_| ())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.notify_one();
    }
}
