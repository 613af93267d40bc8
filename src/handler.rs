//! Accepts client traffic and routes it to per-client sessions.

use crate::{
    events::EventBus,
    listener::{Listener, UdpListener},
    origin::Origin,
    session::Session,
};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};

/// Owns the client-facing listener and the registry of live sessions,
/// keyed by client address.
pub struct Handler {
    listener: Arc<UdpListener>,
    server_addr: SocketAddr,
    events: Arc<EventBus>,
    sessions: HashMap<SocketAddr, flume::Sender<Vec<u8>>>,
}

impl Handler {
    pub async fn bind(
        bind_addr: SocketAddr,
        server_addr: SocketAddr,
        events: Arc<EventBus>,
    ) -> anyhow::Result<Self> {
        let listener = Arc::new(UdpListener::bind(bind_addr).await?);
        Ok(Self {
            listener,
            server_addr,
            events,
            sessions: HashMap::new(),
        })
    }

    /// The client-facing listener, shared across sessions.
    pub fn listener(&self) -> &Arc<UdpListener> {
        &self.listener
    }

    /// Accept loop: routes each inbound payload to its session, opening
    /// one on first contact. Returns once the listener is closed.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; 2048];
        loop {
            let Some((len, from)) = self.listener.recv_from(&mut buf).await? else {
                return Ok(());
            };
            let data = buf[..len].to_vec();

            let inbound = match self.sessions.get(&from) {
                Some(sender) if !sender.is_disconnected() => sender.clone(),
                _ => self.open_session(from).await?,
            };
            if inbound.send(data).is_err() {
                self.sessions.remove(&from);
            }
        }
    }

    async fn open_session(
        &mut self,
        client_addr: SocketAddr,
    ) -> anyhow::Result<flume::Sender<Vec<u8>>> {
        let server_listener = Arc::new(UdpListener::bind("0.0.0.0:0".parse()?).await?);
        let session = Session::new(
            client_addr,
            self.server_addr,
            Arc::clone(&self.listener) as Arc<dyn Listener>,
            Arc::clone(&server_listener) as Arc<dyn Listener>,
            Arc::clone(&self.events),
        );

        let (inbound_tx, inbound_rx) = flume::unbounded();
        tracing::info!(client = %client_addr, "opening session");
        tokio::spawn(drive(session, server_listener, inbound_rx, self.server_addr));
        self.sessions.insert(client_addr, inbound_tx.clone());
        Ok(inbound_tx)
    }
}

/// Runs one session to completion, interleaving client bytes handed
/// over by the handler with server bytes from the session's own socket.
/// All session state is mutated from this one task.
async fn drive(
    mut session: Session,
    server_listener: Arc<UdpListener>,
    inbound: flume::Receiver<Vec<u8>>,
    server_addr: SocketAddr,
) {
    let mut buf = vec![0u8; 2048];
    loop {
        let (origin, data) = tokio::select! {
            data = inbound.recv_async() => match data {
                Ok(data) => (Origin::Client, data),
                Err(_) => break,
            },
            received = server_listener.recv_from(&mut buf) => match received {
                Ok(Some((len, from))) => {
                    if from != server_addr {
                        tracing::trace!(%from, "ignoring datagram from an unexpected peer");
                        continue;
                    }
                    (Origin::Server, buf[..len].to_vec())
                }
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!(client = %session.client_addr(), "server socket error: {error}");
                    break;
                }
            },
        };

        if let Err(error) = session.handle(origin, data).await {
            if error.is_fatal() {
                tracing::warn!(client = %session.client_addr(), "fatal session error: {error}");
                break;
            }
            tracing::debug!(client = %session.client_addr(), "dropped packet: {error}");
        }
    }
    session.disconnect().await;
}
