//! The per-connection pipeline.
//!
//! A session terminates the reliable transport on both sides of one
//! client ↔ server connection: inbound datagrams are acknowledged,
//! deduplicated and reassembled, their batches unwrapped and inspected,
//! then re-packed, re-fragmented and re-stamped with the proxy's own
//! counters toward the opposite side. Intercepting the login and the
//! server handshake lets the proxy substitute its own key agreement on
//! each side, so the Encrypted state is readable in the middle.

use crate::{
    crypto::{self, CryptoError, KeyPair},
    events::{Event, EventBus},
    jwt::JwtError,
    listener::Listener,
    origin::Origin,
    protocol::{
        batch_codec::{BatchCodec, BatchPacket, CodecError},
        bedrock::{BedrockPacket, LoginPacket, ServerHandshakePacket},
        packet::{self, Ack, Datagram, DatagramKind, EncapsulatedPacket, Nack, Open2Reply, Open2Request},
        DecodeError, Decoder,
    },
    reliability::{Admission, OutboundChannel, ReliabilityError, ReliableWindow, SplitTable},
};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};

/// MTU a session starts from before the opener negotiates it down.
pub const DEFAULT_MTU: u16 = 1492;

/// Bytes reserved per datagram for RakNet framing and encapsulation
/// metadata when fragmenting to the MTU.
const FRAME_OVERHEAD: u16 = 60;

/// Connection lifecycle. Advances monotonically; the only downgrade is
/// the terminal return to `Offline` through [`Session::disconnect`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    Offline,
    Online,
    Encrypted,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("malformed packet: {0}")]
    Malformed(#[from] DecodeError),
    #[error(transparent)]
    Reliability(#[from] ReliabilityError),
    #[error(transparent)]
    Batch(#[from] CodecError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("malformed token: {0}")]
    Token(#[from] JwtError),
    #[error("data-out subscriber produced an empty payload or no destination")]
    Event,
    #[error("socket send failed: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Fatal errors tear the session down; the rest cost only the
    /// offending packet.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Malformed(_) | Self::Token(_) => false,
            Self::Batch(CodecError::Malformed(_)) => false,
            Self::Reliability(_) | Self::Batch(_) | Self::Crypto(_) | Self::Event | Self::Io(_) => {
                true
            }
        }
    }
}

/// Reliability state for one side of the connection: inbound state for
/// traffic received from that origin, outbound counters for traffic
/// re-originated toward it.
struct Direction {
    window: ReliableWindow,
    splits: SplitTable,
    outbound: OutboundChannel,
}

impl Direction {
    fn new() -> Self {
        Self {
            window: ReliableWindow::new(),
            splits: SplitTable::new(),
            outbound: OutboundChannel::new(),
        }
    }
}

/// One proxied client ↔ server connection.
pub struct Session {
    client_addr: SocketAddr,
    server_addr: SocketAddr,
    client_listener: Arc<dyn Listener>,
    server_listener: Arc<dyn Listener>,
    events: Arc<EventBus>,
    state: State,
    mtu_size: u16,
    client_direction: Direction,
    server_direction: Direction,
    key_pair: Option<KeyPair>,
    salt: Option<String>,
    client_batch: Option<BatchCodec>,
    server_batch: Option<BatchCodec>,
}

impl Session {
    pub fn new(
        client_addr: SocketAddr,
        server_addr: SocketAddr,
        client_listener: Arc<dyn Listener>,
        server_listener: Arc<dyn Listener>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            client_addr,
            server_addr,
            client_listener,
            server_listener,
            events,
            state: State::Offline,
            mtu_size: DEFAULT_MTU,
            client_direction: Direction::new(),
            server_direction: Direction::new(),
            key_pair: None,
            salt: None,
            client_batch: None,
            server_batch: None,
        }
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn mtu_size(&self) -> u16 {
        self.mtu_size
    }

    /// Feeds one UDP payload received from `origin` through the
    /// pipeline. Fatal errors require the caller to tear the session
    /// down via [`disconnect`](Self::disconnect).
    pub async fn handle(&mut self, origin: Origin, data: Vec<u8>) -> Result<(), SessionError> {
        let mut event = Event::DataIn { origin, data };
        if self.events.emit(&mut event).await.is_break() {
            return Ok(());
        }
        let Event::DataIn { data, .. } = event else {
            return Ok(());
        };

        match self.state {
            State::Offline => self.handle_offline(origin, data).await,
            State::Online | State::Encrypted => self.handle_online(origin, data).await,
        }
    }

    /// Terminal teardown: closes the server-facing listener and returns
    /// to `Offline`.
    pub async fn disconnect(&mut self) {
        self.server_listener.close();
        if self.state != State::Offline {
            self.set_state(State::Offline).await;
        }
        tracing::info!(client = %self.client_addr, "session disconnected");
    }

    /// Offline phase: forward bytes verbatim, watching the openers for
    /// the MTU and the Offline → Online transition.
    async fn handle_offline(&mut self, origin: Origin, data: Vec<u8>) -> Result<(), SessionError> {
        match data.first() {
            Some(&Open2Request::ID) => match Open2Request::decode(&mut Decoder::new(&data)) {
                Ok(request) => {
                    self.mtu_size = self.mtu_size.min(request.mtu_size);
                    tracing::debug!(client = %self.client_addr, mtu = self.mtu_size, "negotiated MTU");
                }
                Err(error) => {
                    tracing::warn!(%origin, "unreadable connection opener: {error}");
                }
            },
            Some(&Open2Reply::ID) if origin == Origin::Server => {
                self.set_state(State::Online).await;
            }
            _ => {}
        }
        self.send_raw(origin.opposite(), data).await
    }

    /// Online and Encrypted phases: route by the header byte.
    async fn handle_online(&mut self, origin: Origin, data: Vec<u8>) -> Result<(), SessionError> {
        let Some(&first) = data.first() else {
            return Ok(());
        };
        match packet::datagram_kind(first) {
            Some(DatagramKind::Datagram) => self.handle_datagram(origin, &data).await,
            Some(DatagramKind::Ack) => {
                let ack = Ack::decode(&mut Decoder::new(&data))?;
                tracing::trace!(%origin, records = ack.records.len(), "ack");
                Ok(())
            }
            Some(DatagramKind::Nack) => {
                let nack = Nack::decode(&mut Decoder::new(&data))?;
                tracing::debug!(%origin, records = ?nack.records, "nack ignored, endpoints retransmit");
                Ok(())
            }
            None => {
                tracing::trace!(%origin, first, "ignoring unclassified online message");
                Ok(())
            }
        }
    }

    async fn handle_datagram(&mut self, origin: Origin, data: &[u8]) -> Result<(), SessionError> {
        let datagram = Datagram::decode(&mut Decoder::new(data))?;
        tracing::trace!(
            %origin,
            sequence = datagram.sequence,
            packets = datagram.packets.len(),
            "datagram"
        );

        // Acknowledge to the origin before any application-layer handoff.
        self.send_raw(origin, Ack::single(datagram.sequence).to_bytes())
            .await?;

        for packet in datagram.packets {
            // Every fragment carries its own reliable index, so each one
            // passes the window independently, before reassembly.
            if packet.reliability.is_reliable() {
                match self.direction_mut(origin).window.admit(packet.index)? {
                    Admission::Accepted => {}
                    Admission::OutOfWindow => {
                        tracing::debug!(
                            %origin,
                            index = ?packet.index,
                            "reliable index outside the window, dropping"
                        );
                        continue;
                    }
                }
            }
            let Some(complete) = self.direction_mut(origin).splits.insert(packet)? else {
                continue;
            };
            self.handle_encapsulated(origin, complete).await?;
        }
        Ok(())
    }

    async fn handle_encapsulated(
        &mut self,
        origin: Origin,
        packet: EncapsulatedPacket,
    ) -> Result<(), SessionError> {
        match packet.sub.first() {
            Some(&BatchPacket::ID) => self.handle_batch(origin, packet).await,
            _ => self.forward(origin.opposite(), packet).await,
        }
    }

    /// Unwraps a batch, runs each inner Bedrock packet past the
    /// subscribers and the interceptors, and re-packs the survivors
    /// toward the opposite side.
    async fn handle_batch(
        &mut self,
        origin: Origin,
        carrier: EncapsulatedPacket,
    ) -> Result<(), SessionError> {
        // Codec selection is pinned before interception: the handshake
        // batch itself still travels unencrypted.
        let encrypted = self.state == State::Encrypted;
        let inner = if encrypted {
            match self.batch_codec(origin) {
                Some(codec) => codec.decode(&carrier.sub)?.packets,
                None => return Err(CodecError::Crypto.into()),
            }
        } else {
            BatchPacket::decode(&carrier.sub)?.packets
        };

        let mut forwarded = Vec::with_capacity(inner.len());
        for data in inner {
            let mut event = Event::BedrockIn { origin, data };
            if self.events.emit(&mut event).await.is_break() {
                continue;
            }
            let Event::BedrockIn { data, .. } = event else {
                continue;
            };

            let packet = BedrockPacket::decode(&data)?;
            tracing::trace!(%origin, packet = packet.as_ref(), id = packet.id(), "bedrock packet");
            let packet = match packet {
                BedrockPacket::Login(login) if origin == Origin::Client => {
                    if self.state != State::Online {
                        tracing::warn!(state = ?self.state, "login outside the Online state, dropping");
                        continue;
                    }
                    BedrockPacket::Login(self.intercept_login(login)?)
                }
                BedrockPacket::ServerHandshake(handshake) if origin == Origin::Server => {
                    if self.state != State::Online {
                        tracing::warn!(state = ?self.state, "handshake outside the Online state, dropping");
                        continue;
                    }
                    let (Some(key_pair), Some(salt)) = (self.key_pair.clone(), self.salt.clone())
                    else {
                        tracing::warn!("handshake before login interception, dropping");
                        continue;
                    };
                    let handshake = self.intercept_handshake(handshake, key_pair, salt)?;
                    self.set_state(State::Encrypted).await;
                    BedrockPacket::ServerHandshake(handshake)
                }
                BedrockPacket::ResourcePackResponse(response) => {
                    tracing::info!(
                        client = %self.client_addr,
                        status = response.status,
                        packs = ?response.pack_ids,
                        "resource pack response"
                    );
                    BedrockPacket::ResourcePackResponse(response)
                }
                other => other,
            };

            let mut event = Event::BedrockOut {
                origin,
                data: packet.encode(),
            };
            if self.events.emit(&mut event).await.is_break() {
                continue;
            }
            let Event::BedrockOut { data, .. } = event else {
                continue;
            };
            forwarded.push(data);
        }

        if forwarded.is_empty() {
            return Ok(());
        }

        let toward = origin.opposite();
        let batch = BatchPacket::new(forwarded);
        let bytes = if encrypted {
            match self.batch_codec(toward) {
                Some(codec) => codec.encode(&batch)?,
                None => return Err(CodecError::Crypto.into()),
            }
        } else {
            batch.encode()?
        };

        let mut packet = carrier;
        packet.sub = bytes;
        packet.split = None;
        self.forward(toward, packet).await
    }

    /// The nine-step login interception: a fresh key pair and salt, the
    /// client-side secret, and the proxy's key substituted into the
    /// chain the server will see.
    fn intercept_login(&mut self, mut login: LoginPacket) -> Result<LoginPacket, SessionError> {
        let key_pair = KeyPair::generate();
        let salt = crypto::random_salt();

        let last = login
            .tokens
            .last_mut()
            .ok_or(JwtError::MissingClaim("identityPublicKey"))?;
        let client_key = crypto::parse_public_key(last.payload_claim("identityPublicKey")?)?;
        let secret = crypto::diffie_hellman(&key_pair, &client_key, &salt)?;
        self.client_batch = Some(BatchCodec::new(secret, Origin::Client));

        last.payload["identityPublicKey"] = json!(key_pair.public_key_base64());
        last.sign(&key_pair);
        login.client.sign(&key_pair);

        tracing::info!(client = %self.client_addr, "substituted key pair into login chain");
        self.key_pair = Some(key_pair);
        self.salt = Some(salt);
        Ok(login)
    }

    /// The server-side half: derive the server secret from the token's
    /// key and salt, then re-key the token to the salt the client
    /// expects from us.
    fn intercept_handshake(
        &mut self,
        mut handshake: ServerHandshakePacket,
        key_pair: KeyPair,
        salt: String,
    ) -> Result<ServerHandshakePacket, SessionError> {
        let server_key = crypto::parse_public_key(handshake.token.header_claim("x5u")?)?;
        let server_salt = handshake.token.payload_claim("salt")?.to_owned();
        let secret = crypto::diffie_hellman(&key_pair, &server_key, &server_salt)?;
        self.server_batch = Some(BatchCodec::new(secret, Origin::Server));

        handshake.token.payload["salt"] = json!(salt);
        handshake.token.sign(&key_pair);

        tracing::info!(client = %self.client_addr, "re-keyed server handshake");
        Ok(handshake)
    }

    /// Re-frames one logical packet toward `toward`: fragment to the
    /// MTU, stamp fresh counters, wrap each fragment in its own
    /// datagram, send.
    async fn forward(
        &mut self,
        toward: Origin,
        source: EncapsulatedPacket,
    ) -> Result<(), SessionError> {
        let max_payload = usize::from(self.mtu_size.saturating_sub(FRAME_OVERHEAD).max(1));
        let channel = &mut self.direction_mut(toward).outbound;
        let mut datagrams = Vec::new();
        for fragment in channel.fragment(source, max_payload) {
            datagrams.push(channel.wrap(fragment).to_bytes());
        }
        for bytes in datagrams {
            self.send_raw(toward, bytes).await?;
        }
        Ok(())
    }

    /// Emits `data-out` and sends the payload on the listener facing
    /// `toward`.
    async fn send_raw(&mut self, toward: Origin, data: Vec<u8>) -> Result<(), SessionError> {
        let mut event = Event::DataOut {
            toward,
            data,
            to: Some(self.peer_addr(toward)),
        };
        if self.events.emit(&mut event).await.is_break() {
            return Ok(());
        }
        let Event::DataOut { data, to, .. } = event else {
            return Ok(());
        };
        let to = to.ok_or(SessionError::Event)?;
        if data.is_empty() {
            return Err(SessionError::Event);
        }

        let listener = match toward {
            Origin::Client => &self.client_listener,
            Origin::Server => &self.server_listener,
        };
        listener.send(&data, to).await?;
        Ok(())
    }

    async fn set_state(&mut self, state: State) {
        self.state = state;
        tracing::info!(client = %self.client_addr, ?state, "session state changed");
        let mut event = Event::State { state };
        let _ = self.events.emit(&mut event).await;
    }

    fn direction_mut(&mut self, origin: Origin) -> &mut Direction {
        match origin {
            Origin::Client => &mut self.client_direction,
            Origin::Server => &mut self.server_direction,
        }
    }

    fn batch_codec(&self, origin: Origin) -> Option<&BatchCodec> {
        match origin {
            Origin::Client => self.client_batch.as_ref(),
            Origin::Server => self.server_batch.as_ref(),
        }
    }

    fn peer_addr(&self, toward: Origin) -> SocketAddr {
        match toward {
            Origin::Client => self.client_addr,
            Origin::Server => self.server_addr,
        }
    }
}
