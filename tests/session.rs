//! End-to-end tests of one proxied session, driven through in-memory
//! listeners so every byte on both sides can be observed.

use aes::{
    cipher::{consts::U16, generic_array::GenericArray},
    Aes256,
};
use aes_gcm::{
    aead::{Aead, KeyInit},
    AesGcm, Key, Nonce,
};
use async_trait::async_trait;
use cfb8::cipher::{BlockEncryptMut, KeyIvInit};
use minecraft_raknet_proxy::{
    crypto::{self, KeyPair},
    events::{Event, EventBus, Subscriber},
    jwt::Jwt,
    listener::Listener,
    protocol::{
        batch_codec::BatchPacket,
        bedrock::{BedrockPacket, LoginPacket, ServerHandshakePacket, UnknownPacket},
        packet::{Ack, AckRecord, Datagram, EncapsulatedPacket, Open2Reply, Open2Request, Split},
        Decoder,
    },
    reliability::ReliabilityError,
    session::SessionError,
    Origin, Session, State,
};
use serde_json::json;
use std::{
    io,
    net::SocketAddr,
    ops::ControlFlow,
    sync::Arc,
};

const CLIENT_ADDR: &str = "127.0.0.1:53123";
const SERVER_ADDR: &str = "127.0.0.1:19134";

struct MockListener {
    sent: flume::Sender<(Vec<u8>, SocketAddr)>,
}

#[async_trait]
impl Listener for MockListener {
    async fn send(&self, data: &[u8], to: SocketAddr) -> io::Result<()> {
        self.sent
            .send((data.to_vec(), to))
            .map_err(|_| io::ErrorKind::BrokenPipe.into())
    }

    fn close(&self) {}
}

struct Harness {
    session: Session,
    to_client: flume::Receiver<(Vec<u8>, SocketAddr)>,
    to_server: flume::Receiver<(Vec<u8>, SocketAddr)>,
}

fn harness_with_events(events: EventBus) -> Harness {
    let (client_tx, to_client) = flume::unbounded();
    let (server_tx, to_server) = flume::unbounded();
    let session = Session::new(
        CLIENT_ADDR.parse().unwrap(),
        SERVER_ADDR.parse().unwrap(),
        Arc::new(MockListener { sent: client_tx }),
        Arc::new(MockListener { sent: server_tx }),
        Arc::new(events),
    );
    Harness {
        session,
        to_client,
        to_server,
    }
}

fn harness() -> Harness {
    harness_with_events(EventBus::new())
}

impl Harness {
    async fn go_online(&mut self) {
        let request = Open2Request {
            server_address: SERVER_ADDR.parse().unwrap(),
            mtu_size: 1492,
            client_guid: 1,
        };
        self.session
            .handle(Origin::Client, request.to_bytes())
            .await
            .unwrap();
        let reply = Open2Reply {
            server_guid: 2,
            client_address: CLIENT_ADDR.parse().unwrap(),
            mtu_size: 1492,
            encryption: false,
        };
        self.session
            .handle(Origin::Server, reply.to_bytes())
            .await
            .unwrap();
        assert_eq!(self.session.state(), State::Online);
        self.drain_client();
        self.drain_server();
    }

    fn drain_client(&self) -> Vec<Vec<u8>> {
        self.to_client.try_iter().map(|(data, _)| data).collect()
    }

    fn drain_server(&self) -> Vec<Vec<u8>> {
        self.to_server.try_iter().map(|(data, _)| data).collect()
    }
}

fn reliable_datagram(sequence: u32, index: u32, sub: Vec<u8>) -> Vec<u8> {
    let mut packet = EncapsulatedPacket::reliable(sub);
    packet.index = Some(index);
    Datagram::single(sequence, packet).to_bytes()
}

fn split_fragment_datagram(sequence: u32, index: u32, split: Split, sub: Vec<u8>) -> Vec<u8> {
    let mut packet = EncapsulatedPacket::reliable(sub);
    packet.index = Some(index);
    packet.split = Some(split);
    Datagram::single(sequence, packet).to_bytes()
}

fn parse_datagram(bytes: &[u8]) -> Datagram {
    Datagram::decode(&mut Decoder::new(bytes)).unwrap()
}

fn assert_single_ack(bytes: &[u8], sequence: u32) {
    let ack = Ack::decode(&mut Decoder::new(bytes)).unwrap();
    assert_eq!(ack.records, vec![AckRecord::Single(sequence)]);
}

#[tokio::test]
async fn mtu_negotiation_observes_and_forwards_verbatim() {
    let mut harness = harness();
    let request = Open2Request {
        server_address: SERVER_ADDR.parse().unwrap(),
        mtu_size: 900,
        client_guid: 77,
    };
    let bytes = request.to_bytes();
    harness
        .session
        .handle(Origin::Client, bytes.clone())
        .await
        .unwrap();

    assert_eq!(harness.session.mtu_size(), 900);
    assert_eq!(harness.session.state(), State::Offline);
    assert_eq!(harness.drain_server(), vec![bytes]);
    assert!(harness.drain_client().is_empty());
}

#[tokio::test]
async fn open2_reply_moves_the_session_online() {
    let mut harness = harness();
    harness.go_online().await;
}

#[tokio::test]
async fn mtu_only_ever_shrinks() {
    let mut harness = harness();
    for mtu in [1400, 900, 1200] {
        let request = Open2Request {
            server_address: SERVER_ADDR.parse().unwrap(),
            mtu_size: mtu,
            client_guid: 1,
        };
        harness
            .session
            .handle(Origin::Client, request.to_bytes())
            .await
            .unwrap();
    }
    assert_eq!(harness.session.mtu_size(), 900);
}

#[tokio::test]
async fn large_payload_is_split_and_concatenates_back() {
    let mut harness = harness();
    harness.go_online().await;

    let payload: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
    harness
        .session
        .handle(Origin::Client, reliable_datagram(0, 0, payload.clone()))
        .await
        .unwrap();

    let acks = harness.drain_client();
    assert_eq!(acks.len(), 1);
    assert_single_ack(&acks[0], 0);

    let outbound = harness.drain_server();
    assert_eq!(outbound.len(), 3);
    let mut rejoined = Vec::new();
    for (i, bytes) in outbound.iter().enumerate() {
        let datagram = parse_datagram(bytes);
        assert_eq!(datagram.sequence, i as u32);
        assert_eq!(datagram.packets.len(), 1);
        let split = datagram.packets[0].split.unwrap();
        assert_eq!(split.count, 3);
        assert_eq!(split.index, i as u32);
        rejoined.extend_from_slice(&datagram.packets[0].sub);
    }
    assert_eq!(rejoined, payload);
}

#[tokio::test]
async fn inbound_split_set_is_reassembled_before_forwarding() {
    let mut harness = harness();
    harness.go_online().await;

    let payload: Vec<u8> = (0..600u32).map(|i| (i * 7) as u8).collect();
    for (i, chunk) in payload.chunks(200).enumerate() {
        let i = i as u32;
        let split = Split {
            id: 12,
            index: i,
            count: 3,
        };
        harness
            .session
            .handle(
                Origin::Client,
                split_fragment_datagram(i, i, split, chunk.to_vec()),
            )
            .await
            .unwrap();
    }

    let outbound = harness.drain_server();
    assert_eq!(outbound.len(), 1);
    let datagram = parse_datagram(&outbound[0]);
    assert!(datagram.packets[0].split.is_none());
    assert_eq!(datagram.packets[0].sub, payload);
}

#[tokio::test]
async fn window_advances_past_every_split_fragment_index() {
    let mut harness = harness();
    harness.go_online().await;

    for i in 0..3u32 {
        let split = Split {
            id: 4,
            index: i,
            count: 3,
        };
        harness
            .session
            .handle(
                Origin::Client,
                split_fragment_datagram(i, i, split, vec![i as u8; 50]),
            )
            .await
            .unwrap();
    }
    assert_eq!(harness.drain_server().len(), 1);
    harness.drain_client();

    // The contiguous slide has consumed indices 0..=2: replaying any of
    // them now falls below the window and is dropped without output.
    for (sequence, index) in [(3, 0), (4, 1), (5, 2)] {
        harness
            .session
            .handle(Origin::Client, reliable_datagram(sequence, index, vec![7]))
            .await
            .unwrap();
    }
    assert!(harness.drain_server().is_empty());

    // Index 3 is the new window start and goes through.
    harness
        .session
        .handle(Origin::Client, reliable_datagram(6, 3, vec![7]))
        .await
        .unwrap();
    assert_eq!(harness.drain_server().len(), 1);
}

#[tokio::test]
async fn reused_index_on_a_non_completing_fragment_is_fatal() {
    let mut harness = harness();
    harness.go_online().await;

    // Fragment 0 of 3 under reliable index 1; the set never completes,
    // so nothing is forwarded, but the index is admitted.
    let split = Split {
        id: 5,
        index: 0,
        count: 3,
    };
    harness
        .session
        .handle(
            Origin::Client,
            split_fragment_datagram(0, 1, split, vec![1; 50]),
        )
        .await
        .unwrap();
    assert!(harness.drain_server().is_empty());

    // A different fragment replaying the same reliable index must hit
    // the window dedup, not just the split table's own.
    let split = Split {
        id: 5,
        index: 1,
        count: 3,
    };
    let error = harness
        .session
        .handle(
            Origin::Client,
            split_fragment_datagram(1, 1, split, vec![2; 50]),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        SessionError::Reliability(ReliabilityError::DuplicateIndex(1))
    ));
    assert!(error.is_fatal());
}

#[tokio::test]
async fn out_of_window_index_is_dropped_but_still_acknowledged() {
    let mut harness = harness();
    harness.go_online().await;

    harness
        .session
        .handle(Origin::Client, reliable_datagram(9, 5000, vec![1, 2, 3]))
        .await
        .unwrap();

    let acks = harness.drain_client();
    assert_eq!(acks.len(), 1);
    assert_single_ack(&acks[0], 9);
    assert!(harness.drain_server().is_empty());
}

#[tokio::test]
async fn duplicate_reliable_index_is_fatal() {
    let mut harness = harness();
    harness.go_online().await;

    for (sequence, index) in [(0, 0), (1, 2)] {
        harness
            .session
            .handle(Origin::Client, reliable_datagram(sequence, index, vec![7]))
            .await
            .unwrap();
    }
    let error = harness
        .session
        .handle(Origin::Client, reliable_datagram(2, 2, vec![7]))
        .await
        .unwrap_err();
    assert!(error.is_fatal());
}

#[tokio::test]
async fn online_batch_is_unwrapped_and_repacked() {
    let mut harness = harness();
    harness.go_online().await;

    let inner = BedrockPacket::Unknown(UnknownPacket {
        id: 0x9c,
        body: vec![1, 2, 3, 4],
    })
    .encode();
    let batch = BatchPacket::new(vec![inner.clone()]).encode().unwrap();
    harness
        .session
        .handle(Origin::Client, reliable_datagram(0, 0, batch))
        .await
        .unwrap();

    let outbound = harness.drain_server();
    assert_eq!(outbound.len(), 1);
    let datagram = parse_datagram(&outbound[0]);
    let repacked = BatchPacket::decode(&datagram.packets[0].sub).unwrap();
    assert_eq!(repacked.packets, vec![inner]);
}

#[tokio::test]
async fn nack_is_ignored() {
    let mut harness = harness();
    harness.go_online().await;

    let mut bytes = Vec::new();
    let nack = minecraft_raknet_proxy::protocol::packet::Nack {
        records: vec![AckRecord::Range { start: 0, end: 4 }],
    };
    nack.encode(&mut minecraft_raknet_proxy::protocol::Encoder::new(&mut bytes));
    harness.session.handle(Origin::Server, bytes).await.unwrap();

    assert!(harness.drain_client().is_empty());
    assert!(harness.drain_server().is_empty());
}

struct CancelDataIn;

#[async_trait]
impl Subscriber for CancelDataIn {
    async fn handle(&self, event: &mut Event) -> ControlFlow<()> {
        if matches!(event, Event::DataIn { .. }) {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

#[tokio::test]
async fn cancelled_data_in_is_dropped_entirely() {
    let mut events = EventBus::new();
    events.subscribe(Box::new(CancelDataIn));
    let mut harness = harness_with_events(events);

    let request = Open2Request {
        server_address: SERVER_ADDR.parse().unwrap(),
        mtu_size: 800,
        client_guid: 1,
    };
    harness
        .session
        .handle(Origin::Client, request.to_bytes())
        .await
        .unwrap();

    assert_eq!(harness.session.mtu_size(), minecraft_raknet_proxy::DEFAULT_MTU);
    assert!(harness.drain_server().is_empty());
}

struct EmptyDataOut;

#[async_trait]
impl Subscriber for EmptyDataOut {
    async fn handle(&self, event: &mut Event) -> ControlFlow<()> {
        if let Event::DataOut { data, .. } = event {
            data.clear();
        }
        ControlFlow::Continue(())
    }
}

#[tokio::test]
async fn empty_data_out_payload_is_fatal() {
    let mut events = EventBus::new();
    events.subscribe(Box::new(EmptyDataOut));
    let mut harness = harness_with_events(events);

    let request = Open2Request {
        server_address: SERVER_ADDR.parse().unwrap(),
        mtu_size: 800,
        client_guid: 1,
    };
    let error = harness
        .session
        .handle(Origin::Client, request.to_bytes())
        .await
        .unwrap_err();
    assert!(error.is_fatal());
}

type BatchCipher = AesGcm<Aes256, U16>;

/// Opens a proxy-sealed batch the way the receiving endpoint would:
/// GCM under the shared secret, then zlib.
fn gcm_open(secret: &[u8; 32], sealed: &[u8]) -> Vec<u8> {
    use std::io::Read;

    assert_eq!(sealed[0], 0xfe);
    let cipher = BatchCipher::new(Key::<BatchCipher>::from_slice(secret));
    let body = cipher
        .decrypt(Nonce::<U16>::from_slice(&secret[..16]), &sealed[1..])
        .expect("proxy output must open under the shared secret");

    let mut inflated = Vec::new();
    flate2::read::ZlibDecoder::new(body.as_slice())
        .read_to_end(&mut inflated)
        .unwrap();
    inflated
}

fn cfb8_seal(secret: &[u8; 32], batch: &BatchPacket) -> Vec<u8> {
    let mut bytes = batch.encode().unwrap();
    let mut encryptor =
        cfb8::Encryptor::<Aes256>::new_from_slices(secret, &secret[..16]).unwrap();
    for byte in bytes[1..].iter_mut() {
        encryptor.encrypt_block_mut(GenericArray::from_mut_slice(std::slice::from_mut(byte)));
    }
    bytes
}

fn signed_token(key_pair: &KeyPair, payload: serde_json::Value) -> Jwt {
    let mut token = Jwt::new(json!({}), payload);
    token.sign(key_pair);
    token
}

fn batch_datagram(sequence: u32, index: u32, packet: &BedrockPacket) -> Vec<u8> {
    let batch = BatchPacket::new(vec![packet.encode()]).encode().unwrap();
    reliable_datagram(sequence, index, batch)
}

fn unwrap_single_bedrock(datagram_bytes: &[u8]) -> BedrockPacket {
    let datagram = parse_datagram(datagram_bytes);
    assert_eq!(datagram.packets.len(), 1);
    let batch = BatchPacket::decode(&datagram.packets[0].sub).unwrap();
    assert_eq!(batch.packets.len(), 1);
    BedrockPacket::decode(&batch.packets[0]).unwrap()
}

#[tokio::test]
async fn full_handshake_re_keys_both_sides_and_relays_encrypted_batches() {
    let mut harness = harness();
    harness.go_online().await;

    // The client logs in with its real identity key.
    let client_keys = KeyPair::generate();
    let login = LoginPacket {
        protocol_version: 390,
        tokens: vec![signed_token(
            &client_keys,
            json!({ "identityPublicKey": client_keys.public_key_base64() }),
        )],
        client: signed_token(&client_keys, json!({ "DeviceModel": "test" })),
    };
    harness
        .session
        .handle(
            Origin::Client,
            batch_datagram(0, 0, &BedrockPacket::Login(login)),
        )
        .await
        .unwrap();

    // The login reaching the server must carry the proxy's key instead.
    let outbound = harness.drain_server();
    assert_eq!(outbound.len(), 1);
    let BedrockPacket::Login(forwarded) = unwrap_single_bedrock(&outbound[0]) else {
        panic!("expected a login packet");
    };
    let last = forwarded.tokens.last().unwrap();
    let proxy_key_b64 = last.header_claim("x5u").unwrap().to_owned();
    assert_ne!(proxy_key_b64, client_keys.public_key_base64());
    assert_eq!(last.payload_claim("identityPublicKey").unwrap(), proxy_key_b64);
    let proxy_key = crypto::parse_public_key(&proxy_key_b64).unwrap();
    assert!(last.verify(&proxy_key));
    assert!(forwarded.client.verify(&proxy_key));
    harness.drain_client();

    // The server answers with its half of the key agreement.
    let server_keys = KeyPair::generate();
    let server_salt = crypto::random_salt();
    let handshake = ServerHandshakePacket {
        token: signed_token(&server_keys, json!({ "salt": server_salt })),
    };
    harness
        .session
        .handle(
            Origin::Server,
            batch_datagram(0, 0, &BedrockPacket::ServerHandshake(handshake)),
        )
        .await
        .unwrap();
    assert_eq!(harness.session.state(), State::Encrypted);

    // The handshake reaching the client is re-keyed to the proxy's salt
    // and key pair, and still travels unencrypted. (The acknowledgement
    // went back to the server side.)
    let outbound = harness.drain_client();
    assert_eq!(outbound.len(), 1);
    let BedrockPacket::ServerHandshake(forwarded) = unwrap_single_bedrock(&outbound[0]) else {
        panic!("expected a handshake packet");
    };
    assert!(forwarded.token.verify(&proxy_key));
    assert_eq!(forwarded.token.header_claim("x5u").unwrap(), proxy_key_b64);
    let proxy_salt = forwarded.token.payload_claim("salt").unwrap().to_owned();
    assert_ne!(proxy_salt, server_salt);

    // Both shared secrets are reconstructible from the endpoints' side.
    let secret_client = crypto::diffie_hellman(&client_keys, &proxy_key, &proxy_salt).unwrap();
    let secret_server = crypto::diffie_hellman(&server_keys, &proxy_key, &server_salt).unwrap();

    // An encrypted batch from the server is re-encrypted toward the
    // client under the client-side secret.
    let game_packet = BedrockPacket::Unknown(UnknownPacket {
        id: 0x9c,
        body: vec![1, 2, 3],
    });
    let inbound = cfb8_seal(&secret_server, &BatchPacket::new(vec![game_packet.encode()]));
    harness
        .session
        .handle(Origin::Server, reliable_datagram(1, 1, inbound))
        .await
        .unwrap();

    let outbound = harness.drain_client();
    assert_eq!(outbound.len(), 1);
    let datagram = parse_datagram(&outbound[0]);
    let body = gcm_open(&secret_client, &datagram.packets[0].sub);
    let mut decoder = Decoder::new(&body);
    let record = decoder.read_var_slice().unwrap();
    assert_eq!(record, game_packet.encode());
    assert!(decoder.is_finished());
}
