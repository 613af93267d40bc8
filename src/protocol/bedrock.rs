//! Bedrock application packets carried inside batches.
//!
//! Full parsing is _not_ implemented. Only the packets the proxy
//! inspects are decoded into fields; every other id keeps its body as
//! raw bytes, which enables roundtrip encoding/decoding without loss
//! of information.

use crate::{
    jwt::Jwt,
    protocol::{DecodeError, Decoder, Encoder},
};
use serde_json::{json, Value};

/// A single Bedrock packet: a varint id followed by its body.
#[derive(Debug, Clone, strum::AsRefStr)]
pub enum BedrockPacket {
    Login(LoginPacket),
    ServerHandshake(ServerHandshakePacket),
    ResourcePackResponse(ResourcePackResponsePacket),
    Unknown(UnknownPacket),
}

impl BedrockPacket {
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(data);
        let id = decoder.read_var_u32()?;
        Ok(match id {
            LoginPacket::ID => Self::Login(LoginPacket::decode_body(&mut decoder)?),
            ServerHandshakePacket::ID => {
                Self::ServerHandshake(ServerHandshakePacket::decode_body(&mut decoder)?)
            }
            ResourcePackResponsePacket::ID => {
                Self::ResourcePackResponse(ResourcePackResponsePacket::decode_body(&mut decoder)?)
            }
            id => Self::Unknown(UnknownPacket {
                id,
                body: decoder.buffer().to_vec(),
            }),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut encoder = Encoder::new(&mut buf);
        encoder.write_var_u32(self.id());
        match self {
            Self::Login(packet) => packet.encode_body(&mut encoder),
            Self::ServerHandshake(packet) => packet.encode_body(&mut encoder),
            Self::ResourcePackResponse(packet) => packet.encode_body(&mut encoder),
            Self::Unknown(packet) => encoder.write_slice(&packet.body),
        }
        buf
    }

    pub fn id(&self) -> u32 {
        match self {
            Self::Login(_) => LoginPacket::ID,
            Self::ServerHandshake(_) => ServerHandshakePacket::ID,
            Self::ResourcePackResponse(_) => ResourcePackResponsePacket::ID,
            Self::Unknown(packet) => packet.id,
        }
    }
}

/// The client's login, carrying the JWT chain whose last token holds
/// the client's identity public key, plus the client-data token.
#[derive(Debug, Clone)]
pub struct LoginPacket {
    pub protocol_version: i32,
    pub tokens: Vec<Jwt>,
    pub client: Jwt,
}

impl LoginPacket {
    pub const ID: u32 = 0x01;

    fn decode_body(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let protocol_version = decoder.read_i32()?;
        let mut body = Decoder::new(decoder.read_var_slice()?);

        let chain_length = usize::try_from(body.read_u32_le()?)?;
        let chain: Value = serde_json::from_slice(body.consume_slice(chain_length)?)
            .map_err(|e| DecodeError::Other(e.into()))?;
        let tokens = chain
            .get("chain")
            .and_then(Value::as_array)
            .ok_or_else(|| DecodeError::Other(anyhow::anyhow!("login chain is not a list")))?
            .iter()
            .map(|token| {
                let raw = token
                    .as_str()
                    .ok_or_else(|| DecodeError::Other(anyhow::anyhow!("chain entry is not a string")))?;
                Jwt::parse(raw).map_err(|e| DecodeError::Other(e.into()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let client_length = usize::try_from(body.read_u32_le()?)?;
        let client = std::str::from_utf8(body.consume_slice(client_length)?)?;
        let client = Jwt::parse(client).map_err(|e| DecodeError::Other(e.into()))?;

        Ok(Self {
            protocol_version,
            tokens,
            client,
        })
    }

    fn encode_body(&self, encoder: &mut Encoder) {
        encoder.write_i32(self.protocol_version);

        let chain = json!({
            "chain": self.tokens.iter().map(Jwt::to_string).collect::<Vec<_>>(),
        })
        .to_string();
        let client = self.client.to_string();

        let mut body = Vec::new();
        let mut body_encoder = Encoder::new(&mut body);
        body_encoder.write_u32_le(chain.len() as u32);
        body_encoder.write_slice(chain.as_bytes());
        body_encoder.write_u32_le(client.len() as u32);
        body_encoder.write_slice(client.as_bytes());

        encoder.write_var_slice(&body);
    }
}

/// The server's half of the key agreement: one JWT whose header `x5u`
/// is the server public key and whose payload carries the salt.
#[derive(Debug, Clone)]
pub struct ServerHandshakePacket {
    pub token: Jwt,
}

impl ServerHandshakePacket {
    pub const ID: u32 = 0x03;

    fn decode_body(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let token = decoder.read_string()?;
        let token = Jwt::parse(token).map_err(|e| DecodeError::Other(e.into()))?;
        Ok(Self { token })
    }

    fn encode_body(&self, encoder: &mut Encoder) {
        encoder.write_string(&self.token.to_string());
    }
}

/// The client's answer to the resource-pack offer; decoded so it can be
/// surfaced to subscribers and the log.
#[derive(Debug, Clone)]
pub struct ResourcePackResponsePacket {
    pub status: u8,
    pub pack_ids: Vec<String>,
}

impl ResourcePackResponsePacket {
    pub const ID: u32 = 0x08;

    fn decode_body(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let status = decoder.read_u8()?;
        let count = decoder.read_u16()?;
        let mut pack_ids = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            pack_ids.push(decoder.read_string()?.to_owned());
        }
        Ok(Self { status, pack_ids })
    }

    fn encode_body(&self, encoder: &mut Encoder) {
        encoder.write_u8(self.status);
        encoder.write_u16(self.pack_ids.len() as u16);
        for id in &self.pack_ids {
            encoder.write_string(id);
        }
    }
}

/// Any packet the proxy does not inspect; passes through losslessly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPacket {
    pub id: u32,
    pub body: Vec<u8>,
}
