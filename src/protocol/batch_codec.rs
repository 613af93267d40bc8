//! Codec for the Bedrock batch container.
//! Supports zlib compression and the per-direction encryption wrapping.

use crate::{
    origin::Origin,
    protocol::{DecodeError, Decoder, Encoder, BUFFER_LIMIT},
};
use aes::{
    cipher::{consts::U16, generic_array::GenericArray},
    Aes256,
};
use aes_gcm::{
    aead::{Aead, KeyInit},
    AesGcm, Key, Nonce,
};
use cfb8::cipher::{BlockDecryptMut, KeyIvInit};
use flate2::Compression;
use std::{
    io::{Read, Write},
    slice,
};

/// Batches re-emitted by the proxy are re-compressed on every hop, so
/// we keep the cost of that hop low rather than squeezing bytes.
const COMPRESSION_LEVEL: Compression = Compression::fast();

type BatchCipher = AesGcm<Aes256, U16>;
type BatchDecryptor = cfb8::Decryptor<Aes256>;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("batch crypto failure")]
    Crypto,
    #[error("batch compression failure: {0}")]
    Compression(#[from] std::io::Error),
    #[error(transparent)]
    Malformed(#[from] DecodeError),
}

/// The application-layer container: one or more Bedrock packets,
/// varint-length-prefixed and zlib-compressed behind the 0xfe id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPacket {
    pub packets: Vec<Vec<u8>>,
}

impl BatchPacket {
    pub const ID: u8 = 0xfe;

    pub fn new(packets: Vec<Vec<u8>>) -> Self {
        Self { packets }
    }

    /// Decodes an unencrypted batch from its full wire bytes.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        Self::from_body(strip_id(data)?)
    }

    /// Encodes an unencrypted batch to its full wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = vec![Self::ID];
        out.extend(self.to_body()?);
        Ok(out)
    }

    fn from_body(body: &[u8]) -> Result<Self, CodecError> {
        let mut inflated = Vec::new();
        flate2::read::ZlibDecoder::new(body)
            .take(BUFFER_LIMIT as u64)
            .read_to_end(&mut inflated)?;

        let mut decoder = Decoder::new(&inflated);
        let mut packets = Vec::new();
        while !decoder.is_finished() {
            packets.push(decoder.read_var_slice().map_err(CodecError::Malformed)?.to_vec());
        }
        Ok(Self { packets })
    }

    fn to_body(&self) -> Result<Vec<u8>, CodecError> {
        let mut plain = Vec::new();
        let mut encoder = Encoder::new(&mut plain);
        for packet in &self.packets {
            encoder.write_var_slice(packet);
        }

        let mut deflater = flate2::write::ZlibEncoder::new(Vec::new(), COMPRESSION_LEVEL);
        deflater.write_all(&plain)?;
        Ok(deflater.finish()?)
    }
}

fn strip_id(data: &[u8]) -> Result<&[u8], CodecError> {
    let mut decoder = Decoder::new(data);
    let id = decoder.read_u8().map_err(CodecError::Malformed)?;
    if id != BatchPacket::ID {
        return Err(DecodeError::UnexpectedId(id).into());
    }
    Ok(decoder.buffer())
}

/// Direction-specific codec for encrypted batches, keyed by the shared
/// secret agreed with the endpoint on that side. The key is the secret
/// itself; the IV is its first 16 bytes.
///
/// The two transforms are deliberately asymmetric: inbound traffic is
/// unwrapped with one-shot AES-256-CFB8, outbound traffic is sealed
/// with AES-256-GCM (ciphertext followed by the tag), matching what the
/// handshake partners speak on each path.
pub struct BatchCodec {
    origin: Origin,
    key: [u8; 32],
    iv: [u8; 16],
}

impl BatchCodec {
    pub fn new(secret: [u8; 32], origin: Origin) -> Self {
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&secret[..16]);
        Self {
            origin,
            key: secret,
            iv,
        }
    }

    /// The endpoint whose key agreement produced this codec's secret.
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Unwraps an inbound encrypted batch.
    pub fn decode(&self, data: &[u8]) -> Result<BatchPacket, CodecError> {
        let mut body = strip_id(data)?.to_vec();

        let mut decryptor =
            BatchDecryptor::new_from_slices(&self.key, &self.iv).map_err(|_| CodecError::Crypto)?;
        for byte in body.iter_mut() {
            decryptor.decrypt_block_mut(GenericArray::from_mut_slice(slice::from_mut(byte)));
        }

        BatchPacket::from_body(&body)
    }

    /// Seals an outbound batch.
    pub fn encode(&self, batch: &BatchPacket) -> Result<Vec<u8>, CodecError> {
        let body = batch.to_body()?;

        let cipher = BatchCipher::new(Key::<BatchCipher>::from_slice(&self.key));
        let sealed = cipher
            .encrypt(Nonce::<U16>::from_slice(&self.iv), body.as_slice())
            .map_err(|_| CodecError::Crypto)?;

        let mut out = vec![BatchPacket::ID];
        out.extend(sealed);
        Ok(out)
    }
}
