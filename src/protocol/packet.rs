//! RakNet transport packets.
//!
//! Full parsing of the offline handshake is _not_ implemented. Only the
//! fields required for interception (the MTU negotiation and the
//! Offline → Online transition) are decoded; everything else in the
//! offline phase is forwarded verbatim by the session.

use super::OFFLINE_MAGIC;
use crate::protocol::{DecodeError, Decoder, Encoder};
use bitflags::bitflags;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

bitflags! {
    /// Header bits of an online RakNet message.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct DatagramFlags: u8 {
        const VALID = 0x80;
        const ACK = 0x40;
        const NACK = 0x20;
    }
}

/// What an online message's first byte declares it to be.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DatagramKind {
    Datagram,
    Ack,
    Nack,
}

/// Classifies an online message by its header byte. Returns `None` for
/// bytes without the valid bit, which the session ignores.
pub fn datagram_kind(first: u8) -> Option<DatagramKind> {
    let flags = DatagramFlags::from_bits_truncate(first);
    if !flags.contains(DatagramFlags::VALID) {
        return None;
    }
    if flags.contains(DatagramFlags::ACK) {
        Some(DatagramKind::Ack)
    } else if flags.contains(DatagramFlags::NACK) {
        Some(DatagramKind::Nack)
    } else {
        Some(DatagramKind::Datagram)
    }
}

/// Message reliability, the top three bits of an encapsulated packet's
/// flags byte. Determines which metadata fields are present on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Reliability {
    Unreliable = 0,
    UnreliableSequenced = 1,
    Reliable = 2,
    ReliableOrdered = 3,
    ReliableSequenced = 4,
    UnreliableAckReceipt = 5,
    ReliableAckReceipt = 6,
    ReliableOrderedAckReceipt = 7,
}

impl Reliability {
    pub fn from_id(id: u8) -> Option<Self> {
        Some(match id {
            0 => Self::Unreliable,
            1 => Self::UnreliableSequenced,
            2 => Self::Reliable,
            3 => Self::ReliableOrdered,
            4 => Self::ReliableSequenced,
            5 => Self::UnreliableAckReceipt,
            6 => Self::ReliableAckReceipt,
            7 => Self::ReliableOrderedAckReceipt,
            _ => return None,
        })
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    /// Reliable kinds carry a reliable index and pass through the
    /// receive window.
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            Self::Reliable
                | Self::ReliableOrdered
                | Self::ReliableSequenced
                | Self::ReliableAckReceipt
                | Self::ReliableOrderedAckReceipt
        )
    }

    /// Sequenced kinds carry a sequence index.
    pub fn is_sequenced(self) -> bool {
        matches!(self, Self::UnreliableSequenced | Self::ReliableSequenced)
    }

    /// Ordered kinds carry an order index and channel.
    pub fn is_ordered(self) -> bool {
        matches!(
            self,
            Self::UnreliableSequenced
                | Self::ReliableOrdered
                | Self::ReliableSequenced
                | Self::ReliableOrderedAckReceipt
        )
    }
}

/// Ordering metadata of an encapsulated packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Order {
    pub index: u32,
    pub channel: u8,
}

/// Split (fragmentation) metadata of an encapsulated packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Split {
    pub id: u16,
    pub index: u32,
    pub count: u32,
}

/// A single logical message within a [`Datagram`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncapsulatedPacket {
    pub reliability: Reliability,
    pub index: Option<u32>,
    pub sequence: Option<u32>,
    pub order: Option<Order>,
    pub split: Option<Split>,
    /// The inner payload bytes.
    pub sub: Vec<u8>,
}

impl EncapsulatedPacket {
    const FLAG_SPLIT: u8 = 0x10;

    /// A reliable packet carrying just a payload, the shape the proxy
    /// re-originates traffic in.
    pub fn reliable(sub: Vec<u8>) -> Self {
        Self {
            reliability: Reliability::Reliable,
            index: None,
            sequence: None,
            order: None,
            split: None,
            sub,
        }
    }

    pub fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let flags = decoder.read_u8()?;
        let reliability = Reliability::from_id(flags >> 5).ok_or(DecodeError::UnexpectedId(flags))?;
        let has_split = flags & Self::FLAG_SPLIT != 0;
        let length_bits = decoder.read_u16()?;
        let length = (usize::from(length_bits) + 7) / 8;

        let index = if reliability.is_reliable() {
            Some(decoder.read_u24_le()?)
        } else {
            None
        };
        let sequence = if reliability.is_sequenced() {
            Some(decoder.read_u24_le()?)
        } else {
            None
        };
        let order = if reliability.is_ordered() {
            Some(Order {
                index: decoder.read_u24_le()?,
                channel: decoder.read_u8()?,
            })
        } else {
            None
        };
        let split = if has_split {
            let count = u32::try_from(decoder.read_i32()?)?;
            let id = decoder.read_u16()?;
            let index = u32::try_from(decoder.read_i32()?)?;
            Some(Split { id, index, count })
        } else {
            None
        };
        let sub = decoder.consume_slice(length)?.to_vec();

        Ok(Self {
            reliability,
            index,
            sequence,
            order,
            split,
            sub,
        })
    }

    pub fn encode(&self, encoder: &mut Encoder) {
        let mut flags = self.reliability.id() << 5;
        if self.split.is_some() {
            flags |= Self::FLAG_SPLIT;
        }
        encoder.write_u8(flags);
        encoder.write_u16((self.sub.len() << 3) as u16);
        if self.reliability.is_reliable() {
            encoder.write_u24_le(self.index.unwrap_or_default());
        }
        if self.reliability.is_sequenced() {
            encoder.write_u24_le(self.sequence.unwrap_or_default());
        }
        if self.reliability.is_ordered() {
            let order = self.order.unwrap_or(Order { index: 0, channel: 0 });
            encoder.write_u24_le(order.index);
            encoder.write_u8(order.channel);
        }
        if let Some(split) = self.split {
            encoder.write_i32(split.count as i32);
            encoder.write_u16(split.id);
            encoder.write_i32(split.index as i32);
        }
        encoder.write_slice(&self.sub);
    }
}

/// One UDP payload in the online phase: header flags, a 24-bit sequence
/// number, and one or more encapsulated packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub flags: DatagramFlags,
    pub sequence: u32,
    pub packets: Vec<EncapsulatedPacket>,
}

impl Datagram {
    /// Wraps a single encapsulated packet the way the proxy emits them.
    pub fn single(sequence: u32, packet: EncapsulatedPacket) -> Self {
        Self {
            flags: DatagramFlags::VALID,
            sequence,
            packets: vec![packet],
        }
    }

    pub fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let raw = decoder.read_u8()?;
        let flags = DatagramFlags::from_bits_truncate(raw);
        if !flags.contains(DatagramFlags::VALID) {
            return Err(DecodeError::UnexpectedId(raw));
        }
        let sequence = decoder.read_u24_le()?;
        let mut packets = Vec::new();
        while !decoder.is_finished() {
            packets.push(EncapsulatedPacket::decode(decoder)?);
        }
        Ok(Self {
            flags,
            sequence,
            packets,
        })
    }

    pub fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u8(self.flags.bits());
        encoder.write_u24_le(self.sequence);
        for packet in &self.packets {
            packet.encode(encoder);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut Encoder::new(&mut buf));
        buf
    }
}

/// One acknowledgement record: a single sequence number or an
/// inclusive range.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AckRecord {
    Single(u32),
    Range { start: u32, end: u32 },
}

fn decode_records(decoder: &mut Decoder) -> Result<Vec<AckRecord>, DecodeError> {
    let count = decoder.read_u16()?;
    let mut records = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        if decoder.read_bool()? {
            records.push(AckRecord::Single(decoder.read_u24_le()?));
        } else {
            records.push(AckRecord::Range {
                start: decoder.read_u24_le()?,
                end: decoder.read_u24_le()?,
            });
        }
    }
    Ok(records)
}

fn encode_records(records: &[AckRecord], encoder: &mut Encoder) {
    encoder.write_u16(records.len() as u16);
    for record in records {
        match *record {
            AckRecord::Single(sequence) => {
                encoder.write_bool(true);
                encoder.write_u24_le(sequence);
            }
            AckRecord::Range { start, end } => {
                encoder.write_bool(false);
                encoder.write_u24_le(start);
                encoder.write_u24_le(end);
            }
        }
    }
}

/// Positive acknowledgement of received datagram sequence numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub records: Vec<AckRecord>,
}

impl Ack {
    pub const ID: u8 = 0xc0;

    /// Acknowledges exactly one sequence number.
    pub fn single(sequence: u32) -> Self {
        Self {
            records: vec![AckRecord::Single(sequence)],
        }
    }

    pub fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let id = decoder.read_u8()?;
        if id != Self::ID {
            return Err(DecodeError::UnexpectedId(id));
        }
        Ok(Self {
            records: decode_records(decoder)?,
        })
    }

    pub fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u8(Self::ID);
        encode_records(&self.records, encoder);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut Encoder::new(&mut buf));
        buf
    }
}

/// Negative acknowledgement. Parsed and logged; retransmission is the
/// endpoints' job, the proxy only re-frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nack {
    pub records: Vec<AckRecord>,
}

impl Nack {
    pub const ID: u8 = 0xa0;

    pub fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let id = decoder.read_u8()?;
        if id != Self::ID {
            return Err(DecodeError::UnexpectedId(id));
        }
        Ok(Self {
            records: decode_records(decoder)?,
        })
    }

    pub fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u8(Self::ID);
        encode_records(&self.records, encoder);
    }
}

fn decode_magic(decoder: &mut Decoder) -> Result<(), DecodeError> {
    let magic = decoder.consume::<16>()?;
    if magic != OFFLINE_MAGIC {
        return Err(DecodeError::BadMagic);
    }
    Ok(())
}

fn decode_address(decoder: &mut Decoder) -> Result<SocketAddr, DecodeError> {
    let version = decoder.read_u8()?;
    if version != 4 {
        return Err(DecodeError::Other(anyhow::anyhow!(
            "unsupported address version {version}"
        )));
    }
    let [a, b, c, d] = decoder.consume::<4>()?;
    let port = decoder.read_u16()?;
    Ok(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(!a, !b, !c, !d)),
        port,
    ))
}

fn encode_address(address: SocketAddr, encoder: &mut Encoder) {
    encoder.write_u8(4);
    let octets = match address.ip() {
        IpAddr::V4(ip) => ip.octets(),
        IpAddr::V6(_) => [0; 4],
    };
    for octet in octets {
        encoder.write_u8(!octet);
    }
    encoder.write_u16(address.port());
}

/// Second offline connection-opener from the client, carrying the MTU
/// the connection will settle on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Open2Request {
    pub server_address: SocketAddr,
    pub mtu_size: u16,
    pub client_guid: u64,
}

impl Open2Request {
    pub const ID: u8 = 0x07;

    pub fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let id = decoder.read_u8()?;
        if id != Self::ID {
            return Err(DecodeError::UnexpectedId(id));
        }
        decode_magic(decoder)?;
        let server_address = decode_address(decoder)?;
        let mtu_size = decoder.read_u16()?;
        let client_guid = decoder.read_u64()?;
        Ok(Self {
            server_address,
            mtu_size,
            client_guid,
        })
    }

    pub fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u8(Self::ID);
        encoder.write_slice(&OFFLINE_MAGIC);
        encode_address(self.server_address, encoder);
        encoder.write_u16(self.mtu_size);
        encoder.write_u64(self.client_guid);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut Encoder::new(&mut buf));
        buf
    }
}

/// Server's answer to [`Open2Request`]; its arrival moves the session
/// to the Online state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Open2Reply {
    pub server_guid: u64,
    pub client_address: SocketAddr,
    pub mtu_size: u16,
    pub encryption: bool,
}

impl Open2Reply {
    pub const ID: u8 = 0x08;

    pub fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let id = decoder.read_u8()?;
        if id != Self::ID {
            return Err(DecodeError::UnexpectedId(id));
        }
        decode_magic(decoder)?;
        let server_guid = decoder.read_u64()?;
        let client_address = decode_address(decoder)?;
        let mtu_size = decoder.read_u16()?;
        let encryption = decoder.read_bool()?;
        Ok(Self {
            server_guid,
            client_address,
            mtu_size,
            encryption,
        })
    }

    pub fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u8(Self::ID);
        encoder.write_slice(&OFFLINE_MAGIC);
        encoder.write_u64(self.server_guid);
        encode_address(self.client_address, encoder);
        encoder.write_u16(self.mtu_size);
        encoder.write_bool(self.encryption);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut Encoder::new(&mut buf));
        buf
    }
}
