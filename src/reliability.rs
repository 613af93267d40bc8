//! Per-direction reliability state: the inbound receive window and
//! split reassembly, and the outbound re-framing counters.
//!
//! The proxy terminates the reliable transport on each side, so inbound
//! metadata (indices, sequence numbers, split sets) is consumed here and
//! outbound traffic is re-stamped from this module's counters. Missing
//! indices are never re-requested; the endpoints' own stacks retransmit.

use crate::protocol::packet::{Datagram, EncapsulatedPacket, Split};
use std::collections::{HashMap, HashSet};

#[derive(Debug, thiserror::Error)]
pub enum ReliabilityError {
    #[error("reliable packet is missing its index")]
    NoIndex,
    #[error("duplicate reliable index {0}")]
    DuplicateIndex(u32),
    #[error("too many concurrent split reassemblies")]
    TooManySplits,
}

/// Width of the inbound reliable-index window.
const WINDOW_SIZE: u32 = 2048;

/// Concurrent split reassemblies allowed per direction. The cap bounds
/// the memory a peer can pin with never-completing split sets.
const SPLIT_SLOTS: usize = 4;

/// Outcome of offering a reliable index to the window.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    OutOfWindow,
}

/// Sliding window of accepted inbound reliable indices.
///
/// Indices outside [start, end] are dropped silently; duplicates inside
/// the window are an error. The window slides forward once the
/// contiguous prefix from `start` has been seen, so `start` is always
/// the smallest unseen index.
#[derive(Debug)]
pub struct ReliableWindow {
    start: u32,
    end: u32,
    received: HashSet<u32>,
}

impl ReliableWindow {
    pub fn new() -> Self {
        Self {
            start: 0,
            end: WINDOW_SIZE,
            received: HashSet::new(),
        }
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn admit(&mut self, index: Option<u32>) -> Result<Admission, ReliabilityError> {
        let index = index.ok_or(ReliabilityError::NoIndex)?;
        if index < self.start || index > self.end {
            return Ok(Admission::OutOfWindow);
        }
        if !self.received.insert(index) {
            return Err(ReliabilityError::DuplicateIndex(index));
        }
        if index == self.start {
            while self.received.remove(&self.start) {
                self.start += 1;
                self.end += 1;
            }
        }
        Ok(Admission::Accepted)
    }
}

impl Default for ReliableWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// One in-progress split reassembly.
#[derive(Debug)]
struct SplitMemory {
    id: u16,
    count: u32,
    packets: HashMap<u32, Vec<u8>>,
}

impl SplitMemory {
    fn new(id: u16, count: u32) -> Self {
        Self {
            id,
            count,
            packets: HashMap::new(),
        }
    }

    /// Stores one fragment. Duplicate and out-of-range fragment indices
    /// are refused.
    fn store(&mut self, index: u32, sub: Vec<u8>) -> bool {
        if index >= self.count || self.packets.contains_key(&index) {
            return false;
        }
        self.packets.insert(index, sub);
        true
    }

    fn is_complete(&self) -> bool {
        self.packets.len() as u32 == self.count
    }

    fn reassemble(mut self) -> Vec<u8> {
        let mut sub = Vec::new();
        for index in 0..self.count {
            if let Some(fragment) = self.packets.remove(&index) {
                sub.extend(fragment);
            }
        }
        sub
    }
}

/// Fixed-capacity slot table of in-progress reassemblies.
#[derive(Debug)]
pub struct SplitTable {
    slots: [Option<SplitMemory>; SPLIT_SLOTS],
}

impl SplitTable {
    pub fn new() -> Self {
        Self {
            slots: Default::default(),
        }
    }

    /// Feeds one fragment through the table. Returns the reassembled
    /// packet once its split set completes, with the payload
    /// concatenated in index order and the split descriptor cleared.
    pub fn insert(
        &mut self,
        mut packet: EncapsulatedPacket,
    ) -> Result<Option<EncapsulatedPacket>, ReliabilityError> {
        let Some(split) = packet.split else {
            return Ok(Some(packet));
        };
        if split.count == 0 {
            tracing::debug!(id = split.id, "dropping fragment of an empty split set");
            return Ok(None);
        }

        let slot = self.memory_of(split.id)?;
        let memory = slot.get_or_insert_with(|| SplitMemory::new(split.id, split.count));
        if !memory.store(split.index, std::mem::take(&mut packet.sub)) {
            tracing::debug!(
                id = split.id,
                index = split.index,
                "dropping duplicate split fragment"
            );
            return Ok(None);
        }
        if !memory.is_complete() {
            return Ok(None);
        }

        let Some(memory) = slot.take() else {
            return Ok(None);
        };
        packet.sub = memory.reassemble();
        packet.split = None;
        Ok(Some(packet))
    }

    /// Resolves the slot for a split id: first match by id, else the
    /// first free slot.
    fn memory_of(&mut self, id: u16) -> Result<&mut Option<SplitMemory>, ReliabilityError> {
        if let Some(position) = self
            .slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|memory| memory.id == id))
        {
            return Ok(&mut self.slots[position]);
        }
        match self.slots.iter().position(Option::is_none) {
            Some(position) => Ok(&mut self.slots[position]),
            None => Err(ReliabilityError::TooManySplits),
        }
    }
}

impl Default for SplitTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for traffic re-originated toward one endpoint.
#[derive(Debug, Default)]
pub struct OutboundChannel {
    packet_index: u32,
    sequence_number: u32,
    split_id: u16,
}

impl OutboundChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-frames one logical packet into fragments of at most
    /// `max_payload` bytes, stamping fresh reliable indices and, for
    /// multi-fragment sets, a fresh split id.
    ///
    /// A payload that is an exact multiple of `max_payload` yields a
    /// trailing zero-length fragment; receivers tolerate it and the
    /// concatenation in index order is unchanged.
    pub fn fragment(
        &mut self,
        source: EncapsulatedPacket,
        max_payload: usize,
    ) -> Vec<EncapsulatedPacket> {
        let quotient = source.sub.len() / max_payload;
        let remainder = source.sub.len() % max_payload;
        let count = quotient + 1;

        let split_id = (count > 1).then(|| {
            let id = self.split_id;
            self.split_id = self.split_id.wrapping_add(1);
            id
        });

        (0..count)
            .map(|i| {
                let offset = i * max_payload;
                let length = if i < quotient { max_payload } else { remainder };
                let index = self.packet_index;
                self.packet_index += 1;
                EncapsulatedPacket {
                    reliability: source.reliability,
                    index: Some(index),
                    sequence: source.sequence,
                    order: source.order,
                    split: split_id.map(|id| Split {
                        id,
                        index: i as u32,
                        count: count as u32,
                    }),
                    sub: source.sub[offset..offset + length].to_vec(),
                }
            })
            .collect()
    }

    /// Wraps one re-framed packet in a freshly numbered datagram.
    pub fn wrap(&mut self, packet: EncapsulatedPacket) -> Datagram {
        let sequence = self.sequence_number;
        self.sequence_number += 1;
        Datagram::single(sequence, packet)
    }
}
