use std::collections::VecDeque;
use std::net::SocketAddr;

use bit_set::BitSet;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::udp::chunk::{chunk_payload, total_chunks, write_chunk, ChunkHeader, ChunkKind, MAX_CHUNKS};
use crate::util::safe_converter::PrecheckedCast;


/// A chunk that was picked by the scheduler and is ready to go on the wire
pub struct OutgoingChunk {
    pub to: SocketAddr,
    pub header: ChunkHeader,
    pub resent: bool,
    pub packet: BytesMut,
}

#[derive(Default, Debug, Eq, PartialEq)]
pub struct ResendTickOutcome {
    /// number of chunks scheduled for re-sending
    pub resent: usize,
    /// sequence numbers of reliable messages that were given up on
    pub abandoned: Vec<u64>,
    /// number of best-effort messages that were completely sent and are now forgotten
    pub purged: usize,
}

/// Send side bookkeeping for a single message
struct OutboundMessage {
    prototype: ChunkHeader,
    to: SocketAddr,
    full_data: Vec<u8>,
    sent: BitSet,
    acked: BitSet,
    next_to_send: u16,
    /// chunks handed to the socket but not written yet
    queued: usize,
    /// reliable: sent but not acknowledged
    in_flight: usize,
    ticks_since_progress: u32,
    resend_queue: VecDeque<u16>,
}

impl OutboundMessage {
    fn is_reliable(&self) -> bool {
        self.prototype.kind == ChunkKind::Data
    }

    fn is_fully_sent(&self) -> bool {
        self.next_to_send == self.prototype.total_chunks
    }

    fn is_fully_acked(&self) -> bool {
        self.acked.len() == self.prototype.total_chunks as usize
    }

    fn has_capacity(&self, max_flight: usize) -> bool {
        if self.is_reliable() {
            self.in_flight < max_flight
        }
        else {
            self.queued < max_flight
        }
    }

    /// Re-sends take precedence over new chunks and are not subject to the in-flight limit. They
    ///  do not touch the sent / acked bookkeeping.
    fn try_emit(&mut self, chunk_size: usize, max_flight: usize) -> Option<OutgoingChunk> {
        while let Some(chunk_index) = self.resend_queue.pop_front() {
            if self.acked.contains(chunk_index as usize) {
                continue;
            }
            self.queued += 1;
            return Some(self.chunk(chunk_size, chunk_index, true));
        }

        if self.is_fully_sent() || !self.has_capacity(max_flight) {
            return None;
        }

        let chunk_index = self.next_to_send;
        self.next_to_send += 1;
        self.sent.insert(chunk_index as usize);
        self.queued += 1;
        if self.is_reliable() {
            self.in_flight += 1;
        }
        Some(self.chunk(chunk_size, chunk_index, false))
    }

    fn chunk(&self, chunk_size: usize, chunk_index: u16, resent: bool) -> OutgoingChunk {
        let header = ChunkHeader {
            chunk_index,
            ..self.prototype
        };
        OutgoingChunk {
            to: self.to,
            header,
            resent,
            packet: write_chunk(&header, chunk_payload(&self.full_data, chunk_size, chunk_index)),
        }
    }

    /// lowest chunk index first, at most `max_flight` chunks
    fn schedule_resend(&mut self, max_flight: usize) -> usize {
        self.resend_queue.clear();
        for chunk_index in 0..self.next_to_send {
            if self.resend_queue.len() == max_flight {
                break;
            }
            if self.sent.contains(chunk_index as usize) && !self.acked.contains(chunk_index as usize) {
                self.resend_queue.push_back(chunk_index);
            }
        }
        self.resend_queue.len()
    }
}


/// All messages that are currently being sent by a UDP channel.
///
/// Messages are kept in a map by sequence number and in a ring that the scheduler walks in
///  round-robin fashion, so that a big message to one peer does not hold up other messages.
pub struct OutboundQueue {
    chunk_size: usize,
    max_flight: usize,
    next_sequence: u64,
    messages: FxHashMap<u64, OutboundMessage>,
    ring: Vec<u64>,
    cursor: usize,
}

impl OutboundQueue {
    pub fn new(chunk_size: usize, max_flight: usize) -> OutboundQueue {
        OutboundQueue {
            chunk_size,
            max_flight,
            next_sequence: 0,
            messages: Default::default(),
            ring: Vec::new(),
            cursor: 0,
        }
    }

    pub fn max_message_size(&self) -> usize {
        MAX_CHUNKS * self.chunk_size
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.messages.contains_key(&sequence)
    }

    /// registers a message for sending, returning its sequence number
    pub fn register(&mut self, to: SocketAddr, data: &[u8], reliable: bool) -> Result<u64, TransportError> {
        if data.is_empty() {
            return Err(TransportError::EmptyMessage);
        }
        if data.len() > self.max_message_size() {
            return Err(TransportError::MessageTooLarge { size: data.len(), max: self.max_message_size() });
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let total_chunks: u16 = total_chunks(data.len(), self.chunk_size).prechecked_cast();
        let kind = if reliable { ChunkKind::Data } else { ChunkKind::LowPriorityData };

        debug!("registering message #{} of {} bytes ({} chunks) to {:?}, {:?}", sequence, data.len(), total_chunks, to, kind);

        self.messages.insert(sequence, OutboundMessage {
            prototype: ChunkHeader {
                kind,
                sequence,
                total_chunks,
                chunk_index: 0,
            },
            to,
            full_data: data.to_vec(),
            sent: BitSet::with_capacity(total_chunks as usize),
            acked: BitSet::with_capacity(total_chunks as usize),
            next_to_send: 0,
            queued: 0,
            in_flight: 0,
            ticks_since_progress: 0,
            resend_queue: VecDeque::new(),
        });
        self.ring.push(sequence);
        Ok(sequence)
    }

    /// Advances the round-robin pointer to the next message that can emit a chunk. Returns `None`
    ///  after one full pass over the ring without finding one.
    pub fn next_chunk(&mut self) -> Option<OutgoingChunk> {
        for _ in 0..self.ring.len() {
            if self.cursor >= self.ring.len() {
                self.cursor = 0;
            }
            let sequence = self.ring[self.cursor];
            self.cursor = (self.cursor + 1) % self.ring.len();

            if let Some(msg) = self.messages.get_mut(&sequence) {
                if let Some(chunk) = msg.try_emit(self.chunk_size, self.max_flight) {
                    trace!("scheduling chunk {:?} to {:?}", chunk.header, chunk.to);
                    return Some(chunk);
                }
            }
        }
        None
    }

    /// called when a chunk emitted by [OutboundQueue::next_chunk] was handed to the socket
    pub fn on_written(&mut self, sequence: u64) {
        if let Some(msg) = self.messages.get_mut(&sequence) {
            msg.queued = msg.queued.saturating_sub(1);
        }
    }

    /// Returns `true` if the ack made progress, i.e. it freed a place in the message's in-flight
    ///  window. Acks for unknown messages or chunks that were never sent are ignored.
    pub fn on_ack(&mut self, ack: &ChunkHeader) -> bool {
        let msg = match self.messages.get_mut(&ack.sequence) {
            Some(msg) => msg,
            None => {
                trace!("ack for unknown message #{} - ignoring", ack.sequence);
                return false;
            }
        };

        if !msg.is_reliable()
            || msg.prototype.total_chunks != ack.total_chunks
            || !msg.sent.contains(ack.chunk_index as usize)
        {
            debug!("ack {:?} does not match message #{} - ignoring", ack, ack.sequence);
            return false;
        }
        if !msg.acked.insert(ack.chunk_index as usize) {
            trace!("duplicate ack {:?}", ack);
            return false;
        }

        msg.in_flight = msg.in_flight.saturating_sub(1);
        msg.ticks_since_progress = 0;

        if msg.is_fully_acked() {
            debug!("message #{} is fully acknowledged", ack.sequence);
            self.remove(ack.sequence);
        }
        true
    }

    pub fn on_resend_tick(&mut self, resend_tick_threshold: u32, resend_threshold: u32) -> ResendTickOutcome {
        let mut outcome = ResendTickOutcome::default();
        let mut to_be_removed = Vec::new();

        for sequence in &self.ring {
            let msg = match self.messages.get_mut(sequence) {
                Some(msg) => msg,
                None => continue,
            };

            if !msg.is_reliable() {
                if msg.is_fully_sent() && msg.queued == 0 {
                    trace!("best-effort message #{} is fully sent", sequence);
                    to_be_removed.push(*sequence);
                    outcome.purged += 1;
                }
                continue;
            }

            msg.ticks_since_progress += 1;
            if msg.ticks_since_progress >= resend_threshold {
                debug!("message #{} to {:?} was not acknowledged after {} ticks - giving up", sequence, msg.to, msg.ticks_since_progress);
                to_be_removed.push(*sequence);
                outcome.abandoned.push(*sequence);
            }
            else if msg.ticks_since_progress >= resend_tick_threshold {
                let num_resent = msg.schedule_resend(self.max_flight);
                if num_resent > 0 {
                    trace!("re-sending {} chunks of message #{}", num_resent, sequence);
                }
                outcome.resent += num_resent;
            }
        }

        for sequence in to_be_removed {
            self.remove(sequence);
        }
        outcome
    }

    /// drops all messages to a given peer, returning the number of dropped messages
    pub fn cancel_for(&mut self, to: SocketAddr) -> usize {
        let cancelled: Vec<u64> = self.ring.iter()
            .filter(|s| self.messages.get(*s).map(|m| m.to == to).unwrap_or(false))
            .cloned()
            .collect();
        for sequence in &cancelled {
            self.remove(*sequence);
        }
        cancelled.len()
    }

    fn remove(&mut self, sequence: u64) {
        self.messages.remove(&sequence);
        if let Some(pos) = self.ring.iter().position(|s| *s == sequence) {
            self.ring.remove(pos);
            if pos < self.cursor {
                self.cursor -= 1;
            }
            if self.cursor >= self.ring.len() {
                self.cursor = 0;
            }
        }
    }
}
