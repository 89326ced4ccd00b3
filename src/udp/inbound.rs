use std::net::SocketAddr;
use std::time::Duration;

use bit_set::BitSet;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::udp::chunk::{ChunkHeader, ChunkKind};
use crate::util::safe_converter::SafeCast;

#[derive(Debug, Eq, PartialEq)]
pub enum ChunkOutcome {
    /// the chunk was stored, but the message is still missing chunks
    Incomplete,
    /// the chunk completed a message
    Complete(Vec<u8>),
    /// the chunk (or its whole message) was received before
    Duplicate,
    Rejected(&'static str),
}

/// Receive side bookkeeping for a single message
struct InboundMessage {
    prototype: ChunkHeader,
    /// grows up to the end of the highest chunk received so far
    partial_data: Vec<u8>,
    received: BitSet,
    /// known once the final chunk arrived
    total_len: Option<usize>,
    last_activity: Instant,
}


/// Reassembles chunks into messages. Messages are identified by sender address and sequence
///  number since each sender numbers its messages independently.
///
/// Sequences that were completed are remembered for some time so that retransmitted chunks
///  (due to lost acks) do not cause a message to be delivered twice.
///
/// The buffers of all partial messages together are limited to `max_partial_bytes`. Chunks
///  that would exceed the limit are rejected.
pub struct Reassembly {
    chunk_size: usize,
    max_partial_bytes: usize,
    partial_bytes: usize,
    messages: FxHashMap<(SocketAddr, u64), InboundMessage>,
    completed: FxHashMap<(SocketAddr, u64), Instant>,
}

impl Reassembly {
    pub fn new(chunk_size: usize, max_partial_bytes: usize) -> Reassembly {
        Reassembly {
            chunk_size,
            max_partial_bytes,
            partial_bytes: 0,
            messages: Default::default(),
            completed: Default::default(),
        }
    }

    #[cfg(test)]
    fn num_partial(&self) -> usize {
        self.messages.len()
    }

    pub fn on_chunk(&mut self, from: SocketAddr, header: &ChunkHeader, payload: &[u8], now: Instant) -> ChunkOutcome {
        let key = (from, header.sequence);

        if self.completed.contains_key(&key) {
            trace!("chunk {:?} from {:?} belongs to an already delivered message", header, from);
            return ChunkOutcome::Duplicate;
        }

        if let Some(reason) = self.validate_payload_len(header, payload) {
            return ChunkOutcome::Rejected(reason);
        }

        let chunk_size = self.chunk_size;
        let total_chunks: usize = header.total_chunks.safe_cast();
        let msg = self.messages.entry(key)
            .or_insert_with(|| {
                trace!("first chunk of message #{} from {:?}", header.sequence, from);
                InboundMessage {
                    prototype: *header,
                    partial_data: Vec::new(),
                    received: BitSet::new(),
                    total_len: None,
                    last_activity: now,
                }
            });

        if msg.prototype.total_chunks != header.total_chunks {
            return ChunkOutcome::Rejected("total chunk count differs from previous chunks");
        }
        if msg.prototype.kind != header.kind {
            return ChunkOutcome::Rejected("chunk kind differs from previous chunks");
        }

        let chunk_index: usize = header.chunk_index.safe_cast();
        if msg.received.contains(chunk_index) {
            return ChunkOutcome::Duplicate;
        }

        let offset = chunk_index * chunk_size;
        let end = offset + payload.len();
        if end > msg.partial_data.len() {
            let growth = end - msg.partial_data.len();
            if self.partial_bytes + growth > self.max_partial_bytes {
                debug!("reassembly buffers are full ({} bytes) - rejecting chunk {:?} from {:?}", self.partial_bytes, header, from);
                if msg.received.is_empty() {
                    self.messages.remove(&key);
                }
                return ChunkOutcome::Rejected("reassembly buffer limit exceeded");
            }
            msg.partial_data.resize(end, 0);
            self.partial_bytes += growth;
        }
        msg.partial_data[offset..end].copy_from_slice(payload);
        if header.is_last() {
            msg.total_len = Some(offset + payload.len());
        }
        msg.received.insert(chunk_index);
        msg.last_activity = now;

        if msg.received.len() < total_chunks {
            return ChunkOutcome::Incomplete;
        }

        let mut msg = match self.messages.remove(&key) {
            Some(msg) => msg,
            None => return ChunkOutcome::Incomplete,
        };
        self.partial_bytes -= msg.partial_data.len();
        if let Some(total_len) = msg.total_len {
            msg.partial_data.truncate(total_len);
        }
        self.completed.insert(key, now);

        debug!("message #{} from {:?} is complete ({} bytes)", header.sequence, from, msg.partial_data.len());
        ChunkOutcome::Complete(msg.partial_data)
    }

    /// Non-final chunks must be exactly one chunk size, final chunks may be shorter but not empty.
    fn validate_payload_len(&self, header: &ChunkHeader, payload: &[u8]) -> Option<&'static str> {
        if header.kind == ChunkKind::Ack {
            return Some("ack chunk passed to reassembly");
        }
        if header.is_last() {
            if payload.is_empty() || payload.len() > self.chunk_size {
                return Some("final chunk has invalid length");
            }
        }
        else if payload.len() != self.chunk_size {
            return Some("non-final chunk does not have the full chunk size");
        }
        None
    }

    /// Discards partial messages without recent activity and forgets completed sequences after
    ///  the retention period. Returns the number of discarded partial messages.
    pub fn purge(&mut self, now: Instant, inbound_timeout: Duration, completed_retention: Duration) -> usize {
        let num_before = self.messages.len();
        let partial_bytes = &mut self.partial_bytes;
        self.messages.retain(|(from, sequence), msg| {
            let keep = now.duration_since(msg.last_activity) < inbound_timeout;
            if !keep {
                debug!("discarding incomplete message #{} from {:?} ({} of {} chunks received)", sequence, from, msg.received.len(), msg.prototype.total_chunks);
                *partial_bytes -= msg.partial_data.len();
            }
            keep
        });
        self.completed.retain(|_, completed_at| now.duration_since(*completed_at) < completed_retention);

        num_before - self.messages.len()
    }
}
