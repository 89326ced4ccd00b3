use std::fmt::{Debug, Formatter};

use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// kind marker (1) + sequence (8) + total chunks (2) + chunk index (2)
pub const HEADER_SIZE: usize = 13;

/// `total_chunks` is a u16 on the wire, which limits the number of chunks per message
pub const MAX_CHUNKS: usize = u16::MAX as usize;

#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ChunkKind {
    /// payload of a reliable message - each chunk is acknowledged
    Data = b'!',
    /// payload of a best-effort message, never acknowledged
    LowPriorityData = b'=',
    Ack = b'@',
}

/// Chunk header, all numbers in network byte order (BE):
///
/// ```ascii
/// 0:  kind marker ('!' data, '=' low priority data, '@' ack)
/// 1:  sequence number (u64) - per sender, identifies the message
/// 9:  total number of chunks in the message (u16)
/// 11: index of this chunk (u16)
/// 13: payload (absent for acks)
/// ```
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct ChunkHeader {
    pub kind: ChunkKind,
    pub sequence: u64,
    pub total_chunks: u16,
    pub chunk_index: u16,
}
impl Debug for ChunkHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}#{}[{}/{}]", self.kind, self.sequence, self.chunk_index, self.total_chunks)
    }
}

impl ChunkHeader {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind.into());
        buf.put_u64(self.sequence);
        buf.put_u16(self.total_chunks);
        buf.put_u16(self.chunk_index);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ChunkHeader> {
        let raw_kind = buf.try_get_u8()?;
        let kind = ChunkKind::try_from(raw_kind)
            .map_err(|_| anyhow!("invalid chunk kind marker {:?}", raw_kind as char))?;
        let sequence = buf.try_get_u64()?;
        let total_chunks = buf.try_get_u16()?;
        let chunk_index = buf.try_get_u16()?;

        if total_chunks == 0 {
            return Err(anyhow!("chunk header with zero total chunks"));
        }
        if chunk_index >= total_chunks {
            return Err(anyhow!("chunk index {} is out of range for {} chunks", chunk_index, total_chunks));
        }

        Ok(ChunkHeader {
            kind,
            sequence,
            total_chunks,
            chunk_index,
        })
    }

    pub fn ack(&self) -> ChunkHeader {
        ChunkHeader {
            kind: ChunkKind::Ack,
            ..*self
        }
    }

    pub fn is_last(&self) -> bool {
        self.chunk_index + 1 == self.total_chunks
    }
}

pub fn total_chunks(message_len: usize, chunk_size: usize) -> usize {
    message_len.div_ceil(chunk_size)
}

/// the slice of `message` that chunk number `chunk_index` carries
pub fn chunk_payload(message: &[u8], chunk_size: usize, chunk_index: u16) -> &[u8] {
    let start = chunk_index as usize * chunk_size;
    let end = usize::min(start + chunk_size, message.len());
    &message[start..end]
}

pub fn write_chunk(header: &ChunkHeader, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    header.ser(&mut buf);
    buf.put_slice(payload);
    buf
}
