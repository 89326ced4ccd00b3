use bytes::{BufMut, BytesMut};
use tracing::trace;

use crate::error::TransportError;

pub const FRAME_MARKER: u8 = b'!';
pub const SIZE_TERMINATOR: u8 = b':';

/// reserved payloads for keepalive, they are handled by the connection and never reach the inbox
pub const KEEPALIVE_PING: &[u8] = b"%k";
pub const KEEPALIVE_ACK: &[u8] = b"%a";

pub fn is_keepalive(payload: &[u8]) -> bool {
    payload == KEEPALIVE_PING || payload == KEEPALIVE_ACK
}

/// `'!' <decimal size> ':' <payload>`
pub fn encode_frame(payload: &[u8]) -> BytesMut {
    let size = payload.len().to_string();
    let mut buf = BytesMut::with_capacity(payload.len() + size.len() + 2);
    buf.put_u8(FRAME_MARKER);
    buf.put_slice(size.as_bytes());
    buf.put_u8(SIZE_TERMINATOR);
    buf.put_slice(payload);
    buf
}

#[derive(Debug)]
enum DecoderState {
    SeekMarker,
    Size { size: usize, num_digits: usize },
    Payload { buf: Vec<u8>, remaining: usize },
}

/// Incremental decoder for the frames of a single TCP stream. Bytes can arrive in arbitrary
///  pieces, so the decoder keeps its state between calls.
///
/// Garbage in front of a frame marker is skipped, and so is a frame with an empty or
///  non-numeric size. A frame that announces more than the maximum frame size is an error
///  since there is no way to skip it reliably. Frames that were complete before the error are
///  still appended to `frames`.
pub struct FrameDecoder {
    max_frame_size: usize,
    state: DecoderState,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> FrameDecoder {
        FrameDecoder {
            max_frame_size,
            state: DecoderState::SeekMarker,
        }
    }

    pub fn decode(&mut self, mut data: &[u8], frames: &mut Vec<Vec<u8>>) -> Result<(), TransportError> {
        while !data.is_empty() {
            match &mut self.state {
                DecoderState::SeekMarker => {
                    match data.iter().position(|b| *b == FRAME_MARKER) {
                        Some(pos) => {
                            if pos > 0 {
                                trace!("skipping {} bytes of garbage before frame marker", pos);
                            }
                            data = &data[pos + 1..];
                            self.state = DecoderState::Size { size: 0, num_digits: 0 };
                        }
                        None => {
                            trace!("skipping {} bytes of garbage", data.len());
                            data = &[];
                        }
                    }
                }
                DecoderState::Size { size, num_digits } => {
                    let b = data[0];
                    data = &data[1..];

                    match b {
                        b'0'..=b'9' => {
                            let new_size = size.checked_mul(10)
                                .and_then(|s| s.checked_add((b - b'0') as usize))
                                .filter(|s| *s <= self.max_frame_size);
                            match new_size {
                                Some(new_size) => {
                                    *size = new_size;
                                    *num_digits += 1;
                                }
                                None => {
                                    self.state = DecoderState::SeekMarker;
                                    return Err(TransportError::MalformedWireData(format!("frame size exceeds the maximum of {} bytes", self.max_frame_size)));
                                }
                            }
                        }
                        SIZE_TERMINATOR if *size > 0 => {
                            self.state = DecoderState::Payload { buf: Vec::with_capacity(*size), remaining: *size };
                        }
                        SIZE_TERMINATOR => {
                            trace!("frame with empty size ({} digits) - resynchronizing", num_digits);
                            self.state = DecoderState::SeekMarker;
                        }
                        FRAME_MARKER => {
                            trace!("unexpected frame marker in frame size - restarting frame");
                            self.state = DecoderState::Size { size: 0, num_digits: 0 };
                        }
                        _ => {
                            trace!("unexpected byte {} in frame size - resynchronizing", b);
                            self.state = DecoderState::SeekMarker;
                        }
                    }
                }
                DecoderState::Payload { buf, remaining } => {
                    let n = (*remaining).min(data.len());
                    buf.extend_from_slice(&data[..n]);
                    *remaining -= n;
                    data = &data[n..];

                    if *remaining == 0 {
                        frames.push(std::mem::take(buf));
                        self.state = DecoderState::SeekMarker;
                    }
                }
            }
        }
        Ok(())
    }
}
