//! Binary frame layout and the codec that reads and writes it.
//!
//! Every datagram exchanged between peers is exactly one [`Frame`]. The
//! layout is fixed per message kind (no tags, no lengths per field), so a
//! frame is only meaningful once its kind byte has been read.
//!
//! # Wire format
//!
//! All multi-byte integers are **little-endian**. `size` is the length of
//! the whole frame, header included.
//!
//! ```text
//! offset  0     1       3          11         13 / 15      ...
//!        +----+-------+----------+----------------------------
//!        |kind| size  | peer id  | kind-specific fields
//!        +----+-------+----------+----------------------------
//! ```
//!
//! | Kind            | Fields after `kind`, `size`                         | Length |
//! |-----------------|-----------------------------------------------------|--------|
//! | `CONNECT`       | version u8                                          | 4      |
//! | `CONNECT_ACK`   | peer id u64, version u8                             | 12     |
//! | `DISCONNECT`    | peer id                                             | 11     |
//! | `PING`, `PONG`  | peer id, ping id u16, timestamp u64 (ms, Unix)      | 21     |
//! | `CREATE_STREAM`, `CLOSE_STREAM` | peer id, stream id u32              | 15     |
//! | `DATA`          | peer id, stream id, data size u16, flags u16, part id u8, part total u8, message id u16, payload | 23 + n |
//! | `DATA_ACK`      | peer id, stream id, payload                         | 15 + n |
//!
//! No I/O happens here; this is pure data transformation.

use bytes::{Buf, BufMut, BytesMut};

use crate::{MessageKind, PeerId, ProtocolError, StreamFlags, StreamId};

/// Length of a CONNECT frame.
pub const CONNECT_LEN: usize = 4;
/// Length of a CONNECT_ACK frame.
pub const CONNECT_ACK_LEN: usize = 12;
/// Length of a DISCONNECT frame.
pub const DISCONNECT_LEN: usize = 11;
/// Length of a PING or PONG frame.
pub const PING_LEN: usize = 21;
/// Length of a CREATE_STREAM or CLOSE_STREAM frame.
pub const STREAM_CONTROL_LEN: usize = 15;
/// Length of the DATA header in front of the part bytes.
pub const DATA_HEADER_LEN: usize = 23;
/// Length of the DATA_ACK header in front of its (optional) payload.
pub const DATA_ACK_HEADER_LEN: usize = 15;

/// One part of a (possibly fragmented) payload sent on a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Session the part belongs to.
    pub peer_id: PeerId,
    /// Stream the part belongs to.
    pub stream_id: StreamId,
    /// The sender's stream flags at the time of sending.
    pub flags: StreamFlags,
    /// Index of this part, `0..part_total`.
    pub part_id: u8,
    /// Number of parts in the message (at least 1).
    pub part_total: u8,
    /// Shared by every part of one message; wraps.
    pub message_id: u16,
    /// The part bytes.
    pub payload: Vec<u8>,
}

/// A decoded frame, one variant per [`MessageKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client → server: opens a session.
    Connect { version: u8 },
    /// Server → client: accepts a session and assigns its peer id.
    ConnectAck { peer_id: PeerId, version: u8 },
    /// Either direction: ends the session immediately.
    Disconnect { peer_id: PeerId },
    /// Client → server keepalive.
    Ping {
        peer_id: PeerId,
        ping_id: u16,
        timestamp: u64,
    },
    /// Server → client reply to a ping, echoing its `ping_id`.
    Pong {
        peer_id: PeerId,
        ping_id: u16,
        timestamp: u64,
    },
    /// Announces a new stream so the peer can mirror it.
    CreateStream { peer_id: PeerId, stream_id: StreamId },
    /// Tells the peer a stream is gone.
    CloseStream { peer_id: PeerId, stream_id: StreamId },
    /// One part of a stream payload.
    Data(DataFrame),
    /// Acknowledges a fully reassembled payload on a reliable stream.
    DataAck {
        peer_id: PeerId,
        stream_id: StreamId,
        payload: Vec<u8>,
    },
}

impl Frame {
    /// The kind byte this frame is written with.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Connect { .. } => MessageKind::Connect,
            Self::ConnectAck { .. } => MessageKind::ConnectAck,
            Self::Disconnect { .. } => MessageKind::Disconnect,
            Self::Ping { .. } => MessageKind::Ping,
            Self::Pong { .. } => MessageKind::Pong,
            Self::CreateStream { .. } => MessageKind::CreateStream,
            Self::CloseStream { .. } => MessageKind::CloseStream,
            Self::Data(_) => MessageKind::Data,
            Self::DataAck { .. } => MessageKind::DataAck,
        }
    }

    /// The session this frame belongs to. `None` only for CONNECT, which is
    /// sent before the server has assigned an id.
    pub fn peer_id(&self) -> Option<PeerId> {
        match self {
            Self::Connect { .. } => None,
            Self::ConnectAck { peer_id, .. }
            | Self::Disconnect { peer_id }
            | Self::Ping { peer_id, .. }
            | Self::Pong { peer_id, .. }
            | Self::CreateStream { peer_id, .. }
            | Self::CloseStream { peer_id, .. }
            | Self::DataAck { peer_id, .. } => Some(*peer_id),
            Self::Data(data) => Some(data.peer_id),
        }
    }

    /// Number of bytes [`encode`](Self::encode) will produce.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Data(data) => DATA_HEADER_LEN + data.payload.len(),
            Self::DataAck { payload, .. } => {
                DATA_ACK_HEADER_LEN + payload.len()
            }
            other => fixed_len(other.kind()),
        }
    }

    /// Serializes the frame into a newly allocated datagram.
    ///
    /// # Errors
    /// Returns [`ProtocolError::FrameTooLarge`] if the frame is longer than
    /// the 16-bit size field can express.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.encoded_len();
        let size = u16::try_from(len)
            .map_err(|_| ProtocolError::FrameTooLarge(len))?;

        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(self.kind().as_byte());
        buf.put_u16_le(size);

        match self {
            Self::Connect { version } => buf.put_u8(*version),
            Self::ConnectAck { peer_id, version } => {
                buf.put_u64_le(peer_id.0);
                buf.put_u8(*version);
            }
            Self::Disconnect { peer_id } => buf.put_u64_le(peer_id.0),
            Self::Ping {
                peer_id,
                ping_id,
                timestamp,
            }
            | Self::Pong {
                peer_id,
                ping_id,
                timestamp,
            } => {
                buf.put_u64_le(peer_id.0);
                buf.put_u16_le(*ping_id);
                buf.put_u64_le(*timestamp);
            }
            Self::CreateStream { peer_id, stream_id }
            | Self::CloseStream { peer_id, stream_id } => {
                buf.put_u64_le(peer_id.0);
                buf.put_u32_le(stream_id.0);
            }
            Self::Data(data) => {
                buf.put_u64_le(data.peer_id.0);
                buf.put_u32_le(data.stream_id.0);
                // Fits: the whole frame already fit in a u16.
                buf.put_u16_le(data.payload.len() as u16);
                buf.put_u16_le(data.flags.0);
                buf.put_u8(data.part_id);
                buf.put_u8(data.part_total);
                buf.put_u16_le(data.message_id);
                buf.put_slice(&data.payload);
            }
            Self::DataAck {
                peer_id,
                stream_id,
                payload,
            } => {
                buf.put_u64_le(peer_id.0);
                buf.put_u32_le(stream_id.0);
                buf.put_slice(payload);
            }
        }

        Ok(buf.to_vec())
    }

    /// Parses a frame from a received datagram.
    ///
    /// # Errors
    /// Returns [`ProtocolError::MalformedFrame`] if:
    /// - the buffer is empty or starts with an unknown kind byte,
    /// - the buffer is shorter than the kind's fixed header,
    /// - the `size` field disagrees with the buffer length,
    /// - a fixed-length kind carries trailing bytes,
    /// - a DATA frame's `data size` disagrees with its payload, or its part
    ///   numbering is impossible (`part_total == 0`, `part_id >= part_total`).
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let Some(&kind_byte) = data.first() else {
            return Err(malformed("empty datagram"));
        };
        let kind = MessageKind::from_byte(kind_byte).ok_or_else(|| {
            malformed(format!("unknown message kind {kind_byte}"))
        })?;

        let min = min_len(kind);
        if data.len() < min {
            return Err(malformed(format!(
                "{kind} needs at least {min} bytes, got {}",
                data.len()
            )));
        }

        // The length check above makes every `get_*` below in bounds.
        let mut buf = &data[1..];
        let size = usize::from(buf.get_u16_le());
        if size != data.len() {
            return Err(malformed(format!(
                "{kind} declares {size} bytes but {} were received",
                data.len()
            )));
        }
        if is_fixed_len(kind) && data.len() != min {
            return Err(malformed(format!(
                "{kind} must be exactly {min} bytes, got {}",
                data.len()
            )));
        }

        let frame = match kind {
            MessageKind::Connect => Self::Connect {
                version: buf.get_u8(),
            },
            MessageKind::ConnectAck => Self::ConnectAck {
                peer_id: PeerId(buf.get_u64_le()),
                version: buf.get_u8(),
            },
            MessageKind::Disconnect => Self::Disconnect {
                peer_id: PeerId(buf.get_u64_le()),
            },
            MessageKind::Ping | MessageKind::Pong => {
                let peer_id = PeerId(buf.get_u64_le());
                let ping_id = buf.get_u16_le();
                let timestamp = buf.get_u64_le();
                if kind == MessageKind::Ping {
                    Self::Ping {
                        peer_id,
                        ping_id,
                        timestamp,
                    }
                } else {
                    Self::Pong {
                        peer_id,
                        ping_id,
                        timestamp,
                    }
                }
            }
            MessageKind::CreateStream | MessageKind::CloseStream => {
                let peer_id = PeerId(buf.get_u64_le());
                let stream_id = StreamId(buf.get_u32_le());
                if kind == MessageKind::CreateStream {
                    Self::CreateStream { peer_id, stream_id }
                } else {
                    Self::CloseStream { peer_id, stream_id }
                }
            }
            MessageKind::Data => Self::Data(decode_data(buf)?),
            MessageKind::DataAck => Self::DataAck {
                peer_id: PeerId(buf.get_u64_le()),
                stream_id: StreamId(buf.get_u32_le()),
                payload: buf.to_vec(),
            },
        };

        Ok(frame)
    }
}

/// Reads the DATA fields that follow `kind` and `size`.
fn decode_data(mut buf: &[u8]) -> Result<DataFrame, ProtocolError> {
    let peer_id = PeerId(buf.get_u64_le());
    let stream_id = StreamId(buf.get_u32_le());
    let data_size = usize::from(buf.get_u16_le());
    let flags = StreamFlags(buf.get_u16_le());
    let part_id = buf.get_u8();
    let part_total = buf.get_u8();
    let message_id = buf.get_u16_le();

    if data_size != buf.remaining() {
        return Err(malformed(format!(
            "DATA declares {data_size} payload bytes but carries {}",
            buf.remaining()
        )));
    }
    if part_total == 0 || part_id >= part_total {
        return Err(malformed(format!(
            "DATA part {part_id} of {part_total} is out of range"
        )));
    }

    Ok(DataFrame {
        peer_id,
        stream_id,
        flags,
        part_id,
        part_total,
        message_id,
        payload: buf.to_vec(),
    })
}

fn malformed(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::MalformedFrame(reason.into())
}

/// Smallest valid length for a frame of `kind`.
fn min_len(kind: MessageKind) -> usize {
    match kind {
        MessageKind::Data => DATA_HEADER_LEN,
        MessageKind::DataAck => DATA_ACK_HEADER_LEN,
        other => fixed_len(other),
    }
}

fn is_fixed_len(kind: MessageKind) -> bool {
    !matches!(kind, MessageKind::Data | MessageKind::DataAck)
}

fn fixed_len(kind: MessageKind) -> usize {
    match kind {
        MessageKind::Connect => CONNECT_LEN,
        MessageKind::ConnectAck => CONNECT_ACK_LEN,
        MessageKind::Disconnect => DISCONNECT_LEN,
        MessageKind::Ping | MessageKind::Pong => PING_LEN,
        MessageKind::CreateStream | MessageKind::CloseStream => {
            STREAM_CONTROL_LEN
        }
        MessageKind::Data => DATA_HEADER_LEN,
        MessageKind::DataAck => DATA_ACK_HEADER_LEN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamOrigin;

    fn data_frame(payload: &[u8]) -> DataFrame {
        DataFrame {
            peer_id: PeerId(0x0102_0304_0506_0708),
            stream_id: StreamId::new(5, true, StreamOrigin::Client),
            flags: StreamFlags(0x8001),
            part_id: 1,
            part_total: 3,
            message_id: 0xBEEF,
            payload: payload.to_vec(),
        }
    }

    fn assert_malformed(result: Result<Frame, ProtocolError>) {
        assert!(
            matches!(result, Err(ProtocolError::MalformedFrame(_))),
            "expected MalformedFrame, got {result:?}"
        );
    }

    // =====================================================================
    // Layout
    // =====================================================================

    #[test]
    fn test_encode_connect_layout() {
        let bytes = Frame::Connect { version: 1 }.encode().unwrap();
        assert_eq!(bytes, vec![0, 4, 0, 1]);
    }

    #[test]
    fn test_encode_data_header_little_endian() {
        let bytes = Frame::Data(data_frame(b"xyz")).encode().unwrap();

        assert_eq!(bytes.len(), DATA_HEADER_LEN + 3);
        assert_eq!(bytes[0], MessageKind::Data.as_byte());
        assert_eq!(&bytes[1..3], &[26, 0]);
        assert_eq!(
            &bytes[3..11],
            &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
        assert_eq!(&bytes[11..15], &[5, 0, 0, 0x80]);
        assert_eq!(&bytes[15..17], &[3, 0]);
        assert_eq!(&bytes[17..19], &[0x01, 0x80]);
        assert_eq!(bytes[19], 1);
        assert_eq!(bytes[20], 3);
        assert_eq!(&bytes[21..23], &[0xEF, 0xBE]);
        assert_eq!(&bytes[23..], b"xyz");
    }

    #[test]
    fn test_encoded_len_matches_fixed_lengths() {
        let peer_id = PeerId(1);
        let stream_id = StreamId(2);
        let cases = [
            (Frame::Connect { version: 1 }, CONNECT_LEN),
            (Frame::ConnectAck { peer_id, version: 1 }, CONNECT_ACK_LEN),
            (Frame::Disconnect { peer_id }, DISCONNECT_LEN),
            (
                Frame::Ping {
                    peer_id,
                    ping_id: 1,
                    timestamp: 2,
                },
                PING_LEN,
            ),
            (Frame::CloseStream { peer_id, stream_id }, STREAM_CONTROL_LEN),
        ];
        for (frame, len) in cases {
            assert_eq!(frame.encode().unwrap().len(), len, "{}", frame.kind());
        }
    }

    // =====================================================================
    // Decoding
    // =====================================================================

    #[test]
    fn test_decode_data_restores_every_field() {
        let frame = Frame::Data(data_frame(b"hello"));
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_decode_pong_keeps_ping_id_and_timestamp() {
        let frame = Frame::Pong {
            peer_id: PeerId(9),
            ping_id: 513,
            timestamp: 1_700_000_000_123,
        };
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.peer_id(), Some(PeerId(9)));
    }

    #[test]
    fn test_decode_empty_data_ack_payload() {
        let frame = Frame::DataAck {
            peer_id: PeerId(3),
            stream_id: StreamId(4),
            payload: Vec::new(),
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes.len(), DATA_ACK_HEADER_LEN);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_decode_empty_buffer_is_malformed() {
        assert_malformed(Frame::decode(&[]));
    }

    #[test]
    fn test_decode_unknown_kind_is_malformed() {
        assert_malformed(Frame::decode(&[42, 3, 0]));
    }

    #[test]
    fn test_decode_truncated_header_is_malformed() {
        let bytes = Frame::Disconnect { peer_id: PeerId(1) }.encode().unwrap();
        assert_malformed(Frame::decode(&bytes[..DISCONNECT_LEN - 1]));
    }

    #[test]
    fn test_decode_size_mismatch_is_malformed() {
        let mut bytes = Frame::Data(data_frame(b"abcd")).encode().unwrap();
        bytes.pop();
        assert_malformed(Frame::decode(&bytes));
    }

    #[test]
    fn test_decode_fixed_kind_with_trailing_bytes_is_malformed() {
        let mut bytes = Frame::Connect { version: 1 }.encode().unwrap();
        bytes.push(0);
        bytes[1] = 5;
        assert_malformed(Frame::decode(&bytes));
    }

    #[test]
    fn test_decode_data_size_mismatch_is_malformed() {
        let mut bytes = Frame::Data(data_frame(b"abcd")).encode().unwrap();
        bytes[15] = 9;
        assert_malformed(Frame::decode(&bytes));
    }

    #[test]
    fn test_decode_part_out_of_range_is_malformed() {
        let mut frame = data_frame(b"abcd");
        frame.part_id = 3;
        let bytes = Frame::Data(frame).encode().unwrap();
        assert_malformed(Frame::decode(&bytes));
    }

    #[test]
    fn test_decode_zero_part_total_is_malformed() {
        let mut frame = data_frame(b"");
        frame.part_id = 0;
        frame.part_total = 0;
        let bytes = Frame::Data(frame).encode().unwrap();
        assert_malformed(Frame::decode(&bytes));
    }

    // =====================================================================
    // Encoding limits
    // =====================================================================

    #[test]
    fn test_encode_oversized_frame_fails() {
        let frame = Frame::Data(data_frame(&vec![0; u16::MAX as usize]));
        assert!(matches!(
            frame.encode(),
            Err(ProtocolError::FrameTooLarge(len)) if len == DATA_HEADER_LEN + u16::MAX as usize
        ));
    }

    #[test]
    fn test_connect_has_no_peer_id() {
        assert_eq!(Frame::Connect { version: 1 }.peer_id(), None);
    }
}
