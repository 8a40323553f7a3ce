//! RFC 6455 frame codec.
//!
//! Decoding works on a buffer the connection task keeps filling, so a frame
//! split across several reads simply decodes as `Ok(None)` until it is whole.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Frame opcode (RFC 6455 §5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value & 0x0F {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    /// Close, ping and pong.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// Close status codes the server sends itself.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Codes that may appear on the wire. 1005 and 1006 are local-only.
pub fn is_valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

/// Violations of the framing protocol. Each maps to the close code the
/// server answers with before tearing the connection down.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("reserved bits set without a negotiated extension")]
    ReservedBits,
    #[error("unknown opcode 0x{0:X}")]
    UnknownOpcode(u8),
    #[error("client frame is not masked")]
    Unmasked,
    #[error("server frame is masked")]
    Masked,
    #[error("control frame is fragmented")]
    FragmentedControl,
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlTooLong(usize),
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,
    #[error("new data frame while a fragmented message is in progress")]
    InterleavedMessage,
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: usize },
    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed close payload")]
    InvalidClosePayload,
    #[error("close code {0} may not be sent")]
    InvalidCloseCode(u16),
}

impl FrameError {
    pub fn close_code(&self) -> u16 {
        match self {
            FrameError::TooLarge { .. } => close_code::MESSAGE_TOO_BIG,
            FrameError::InvalidUtf8 => close_code::INVALID_PAYLOAD,
            _ => close_code::PROTOCOL_ERROR,
        }
    }
}

/// Which end of the connection is decoding. Clients must mask, servers must not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// One frame as it appears on the wire, payload unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

/// A complete protocol unit after reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    /// Status code and reason, absent when the peer sent an empty close.
    Close(Option<(u16, String)>),
}

impl Frame {
    pub fn close(code: u16, reason: &str) -> Self {
        Frame::Close(Some((code, reason.to_string())))
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Frame::Text(_) => Opcode::Text,
            Frame::Binary(_) => Opcode::Binary,
            Frame::Ping(_) => Opcode::Ping,
            Frame::Pong(_) => Opcode::Pong,
            Frame::Close(_) => Opcode::Close,
        }
    }

    fn payload(&self) -> Bytes {
        match self {
            Frame::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
            Frame::Binary(data) | Frame::Ping(data) | Frame::Pong(data) => data.clone(),
            Frame::Close(None) => Bytes::new(),
            Frame::Close(Some((code, reason))) => {
                let mut payload = BytesMut::with_capacity(2 + reason.len());
                payload.put_u16(*code);
                // 125 byte control limit minus the code
                let mut end = reason.len().min(123);
                while end > 0 && !reason.is_char_boundary(end) {
                    end -= 1;
                }
                payload.extend_from_slice(&reason.as_bytes()[..end]);
                payload.freeze()
            }
        }
    }

    /// Checks the frame can legally go on the wire: control payloads fit in
    /// 125 bytes and close codes are sendable.
    pub fn validate(&self) -> Result<(), FrameError> {
        match self {
            Frame::Ping(data) | Frame::Pong(data) if data.len() > 125 => {
                Err(FrameError::ControlTooLong(data.len()))
            }
            Frame::Close(Some((code, _))) if !is_valid_close_code(*code) => {
                Err(FrameError::InvalidCloseCode(*code))
            }
            _ => Ok(()),
        }
    }
}

/// Serializes a single unfragmented frame. Servers pass `None`; clients must
/// pass a mask.
pub fn encode_frame(frame: &Frame, mask: Option<[u8; 4]>) -> Result<Bytes, FrameError> {
    frame.validate()?;
    let payload = frame.payload();
    let len = payload.len();
    let mut buf = BytesMut::with_capacity(len + 14);

    // FIN + opcode
    buf.put_u8(0x80 | frame.opcode().to_u8());

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if len < 126 {
        buf.put_u8(mask_bit | len as u8);
    } else if len <= 0xFFFF {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(len as u64);
    }

    match mask {
        Some(key) => {
            buf.extend_from_slice(&key);
            buf.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        }
        None => buf.extend_from_slice(&payload),
    }

    Ok(buf.freeze())
}

/// Decodes one frame from the front of `buf`, consuming it.
///
/// Returns `Ok(None)` when the buffer does not yet hold a whole frame. The
/// size limit is checked as soon as the length is known, before the payload
/// arrives.
pub fn decode_frame(
    buf: &mut BytesMut,
    role: Role,
    max_payload: usize,
) -> Result<Option<RawFrame>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = buf[0] & 0x80 != 0;
    if buf[0] & 0x70 != 0 {
        return Err(FrameError::ReservedBits);
    }
    let opcode = Opcode::from_u8(buf[0])?;
    let masked = buf[1] & 0x80 != 0;
    match role {
        Role::Server if !masked => return Err(FrameError::Unmasked),
        Role::Client if masked => return Err(FrameError::Masked),
        _ => {}
    }

    let (payload_len, mut offset): (u64, usize) = match buf[1] & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut len = [0u8; 8];
            len.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(len), 10)
        }
        n => (n as u64, 2),
    };

    // Validate control frame constraints (RFC 6455 §5.5)
    if opcode.is_control() {
        if !fin {
            return Err(FrameError::FragmentedControl);
        }
        if payload_len > 125 {
            return Err(FrameError::ControlTooLong(payload_len as usize));
        }
    }

    if payload_len > max_payload as u64 {
        return Err(FrameError::TooLarge {
            size: payload_len,
            limit: max_payload,
        });
    }
    let payload_len = payload_len as usize;

    let mask_key = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    if buf.len() < offset + payload_len {
        return Ok(None);
    }

    buf.advance(offset);
    let mut payload = buf.split_to(payload_len);
    if let Some(key) = mask_key {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }

    Ok(Some(RawFrame {
        fin,
        opcode,
        payload: payload.freeze(),
    }))
}

/// Rebuilds messages from fragments and turns raw frames into [`Frame`]s.
///
/// Control frames may arrive between fragments and pass straight through.
#[derive(Debug)]
pub struct Reassembler {
    limit: usize,
    message: Option<(Opcode, BytesMut)>,
}

impl Reassembler {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            message: None,
        }
    }

    pub fn push(&mut self, raw: RawFrame) -> Result<Option<Frame>, FrameError> {
        match raw.opcode {
            Opcode::Ping => Ok(Some(Frame::Ping(raw.payload))),
            Opcode::Pong => Ok(Some(Frame::Pong(raw.payload))),
            Opcode::Close => parse_close(&raw.payload).map(|c| Some(Frame::Close(c))),
            Opcode::Text | Opcode::Binary => {
                if self.message.is_some() {
                    return Err(FrameError::InterleavedMessage);
                }
                if raw.fin {
                    return complete(raw.opcode, raw.payload).map(Some);
                }
                self.message = Some((raw.opcode, BytesMut::from(&raw.payload[..])));
                Ok(None)
            }
            Opcode::Continuation => {
                let Some((_, buf)) = self.message.as_mut() else {
                    return Err(FrameError::UnexpectedContinuation);
                };
                let size = buf.len() + raw.payload.len();
                if size > self.limit {
                    return Err(FrameError::TooLarge {
                        size: size as u64,
                        limit: self.limit,
                    });
                }
                buf.extend_from_slice(&raw.payload);
                if !raw.fin {
                    return Ok(None);
                }
                match self.message.take() {
                    Some((opcode, buf)) => complete(opcode, buf.freeze()).map(Some),
                    None => Err(FrameError::UnexpectedContinuation),
                }
            }
        }
    }
}

fn complete(opcode: Opcode, payload: Bytes) -> Result<Frame, FrameError> {
    match opcode {
        Opcode::Text => String::from_utf8(payload.to_vec())
            .map(Frame::Text)
            .map_err(|_| FrameError::InvalidUtf8),
        _ => Ok(Frame::Binary(payload)),
    }
}

fn parse_close(payload: &[u8]) -> Result<Option<(u16, String)>, FrameError> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(FrameError::InvalidClosePayload),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_valid_close_code(code) {
                return Err(FrameError::InvalidClosePayload);
            }
            let reason =
                std::str::from_utf8(&payload[2..]).map_err(|_| FrameError::InvalidUtf8)?;
            Ok(Some((code, reason.to_string())))
        }
    }
}
