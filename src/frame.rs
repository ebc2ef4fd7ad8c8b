use crate::error::Error;

/// Frame opcodes as defined by RFC 6455 section 5.2. The nibbles not listed
/// here (0x3-0x7 and 0xB-0xF) are reserved, and receiving one of them fails
/// the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continue,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from(byte: u8) -> Result<Self, Error> {
        match byte {
            0x0 => Ok(OpCode::Continue),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(Error::ReservedOpcode(other)),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continue => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    pub fn is_data(&self) -> bool {
        matches!(self, OpCode::Text | OpCode::Binary)
    }
}

/// Close status codes from RFC 6455 section 7.4.1.
///
/// `NoStatus`, `Abnormal` and `TlsFailure` only exist to describe a closure
/// locally and must never appear inside a close frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    Away,
    Protocol,
    Unsupported,
    NoStatus,
    Abnormal,
    InvalidData,
    Policy,
    TooBig,
    Extension,
    ServerError,
    TlsFailure,
    Other(u16),
}

impl CloseCode {
    pub fn from_u16(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::NoStatus,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::InvalidData,
            1008 => CloseCode::Policy,
            1009 => CloseCode::TooBig,
            1010 => CloseCode::Extension,
            1011 => CloseCode::ServerError,
            1015 => CloseCode::TlsFailure,
            other => CloseCode::Other(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InvalidData => 1007,
            CloseCode::Policy => 1008,
            CloseCode::TooBig => 1009,
            CloseCode::Extension => 1010,
            CloseCode::ServerError => 1011,
            CloseCode::TlsFailure => 1015,
            CloseCode::Other(code) => *code,
        }
    }

    /// Whether this code may be carried inside a close frame. 1005, 1006 and
    /// 1015 are reserved for local reporting, codes below 1000 are not
    /// defined, and the private range 3000-4999 is the only open space above
    /// the protocol-reserved block.
    pub fn is_allowed_on_wire(&self) -> bool {
        match self {
            CloseCode::NoStatus | CloseCode::Abnormal | CloseCode::TlsFailure => false,
            CloseCode::Other(code) => matches!(*code, 3000..=4999),
            _ => true,
        }
    }
}

/// Code/reason pair carried by a close frame, or recorded locally when the
/// connection dies without one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Parses a close frame payload. An empty payload means no status was
    /// given, a single byte is malformed, and a non-UTF-8 reason fails with
    /// an inconsistent-data error.
    pub fn parse(payload: &[u8]) -> Result<Option<Self>, Error> {
        match payload.len() {
            0 => Ok(None),
            1 => Err(Error::InvalidClosePayload),
            _ => {
                let code = CloseCode::from_u16(u16::from_be_bytes([payload[0], payload[1]]));
                let reason = String::from_utf8(payload[2..].to_vec())?;
                Ok(Some(CloseFrame::new(code, reason)))
            }
        }
    }

    /// Serializes into a close frame payload: big-endian code followed by the
    /// UTF-8 reason. The reason is capped at 123 bytes so the whole control
    /// payload stays within 125.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        if !self.code.is_allowed_on_wire() {
            return Err(Error::InvalidCloseCode(self.code.as_u16()));
        }
        if self.reason.len() > 123 {
            return Err(Error::CloseReasonTooLong);
        }
        let mut payload = Vec::with_capacity(2 + self.reason.len());
        payload.extend_from_slice(&self.code.as_u16().to_be_bytes());
        payload.extend_from_slice(self.reason.as_bytes());
        Ok(payload)
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub final_fragment: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
    pub compressed: bool,
}

impl Frame {
    pub fn new(final_fragment: bool, opcode: OpCode, payload: Vec<u8>, compressed: bool) -> Self {
        Self {
            final_fragment,
            opcode,
            payload,
            compressed,
        }
    }

    pub fn close(frame: &CloseFrame) -> Result<Self, Error> {
        Ok(Frame::new(true, OpCode::Close, frame.encode()?, false))
    }

    pub fn ping(payload: Vec<u8>) -> Self {
        Frame::new(true, OpCode::Ping, payload, false)
    }

    pub fn pong(payload: Vec<u8>) -> Self {
        Frame::new(true, OpCode::Pong, payload, false)
    }
}

// The mask is a plain XOR with the key repeated over the payload, which makes
// the operation its own inverse.
pub fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}
