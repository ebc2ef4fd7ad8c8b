use crate::error::Error;
use crate::frame::{Frame, OpCode};

/// A complete data message, after fragmentation reassembly and
/// decompression. Control frames never surface here; the connection answers
/// pings and handles close frames internally.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    // Converts a fully reassembled frame into a Message variant
    pub fn from_frame(frame: Frame) -> Result<Self, Error> {
        match frame.opcode {
            OpCode::Text => Ok(Message::Text(String::from_utf8(frame.payload)?)),
            OpCode::Binary => Ok(Message::Binary(frame.payload)),
            _ => Err(Error::InvalidOpcode),
        }
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_binary(&self) -> Vec<u8> {
        match self {
            Message::Text(text) => text.as_bytes().to_vec(),
            Message::Binary(data) => data.clone(),
        }
    }

    pub fn as_text(&self) -> Result<String, Error> {
        match self {
            Message::Text(text) => Ok(text.clone()),
            Message::Binary(data) => Ok(String::from_utf8(data.clone())?),
        }
    }

    pub fn into_payload(self) -> Vec<u8> {
        match self {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(data) => data,
        }
    }
}

/// Splits a payload into data frames of at most `fragment_size` bytes: the
/// first frame carries the message opcode, the rest are continuations, only
/// the last has FIN set.
pub(crate) fn fragment_payload(
    opcode: OpCode,
    payload: Vec<u8>,
    fragment_size: usize,
    compressed: bool,
) -> Vec<Frame> {
    if payload.is_empty() {
        return vec![Frame::new(true, opcode, payload, compressed)];
    }

    let mut frames = Vec::new();
    for chunk in payload.chunks(fragment_size) {
        frames.push(Frame::new(
            false,
            if frames.is_empty() {
                opcode
            } else {
                OpCode::Continue
            },
            chunk.to_vec(),
            compressed,
        ));
    }

    if let Some(last_frame) = frames.last_mut() {
        last_frame.final_fragment = true;
    }

    frames
}
