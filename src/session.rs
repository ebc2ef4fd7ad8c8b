use crate::connection::{HandshakeInfo, ReadyState};
use crate::error::Error;
use crate::frame::CloseCode;
use crate::message::Message;
use crate::split::WSWriter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

pub type ID = Uuid;

// Fresh opaque 128-bit id for every session a service accepts
pub(crate) fn generate_session_id() -> ID {
    let mut rng = StdRng::from_rng(&mut rand::rng());
    let buf = rng.random::<[u8; 16]>();

    Uuid::new_v8(buf)
}

/// One registered connection of a service: the send surface plus what its
/// handshake settled on, under the id the manager knows it by. Clones share
/// the underlying connection.
#[derive(Clone)]
pub struct Session {
    id: ID,
    writer: WSWriter,
    info: HandshakeInfo,
}

impl Session {
    pub(crate) fn new(writer: WSWriter, info: HandshakeInfo) -> Self {
        Self {
            id: generate_session_id(),
            writer,
            info,
        }
    }

    pub fn id(&self) -> ID {
        self.id
    }

    pub fn writer(&self) -> &WSWriter {
        &self.writer
    }

    pub fn handshake_info(&self) -> &HandshakeInfo {
        &self.info
    }

    pub fn ready_state(&self) -> ReadyState {
        self.writer.ready_state()
    }

    pub async fn send_message(&self, message: Message) -> Result<(), Error> {
        self.writer.send_message(message).await
    }

    pub async fn send_as_text(&self, data: String) -> Result<(), Error> {
        self.writer.send_as_text(data).await
    }

    pub async fn send_as_binary(&self, data: Vec<u8>) -> Result<(), Error> {
        self.writer.send_as_binary(data).await
    }

    pub async fn ping(&self, payload: Vec<u8>) -> Result<bool, Error> {
        self.writer.ping(payload).await
    }

    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<bool, Error> {
        self.writer.close(code, reason).await
    }
}
