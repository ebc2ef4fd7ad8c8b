use crate::error::Error;
use crate::frame::{apply_mask, Frame};
use crate::stream::SocketMeshStream;
use tokio::io::{AsyncWriteExt, WriteHalf};

/// Which end of the connection this peer is. Clients mask every outgoing
/// frame; servers never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn is_client(&self) -> bool {
        matches!(self, Role::Client)
    }
}

/// The write half of a connection. Exactly one of these exists per
/// connection, behind a mutex, so frames reach the wire in lock-acquisition
/// order and fragments of one message never interleave with another send.
pub struct Writer {
    write_half: WriteHalf<SocketMeshStream>,
    role: Role,
}

impl Writer {
    pub fn new(write_half: WriteHalf<SocketMeshStream>, role: Role) -> Self {
        Self { write_half, role }
    }

    pub async fn write_frame(&mut self, frame: Frame, set_rsv1: bool) -> Result<(), Error> {
        // The first byte carries FIN, the RSV bits and the opcode.
        // (frame.final_fragment as u8) << 7 puts FIN at the top bit, and the
        // opcode fills the low nibble.
        let mut first_byte = (frame.final_fragment as u8) << 7 | frame.opcode.as_u8();

        // RSV1 marks the first frame of a compressed message
        if set_rsv1 {
            first_byte |= 0x40;
        }

        let payload_len = frame.payload.len();
        let masked_bit = if self.role.is_client() { 0b1000_0000 } else { 0 };

        let mut header: Vec<u8> = Vec::with_capacity(14);
        header.push(first_byte);

        // Payload lengths up to 125 fit the 7 length bits directly; up to
        // 65535 they go as 126 plus a 16-bit big-endian word; anything larger
        // as 127 plus a 64-bit big-endian word. The encoder always picks the
        // shortest form.
        if payload_len <= 125 {
            header.push(masked_bit | payload_len as u8);
        } else if payload_len <= 65535 {
            header.push(masked_bit | 126);
            header.extend_from_slice(&(payload_len as u16).to_be_bytes());
        } else {
            header.push(masked_bit | 127);
            header.extend_from_slice(&(payload_len as u64).to_be_bytes());
        }

        if self.role.is_client() {
            // Every client frame gets a fresh 4-byte key
            let mask: [u8; 4] = rand::random();
            header.extend_from_slice(&mask);
            self.write_half.write_all(&header).await?;

            let mut masked_payload = frame.payload;
            apply_mask(&mut masked_payload, mask);
            self.write_half.write_all(&masked_payload).await?;
        } else {
            self.write_half.write_all(&header).await?;
            self.write_half.write_all(&frame.payload).await?;
        }

        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        self.write_half.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), Error> {
        self.write_half.shutdown().await?;
        Ok(())
    }
}
