use crate::compression::Decoder;
use crate::config::WebSocketConfig;
use crate::connection::{ReadyState, Shared};
use crate::error::Error;
use crate::frame::{apply_mask, CloseFrame, Frame, OpCode};
use crate::message::Message;
use crate::stream::SocketMeshStream;
use crate::write::{Role, Writer};
use log::debug;
use std::io::Cursor;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, BufReader, Chain, ReadHalf};
use tokio::sync::mpsc::Sender;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

// Bound on how long a single payload read may stall. A connection that made
// it through the handshake can still trickle bytes to pin the task down.
const PAYLOAD_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// The connection's read side: whatever the handshake over-read, then the
/// socket.
pub(crate) type ConnectionReader = BufReader<Chain<Cursor<Vec<u8>>, ReadHalf<SocketMeshStream>>>;

struct FragmentedMessage {
    fragments: Vec<u8>,
    op_code: OpCode,
    compressed: bool,
}

/// The single receive task of a connection. Pulls frames off the socket,
/// reassembles fragmented messages, answers control frames and pushes
/// complete messages into the bounded channel the consumer reads from.
pub(crate) struct ReadStream {
    buf_reader: ConnectionReader,
    role: Role,
    fragmented_message: Option<FragmentedMessage>,
    read_tx: Sender<Result<Message, Error>>,
    writer: Arc<Mutex<Writer>>,
    shared: Arc<Shared>,
    config: WebSocketConfig,
    decoder: Decoder,
}

impl ReadStream {
    pub fn new(
        buf_reader: ConnectionReader,
        role: Role,
        read_tx: Sender<Result<Message, Error>>,
        writer: Arc<Mutex<Writer>>,
        shared: Arc<Shared>,
        config: WebSocketConfig,
        decoder: Decoder,
    ) -> Self {
        Self {
            buf_reader,
            role,
            fragmented_message: None,
            read_tx,
            writer,
            shared,
            config,
            decoder,
        }
    }

    pub async fn run(mut self) {
        if let Err(error) = self.poll_messages().await {
            self.handle_failure(error).await;
        }
    }

    /// Converts a failed read loop into the matching close behavior.
    /// Protocol violations get a close frame with their code on the wire;
    /// transport failures become a synthetic 1006 that never leaves the
    /// process. Either way the error reaches the consumer through the
    /// channel, never as a panic of this task.
    async fn handle_failure(&mut self, error: Error) {
        if let Some(code) = error.close_code() {
            debug!("protocol error on connection, closing with {}: {}", code.as_u16(), error);
            self.shared.transition(ReadyState::Closing);
            if self.shared.mark_close_sent() {
                if let Ok(frame) = Frame::close(&CloseFrame::new(code, "")) {
                    let mut writer = self.writer.lock().await;
                    let _ = writer.write_frame(frame, false).await;
                    let _ = writer.flush().await;
                }
            }
        } else {
            debug!("transport failure on connection: {}", error);
            self.shared
                .record_synthetic_close(CloseFrame::new(crate::frame::CloseCode::Abnormal, ""));
        }
        self.shared.transition(ReadyState::Closed);
        let _ = self.read_tx.send(Err(error)).await;
    }

    pub async fn poll_messages(&mut self) -> Result<(), Error> {
        loop {
            let frame = self.read_frame().await?;
            match frame.opcode {
                // A Text or Binary frame with FIN unset opens a fragmented
                // message; a second one before the first completes is a
                // violation
                OpCode::Text | OpCode::Binary if !frame.final_fragment => {
                    if self.fragmented_message.is_none() {
                        if frame.payload.len() > self.max_message_size() {
                            Err(Error::MaxMessageSize)?;
                        }
                        self.fragmented_message = Some(FragmentedMessage {
                            op_code: frame.opcode,
                            fragments: frame.payload,
                            compressed: frame.compressed,
                        });
                    } else {
                        Err(Error::FragmentedInProgress)?
                    }
                }
                OpCode::Continue => {
                    let Some(fragmented_message) = self.fragmented_message.as_mut() else {
                        return Err(Error::InvalidContinuationFrame);
                    };
                    fragmented_message
                        .fragments
                        .extend_from_slice(&frame.payload);

                    if fragmented_message.fragments.len() > self.max_message_size() {
                        Err(Error::MaxMessageSize)?;
                    }

                    if frame.final_fragment {
                        let complete = self.fragmented_message.take().unwrap();
                        let payload = if complete.compressed {
                            self.decoder.decompress(&complete.fragments)?
                        } else {
                            complete.fragments
                        };
                        self.transmit_message(Frame::new(true, complete.op_code, payload, false))
                            .await?;
                    }
                }
                OpCode::Text | OpCode::Binary => {
                    // A whole data frame must not cut into someone else's
                    // continuation sequence
                    if self.fragmented_message.is_some() {
                        Err(Error::InvalidFrameFragmentation)?
                    }
                    if frame.payload.len() > self.max_message_size() {
                        Err(Error::MaxMessageSize)?;
                    }

                    let payload = if frame.compressed {
                        self.decoder.decompress(&frame.payload)?
                    } else {
                        frame.payload
                    };
                    self.transmit_message(Frame::new(true, frame.opcode, payload, false))
                        .await?;
                }
                OpCode::Close => {
                    self.handle_close(frame.payload).await?;
                    break;
                }
                OpCode::Ping => {
                    self.send_control(Frame::pong(frame.payload)).await?;
                }
                OpCode::Pong => {
                    self.shared.notify_pong();
                }
            }
        }
        Ok(())
    }

    /// Peer-initiated (or replied) close: record what they sent, answer with
    /// a close echoing their code if ours is not on the wire yet, and land in
    /// Closed.
    async fn handle_close(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        let peer_frame = CloseFrame::parse(&payload)?;
        if let Some(frame) = &peer_frame {
            if !frame.code.is_allowed_on_wire() {
                return Err(Error::InvalidCloseCode(frame.code.as_u16()));
            }
        }

        self.shared.record_peer_close(peer_frame.clone());
        self.shared.transition(ReadyState::Closing);

        if self.shared.mark_close_sent() {
            let reply = match peer_frame {
                Some(frame) => Frame::close(&CloseFrame::new(frame.code, ""))?,
                None => Frame::new(true, OpCode::Close, Vec::new(), false),
            };
            self.send_control(reply).await?;
        }

        self.shared.transition(ReadyState::Closed);
        Ok(())
    }

    fn max_message_size(&self) -> usize {
        self.config.max_message_size.unwrap_or(usize::MAX)
    }

    async fn send_control(&mut self, frame: Frame) -> Result<(), Error> {
        let mut writer = self.writer.lock().await;
        writer.write_frame(frame, false).await?;
        writer.flush().await
    }

    pub async fn read_frame(&mut self) -> Result<Frame, Error> {
        let mut header = [0u8; 2];

        self.buf_reader.read_exact(&mut header).await?;

        // Top bit of the first byte is FIN, the low nibble the opcode
        let final_fragment = (header[0] & 0b10000000) != 0;
        let opcode = OpCode::from(header[0] & 0b00001111)?;

        // The RSV bits only mean something when an extension claimed them.
        // RSV1 marks deflate when negotiated; RSV2/RSV3 are never valid here.
        let rsv1 = (header[0] & 0b01000000) != 0;
        let rsv2 = (header[0] & 0b00100000) != 0;
        let rsv3 = (header[0] & 0b00010000) != 0;

        let deflate_negotiated = self
            .config
            .extensions
            .as_ref()
            .map(|ext| ext.permessage_deflate)
            .unwrap_or(false);
        if rsv2 || rsv3 || (rsv1 && !deflate_negotiated) {
            return Err(Error::RSVNotZero);
        }

        // Control frames can't be fragmented
        if !final_fragment && opcode.is_control() {
            Err(Error::ControlFramesFragmented)?;
        }

        // Second byte: MASK bit plus the 7-bit base length
        let masked = (header[1] & 0b10000000) != 0;

        // Servers require masked frames from clients, clients require
        // unmasked frames from servers
        match self.role {
            Role::Server if !masked => Err(Error::UnmaskedClientFrame)?,
            Role::Client if masked => Err(Error::MaskedServerFrame)?,
            _ => {}
        }

        let mut length = (header[1] & 0b01111111) as usize;

        // A control payload never exceeds 125 bytes, so the extended length
        // markers are already out of bounds here
        if length > 125 && opcode.is_control() {
            Err(Error::ControlFramePayloadSize)?;
        }

        if length == 126 {
            let mut be_bytes = [0u8; 2];
            self.buf_reader.read_exact(&mut be_bytes).await?;
            let extended = u16::from_be_bytes(be_bytes) as usize;
            if self.config.strict_length_decoding && extended < 126 {
                Err(Error::NonMinimalLengthEncoding)?;
            }
            length = extended;
        } else if length == 127 {
            let mut be_bytes = [0u8; 8];
            self.buf_reader.read_exact(&mut be_bytes).await?;
            let extended = u64::from_be_bytes(be_bytes);
            // The RFC keeps the top bit of the 64-bit length clear
            if extended & (1 << 63) != 0 {
                Err(Error::NonMinimalLengthEncoding)?;
            }
            if self.config.strict_length_decoding && extended < 65536 {
                Err(Error::NonMinimalLengthEncoding)?;
            }
            length = extended as usize;
        }

        if length > self.config.max_frame_size.unwrap_or(usize::MAX) {
            Err(Error::MaxFrameSize)?;
        }

        let mask = if masked {
            let mut mask = [0u8; 4];
            self.buf_reader.read_exact(&mut mask).await?;
            Some(mask)
        } else {
            None
        };

        let mut payload = vec![0u8; length];

        // Bounded read: a peer that passed the handshake may still stall the
        // payload bytes to hold the task hostage
        let read_result = timeout(
            PAYLOAD_READ_TIMEOUT,
            self.buf_reader.read_exact(&mut payload),
        )
        .await;
        match read_result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => Err(e)?,
            Err(elapsed) => Err(elapsed)?,
        }

        if let Some(mask) = mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Frame {
            final_fragment,
            opcode,
            payload,
            compressed: rsv1,
        })
    }

    /// Text payloads must be valid UTF-8 by the time they are delivered;
    /// Message::from_frame enforces that and the failure maps to 1007.
    async fn transmit_message(&mut self, frame: Frame) -> Result<(), Error> {
        let message = Message::from_frame(frame)?;
        self.read_tx
            .send(Ok(message))
            .await
            .map_err(|_| Error::CommunicationError)
    }
}
