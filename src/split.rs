use crate::compression::Encoder;
use crate::config::WebSocketConfig;
use crate::connection::{ReadyState, Shared};
use crate::error::Error;
use crate::frame::{CloseCode, CloseFrame, Frame};
use crate::message::{fragment_payload, Message};
use crate::write::Writer;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;

/// The consuming half: a stream of complete messages. Ends when the
/// connection reaches its terminal state.
pub struct WSReader {
    read_rx: ReceiverStream<Result<Message, Error>>,
    shared: Arc<Shared>,
}

impl WSReader {
    pub(crate) fn new(read_rx: ReceiverStream<Result<Message, Error>>, shared: Arc<Shared>) -> Self {
        Self { read_rx, shared }
    }

    pub fn ready_state(&self) -> ReadyState {
        self.shared.ready_state()
    }

    /// The close frame the peer sent, or the synthetic abnormal one recorded
    /// on a transport failure. None until the connection starts closing.
    pub fn close_frame(&self) -> Option<CloseFrame> {
        self.shared.peer_close()
    }
}

impl Stream for WSReader {
    type Item = Result<Message, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.read_rx).poll_next(cx)
    }
}

/// The sending half. Clones share the same writer lock and state, so the
/// session layer can send or ping a connection while a handler owns another
/// clone.
#[derive(Clone)]
pub struct WSWriter {
    writer: Arc<Mutex<Writer>>,
    shared: Arc<Shared>,
    config: WebSocketConfig,
    encoder: Arc<Mutex<Encoder>>,
}

impl WSWriter {
    pub(crate) fn new(
        writer: Arc<Mutex<Writer>>,
        shared: Arc<Shared>,
        config: WebSocketConfig,
        encoder: Encoder,
    ) -> Self {
        Self {
            writer,
            shared,
            config,
            encoder: Arc::new(Mutex::new(encoder)),
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        self.shared.ready_state()
    }

    pub fn was_clean(&self) -> bool {
        self.shared.close_received()
    }

    pub async fn send_message(&self, message: Message) -> Result<(), Error> {
        self.write_message(message).await
    }

    pub async fn send(&self, data: Vec<u8>) -> Result<(), Error> {
        self.write_message(Message::Text(String::from_utf8(data)?))
            .await
    }

    pub async fn send_as_text(&self, data: String) -> Result<(), Error> {
        self.write_message(Message::Text(data)).await
    }

    pub async fn send_as_binary(&self, data: Vec<u8>) -> Result<(), Error> {
        self.write_message(Message::Binary(data)).await
    }

    /// Splits a large payload into continuation frames of `fragment_size`
    /// bytes each, overriding the configured fragment size for this one
    /// message.
    pub async fn send_fragmented(
        &self,
        message: Message,
        fragment_size: usize,
    ) -> Result<(), Error> {
        let max_frame_size = self.config.max_frame_size.unwrap_or(usize::MAX);
        if fragment_size == 0 || fragment_size > max_frame_size {
            return Err(Error::CustomFragmentSizeExceeded(
                fragment_size,
                max_frame_size,
            ));
        }
        if message.len() > self.config.max_message_size.unwrap_or(usize::MAX) {
            return Err(Error::MaxMessageSize);
        }

        let opcode = message.opcode();
        let mut payload = message.into_payload();
        let compressed = self.compress_if_negotiated(&mut payload).await?;
        let frames = fragment_payload(opcode, payload, fragment_size, compressed);
        self.write_frames(frames).await
    }

    /// Sends a ping and waits up to the connection's wait time for a pong.
    /// Overlapping pings collapse onto the same waiter: one pong releases
    /// them all.
    pub async fn ping(&self, payload: Vec<u8>) -> Result<bool, Error> {
        if payload.len() > 125 {
            return Err(Error::ControlFramePayloadSize);
        }
        if self.shared.ready_state() != ReadyState::Open {
            return Ok(false);
        }

        // Arm the listener before the ping leaves, otherwise a fast pong
        // could land between the write and the wait
        let listener = self.shared.pong_listener();
        let mut listener = std::pin::pin!(listener);
        listener.as_mut().enable();

        self.write_frames(vec![Frame::ping(payload)]).await?;

        Ok(timeout(self.shared.wait_time, listener).await.is_ok())
    }

    pub async fn send_ping(&self, payload: Vec<u8>) -> Result<(), Error> {
        if payload.len() > 125 {
            return Err(Error::ControlFramePayloadSize);
        }
        self.write_frames(vec![Frame::ping(payload)]).await
    }

    /// Runs our side of the close handshake and reports `was_clean`: true
    /// iff our close frame went out and the peer's came back within the wait
    /// time. Closing an already closing or closed connection doesn't send
    /// anything again.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<bool, Error> {
        if self.shared.ready_state() >= ReadyState::Closing {
            let closed_in_time = self.shared.await_closed(self.shared.wait_time).await;
            return Ok(closed_in_time && self.shared.close_received());
        }

        let frame = Frame::close(&CloseFrame::new(code, reason))?;
        self.shared.transition(ReadyState::Closing);

        let mut sent = true;
        if self.shared.mark_close_sent() {
            let result = async {
                let mut writer = self.writer.lock().await;
                writer.write_frame(frame, false).await?;
                writer.flush().await
            }
            .await;
            sent = result.is_ok();
        }

        let replied =
            self.shared.await_closed(self.shared.wait_time).await && self.shared.close_received();
        self.shared.transition(ReadyState::Closed);

        // Our half of the handshake is done either way; release the stream
        let _ = self.writer.lock().await.shutdown().await;

        Ok(sent && replied)
    }

    pub async fn close_connection(&self) -> Result<(), Error> {
        self.close(CloseCode::Normal, "").await?;
        Ok(())
    }

    async fn compress_if_negotiated(&self, payload: &mut Vec<u8>) -> Result<bool, Error> {
        let negotiated = self
            .config
            .extensions
            .as_ref()
            .map(|ext| ext.permessage_deflate)
            .unwrap_or(false);
        // Nothing to gain on an empty payload
        if !negotiated || payload.is_empty() {
            return Ok(false);
        }
        *payload = self.encoder.lock().await.compress(payload)?;
        Ok(true)
    }

    async fn write_message(&self, message: Message) -> Result<(), Error> {
        if self.shared.ready_state() != ReadyState::Open {
            return Err(Error::NotOpen);
        }
        if message.len() > self.config.max_message_size.unwrap_or(usize::MAX) {
            return Err(Error::MaxMessageSize);
        }

        let opcode = message.opcode();
        let mut payload = message.into_payload();
        let compressed = self.compress_if_negotiated(&mut payload).await?;

        let fragment_size = self
            .config
            .fragment_size
            .or(self.config.max_frame_size)
            .unwrap_or(usize::MAX);
        let frames = fragment_payload(opcode, payload, fragment_size, compressed);
        self.write_frames(frames).await
    }

    /// All frames of one message go out under a single acquisition of the
    /// writer lock, so concurrent senders can't interleave fragments. A
    /// write failure means the transport is gone: the connection lands in
    /// Closed with a synthetic abnormal closure on top of the returned
    /// error.
    pub(crate) async fn write_frames(&self, frames: Vec<Frame>) -> Result<(), Error> {
        // RSV1 goes on the first frame of a compressed message only
        let mut set_rsv1 = frames.first().map(|f| f.compressed).unwrap_or(false);

        let result = async {
            let mut writer = self.writer.lock().await;
            for frame in frames {
                writer.write_frame(frame, set_rsv1).await?;
                set_rsv1 = false;
            }
            writer.flush().await
        }
        .await;

        if result.is_err() {
            self.shared
                .record_synthetic_close(CloseFrame::new(CloseCode::Abnormal, ""));
            self.shared.transition(ReadyState::Closed);
        }
        result
    }
}
