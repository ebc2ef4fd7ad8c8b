use crate::compression::{Decoder, Encoder};
use crate::config::WebSocketConfig;
use crate::error::Error;
use crate::extensions::Extensions;
use crate::frame::{CloseCode, CloseFrame};
use crate::message::Message;
use crate::read::ReadStream;
use crate::split::{WSReader, WSWriter};
use crate::stream::SocketMeshStream;
use crate::write::{Role, Writer};
use futures::Stream;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::sync::futures::Notified;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;

const DEFAULT_CLIENT_WAIT_TIME: Duration = Duration::from_secs(5);
const DEFAULT_SERVER_WAIT_TIME: Duration = Duration::from_secs(1);
const MESSAGE_CHANNEL_SIZE: usize = 64;

/// Lifecycle of a connection. States only ever advance; a closed connection
/// never reopens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// What the handshake settled on for this connection.
#[derive(Debug, Clone, Default)]
pub struct HandshakeInfo {
    pub url: Option<String>,
    pub path: String,
    pub origin: Option<String>,
    pub cookies: Option<String>,
    pub subprotocol: Option<String>,
    pub extensions: Option<Extensions>,
}

/// State both halves of a connection observe: the ready-state machine, the
/// ping/pong waiter and the close bookkeeping.
pub(crate) struct Shared {
    state: watch::Sender<ReadyState>,
    pong: Notify,
    close_sent: AtomicBool,
    close_received: AtomicBool,
    peer_close: StdMutex<Option<CloseFrame>>,
    pub(crate) wait_time: Duration,
}

impl Shared {
    pub fn new(wait_time: Duration) -> Self {
        Self {
            state: watch::Sender::new(ReadyState::Connecting),
            pong: Notify::new(),
            close_sent: AtomicBool::new(false),
            close_received: AtomicBool::new(false),
            peer_close: StdMutex::new(None),
            wait_time,
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.state.borrow()
    }

    /// Advances the state machine. Transitions only move forward; trying to
    /// go back is a no-op and reports false.
    pub fn transition(&self, to: ReadyState) -> bool {
        let mut advanced = false;
        self.state.send_if_modified(|current| {
            if to > *current {
                *current = to;
                advanced = true;
                true
            } else {
                false
            }
        });
        advanced
    }

    /// First caller wins the right to put the close frame on the wire.
    pub fn mark_close_sent(&self) -> bool {
        !self.close_sent.swap(true, Ordering::SeqCst)
    }

    pub fn record_peer_close(&self, frame: Option<CloseFrame>) {
        self.close_received.store(true, Ordering::SeqCst);
        *self.peer_close.lock().unwrap() = frame;
    }

    /// Records a locally fabricated close (the 1006 of a transport failure)
    /// without pretending the peer completed the handshake.
    pub fn record_synthetic_close(&self, frame: CloseFrame) {
        *self.peer_close.lock().unwrap() = Some(frame);
    }

    pub fn close_received(&self) -> bool {
        self.close_received.load(Ordering::SeqCst)
    }

    pub fn peer_close(&self) -> Option<CloseFrame> {
        self.peer_close.lock().unwrap().clone()
    }

    pub fn notify_pong(&self) {
        self.pong.notify_waiters();
    }

    /// Listener for the next pong. The caller pins and enables it before
    /// sending the ping so an answer can't slip through in between.
    pub fn pong_listener(&self) -> Notified<'_> {
        self.pong.notified()
    }

    pub async fn await_closed(&self, wait: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let result = timeout(wait, rx.wait_for(|state| *state == ReadyState::Closed)).await;
        match result {
            Ok(result) => result.is_ok(),
            Err(_) => false,
        }
    }
}

/// Builds the per-connection deflate codecs from the negotiated extension
/// set. Each side compresses with its own window and resets its context only
/// when its takeover flag says so.
fn deflate_codecs(role: Role, extensions: &Option<Extensions>) -> (Encoder, Decoder) {
    // zlib can't actually produce a 256-byte window; a negotiated 8 runs as 9,
    // which stays compatible on the wire
    let clamp = |bits: Option<u8>| bits.map(|b| b.max(9));
    match extensions {
        Some(ext) => {
            let (enc_reset, enc_bits, dec_reset, dec_bits) = match role {
                Role::Server => (
                    ext.server_no_context_takeover.unwrap_or(false),
                    ext.server_max_window_bits,
                    ext.client_no_context_takeover.unwrap_or(false),
                    ext.client_max_window_bits,
                ),
                Role::Client => (
                    ext.client_no_context_takeover.unwrap_or(false),
                    ext.client_max_window_bits,
                    ext.server_no_context_takeover.unwrap_or(false),
                    ext.server_max_window_bits,
                ),
            };
            (
                Encoder::new(enc_reset, clamp(enc_bits)),
                Decoder::new(dec_reset, clamp(dec_bits)),
            )
        }
        None => (Encoder::new(true, None), Decoder::new(true, None)),
    }
}

/// Wires up an upgraded byte stream: splits it, parks the writer behind its
/// mutex, spawns the single receive task and hands back the user-facing
/// halves. Called by both sides once their handshake succeeded. `leftover`
/// carries bytes the handshake parser read past the header block, which are
/// the first frames when the peer pipelined them.
pub(crate) fn establish(
    stream: SocketMeshStream,
    leftover: Vec<u8>,
    role: Role,
    mut config: WebSocketConfig,
    info: HandshakeInfo,
) -> WSConnection {
    config.extensions = info.extensions.clone();

    let wait_time = config.wait_time.unwrap_or(match role {
        Role::Client => DEFAULT_CLIENT_WAIT_TIME,
        Role::Server => DEFAULT_SERVER_WAIT_TIME,
    });

    let (read_half, write_half) = tokio::io::split(stream);
    let writer = Arc::new(Mutex::new(Writer::new(write_half, role)));
    let shared = Arc::new(Shared::new(wait_time));
    shared.transition(ReadyState::Open);

    let (read_tx, read_rx) = mpsc::channel(MESSAGE_CHANNEL_SIZE);
    let (encoder, decoder) = deflate_codecs(role, &config.extensions);

    let ws_writer = WSWriter::new(writer.clone(), shared.clone(), config.clone(), encoder);

    let chained = AsyncReadExt::chain(Cursor::new(leftover), read_half);
    let read_stream = ReadStream::new(
        BufReader::new(chained),
        role,
        read_tx,
        writer,
        shared.clone(),
        config,
        decoder,
    );
    tokio::spawn(read_stream.run());

    let ws_reader = WSReader::new(ReceiverStream::new(read_rx), shared);
    WSConnection::new(ws_reader, ws_writer, info)
}

/// A live WebSocket connection: a stream of incoming messages plus the send
/// surface. Split it when reading and writing should live in different
/// tasks.
pub struct WSConnection {
    reader: WSReader,
    writer: WSWriter,
    info: HandshakeInfo,
}

impl WSConnection {
    pub(crate) fn new(reader: WSReader, writer: WSWriter, info: HandshakeInfo) -> Self {
        Self {
            reader,
            writer,
            info,
        }
    }

    pub fn split(self) -> (WSReader, WSWriter) {
        (self.reader, self.writer)
    }

    pub fn ready_state(&self) -> ReadyState {
        self.writer.ready_state()
    }

    pub fn handshake_info(&self) -> &HandshakeInfo {
        &self.info
    }

    pub fn writer(&self) -> WSWriter {
        self.writer.clone()
    }

    pub async fn send_message(&mut self, message: Message) -> Result<(), Error> {
        self.writer.send_message(message).await
    }

    pub async fn send_as_text(&mut self, data: String) -> Result<(), Error> {
        self.writer.send_as_text(data).await
    }

    pub async fn send_as_binary(&mut self, data: Vec<u8>) -> Result<(), Error> {
        self.writer.send_as_binary(data).await
    }

    /// Sends a ping and reports whether the pong came back within the
    /// connection's wait time.
    pub async fn ping(&mut self, payload: Vec<u8>) -> Result<bool, Error> {
        self.writer.ping(payload).await
    }

    /// Runs the close handshake. The returned flag is `was_clean`: our close
    /// frame went out and the peer's reply arrived within the wait time.
    pub async fn close(&mut self, code: CloseCode, reason: &str) -> Result<bool, Error> {
        self.writer.close(code, reason).await
    }

    pub async fn close_connection(&mut self) -> Result<(), Error> {
        self.writer.close(CloseCode::Normal, "").await?;
        Ok(())
    }

    /// Fires the connection's cancellation path: a best-effort graceful
    /// going-away close running in the background.
    pub fn cancel(&self) {
        let writer = self.writer.clone();
        tokio::spawn(async move {
            let _ = writer.close(CloseCode::Away, "").await;
        });
    }
}

impl Stream for WSConnection {
    type Item = Result<Message, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.reader).poll_next(cx)
    }
}
