use crate::frame::CloseCode;
use httparse::Error as HttpParseError;
use pki_types::InvalidDnsNameError;
use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;
use tokio::time::error::Elapsed;
use url::ParseError;

#[derive(Error, Debug)]
pub enum Error {
    // General errors
    #[error("{source}")]
    Timeout {
        #[from]
        source: Elapsed,
    },

    #[error("IO Error happened: {source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    #[error("{source}")]
    FromUtf8Error {
        #[from]
        source: FromUtf8Error,
    },

    #[error("channel communication error")]
    CommunicationError,

    #[error("Connection is not open")]
    NotOpen,

    // Handshake errors
    #[error("Invalid handshake request method and version")]
    InvalidHTTPHandshake,

    #[error("Connection: Upgrade header missing in the request")]
    NoConnectionHeaderPresent,

    #[error("Upgrade: websocket header missing in the request")]
    NoUpgradeHeaderPresent,

    #[error("Host header missing in the request")]
    NoHostHeaderPresent,

    #[error("Couldn't find Sec-WebSocket-Key header in the request")]
    NoSecWebsocketKey,

    #[error("Unsupported Sec-WebSocket-Version, only 13 is accepted")]
    UnsupportedWebsocketVersion,

    #[error("Server didn't upgrade the connection")]
    NoUpgrade,

    #[error("Server didn't send a valid Sec-WebSocket-Accept key")]
    InvalidAcceptKey,

    #[error("Server picked subprotocol `{0}` which was never offered")]
    SubprotocolMismatch(String),

    #[error("Server accepted extension `{0}` which was never offered")]
    ExtensionMismatch(String),

    #[error("Handshake rejected with HTTP status {0}")]
    HandshakeRejected(u16),

    #[error("Authentication failed after retry")]
    AuthenticationFailed,

    #[error("Unsupported authentication scheme: {0}")]
    UnsupportedAuthScheme(String),

    #[error("Proxy refused the tunnel with HTTP status {0}")]
    ProxyHandshakeFailed(u16),

    // Framing errors
    #[error("RSV not zero")]
    RSVNotZero,

    #[error("Reserved opcode: {0:#x}")]
    ReservedOpcode(u8),

    #[error("Control frames must not be fragmented")]
    ControlFramesFragmented,

    #[error("Control frame with invalid payload size, can't be greater than 125")]
    ControlFramePayloadSize,

    #[error("Frame from client was not masked")]
    UnmaskedClientFrame,

    #[error("Frame from server was masked")]
    MaskedServerFrame,

    #[error("Extended payload length is not minimally encoded")]
    NonMinimalLengthEncoding,

    #[error("fragment_size: `{0}` can't be greater than max_frame_size: `{1}`")]
    CustomFragmentSizeExceeded(usize, usize),

    #[error("Max frame size reached")]
    MaxFrameSize,

    #[error("Max message size reached")]
    MaxMessageSize,

    // Fragmentation errors
    #[error("Invalid frame while there is a fragmented message in progress")]
    InvalidFrameFragmentation,

    #[error("Incoming fragmented message but there is one already in progress")]
    FragmentedInProgress,

    #[error("Invalid continuation frame: no fragmented message to continue")]
    InvalidContinuationFrame,

    #[error("Invalid Opcode")]
    InvalidOpcode,

    // Close handshake errors
    #[error("Close code {0} is reserved and can't be sent on the wire")]
    InvalidCloseCode(u16),

    #[error("Close frame payload of a single byte is malformed")]
    InvalidClosePayload,

    #[error("Close reason can't exceed 123 UTF-8 bytes")]
    CloseReasonTooLong,

    // HTTP errors
    #[error("{source}")]
    URLParseError {
        #[from]
        source: ParseError,
    },

    #[error("Invalid scheme in WebSocket URL")]
    InvalidSchemeURL,

    #[error("URL has no host")]
    URLNoHost,

    #[error("{source}")]
    HttpParseError {
        #[from]
        source: HttpParseError,
    },

    #[error("Incomplete HTTP request")]
    IncompleteHTTPRequest,

    #[error("Header block exceeds the 32 KiB limit")]
    HeaderBlockTooLarge,

    #[error("Invalid Content-Length header")]
    InvalidContentLength,

    #[error("Malformed chunked body")]
    InvalidChunkedBody,

    // Session errors
    #[error("Service is not started")]
    ServiceNotStarted,

    #[error("Service `{0}` is not registered")]
    ServiceNotFound(String),

    #[error("Address `{0}` is already bound by this server")]
    AddressInUse(String),

    // TLS errors
    #[error("{source}")]
    DomainError {
        #[from]
        source: InvalidDnsNameError,
    },

    #[error("use_tls = `{0}` argument does not match the passed URL scheme: `{1}`")]
    SchemeAgainstTlsConfig(bool, String),

    // Compression errors
    #[error("max_window_bits should be a value between 8 and 15")]
    InvalidMaxWindowBits,
}

impl Error {
    /// The close code that must accompany this error when it tears down an
    /// open connection, if any. Transport errors map to nothing here: they
    /// surface as a synthetic 1006 which never goes on the wire.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Error::RSVNotZero
            | Error::ReservedOpcode(_)
            | Error::ControlFramesFragmented
            | Error::ControlFramePayloadSize
            | Error::UnmaskedClientFrame
            | Error::MaskedServerFrame
            | Error::NonMinimalLengthEncoding
            | Error::InvalidFrameFragmentation
            | Error::FragmentedInProgress
            | Error::InvalidContinuationFrame
            | Error::InvalidOpcode
            | Error::InvalidClosePayload => Some(CloseCode::Protocol),
            Error::InvalidCloseCode(_) => Some(CloseCode::Protocol),
            Error::FromUtf8Error { .. } => Some(CloseCode::InvalidData),
            Error::MaxFrameSize | Error::MaxMessageSize => Some(CloseCode::TooBig),
            _ => None,
        }
    }
}
