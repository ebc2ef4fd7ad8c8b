use crate::extensions::Extensions;
use rustls::ServerConfig as RustlsConfig;
use std::sync::Arc;
use std::time::Duration;

/// Settings shared by both roles of a connection. The `extensions` field is
/// filled in with the negotiated set once the handshake completes.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub max_frame_size: Option<usize>,
    pub max_message_size: Option<usize>,
    /// Outgoing messages larger than this are split into continuation frames.
    pub fragment_size: Option<usize>,
    /// How long ping() and close() wait for the peer's answer. When unset,
    /// clients wait 5 seconds and servers 1 second.
    pub wait_time: Option<Duration>,
    /// Reject extended payload lengths that are not minimally encoded. The
    /// RFC leaves this open; lenient decoding is the default.
    pub strict_length_decoding: bool,
    pub extensions: Option<Extensions>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        WebSocketConfig {
            max_message_size: Some(64 << 20),
            max_frame_size: Some(16 << 20),
            fragment_size: None,
            wait_time: None,
            strict_length_decoding: false,
            extensions: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub web_socket_config: WebSocketConfig,
    pub tls_config: Option<Arc<RustlsConfig>>,
    /// Subprotocols the server is willing to speak, in preference order.
    pub subprotocols: Vec<String>,
    /// Agree to permessage-deflate when the client offers it.
    pub enable_deflate: bool,
    /// How often the session sweep runs. Defaults to 60 seconds.
    pub sweep_interval: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub web_socket_config: WebSocketConfig,
    /// Extra root certificates for TLS, PEM encoded.
    pub ca_file: Option<String>,
    pub subprotocols: Vec<String>,
    /// Offer permessage-deflate during the handshake.
    pub enable_deflate: bool,
    pub origin: Option<String>,
    /// Raw `Cookie` header value sent with the upgrade request.
    pub cookies: Option<String>,
    pub credentials: Option<Credentials>,
    pub proxy: Option<ProxyConfig>,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Send the Authorization header on the first request instead of waiting
    /// for a 401 challenge.
    pub preauth: bool,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            preauth: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Proxy endpoint as `host:port`.
    pub address: String,
    pub credentials: Option<Credentials>,
}
