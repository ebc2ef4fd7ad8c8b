use crate::config::{ClientConfig, Credentials, ServerConfig};
use crate::connection::{establish, HandshakeInfo, WSConnection};
use crate::error::Error;
use crate::extensions::{parse_extensions, Extensions};
use crate::request::{
    build_client_request, read_request, read_response, HttpResponse, RequestHead, ResponseHead,
};
use crate::stream::SocketMeshStream;
use crate::write::Role;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use bytes::BytesMut;
use log::debug;
use rustls::RootCertStore;
use sha1::{Digest, Sha1};
use std::io;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_rustls::{TlsConnector, TlsStream};

pub(crate) const UUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const FIRST_RESPONSE_TIMEOUT: Duration = Duration::from_secs(90);
const RETRY_RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);

pub(crate) fn generate_websocket_accept_value(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(UUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

pub(crate) fn generate_websocket_key() -> String {
    let random_bytes: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(random_bytes)
}

fn basic_authorization(credentials: &Credentials) -> String {
    format!(
        "Basic {}",
        BASE64_STANDARD.encode(format!("{}:{}", credentials.username, credentials.password))
    )
}

// ---------------------------------------------------------------------------
// Server side

/// What the server settled on for an accepted upgrade.
pub(crate) struct Negotiated {
    pub accept: String,
    pub subprotocol: Option<String>,
    pub extensions: Option<Extensions>,
}

/// Checks an upgrade request against the RFC and picks the subprotocol and
/// extension set. Any failure here turns into a 400 at the caller.
pub(crate) fn negotiate(head: &RequestHead, config: &ServerConfig) -> Result<Negotiated, Error> {
    if head.method != "GET" || head.version < 1 {
        return Err(Error::InvalidHTTPHandshake);
    }
    if head.header("host").is_none() {
        return Err(Error::NoHostHeaderPresent);
    }
    if !head.header_contains("upgrade", "websocket") {
        return Err(Error::NoUpgradeHeaderPresent);
    }
    if !head.header_contains("connection", "upgrade") {
        return Err(Error::NoConnectionHeaderPresent);
    }
    let key = head
        .header("sec-websocket-key")
        .filter(|key| !key.trim().is_empty())
        .ok_or(Error::NoSecWebsocketKey)?;
    if head.header("sec-websocket-version") != Some("13") {
        return Err(Error::UnsupportedWebsocketVersion);
    }

    // First configured subprotocol the client offered wins
    let offered: Vec<String> = head
        .header("sec-websocket-protocol")
        .map(|value| value.split(',').map(|p| p.trim().to_string()).collect())
        .unwrap_or_default();
    let subprotocol = config
        .subprotocols
        .iter()
        .find(|candidate| offered.iter().any(|o| o == *candidate))
        .cloned();

    let offer = head
        .header("sec-websocket-extensions")
        .and_then(|value| parse_extensions(value.to_string()));
    let extensions = Extensions::negotiate(offer, config.enable_deflate);
    if let Some(extensions) = &extensions {
        extensions.validate()?;
    }

    Ok(Negotiated {
        accept: generate_websocket_accept_value(key.trim()),
        subprotocol,
        extensions,
    })
}

pub(crate) fn upgrade_response(negotiated: &Negotiated) -> HttpResponse {
    let mut response = HttpResponse::new(101)
        .with_header("Connection", "Upgrade")
        .with_header("Upgrade", "websocket")
        .with_header("Sec-WebSocket-Accept", negotiated.accept.clone());
    if let Some(subprotocol) = &negotiated.subprotocol {
        response = response.with_header("Sec-WebSocket-Protocol", subprotocol.clone());
    }
    if let Some(extensions) = &negotiated.extensions {
        response = response.with_header("Sec-WebSocket-Extensions", extensions.header_value());
    }
    response
}

/// Writes the 101 and hands the socket over to the protocol engine.
/// `leftover` is whatever the request parser read past the header block.
pub(crate) async fn finish_upgrade(
    mut stream: SocketMeshStream,
    leftover: BytesMut,
    head: &RequestHead,
    config: &ServerConfig,
) -> Result<WSConnection, Error> {
    let negotiated = negotiate(head, config)?;
    upgrade_response(&negotiated).write_to(&mut stream).await?;

    let mut web_socket_config = config.web_socket_config.clone();
    web_socket_config.extensions = negotiated.extensions.clone();

    let info = HandshakeInfo {
        url: None,
        path: head.target.clone(),
        origin: head.header("origin").map(str::to_string),
        cookies: head.header("cookie").map(str::to_string),
        subprotocol: negotiated.subprotocol.clone(),
        extensions: negotiated.extensions,
    };

    Ok(establish(
        stream,
        leftover.to_vec(),
        Role::Server,
        web_socket_config,
        info,
    ))
}

/// Performs the server handshake on a raw TCP socket and returns the
/// connection, the way a bare echo server wants it.
pub async fn accept_async(stream: TcpStream) -> Result<WSConnection, Error> {
    accept_async_with_config(SocketMeshStream::Plain(stream), None).await
}

pub async fn accept_async_with_config(
    mut stream: SocketMeshStream,
    config: Option<ServerConfig>,
) -> Result<WSConnection, Error> {
    let config = config.unwrap_or_default();
    let mut buf = BytesMut::with_capacity(1024);

    let head = timeout(FIRST_RESPONSE_TIMEOUT, read_request(&mut stream, &mut buf)).await??;

    if !head.is_upgrade() {
        let _ = HttpResponse::new(400).write_to(&mut stream).await;
        return Err(Error::NoUpgradeHeaderPresent);
    }

    if let Err(error) = negotiate(&head, &config) {
        debug!("rejecting upgrade request: {}", error);
        let _ = HttpResponse::new(400).write_to(&mut stream).await;
        return Err(error);
    }

    finish_upgrade(stream, buf, &head, &config).await
}

// ---------------------------------------------------------------------------
// Client side

enum ConnectOutcome {
    Connected(Box<WSConnection>),
    AuthChallenge(ResponseHead),
}

/// Opens a WebSocket connection to a `ws://` or `wss://` URL with default
/// settings.
pub async fn connect_async(addr: &str) -> Result<WSConnection, Error> {
    connect_async_with_config(addr, None).await
}

/// Opens a WebSocket connection, driving the whole client handshake:
/// optional proxy tunnel, optional TLS, the upgrade exchange and at most one
/// authentication retry on a 401 challenge.
pub async fn connect_async_with_config(
    addr: &str,
    config: Option<ClientConfig>,
) -> Result<WSConnection, Error> {
    let config = config.unwrap_or_default();

    let mut authorization = config
        .credentials
        .as_ref()
        .filter(|credentials| credentials.preauth)
        .map(basic_authorization);

    for attempt in 0..2 {
        let response_timeout = if attempt == 0 {
            FIRST_RESPONSE_TIMEOUT
        } else {
            RETRY_RESPONSE_TIMEOUT
        };

        match try_connect(addr, &config, authorization.as_deref(), response_timeout).await? {
            ConnectOutcome::Connected(connection) => return Ok(*connection),
            ConnectOutcome::AuthChallenge(head) => {
                if attempt > 0 || authorization.is_some() {
                    return Err(Error::AuthenticationFailed);
                }
                let challenge = head
                    .header("www-authenticate")
                    .unwrap_or_default()
                    .to_string();
                let scheme = challenge.split_whitespace().next().unwrap_or_default();
                if !scheme.eq_ignore_ascii_case("basic") {
                    // Digest needs an MD5 collaborator this crate doesn't
                    // carry
                    return Err(Error::UnsupportedAuthScheme(scheme.to_string()));
                }
                let credentials = config
                    .credentials
                    .as_ref()
                    .ok_or(Error::HandshakeRejected(401))?;
                debug!("handshake got a basic auth challenge, retrying once");
                authorization = Some(basic_authorization(credentials));
            }
        }
    }

    Err(Error::AuthenticationFailed)
}

async fn try_connect(
    addr: &str,
    config: &ClientConfig,
    authorization: Option<&str>,
    response_timeout: Duration,
) -> Result<ConnectOutcome, Error> {
    let key = generate_websocket_key();
    let offered_extensions = config.enable_deflate.then(Extensions::offer);
    let parts = build_client_request(
        addr,
        &key,
        config,
        offered_extensions.clone(),
        authorization,
    )?;

    let tcp = match &config.proxy {
        Some(proxy) => connect_via_proxy(proxy, &parts.connect_addr).await?,
        None => TcpStream::connect(&parts.connect_addr).await?,
    };

    let mut stream = if parts.use_tls {
        let connector = tls_connector(config)?;
        let server_name = pki_types::ServerName::try_from(parts.host.clone())?;
        let tls_stream = connector.connect(server_name, tcp).await?;
        SocketMeshStream::Secure(TlsStream::from(tls_stream))
    } else {
        SocketMeshStream::Plain(tcp)
    };

    stream.write_all(parts.request.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    let head = timeout(response_timeout, read_response(&mut stream, &mut buf)).await??;

    match head.status {
        101 => {}
        401 => return Ok(ConnectOutcome::AuthChallenge(head)),
        status => return Err(Error::HandshakeRejected(status)),
    }

    validate_server_response(&head, &key, config, &offered_extensions)?;

    let extensions = head
        .header("sec-websocket-extensions")
        .and_then(|value| parse_extensions(value.to_string()));

    let mut web_socket_config = config.web_socket_config.clone();
    web_socket_config.extensions = extensions.clone();

    let info = HandshakeInfo {
        url: Some(addr.to_string()),
        path: parts.path,
        origin: config.origin.clone(),
        cookies: config.cookies.clone(),
        subprotocol: head.header("sec-websocket-protocol").map(str::to_string),
        extensions,
    };

    Ok(ConnectOutcome::Connected(Box::new(establish(
        stream,
        buf.to_vec(),
        Role::Client,
        web_socket_config,
        info,
    ))))
}

fn validate_server_response(
    head: &ResponseHead,
    key: &str,
    config: &ClientConfig,
    offered_extensions: &Option<Extensions>,
) -> Result<(), Error> {
    if !head.header_contains("upgrade", "websocket") || !head.header_contains("connection", "upgrade")
    {
        return Err(Error::NoUpgrade);
    }

    let expected = generate_websocket_accept_value(key);
    if head.header("sec-websocket-accept") != Some(expected.as_str()) {
        return Err(Error::InvalidAcceptKey);
    }

    // Version may be echoed back, but only as 13
    if let Some(version) = head.header("sec-websocket-version") {
        if version.trim() != "13" {
            return Err(Error::UnsupportedWebsocketVersion);
        }
    }

    if let Some(subprotocol) = head.header("sec-websocket-protocol") {
        if !config
            .subprotocols
            .iter()
            .any(|offered| offered.as_str() == subprotocol)
        {
            return Err(Error::SubprotocolMismatch(subprotocol.to_string()));
        }
    }

    if let Some(value) = head.header("sec-websocket-extensions") {
        let accepted = parse_extensions(value.to_string());
        if accepted.is_some() && offered_extensions.is_none() {
            return Err(Error::ExtensionMismatch(value.to_string()));
        }
        if let Some(accepted) = accepted {
            accepted.validate()?;
        }
    }

    Ok(())
}

/// Tunnels through an HTTP proxy with CONNECT, answering a 407 challenge
/// with basic credentials at most once.
async fn connect_via_proxy(
    proxy: &crate::config::ProxyConfig,
    target: &str,
) -> Result<TcpStream, Error> {
    let mut authorization: Option<String> = proxy
        .credentials
        .as_ref()
        .filter(|credentials| credentials.preauth)
        .map(basic_authorization);

    for attempt in 0..2 {
        let mut tcp = TcpStream::connect(&proxy.address).await?;

        let mut connect_request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
        if let Some(authorization) = &authorization {
            connect_request.push_str(&format!("Proxy-Authorization: {}\r\n", authorization));
        }
        connect_request.push_str("\r\n");
        tcp.write_all(connect_request.as_bytes()).await?;

        let mut buf = BytesMut::with_capacity(1024);
        let head = read_response(&mut tcp, &mut buf).await?;
        match head.status {
            200..=299 => return Ok(tcp),
            407 if attempt == 0 && proxy.credentials.is_some() && authorization.is_none() => {
                debug!("proxy asked for credentials, retrying the tunnel once");
                authorization = proxy.credentials.as_ref().map(basic_authorization);
            }
            status => return Err(Error::ProxyHandshakeFailed(status)),
        }
    }

    Err(Error::ProxyHandshakeFailed(407))
}

fn tls_connector(config: &ClientConfig) -> Result<TlsConnector, Error> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(ca_file) = &config.ca_file {
        let mut reader = std::io::BufReader::new(std::fs::File::open(ca_file)?);
        for cert in rustls_pemfile::certs(&mut reader) {
            root_store
                .add(cert?)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(tls_config)))
}
