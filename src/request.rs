use crate::config::ClientConfig;
use crate::error::Error;
use crate::extensions::{add_extension_headers, Extensions};
use bytes::{Buf, BytesMut};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::Url;

/// Hard cap on a request or response header block. Overflowing it is a 400
/// on the server side and a handshake failure on the client side.
pub(crate) const MAX_HEADER_BLOCK: usize = 32 * 1024;

const MAX_HEADERS: usize = 64;
// Request bodies are incidental here (the handshake is a bodyless GET), so
// anything past this cap is refused rather than buffered.
const MAX_BODY_SIZE: usize = 1 << 20;

/// Parsed request line plus headers. Header names are lowercased; repeated
/// headers are joined with commas.
#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    /// Minor version of HTTP/1.x as reported by the parser.
    pub version: u8,
    pub headers: HashMap<String, String>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    /// Token membership check for list-valued headers such as `Connection`
    /// and `Upgrade`.
    pub fn header_contains(&self, name: &str, token: &str) -> bool {
        self.header(name)
            .map(|value| {
                value
                    .split(',')
                    .any(|part| part.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    }

    pub fn is_upgrade(&self) -> bool {
        self.header_contains("connection", "upgrade") && self.header_contains("upgrade", "websocket")
    }

    pub fn expects_continue(&self) -> bool {
        self.header("expect")
            .map(|v| v.eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false)
    }
}

/// Status line plus headers of an HTTP response, for the client side of the
/// handshake.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: HashMap<String, String>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    pub fn header_contains(&self, name: &str, token: &str) -> bool {
        self.header(name)
            .map(|value| {
                value
                    .split(',')
                    .any(|part| part.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    }
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Result<HashMap<String, String>, Error> {
    let mut map: HashMap<String, String> = HashMap::new();
    for header in headers {
        let name = header.name.to_ascii_lowercase();
        let value = String::from_utf8(header.value.to_vec())?;
        match map.get_mut(&name) {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(value.trim());
            }
            None => {
                map.insert(name, value.trim().to_string());
            }
        }
    }
    Ok(map)
}

async fn fill<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut BytesMut) -> Result<usize, Error> {
    let n = stream.read_buf(buf).await?;
    Ok(n)
}

/// Reads one request head off the stream. `buf` is the connection's single
/// receive buffer and is reused across keep-alive requests; bytes past the
/// head (pipelined data, body) stay in it.
pub(crate) async fn read_request<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<RequestHead, Error> {
    loop {
        let parsed = {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut req = httparse::Request::new(&mut headers);
            match req.parse(&buf[..])? {
                httparse::Status::Complete(len) => {
                    let head = RequestHead {
                        method: req.method.unwrap_or_default().to_string(),
                        target: req.path.unwrap_or_default().to_string(),
                        version: req.version.unwrap_or(0),
                        headers: collect_headers(req.headers)?,
                    };
                    Some((head, len))
                }
                httparse::Status::Partial => None,
            }
        };

        if let Some((head, len)) = parsed {
            buf.advance(len);
            return Ok(head);
        }

        if buf.len() > MAX_HEADER_BLOCK {
            return Err(Error::HeaderBlockTooLarge);
        }
        if fill(stream, buf).await? == 0 {
            return Err(Error::IncompleteHTTPRequest);
        }
    }
}

/// Client-side counterpart: reads a response head after the upgrade request
/// went out.
pub(crate) async fn read_response<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<ResponseHead, Error> {
    loop {
        let parsed = {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut resp = httparse::Response::new(&mut headers);
            match resp.parse(&buf[..])? {
                httparse::Status::Complete(len) => {
                    let head = ResponseHead {
                        status: resp.code.unwrap_or_default(),
                        headers: collect_headers(resp.headers)?,
                    };
                    Some((head, len))
                }
                httparse::Status::Partial => None,
            }
        };

        if let Some((head, len)) = parsed {
            buf.advance(len);
            return Ok(head);
        }

        if buf.len() > MAX_HEADER_BLOCK {
            return Err(Error::HeaderBlockTooLarge);
        }
        if fill(stream, buf).await? == 0 {
            return Err(Error::IncompleteHTTPRequest);
        }
    }
}

async fn read_exact_buffered<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
    n: usize,
) -> Result<Vec<u8>, Error> {
    while buf.len() < n {
        if fill(stream, buf).await? == 0 {
            return Err(Error::IncompleteHTTPRequest);
        }
    }
    let out = buf[..n].to_vec();
    buf.advance(n);
    Ok(out)
}

async fn read_line<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<String, Error> {
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = String::from_utf8(buf[..pos].to_vec())?;
            buf.advance(pos + 2);
            return Ok(line);
        }
        if buf.len() > MAX_HEADER_BLOCK {
            return Err(Error::InvalidChunkedBody);
        }
        if fill(stream, buf).await? == 0 {
            return Err(Error::IncompleteHTTPRequest);
        }
    }
}

/// Reads the request body declared by the head: `Content-Length` bytes, a
/// chunked stream, or nothing. The caller has already answered any
/// `Expect: 100-continue`.
pub(crate) async fn read_body<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
    head: &RequestHead,
) -> Result<Vec<u8>, Error> {
    if head
        .header("transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
    {
        return read_chunked_body(stream, buf).await;
    }

    if let Some(value) = head.header("content-length") {
        let length: usize = value.trim().parse().map_err(|_| Error::InvalidContentLength)?;
        if length > MAX_BODY_SIZE {
            return Err(Error::InvalidContentLength);
        }
        return read_exact_buffered(stream, buf, length).await;
    }

    Ok(Vec::new())
}

async fn read_chunked_body<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<Vec<u8>, Error> {
    let mut body = Vec::new();
    loop {
        let size_line = read_line(stream, buf).await?;
        let size_token = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_token, 16).map_err(|_| Error::InvalidChunkedBody)?;

        if size == 0 {
            // Trailer section runs until the empty line
            loop {
                if read_line(stream, buf).await?.is_empty() {
                    break;
                }
            }
            return Ok(body);
        }

        if body.len() + size > MAX_BODY_SIZE {
            return Err(Error::InvalidChunkedBody);
        }
        body.extend_from_slice(&read_exact_buffered(stream, buf, size).await?);

        if !read_line(stream, buf).await?.is_empty() {
            return Err(Error::InvalidChunkedBody);
        }
    }
}

pub(crate) fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "",
    }
}

/// A text body keeps its encoding preamble out of the wire format.
pub(crate) fn strip_utf8_bom(text: &str) -> &str {
    text.strip_prefix('\u{feff}').unwrap_or(text)
}

#[derive(Debug)]
pub enum ResponseBody {
    Empty,
    Bytes(Vec<u8>),
    /// Streamed without a known length; goes out with chunked transfer
    /// encoding and the terminal zero chunk.
    Chunked(Vec<Vec<u8>>),
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: ResponseBody::Empty,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_text_body(mut self, text: &str) -> Self {
        self.headers.push((
            "Content-Type".to_string(),
            "text/plain; charset=utf-8".to_string(),
        ));
        self.body = ResponseBody::Bytes(strip_utf8_bom(text).as_bytes().to_vec());
        self
    }

    pub fn with_chunked_body(mut self, chunks: Vec<Vec<u8>>) -> Self {
        self.body = ResponseBody::Chunked(chunks);
        self
    }

    /// Statuses after which the connection is never reused.
    pub fn forces_close(&self) -> bool {
        matches!(self.status, 400 | 408 | 411 | 413 | 414 | 500 | 503)
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, stream: &mut W) -> Result<(), Error> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status));
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }

        match &self.body {
            ResponseBody::Empty => {
                if self.status != 101 && self.status != 100 {
                    head.push_str("Content-Length: 0\r\n");
                }
                head.push_str("\r\n");
                stream.write_all(head.as_bytes()).await?;
            }
            ResponseBody::Bytes(body) => {
                head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
                stream.write_all(head.as_bytes()).await?;
                stream.write_all(body).await?;
            }
            ResponseBody::Chunked(chunks) => {
                head.push_str("Transfer-Encoding: chunked\r\n\r\n");
                stream.write_all(head.as_bytes()).await?;
                for chunk in chunks {
                    if chunk.is_empty() {
                        continue;
                    }
                    stream
                        .write_all(format!("{:X}\r\n", chunk.len()).as_bytes())
                        .await?;
                    stream.write_all(chunk).await?;
                    stream.write_all(b"\r\n").await?;
                }
                stream.write_all(b"0\r\n\r\n").await?;
            }
        }

        stream.flush().await?;
        Ok(())
    }
}

/// Pieces a client needs to reach a server: the serialized upgrade request,
/// the TCP connect address, the TLS hostname and whether the scheme demands
/// TLS.
pub(crate) struct ClientRequestParts {
    pub request: String,
    pub connect_addr: String,
    pub host: String,
    pub use_tls: bool,
    pub path: String,
}

/// Builds the upgrade request for a `ws://` or `wss://` URL the way the
/// handshake wants it, with the optional headers the configuration asks
/// for.
pub(crate) fn build_client_request(
    ws_url: &str,
    key: &str,
    config: &ClientConfig,
    extensions: Option<Extensions>,
    authorization: Option<&str>,
) -> Result<ClientRequestParts, Error> {
    let parsed_url = Url::parse(ws_url)?;
    let mut use_tls = false;

    let default_port: u16 = match parsed_url.scheme() {
        "ws" => 80,
        "wss" => {
            use_tls = true;
            443
        }
        _ => return Err(Error::InvalidSchemeURL),
    };

    let host = parsed_url.host_str().ok_or(Error::URLNoHost)?;
    let port = parsed_url.port().unwrap_or(default_port);

    // The Host field skips the port when the URL did, mirroring what the
    // user typed; the connect address always needs one.
    let request_host_field = match parsed_url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => String::from(host),
    };
    let connect_addr = format!("{}:{}", host, port);

    let request_path = match parsed_url.query() {
        Some(query) => format!("{}?{}", parsed_url.path(), query),
        None => parsed_url.path().to_string(),
    };

    let mut request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n",
        request_path, request_host_field, key,
    );

    if let Some(origin) = &config.origin {
        request.push_str(&format!("Origin: {}\r\n", origin));
    }
    if !config.subprotocols.is_empty() {
        request.push_str(&format!(
            "Sec-WebSocket-Protocol: {}\r\n",
            config.subprotocols.join(", ")
        ));
    }
    add_extension_headers(&mut request, extensions);
    if let Some(authorization) = authorization {
        request.push_str(&format!("Authorization: {}\r\n", authorization));
    }
    if let Some(cookies) = &config.cookies {
        request.push_str(&format!("Cookie: {}\r\n", cookies));
    }
    request.push_str("\r\n");

    Ok(ClientRequestParts {
        request,
        connect_addr,
        host: String::from(host),
        use_tls,
        path: request_path,
    })
}
