use crate::config::ServerConfig;
use crate::error::Error;
use crate::handshake::{finish_upgrade, negotiate};
use crate::manager::ServiceState;
use crate::request::{read_body, read_request, HttpResponse};
use crate::service::Router;
use crate::stream::SocketMeshStream;
use bytes::BytesMut;
use log::debug;
use std::mem;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, Duration};

// A fresh connection gets a generous window for its first request; a reused
// one has already proven itself and gets a short leash.
const FIRST_REQUEST_TIMEOUT: Duration = Duration::from_secs(90);
const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_KEEP_ALIVE_REQUESTS: usize = 100;

/// Drives one accepted connection through the HTTP/1.1 request loop until
/// it upgrades, closes, or errors. This loop exists to host the websocket
/// handshake; plain requests get a minimal answer and, when possible,
/// keep-alive reuse.
pub(crate) async fn serve_connection(
    stream: SocketMeshStream,
    router: Arc<Router>,
    config: ServerConfig,
) {
    if let Err(error) = connection_loop(stream, router, config).await {
        debug!("http connection ended: {}", error);
    }
}

async fn connection_loop(
    mut stream: SocketMeshStream,
    router: Arc<Router>,
    config: ServerConfig,
) -> Result<(), Error> {
    // One receive buffer for the whole connection, reused across keep-alive
    // requests and capped by the request parser
    let mut buf = BytesMut::with_capacity(1024);
    let mut served = 0usize;

    loop {
        let read_timeout = if served == 0 {
            FIRST_REQUEST_TIMEOUT
        } else {
            KEEP_ALIVE_TIMEOUT
        };

        let head = match timeout(read_timeout, read_request(&mut stream, &mut buf)).await {
            Ok(Ok(head)) => head,
            Ok(Err(Error::HeaderBlockTooLarge)) => {
                let response = HttpResponse::new(400).with_header("Connection", "close");
                let _ = response.write_to(&mut stream).await;
                return Err(Error::HeaderBlockTooLarge);
            }
            Ok(Err(error)) => {
                // Usually the peer just went away between requests
                return Err(error);
            }
            Err(_) => {
                // Idle timeout; only bother with a 408 when the peer had
                // started a request
                if !buf.is_empty() {
                    let response = HttpResponse::new(408).with_header("Connection", "close");
                    let _ = response.write_to(&mut stream).await;
                }
                return Ok(());
            }
        };
        served += 1;

        if head.is_upgrade() {
            let host = router.find(&head.target);
            match host {
                Some(host) if host.manager().state() == ServiceState::Started => {
                    if let Err(error) = negotiate(&head, &config) {
                        debug!("upgrade on `{}` failed validation: {}", head.target, error);
                        let response = HttpResponse::new(400).with_header("Connection", "close");
                        let _ = response.write_to(&mut stream).await;
                        return Ok(());
                    }
                    // The connection leaves HTTP for good; whatever the
                    // parser over-read belongs to the protocol engine now
                    let leftover = mem::take(&mut buf);
                    let connection = finish_upgrade(stream, leftover, &head, &config).await?;
                    host.start_session(connection);
                    return Ok(());
                }
                _ => {
                    let response = HttpResponse::new(501).with_header("Connection", "close");
                    let _ = response.write_to(&mut stream).await;
                    return Ok(());
                }
            }
        }

        // Plain HTTP path. The body must be drained off the wire before the
        // connection can be reused, and a waiting client gets its interim
        // 100 first.
        if head.expects_continue() {
            stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
            stream.flush().await?;
        }
        read_body(&mut stream, &mut buf, &head).await?;

        let mut response = if head.method == "GET" || head.method == "HEAD" {
            HttpResponse::new(404)
        } else {
            HttpResponse::new(501)
        };

        let reuse_exhausted = served >= MAX_KEEP_ALIVE_REQUESTS;
        let close_after = response.forces_close()
            || reuse_exhausted
            || head.version < 1
            || head.header_contains("connection", "close");

        if close_after {
            response = response.with_header("Connection", "close");
        } else {
            response = response.with_header("Connection", "keep-alive");
        }

        response.write_to(&mut stream).await?;

        if close_after {
            return Ok(());
        }
    }
}
