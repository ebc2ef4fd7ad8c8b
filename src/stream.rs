use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsStream;

/// The byte stream a connection runs on: a bare TCP socket or one wrapped by
/// rustls on either side of the handshake.
pub enum SocketMeshStream {
    Plain(TcpStream),
    Secure(TlsStream<TcpStream>),
}

impl SocketMeshStream {
    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        match self {
            SocketMeshStream::Plain(stream) => stream.peer_addr(),
            SocketMeshStream::Secure(stream) => stream.get_ref().0.peer_addr(),
        }
    }
}

impl AsyncRead for SocketMeshStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SocketMeshStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SocketMeshStream::Secure(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SocketMeshStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SocketMeshStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SocketMeshStream::Secure(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SocketMeshStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SocketMeshStream::Secure(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SocketMeshStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SocketMeshStream::Secure(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
