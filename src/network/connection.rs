use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::{debug, trace};

/// The read/write stream of a connection: the TCP socket itself, or a TLS
/// session layered over it.
#[derive(Debug)]
pub enum TransportStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl TransportStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, TransportStream::Tls(_))
    }

    /// Closes the TLS session first (close_notify), then the TCP socket.
    pub async fn close(mut self) -> io::Result<()> {
        match &mut self {
            TransportStream::Plain(tcp) => tcp.shutdown().await,
            TransportStream::Tls(tls) => {
                let tls_result = tls.shutdown().await;
                let (tcp, _) = tls.get_mut();
                let tcp_result = tcp.shutdown().await;
                tls_result.and(tcp_result)
            }
        }
    }
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Plain(tcp) => Pin::new(tcp).poll_read(cx, buf),
            TransportStream::Tls(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TransportStream::Plain(tcp) => Pin::new(tcp).poll_write(cx, buf),
            TransportStream::Tls(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Plain(tcp) => Pin::new(tcp).poll_flush(cx),
            TransportStream::Tls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Plain(tcp) => Pin::new(tcp).poll_shutdown(cx),
            TransportStream::Tls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A live connection to one peer.
///
/// Owned by exactly one executor, one request is in flight at a time.
#[derive(Debug)]
pub struct Connection {
    stream: TransportStream,
    peer: SocketAddr,
    established_at: Instant,
    requests_served: u64,
}

impl Connection {
    pub fn new(stream: TransportStream, peer: SocketAddr) -> Connection {
        Connection {
            stream,
            peer,
            established_at: Instant::now(),
            requests_served: 0,
        }
    }

    pub fn stream(&mut self) -> &mut TransportStream {
        &mut self.stream
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served
    }

    pub(crate) fn mark_request(&mut self) {
        self.requests_served += 1;
    }

    /// Hands the stream over, e.g. to a caller reading an unbounded body.
    pub fn into_stream(self) -> TransportStream {
        self.stream
    }

    /// Tears the connection down. Errors are logged and swallowed, the peer
    /// may already have gone away.
    pub async fn close(self) {
        let peer = self.peer;
        let lifetime = self.established_at.elapsed();
        match self.stream.close().await {
            Ok(()) => trace!("closed connection to {} after {:?}", peer, lifetime),
            Err(e) => debug!("error while closing connection to {}: {}", peer, e),
        }
    }
}
