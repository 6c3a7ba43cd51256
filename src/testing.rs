//! Helpers shared by the unit tests.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// Yields each fragment as one physical read, then stays pending.
pub(crate) struct FragmentedReader {
    fragments: VecDeque<Vec<u8>>,
}

impl FragmentedReader {
    pub(crate) fn new<I: IntoIterator<Item = Vec<u8>>>(fragments: I) -> Self {
        FragmentedReader {
            fragments: fragments.into_iter().collect(),
        }
    }

    /// Splits `data` at each offset in `cuts`.
    pub(crate) fn split_at(data: &[u8], cuts: &[usize]) -> Self {
        let mut fragments = Vec::new();
        let mut start = 0;
        for &cut in cuts {
            if cut > start && cut < data.len() {
                fragments.push(data[start..cut].to_vec());
                start = cut;
            }
        }
        fragments.push(data[start..].to_vec());
        Self::new(fragments)
    }
}

impl AsyncRead for FragmentedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.fragments.pop_front() {
            Some(mut fragment) => {
                let take = fragment.len().min(buf.remaining());
                buf.put_slice(&fragment[..take]);
                if take < fragment.len() {
                    self.fragments.push_front(fragment.split_off(take));
                }
                Poll::Ready(Ok(()))
            }
            None => Poll::Pending,
        }
    }
}

/// Acceptor serving a freshly generated self-signed `localhost` certificate.
pub(crate) fn self_signed_acceptor() -> (CertificateDer<'static>, TlsAcceptor) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = certified.cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
    let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.clone()], key.into())
        .unwrap();
    (cert, TlsAcceptor::from(Arc::new(config)))
}

/// Serves TLS on a loopback port, answering every request head with `reply`.
/// Failed handshakes just drop the connection.
pub(crate) async fn serve_tls(acceptor: TlsAcceptor, reply: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(tcp).await else {
                    return;
                };
                let mut head = Vec::new();
                let mut buffer = [0u8; 512];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match tls.read(&mut buffer).await {
                        Ok(0) | Err(_) => return,
                        Ok(read) => head.extend_from_slice(&buffer[..read]),
                    }
                }
                let _ = tls.write_all(reply).await;
                let _ = tls.shutdown().await;
            });
        }
    });
    addr
}
