// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpSocket, TcpStream};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::connection::{Connection, TransportStream};
use super::dns::{resolve_address, DnsClient};
use super::tls::TlsHandshaker;
use crate::client::Timings;
use crate::message::Endpoint;
use crate::{AppError, AppResult};

/// Turns an [`Endpoint`] into a ready [`Connection`].
///
/// Resolution, TCP connect and the TLS handshake form one attempt. A failed
/// attempt discards whatever it opened and the whole sequence restarts, up to
/// `max_attempts` times.
#[derive(Debug, Clone)]
pub struct ConnectionEstablisher {
    dns: Arc<dyn DnsClient>,
    tls: Option<Arc<TlsHandshaker>>,
    prefer_ipv4: bool,
    no_delay: bool,
    max_attempts: u32,
}

impl ConnectionEstablisher {
    pub fn new(dns: Arc<dyn DnsClient>, max_attempts: u32) -> Self {
        ConnectionEstablisher {
            dns,
            tls: None,
            prefer_ipv4: true,
            no_delay: true,
            max_attempts,
        }
    }

    pub fn with_tls(mut self, handshaker: Arc<TlsHandshaker>) -> Self {
        self.tls = Some(handshaker);
        self
    }

    pub fn with_prefer_ipv4(mut self, prefer_ipv4: bool) -> Self {
        self.prefer_ipv4 = prefer_ipv4;
        self
    }

    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Every attempt, the first included, bumps `timings.restart_counter`,
    /// and every failed attempt leaves one entry in the timings error list.
    /// Cancellation ends the loop at once.
    pub async fn establish(
        &self,
        endpoint: &Endpoint,
        socket_timeout: Duration,
        cancellation: &CancellationToken,
        timings: &mut Timings,
    ) -> AppResult<Connection> {
        let attempts = self.max_attempts();
        let mut last_error = None;

        for attempt in 1..=attempts {
            timings.restart_counter += 1;
            match self
                .attempt(endpoint, socket_timeout, cancellation, timings)
                .await
            {
                Ok(connection) => {
                    debug!(
                        "connected to {} ({}) on attempt {}",
                        endpoint,
                        connection.peer(),
                        attempt
                    );
                    return Ok(connection);
                }
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => {
                    warn!(
                        "connection attempt {}/{} to {} failed: {}",
                        attempt, attempts, endpoint, e
                    );
                    timings.record_error(format!("connect attempt {attempt}: {e}"));
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            AppError::IllegalStateError(format!("no connection attempt made to {endpoint}"))
        }))
    }

    async fn attempt(
        &self,
        endpoint: &Endpoint,
        socket_timeout: Duration,
        cancellation: &CancellationToken,
        timings: &mut Timings,
    ) -> AppResult<Connection> {
        let ip = match endpoint.ip() {
            Some(ip) => ip,
            None => {
                resolve_address(
                    self.dns.as_ref(),
                    endpoint.host(),
                    self.prefer_ipv4,
                    cancellation,
                    timings,
                )
                .await?
            }
        };
        let peer = SocketAddr::new(ip, endpoint.port());

        let started = timings.elapsed();
        let tcp = self.connect(peer, socket_timeout, cancellation).await?;
        timings.connect = Some(timings.elapsed() - started);

        if !endpoint.scheme().is_secure() {
            return Ok(Connection::new(TransportStream::Plain(tcp), peer));
        }

        let handshaker = self.tls.as_ref().ok_or_else(|| {
            AppError::IllegalStateError(format!("no tls handshaker for {endpoint}"))
        })?;
        let started = timings.elapsed();
        let handshake = handshaker.handshake(endpoint.host(), tcp);
        let (result, diagnostics) = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(AppError::Cancelled),
            outcome = time::timeout(socket_timeout, handshake) => match outcome {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(AppError::TlsHandshake {
                        server: endpoint.host().to_string(),
                        reason: format!("handshake timed out after {socket_timeout:?}"),
                    })
                }
            },
        };
        for line in diagnostics {
            timings.record_error(format!("certificate: {line}"));
        }
        let tls = result?;
        timings.tls_handshake = Some(timings.elapsed() - started);
        Ok(Connection::new(TransportStream::Tls(Box::new(tls)), peer))
    }

    async fn connect(
        &self,
        peer: SocketAddr,
        socket_timeout: Duration,
        cancellation: &CancellationToken,
    ) -> AppResult<TcpStream> {
        let connect_error = |source: io::Error| AppError::Connect {
            addr: peer.to_string(),
            source,
        };
        let socket = match peer.ip() {
            IpAddr::V4(_) => TcpSocket::new_v4(),
            IpAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(connect_error)?;

        let stream = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(AppError::Cancelled),
            outcome = time::timeout(socket_timeout, socket.connect(peer)) => match outcome {
                Ok(result) => result.map_err(connect_error)?,
                Err(_) => {
                    return Err(connect_error(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect timed out after {socket_timeout:?}"),
                    )))
                }
            },
        };
        stream.set_nodelay(self.no_delay).map_err(connect_error)?;
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::dns::StaticDnsClient;
    use crate::network::tls::{
        CertificateValidator, CertificateVerdict, InsecureValidator, WebPkiValidator,
    };
    use crate::service::TlsConfig;
    use crate::testing::{self_signed_acceptor, serve_tls};
    use parking_lot::Mutex;
    use rustls::pki_types::CertificateDer;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn establisher(max_attempts: u32) -> ConnectionEstablisher {
        ConnectionEstablisher::new(
            Arc::new(StaticDnsClient::new().with_record("svc.test", IpAddr::V4(Ipv4Addr::LOCALHOST))),
            max_attempts,
        )
    }

    #[tokio::test]
    async fn connects_through_static_dns() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = Endpoint::parse(&format!("http://svc.test:{port}/")).unwrap();
        let mut timings = Timings::start();

        let connection = establisher(3)
            .establish(
                &endpoint,
                Duration::from_secs(2),
                &CancellationToken::new(),
                &mut timings,
            )
            .await
            .unwrap();
        assert_eq!(connection.peer().port(), port);
        assert!(!connection.is_tls());
        assert_eq!(timings.restart_counter, 1);
        assert!(timings.connect.is_some());
        assert!(timings.errors().is_empty());
    }

    #[tokio::test]
    async fn refused_connect_exhausts_attempts() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let endpoint = Endpoint::parse(&format!("http://127.0.0.1:{port}/")).unwrap();
        let mut timings = Timings::start();

        let result = establisher(3)
            .establish(
                &endpoint,
                Duration::from_secs(2),
                &CancellationToken::new(),
                &mut timings,
            )
            .await;
        assert!(matches!(result, Err(AppError::Connect { .. })));
        assert_eq!(timings.restart_counter, 3);
        assert_eq!(timings.errors().len(), 3);
    }

    #[tokio::test]
    async fn unresolvable_host_counts_as_attempt() {
        let endpoint = Endpoint::parse("http://missing.test/").unwrap();
        let mut timings = Timings::start();
        let result = establisher(2)
            .establish(
                &endpoint,
                Duration::from_secs(1),
                &CancellationToken::new(),
                &mut timings,
            )
            .await;
        assert!(matches!(result, Err(AppError::Resolution { .. })));
        assert_eq!(timings.restart_counter, 2);
    }

    #[tokio::test]
    async fn cancellation_stops_restarts() {
        let endpoint = Endpoint::parse("http://127.0.0.1:9/").unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let mut timings = Timings::start();
        let result = establisher(5)
            .establish(&endpoint, Duration::from_secs(1), &token, &mut timings)
            .await;
        assert!(matches!(result, Err(AppError::Cancelled)));
        assert_eq!(timings.restart_counter, 1);
    }

    #[tokio::test]
    async fn https_without_handshaker_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = Endpoint::parse(&format!("https://127.0.0.1:{port}/")).unwrap();
        let result = establisher(1)
            .establish(
                &endpoint,
                Duration::from_secs(1),
                &CancellationToken::new(),
                &mut Timings::start(),
            )
            .await;
        assert!(matches!(result, Err(AppError::IllegalStateError(_))));
    }

    const SECURE_REPLY: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecure";

    /// Accepts everything and remembers what the handshake handed over.
    #[derive(Debug, Default)]
    struct RecordingValidator {
        seen: Mutex<Vec<(Vec<u8>, usize, usize)>>,
    }

    impl CertificateValidator for RecordingValidator {
        fn validate(
            &self,
            peer: &CertificateDer<'_>,
            chain: &[CertificateDer<'_>],
            policy_errors: &[String],
        ) -> CertificateVerdict {
            self.seen
                .lock()
                .push((peer.as_ref().to_vec(), chain.len(), policy_errors.len()));
            CertificateVerdict {
                accept: true,
                diagnostics: vec!["recorded".to_string()],
            }
        }
    }

    fn tls_establisher(
        max_attempts: u32,
        validator: Arc<dyn CertificateValidator>,
    ) -> ConnectionEstablisher {
        let handshaker = TlsHandshaker::new(&TlsConfig::default(), validator).unwrap();
        establisher(max_attempts).with_tls(Arc::new(handshaker))
    }

    fn count_errors(timings: &Timings, prefix: &str) -> usize {
        timings
            .errors()
            .iter()
            .filter(|(_, label)| label.starts_with(prefix))
            .count()
    }

    #[tokio::test]
    async fn webpki_rejects_self_signed_peer_on_every_attempt() {
        let (_, acceptor) = self_signed_acceptor();
        let addr = serve_tls(acceptor, SECURE_REPLY).await;
        let endpoint = Endpoint::parse(&format!("https://localhost:{}/", addr.port())).unwrap();
        let mut timings = Timings::start();

        let result = tls_establisher(2, Arc::new(WebPkiValidator))
            .establish(
                &endpoint,
                Duration::from_secs(2),
                &CancellationToken::new(),
                &mut timings,
            )
            .await;
        assert!(matches!(result, Err(AppError::TlsHandshake { .. })));
        assert_eq!(timings.restart_counter, 2);
        assert_eq!(count_errors(&timings, "certificate: "), 2);
        assert_eq!(count_errors(&timings, "connect attempt"), 2);
        assert!(timings.tls_handshake.is_none());
    }

    #[tokio::test]
    async fn validator_sees_peer_certificate() {
        let (cert, acceptor) = self_signed_acceptor();
        let addr = serve_tls(acceptor, SECURE_REPLY).await;
        let endpoint = Endpoint::parse(&format!("https://localhost:{}/", addr.port())).unwrap();
        let validator = Arc::new(RecordingValidator::default());
        let mut timings = Timings::start();

        let connection = tls_establisher(1, validator.clone())
            .establish(
                &endpoint,
                Duration::from_secs(2),
                &CancellationToken::new(),
                &mut timings,
            )
            .await
            .unwrap();
        assert!(connection.is_tls());

        let seen = validator.seen.lock();
        assert_eq!(seen.len(), 1);
        let (peer, chain, policy_errors) = &seen[0];
        assert_eq!(peer.as_slice(), cert.as_ref());
        assert_eq!(*chain, 0);
        // the self-signed certificate fails the bundled roots
        assert_eq!(*policy_errors, 1);
        assert_eq!(count_errors(&timings, "certificate: recorded"), 1);
    }

    #[tokio::test]
    async fn insecure_validator_completes_exchange() {
        let (_, acceptor) = self_signed_acceptor();
        let addr = serve_tls(acceptor, SECURE_REPLY).await;
        let endpoint = Endpoint::parse(&format!("https://localhost:{}/", addr.port())).unwrap();
        let mut timings = Timings::start();

        let mut connection = tls_establisher(1, Arc::new(InsecureValidator))
            .establish(
                &endpoint,
                Duration::from_secs(2),
                &CancellationToken::new(),
                &mut timings,
            )
            .await
            .unwrap();
        assert!(connection.is_tls());
        assert_eq!(timings.restart_counter, 1);
        assert!(timings.tls_handshake.is_some());
        assert_eq!(count_errors(&timings, "certificate: ignored certificate error"), 1);

        let stream = connection.stream();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        stream.flush().await.unwrap();
        let mut received = Vec::new();
        let mut buffer = [0u8; 256];
        while !received.ends_with(b"secure") {
            let read = stream.read(&mut buffer).await.unwrap();
            assert!(read > 0, "stream closed early: {received:?}");
            received.extend_from_slice(&buffer[..read]);
        }
        assert_eq!(received, SECURE_REPLY);
        connection.close().await;
    }
}
