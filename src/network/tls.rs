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

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore, SignatureScheme,
    SupportedProtocolVersion,
};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::service::TlsConfig;
use crate::{AppError, AppResult};

/// Outcome of a certificate validation callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateVerdict {
    pub accept: bool,
    pub diagnostics: Vec<String>,
}

/// Decides whether a peer certificate is acceptable.
///
/// `policy_errors` holds what the WebPKI chain verification reported, empty
/// when the chain verified against the bundled roots.
pub trait CertificateValidator: Send + Sync + fmt::Debug {
    fn validate(
        &self,
        peer: &CertificateDer<'_>,
        chain: &[CertificateDer<'_>],
        policy_errors: &[String],
    ) -> CertificateVerdict;
}

/// Accepts exactly the certificates the WebPKI verification accepted.
#[derive(Debug, Default, Clone)]
pub struct WebPkiValidator;

impl CertificateValidator for WebPkiValidator {
    fn validate(
        &self,
        _peer: &CertificateDer<'_>,
        _chain: &[CertificateDer<'_>],
        policy_errors: &[String],
    ) -> CertificateVerdict {
        CertificateVerdict {
            accept: policy_errors.is_empty(),
            diagnostics: policy_errors.to_vec(),
        }
    }
}

/// Accepts every certificate, reporting what it ignored.
#[derive(Debug, Default, Clone)]
pub struct InsecureValidator;

impl CertificateValidator for InsecureValidator {
    fn validate(
        &self,
        _peer: &CertificateDer<'_>,
        _chain: &[CertificateDer<'_>],
        policy_errors: &[String],
    ) -> CertificateVerdict {
        CertificateVerdict {
            accept: true,
            diagnostics: policy_errors
                .iter()
                .map(|e| format!("ignored certificate error: {e}"))
                .collect(),
        }
    }
}

/// rustls verifier that runs the WebPKI check and lets the validator have the
/// final word. Signatures are always checked by the WebPKI verifier.
struct CallbackVerifier {
    webpki: Arc<WebPkiServerVerifier>,
    validator: Arc<dyn CertificateValidator>,
    diagnostics: Arc<Mutex<Vec<String>>>,
}

impl fmt::Debug for CallbackVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackVerifier")
            .field("validator", &self.validator)
            .finish()
    }
}

impl ServerCertVerifier for CallbackVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let policy_errors = match self.webpki.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(_) => Vec::new(),
            Err(e) => vec![e.to_string()],
        };
        let verdict = self
            .validator
            .validate(end_entity, intermediates, &policy_errors);
        self.diagnostics.lock().extend(verdict.diagnostics);
        if verdict.accept {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(TlsError::General(format!(
                "certificate rejected by validator: {}",
                policy_errors.join("; ")
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.webpki.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.webpki.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.webpki.supported_verify_schemes()
    }
}

pub fn protocol_versions(names: &[String]) -> AppResult<Vec<&'static SupportedProtocolVersion>> {
    let mut versions = Vec::with_capacity(names.len());
    for name in names {
        let version = match name.trim().trim_start_matches("TLS").trim() {
            "1.2" | "12" => &rustls::version::TLS12,
            "1.3" | "13" => &rustls::version::TLS13,
            other => {
                return Err(AppError::InvalidValue(format!(
                    "unsupported tls version: {other}"
                )))
            }
        };
        versions.push(version);
    }
    if versions.is_empty() {
        return Err(AppError::InvalidValue("no tls versions configured".to_string()));
    }
    Ok(versions)
}

/// Everything needed to run client handshakes, built once per executor.
pub struct TlsHandshaker {
    provider: Arc<CryptoProvider>,
    roots: Arc<RootCertStore>,
    versions: Vec<&'static SupportedProtocolVersion>,
    validator: Arc<dyn CertificateValidator>,
    server_name: Option<String>,
}

impl TlsHandshaker {
    pub fn new(config: &TlsConfig, validator: Arc<dyn CertificateValidator>) -> AppResult<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Ok(TlsHandshaker {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            roots: Arc::new(roots),
            versions: protocol_versions(&config.versions)?,
            validator,
            server_name: config.server_name.clone(),
        })
    }

    fn client_config(&self, diagnostics: Arc<Mutex<Vec<String>>>) -> AppResult<ClientConfig> {
        let webpki =
            WebPkiServerVerifier::builder_with_provider(self.roots.clone(), self.provider.clone())
                .build()
                .map_err(|e| AppError::InvalidValue(format!("tls verifier: {e}")))?;
        let verifier = Arc::new(CallbackVerifier {
            webpki,
            validator: self.validator.clone(),
            diagnostics,
        });
        let config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&self.versions)
            .map_err(|e| AppError::InvalidValue(format!("tls protocol versions: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();
        Ok(config)
    }

    /// Layers a TLS session over `tcp`. Validator diagnostics are returned
    /// whether or not the handshake succeeded.
    pub async fn handshake(
        &self,
        host: &str,
        tcp: TcpStream,
    ) -> (AppResult<TlsStream<TcpStream>>, Vec<String>) {
        let diagnostics = Arc::new(Mutex::new(Vec::new()));
        let result = self.try_handshake(host, tcp, diagnostics.clone()).await;
        let diagnostics = std::mem::take(&mut *diagnostics.lock());
        for line in &diagnostics {
            warn!("certificate diagnostic for {}: {}", host, line);
        }
        (result, diagnostics)
    }

    async fn try_handshake(
        &self,
        host: &str,
        tcp: TcpStream,
        diagnostics: Arc<Mutex<Vec<String>>>,
    ) -> AppResult<TlsStream<TcpStream>> {
        let config = self.client_config(diagnostics)?;
        let name = self.server_name.clone().unwrap_or_else(|| host.to_string());
        let server_name = ServerName::try_from(name.clone()).map_err(|e| AppError::TlsHandshake {
            server: name.clone(),
            reason: e.to_string(),
        })?;
        let stream = TlsConnector::from(Arc::new(config))
            .connect(server_name, tcp)
            .await
            .map_err(|e| AppError::TlsHandshake {
                server: name.clone(),
                reason: e.to_string(),
            })?;
        debug!("tls session established with {}", name);
        Ok(stream)
    }
}

impl fmt::Debug for TlsHandshaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsHandshaker")
            .field("versions", &self.versions.len())
            .field("validator", &self.validator)
            .field("server_name", &self.server_name)
            .finish()
    }
}
