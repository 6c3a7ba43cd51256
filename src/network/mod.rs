//! Network Module Implementation
//!
//! This module owns everything between an endpoint and a readable response
//! head: address resolution, TCP connections, TLS sessions and header framing.
//!
//! # Architecture
//!
//! The network module is built on tokio's async I/O primitives and consists of:
//! - Address resolution through a pluggable DNS client
//! - Connection establishment with bounded restarts
//! - TLS layering with a caller supplied certificate validator
//! - Framing of the response head out of a raw byte stream
//!
//! # Components
//!
//! - `ConnectionEstablisher`: resolves, connects and handshakes
//! - `Connection`: owns the socket and its optional TLS session
//! - `FrameReader`: finds the header/body boundary across fragmented reads

pub use connection::{Connection, TransportStream};
pub use dns::{
    literal_address, resolve_address, select_address, DnsClient, HickoryDnsClient, RecordType,
    ResolveFuture, StaticDnsClient,
};
pub use establisher::ConnectionEstablisher;
pub use frame::{FrameReader, ResponseFrame};
pub use tls::{
    protocol_versions, CertificateValidator, CertificateVerdict, InsecureValidator,
    TlsHandshaker, WebPkiValidator,
};

mod connection;
mod dns;
mod establisher;
mod frame;
mod tls;
