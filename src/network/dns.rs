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

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::pin::Pin;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::client::Timings;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Aaaa,
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::A => write!(f, "A"),
            RecordType::Aaaa => write!(f, "AAAA"),
        }
    }
}

pub type ResolveFuture<'a> = Pin<Box<dyn Future<Output = AppResult<Vec<IpAddr>>> + Send + 'a>>;

/// Address lookup for one record type.
pub trait DnsClient: Send + Sync + fmt::Debug {
    fn resolve<'a>(
        &'a self,
        host: &'a str,
        record_type: RecordType,
        cancellation: &'a CancellationToken,
    ) -> ResolveFuture<'a>;
}

/// Resolver backed by the system resolver configuration.
#[derive(Clone)]
pub struct HickoryDnsClient {
    resolver: TokioAsyncResolver,
}

impl HickoryDnsClient {
    /// Reads `/etc/resolv.conf` where available, public defaults otherwise.
    pub fn from_system() -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            debug!("system resolver config unavailable ({}), using defaults", e);
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        HickoryDnsClient { resolver }
    }

    pub fn with_config(config: ResolverConfig, options: ResolverOpts) -> Self {
        HickoryDnsClient {
            resolver: TokioAsyncResolver::tokio(config, options),
        }
    }
}

impl fmt::Debug for HickoryDnsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HickoryDnsClient")
    }
}

impl DnsClient for HickoryDnsClient {
    fn resolve<'a>(
        &'a self,
        host: &'a str,
        record_type: RecordType,
        cancellation: &'a CancellationToken,
    ) -> ResolveFuture<'a> {
        Box::pin(async move {
            let lookup = async {
                match record_type {
                    RecordType::A => self
                        .resolver
                        .ipv4_lookup(host)
                        .await
                        .map(|found| found.iter().map(|a| IpAddr::V4(a.0)).collect::<Vec<_>>()),
                    RecordType::Aaaa => self
                        .resolver
                        .ipv6_lookup(host)
                        .await
                        .map(|found| found.iter().map(|aaaa| IpAddr::V6(aaaa.0)).collect()),
                }
            };
            tokio::select! {
                _ = cancellation.cancelled() => Err(AppError::Cancelled),
                result = lookup => result.map_err(|e| AppError::Resolution {
                    host: host.to_string(),
                    reason: format!("{record_type} lookup: {e}"),
                }),
            }
        })
    }
}

/// Fixed host table, for tests and pinned deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticDnsClient {
    records: HashMap<(String, RecordType), Vec<IpAddr>>,
}

impl StaticDnsClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(mut self, host: &str, address: IpAddr) -> Self {
        let record_type = match address {
            IpAddr::V4(_) => RecordType::A,
            IpAddr::V6(_) => RecordType::Aaaa,
        };
        self.records
            .entry((host.to_ascii_lowercase(), record_type))
            .or_default()
            .push(address);
        self
    }
}

impl DnsClient for StaticDnsClient {
    fn resolve<'a>(
        &'a self,
        host: &'a str,
        record_type: RecordType,
        _cancellation: &'a CancellationToken,
    ) -> ResolveFuture<'a> {
        let found = self
            .records
            .get(&(host.to_ascii_lowercase(), record_type))
            .cloned()
            .unwrap_or_default();
        Box::pin(async move { Ok(found) })
    }
}

/// Recognizes addresses that need no lookup: `localhost` and IP literals.
pub fn literal_address(host: &str, prefer_ipv4: bool) -> Option<IpAddr> {
    if host.eq_ignore_ascii_case("localhost") {
        return Some(if prefer_ipv4 {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            IpAddr::V6(Ipv6Addr::LOCALHOST)
        });
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .ok()
}

/// Picks one address from the A and AAAA results.
///
/// The last entry of the non-preferred family is assigned first. It is then
/// unconditionally overwritten by the first entry of the preferred family
/// when that list is non-empty.
pub fn select_address(v4: &[IpAddr], v6: &[IpAddr], prefer_ipv4: bool) -> Option<IpAddr> {
    let (first, second) = if prefer_ipv4 { (v6, v4) } else { (v4, v6) };
    let mut selected = first.last().copied();
    if let Some(overwrite) = second.first() {
        selected = Some(*overwrite);
    }
    selected
}

/// Issues the A and AAAA lookups concurrently and selects one address.
pub async fn resolve_address(
    dns: &dyn DnsClient,
    host: &str,
    prefer_ipv4: bool,
    cancellation: &CancellationToken,
    timings: &mut Timings,
) -> AppResult<IpAddr> {
    if let Some(literal) = literal_address(host, prefer_ipv4) {
        trace!("{} is a literal address, skipping lookup", host);
        return Ok(literal);
    }

    let started = timings.elapsed();
    let (v4, v6) = tokio::join!(
        dns.resolve(host, RecordType::A, cancellation),
        dns.resolve(host, RecordType::Aaaa, cancellation),
    );
    timings.dns = Some(timings.elapsed() - started);

    if cancellation.is_cancelled() {
        return Err(AppError::Cancelled);
    }
    let mut failures = Vec::new();
    let v4 = v4.unwrap_or_else(|e| {
        failures.push(e.to_string());
        Vec::new()
    });
    let v6 = v6.unwrap_or_else(|e| {
        failures.push(e.to_string());
        Vec::new()
    });
    debug!(
        "resolved {}: {} A, {} AAAA records",
        host,
        v4.len(),
        v6.len()
    );

    select_address(&v4, &v6, prefer_ipv4).ok_or_else(|| AppError::Resolution {
        host: host.to_string(),
        reason: if failures.is_empty() {
            "no usable address found".to_string()
        } else {
            failures.join("; ")
        },
    })
}
