use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use std::future::Future;
use std::net::IpAddr;

use crate::error::ProbeError;

/// Reverse DNS as seen by the aggregator: one call per newly seen host.
///
/// An empty name means "no name", not a failure.
pub trait ReverseResolver: Send + Sync + 'static {
    fn reverse_lookup(&self, ip: IpAddr) -> impl Future<Output = Result<String, ProbeError>> + Send;
}

/// Resolver backed by the system DNS configuration
pub struct DnsLookup {
    resolver: TokioAsyncResolver,
}

impl DnsLookup {
    pub fn new() -> Self {
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self { resolver }
    }
}

impl Default for DnsLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl ReverseResolver for DnsLookup {
    async fn reverse_lookup(&self, ip: IpAddr) -> Result<String, ProbeError> {
        let lookup = self
            .resolver
            .reverse_lookup(ip)
            .await
            .map_err(|e| ProbeError::Lookup {
                addr: ip.to_string(),
                reason: e.to_string(),
            })?;

        Ok(lookup
            .iter()
            .next()
            .map(|name| {
                let s = name.to_string();
                // Remove trailing dot
                s.trim_end_matches('.').to_string()
            })
            .unwrap_or_default())
    }
}

/// Resolver used when reverse DNS is turned off
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLookup;

impl ReverseResolver for NoLookup {
    async fn reverse_lookup(&self, _ip: IpAddr) -> Result<String, ProbeError> {
        Ok(String::new())
    }
}

/// Either resolver, picked at startup from configuration
pub enum Resolver {
    Dns(DnsLookup),
    Disabled(NoLookup),
}

impl Resolver {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            Self::Dns(DnsLookup::new())
        } else {
            Self::Disabled(NoLookup)
        }
    }
}

impl ReverseResolver for Resolver {
    async fn reverse_lookup(&self, ip: IpAddr) -> Result<String, ProbeError> {
        match self {
            Self::Dns(dns) => dns.reverse_lookup(ip).await,
            Self::Disabled(off) => off.reverse_lookup(ip).await,
        }
    }
}
