//! DNS SRV resolution of client endpoints (RFC 6120 §3.2, XEP-0368).
//!
//! Targets are looked up under `_xmpps-client._tcp` (direct TLS, only when
//! requested) and `_xmpp-client._tcp`, ordered direct-TLS first, then by
//! priority ascending and weight descending. Endpoints that failed recently
//! are kept in a negative cache and skipped by [`select_endpoint`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::ProtoErrorKind;
use hickory_resolver::proto::rr::rdata::SRV;
use hickory_resolver::{ResolveError, ResolveErrorKind, Resolver};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Default c2s port as per RFC 6120.
pub const DEFAULT_CLIENT_PORT: u16 = 5222;
pub const DEFAULT_DIRECT_TLS_PORT: u16 = 5223;

/// How long a failing endpoint is skipped.
pub const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("no DNS records found for domain: {0}")]
    NoRecords(String),

    #[error("DNS resolution failed for {domain}: {message}")]
    ResolutionFailed { domain: String, message: String },

    #[error("DNS resolution for {0} timed out")]
    Timeout(String),
}

/// Where the connector should open its socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
    pub direct_tls: bool,
}

impl ServerEndpoint {
    pub fn new(host: impl Into<String>, port: u16, direct_tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            direct_tls,
        }
    }

    /// `domain:5222` without TLS, used when SRV yields nothing usable.
    pub fn fallback(domain: &str) -> Self {
        Self::new(domain, DEFAULT_CLIENT_PORT, false)
    }

    /// Parse a redirect or resumption location: `host`, `host:port`,
    /// `[v6]` or `[v6]:port`. A missing port is taken from `current`.
    pub fn from_location(location: &str, current: Option<&ServerEndpoint>) -> Option<Self> {
        let location = location.trim();
        if location.is_empty() {
            return None;
        }
        let default_port = current.map_or(DEFAULT_CLIENT_PORT, |c| c.port);
        let direct_tls = current.is_some_and(|c| c.direct_tls);

        let (host, port) = if location.ends_with(']') {
            (location, default_port)
        } else {
            match location.rsplit_once(':') {
                // A bare IPv6 address without brackets has several colons.
                Some((host, port)) if !host.contains(':') || host.ends_with(']') => {
                    (host, port.parse().ok()?)
                }
                _ => (location, default_port),
            }
        };

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port, direct_tls))
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// One SRV answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub host: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
    pub direct_tls: bool,
}

impl ResolvedTarget {
    pub fn endpoint(&self) -> ServerEndpoint {
        ServerEndpoint::new(self.host.clone(), self.port, self.direct_tls)
    }
}

/// Resolution seam of the connector; swapped out in tests.
#[async_trait]
pub trait ServerResolver: Send + Sync {
    async fn resolve(&self, domain: &str, direct_tls: bool)
    -> Result<Vec<ResolvedTarget>, DnsError>;

    /// Skip `endpoint` for `ttl`.
    fn mark_invalid(&self, endpoint: &ServerEndpoint, ttl: Duration);

    fn is_invalid(&self, endpoint: &ServerEndpoint) -> bool;
}

/// Expiring set of endpoints that failed to connect.
#[derive(Debug, Default)]
pub struct NegativeCache {
    entries: DashMap<(String, u16), Instant>,
}

impl NegativeCache {
    pub fn insert(&self, endpoint: &ServerEndpoint, ttl: Duration) {
        self.entries
            .insert((endpoint.host.clone(), endpoint.port), Instant::now() + ttl);
    }

    pub fn contains(&self, endpoint: &ServerEndpoint) -> bool {
        let key = (endpoint.host.clone(), endpoint.port);
        let expired = match self.entries.get(&key) {
            Some(until) => *until <= Instant::now(),
            None => return false,
        };
        if expired {
            self.entries.remove(&key);
            return false;
        }
        true
    }
}

pub type TokioResolver = Resolver<TokioConnectionProvider>;

/// hickory-backed resolver with the negative cache attached.
#[derive(Clone)]
pub struct SrvResolver {
    resolver: Arc<TokioResolver>,
    invalid: Arc<NegativeCache>,
}

impl SrvResolver {
    pub fn new() -> Self {
        let resolver = Resolver::builder_with_config(
            ResolverConfig::default(),
            TokioConnectionProvider::default(),
        )
        .build();
        Self {
            resolver: Arc::new(resolver),
            invalid: Arc::new(NegativeCache::default()),
        }
    }

    fn lookup_timeout(domain: &str) -> Duration {
        if domain.ends_with(".local") {
            Duration::from_secs(2)
        } else {
            Duration::from_secs(30)
        }
    }

    async fn lookup_service(
        &self,
        service: &str,
        domain: &str,
        direct_tls: bool,
    ) -> Result<Vec<ResolvedTarget>, DnsError> {
        let srv_name = format!("{service}{domain}.");
        debug!(srv_name = %srv_name, "Resolving XMPP client SRV records");

        let lookup = tokio::time::timeout(
            Self::lookup_timeout(domain),
            self.resolver.srv_lookup(srv_name.as_str()),
        )
        .await
        .map_err(|_| DnsError::Timeout(srv_name.clone()))?;

        match lookup {
            Ok(response) => {
                let records: Vec<&SRV> = response.iter().collect();
                Ok(process_srv_records(&records, direct_tls))
            }
            Err(e) if is_no_records_error(&e) => Ok(Vec::new()),
            Err(e) => Err(DnsError::ResolutionFailed {
                domain: srv_name,
                message: e.to_string(),
            }),
        }
    }
}

impl Default for SrvResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServerResolver for SrvResolver {
    #[instrument(skip(self), name = "dns.resolve_xmpp_client")]
    async fn resolve(
        &self,
        domain: &str,
        direct_tls: bool,
    ) -> Result<Vec<ResolvedTarget>, DnsError> {
        let mut services = Vec::with_capacity(2);
        if direct_tls {
            services.push(("_xmpps-client._tcp.", true));
        }
        services.push(("_xmpp-client._tcp.", false));

        let mut targets = Vec::new();
        let mut last_error = None;
        for (service, tls) in services {
            match self.lookup_service(service, domain, tls).await {
                Ok(found) => targets.extend(found),
                Err(e) => {
                    warn!(error = %e, service, "SRV lookup failed");
                    last_error = Some(e);
                }
            }
        }

        if targets.is_empty() {
            return Err(last_error.unwrap_or_else(|| DnsError::NoRecords(domain.to_string())));
        }

        sort_targets(&mut targets);
        debug!(count = targets.len(), "Resolved XMPP client targets via SRV");
        Ok(targets)
    }

    fn mark_invalid(&self, endpoint: &ServerEndpoint, ttl: Duration) {
        debug!(%endpoint, ?ttl, "Marking endpoint as invalid");
        self.invalid.insert(endpoint, ttl);
    }

    fn is_invalid(&self, endpoint: &ServerEndpoint) -> bool {
        self.invalid.contains(endpoint)
    }
}

fn process_srv_records(records: &[&SRV], direct_tls: bool) -> Vec<ResolvedTarget> {
    records
        .iter()
        .filter_map(|srv| {
            let target = srv.target().to_utf8();
            // "." means the service is decidedly not available
            if target == "." || target.is_empty() {
                return None;
            }
            Some(ResolvedTarget {
                host: target.trim_end_matches('.').to_string(),
                port: srv.port(),
                priority: srv.priority(),
                weight: srv.weight(),
                direct_tls,
            })
        })
        .collect()
}

fn sort_targets(targets: &mut [ResolvedTarget]) {
    targets.sort_by(|a, b| {
        b.direct_tls
            .cmp(&a.direct_tls)
            .then(a.priority.cmp(&b.priority))
            .then(b.weight.cmp(&a.weight))
    });
}

/// In hickory-resolver 0.25 NoRecordsFound lives in ProtoErrorKind.
fn is_no_records_error(error: &ResolveError) -> bool {
    if let ResolveErrorKind::Proto(proto_error) = error.kind() {
        matches!(proto_error.kind(), ProtoErrorKind::NoRecordsFound { .. })
    } else {
        false
    }
}

/// First resolved endpoint not in the negative cache, or `domain:5222`.
pub async fn select_endpoint(
    resolver: &dyn ServerResolver,
    domain: &str,
    direct_tls: bool,
) -> ServerEndpoint {
    match resolver.resolve(domain, direct_tls).await {
        Ok(targets) => targets
            .iter()
            .map(ResolvedTarget::endpoint)
            .find(|endpoint| !resolver.is_invalid(endpoint))
            .unwrap_or_else(|| ServerEndpoint::fallback(domain)),
        Err(e) => {
            debug!(error = %e, domain, "Falling back to default client port");
            ServerEndpoint::fallback(domain)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StaticResolver {
        targets: Vec<ResolvedTarget>,
        invalid: NegativeCache,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl ServerResolver for StaticResolver {
        async fn resolve(
            &self,
            domain: &str,
            _direct_tls: bool,
        ) -> Result<Vec<ResolvedTarget>, DnsError> {
            *self.calls.lock().unwrap() += 1;
            if self.targets.is_empty() {
                return Err(DnsError::NoRecords(domain.to_string()));
            }
            Ok(self.targets.clone())
        }

        fn mark_invalid(&self, endpoint: &ServerEndpoint, ttl: Duration) {
            self.invalid.insert(endpoint, ttl);
        }

        fn is_invalid(&self, endpoint: &ServerEndpoint) -> bool {
            self.invalid.contains(endpoint)
        }
    }

    fn target(host: &str, priority: u16, weight: u16, direct_tls: bool) -> ResolvedTarget {
        ResolvedTarget {
            host: host.to_string(),
            port: if direct_tls { 5223 } else { 5222 },
            priority,
            weight,
            direct_tls,
        }
    }

    #[test]
    fn sorts_direct_tls_then_priority_then_weight() {
        let mut targets = vec![
            target("c.example.com", 20, 50, false),
            target("a.example.com", 10, 30, false),
            target("b.example.com", 10, 70, false),
            target("tls.example.com", 30, 0, true),
        ];
        sort_targets(&mut targets);
        let hosts: Vec<_> = targets.iter().map(|t| t.host.as_str()).collect();
        assert_eq!(
            hosts,
            ["tls.example.com", "b.example.com", "a.example.com", "c.example.com"]
        );
    }

    #[test]
    fn parses_locations() {
        let current = ServerEndpoint::new("old.example.com", 5223, true);
        assert_eq!(
            ServerEndpoint::from_location("new.example.com", Some(&current)),
            Some(ServerEndpoint::new("new.example.com", 5223, true))
        );
        assert_eq!(
            ServerEndpoint::from_location("new.example.com:5280", None),
            Some(ServerEndpoint::new("new.example.com", 5280, false))
        );
        assert_eq!(
            ServerEndpoint::from_location("[2001:db8::1]", None),
            Some(ServerEndpoint::new("2001:db8::1", 5222, false))
        );
        assert_eq!(
            ServerEndpoint::from_location("[2001:db8::1]:5269", None),
            Some(ServerEndpoint::new("2001:db8::1", 5269, false))
        );
        assert_eq!(ServerEndpoint::from_location("", None), None);
        assert_eq!(ServerEndpoint::from_location("host:notaport", None), None);
    }

    #[test]
    fn displays_ipv6_with_brackets() {
        assert_eq!(
            ServerEndpoint::new("2001:db8::1", 5222, false).to_string(),
            "[2001:db8::1]:5222"
        );
        assert_eq!(
            ServerEndpoint::fallback("example.com").to_string(),
            "example.com:5222"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn negative_cache_expires() {
        let cache = NegativeCache::default();
        let endpoint = ServerEndpoint::new("a.example.com", 5222, false);
        cache.insert(&endpoint, NEGATIVE_CACHE_TTL);
        assert!(cache.contains(&endpoint));

        tokio::time::advance(NEGATIVE_CACHE_TTL - Duration::from_secs(1)).await;
        assert!(cache.contains(&endpoint));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!cache.contains(&endpoint));
    }

    #[tokio::test(start_paused = true)]
    async fn select_skips_invalid_endpoints() {
        let resolver = StaticResolver {
            targets: vec![
                target("a.example.com", 10, 0, false),
                target("b.example.com", 20, 0, false),
            ],
            invalid: NegativeCache::default(),
            calls: Mutex::new(0),
        };
        resolver.mark_invalid(
            &ServerEndpoint::new("a.example.com", 5222, false),
            NEGATIVE_CACHE_TTL,
        );

        let endpoint = select_endpoint(&resolver, "example.com", false).await;
        assert_eq!(endpoint.host, "b.example.com");

        resolver.mark_invalid(&endpoint, NEGATIVE_CACHE_TTL);
        let endpoint = select_endpoint(&resolver, "example.com", false).await;
        assert_eq!(endpoint, ServerEndpoint::fallback("example.com"));
    }

    #[tokio::test]
    async fn falls_back_without_records() {
        let resolver = StaticResolver {
            targets: Vec::new(),
            invalid: NegativeCache::default(),
            calls: Mutex::new(0),
        };
        let endpoint = select_endpoint(&resolver, "example.com", true).await;
        assert_eq!(endpoint, ServerEndpoint::fallback("example.com"));
        assert_eq!(*resolver.calls.lock().unwrap(), 1);
    }
}
