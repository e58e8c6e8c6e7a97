//! Outbound URL screening.
//!
//! Every URL handed to the fetcher, the crawler or the browser passes through
//! [`UrlGuard::check`] first. A URL is refused when its scheme is not http(s),
//! when no hostname can be extracted, when the hostname does not resolve, or
//! when *any* resolved address is loopback, private or link-local.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::{debug, warn};
use url::{Host, Url};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    Scheme(String),
    NoHost,
    Unresolvable(String),
    PrivateAddress(IpAddr),
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::Scheme(scheme) => write!(
                f,
                "Blocked: URL scheme '{}' is not allowed. Use http or https.",
                scheme
            ),
            BlockReason::NoHost => write!(f, "Blocked: could not parse hostname from URL."),
            BlockReason::Unresolvable(host) => {
                write!(f, "Blocked: could not resolve hostname '{}'.", host)
            }
            BlockReason::PrivateAddress(ip) => write!(
                f,
                "Blocked: URL resolves to a private/internal address ({}).",
                ip
            ),
        }
    }
}

impl std::error::Error for BlockReason {}

/// Hostname resolution used by the guard.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

/// System DNS through tokio.
pub struct DnsResolver;

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// Fixed host table. Unknown hosts fail to resolve.
#[derive(Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, ips: &[IpAddr]) -> Self {
        self.hosts.insert(host.to_ascii_lowercase(), ips.to_vec());
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
        self.hosts
            .get(&host.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, format!("no such host: {}", host))
            })
    }
}

#[derive(Clone)]
pub struct UrlGuard {
    resolver: Arc<dyn Resolver>,
}

impl UrlGuard {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self { resolver }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(DnsResolver))
    }

    /// Validate `raw` and return the parsed URL when it is safe to contact.
    pub async fn check(&self, raw: &str) -> Result<Url, BlockReason> {
        let url = match Url::parse(raw.trim()) {
            Ok(url) => url,
            Err(e) => {
                debug!(url = %raw, error = %e, "URL did not parse");
                return Err(scheme_of(raw).map_or(BlockReason::NoHost, |s| {
                    if s == "http" || s == "https" {
                        BlockReason::NoHost
                    } else {
                        BlockReason::Scheme(s)
                    }
                }));
            }
        };

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(BlockReason::Scheme(url.scheme().to_string()));
        }

        let ips = match url.host() {
            None => return Err(BlockReason::NoHost),
            Some(Host::Ipv4(ip)) => vec![IpAddr::V4(ip)],
            Some(Host::Ipv6(ip)) => vec![IpAddr::V6(ip)],
            Some(Host::Domain(domain)) => {
                if domain.is_empty() {
                    return Err(BlockReason::NoHost);
                }
                let port = url.port_or_known_default().unwrap_or(80);
                match self.resolver.resolve(domain, port).await {
                    Ok(ips) if !ips.is_empty() => ips,
                    Ok(_) => return Err(BlockReason::Unresolvable(domain.to_string())),
                    Err(e) => {
                        debug!(host = %domain, error = %e, "Host resolution failed");
                        return Err(BlockReason::Unresolvable(domain.to_string()));
                    }
                }
            }
        };

        if let Some(ip) = ips.into_iter().find(|ip| is_blocked_ip(*ip)) {
            warn!(url = %url, ip = %ip, "Refusing URL that resolves to an internal address");
            return Err(BlockReason::PrivateAddress(ip));
        }

        Ok(url)
    }
}

fn scheme_of(raw: &str) -> Option<String> {
    let (scheme, _) = raw.trim().split_once(':')?;
    let valid = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.');
    valid.then(|| scheme.to_ascii_lowercase())
}

/// Loopback, private, link-local and unspecified ranges for both families.
/// IPv4-mapped IPv6 addresses are judged by their IPv4 form.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_ipv4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_blocked_ipv4(v4),
            None => is_blocked_ipv6(v6),
        },
    }
}

fn is_blocked_ipv4(addr: Ipv4Addr) -> bool {
    addr.is_loopback()
        || addr.is_private()
        || addr.is_link_local()
        || addr.is_unspecified()
        || addr.octets()[0] == 0
}

fn is_blocked_ipv6(addr: Ipv6Addr) -> bool {
    let first = addr.segments()[0];
    addr.is_loopback()
        || addr.is_unspecified()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
}

/// Synchronous screen for redirect targets, where no resolver is available.
/// Catches the obvious cases: foreign schemes, `localhost` and internal IP literals.
pub fn redirect_allowed(url: &Url) -> bool {
    if url.scheme() != "http" && url.scheme() != "https" {
        return false;
    }
    match url.host() {
        None => false,
        Some(Host::Ipv4(ip)) => !is_blocked_ipv4(ip),
        Some(Host::Ipv6(ip)) => !is_blocked_ip(IpAddr::V6(ip)),
        Some(Host::Domain(domain)) => {
            let host = domain.trim_end_matches('.').to_ascii_lowercase();
            host != "localhost" && !host.ends_with(".localhost")
        }
    }
}
