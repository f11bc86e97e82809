//! Destination checks applied before every outbound hop.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use url::{Host, Url};

use super::transport::HostResolver;
use crate::cancel::CallScope;
use crate::error::FetchError;

/// Hostnames refused outright (exact match or suffix).
const BLOCKED_HOSTS: &[&str] = &["localhost"];
const BLOCKED_SUFFIXES: &[&str] = &[".localhost", ".local", ".internal"];

/// Validates a URL and returns the socket addresses the hop may connect to.
pub struct UrlGuard {
    allow_private: bool,
    resolver: Arc<dyn HostResolver>,
}

impl UrlGuard {
    pub fn new(allow_private: bool, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            allow_private,
            resolver,
        }
    }

    /// Check scheme, hostname and every resolved address of `url`.
    ///
    /// The returned addresses are the only ones the hop is allowed to use, so
    /// a second DNS lookup cannot swap in a different target.
    pub async fn validate(
        &self,
        url: &Url,
        scope: &CallScope,
    ) -> Result<Vec<SocketAddr>, FetchError> {
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(FetchError::UnsupportedScheme(other.to_string())),
        }

        let port = url.port_or_known_default().ok_or(FetchError::InvalidUrl)?;
        let host = url.host().ok_or(FetchError::InvalidUrl)?;

        let ip = match host {
            Host::Ipv4(v4) => Some(IpAddr::V4(v4)),
            Host::Ipv6(v6) => Some(IpAddr::V6(v6)),
            Host::Domain(domain) => {
                let hostname = normalize_hostname(domain);
                if hostname.is_empty() {
                    return Err(FetchError::InvalidUrl);
                }
                if !self.allow_private && is_blocked_hostname(&hostname) {
                    tracing::debug!(host = %hostname, "Refusing blocked hostname");
                    return Err(FetchError::HostNotAllowed(hostname));
                }
                // Some parsers leave bracketless literals in the domain slot.
                hostname.parse::<IpAddr>().ok()
            }
        };

        if let Some(ip) = ip {
            self.check_ip(ip)?;
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let hostname = url
            .host_str()
            .map(normalize_hostname)
            .ok_or(FetchError::InvalidUrl)?;
        let addrs = scope
            .run(self.resolver.resolve(&hostname, port))
            .await??;

        if addrs.is_empty() {
            return Err(FetchError::DnsResolutionFailed(hostname));
        }
        for addr in &addrs {
            self.check_ip(addr.ip())?;
        }

        Ok(addrs)
    }

    fn check_ip(&self, ip: IpAddr) -> Result<(), FetchError> {
        if !self.allow_private && is_private_ip(ip) {
            tracing::debug!(%ip, "Refusing private address");
            return Err(FetchError::PrivateAddress(ip));
        }
        Ok(())
    }
}

/// Lowercase and drop a trailing root dot.
fn normalize_hostname(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_blocked_hostname(host: &str) -> bool {
    BLOCKED_HOSTS.contains(&host) || BLOCKED_SUFFIXES.iter().any(|s| host.ends_with(s))
}

/// Private, loopback, link-local, carrier-NAT and unspecified ranges.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => is_private_v6(v6),
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let [a, b, _, _] = ip.octets();
    a == 10
        || a == 127
        || a == 0
        || (a == 169 && b == 254)
        || (a == 172 && (16..=31).contains(&b))
        || (a == 192 && b == 168)
        || (a == 100 && (64..=127).contains(&b))
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link-local
        || (first & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_v4_ranges() {
        for ip in [
            "10.1.2.3",
            "127.0.0.1",
            "0.0.0.0",
            "169.254.169.254",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "100.64.0.1",
            "100.127.255.255",
        ] {
            assert!(is_private_ip(ip.parse().unwrap()), "{ip} should be private");
        }
        for ip in ["8.8.8.8", "172.32.0.1", "100.128.0.1", "93.184.216.34"] {
            assert!(!is_private_ip(ip.parse().unwrap()), "{ip} should be public");
        }
    }

    #[test]
    fn test_private_v6_ranges() {
        for ip in ["::1", "::", "fc00::1", "fd12:3456::1", "fe80::1", "::ffff:127.0.0.1", "::ffff:10.0.0.1"] {
            assert!(is_private_ip(ip.parse().unwrap()), "{ip} should be private");
        }
        for ip in ["2606:4700::1111", "::ffff:8.8.8.8"] {
            assert!(!is_private_ip(ip.parse().unwrap()), "{ip} should be public");
        }
    }

    #[test]
    fn test_blocked_hostnames() {
        assert!(is_blocked_hostname("localhost"));
        assert!(is_blocked_hostname("api.localhost"));
        assert!(is_blocked_hostname("printer.local"));
        assert!(is_blocked_hostname("metadata.google.internal"));
        assert!(!is_blocked_hostname("example.com"));
        assert!(!is_blocked_hostname("localhost.example.com"));
        assert_eq!(normalize_hostname("LocalHost."), "localhost");
    }
}
