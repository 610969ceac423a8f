//! Outbound host guard (§4.A): SSRF-safe host resolution and private-range
//! classification.
//!
//! Grounded on the loopback/redirect-URI validation style in
//! `examples/other_examples/8d44b3a3_xcorat-araliya-bot__src-subsystems-tools-gmail.rs.rs`
//! (`parse_loopback_redirect_uri`), generalized from "only accept loopback"
//! to "reject loopback/private/reserved unless explicitly overridden". No
//! IP-range crate is added (SPEC_FULL.md §11): `std::net::Ipv4Addr`'s
//! stable `is_private`/`is_loopback`/`is_link_local`/`is_multicast` cover
//! most of the deny set; the IPv6 unique-local and mapped-v4 ranges are a
//! few lines of octet arithmetic.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use tokio::net::lookup_host;

#[derive(Debug, Error)]
pub enum HostGuardError {
    #[error("bad request: host must not be empty")]
    EmptyHost,
    #[error("bad request: host resolves to a private or reserved address")]
    PrivateOrReserved,
    #[error("bad request: push endpoint must use https")]
    NonHttpsPushEndpoint,
    #[error("dns resolution failed: {0}")]
    Resolution(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHost {
    pub host: String,
    pub address: IpAddr,
    pub family: AddressFamily,
}

/// Process-wide override (§4.A): bypasses private-range checks only.
/// Format checks (empty host, non-https push URL) always apply regardless.
#[derive(Debug, Clone, Copy)]
pub struct HostGuardContext {
    pub allow_private_network_targets: bool,
}

fn suffix_denied(host: &str) -> bool {
    let lower = host.to_ascii_lowercase();
    lower == "localhost"
        || lower.ends_with(".local")
        || lower.ends_with(".internal")
        || lower.ends_with(".localhost")
}

fn is_ipv4_reserved(ip: Ipv4Addr) -> bool {
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_unspecified()
        || ip.is_documentation()
}

/// IPv6 unique-local (`fd00::/7`) check; `Ipv6Addr::is_unique_local` is not
/// yet stable, so this inspects the first octet directly.
fn is_ipv6_unique_local(ip: &Ipv6Addr) -> bool {
    (ip.octets()[0] & 0xfe) == 0xfc
}

fn is_ipv4_mapped_private(ip: &Ipv6Addr) -> bool {
    match ip.to_ipv4_mapped() {
        Some(v4) => is_ipv4_reserved(v4),
        None => false,
    }
}

fn is_ipv6_reserved(ip: Ipv6Addr) -> bool {
    ip.is_loopback()
        || ip.is_multicast()
        || ip.is_unspecified()
        || ip.is_unicast_link_local()
        || is_ipv6_unique_local(&ip)
        || is_ipv4_mapped_private(&ip)
}

fn is_reserved(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_ipv4_reserved(v4),
        IpAddr::V6(v6) => is_ipv6_reserved(v6),
    }
}

/// `resolveSafeOutboundHost(host, {context}) -> {host, address, family}`.
pub async fn resolve_safe_outbound_host(
    host: &str,
    ctx: HostGuardContext,
) -> Result<ResolvedHost, HostGuardError> {
    let trimmed = host.trim();
    if trimmed.is_empty() {
        return Err(HostGuardError::EmptyHost);
    }

    if suffix_denied(trimmed) && !ctx.allow_private_network_targets {
        return Err(HostGuardError::PrivateOrReserved);
    }

    if let Ok(literal) = trimmed.parse::<IpAddr>() {
        if is_reserved(literal) && !ctx.allow_private_network_targets {
            return Err(HostGuardError::PrivateOrReserved);
        }
        let family = match literal {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        };
        return Ok(ResolvedHost {
            host: trimmed.to_string(),
            address: literal,
            family,
        });
    }

    // DNS resolution: lookup_host needs a "host:port" pair.
    let addrs: Vec<IpAddr> = lookup_host((trimmed, 0))
        .await?
        .map(|sa| sa.ip())
        .collect();

    if addrs.is_empty() {
        return Err(HostGuardError::PrivateOrReserved);
    }

    let usable: Vec<IpAddr> = if ctx.allow_private_network_targets {
        addrs
    } else {
        addrs.into_iter().filter(|a| !is_reserved(*a)).collect()
    };

    // DNS returns zero or only reserved addresses -> reject.
    let chosen = usable
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| usable.first())
        .copied()
        .ok_or(HostGuardError::PrivateOrReserved)?;

    let family = match chosen {
        IpAddr::V4(_) => AddressFamily::V4,
        IpAddr::V6(_) => AddressFamily::V6,
    };

    Ok(ResolvedHost {
        host: trimmed.to_string(),
        address: chosen,
        family,
    })
}

/// `assertSafePushEndpoint(url)`: push endpoints additionally require
/// `https`, on top of the same host checks.
pub async fn assert_safe_push_endpoint(
    url: &str,
    ctx: HostGuardContext,
) -> Result<ResolvedHost, HostGuardError> {
    let parsed = url::Url::parse(url).map_err(|_| HostGuardError::PrivateOrReserved)?;
    if parsed.scheme() != "https" {
        return Err(HostGuardError::NonHttpsPushEndpoint);
    }
    let host = parsed
        .host_str()
        .ok_or(HostGuardError::EmptyHost)?
        .to_string();
    resolve_safe_outbound_host(&host, ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict_ctx() -> HostGuardContext {
        HostGuardContext {
            allow_private_network_targets: false,
        }
    }

    #[tokio::test]
    async fn rejects_empty_host() {
        let err = resolve_safe_outbound_host("", strict_ctx()).await.unwrap_err();
        assert!(matches!(err, HostGuardError::EmptyHost));
    }

    #[tokio::test]
    async fn rejects_localhost_suffix_forms() {
        for host in ["localhost", "foo.local", "bar.internal", "x.localhost"] {
            let err = resolve_safe_outbound_host(host, strict_ctx()).await.unwrap_err();
            assert!(matches!(err, HostGuardError::PrivateOrReserved), "{host}");
        }
    }

    #[tokio::test]
    async fn rejects_private_ipv4_literals() {
        for host in ["10.0.0.1", "192.168.1.1", "127.0.0.1", "169.254.1.1"] {
            let err = resolve_safe_outbound_host(host, strict_ctx()).await.unwrap_err();
            assert!(matches!(err, HostGuardError::PrivateOrReserved), "{host}");
        }
    }

    #[tokio::test]
    async fn rejects_private_ipv6_literals() {
        for host in ["fd00::1", "fe80::1", "::ffff:127.0.0.1"] {
            let err = resolve_safe_outbound_host(host, strict_ctx()).await.unwrap_err();
            assert!(matches!(err, HostGuardError::PrivateOrReserved), "{host}");
        }
    }

    #[tokio::test]
    async fn accepts_public_ipv4_literal() {
        let resolved = resolve_safe_outbound_host("8.8.8.8", strict_ctx()).await.unwrap();
        assert_eq!(resolved.family, AddressFamily::V4);
    }

    #[tokio::test]
    async fn override_bypasses_private_range_checks_but_not_format_checks() {
        let ctx = HostGuardContext {
            allow_private_network_targets: true,
        };
        let resolved = resolve_safe_outbound_host("10.0.0.1", ctx).await.unwrap();
        assert_eq!(resolved.address, "10.0.0.1".parse::<IpAddr>().unwrap());

        let err = resolve_safe_outbound_host("", ctx).await.unwrap_err();
        assert!(matches!(err, HostGuardError::EmptyHost));
    }

    #[tokio::test]
    async fn push_endpoint_requires_https() {
        let err = assert_safe_push_endpoint("http://example.com/hook", strict_ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, HostGuardError::NonHttpsPushEndpoint));
    }
}
