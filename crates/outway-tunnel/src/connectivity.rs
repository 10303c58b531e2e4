//! Proxy host resolution.

use std::net::IpAddr;
use std::time::Duration;

use tokio::net::lookup_host;
use tracing::debug;

use outway_core::{Error, Result};

/// Upper bound on DNS resolution of the proxy hostname. Expiry is
/// classified as "server unreachable".
pub const DNS_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolve the proxy host to an IP address.
///
/// IP literals short-circuit without touching the resolver. IPv4 results
/// are preferred when both families are returned.
pub async fn resolve_proxy_host(host: &str, port: u16) -> Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let addrs = tokio::time::timeout(DNS_RESOLUTION_TIMEOUT, lookup_host((host, port)))
        .await
        .map_err(|_| Error::ServerUnreachable(format!("DNS resolution of {host} timed out")))?
        .map_err(|e| Error::ServerUnreachable(format!("cannot resolve {host}: {e}")))?;

    let mut fallback = None;
    for addr in addrs {
        let ip = addr.ip();
        if ip.is_ipv4() {
            debug!(host, %ip, "resolved proxy host");
            return Ok(ip);
        }
        fallback.get_or_insert(ip);
    }
    fallback.map_or_else(
        || Err(Error::ServerUnreachable(format!("{host} has no addresses"))),
        Ok,
    )
}
