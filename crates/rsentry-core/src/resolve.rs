use std::net::SocketAddr;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid gateway port '{0}'")]
    InvalidPort(String),
    #[error("failed to resolve gateway address {host}: {source}")]
    Lookup {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("gateway {0} resolved to no addresses")]
    NoAddress(String),
}

/// Resolve the gateway endpoint. Address literals are returned as-is; names go
/// through the system resolver and the first IPv4 answer is preferred.
pub async fn resolve_gateway(host: &str, port: &str) -> Result<SocketAddr, ResolveError> {
    let port: u16 = port
        .parse()
        .map_err(|_| ResolveError::InvalidPort(port.to_string()))?;

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| ResolveError::Lookup {
            host: host.to_string(),
            source,
        })?
        .collect();

    let chosen = addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ResolveError::NoAddress(host.to_string()))?;

    debug!(host, addr = %chosen, candidates = addrs.len(), "resolved gateway");
    Ok(chosen)
}
