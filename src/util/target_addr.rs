use crate::consts;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::lookup_host;

#[derive(Error, Debug)]
pub enum AddrError {
    #[error("DNS Resolution failed")]
    DNSResolutionFailed,
    #[error("{0}")]
    Custom(String),
}

/// A description of a connection target, parsed once from the CONNECT
/// request and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// Connect to an IP address.
    Ip(SocketAddr),
    /// Connect to a fully qualified domain name; DNS lookup happens
    /// at dial time on the proxy side.
    Domain(String, u16),
}

impl TargetAddr {
    /// Resolve the target into a concrete socket address. IP targets
    /// pass through untouched; domains are looked up and the first
    /// record wins.
    pub async fn resolve_dns(&self) -> anyhow::Result<SocketAddr> {
        match self {
            TargetAddr::Ip(addr) => Ok(*addr),
            TargetAddr::Domain(domain, port) => {
                debug!("Attempt to DNS resolve the domain {}...", domain);
                lookup_host((domain.as_str(), *port))
                    .await
                    .map_err(|_| AddrError::DNSResolutionFailed)?
                    .next()
                    .ok_or_else(|| {
                        AddrError::Custom("Can't fetch DNS to the domain.".to_string()).into()
                    })
            }
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// The ATYP byte this target serializes with.
    pub fn addr_type(&self) -> u8 {
        match self {
            TargetAddr::Ip(SocketAddr::V4(_)) => consts::SOCKS5_ADDR_TYPE_IPV4,
            TargetAddr::Ip(SocketAddr::V6(_)) => consts::SOCKS5_ADDR_TYPE_IPV6,
            TargetAddr::Domain(_, _) => consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}
