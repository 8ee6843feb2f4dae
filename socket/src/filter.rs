use std::{io, net::SocketAddr, str::FromStr};

use async_trait::async_trait;
use ipnet::IpNet;
use thiserror::Error;
use tracing::trace;

use crate::server::Listen;

/// An immutable allowed-subnet predicate, parsed once at startup and
/// shared read-only across all accepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetFilter {
    prefix: IpNet,
}

impl SubnetFilter {
    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.prefix.contains(&addr.ip())
    }

    pub fn wrap<L>(&self, listener: L) -> FilteredListener<L> {
        FilteredListener {
            listener,
            filter: *self,
        }
    }
}

impl FromStr for SubnetFilter {
    type Err = ParseSubnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            prefix: s.parse()?,
        })
    }
}

#[derive(Debug, Error)]
#[error("Failed to parse subnet: {0}")]
pub struct ParseSubnetError(#[from] ipnet::AddrParseError);

/// Wraps a listener, silently dropping connections whose remote address
/// falls outside the allowed subnet. Rejected peers never reach the
/// caller; accept errors pass through unfiltered.
#[derive(Debug)]
pub struct FilteredListener<L> {
    listener: L,
    filter: SubnetFilter,
}

impl<L> FilteredListener<L> {
    pub fn new(listener: L, filter: SubnetFilter) -> Self {
        Self { listener, filter }
    }
}

#[async_trait]
impl<L> Listen for FilteredListener<L>
where
    L: Listen,
{
    type Conn = L::Conn;

    async fn accept(&self) -> io::Result<(Self::Conn, SocketAddr)> {
        loop {
            let (conn, peer_addr) = self.listener.accept().await?;
            if self.filter.contains(&peer_addr) {
                return Ok((conn, peer_addr));
            }
            trace!(?peer_addr, "Rejected connection outside allowed subnet");
            drop(conn);
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}
