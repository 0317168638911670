use ipnet::IpNet;
use std::io;
use std::net::IpAddr;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("failed to open netlink connection: {0}")]
    Connection(#[source] io::Error),
    #[error("could not find link {iface}: {source}")]
    LinkNotFound {
        iface: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to query link {iface}: {source}")]
    LinkQuery {
        iface: String,
        #[source]
        source: io::Error,
    },
    #[error("could not add route to {destination} via {iface}: {source}")]
    Add {
        destination: IpNet,
        iface: String,
        #[source]
        source: io::Error,
    },
}

/// Kernel view of a network link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub up: bool,
}

/// A route whose destination covers exactly one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteSpec {
    destination: IpNet,
    link_index: u32,
}

impl RouteSpec {
    /// `/32` for IPv4, `/128` for IPv6.
    pub fn host(ip: IpAddr, link_index: u32) -> Self {
        Self {
            destination: IpNet::from(ip),
            link_index,
        }
    }

    pub fn destination(&self) -> IpNet {
        self.destination
    }

    pub fn link_index(&self) -> u32 {
        self.link_index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Added,
    /// The kernel answered EEXIST.
    AlreadyPresent,
}

/// The slice of the kernel routing control plane the route manager needs.
#[allow(async_fn_in_trait)]
pub trait RouteTable {
    async fn link_by_name(&self, name: &str) -> io::Result<Link>;
    async fn add_route(&self, route: &RouteSpec) -> io::Result<()>;
}

pub struct RouteManager<R> {
    table: R,
}

impl<R: RouteTable> RouteManager<R> {
    pub fn new(table: R) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &R {
        &self.table
    }

    /// Ensure a host route to `ip` out of `iface` exists. A route that is
    /// already installed counts as success.
    pub async fn add_host_route(
        &self,
        iface: &str,
        ip: IpAddr,
    ) -> Result<RouteOutcome, RouteError> {
        let link = self.table.link_by_name(iface).await.map_err(|source| {
            let iface = iface.to_string();
            match source.kind() {
                io::ErrorKind::NotFound => RouteError::LinkNotFound { iface, source },
                _ => RouteError::LinkQuery { iface, source },
            }
        })?;

        if !link.up {
            warn!(iface, "egress link is down, route will be installed anyway");
        }

        let route = RouteSpec::host(ip, link.index);
        debug!(dst = %route.destination(), link = link.index, "adding host route");

        match self.table.add_route(&route).await {
            Ok(()) => Ok(RouteOutcome::Added),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(RouteOutcome::AlreadyPresent),
            Err(source) => Err(RouteError::Add {
                destination: route.destination(),
                iface: iface.to_string(),
                source,
            }),
        }
    }
}
