use crate::route::{Link, RouteError, RouteSpec, RouteTable};
use futures::stream::TryStreamExt;
use ipnet::IpNet;
use netlink_packet_route::link::LinkFlag;
use rtnetlink::{Handle, new_connection};
use std::io;

// The kernel answers a by-name link lookup for a missing link with ENODEV.
const ENODEV: i32 = 19;

/// Route table backed by an rtnetlink socket.
pub struct NetlinkRoutes {
    handle: Handle,
}

impl NetlinkRoutes {
    pub async fn new() -> Result<Self, RouteError> {
        let (connection, handle, _) = new_connection().map_err(RouteError::Connection)?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }
}

impl RouteTable for NetlinkRoutes {
    async fn link_by_name(&self, name: &str) -> io::Result<Link> {
        let mut links = self.handle.link().get().match_name(name.to_string()).execute();

        match links.try_next().await {
            Ok(Some(link)) => Ok(Link {
                index: link.header.index,
                up: link.header.flags.contains(&LinkFlag::Up),
            }),
            Ok(None) => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("link {} not found", name),
            )),
            Err(e) => {
                let err = to_io(e);
                if err.raw_os_error() == Some(ENODEV) {
                    Err(io::Error::new(io::ErrorKind::NotFound, err))
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn add_route(&self, route: &RouteSpec) -> io::Result<()> {
        let request = self.handle.route().add();

        let result = match route.destination() {
            IpNet::V4(net) => {
                request
                    .v4()
                    .destination_prefix(net.addr(), net.prefix_len())
                    .output_interface(route.link_index())
                    .execute()
                    .await
            }
            IpNet::V6(net) => {
                request
                    .v6()
                    .destination_prefix(net.addr(), net.prefix_len())
                    .output_interface(route.link_index())
                    .execute()
                    .await
            }
        };

        result.map_err(to_io)
    }
}

// Kernel rejections carry an errno; keep it so EEXIST maps to AlreadyExists.
fn to_io(err: rtnetlink::Error) -> io::Error {
    match err {
        rtnetlink::Error::NetlinkError(msg) => msg.to_io(),
        other => io::Error::other(other.to_string()),
    }
}
