use crate::route::{Link, RouteSpec, RouteTable};
use std::collections::HashMap;
use std::io;
use std::sync::Mutex;

/// In-memory route table that answers like the kernel: EEXIST for a duplicate
/// destination and ENODEV for an unknown link index.
#[derive(Debug, Default)]
pub struct MemoryRouteTable {
    links: HashMap<String, Link>,
    routes: Mutex<Vec<RouteSpec>>,
    add_failure: Option<io::ErrorKind>,
    link_failure: Option<io::ErrorKind>,
}

impl MemoryRouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_link(mut self, name: &str, index: u32) -> Self {
        self.links.insert(name.to_string(), Link { index, up: true });
        self
    }

    pub fn with_down_link(mut self, name: &str, index: u32) -> Self {
        self.links.insert(name.to_string(), Link { index, up: false });
        self
    }

    /// Make every add fail with `kind`.
    pub fn failing_adds(mut self, kind: io::ErrorKind) -> Self {
        self.add_failure = Some(kind);
        self
    }

    /// Make every link lookup fail with `kind`, as a broken netlink socket would.
    pub fn failing_link_queries(mut self, kind: io::ErrorKind) -> Self {
        self.link_failure = Some(kind);
        self
    }

    /// Pre-install a route, as if left behind by an earlier run.
    pub fn with_route(self, route: RouteSpec) -> Self {
        self.lock().push(route);
        self
    }

    pub fn routes(&self) -> Vec<RouteSpec> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<RouteSpec>> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RouteTable for MemoryRouteTable {
    async fn link_by_name(&self, name: &str) -> io::Result<Link> {
        if let Some(kind) = self.link_failure {
            return Err(io::Error::from(kind));
        }

        self.links.get(name).copied().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("link {} not found", name))
        })
    }

    async fn add_route(&self, route: &RouteSpec) -> io::Result<()> {
        if let Some(kind) = self.add_failure {
            return Err(io::Error::from(kind));
        }

        if !self.links.values().any(|l| l.index == route.link_index()) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such device"));
        }

        let mut routes = self.lock();
        if routes.iter().any(|r| r.destination() == route.destination()) {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        routes.push(*route);
        Ok(())
    }
}
