pub mod memory;
pub mod netlink;
pub mod route;

pub use memory::*;
pub use netlink::*;
pub use route::*;

// Netlink route operations for the gateway host route
