pub mod expr;
pub mod firewall;
pub mod memory;
pub mod nft;
pub mod policy;
pub mod rule;
pub mod session;
pub mod table;

pub use expr::*;
pub use firewall::*;
pub use memory::*;
pub use nft::*;
pub use rule::*;
pub use session::*;
pub use table::*;

// nftables control plane: staged tables, chains and rules committed atomically
