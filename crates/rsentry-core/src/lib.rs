pub mod config;
pub mod resolve;

pub use config::*;
pub use resolve::*;
