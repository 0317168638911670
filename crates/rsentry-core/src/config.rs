use thiserror::Error;

pub const GATEWAY_IP_VAR: &str = "GATEWAY_IP";
pub const GATEWAY_PORT_VAR: &str = "GATEWAY_PORT";
pub const EGRESS_IFACE_VAR: &str = "OIFName";

pub const DEFAULT_EGRESS_IFACE: &str = "eth0";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("environment variable {0} is empty")]
    Empty(&'static str),
}

/// Init-container settings read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Gateway host, either an address literal or a resolvable name.
    pub gateway_host: String,
    /// Gateway port as given; parsed during resolution.
    pub gateway_port: String,
    /// Interface the host route points out of.
    pub egress_iface: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Required variables must be set
    /// and non-empty; an empty `OIFName` falls back to the default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let gateway_host = required(&lookup, GATEWAY_IP_VAR)?;
        let gateway_port = required(&lookup, GATEWAY_PORT_VAR)?;
        let egress_iface = lookup(EGRESS_IFACE_VAR)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_EGRESS_IFACE.to_string());

        Ok(Self {
            gateway_host,
            gateway_port,
            egress_iface,
        })
    }
}

fn required<F>(lookup: &F, name: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Err(ConfigError::Missing(name)),
        Some(v) if v.is_empty() => Err(ConfigError::Empty(name)),
        Some(v) => Ok(v),
    }
}
