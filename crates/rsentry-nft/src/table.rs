// nftables object model: tables and base chains
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Priority of the `filter` chain type at every hook.
pub const FILTER_PRIORITY: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    /// Dual-stack.
    Inet,
    Ip,
    Ip6,
}

impl Family {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inet => "inet",
            Self::Ip => "ip",
            Self::Ip6 => "ip6",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Hook {
    Input,
    Output,
    Forward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    Filter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    Accept,
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub family: Family,
    pub name: String,
}

impl Table {
    pub fn new(name: &str, family: Family) -> Self {
        Self {
            family,
            name: name.to_string(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({"table": {"family": self.family, "name": self.name}})
    }
}

/// A base chain. Its policy is set here and nothing in this crate changes it
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    family: Family,
    table: String,
    name: String,
    hook: Hook,
    priority: i32,
    chain_type: ChainType,
    policy: Policy,
}

impl Chain {
    /// Filter chain at `hook` that drops whatever no rule accepts.
    pub fn default_deny(table: &Table, name: &str, hook: Hook) -> Self {
        Self {
            family: table.family,
            table: table.name.clone(),
            name: name.to_string(),
            hook,
            priority: FILTER_PRIORITY,
            chain_type: ChainType::Filter,
            policy: Policy::Drop,
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hook(&self) -> Hook {
        self.hook
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn to_json(&self) -> Value {
        json!({
            "chain": {
                "family": self.family,
                "table": self.table,
                "name": self.name,
                "type": self.chain_type,
                "hook": self.hook,
                "prio": self.priority,
                "policy": self.policy,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_deny_chain_json() {
        let table = Table::new("routesentry_filter", Family::Inet);
        let chain = Chain::default_deny(&table, "output", Hook::Output);

        assert_eq!(
            chain.to_json(),
            json!({
                "chain": {
                    "family": "inet",
                    "table": "routesentry_filter",
                    "name": "output",
                    "type": "filter",
                    "hook": "output",
                    "prio": 0,
                    "policy": "drop",
                }
            })
        );
    }

    #[test]
    fn table_json() {
        let table = Table::new("t", Family::Ip6);
        assert_eq!(table.to_json(), json!({"table": {"family": "ip6", "name": "t"}}));
    }
}
