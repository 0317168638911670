use crate::rule::Rule;
use crate::table::{Chain, Table};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to open nftables session via {binary}: {reason}")]
    Open { binary: String, reason: String },
    #[error("nftables rejected the batch: {0}")]
    Rejected(String),
    #[error("nftables I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode nftables payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Identifies a staged rule within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleHandle(pub u64);

/// Control-plane session over the kernel packet filter.
///
/// `add_*` only stage intent locally. `commit` submits everything staged as a
/// single transaction and drains the batch whatever the outcome. `wipe_all`
/// takes effect immediately and removes every table on the host.
#[allow(async_fn_in_trait)]
pub trait NftSession {
    fn add_table(&mut self, table: &Table);
    fn add_chain(&mut self, chain: &Chain);
    fn add_rule(&mut self, rule: Rule) -> RuleHandle;
    async fn commit(&mut self) -> Result<(), SessionError>;
    async fn wipe_all(&mut self) -> Result<(), SessionError>;
}

impl<S: NftSession> NftSession for &mut S {
    fn add_table(&mut self, table: &Table) {
        (**self).add_table(table)
    }

    fn add_chain(&mut self, chain: &Chain) {
        (**self).add_chain(chain)
    }

    fn add_rule(&mut self, rule: Rule) -> RuleHandle {
        (**self).add_rule(rule)
    }

    async fn commit(&mut self) -> Result<(), SessionError> {
        (**self).commit().await
    }

    async fn wipe_all(&mut self) -> Result<(), SessionError> {
        (**self).wipe_all().await
    }
}
