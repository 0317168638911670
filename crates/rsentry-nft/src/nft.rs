use crate::rule::Rule;
use crate::session::{NftSession, RuleHandle, SessionError};
use crate::table::{Chain, Table};
use serde_json::{Value, json};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

pub const DEFAULT_NFT_BINARY: &str = "nft";

/// Session that drives the kernel through `nft -j -f -`. A JSON document
/// passed to `nft` in one invocation is applied as one netlink transaction.
pub struct NftCli {
    binary: String,
    batch: Vec<Value>,
    next_handle: u64,
}

impl NftCli {
    pub async fn open() -> Result<Self, SessionError> {
        Self::open_with(DEFAULT_NFT_BINARY).await
    }

    /// Open a session using a specific `nft` executable.
    pub async fn open_with(binary: &str) -> Result<Self, SessionError> {
        let output = Command::new(binary)
            .arg("--version")
            .output()
            .await
            .map_err(|e| SessionError::Open {
                binary: binary.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(SessionError::Open {
                binary: binary.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!(
            binary,
            version = %String::from_utf8_lossy(&output.stdout).trim(),
            "opened nftables session"
        );

        Ok(Self {
            binary: binary.to_string(),
            batch: vec![],
            next_handle: 0,
        })
    }

    /// The document the next commit would submit.
    pub fn pending(&self) -> Value {
        json!({"nftables": self.batch})
    }

    async fn apply_payload(&self, payload: &Value) -> Result<(), SessionError> {
        let body = serde_json::to_vec(payload)?;

        let mut child = Command::new(&self.binary)
            .arg("-j")
            .arg("-f")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&body).await?;
            drop(stdin);
        }

        let output = child.wait_with_output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SessionError::Rejected(stderr.trim().to_string()));
        }

        Ok(())
    }
}

impl NftSession for NftCli {
    fn add_table(&mut self, table: &Table) {
        self.batch.push(table.to_json());
    }

    fn add_chain(&mut self, chain: &Chain) {
        self.batch.push(chain.to_json());
    }

    fn add_rule(&mut self, rule: Rule) -> RuleHandle {
        self.batch.push(rule.to_json());
        let handle = RuleHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    async fn commit(&mut self) -> Result<(), SessionError> {
        let batch = std::mem::take(&mut self.batch);
        debug!(objects = batch.len(), "submitting nftables batch");
        self.apply_payload(&json!({"nftables": batch})).await
    }

    async fn wipe_all(&mut self) -> Result<(), SessionError> {
        self.apply_payload(&json!({"nftables": [{"flush": {"ruleset": null}}]}))
            .await
    }
}
