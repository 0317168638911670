use crate::rule::{Rule, RuleBuilder, RuleCompileError};
use crate::session::{NftSession, RuleHandle, SessionError};
use crate::table::{Chain, Family, Hook, Table};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_TABLE_NAME: &str = "routesentry_filter";
pub const DEFAULT_INPUT_CHAIN: &str = "input";
pub const DEFAULT_OUTPUT_CHAIN: &str = "output";
pub const DEFAULT_FORWARD_CHAIN: &str = "forward";

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("failed to flush existing ruleset: {0}")]
    Wipe(#[source] SessionError),
    #[error("error while applying firewall rules: {0}")]
    Commit(#[source] SessionError),
    #[error("rule for {table}/{chain} does not belong to this firewall")]
    ForeignRule { table: String, chain: String },
    #[error("chain name {name} is configured for more than one hook")]
    DuplicateChain { name: String },
    #[error(transparent)]
    Compile(#[from] RuleCompileError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallConfig {
    pub table_name: String,
    pub family: Family,
    pub input_chain_name: String,
    pub output_chain_name: String,
    pub forward_chain_name: String,
    /// Flush the host's entire ruleset, not only this table, before staging.
    pub flush_ruleset_on_init: bool,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_TABLE_NAME.to_string(),
            family: Family::Inet,
            input_chain_name: DEFAULT_INPUT_CHAIN.to_string(),
            output_chain_name: DEFAULT_OUTPUT_CHAIN.to_string(),
            forward_chain_name: DEFAULT_FORWARD_CHAIN.to_string(),
            flush_ruleset_on_init: true,
        }
    }
}

impl FirewallConfig {
    pub fn with_table_name(mut self, name: &str) -> Self {
        self.table_name = name.to_string();
        self
    }

    pub fn with_family(mut self, family: Family) -> Self {
        self.family = family;
        self
    }

    pub fn with_input_chain_name(mut self, name: &str) -> Self {
        self.input_chain_name = name.to_string();
        self
    }

    pub fn with_output_chain_name(mut self, name: &str) -> Self {
        self.output_chain_name = name.to_string();
        self
    }

    pub fn with_forward_chain_name(mut self, name: &str) -> Self {
        self.forward_chain_name = name.to_string();
        self
    }

    pub fn with_flush_ruleset_on_init(mut self, flush: bool) -> Self {
        self.flush_ruleset_on_init = flush;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainSelector {
    Input,
    Output,
    Forward,
}

/// What the kernel holds relative to this firewall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallState {
    /// Nothing of ours is active and nothing is staged.
    Uninitialized,
    /// Objects are staged and waiting for [`Firewall::flush`].
    Staged,
    /// The last commit succeeded and nothing new is staged.
    Committed,
}

/// Default-deny filter table with one chain per hook.
///
/// The table and its chains are staged by [`Firewall::new`] and reach the
/// kernel with the first successful [`Firewall::flush`].
pub struct Firewall<S> {
    session: S,
    table: Table,
    input: Chain,
    output: Chain,
    forward: Chain,
    state: FirewallState,
    ever_committed: bool,
    staged_rules: usize,
}

impl<S: NftSession> Firewall<S> {
    pub async fn new(mut session: S, config: FirewallConfig) -> Result<Self, FirewallError> {
        let names = [
            &config.input_chain_name,
            &config.output_chain_name,
            &config.forward_chain_name,
        ];
        if let Some(name) = names
            .iter()
            .enumerate()
            .find_map(|(i, name)| names[i + 1..].contains(name).then_some(*name))
        {
            return Err(FirewallError::DuplicateChain { name: name.clone() });
        }

        if config.flush_ruleset_on_init {
            warn!("flushing the entire host ruleset before staging");
            session.wipe_all().await.map_err(FirewallError::Wipe)?;
        }

        let table = Table::new(&config.table_name, config.family);
        session.add_table(&table);

        let input = Chain::default_deny(&table, &config.input_chain_name, Hook::Input);
        let output = Chain::default_deny(&table, &config.output_chain_name, Hook::Output);
        let forward = Chain::default_deny(&table, &config.forward_chain_name, Hook::Forward);
        for chain in [&input, &output, &forward] {
            session.add_chain(chain);
        }

        debug!(table = %table.name, family = table.family.as_str(), "staged filter table");

        Ok(Self {
            session,
            table,
            input,
            output,
            forward,
            state: FirewallState::Staged,
            ever_committed: false,
            staged_rules: 0,
        })
    }

    pub fn state(&self) -> FirewallState {
        self.state
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn chain(&self, selector: ChainSelector) -> &Chain {
        match selector {
            ChainSelector::Input => &self.input,
            ChainSelector::Output => &self.output,
            ChainSelector::Forward => &self.forward,
        }
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn into_session(self) -> S {
        self.session
    }

    pub fn new_rule_builder(&self, selector: ChainSelector) -> RuleBuilder {
        RuleBuilder::new(self.table.family, &self.table.name, self.chain(selector).name())
    }

    /// Stage a built rule on the chain it was built for.
    pub fn add_rule(&mut self, rule: Rule) -> Result<RuleHandle, FirewallError> {
        let owned = rule.table() == self.table.name
            && rule.family() == self.table.family
            && [&self.input, &self.output, &self.forward]
                .iter()
                .any(|c| c.name() == rule.chain());

        if !owned {
            return Err(FirewallError::ForeignRule {
                table: rule.table().to_string(),
                chain: rule.chain().to_string(),
            });
        }

        debug!(chain = rule.chain(), exprs = rule.exprs().len(), "staged rule");
        self.staged_rules += 1;
        self.state = FirewallState::Staged;
        Ok(self.session.add_rule(rule))
    }

    /// Commit everything staged in one transaction. On failure nothing from
    /// this batch is active and the previous state stays in force.
    pub async fn flush(&mut self) -> Result<(), FirewallError> {
        let rules = std::mem::take(&mut self.staged_rules);

        match self.session.commit().await {
            Ok(()) => {
                info!(table = %self.table.name, rules, "committed firewall");
                self.ever_committed = true;
                self.state = FirewallState::Committed;
                Ok(())
            }
            Err(e) => {
                self.state = if self.ever_committed {
                    FirewallState::Committed
                } else {
                    FirewallState::Uninitialized
                };
                Err(FirewallError::Commit(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{L4Proto, Packet, Verdict};
    use crate::memory::MemorySession;

    async fn firewall() -> Firewall<MemorySession> {
        Firewall::new(MemorySession::new(), FirewallConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn new_stages_without_committing() {
        let fw = firewall().await;

        assert_eq!(fw.state(), FirewallState::Staged);
        assert!(!fw.session().has_table(DEFAULT_TABLE_NAME));
        assert_eq!(fw.session().pending_len(), 4);
        assert_eq!(fw.session().wipe_count(), 1);
    }

    #[tokio::test]
    async fn wipe_can_be_disabled() {
        let mut session = MemorySession::new();
        let other = Table::new("other", Family::Ip);
        session.install(&other, &[]);

        let mut fw = Firewall::new(
            session,
            FirewallConfig::default().with_flush_ruleset_on_init(false),
        )
        .await
        .unwrap();
        fw.flush().await.unwrap();

        assert_eq!(fw.session().wipe_count(), 0);
        assert!(fw.session().has_table("other"));
        assert!(fw.session().has_table(DEFAULT_TABLE_NAME));
    }

    #[tokio::test]
    async fn wipe_removes_foreign_tables() {
        let mut session = MemorySession::new();
        session.install(&Table::new("other", Family::Ip), &[]);

        let mut fw = Firewall::new(session, FirewallConfig::default()).await.unwrap();
        fw.flush().await.unwrap();

        assert!(!fw.session().has_table("other"));
    }

    #[tokio::test]
    async fn every_chain_defaults_to_drop() {
        let mut fw = firewall().await;
        fw.flush().await.unwrap();
        assert_eq!(fw.state(), FirewallState::Committed);

        let s = fw.session();
        let gw = "10.0.0.1".parse().unwrap();
        let packets = [
            Packet::outbound("eth0").proto(L4Proto::Udp).to(gw, 51820),
            Packet::outbound("lo"),
            Packet::inbound("eth0").proto(L4Proto::Tcp),
            Packet::default(),
        ];

        for name in ["input", "output", "forward"] {
            let chain = s.chain(DEFAULT_TABLE_NAME, name).unwrap();
            assert_eq!(chain.policy(), crate::table::Policy::Drop);
        }

        for hook in [Hook::Input, Hook::Output, Hook::Forward] {
            for packet in &packets {
                assert_eq!(s.decide(hook, packet), Verdict::Drop);
            }
        }
    }

    #[tokio::test]
    async fn shared_chain_name_is_refused_before_wipe() {
        let mut session = MemorySession::new();
        session.install(&Table::new("other", Family::Ip), &[]);

        let err = Firewall::new(
            &mut session,
            FirewallConfig::default().with_output_chain_name("input"),
        )
        .await
        .err()
        .unwrap();

        assert!(matches!(err, FirewallError::DuplicateChain { ref name } if name == "input"));
        assert_eq!(session.wipe_count(), 0);
        assert_eq!(session.pending_len(), 0);
        assert!(session.has_table("other"));
    }

    #[tokio::test]
    async fn configured_names_are_used() {
        let fw = Firewall::new(
            MemorySession::new(),
            FirewallConfig::default()
                .with_table_name("ks")
                .with_family(Family::Ip)
                .with_input_chain_name("in")
                .with_output_chain_name("out")
                .with_forward_chain_name("fwd"),
        )
        .await
        .unwrap();

        assert_eq!(fw.table().name, "ks");
        assert_eq!(fw.table().family, Family::Ip);
        assert_eq!(fw.chain(ChainSelector::Input).name(), "in");
        assert_eq!(fw.chain(ChainSelector::Output).name(), "out");
        assert_eq!(fw.chain(ChainSelector::Forward).name(), "fwd");
        assert_eq!(fw.new_rule_builder(ChainSelector::Forward).chain(), "fwd");
    }

    #[tokio::test]
    async fn rule_lands_on_selected_chain() {
        let mut fw = firewall().await;
        let rule = fw
            .new_rule_builder(ChainSelector::Output)
            .match_oif_name("lo")
            .verdict(Verdict::Accept)
            .build()
            .unwrap();
        fw.add_rule(rule).unwrap();
        fw.flush().await.unwrap();

        let s = fw.session();
        assert_eq!(s.rules(DEFAULT_TABLE_NAME, "output").len(), 1);
        assert!(s.rules(DEFAULT_TABLE_NAME, "input").is_empty());
        assert_eq!(s.decide(Hook::Output, &Packet::outbound("lo")), Verdict::Accept);
        assert_eq!(s.decide(Hook::Output, &Packet::outbound("eth0")), Verdict::Drop);
        assert_eq!(s.decide(Hook::Input, &Packet::inbound("lo")), Verdict::Drop);
    }

    #[tokio::test]
    async fn first_terminal_verdict_wins() {
        let mut fw = firewall().await;
        let reject_lo = fw
            .new_rule_builder(ChainSelector::Output)
            .match_oif_name("lo")
            .verdict(Verdict::Reject)
            .build()
            .unwrap();
        let accept_lo = fw
            .new_rule_builder(ChainSelector::Output)
            .match_oif_name("lo")
            .verdict(Verdict::Accept)
            .build()
            .unwrap();
        fw.add_rule(reject_lo).unwrap();
        fw.add_rule(accept_lo).unwrap();
        fw.flush().await.unwrap();

        assert_eq!(
            fw.session().decide(Hook::Output, &Packet::outbound("lo")),
            Verdict::Reject
        );
    }

    #[tokio::test]
    async fn failed_commit_leaves_nothing_active() {
        let mut session = MemorySession::new();
        session.reject_next_commit("operation not permitted");
        let mut fw = Firewall::new(session, FirewallConfig::default()).await.unwrap();
        let rule = fw
            .new_rule_builder(ChainSelector::Output)
            .match_oif_name("lo")
            .verdict(Verdict::Accept)
            .build()
            .unwrap();
        fw.add_rule(rule).unwrap();

        let err = fw.flush().await.unwrap_err();
        assert!(matches!(err, FirewallError::Commit(SessionError::Rejected(_))));
        assert_eq!(fw.state(), FirewallState::Uninitialized);

        let s = fw.session();
        assert!(!s.has_table(DEFAULT_TABLE_NAME));
        assert!(s.rules(DEFAULT_TABLE_NAME, "output").is_empty());
        assert_eq!(s.decide(Hook::Output, &Packet::outbound("eth0")), Verdict::Accept);
    }

    #[tokio::test]
    async fn failed_commit_keeps_previous_state() {
        let mut fw = firewall().await;
        fw.flush().await.unwrap();

        let rule = fw
            .new_rule_builder(ChainSelector::Output)
            .match_oif_name("lo")
            .verdict(Verdict::Accept)
            .build()
            .unwrap();
        fw.add_rule(rule).unwrap();
        assert_eq!(fw.state(), FirewallState::Staged);

        fw.session.reject_next_commit("no buffer space available");
        assert!(fw.flush().await.is_err());
        assert_eq!(fw.state(), FirewallState::Committed);

        let s = fw.session();
        assert!(s.has_table(DEFAULT_TABLE_NAME));
        assert!(s.rules(DEFAULT_TABLE_NAME, "output").is_empty());
        assert_eq!(s.decide(Hook::Output, &Packet::outbound("lo")), Verdict::Drop);
    }

    #[tokio::test]
    async fn foreign_rule_is_refused() {
        let mut fw = firewall().await;
        let other = Firewall::new(
            MemorySession::new(),
            FirewallConfig::default().with_table_name("other"),
        )
        .await
        .unwrap();

        let rule = other
            .new_rule_builder(ChainSelector::Output)
            .verdict(Verdict::Accept)
            .build()
            .unwrap();

        let err = fw.add_rule(rule).unwrap_err();
        assert!(matches!(err, FirewallError::ForeignRule { ref table, .. } if table == "other"));
        assert_eq!(fw.session().pending_len(), 4);
    }

    #[tokio::test]
    async fn builder_misuse_stages_nothing() {
        let mut fw = firewall().await;
        let result = fw
            .new_rule_builder(ChainSelector::Output)
            .match_oif_name("eth0")
            .match_l4_proto(L4Proto::Udp)
            .build();

        assert_eq!(result.unwrap_err(), RuleCompileError::MissingVerdict);
        assert_eq!(fw.state(), FirewallState::Staged);
        assert_eq!(fw.session().pending_len(), 4);

        fw.flush().await.unwrap();
        for chain in ["input", "output", "forward"] {
            assert!(fw.session().rules(DEFAULT_TABLE_NAME, chain).is_empty());
        }
    }
}
