use crate::expr::{Packet, Verdict};
use crate::rule::Rule;
use crate::session::{NftSession, RuleHandle, SessionError};
use crate::table::{Chain, Family, Hook, Policy, Table};
use serde_json::{Value, json};

/// Jump depth at which the kernel gives up (`NFT_JUMP_STACK_SIZE`).
const MAX_JUMP_DEPTH: usize = 16;

#[derive(Debug, Clone)]
enum Staged {
    Table(Table),
    Chain(Chain),
    Rule(Rule),
}

#[derive(Debug, Clone)]
struct ChainState {
    chain: Chain,
    rules: Vec<Rule>,
}

#[derive(Debug, Clone)]
struct TableState {
    table: Table,
    chains: Vec<ChainState>,
}

impl TableState {
    fn chain(&self, name: &str) -> Option<&ChainState> {
        self.chains.iter().find(|c| c.chain.name() == name)
    }

    fn chain_mut(&mut self, name: &str) -> Option<&mut ChainState> {
        self.chains.iter_mut().find(|c| c.chain.name() == name)
    }
}

/// In-memory model of the kernel filter state.
///
/// Commits are validated as a whole against a copy of the active ruleset and
/// only swapped in when every staged object applies cleanly.
#[derive(Debug, Default)]
pub struct MemorySession {
    active: Vec<TableState>,
    pending: Vec<Staged>,
    reject_next: Option<String>,
    next_handle: u64,
    commits: usize,
    wipes: usize,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail as if the kernel refused the batch.
    pub fn reject_next_commit(&mut self, reason: &str) {
        self.reject_next = Some(reason.to_string());
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn commit_count(&self) -> usize {
        self.commits
    }

    pub fn wipe_count(&self) -> usize {
        self.wipes
    }

    /// Inspection helpers match tables by name in any family.
    pub fn has_table(&self, name: &str) -> bool {
        self.active.iter().any(|t| t.table.name == name)
    }

    pub fn chain(&self, table: &str, chain: &str) -> Option<&Chain> {
        self.table(table)
            .and_then(|t| t.chain(chain))
            .map(|c| &c.chain)
    }

    /// Active rules of a chain, in evaluation order.
    pub fn rules(&self, table: &str, chain: &str) -> &[Rule] {
        self.table(table)
            .and_then(|t| t.chain(chain))
            .map(|c| c.rules.as_slice())
            .unwrap_or(&[])
    }

    /// Verdict the active ruleset reaches for `packet` at `hook`. Every base
    /// chain on the hook is consulted; the packet passes only if none drops or
    /// rejects it.
    pub fn decide(&self, hook: Hook, packet: &Packet) -> Verdict {
        for table in &self.active {
            for state in table.chains.iter().filter(|c| c.chain.hook() == hook) {
                let fallthrough = match state.chain.policy() {
                    Policy::Accept => Verdict::Accept,
                    Policy::Drop => Verdict::Drop,
                };
                let verdict = eval_chain(table, state, packet, 0).unwrap_or(fallthrough);

                if verdict != Verdict::Accept {
                    return verdict;
                }
            }
        }
        Verdict::Accept
    }

    /// Active ruleset in the shape `nft -j list ruleset` prints.
    pub fn ruleset_json(&self) -> Value {
        let mut items = vec![];
        for table in &self.active {
            items.push(table.table.to_json());
            for state in &table.chains {
                items.push(state.chain.to_json());
            }
            for state in &table.chains {
                items.extend(state.rules.iter().map(Rule::to_json));
            }
        }
        json!({"nftables": items})
    }

    /// Seed active state directly, as if an earlier process had committed it.
    pub fn install(&mut self, table: &Table, chains: &[Chain]) {
        self.active.push(TableState {
            table: table.clone(),
            chains: chains
                .iter()
                .map(|c| ChainState {
                    chain: c.clone(),
                    rules: vec![],
                })
                .collect(),
        });
    }

    fn table(&self, name: &str) -> Option<&TableState> {
        self.active.iter().find(|t| t.table.name == name)
    }
}

impl NftSession for MemorySession {
    fn add_table(&mut self, table: &Table) {
        self.pending.push(Staged::Table(table.clone()));
    }

    fn add_chain(&mut self, chain: &Chain) {
        self.pending.push(Staged::Chain(chain.clone()));
    }

    fn add_rule(&mut self, rule: Rule) -> RuleHandle {
        self.pending.push(Staged::Rule(rule));
        let handle = RuleHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    async fn commit(&mut self) -> Result<(), SessionError> {
        let batch = std::mem::take(&mut self.pending);

        if let Some(reason) = self.reject_next.take() {
            return Err(SessionError::Rejected(reason));
        }

        let mut next = self.active.clone();
        for staged in batch {
            apply(&mut next, staged)?;
        }

        self.active = next;
        self.commits += 1;
        Ok(())
    }

    async fn wipe_all(&mut self) -> Result<(), SessionError> {
        self.active.clear();
        self.wipes += 1;
        Ok(())
    }
}

fn apply(tables: &mut Vec<TableState>, staged: Staged) -> Result<(), SessionError> {
    match staged {
        Staged::Table(table) => {
            if !tables.iter().any(|t| t.table == table) {
                tables.push(TableState {
                    table,
                    chains: vec![],
                });
            }
        }
        Staged::Chain(chain) => {
            let table = find_table(tables, chain.family(), chain.table())?;
            match table.chain(chain.name()) {
                None => table.chains.push(ChainState {
                    chain,
                    rules: vec![],
                }),
                Some(existing) if existing.chain == chain => {}
                Some(_) => {
                    return Err(SessionError::Rejected(format!(
                        "chain {} already exists in table {} with a different definition",
                        chain.name(),
                        chain.table()
                    )));
                }
            }
        }
        Staged::Rule(rule) => {
            let table = find_table(tables, rule.family(), rule.table())?;
            if let Verdict::Jump(target) = rule.verdict() {
                if table.chain(target).is_none() {
                    return Err(SessionError::Rejected(format!(
                        "jump target {} not found in table {}",
                        target,
                        rule.table()
                    )));
                }
            }
            let chain = table.chain_mut(rule.chain()).ok_or_else(|| {
                SessionError::Rejected(format!(
                    "chain {} not found in table {}",
                    rule.chain(),
                    rule.table()
                ))
            })?;
            chain.rules.push(rule);
        }
    }
    Ok(())
}

fn find_table<'a>(
    tables: &'a mut [TableState],
    family: Family,
    name: &str,
) -> Result<&'a mut TableState, SessionError> {
    tables
        .iter_mut()
        .find(|t| t.table.family == family && t.table.name == name)
        .ok_or_else(|| {
            SessionError::Rejected(format!("table {} {} not found", family.as_str(), name))
        })
}

// Terminal verdict reached in `state`, or `None` when evaluation falls off the
// end of the chain.
fn eval_chain(
    table: &TableState,
    state: &ChainState,
    packet: &Packet,
    depth: usize,
) -> Option<Verdict> {
    for rule in &state.rules {
        match rule.evaluate(packet) {
            None => continue,
            Some(Verdict::Jump(target)) => {
                if depth >= MAX_JUMP_DEPTH {
                    return Some(Verdict::Drop);
                }
                if let Some(verdict) = table
                    .chain(target)
                    .and_then(|next| eval_chain(table, next, packet, depth + 1))
                {
                    return Some(verdict);
                }
            }
            Some(verdict) => return Some(verdict.clone()),
        }
    }
    None
}
