use crate::expr::{CtState, Direction, ExprEvaluator, L4Proto, MatchExpr, Packet, Verdict};
use crate::table::Family;
use serde_json::{Value, json};
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleCompileError {
    #[error("rule has no verdict")]
    MissingVerdict,
    #[error("rule builder was already built")]
    AlreadyBuilt,
    #[error("verdict was already set")]
    VerdictAlreadySet,
    #[error("match expression added after the verdict")]
    MatchAfterVerdict,
    #[error("protocol {0} has no ports to match")]
    PortlessProtocol(&'static str),
}

/// Builder lifecycle: `Empty -> Accumulating -> Verdicted -> Built`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderState {
    Empty,
    Accumulating,
    Verdicted,
    Built,
}

/// A compiled rule. It can only be produced by [`RuleBuilder::build`] and is
/// bound to the table and chain of that builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    family: Family,
    table: String,
    chain: String,
    exprs: Vec<MatchExpr>,
    verdict: Verdict,
}

impl Rule {
    pub fn family(&self) -> Family {
        self.family
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn exprs(&self) -> &[MatchExpr] {
        &self.exprs
    }

    pub fn verdict(&self) -> &Verdict {
        &self.verdict
    }

    /// The verdict if every expression matches `packet`, otherwise `None`.
    pub fn evaluate(&self, packet: &Packet) -> Option<&Verdict> {
        self.evaluate_with(packet, &mut |expr: &MatchExpr, p: &Packet| expr.matches(p))
    }

    /// Like [`Rule::evaluate`], deciding each expression through `evaluator`.
    /// Evaluation stops at the first expression that does not match.
    pub fn evaluate_with<E>(&self, packet: &Packet, evaluator: &mut E) -> Option<&Verdict>
    where
        E: ExprEvaluator,
    {
        self.exprs
            .iter()
            .all(|expr| evaluator.eval(expr, packet))
            .then_some(&self.verdict)
    }

    pub fn to_json(&self) -> Value {
        let mut expr: Vec<Value> = self.exprs.iter().map(MatchExpr::to_json).collect();
        expr.push(self.verdict.to_json());

        json!({
            "rule": {
                "family": self.family,
                "table": self.table,
                "chain": self.chain,
                "expr": expr,
            }
        })
    }
}

/// Single-use accumulator for one rule.
///
/// Calls out of order do not panic; the first misuse is remembered and
/// returned from [`RuleBuilder::build`].
#[derive(Debug)]
pub struct RuleBuilder {
    family: Family,
    table: String,
    chain: String,
    exprs: Vec<MatchExpr>,
    verdict: Option<Verdict>,
    state: BuilderState,
    error: Option<RuleCompileError>,
}

impl RuleBuilder {
    pub(crate) fn new(family: Family, table: &str, chain: &str) -> Self {
        Self {
            family,
            table: table.to_string(),
            chain: chain.to_string(),
            exprs: vec![],
            verdict: None,
            state: BuilderState::Empty,
            error: None,
        }
    }

    pub fn state(&self) -> BuilderState {
        self.state
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn match_oif_name(&mut self, name: &str) -> &mut Self {
        self.push(MatchExpr::IfName {
            direction: Direction::Egress,
            name: name.to_string(),
        })
    }

    pub fn match_iif_name(&mut self, name: &str) -> &mut Self {
        self.push(MatchExpr::IfName {
            direction: Direction::Ingress,
            name: name.to_string(),
        })
    }

    pub fn match_l4_proto(&mut self, proto: L4Proto) -> &mut Self {
        self.push(MatchExpr::L4Proto(proto))
    }

    pub fn match_dest_addr(&mut self, addr: IpAddr) -> &mut Self {
        self.push(MatchExpr::DestAddr(addr))
    }

    pub fn match_dest_port(&mut self, proto: L4Proto, port: u16) -> &mut Self {
        if !proto.has_ports() {
            self.fail(RuleCompileError::PortlessProtocol(proto.as_str()));
            return self;
        }
        self.push(MatchExpr::DestPort { proto, port })
    }

    pub fn match_ct_state(&mut self, states: CtState) -> &mut Self {
        self.push(MatchExpr::CtState(states))
    }

    pub fn verdict(&mut self, verdict: Verdict) -> &mut Self {
        match self.state {
            BuilderState::Empty | BuilderState::Accumulating => {
                self.verdict = Some(verdict);
                self.state = BuilderState::Verdicted;
            }
            BuilderState::Verdicted => self.fail(RuleCompileError::VerdictAlreadySet),
            BuilderState::Built => self.fail(RuleCompileError::AlreadyBuilt),
        }
        self
    }

    pub fn build(&mut self) -> Result<Rule, RuleCompileError> {
        if self.state == BuilderState::Built {
            return Err(RuleCompileError::AlreadyBuilt);
        }
        if let Some(err) = &self.error {
            return Err(err.clone());
        }

        let verdict = match (self.state, self.verdict.take()) {
            (BuilderState::Verdicted, Some(verdict)) => verdict,
            _ => return Err(RuleCompileError::MissingVerdict),
        };

        self.state = BuilderState::Built;
        Ok(Rule {
            family: self.family,
            table: self.table.clone(),
            chain: self.chain.clone(),
            exprs: std::mem::take(&mut self.exprs),
            verdict,
        })
    }

    fn push(&mut self, expr: MatchExpr) -> &mut Self {
        match self.state {
            BuilderState::Empty | BuilderState::Accumulating => {
                self.exprs.push(expr);
                self.state = BuilderState::Accumulating;
            }
            BuilderState::Verdicted => self.fail(RuleCompileError::MatchAfterVerdict),
            BuilderState::Built => self.fail(RuleCompileError::AlreadyBuilt),
        }
        self
    }

    fn fail(&mut self, err: RuleCompileError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }
}
