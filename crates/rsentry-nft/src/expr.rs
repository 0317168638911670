use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum L4Proto {
    Tcp,
    Udp,
    Icmp,
    #[serde(rename = "ipv6-icmp")]
    IcmpV6,
}

impl L4Proto {
    /// Whether the transport header has source/destination ports.
    pub fn has_ports(&self) -> bool {
        matches!(self, Self::Tcp | Self::Udp)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
            Self::IcmpV6 => "ipv6-icmp",
        }
    }
}

bitflags! {
    /// Connection-tracking state bits as the kernel numbers them.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct CtState: u32 {
        const INVALID = 1;
        const ESTABLISHED = 1 << 1;
        const RELATED = 1 << 2;
        const NEW = 1 << 3;
        const UNTRACKED = 1 << 6;
    }
}

impl CtState {
    fn names(&self) -> Vec<String> {
        self.iter_names()
            .map(|(name, _)| name.to_ascii_lowercase())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
}

/// One test against packet metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchExpr {
    IfName { direction: Direction, name: String },
    L4Proto(L4Proto),
    DestAddr(IpAddr),
    DestPort { proto: L4Proto, port: u16 },
    CtState(CtState),
}

impl MatchExpr {
    pub fn matches(&self, packet: &Packet) -> bool {
        match self {
            Self::IfName { direction, name } => {
                let iface = match direction {
                    Direction::Ingress => packet.iif.as_deref(),
                    Direction::Egress => packet.oif.as_deref(),
                };
                iface == Some(name.as_str())
            }
            Self::L4Proto(proto) => packet.l4proto == Some(*proto),
            Self::DestAddr(addr) => packet.daddr == Some(*addr),
            // A payload match carries an implicit dependency on the protocol.
            Self::DestPort { proto, port } => {
                packet.l4proto == Some(*proto) && packet.dport == Some(*port)
            }
            Self::CtState(mask) => packet.ct_state.intersects(*mask),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::IfName { direction, name } => {
                let key = match direction {
                    Direction::Ingress => "iifname",
                    Direction::Egress => "oifname",
                };
                match_expr(json!({"meta": {"key": key}}), "==", json!(name))
            }
            Self::L4Proto(proto) => {
                match_expr(json!({"meta": {"key": "l4proto"}}), "==", json!(proto))
            }
            Self::DestAddr(addr) => match_expr(
                json!({"payload": {"protocol": ip_protocol(addr), "field": "daddr"}}),
                "==",
                json!(addr.to_string()),
            ),
            Self::DestPort { proto, port } => match_expr(
                json!({"payload": {"protocol": proto, "field": "dport"}}),
                "==",
                json!(port),
            ),
            Self::CtState(mask) => {
                match_expr(json!({"ct": {"key": "state"}}), "in", json!(mask.names()))
            }
        }
    }
}

/// Terminal action of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
    Reject,
    Jump(String),
}

impl Verdict {
    pub fn to_json(&self) -> Value {
        match self {
            Self::Accept => json!({"accept": null}),
            Self::Drop => json!({"drop": null}),
            Self::Reject => json!({"reject": null}),
            Self::Jump(target) => json!({"jump": {"target": target}}),
        }
    }
}

/// Packet metadata as seen at a hook, for evaluating rules in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    pub iif: Option<String>,
    pub oif: Option<String>,
    pub l4proto: Option<L4Proto>,
    pub daddr: Option<IpAddr>,
    pub dport: Option<u16>,
    pub ct_state: CtState,
}

impl Packet {
    pub fn outbound(oif: &str) -> Self {
        Self {
            oif: Some(oif.to_string()),
            ..Self::default()
        }
    }

    pub fn inbound(iif: &str) -> Self {
        Self {
            iif: Some(iif.to_string()),
            ..Self::default()
        }
    }

    pub fn proto(mut self, proto: L4Proto) -> Self {
        self.l4proto = Some(proto);
        self
    }

    pub fn to(mut self, addr: IpAddr, port: u16) -> Self {
        self.daddr = Some(addr);
        self.dport = Some(port);
        self
    }

    pub fn ct(mut self, state: CtState) -> Self {
        self.ct_state = state;
        self
    }
}

/// Decides a single match expression. Rules call it left to right and stop at
/// the first `false`.
pub trait ExprEvaluator {
    fn eval(&mut self, expr: &MatchExpr, packet: &Packet) -> bool;
}

impl<F> ExprEvaluator for F
where
    F: FnMut(&MatchExpr, &Packet) -> bool,
{
    fn eval(&mut self, expr: &MatchExpr, packet: &Packet) -> bool {
        self(expr, packet)
    }
}

fn match_expr(left: Value, op: &str, right: Value) -> Value {
    json!({
        "match": {
            "left": left,
            "op": op,
            "right": right,
        }
    })
}

fn ip_protocol(ip: &IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "ip",
        IpAddr::V6(_) => "ip6",
    }
}
