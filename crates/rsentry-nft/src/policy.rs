//! Kill-switch policy built on top of [`Firewall`].
//!
//! Only the loopback rule is staged by [`configure_blackhole`]. The other rule
//! shapes are kept available for callers that want to open the tunnel path
//! explicitly.

use crate::expr::{CtState, L4Proto, Verdict};
use crate::firewall::{ChainSelector, Firewall, FirewallError};
use crate::rule::{Rule, RuleCompileError};
use crate::session::NftSession;
use std::net::SocketAddr;
use tracing::info;

pub const LOOPBACK_IFACE: &str = "lo";

/// Stage the blackhole policy and commit it: everything is dropped except
/// traffic leaving through loopback.
pub async fn configure_blackhole<S: NftSession>(fw: &mut Firewall<S>) -> Result<(), FirewallError> {
    let loopback = loopback_rule(fw)?;
    fw.add_rule(loopback)?;

    fw.flush().await?;
    info!(table = %fw.table().name, "kill switch engaged");
    Ok(())
}

/// `oifname "lo" accept` on the output chain.
pub fn loopback_rule<S: NftSession>(fw: &Firewall<S>) -> Result<Rule, RuleCompileError> {
    fw.new_rule_builder(ChainSelector::Output)
        .match_oif_name(LOOPBACK_IFACE)
        .verdict(Verdict::Accept)
        .build()
}

/// `oifname <tunnel> accept` on the output chain.
pub fn tunnel_egress_rule<S: NftSession>(
    fw: &Firewall<S>,
    tunnel_iface: &str,
) -> Result<Rule, RuleCompileError> {
    fw.new_rule_builder(ChainSelector::Output)
        .match_oif_name(tunnel_iface)
        .verdict(Verdict::Accept)
        .build()
}

/// Tunnel handshake to the gateway out of the egress interface.
pub fn handshake_rule<S: NftSession>(
    fw: &Firewall<S>,
    egress_iface: &str,
    gateway: SocketAddr,
) -> Result<Rule, RuleCompileError> {
    fw.new_rule_builder(ChainSelector::Output)
        .match_oif_name(egress_iface)
        .match_l4_proto(L4Proto::Udp)
        .match_dest_addr(gateway.ip())
        .match_dest_port(L4Proto::Udp, gateway.port())
        .verdict(Verdict::Accept)
        .build()
}

/// `ct state established,related accept` on the input chain.
pub fn established_rule<S: NftSession>(fw: &Firewall<S>) -> Result<Rule, RuleCompileError> {
    fw.new_rule_builder(ChainSelector::Input)
        .match_ct_state(CtState::ESTABLISHED | CtState::RELATED)
        .verdict(Verdict::Accept)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Packet;
    use crate::firewall::{DEFAULT_TABLE_NAME, FirewallConfig};
    use crate::memory::MemorySession;
    use crate::table::Hook;
    use serde_json::json;

    async fn firewall(session: MemorySession) -> Firewall<MemorySession> {
        Firewall::new(session, FirewallConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn blackhole_allows_only_loopback_egress() {
        let mut fw = firewall(MemorySession::new()).await;
        configure_blackhole(&mut fw).await.unwrap();

        let s = fw.session();
        let gw: SocketAddr = "10.0.0.1:51820".parse().unwrap();

        let output = s.rules(DEFAULT_TABLE_NAME, "output");
        assert_eq!(output.len(), 1);
        assert_eq!(
            output[0].to_json()["rule"]["expr"],
            json!([
                {"match": {"left": {"meta": {"key": "oifname"}}, "op": "==", "right": "lo"}},
                {"accept": null}
            ])
        );
        assert!(s.rules(DEFAULT_TABLE_NAME, "input").is_empty());
        assert!(s.rules(DEFAULT_TABLE_NAME, "forward").is_empty());

        assert_eq!(s.decide(Hook::Output, &Packet::outbound("lo")), Verdict::Accept);
        assert_eq!(
            s.decide(
                Hook::Output,
                &Packet::outbound("eth0").proto(L4Proto::Udp).to(gw.ip(), gw.port())
            ),
            Verdict::Drop
        );
        assert_eq!(
            s.decide(Hook::Input, &Packet::inbound("eth0").ct(CtState::ESTABLISHED)),
            Verdict::Drop
        );
    }

    #[tokio::test]
    async fn blackhole_commit_failure_is_reported() {
        let mut session = MemorySession::new();
        session.reject_next_commit("operation not permitted");
        let mut fw = firewall(session).await;

        let err = configure_blackhole(&mut fw).await.unwrap_err();
        assert!(matches!(err, FirewallError::Commit(_)));
        assert!(!fw.session().has_table(DEFAULT_TABLE_NAME));
    }

    #[tokio::test]
    async fn handshake_rule_matches_only_gateway_endpoint() {
        let mut fw = firewall(MemorySession::new()).await;
        let gw: SocketAddr = "10.0.0.1:51820".parse().unwrap();

        let rule = handshake_rule(&fw, "eth0", gw).unwrap();
        assert_eq!(rule.exprs().len(), 4);
        fw.add_rule(rule).unwrap();
        fw.flush().await.unwrap();

        let s = fw.session();
        let to_gw = Packet::outbound("eth0").proto(L4Proto::Udp).to(gw.ip(), gw.port());
        let elsewhere = Packet::outbound("eth0")
            .proto(L4Proto::Udp)
            .to("10.0.0.2".parse().unwrap(), gw.port());
        let wrong_port = Packet::outbound("eth0").proto(L4Proto::Udp).to(gw.ip(), 53);

        assert_eq!(s.decide(Hook::Output, &to_gw), Verdict::Accept);
        assert_eq!(s.decide(Hook::Output, &elsewhere), Verdict::Drop);
        assert_eq!(s.decide(Hook::Output, &wrong_port), Verdict::Drop);
    }

    #[tokio::test]
    async fn established_rule_accepts_return_traffic() {
        let mut fw = firewall(MemorySession::new()).await;
        let rule = established_rule(&fw).unwrap();
        assert_eq!(rule.chain(), "input");
        fw.add_rule(rule).unwrap();
        fw.flush().await.unwrap();

        let s = fw.session();
        let reply = Packet::inbound("eth0").ct(CtState::ESTABLISHED);
        let fresh = Packet::inbound("eth0").ct(CtState::NEW);
        assert_eq!(s.decide(Hook::Input, &reply), Verdict::Accept);
        assert_eq!(s.decide(Hook::Input, &fresh), Verdict::Drop);
    }

    #[tokio::test]
    async fn tunnel_egress_rule_targets_output() {
        let fw = firewall(MemorySession::new()).await;
        let rule = tunnel_egress_rule(&fw, "wg0").unwrap();
        assert_eq!(rule.chain(), "output");
        assert_eq!(
            rule.to_json()["rule"]["expr"][0]["match"]["right"],
            json!("wg0")
        );
    }
}
