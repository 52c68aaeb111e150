//! Lockout protection
//!
//! A DROP with no address and no port on an ingress or egress chain cuts every
//! connection to the host, the operator's own session included, and nothing
//! can roll it back remotely. Such rules are refused before any command runs.

use crate::core::chain::Direction;
use crate::core::error::{Error, Result};
use crate::core::rule::{RuleSpec, Strategy};

/// Rejects DROP rules that would match all traffic in one direction.
///
/// `basic-after` is exempt: it holds the default-deny tail that sits behind
/// the management-port accepts.
///
/// # Errors
///
/// Returns [`Error::UnsafeRule`] for a lockout rule.
pub fn check_rule_safety(rule: &RuleSpec) -> Result<()> {
    if rule.strategy != Strategy::Drop || rule.has_port() || !rule.is_unrestricted_address() {
        return Ok(());
    }
    match rule.chain.direction() {
        Direction::Ingress => Err(Error::UnsafeRule(format!(
            "DROP from any source without a port on chain '{}' would block all inbound traffic, management access included",
            rule.chain
        ))),
        Direction::Egress => Err(Error::UnsafeRule(format!(
            "DROP to any destination without a port on chain '{}' would block all outbound traffic",
            rule.chain
        ))),
        Direction::Other => Ok(()),
    }
}


#[cfg(test)]
mod property_tests {
    use super::check_rule_safety;
    use crate::core::chain::ChainKind;
    use crate::core::rule::{Protocol, RuleSpec, Strategy as Action};
    use proptest::prelude::*;

    fn protocol() -> impl Strategy<Value = Option<Protocol>> {
        prop_oneof![
            Just(None),
            Just(Some(Protocol::All)),
            Just(Some(Protocol::Tcp)),
            Just(Some(Protocol::Udp)),
            Just(Some(Protocol::TcpUdp)),
            Just(Some(Protocol::Icmp)),
            any::<u8>().prop_map(|n| Some(Protocol::Number(n))),
        ]
    }

    fn ingress_chain() -> impl Strategy<Value = ChainKind> {
        prop_oneof![
            Just(ChainKind::BasicBefore),
            Just(ChainKind::Basic),
            Just(ChainKind::Input),
        ]
    }

    proptest! {
        #[test]
        fn test_unrestricted_ingress_drop_always_rejected(
            chain in ingress_chain(),
            protocol in protocol(),
            address in prop_oneof![Just(""), Just("0.0.0.0/0"), Just("anywhere"), Just("::/0")],
        ) {
            let rule = RuleSpec {
                chain,
                address: address.to_string(),
                protocol,
                strategy: Action::Drop,
                ..Default::default()
            };
            prop_assert!(check_rule_safety(&rule).is_err());
        }

        #[test]
        fn test_port_qualified_drop_always_allowed(chain in ingress_chain(), port in 1u16..=65535) {
            let rule = RuleSpec {
                chain,
                port: port.to_string(),
                protocol: Some(Protocol::Tcp),
                strategy: Action::Drop,
                ..Default::default()
            };
            prop_assert!(check_rule_safety(&rule).is_ok());
        }
    }
}
