//! Backend-neutral rule model
//!
//! [`RuleSpec`] describes a filter rule and [`ForwardSpec`] a NAT port-forward.
//! Both are plain wire structs: callers fill them in, backends translate them
//! into `iptables` arguments or `firewall-cmd` primitives, and the listing
//! parsers produce them back from tool output.
//!
//! A filter rule is identified by [`RuleKey`] (chain, address, port, protocol,
//! strategy); the sequence number is assigned by the backend and never part of
//! a rule's identity.

use crate::core::chain::ChainKind;
use crate::core::error::{Error, Result};
use crate::validators;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Spelling used by listings for an unrestricted address
pub const ANYWHERE: &str = "anywhere";

/// Loopback target used when a forward has no explicit target address
pub const LOOPBACK: &str = "127.0.0.1";

/// Address family of a rule
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    #[default]
    #[strum(serialize = "ipv4")]
    Ipv4,
    #[strum(serialize = "ipv6")]
    Ipv6,
}

impl Family {
    /// Infers the family from an address: anything containing a colon is IPv6.
    pub fn of_address(address: &str) -> Self {
        if address.contains(':') {
            Family::Ipv6
        } else {
            Family::Ipv4
        }
    }
}

/// What happens to a matching packet
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Strategy {
    #[default]
    #[strum(serialize = "accept")]
    Accept,
    #[strum(serialize = "drop")]
    Drop,
    #[strum(serialize = "reject")]
    Reject,
}

impl Strategy {
    /// Jump target spelling used by iptables
    pub const fn iptables_target(self) -> &'static str {
        match self {
            Strategy::Accept => "ACCEPT",
            Strategy::Drop => "DROP",
            Strategy::Reject => "REJECT",
        }
    }
}

/// Layer-4 protocol selector
///
/// `TcpUdp` is a caller convenience; backends expand it into one rule per
/// protocol. Numeric protocols other than the well-known ones are kept as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Protocol {
    All,
    Tcp,
    Udp,
    TcpUdp,
    Icmp,
    Number(u8),
}

impl Protocol {
    /// Splits `tcp/udp` into its parts; every other protocol maps to itself.
    pub fn expand(self) -> Vec<Protocol> {
        match self {
            Protocol::TcpUdp => vec![Protocol::Tcp, Protocol::Udp],
            other => vec![other],
        }
    }

    /// Whether port matching is meaningful for this protocol
    pub const fn supports_ports(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp | Protocol::TcpUdp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::All => write!(f, "all"),
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::TcpUdp => write!(f, "tcp/udp"),
            Protocol::Icmp => write!(f, "icmp"),
            Protocol::Number(n) => write!(f, "{n}"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "all" | "any" | "0" => Ok(Protocol::All),
            "tcp" | "6" => Ok(Protocol::Tcp),
            "udp" | "17" => Ok(Protocol::Udp),
            "tcp/udp" | "tcp+udp" => Ok(Protocol::TcpUdp),
            "icmp" | "1" => Ok(Protocol::Icmp),
            other => other
                .parse::<u8>()
                .map(Protocol::Number)
                .map_err(|_| format!("unknown protocol '{s}'")),
        }
    }
}

impl TryFrom<String> for Protocol {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Protocol> for String {
    fn from(value: Protocol) -> Self {
        value.to_string()
    }
}

/// Mutation requested by a caller
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[strum(serialize = "add")]
    Add,
    #[strum(serialize = "remove")]
    Remove,
}

/// Inclusive port range; a single port has `start == end`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    /// Parses `"p"`, `"a-b"` or `"a:b"`.
    ///
    /// # Errors
    ///
    /// Returns `Err` when a bound is not a number in 1..=65535 or `a > b`.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let (start, end) = match input.split_once(['-', ':']) {
            Some((a, b)) => (parse_bound(a)?, parse_bound(b)?),
            None => {
                let p = parse_bound(input)?;
                (p, p)
            }
        };
        validators::validate_port_range(start, end).map_err(|m| Error::validation("port", m))?;
        Ok(Self { start, end })
    }

    pub fn is_single(self) -> bool {
        self.start == self.end
    }

    /// iptables spelling: `p` or `a:b`
    pub fn to_iptables(self) -> String {
        if self.is_single() {
            self.start.to_string()
        } else {
            format!("{}:{}", self.start, self.end)
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

fn parse_bound(s: &str) -> Result<u16> {
    s.trim()
        .parse::<u16>()
        .map_err(|_| Error::validation("port", format!("'{s}' is not a port number")))
}

/// Normalizes caller port syntax into the canonical iptables form.
///
/// `"a-b"` and `"a:b"` both become `"a:b"`; a single port is returned as-is.
///
/// # Errors
///
/// Returns a validation error for out-of-range ports or `a > b`.
pub fn normalize_port(input: &str) -> Result<String> {
    let range = PortRange::parse(input)?;
    if input.contains(['-', ':']) {
        Ok(format!("{}:{}", range.start, range.end))
    } else {
        Ok(range.start.to_string())
    }
}

/// A backend-neutral filter rule
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    #[serde(default)]
    pub chain: ChainKind,
    #[serde(default)]
    pub family: Family,
    /// Source CIDR (destination on egress chains); empty or "anywhere" = unrestricted
    #[serde(default)]
    pub address: String,
    /// Single port or range (`a-b`, `a:b` accepted)
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub description: String,
    /// 1-based position within the chain, filled in by listings
    #[serde(default, skip_deserializing)]
    pub sequence_number: Option<u32>,
}

/// Logical identity of a filter rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey {
    pub chain: String,
    pub address: String,
    pub port: String,
    pub protocol: String,
    pub strategy: String,
}

impl RuleSpec {
    pub fn has_port(&self) -> bool {
        !self.port.trim().is_empty()
    }

    pub fn has_address(&self) -> bool {
        !is_unrestricted(&self.address)
    }

    /// True when the rule matches every peer address.
    pub fn is_unrestricted_address(&self) -> bool {
        is_unrestricted(&self.address)
    }

    /// Field-level checks shared by both backends.
    ///
    /// # Errors
    ///
    /// Returns a validation error if a port is given without a port-capable
    /// protocol, the port range is malformed, the address is not an IP/CIDR,
    /// or any field carries shell metacharacters.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("address", self.address.as_str()),
            ("port", self.port.as_str()),
            ("description", self.description.as_str()),
        ] {
            validators::check_shell_safe(value).map_err(|m| Error::validation(field, m))?;
        }

        if self.has_port() {
            match self.protocol {
                None => {
                    return Err(Error::validation(
                        "protocol",
                        "port specification requires a protocol (tcp/udp)",
                    ));
                }
                Some(p) if !p.supports_ports() => {
                    return Err(Error::validation(
                        "protocol",
                        format!("protocol '{p}' does not support ports"),
                    ));
                }
                Some(_) => {}
            }
            PortRange::parse(&self.port)?;
        }

        if !self.is_unrestricted_address() {
            validators::validate_address(&self.address)
                .map_err(|m| Error::validation("address", m))?;
        }
        Ok(())
    }

    /// Identity tuple used for idempotency and listing comparisons.
    pub fn key(&self) -> RuleKey {
        RuleKey {
            chain: self.chain.to_string(),
            address: canonical_address(&self.address),
            port: PortRange::parse(&self.port)
                .map(|p| p.to_string())
                .unwrap_or_else(|_| self.port.trim().to_string()),
            protocol: match self.protocol {
                None | Some(Protocol::All) => String::new(),
                Some(p) => p.to_string(),
            },
            strategy: self.strategy.to_string(),
        }
    }

    /// Same logical rule, ignoring sequence number and description
    pub fn same_rule(&self, other: &RuleSpec) -> bool {
        self.key() == other.key()
    }
}

/// A NAT port-forward
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ForwardSpec {
    pub protocol: Protocol,
    pub external_port: String,
    /// Empty, "127.0.0.1" and "localhost" all mean the local host
    #[serde(default)]
    pub target_address: String,
    pub target_port: String,
    #[serde(default)]
    pub inbound_interface: Option<String>,
    #[serde(default, skip_deserializing)]
    pub sequence_number: Option<u32>,
}

impl ForwardSpec {
    pub fn is_loopback_target(&self) -> bool {
        matches!(
            self.target_address.trim(),
            "" | LOOPBACK | "localhost"
        )
    }

    /// Target address with the loopback default applied
    pub fn resolved_target(&self) -> &str {
        if self.is_loopback_target() {
            LOOPBACK
        } else {
            self.target_address.trim()
        }
    }

    /// # Errors
    ///
    /// Returns a validation error for a missing target port, bad ports,
    /// a protocol without ports, a malformed target address or interface.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("externalPort", self.external_port.as_str()),
            ("targetAddress", self.target_address.as_str()),
            ("targetPort", self.target_port.as_str()),
            (
                "inboundInterface",
                self.inbound_interface.as_deref().unwrap_or_default(),
            ),
        ] {
            validators::check_shell_safe(value).map_err(|m| Error::validation(field, m))?;
        }
        if self.target_port.trim().is_empty() {
            return Err(Error::validation("targetPort", "target port is required"));
        }
        if !self.protocol.supports_ports() {
            return Err(Error::validation(
                "protocol",
                format!("cannot forward protocol '{}'", self.protocol),
            ));
        }
        PortRange::parse(&self.external_port)?;
        PortRange::parse(&self.target_port)?;
        if !self.is_loopback_target() {
            validators::validate_address(&self.target_address)
                .map_err(|m| Error::validation("targetAddress", m))?;
        }
        if let Some(iface) = &self.inbound_interface {
            validators::validate_interface(iface)
                .map_err(|m| Error::validation("inboundInterface", m))?;
        }
        Ok(())
    }

    /// Field-wise equality on protocol, ports, resolved target and interface
    pub fn same_forward(&self, other: &ForwardSpec) -> bool {
        let port = |p: &str| {
            PortRange::parse(p)
                .map(|r| r.to_string())
                .unwrap_or_else(|_| p.trim().to_string())
        };
        let iface = |i: &Option<String>| i.clone().unwrap_or_default();
        self.protocol == other.protocol
            && port(&self.external_port) == port(&other.external_port)
            && port(&self.target_port) == port(&other.target_port)
            && self.resolved_target() == other.resolved_target()
            && iface(&self.inbound_interface) == iface(&other.inbound_interface)
    }

    /// The same forward narrowed to a single protocol
    pub fn with_protocol(&self, protocol: Protocol) -> Self {
        Self {
            protocol,
            ..self.clone()
        }
    }
}

/// Empty, "anywhere", `0.0.0.0/0` and `::/0` all match every address.
pub fn is_unrestricted(address: &str) -> bool {
    let a = address.trim();
    a.is_empty() || a.eq_ignore_ascii_case(ANYWHERE) || a == "0.0.0.0/0" || a == "::/0"
}

/// Drops host masks so `10.0.0.1/32` and `10.0.0.1` compare equal.
fn canonical_address(address: &str) -> String {
    if is_unrestricted(address) {
        return String::new();
    }
    let a = address.trim();
    a.strip_suffix("/32")
        .or_else(|| a.strip_suffix("/128"))
        .unwrap_or(a)
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_parsing() {
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("6".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("17".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert_eq!("1".parse::<Protocol>().unwrap(), Protocol::Icmp);
        assert_eq!("0".parse::<Protocol>().unwrap(), Protocol::All);
        assert_eq!("tcp/udp".parse::<Protocol>().unwrap(), Protocol::TcpUdp);
        assert_eq!("47".parse::<Protocol>().unwrap(), Protocol::Number(47));
        assert!("bogus".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_protocol_expand() {
        assert_eq!(Protocol::TcpUdp.expand(), vec![Protocol::Tcp, Protocol::Udp]);
        assert_eq!(Protocol::Icmp.expand(), vec![Protocol::Icmp]);
    }

    #[test]
    fn test_normalize_port() {
        assert_eq!(normalize_port("80").unwrap(), "80");
        assert_eq!(normalize_port("100-200").unwrap(), "100:200");
        assert_eq!(normalize_port("100:200").unwrap(), "100:200");
        assert!(normalize_port("100-50").is_err());
        assert!(normalize_port("0").is_err());
        assert!(normalize_port("70000").is_err());
        assert!(normalize_port("abc").is_err());
    }

    #[test]
    fn test_port_requires_protocol() {
        let rule = RuleSpec {
            port: "8080".into(),
            ..Default::default()
        };
        let err = rule.validate().unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_icmp_with_port_rejected() {
        let rule = RuleSpec {
            port: "8080".into(),
            protocol: Some(Protocol::Icmp),
            ..Default::default()
        };
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_shell_metacharacters_rejected() {
        let rule = RuleSpec {
            address: "10.0.0.1; reboot".into(),
            ..Default::default()
        };
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_rule_key_ignores_sequence_and_masks() {
        let a = RuleSpec {
            address: "10.0.0.1/32".into(),
            port: "100:200".into(),
            protocol: Some(Protocol::Tcp),
            sequence_number: Some(3),
            ..Default::default()
        };
        let b = RuleSpec {
            address: "10.0.0.1".into(),
            port: "100-200".into(),
            protocol: Some(Protocol::Tcp),
            sequence_number: Some(7),
            description: "other".into(),
            ..Default::default()
        };
        assert!(a.same_rule(&b));
    }

    #[test]
    fn test_rule_key_all_protocol_equals_none() {
        let a = RuleSpec {
            address: "10.0.0.1".into(),
            protocol: Some(Protocol::All),
            ..Default::default()
        };
        let b = RuleSpec {
            address: "10.0.0.1".into(),
            ..Default::default()
        };
        assert!(a.same_rule(&b));
    }

    #[test]
    fn test_forward_loopback_resolution() {
        let fwd = ForwardSpec {
            protocol: Protocol::Tcp,
            external_port: "8080".into(),
            target_address: "localhost".into(),
            target_port: "80".into(),
            inbound_interface: None,
            sequence_number: None,
        };
        assert!(fwd.is_loopback_target());
        assert_eq!(fwd.resolved_target(), LOOPBACK);
    }

    #[test]
    fn test_forward_requires_target_port() {
        let fwd = ForwardSpec {
            protocol: Protocol::Tcp,
            external_port: "8080".into(),
            target_address: String::new(),
            target_port: String::new(),
            inbound_interface: None,
            sequence_number: None,
        };
        assert!(fwd.validate().unwrap_err().is_validation());
    }

    #[test]
    fn test_sequence_number_not_deserialized() {
        let json = r#"{"chain":"basic","port":"22","protocol":"tcp","strategy":"accept","sequenceNumber":5}"#;
        let rule: RuleSpec = serde_json::from_str(json).unwrap();
        assert_eq!(rule.sequence_number, None);
        assert_eq!(rule.protocol, Some(Protocol::Tcp));
    }

    #[test]
    fn test_family_inference() {
        assert_eq!(Family::of_address("2001:db8::1"), Family::Ipv6);
        assert_eq!(Family::of_address("10.0.0.1"), Family::Ipv4);
        assert_eq!(Family::of_address(""), Family::Ipv4);
    }
}
