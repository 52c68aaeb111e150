//! Pure parsers for iptables and firewall-cmd text output
//!
//! Neither tool offers a structured query interface we can rely on, so rule
//! state is reconstructed by scraping listings. Everything here is
//! side-effect free and skips lines it does not understand instead of
//! failing the whole listing.

use crate::core::chain::{ChainKind, Direction};
use crate::core::rule::{
    Family, ForwardSpec, LOOPBACK, Protocol, RuleSpec, Strategy, is_unrestricted,
};
use regex::Regex;
use std::sync::LazyLock;

/// `iptables -t nat -nvL CHAIN --line-numbers` rule line.
///
/// Columns: num, pkts, bytes, target, prot, opt (absent on newer
/// iptables), in, out, source, destination, then the match extension
/// (`tcp dpt:8080`) and the translation (`to:10.0.0.5:80` or
/// `redir ports 80`).
static NAT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d+)\s+\S+\s+\S+\s+(\S+)\s+(\S+)\s+(?:(?:--|[-!]f\S*)\s+)?(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(?:\S+\s+)?(?:spts?:(\d{1,5}(?::\d{1,5})?)\s+)?dpts?:(\d{1,5}(?::\d{1,5})?)\s+(?:to:|redir ports\s+)(\S+)",
    )
    .expect("valid NAT listing regex")
});

/// `firewall-cmd --list-forward-ports` entry
static FORWARD_PORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^port=(\d{1,5}(?:-\d{1,5})?):proto=(.+?):toport=(\d{0,5}(?:-\d{1,5})?):toaddr=(.*)$",
    )
    .expect("valid forward-port regex")
});

const PORT_PREFIXES_DST: [&str; 2] = ["dpts:", "dpt:"];
const PORT_PREFIXES_SRC: [&str; 2] = ["spts:", "spt:"];

/// Parses `iptables -t filter -nL CHAIN` into rule specs.
///
/// A line is a rule only if its first token is accept/drop/reject. Jumps and
/// other targets still advance the position counter so sequence numbers match
/// the chain's real rule numbers.
pub fn parse_filter_rules(chain: ChainKind, output: &str) -> Vec<RuleSpec> {
    let mut rules = Vec::new();
    let mut position = 0u32;

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[0] == "Chain" || fields[0] == "target" {
            continue;
        }
        position += 1;

        let Ok(strategy) = fields[0].to_lowercase().parse::<Strategy>() else {
            continue;
        };
        let Ok(protocol) = fields[1].parse::<Protocol>() else {
            continue;
        };

        // Older iptables prints an "opt" column ("--"), newer ones may not
        let mut idx = 2;
        if is_opt_column(fields[idx]) {
            idx += 1;
        }
        let (Some(source), Some(destination)) = (fields.get(idx), fields.get(idx + 1)) else {
            continue;
        };
        let extensions = fields.get(idx + 2..).unwrap_or_default();

        let dst_port = extract_port(extensions, &PORT_PREFIXES_DST);
        let src_port = extract_port(extensions, &PORT_PREFIXES_SRC);

        let address = match chain.direction() {
            Direction::Egress => destination,
            _ => source,
        };
        let address = if is_unrestricted(address) {
            String::new()
        } else {
            (*address).to_string()
        };

        rules.push(RuleSpec {
            chain,
            family: Family::of_address(&address),
            address,
            port: dst_port.or(src_port).unwrap_or_default(),
            protocol: Some(protocol),
            strategy,
            description: String::new(),
            sequence_number: Some(position),
        });
    }
    rules
}

fn is_opt_column(token: &str) -> bool {
    token == "--" || token.starts_with("-f") || token.starts_with("!f")
}

/// Strips `dpt:`/`dpts:` style prefixes and converts `a:b` to `a-b`.
fn extract_port(tokens: &[&str], prefixes: &[&str]) -> Option<String> {
    tokens.iter().find_map(|token| {
        prefixes
            .iter()
            .find_map(|prefix| token.strip_prefix(prefix))
            .map(|port| port.replace(':', "-"))
    })
}

/// Parses `iptables -t nat -nvL CHAIN --line-numbers` into forwards.
///
/// Only DNAT and REDIRECT entries are returned. A redirect prints
/// `redir ports 80` without an address; a colon is prefixed so both shapes
/// split into `addr:port`, with an empty address meaning loopback.
pub fn parse_nat_rules(output: &str) -> Vec<ForwardSpec> {
    let mut forwards = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        let Some(caps) = NAT_LINE.captures(line) else {
            continue;
        };
        let target = &caps[2];
        if target != "DNAT" && target != "REDIRECT" {
            continue;
        }
        let Ok(protocol) = caps[3].parse::<Protocol>() else {
            continue;
        };
        let Ok(number) = caps[1].parse::<u32>() else {
            continue;
        };

        let mut translation = caps[10].to_string();
        if !translation.contains(':') {
            translation = format!(":{translation}");
        }
        let Some((address, target_port)) = translation.rsplit_once(':') else {
            continue;
        };
        let interface = &caps[4];

        forwards.push(ForwardSpec {
            protocol,
            external_port: caps[9].replace(':', "-"),
            target_address: if address.is_empty() {
                LOOPBACK.to_string()
            } else {
                address.to_string()
            },
            target_port: target_port.to_string(),
            inbound_interface: (interface != "*").then(|| interface.to_string()),
            sequence_number: Some(number),
        });
    }
    forwards
}

/// Parses `firewall-cmd --list-ports` (`8080/tcp 100-200/udp`).
pub fn parse_port_list(output: &str) -> Vec<RuleSpec> {
    output
        .split_whitespace()
        .filter_map(|entry| {
            let (port, proto) = entry.split_once('/')?;
            let protocol = proto.parse::<Protocol>().ok()?;
            Some(RuleSpec {
                port: port.to_string(),
                protocol: Some(protocol),
                strategy: Strategy::Accept,
                ..Default::default()
            })
        })
        .collect()
}

/// Tokenizes one rich rule after stripping quotes.
///
/// `rule family="ipv4" source address="10.0.0.1" port port="80" protocol="tcp" accept`
pub fn parse_rich_rule(line: &str) -> Option<RuleSpec> {
    let cleaned = line.replace('"', "");
    let mut rule = RuleSpec::default();
    let mut saw_strategy = false;

    for token in cleaned.split_whitespace() {
        if let Some(v) = token.strip_prefix("family=") {
            rule.family = v.parse().unwrap_or_default();
        } else if let Some(v) = token
            .strip_prefix("address=")
            .or_else(|| token.strip_prefix("ipset="))
        {
            rule.address = v.to_string();
        } else if let Some(v) = token.strip_prefix("port=") {
            rule.port = v.to_string();
        } else if let Some(v) = token
            .strip_prefix("protocol=")
            .or_else(|| token.strip_prefix("value="))
        {
            rule.protocol = v.parse().ok();
        } else if let Ok(strategy) = token.parse::<Strategy>() {
            rule.strategy = strategy;
            saw_strategy = true;
        }
    }

    saw_strategy.then_some(rule)
}

/// Parses `firewall-cmd --list-rich-rules`, one rule per line.
pub fn parse_rich_rules(output: &str) -> Vec<RuleSpec> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(parse_rich_rule)
        .collect()
}

/// Parses `firewall-cmd --list-forward-ports`; a missing `toaddr` is loopback.
pub fn parse_forward_ports(output: &str) -> Vec<ForwardSpec> {
    output
        .split_whitespace()
        .filter_map(|entry| {
            let caps = FORWARD_PORT.captures(entry)?;
            let protocol = caps[2].parse::<Protocol>().ok()?;
            let target_address = if caps[4].is_empty() {
                LOOPBACK.to_string()
            } else {
                caps[4].to_string()
            };
            let target_port = if caps[3].is_empty() {
                caps[1].to_string()
            } else {
                caps[3].to_string()
            };
            Some(ForwardSpec {
                protocol,
                external_port: caps[1].to_string(),
                target_address,
                target_port,
                inbound_interface: None,
                sequence_number: None,
            })
        })
        .collect()
}

/// Whether an `iptables -S` dump declares `-N chain`.
pub fn chain_declared(dump: &str, chain: &str) -> bool {
    dump.lines().any(|line| {
        let mut tokens = line.split_whitespace();
        tokens.next() == Some("-N") && tokens.next() == Some(chain) && tokens.next().is_none()
    })
}

/// Whether an `iptables -S parent` dump contains `-A parent ... -j chain`.
pub fn jump_exists(dump: &str, parent: &str, chain: &str) -> bool {
    dump.lines().any(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        tokens.len() >= 4
            && tokens[0] == "-A"
            && tokens[1] == parent
            && tokens.windows(2).any(|w| w[0] == "-j" && w[1] == chain)
    })
}

/// Rule number of the jump to `chain` in a `-L parent --line-numbers -n` listing.
pub fn jump_position(listing: &str, chain: &str) -> Option<u32> {
    listing.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 2 && fields[1] == chain {
            fields[0].parse().ok()
        } else {
            None
        }
    })
}

/// Lines of an `-S chain` dump that append to exactly `chain`.
pub fn append_lines(dump: &str, chain: &str) -> Vec<String> {
    dump.lines()
        .map(str::trim)
        .filter(|line| is_append_to(line, chain))
        .map(String::from)
        .collect()
}

/// `-A chain ...` with the chain token matching exactly
pub fn is_append_to(line: &str, chain: &str) -> bool {
    let mut tokens = line.split_whitespace();
    tokens.next() == Some("-A") && tokens.next() == Some(chain)
}

/// DROP when the chain's last rule drops everything it sees, ACCEPT otherwise.
///
/// A per-protocol drop (`-p tcp -j DROP`) with no address or port match
/// counts as unconditional.
pub fn default_strategy(listing: &str) -> Strategy {
    let last = listing.lines().rev().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        (fields.len() >= 4 && fields[0] != "target" && fields[0] != "Chain").then_some(fields)
    });
    let Some(fields) = last else {
        return Strategy::Accept;
    };
    let idx = if is_opt_column(fields[2]) { 3 } else { 2 };
    let unrestricted = fields
        .get(idx..idx + 2)
        .is_some_and(|addrs| addrs.iter().all(|a| is_unrestricted(a)));
    let port_match = fields
        .iter()
        .any(|f| PORT_PREFIXES_DST.iter().chain(&PORT_PREFIXES_SRC).any(|p| f.starts_with(p)));
    if fields[0] == "DROP" && unrestricted && !port_match {
        Strategy::Drop
    } else {
        Strategy::Accept
    }
}

/// iptables diagnostic for a chain that does not exist
pub fn is_missing_chain(output: &str) -> bool {
    output.contains("No chain/target/match by that name")
}

/// `iptables v1.8.9 (nf_tables)` -> `v1.8.9 (nf_tables)`
pub fn parse_iptables_version(output: &str) -> String {
    let line = output.lines().next().unwrap_or_default().trim();
    line.strip_prefix("iptables").unwrap_or(line).trim().to_string()
}
