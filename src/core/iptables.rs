//! iptables backend
//!
//! iptables has no zones, no persistence and strictly ordered rules, so this
//! backend builds those on top of it: a fixed set of `FWGATE_*` custom chains
//! spliced into the system chains, idempotent appends guarded by `-C`, and a
//! [`RuleStore`] file per chain rewritten after every mutation.
//!
//! Adds are check-then-act (`-C` then `-A`) with no lock around them. Two
//! concurrent adds of the same rule can both pass the check and both append;
//! callers needing exactly-once must serialize mutations themselves.

use crate::core::chain::{Bind, ChainKind, Direction, IptablesCmd, Table};
use crate::core::client::FirewallClient;
use crate::core::error::{Error, Result};
use crate::core::parsers;
use crate::core::persistence::RuleStore;
use crate::core::rule::{
    Family, ForwardSpec, Operation, PortRange, Protocol, RuleSpec, Strategy, normalize_port,
};
use crate::core::safety;
use crate::runner::CommandRunner;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

/// Chains listed for [`FirewallClient::list_port`] and `list_address`
const USER_CHAINS: [ChainKind; 3] = [ChainKind::Basic, ChainKind::Input, ChainKind::Output];

/// Companion chains of a DNAT forward
const FORWARD_CHAINS: [ChainKind; 3] = [
    ChainKind::ForwardPre,
    ChainKind::ForwardPost,
    ChainKind::Forward,
];

/// Startup and chain policy knobs
#[derive(Debug, Clone)]
pub struct IptablesOptions {
    /// TCP ports always accepted ahead of user rules
    pub management_ports: Vec<String>,
    /// Append tcp/udp DROP to `basic-after`
    pub default_drop: bool,
}

impl Default for IptablesOptions {
    fn default() -> Self {
        Self {
            management_ports: vec!["22".to_string()],
            default_drop: false,
        }
    }
}

pub struct IptablesBackend<R> {
    cmd: IptablesCmd<R>,
    store: RuleStore,
    options: IptablesOptions,
}

/// The rules one forward materializes into, per protocol
struct ForwardRules {
    pre: String,
    post: Option<String>,
    forward_in: Option<String>,
    forward_out: Option<String>,
}

impl<R: CommandRunner> IptablesBackend<R> {
    pub fn new(
        runner: Arc<R>,
        timeout: Duration,
        store: RuleStore,
        options: IptablesOptions,
    ) -> Self {
        Self {
            cmd: IptablesCmd::new(runner, timeout),
            store,
            options,
        }
    }

    /// Replays every chain file, then creates, fills and binds all chains.
    ///
    /// Safe to run repeatedly. Returns the number of rules restored from disk.
    ///
    /// # Errors
    ///
    /// Returns `Err` if a chain cannot be created or bound, or a pre-rule
    /// cannot be installed. Unreadable chain files are logged and skipped.
    pub async fn bootstrap(&self) -> Result<usize> {
        let restored = self.store.load_all(&self.cmd).await;
        self.prepare_chains().await?;
        info!("iptables chains ready ({restored} rules restored)");
        Ok(restored)
    }

    /// Creates, fills and binds every chain, keeping whatever rules are live.
    ///
    /// # Errors
    ///
    /// Returns `Err` if a chain cannot be created or bound, or a pre-rule
    /// cannot be installed.
    pub async fn prepare_chains(&self) -> Result<()> {
        for kind in ChainKind::ALL {
            self.ensure_chain(kind).await?;
        }
        self.install_pre_rules().await?;
        self.install_default_drop().await
    }

    /// Creates the chain if missing and splices it into its parent.
    ///
    /// A missing chain is rebuilt from its rule file first, so a mutation
    /// after a reboot never snapshots an empty chain over saved rules.
    ///
    /// # Errors
    ///
    /// Returns `Err` if any iptables call fails or the rule file is unreadable.
    pub async fn ensure_chain(&self, kind: ChainKind) -> Result<()> {
        let (table, chain) = (kind.table(), kind.chain_name());
        if !self.cmd.chain_exists(table, chain).await? {
            let restored = self.store.load(&self.cmd, kind).await?;
            if restored > 0 {
                info!("Rebuilt {chain} from its rule file ({restored} rules)");
            }
            self.cmd.ensure_chain(table, chain).await?;
        }
        self.bind_chain(kind).await
    }

    /// Installs the jump into `kind` unless it is already there.
    ///
    /// # Errors
    ///
    /// Returns `Err` if any iptables call fails.
    pub async fn bind_chain(&self, kind: ChainKind) -> Result<()> {
        let (table, parent, chain) = (kind.table(), kind.parent(), kind.chain_name());
        match kind.bind() {
            Bind::Insert(position) => self.cmd.bind_insert(table, parent, chain, position).await,
            Bind::AfterSiblings => {
                let position = self.sibling_position(kind).await?;
                self.cmd.bind_insert(table, parent, chain, position).await
            }
            Bind::Append => self.cmd.bind_append(table, parent, chain).await,
        }
    }

    /// Removes the jump into `kind`; its rules stay in place.
    ///
    /// # Errors
    ///
    /// Returns `Err` if any iptables call fails.
    pub async fn unbind_chain(&self, kind: ChainKind) -> Result<()> {
        self.cmd
            .unbind(kind.table(), kind.parent(), kind.chain_name())
            .await
    }

    /// One past the last bound sibling that precedes `kind`
    async fn sibling_position(&self, kind: ChainKind) -> Result<u32> {
        let listing = self
            .cmd
            .run(kind.table(), &format!("-L {} --line-numbers -n", kind.parent()))
            .await?;
        let last = ChainKind::ALL
            .into_iter()
            .take_while(|k| *k != kind)
            .filter(|k| k.parent() == kind.parent())
            .filter_map(|k| parsers::jump_position(&listing, k.chain_name()))
            .max()
            .unwrap_or(0);
        Ok(last + 1)
    }

    async fn install_pre_rules(&self) -> Result<()> {
        let chain = ChainKind::BasicBefore.chain_name();
        let mut rules = vec![
            "-i lo -j ACCEPT".to_string(),
            "-m conntrack --ctstate ESTABLISHED,RELATED -j ACCEPT".to_string(),
        ];
        for port in &self.options.management_ports {
            match normalize_port(port) {
                Ok(port) => rules.push(format!("-p tcp -m tcp --dport {port} -j ACCEPT")),
                Err(e) => warn!("Ignoring management port '{port}': {e}"),
            }
        }

        let mut changed = false;
        for rule in &rules {
            changed |= self.cmd.add_rule(Table::Filter, chain, rule).await?;
        }
        if changed {
            self.persist(ChainKind::BasicBefore).await;
        }
        Ok(())
    }

    async fn install_default_drop(&self) -> Result<()> {
        let chain = ChainKind::BasicAfter.chain_name();
        let mut changed = false;
        for rule in ["-p tcp -j DROP", "-p udp -j DROP"] {
            if self.options.default_drop {
                changed |= self.cmd.add_rule(Table::Filter, chain, rule).await?;
            } else if self.cmd.rule_exists(Table::Filter, chain, rule).await {
                self.cmd.delete_rule(Table::Filter, chain, rule).await?;
                changed = true;
            }
        }
        if changed {
            self.persist(ChainKind::BasicAfter).await;
        }
        Ok(())
    }

    /// Best-effort snapshot; the live rule matters more than the file
    async fn persist(&self, kind: ChainKind) {
        if let Err(e) = self.store.save(&self.cmd, kind).await {
            warn!("Failed to persist {}: {e}", kind.chain_name());
        }
    }

    /// Lists the rules of one logical filter chain.
    ///
    /// # Errors
    ///
    /// Returns `Err` for a NAT chain or if the listing command fails.
    pub async fn list_rules(&self, kind: ChainKind) -> Result<Vec<RuleSpec>> {
        if kind.table() != Table::Filter {
            return Err(Error::validation("chain", format!("'{kind}' is not a filter chain")));
        }
        let args = format!("-nL {}", kind.chain_name());
        let Some(listing) = self.listing(Table::Filter, &args).await? else {
            return Ok(Vec::new());
        };
        Ok(parsers::parse_filter_rules(kind, &listing))
    }

    /// DROP when the chain ends in an unconditional drop, else ACCEPT.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the listing command fails.
    pub async fn default_strategy(&self, kind: ChainKind) -> Result<Strategy> {
        let listing = self
            .cmd
            .run(kind.table(), &format!("-nL {}", kind.chain_name()))
            .await?;
        Ok(parsers::default_strategy(&listing))
    }

    async fn list_user_chains(&self) -> Result<Vec<RuleSpec>> {
        let (basic, input, output) = tokio::join!(
            self.list_rules(USER_CHAINS[0]),
            self.list_rules(USER_CHAINS[1]),
            self.list_rules(USER_CHAINS[2]),
        );
        let mut rules = basic?;
        rules.extend(input?);
        rules.extend(output?);
        Ok(rules)
    }

    /// Arguments after `-A CHAIN` for one protocol of `rule`
    fn filter_rule_args(rule: &RuleSpec, protocol: Option<Protocol>) -> Result<String> {
        let mut args = Vec::new();
        if let Some(p) = protocol.filter(|p| *p != Protocol::All) {
            args.push(format!("-p {p}"));
        }
        if rule.has_address() {
            let flag = match rule.chain.direction() {
                Direction::Egress => "-d",
                _ => "-s",
            };
            args.push(format!("{flag} {}", rule.address.trim()));
        }
        if rule.has_port() {
            let p = protocol.ok_or_else(|| {
                Error::validation("protocol", "port specification requires a protocol (tcp/udp)")
            })?;
            args.push(format!("-m {p} --dport {}", normalize_port(&rule.port)?));
        }
        args.push(format!("-j {}", rule.strategy.iptables_target()));
        Ok(args.join(" "))
    }

    async fn apply_filter_rule(&self, rule: &RuleSpec, op: Operation) -> Result<()> {
        rule.validate()?;
        if !rule.chain.accepts_filter_rules() {
            return Err(Error::validation(
                "chain",
                format!("chain '{}' does not take filter rules", rule.chain),
            ));
        }
        if op == Operation::Add {
            safety::check_rule_safety(rule)?;
        }
        if rule.has_address() && Family::of_address(&rule.address) == Family::Ipv6 {
            return Err(Error::validation(
                "address",
                "IPv6 addresses are not supported by the iptables backend",
            ));
        }

        let protocols: Vec<Option<Protocol>> = match rule.protocol {
            Some(p) => p.expand().into_iter().map(Some).collect(),
            None => vec![None],
        };
        let args = protocols
            .into_iter()
            .map(|p| Self::filter_rule_args(rule, p))
            .collect::<Result<Vec<_>>>()?;

        self.ensure_chain(rule.chain).await?;

        // A half-applied tcp/udp pair still changed the chain
        let applied = self.apply_filter_args(rule.chain, &args, op).await;
        self.persist(rule.chain).await;
        applied
    }

    async fn apply_filter_args(
        &self,
        kind: ChainKind,
        args: &[String],
        op: Operation,
    ) -> Result<()> {
        let (table, chain) = (kind.table(), kind.chain_name());
        for arg in args {
            match op {
                Operation::Add => {
                    if self.cmd.add_rule(table, chain, arg).await? {
                        info!("Added rule to {chain}: {arg}");
                    }
                }
                Operation::Remove => {
                    self.cmd.delete_rule(table, chain, arg).await?;
                    info!("Removed rule from {chain}: {arg}");
                }
            }
        }
        Ok(())
    }

    fn forward_rules(forward: &ForwardSpec, protocol: Protocol) -> Result<ForwardRules> {
        let external = normalize_port(&forward.external_port)?;
        let target_range = PortRange::parse(&forward.target_port)?;
        let iface = forward
            .inbound_interface
            .as_deref()
            .filter(|i| !i.is_empty())
            .map(|i| format!("-i {i} "))
            .unwrap_or_default();

        if forward.is_loopback_target() {
            return Ok(ForwardRules {
                pre: format!(
                    "{iface}-p {protocol} -m {protocol} --dport {external} -j REDIRECT --to-ports {target_range}"
                ),
                post: None,
                forward_in: None,
                forward_out: None,
            });
        }

        let target = forward.resolved_target();
        let target_port = target_range.to_iptables();
        Ok(ForwardRules {
            pre: format!(
                "{iface}-p {protocol} -m {protocol} --dport {external} -j DNAT --to-destination {target}:{target_range}"
            ),
            post: Some(format!(
                "-d {target} -p {protocol} -m {protocol} --dport {target_port} -j MASQUERADE"
            )),
            forward_in: Some(format!(
                "-d {target} -p {protocol} -m {protocol} --dport {target_port} -j ACCEPT"
            )),
            forward_out: Some(format!(
                "-s {target} -p {protocol} -m {protocol} --sport {target_port} -j ACCEPT"
            )),
        })
    }

    fn check_forward(forward: &ForwardSpec) -> Result<()> {
        forward.validate()?;
        if Family::of_address(forward.resolved_target()) == Family::Ipv6 {
            return Err(Error::validation(
                "targetAddress",
                "IPv6 targets are not supported by the iptables backend",
            ));
        }
        Ok(())
    }

    async fn add_forward(&self, forward: &ForwardSpec) -> Result<()> {
        Self::check_forward(forward)?;
        let plans = forward
            .protocol
            .expand()
            .into_iter()
            .map(|p| Self::forward_rules(forward, p))
            .collect::<Result<Vec<_>>>()?;

        let kinds = Self::forward_kinds(forward);
        for kind in kinds {
            self.ensure_chain(*kind).await?;
        }

        let installed = self.install_forward(&plans).await;
        for kind in kinds {
            self.persist(*kind).await;
        }
        installed?;

        info!(
            "Forwarded {}/{} to {}:{}",
            forward.external_port,
            forward.protocol,
            forward.resolved_target(),
            forward.target_port
        );
        Ok(())
    }

    /// Chains a forward writes to
    fn forward_kinds(forward: &ForwardSpec) -> &'static [ChainKind] {
        if forward.is_loopback_target() {
            &[ChainKind::ForwardPre]
        } else {
            &FORWARD_CHAINS
        }
    }

    async fn install_forward(&self, plans: &[ForwardRules]) -> Result<()> {
        for plan in plans {
            self.cmd
                .add_rule(Table::Nat, ChainKind::ForwardPre.chain_name(), &plan.pre)
                .await?;
            if let Some(post) = &plan.post {
                self.cmd
                    .add_rule(Table::Nat, ChainKind::ForwardPost.chain_name(), post)
                    .await?;
            }
            for rule in plan.forward_in.iter().chain(&plan.forward_out) {
                self.cmd
                    .add_rule(Table::Filter, ChainKind::Forward.chain_name(), rule)
                    .await?;
            }
        }
        Ok(())
    }

    async fn remove_forward(&self, forward: &ForwardSpec) -> Result<()> {
        Self::check_forward(forward)?;
        let kinds = Self::forward_kinds(forward);
        for kind in kinds {
            self.ensure_chain(*kind).await?;
        }

        let removed = self.uninstall_forward(forward).await;
        for kind in kinds {
            self.persist(*kind).await;
        }
        removed?;

        info!(
            "Removed forward {}/{} -> {}:{}",
            forward.external_port,
            forward.protocol,
            forward.resolved_target(),
            forward.target_port
        );
        Ok(())
    }

    async fn uninstall_forward(&self, forward: &ForwardSpec) -> Result<()> {
        let pre_chain = ChainKind::ForwardPre.chain_name();
        for protocol in forward.protocol.expand() {
            let wanted = forward.with_protocol(protocol);
            let plan = Self::forward_rules(forward, protocol)?;

            let listed = self.list_nat_forwards().await?;
            let Some(number) = listed
                .iter()
                .find(|f| f.same_forward(&wanted))
                .and_then(|f| f.sequence_number)
            else {
                return Err(Error::NotFound(format!(
                    "forward {}/{protocol} -> {}:{}",
                    forward.external_port,
                    forward.resolved_target(),
                    forward.target_port
                )));
            };

            self.cmd.delete_rule_at(Table::Nat, pre_chain, number).await?;

            if let Some(post) = &plan.post {
                self.delete_companion(Table::Nat, ChainKind::ForwardPost, post)
                    .await;
            }
            for rule in plan.forward_in.iter().chain(&plan.forward_out) {
                self.delete_companion(Table::Filter, ChainKind::Forward, rule)
                    .await;
            }
        }
        Ok(())
    }

    /// A missing companion leaves nothing to undo
    async fn delete_companion(&self, table: Table, kind: ChainKind, rule: &str) {
        if let Err(e) = self.cmd.delete_rule(table, kind.chain_name(), rule).await {
            warn!("Companion rule already gone from {}: {rule} ({e})", kind.chain_name());
        }
    }

    async fn list_nat_forwards(&self) -> Result<Vec<ForwardSpec>> {
        let args = format!("-nvL {} --line-numbers", ChainKind::ForwardPre.chain_name());
        let Some(listing) = self.listing(Table::Nat, &args).await? else {
            return Ok(Vec::new());
        };
        Ok(parsers::parse_nat_rules(&listing))
    }

    /// Runs a listing; `None` when the chain has not been created yet
    async fn listing(&self, table: Table, args: &str) -> Result<Option<String>> {
        match self.cmd.run(table, args).await {
            Ok(listing) => Ok(Some(listing)),
            Err(e) if e.tool_output().is_some_and(parsers::is_missing_chain) => {
                debug!("Nothing to list yet: iptables -t {table} {args}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl<R: CommandRunner> FirewallClient for IptablesBackend<R> {
    fn name(&self) -> &'static str {
        "iptables"
    }

    async fn start(&self) -> Result<()> {
        for kind in ChainKind::ALL {
            self.ensure_chain(kind).await?;
        }
        info!("iptables chains bound");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        for kind in ChainKind::ALL.into_iter().filter(|k| k.table() == Table::Filter) {
            self.unbind_chain(kind).await?;
        }
        info!("iptables filter chains unbound");
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    /// Rebinds and refills the chains; rule files are only replayed by
    /// [`IptablesBackend::bootstrap`]
    async fn reload(&self) -> Result<()> {
        self.prepare_chains().await?;
        info!("iptables chains reloaded");
        Ok(())
    }

    async fn status(&self) -> Result<bool> {
        let basic = ChainKind::Basic;
        self.cmd
            .is_bound(basic.table(), basic.parent(), basic.chain_name())
            .await
    }

    async fn version(&self) -> Result<String> {
        let output = self
            .cmd
            .runner()
            .run("iptables --version", self.cmd.timeout())
            .await?;
        Ok(parsers::parse_iptables_version(&output))
    }

    async fn list_port(&self) -> Result<Vec<RuleSpec>> {
        let rules = self.list_user_chains().await?;
        Ok(rules.into_iter().filter(RuleSpec::has_port).collect())
    }

    async fn list_forward(&self) -> Result<Vec<ForwardSpec>> {
        self.list_nat_forwards().await
    }

    async fn list_address(&self) -> Result<Vec<RuleSpec>> {
        let rules = self.list_user_chains().await?;
        Ok(rules
            .into_iter()
            .filter(|r| r.has_address() && !r.has_port())
            .collect())
    }

    async fn apply_port_rule(&self, rule: &RuleSpec, op: Operation) -> Result<()> {
        if !rule.has_port() {
            return Err(Error::validation("port", "port rule requires a port"));
        }
        self.apply_filter_rule(rule, op).await
    }

    async fn apply_address_rule(&self, rule: &RuleSpec, op: Operation) -> Result<()> {
        if rule.has_port() {
            return Err(Error::validation("port", "address rule must not carry a port"));
        }
        self.apply_filter_rule(rule, op).await
    }

    async fn apply_forward(&self, forward: &ForwardSpec, op: Operation) -> Result<()> {
        match op {
            Operation::Add => self.add_forward(forward).await,
            Operation::Remove => self.remove_forward(forward).await,
        }
    }

    async fn enable_forwarding(&self) -> Result<()> {
        let runner = self.cmd.runner();
        let timeout = self.cmd.timeout();
        let current = runner.run(&format!("cat {IP_FORWARD_PATH}"), timeout).await?;
        if current.trim() == "0" {
            runner.run("sysctl -w net.ipv4.ip_forward=1", timeout).await?;
            info!("Enabled IPv4 forwarding");
        }
        for kind in FORWARD_CHAINS {
            self.ensure_chain(kind).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{MockRunner, address_rule, forward, port_rule};

    fn backend(runner: &Arc<MockRunner>, dir: &tempfile::TempDir) -> IptablesBackend<MockRunner> {
        IptablesBackend::new(
            Arc::clone(runner),
            Duration::from_secs(5),
            RuleStore::new(dir.path()),
            IptablesOptions::default(),
        )
    }

    fn mutations(runner: &MockRunner) -> Vec<String> {
        runner
            .commands()
            .into_iter()
            .filter(|c| c.contains(" -A FWGATE_") || c.contains(" -D FWGATE_"))
            .collect()
    }

    #[test]
    fn test_filter_rule_args() {
        let rule = port_rule("8000-9000", Protocol::Tcp, Strategy::Accept);
        let args =
            IptablesBackend::<MockRunner>::filter_rule_args(&rule, Some(Protocol::Tcp)).unwrap();
        assert_eq!(args, "-p tcp -m tcp --dport 8000:9000 -j ACCEPT");

        let mut egress = address_rule(ChainKind::Output, "1.1.1.1", Strategy::Reject);
        egress.protocol = Some(Protocol::All);
        let args =
            IptablesBackend::<MockRunner>::filter_rule_args(&egress, egress.protocol).unwrap();
        assert_eq!(args, "-d 1.1.1.1 -j REJECT");
    }

    #[tokio::test]
    async fn test_port_rule_add_is_idempotent() {
        let runner = Arc::new(MockRunner::new());
        let dir = tempfile::tempdir().unwrap();
        runner.fail("iptables -t filter -C FWGATE_BASIC", "iptables: Bad rule");
        runner.respond("iptables -t filter -C FWGATE_BASIC", Ok(String::new()));
        let fw = backend(&runner, &dir);
        let rule = port_rule("8080", Protocol::Tcp, Strategy::Accept);

        fw.apply_port_rule(&rule, Operation::Add).await.unwrap();
        fw.apply_port_rule(&rule, Operation::Add).await.unwrap();

        assert_eq!(
            runner.count("iptables -t filter -A FWGATE_BASIC -p tcp -m tcp --dport 8080 -j ACCEPT"),
            1
        );
        assert!(runner.ran("iptables -t filter -S FWGATE_BASIC"));
    }

    #[tokio::test]
    async fn test_tcp_udp_expands() {
        let runner = Arc::new(MockRunner::new());
        let dir = tempfile::tempdir().unwrap();
        runner.fail("iptables -t filter -C", "iptables: Bad rule");
        let fw = backend(&runner, &dir);

        fw.apply_port_rule(&port_rule("53", Protocol::TcpUdp, Strategy::Accept), Operation::Add)
            .await
            .unwrap();

        assert!(runner.ran(
            "iptables -t filter -A FWGATE_BASIC -p tcp -m tcp --dport 53 -j ACCEPT"
        ));
        assert!(runner.ran(
            "iptables -t filter -A FWGATE_BASIC -p udp -m udp --dport 53 -j ACCEPT"
        ));
    }

    #[tokio::test]
    async fn test_invalid_range_issues_no_command() {
        let runner = Arc::new(MockRunner::new());
        let dir = tempfile::tempdir().unwrap();
        let fw = backend(&runner, &dir);

        let err = fw
            .apply_port_rule(&port_rule("100-50", Protocol::Tcp, Strategy::Accept), Operation::Add)
            .await
            .unwrap_err();

        assert!(err.is_validation());
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_lockout_drop_issues_no_command() {
        let runner = Arc::new(MockRunner::new());
        let dir = tempfile::tempdir().unwrap();
        let fw = backend(&runner, &dir);

        let err = fw
            .apply_address_rule(
                &address_rule(ChainKind::Basic, "0.0.0.0/0", Strategy::Drop),
                Operation::Add,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UnsafeRule(_)));
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_ipv6_address_rejected() {
        let runner = Arc::new(MockRunner::new());
        let dir = tempfile::tempdir().unwrap();
        let fw = backend(&runner, &dir);

        let err = fw
            .apply_address_rule(
                &address_rule(ChainKind::Basic, "2001:db8::1", Strategy::Drop),
                Operation::Add,
            )
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_remove_surfaces_tool_error() {
        let runner = Arc::new(MockRunner::new());
        let dir = tempfile::tempdir().unwrap();
        runner.fail(
            "iptables -t filter -D FWGATE_BASIC",
            "iptables: Bad rule (does a matching rule exist in that chain?).",
        );
        let fw = backend(&runner, &dir);

        let err = fw
            .apply_port_rule(&port_rule("8080", Protocol::Tcp, Strategy::Accept), Operation::Remove)
            .await
            .unwrap_err();
        assert!(err.tool_output().unwrap().contains("matching rule"));
    }

    #[tokio::test]
    async fn test_forward_collapses_for_loopback() {
        let runner = Arc::new(MockRunner::new());
        let dir = tempfile::tempdir().unwrap();
        runner.fail("iptables -t nat -C", "iptables: Bad rule");
        runner.fail("iptables -t filter -C", "iptables: Bad rule");
        let fw = backend(&runner, &dir);

        fw.apply_forward(&forward("8080", "", "80"), Operation::Add)
            .await
            .unwrap();
        let local = mutations(&runner);
        assert_eq!(local.len(), 1);
        assert!(local[0].contains("-j REDIRECT --to-ports 80"));

        let runner = Arc::new(MockRunner::new());
        runner.fail("iptables -t nat -C", "iptables: Bad rule");
        runner.fail("iptables -t filter -C", "iptables: Bad rule");
        let fw = backend(&runner, &dir);

        fw.apply_forward(&forward("8081", "10.0.0.5", "80"), Operation::Add)
            .await
            .unwrap();
        let remote = mutations(&runner);
        assert_eq!(remote.len(), 4);
        assert!(remote[0].contains("-j DNAT --to-destination 10.0.0.5:80"));
        assert!(remote[1].starts_with("iptables -t nat -A FWGATE_POSTROUTING -d 10.0.0.5"));
        assert!(remote[3].contains("--sport 80 -j ACCEPT"));
        assert!(local.len() < remote.len());
    }

    #[tokio::test]
    async fn test_failed_forward_add_still_saves_chains() {
        let runner = Arc::new(MockRunner::new());
        let dir = tempfile::tempdir().unwrap();
        runner.fail("iptables -t nat -C", "iptables: Bad rule");
        runner.fail(
            "iptables -t nat -A FWGATE_POSTROUTING",
            "iptables: Resource temporarily unavailable.",
        );
        let fw = backend(&runner, &dir);

        let err = fw
            .apply_forward(&forward("8081", "10.0.0.5", "80"), Operation::Add)
            .await
            .unwrap_err();

        assert!(err.tool_output().is_some());
        assert!(runner.ran(
            "iptables -t nat -A FWGATE_PREROUTING -p tcp -m tcp --dport 8081 -j DNAT"
        ));
        assert!(runner.ran("iptables -t nat -S FWGATE_PREROUTING"));
        assert!(dir.path().join("forward_pre.rules").exists());
    }

    #[tokio::test]
    async fn test_remove_missing_forward_is_not_found() {
        let runner = Arc::new(MockRunner::new());
        let dir = tempfile::tempdir().unwrap();
        let fw = backend(&runner, &dir);

        let err = fw
            .apply_forward(&forward("8081", "10.0.0.5", "80"), Operation::Remove)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_forward_by_number() {
        let runner = Arc::new(MockRunner::new());
        let dir = tempfile::tempdir().unwrap();
        runner.respond(
            "iptables -t nat -nvL FWGATE_PREROUTING --line-numbers",
            Ok("Chain FWGATE_PREROUTING (1 references)\n num   pkts bytes target     prot opt in     out     source               destination\n1        0     0 DNAT       tcp  --  *      *       0.0.0.0/0            0.0.0.0/0            tcp dpt:9000 to:10.0.0.9:90\n2        0     0 DNAT       tcp  --  *      *       0.0.0.0/0            0.0.0.0/0            tcp dpt:8081 to:10.0.0.5:80\n".into()),
        );
        let fw = backend(&runner, &dir);

        fw.apply_forward(&forward("8081", "10.0.0.5", "80"), Operation::Remove)
            .await
            .unwrap();

        assert!(runner.ran("iptables -t nat -D FWGATE_PREROUTING 2"));
        assert!(runner.ran(
            "iptables -t nat -D FWGATE_POSTROUTING -d 10.0.0.5 -p tcp -m tcp --dport 80 -j MASQUERADE"
        ));
        assert!(runner.ran(
            "iptables -t filter -D FWGATE_FORWARD -s 10.0.0.5 -p tcp -m tcp --sport 80 -j ACCEPT"
        ));
    }

    #[tokio::test]
    async fn test_enable_forwarding_sets_sysctl_once() {
        let runner = Arc::new(MockRunner::new());
        let dir = tempfile::tempdir().unwrap();
        runner.respond("cat /proc/sys/net/ipv4/ip_forward", Ok("0\n".into()));
        let fw = backend(&runner, &dir);
        fw.enable_forwarding().await.unwrap();
        assert!(runner.ran("sysctl -w net.ipv4.ip_forward=1"));

        let runner = Arc::new(MockRunner::new());
        runner.respond("cat /proc/sys/net/ipv4/ip_forward", Ok("1\n".into()));
        let fw = backend(&runner, &dir);
        fw.enable_forwarding().await.unwrap();
        assert!(!runner.ran("sysctl"));
    }

    #[tokio::test]
    async fn test_missing_chain_lists_empty() {
        let runner = Arc::new(MockRunner::new());
        let dir = tempfile::tempdir().unwrap();
        runner.fail("iptables -t filter -nL", "iptables: No chain/target/match by that name.");
        runner.fail("iptables -t nat -nvL", "iptables: No chain/target/match by that name.");
        runner.fail("iptables -t filter -nL FWGATE_BASIC_AFTER", "iptables: Permission denied");
        let fw = backend(&runner, &dir);

        assert!(fw.list_port().await.unwrap().is_empty());
        assert!(fw.list_forward().await.unwrap().is_empty());
        assert!(fw.list_rules(ChainKind::BasicAfter).await.is_err());
    }

    #[tokio::test]
    async fn test_status_checks_basic_jump() {
        let runner = Arc::new(MockRunner::new());
        let dir = tempfile::tempdir().unwrap();
        runner.respond(
            "iptables -t filter -S INPUT",
            Ok(
                "-P INPUT ACCEPT\n-A INPUT -j FWGATE_BASIC_BEFORE\n-A INPUT -j FWGATE_BASIC\n"
                    .into(),
            ),
        );
        let fw = backend(&runner, &dir);
        assert!(fw.status().await.unwrap());
    }

    #[tokio::test]
    async fn test_list_port_merges_chains() {
        let runner = Arc::new(MockRunner::new());
        let dir = tempfile::tempdir().unwrap();
        runner.respond(
            "iptables -t filter -nL FWGATE_BASIC",
            Ok("Chain FWGATE_BASIC (1 references)\ntarget     prot opt source               destination\nACCEPT     tcp  --  0.0.0.0/0            0.0.0.0/0            tcp dpt:8080\nDROP       all  --  10.0.0.5             0.0.0.0/0\n".into()),
        );
        runner.respond(
            "iptables -t filter -nL FWGATE_OUTPUT",
            Ok("target     prot opt source               destination\nREJECT     udp  --  0.0.0.0/0            9.9.9.9            udp dpt:53\n".into()),
        );
        let fw = backend(&runner, &dir);

        let ports = fw.list_port().await.unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].port, "8080");
        assert_eq!(ports[1].chain, ChainKind::Output);
        assert_eq!(ports[1].address, "9.9.9.9");

        let addresses = fw.list_address().await.unwrap();
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].address, "10.0.0.5");
    }

    #[tokio::test]
    async fn test_bootstrap_binds_in_order() {
        let runner = Arc::new(MockRunner::new());
        let dir = tempfile::tempdir().unwrap();
        runner.fail("iptables -t filter -C", "iptables: Bad rule");
        let fw = backend(&runner, &dir);

        fw.bootstrap().await.unwrap();

        assert!(runner.ran("iptables -t filter -I INPUT 1 -j FWGATE_BASIC_BEFORE"));
        assert!(runner.ran("iptables -t filter -I OUTPUT 1 -j FWGATE_OUTPUT"));
        assert!(runner.ran("iptables -t nat -A PREROUTING -j FWGATE_PREROUTING"));
        assert!(runner.ran("iptables -t filter -A FWGATE_BASIC_BEFORE -i lo -j ACCEPT"));
        assert!(runner.ran(
            "iptables -t filter -A FWGATE_BASIC_BEFORE -p tcp -m tcp --dport 22 -j ACCEPT"
        ));
        assert!(!runner.ran("iptables -t filter -A FWGATE_BASIC_AFTER"));
    }
}
