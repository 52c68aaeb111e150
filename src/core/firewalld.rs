//! firewalld backend
//!
//! firewalld persists its own configuration, so this backend only translates:
//! plain accept ports become `--add-port`, everything else a rich rule, and
//! forwards become `--add-forward-port`. Every change is `--permanent` and is
//! followed by a reload to make it live.

use crate::core::client::FirewallClient;
use crate::core::error::{Error, Result};
use crate::core::parsers;
use crate::core::rule::{Family, ForwardSpec, Operation, PortRange, Protocol, RuleSpec, Strategy};
use crate::core::safety;
use crate::runner::CommandRunner;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const SERVICE: &str = "firewalld";

pub struct FirewalldBackend<R> {
    runner: Arc<R>,
    timeout: Duration,
    zone: String,
}

impl<R: CommandRunner> FirewalldBackend<R> {
    pub fn new(runner: Arc<R>, timeout: Duration, zone: impl Into<String>) -> Self {
        Self {
            runner,
            timeout,
            zone: zone.into(),
        }
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    async fn firewall_cmd(&self, args: &str) -> Result<String> {
        self.runner
            .run(&format!("firewall-cmd {args}"), self.timeout)
            .await
    }

    async fn zone_cmd(&self, args: &str) -> Result<String> {
        self.firewall_cmd(&format!("--zone={} {args}", self.zone))
            .await
    }

    async fn systemctl(&self, action: &str) -> Result<()> {
        self.runner
            .run(&format!("systemctl {action} {SERVICE}"), self.timeout)
            .await?;
        info!("systemctl {action} {SERVICE}");
        Ok(())
    }

    /// `rule family=ipv4 source address=X port port=P protocol=tcp accept`
    fn rich_rule(rule: &RuleSpec, family: Family, protocol: Option<Protocol>) -> Result<String> {
        let mut parts = vec![format!("rule family={family}")];
        if rule.has_address() {
            parts.push(format!("source address={}", rule.address.trim()));
        }
        match protocol {
            Some(p) if rule.has_port() => {
                parts.push(format!("port port={} protocol={p}", PortRange::parse(&rule.port)?));
            }
            Some(p) if p != Protocol::All => parts.push(format!("protocol value={p}")),
            _ => {}
        }
        parts.push(rule.strategy.to_string());
        Ok(parts.join(" "))
    }

    /// One rich rule per family and protocol; no address means both families
    fn rich_rules(rule: &RuleSpec) -> Result<Vec<String>> {
        let families = if rule.has_address() {
            vec![Family::of_address(&rule.address)]
        } else {
            vec![Family::Ipv4, Family::Ipv6]
        };
        let protocols: Vec<Option<Protocol>> = match rule.protocol {
            Some(p) => p.expand().into_iter().map(Some).collect(),
            None => vec![None],
        };

        let mut rules = Vec::new();
        for protocol in protocols {
            for family in &families {
                rules.push(Self::rich_rule(rule, *family, protocol)?);
            }
        }
        Ok(rules)
    }

    async fn apply_rich_rules(&self, rule: &RuleSpec, op: Operation) -> Result<()> {
        for rich in Self::rich_rules(rule)? {
            self.zone_cmd(&format!("--{op}-rich-rule '{rich}' --permanent"))
                .await?;
            info!("{op} rich rule: {rich}");
        }
        self.reload().await
    }

    fn check_rule(rule: &RuleSpec, op: Operation) -> Result<()> {
        rule.validate()?;
        if op == Operation::Add {
            safety::check_rule_safety(rule)?;
        }
        Ok(())
    }

    async fn list_rich_rules(&self) -> Result<Vec<RuleSpec>> {
        let output = self.zone_cmd("--list-rich-rules").await?;
        Ok(parsers::parse_rich_rules(&output))
    }

    fn forward_args(forward: &ForwardSpec, protocol: Protocol) -> Result<String> {
        let external = PortRange::parse(&forward.external_port)?;
        let target = PortRange::parse(&forward.target_port)?;
        Ok(if forward.is_loopback_target() {
            format!("port={external}:proto={protocol}:toport={target}")
        } else {
            format!(
                "port={external}:proto={protocol}:toaddr={}:toport={target}",
                forward.resolved_target()
            )
        })
    }
}

impl<R: CommandRunner> FirewallClient for FirewalldBackend<R> {
    fn name(&self) -> &'static str {
        SERVICE
    }

    async fn start(&self) -> Result<()> {
        self.systemctl("start").await
    }

    async fn stop(&self) -> Result<()> {
        self.systemctl("stop").await
    }

    async fn restart(&self) -> Result<()> {
        self.systemctl("restart").await
    }

    async fn reload(&self) -> Result<()> {
        self.firewall_cmd("--reload").await?;
        Ok(())
    }

    async fn status(&self) -> Result<bool> {
        // --state exits non-zero when the daemon is down
        match self.firewall_cmd("--state").await {
            Ok(output) => Ok(output.trim() == "running"),
            Err(Error::Command { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn version(&self) -> Result<String> {
        let output = self.firewall_cmd("--version").await?;
        Ok(output.trim().to_string())
    }

    async fn list_port(&self) -> Result<Vec<RuleSpec>> {
        let (ports, rich) = tokio::join!(self.zone_cmd("--list-ports"), self.list_rich_rules());

        let mut rules = parsers::parse_port_list(&ports?);
        rules.extend(rich?.into_iter().filter(|r| {
            r.has_port() && (r.family == Family::Ipv4 || r.has_address())
        }));
        Ok(rules)
    }

    async fn list_forward(&self) -> Result<Vec<ForwardSpec>> {
        if let Err(e) = self.enable_forwarding().await {
            error!("Failed to enable masquerade before listing forwards: {e}");
        }
        let output = self.zone_cmd("--list-forward-ports").await?;
        Ok(parsers::parse_forward_ports(&output))
    }

    async fn list_address(&self) -> Result<Vec<RuleSpec>> {
        let rules = self.list_rich_rules().await?;
        Ok(rules
            .into_iter()
            .filter(|r| r.has_address() && !r.has_port())
            .collect())
    }

    async fn apply_port_rule(&self, rule: &RuleSpec, op: Operation) -> Result<()> {
        if !rule.has_port() {
            return Err(Error::validation("port", "port rule requires a port"));
        }
        Self::check_rule(rule, op)?;

        if rule.strategy != Strategy::Accept || rule.has_address() {
            return self.apply_rich_rules(rule, op).await;
        }

        let range = PortRange::parse(&rule.port)?;
        let protocols = rule.protocol.map(Protocol::expand).unwrap_or_default();
        for protocol in protocols {
            self.zone_cmd(&format!("--{op}-port={range}/{protocol} --permanent"))
                .await?;
            info!("{op} port {range}/{protocol} in zone {}", self.zone);
        }
        self.reload().await
    }

    async fn apply_address_rule(&self, rule: &RuleSpec, op: Operation) -> Result<()> {
        if rule.has_port() {
            return Err(Error::validation("port", "address rule must not carry a port"));
        }
        Self::check_rule(rule, op)?;
        self.apply_rich_rules(rule, op).await
    }

    async fn apply_forward(&self, forward: &ForwardSpec, op: Operation) -> Result<()> {
        forward.validate()?;
        if forward.inbound_interface.as_deref().is_some_and(|i| !i.is_empty()) {
            return Err(Error::validation(
                "inboundInterface",
                "firewalld forward ports cannot be limited to an interface",
            ));
        }
        let args = forward
            .protocol
            .expand()
            .into_iter()
            .map(|p| Self::forward_args(forward, p))
            .collect::<Result<Vec<_>>>()?;

        if op == Operation::Add {
            self.enable_forwarding().await?;
        }
        for arg in &args {
            self.zone_cmd(&format!("--{op}-forward-port={arg} --permanent"))
                .await?;
            info!("{op} forward port {arg}");
        }
        self.reload().await
    }

    async fn enable_forwarding(&self) -> Result<()> {
        match self.zone_cmd("--query-masquerade").await {
            Ok(_) => Ok(()),
            // --query-* answers "no" with exit code 1
            Err(Error::Command { output, .. }) if output.trim().ends_with("no") => {
                self.zone_cmd("--add-masquerade --permanent").await?;
                info!("Enabled masquerade in zone {}", self.zone);
                self.reload().await
            }
            Err(e) => Err(e),
        }
    }
}
