//! Backend selection and the common capability surface
//!
//! [`FirewallClient`] is what callers program against. [`Firewall`] probes
//! which control binary is installed, refuses to pick when both are, and
//! forwards every call to the chosen backend while recording mutations in
//! the audit log.
//!
//! Detection is not cached: build a [`Firewall`] per operation so an operator
//! installing or removing a backend is seen on the next call.

use crate::audit::{AuditLog, EventType};
use crate::config::Config;
use crate::core::error::{Error, Result};
use crate::core::firewalld::FirewalldBackend;
use crate::core::iptables::IptablesBackend;
use crate::core::persistence::RuleStore;
use crate::core::rule::{ForwardSpec, Operation, RuleSpec};
use crate::runner::CommandRunner;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

pub const FIREWALLD_BINARY: &str = "firewall-cmd";
pub const IPTABLES_BINARY: &str = "iptables";

/// Operations every backend provides
#[allow(async_fn_in_trait)]
pub trait FirewallClient {
    fn name(&self) -> &'static str;

    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn restart(&self) -> Result<()>;
    async fn reload(&self) -> Result<()>;
    /// Whether the firewall is active
    async fn status(&self) -> Result<bool>;
    async fn version(&self) -> Result<String>;

    async fn list_port(&self) -> Result<Vec<RuleSpec>>;
    async fn list_forward(&self) -> Result<Vec<ForwardSpec>>;
    async fn list_address(&self) -> Result<Vec<RuleSpec>>;

    async fn apply_port_rule(&self, rule: &RuleSpec, op: Operation) -> Result<()>;
    async fn apply_address_rule(&self, rule: &RuleSpec, op: Operation) -> Result<()>;
    async fn apply_forward(&self, forward: &ForwardSpec, op: Operation) -> Result<()>;
    /// Makes forwarded traffic work: masquerade on firewalld, `ip_forward` on iptables
    async fn enable_forwarding(&self) -> Result<()>;
}

/// The installed backend
pub enum Backend<R> {
    Firewalld(FirewalldBackend<R>),
    Iptables(IptablesBackend<R>),
}

macro_rules! dispatch {
    ($self:ident, $backend:ident => $call:expr) => {
        match &$self.backend {
            Backend::Firewalld($backend) => $call,
            Backend::Iptables($backend) => $call,
        }
    };
}

/// Facade over whichever backend is installed
pub struct Firewall<R> {
    backend: Backend<R>,
    audit: Option<AuditLog>,
}

impl<R: CommandRunner> Firewall<R> {
    /// Probes for `firewall-cmd` and `iptables` and builds the matching backend.
    ///
    /// # Errors
    ///
    /// - [`Error::ConflictingBackends`] when both are installed
    /// - [`Error::NoBackend`] when neither is
    pub fn detect(runner: Arc<R>, config: &Config) -> Result<Self> {
        let has_firewalld = runner.binary_exists(FIREWALLD_BINARY);
        let has_iptables = runner.binary_exists(IPTABLES_BINARY);
        let timeout = config.command_timeout();

        let backend = match (has_firewalld, has_iptables) {
            (true, true) => return Err(Error::ConflictingBackends),
            (false, false) => return Err(Error::NoBackend),
            (true, false) => {
                Backend::Firewalld(FirewalldBackend::new(runner, timeout, &config.zone))
            }
            (false, true) => Backend::Iptables(IptablesBackend::new(
                runner,
                timeout,
                RuleStore::new(&config.state_dir),
                config.iptables_options(),
            )),
        };

        let firewall = Self {
            backend,
            audit: config.audit_log.as_ref().map(AuditLog::new),
        };
        info!("Using {} backend", firewall.name());
        Ok(firewall)
    }

    pub fn backend(&self) -> &Backend<R> {
        &self.backend
    }

    /// Replays persisted chains and bootstraps them; firewalld needs nothing.
    ///
    /// Returns the number of rules restored.
    ///
    /// # Errors
    ///
    /// Returns `Err` if chain bootstrap fails.
    pub async fn restore(&self) -> Result<usize> {
        let result = match &self.backend {
            Backend::Iptables(backend) => backend.bootstrap().await,
            Backend::Firewalld(_) => Ok(0),
        };
        let details = match &result {
            Ok(restored) => json!({ "restored": restored }),
            Err(_) => json!({}),
        };
        self.audited(EventType::RestoreChains, details, result).await
    }

    async fn audited<T>(
        &self,
        event: EventType,
        details: serde_json::Value,
        result: Result<T>,
    ) -> Result<T> {
        if let Err(e) = &result {
            error!("{event:?} failed: {e}");
        }
        if let Some(audit) = &self.audit {
            let error = result.as_ref().err().map(ToString::to_string);
            audit.record(event, self.name(), details, error).await;
        }
        result
    }

    async fn service(&self, action: &str, result: Result<()>) -> Result<()> {
        self.audited(EventType::ServiceControl, json!({ "action": action }), result)
            .await
    }
}

impl<R: CommandRunner> FirewallClient for Firewall<R> {
    fn name(&self) -> &'static str {
        dispatch!(self, b => b.name())
    }

    async fn start(&self) -> Result<()> {
        let result = dispatch!(self, b => b.start().await);
        self.service("start", result).await
    }

    async fn stop(&self) -> Result<()> {
        let result = dispatch!(self, b => b.stop().await);
        self.service("stop", result).await
    }

    async fn restart(&self) -> Result<()> {
        let result = dispatch!(self, b => b.restart().await);
        self.service("restart", result).await
    }

    async fn reload(&self) -> Result<()> {
        let result = dispatch!(self, b => b.reload().await);
        self.service("reload", result).await
    }

    async fn status(&self) -> Result<bool> {
        dispatch!(self, b => b.status().await)
    }

    async fn version(&self) -> Result<String> {
        dispatch!(self, b => b.version().await)
    }

    async fn list_port(&self) -> Result<Vec<RuleSpec>> {
        dispatch!(self, b => b.list_port().await)
    }

    async fn list_forward(&self) -> Result<Vec<ForwardSpec>> {
        dispatch!(self, b => b.list_forward().await)
    }

    async fn list_address(&self) -> Result<Vec<RuleSpec>> {
        dispatch!(self, b => b.list_address().await)
    }

    async fn apply_port_rule(&self, rule: &RuleSpec, op: Operation) -> Result<()> {
        let result = dispatch!(self, b => b.apply_port_rule(rule, op).await);
        self.audited(EventType::ApplyPortRule, json!({ "operation": op, "rule": rule }), result)
            .await
    }

    async fn apply_address_rule(&self, rule: &RuleSpec, op: Operation) -> Result<()> {
        if let Some(note) = crate::validators::check_reserved_ip(&rule.address) {
            info!("{}: {note}", rule.address);
        }
        let result = dispatch!(self, b => b.apply_address_rule(rule, op).await);
        self.audited(EventType::ApplyAddressRule, json!({ "operation": op, "rule": rule }), result)
            .await
    }

    async fn apply_forward(&self, forward: &ForwardSpec, op: Operation) -> Result<()> {
        let result = dispatch!(self, b => b.apply_forward(forward, op).await);
        let details = json!({ "operation": op, "forward": forward });
        self.audited(EventType::ApplyForward, details, result).await
    }

    async fn enable_forwarding(&self) -> Result<()> {
        let result = dispatch!(self, b => b.enable_forwarding().await);
        self.audited(EventType::EnableForwarding, json!({}), result)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::EventType;
    use crate::core::rule::{Protocol, Strategy};
    use crate::core::test_helpers::{MockRunner, port_rule};

    fn config(dir: &tempfile::TempDir) -> Config {
        Config {
            state_dir: dir.path().join("firewall"),
            audit_log: Some(dir.path().join("audit.log")),
            ..Config::default()
        }
    }

    #[test]
    fn test_detect_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        runner.install(FIREWALLD_BINARY);
        runner.install(IPTABLES_BINARY);

        let result = Firewall::detect(runner, &config(&dir));
        assert!(matches!(result, Err(Error::ConflictingBackends)));
    }

    #[test]
    fn test_detect_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = Firewall::detect(Arc::new(MockRunner::new()), &config(&dir));
        assert!(matches!(result, Err(Error::NoBackend)));
    }

    #[test]
    fn test_detect_single_backend() {
        let dir = tempfile::tempdir().unwrap();

        let runner = Arc::new(MockRunner::new());
        runner.install(IPTABLES_BINARY);
        let fw = Firewall::detect(runner, &config(&dir)).unwrap();
        assert_eq!(fw.name(), "iptables");
        assert!(matches!(fw.backend(), Backend::Iptables(_)));

        let runner = Arc::new(MockRunner::new());
        runner.install(FIREWALLD_BINARY);
        let fw = Firewall::detect(runner, &config(&dir)).unwrap();
        assert_eq!(fw.name(), "firewalld");
    }

    #[test]
    fn test_detection_is_fresh_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        runner.install(IPTABLES_BINARY);
        assert!(Firewall::detect(Arc::clone(&runner), &config(&dir)).is_ok());

        runner.install(FIREWALLD_BINARY);
        assert!(matches!(
            Firewall::detect(runner, &config(&dir)),
            Err(Error::ConflictingBackends)
        ));
    }

    #[tokio::test]
    async fn test_mutations_are_audited() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let runner = Arc::new(MockRunner::new());
        runner.install(FIREWALLD_BINARY);
        let fw = Firewall::detect(runner, &cfg).unwrap();

        fw.apply_port_rule(&port_rule("8080", Protocol::Tcp, Strategy::Accept), Operation::Add)
            .await
            .unwrap();
        let err = fw
            .apply_port_rule(&port_rule("100-50", Protocol::Tcp, Strategy::Accept), Operation::Add)
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let audit = AuditLog::new(cfg.audit_log.unwrap());
        let events = audit.read_recent(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(!events[0].success);
        assert!(events[1].success);
        assert_eq!(events[1].event_type, EventType::ApplyPortRule);
        assert_eq!(events[1].backend, "firewalld");
        assert_eq!(events[1].details["rule"]["port"], "8080");
    }

    #[tokio::test]
    async fn test_restore_is_noop_on_firewalld() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        runner.install(FIREWALLD_BINARY);
        let fw = Firewall::detect(Arc::clone(&runner), &config(&dir)).unwrap();

        assert_eq!(fw.restore().await.unwrap(), 0);
        assert!(runner.commands().is_empty());
    }
}
