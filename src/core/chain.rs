//! Custom chain catalogue and iptables chain/rule primitives
//!
//! Every chain fwgate owns is a [`ChainKind`]. Each kind knows its real chain
//! name, its table, the system chain it is spliced into, how the jump is
//! installed, and the file its rules are persisted to.
//!
//! [`IptablesCmd`] wraps a [`CommandRunner`] with the small set of chain
//! operations everything else is built from. All existence checks scrape
//! `-S` / `--line-numbers` output through [`crate::core::parsers`].

use crate::core::error::Result;
use crate::core::parsers;
use crate::runner::CommandRunner;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Prefix of every custom chain
pub const CHAIN_PREFIX: &str = "FWGATE_";

pub const INPUT: &str = "INPUT";
pub const OUTPUT: &str = "OUTPUT";
pub const FORWARD: &str = "FORWARD";
pub const PREROUTING: &str = "PREROUTING";
pub const POSTROUTING: &str = "POSTROUTING";

/// iptables table
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum Table {
    #[strum(serialize = "filter")]
    Filter,
    #[strum(serialize = "nat")]
    Nat,
}

/// How a custom chain is spliced into its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bind {
    /// `-I PARENT n -j CHAIN`
    Insert(u32),
    /// Inserted right after the jumps of the chains listed before it in
    /// [`ChainKind::ALL`] that share its parent
    AfterSiblings,
    /// `-A PARENT -j CHAIN`
    Append,
}

/// Traffic direction a chain filters, for the lockout check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
    Other,
}

/// Logical custom chain
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
pub enum ChainKind {
    /// Pre-rules (loopback, established, management ports) ahead of user rules
    #[strum(serialize = "basic-before")]
    BasicBefore,
    /// Simple port/address allow and deny rules
    #[default]
    #[strum(serialize = "basic")]
    Basic,
    /// Optional default-deny tail
    #[strum(serialize = "basic-after")]
    BasicAfter,
    #[strum(serialize = "input")]
    Input,
    #[strum(serialize = "output")]
    Output,
    /// filter FORWARD accepts for forwarded traffic
    #[strum(serialize = "forward")]
    Forward,
    /// nat PREROUTING DNAT / REDIRECT
    #[strum(serialize = "forward-pre")]
    ForwardPre,
    /// nat POSTROUTING MASQUERADE
    #[strum(serialize = "forward-post")]
    ForwardPost,
}

impl ChainKind {
    /// Every chain, in bootstrap order
    pub const ALL: [ChainKind; 8] = [
        ChainKind::BasicBefore,
        ChainKind::Basic,
        ChainKind::BasicAfter,
        ChainKind::Input,
        ChainKind::Output,
        ChainKind::Forward,
        ChainKind::ForwardPre,
        ChainKind::ForwardPost,
    ];

    pub const fn chain_name(self) -> &'static str {
        match self {
            ChainKind::BasicBefore => "FWGATE_BASIC_BEFORE",
            ChainKind::Basic => "FWGATE_BASIC",
            ChainKind::BasicAfter => "FWGATE_BASIC_AFTER",
            ChainKind::Input => "FWGATE_INPUT",
            ChainKind::Output => "FWGATE_OUTPUT",
            ChainKind::Forward => "FWGATE_FORWARD",
            ChainKind::ForwardPre => "FWGATE_PREROUTING",
            ChainKind::ForwardPost => "FWGATE_POSTROUTING",
        }
    }

    pub const fn table(self) -> Table {
        match self {
            ChainKind::ForwardPre | ChainKind::ForwardPost => Table::Nat,
            _ => Table::Filter,
        }
    }

    pub const fn parent(self) -> &'static str {
        match self {
            ChainKind::BasicBefore
            | ChainKind::Basic
            | ChainKind::BasicAfter
            | ChainKind::Input => {
                INPUT
            }
            ChainKind::Output => OUTPUT,
            ChainKind::Forward => FORWARD,
            ChainKind::ForwardPre => PREROUTING,
            ChainKind::ForwardPost => POSTROUTING,
        }
    }

    pub const fn bind(self) -> Bind {
        match self {
            ChainKind::BasicBefore | ChainKind::Output => Bind::Insert(1),
            ChainKind::Basic | ChainKind::BasicAfter | ChainKind::Input => Bind::AfterSiblings,
            ChainKind::Forward | ChainKind::ForwardPre | ChainKind::ForwardPost => Bind::Append,
        }
    }

    pub const fn file_name(self) -> &'static str {
        match self {
            ChainKind::BasicBefore => "basic_before.rules",
            ChainKind::Basic => "basic.rules",
            ChainKind::BasicAfter => "basic_after.rules",
            ChainKind::Input => "input.rules",
            ChainKind::Output => "output.rules",
            ChainKind::Forward => "forward.rules",
            ChainKind::ForwardPre => "forward_pre.rules",
            ChainKind::ForwardPost => "forward_post.rules",
        }
    }

    pub const fn direction(self) -> Direction {
        match self {
            ChainKind::BasicBefore | ChainKind::Basic | ChainKind::Input => Direction::Ingress,
            ChainKind::Output => Direction::Egress,
            _ => Direction::Other,
        }
    }

    /// Chains that may hold caller [`crate::core::rule::RuleSpec`]s
    pub const fn accepts_filter_rules(self) -> bool {
        matches!(
            self,
            ChainKind::BasicBefore
                | ChainKind::Basic
                | ChainKind::BasicAfter
                | ChainKind::Input
                | ChainKind::Output
        )
    }
}

/// Runs `iptables -t <table> ...` through a [`CommandRunner`]
pub struct IptablesCmd<R> {
    runner: Arc<R>,
    timeout: Duration,
}

impl<R> Clone for IptablesCmd<R> {
    fn clone(&self) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
            timeout: self.timeout,
        }
    }
}

impl<R: CommandRunner> IptablesCmd<R> {
    pub fn new(runner: Arc<R>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs one iptables invocation and returns its stdout.
    pub async fn run(&self, table: Table, args: &str) -> Result<String> {
        let line = format!("iptables -t {table} {args}");
        debug!("iptables: {line}");
        self.runner.run(&line, self.timeout).await
    }

    /// `-S [chain]` dump
    pub async fn dump(&self, table: Table, chain: Option<&str>) -> Result<String> {
        match chain {
            Some(c) => self.run(table, &format!("-S {c}")).await,
            None => self.run(table, "-S").await,
        }
    }

    pub async fn chain_exists(&self, table: Table, chain: &str) -> Result<bool> {
        let dump = self.dump(table, None).await?;
        Ok(parsers::chain_declared(&dump, chain))
    }

    /// Creates the chain unless it already exists.
    pub async fn ensure_chain(&self, table: Table, chain: &str) -> Result<()> {
        if !self.chain_exists(table, chain).await? {
            self.run(table, &format!("-N {chain}")).await?;
            info!("Created chain {chain} in table {table}");
        }
        Ok(())
    }

    pub async fn flush_chain(&self, table: Table, chain: &str) -> Result<()> {
        self.run(table, &format!("-F {chain}")).await.map(|_| ())
    }

    /// Dry-run match (`-C`); any failure counts as "not present".
    pub async fn rule_exists(&self, table: Table, chain: &str, rule: &str) -> bool {
        self.run(table, &format!("-C {chain} {rule}")).await.is_ok()
    }

    /// Appends `rule` unless an identical rule is already in the chain.
    ///
    /// Returns `true` when a rule was appended. The check and the append are
    /// two separate commands, so concurrent callers can still both append.
    pub async fn add_rule(&self, table: Table, chain: &str, rule: &str) -> Result<bool> {
        if self.rule_exists(table, chain, rule).await {
            debug!("Rule already present in {chain}: {rule}");
            return Ok(false);
        }
        self.run(table, &format!("-A {chain} {rule}")).await?;
        Ok(true)
    }

    pub async fn delete_rule(&self, table: Table, chain: &str, rule: &str) -> Result<()> {
        self.run(table, &format!("-D {chain} {rule}")).await.map(|_| ())
    }

    pub async fn delete_rule_at(&self, table: Table, chain: &str, number: u32) -> Result<()> {
        self.run(table, &format!("-D {chain} {number}")).await.map(|_| ())
    }

    /// Position of the jump to `chain` inside `parent`, if bound.
    pub async fn jump_position(
        &self,
        table: Table,
        parent: &str,
        chain: &str,
    ) -> Result<Option<u32>> {
        let listing = self
            .run(table, &format!("-L {parent} --line-numbers -n"))
            .await?;
        Ok(parsers::jump_position(&listing, chain))
    }

    pub async fn is_bound(&self, table: Table, parent: &str, chain: &str) -> Result<bool> {
        let dump = self.dump(table, Some(parent)).await?;
        Ok(parsers::jump_exists(&dump, parent, chain))
    }

    /// Inserts a jump at `position` unless one already exists.
    pub async fn bind_insert(
        &self,
        table: Table,
        parent: &str,
        chain: &str,
        position: u32,
    ) -> Result<()> {
        if self.jump_position(table, parent, chain).await?.is_none() {
            self.run(table, &format!("-I {parent} {position} -j {chain}"))
                .await?;
            info!("Bound {chain} into {parent} at position {position}");
        }
        Ok(())
    }

    /// Appends a jump unless one already exists.
    pub async fn bind_append(&self, table: Table, parent: &str, chain: &str) -> Result<()> {
        if !self.is_bound(table, parent, chain).await? {
            self.run(table, &format!("-A {parent} -j {chain}")).await?;
            info!("Bound {chain} at the end of {parent}");
        }
        Ok(())
    }

    /// Removes the jump into `chain`; the chain and its rules stay.
    pub async fn unbind(&self, table: Table, parent: &str, chain: &str) -> Result<()> {
        if let Some(number) = self.jump_position(table, parent, chain).await? {
            self.delete_rule_at(table, parent, number).await?;
            info!("Unbound {chain} from {parent}");
        }
        Ok(())
    }
}
