//! Shared test utilities for core module tests
//!
//! Provides a scripted [`MockRunner`] and rule builders so backend tests
//! never touch the host firewall. This module is only compiled in test mode.

use crate::core::chain::ChainKind;
use crate::core::error::{Error, Result};
use crate::core::rule::{ForwardSpec, Protocol, RuleSpec, Strategy};
use crate::runner::CommandRunner;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Mutex for tests that need exclusive access to environment variables.
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("FWGATE_ELEVATION_METHOD", "none");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("FWGATE_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

type Reply = std::result::Result<String, String>;

/// Scripted command runner.
///
/// Replies are keyed by command-line prefix; the longest matching prefix
/// wins. A prefix may hold a queue of replies, consumed in order, with the
/// last one repeating. Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct MockRunner {
    replies: Mutex<Vec<(String, VecDeque<Reply>)>>,
    commands: Mutex<Vec<String>>,
    binaries: Mutex<HashSet<String>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the reply for commands starting with `prefix`.
    ///
    /// `Err(output)` becomes [`Error::Command`] with exit code 1.
    pub fn respond(&self, prefix: &str, reply: Reply) {
        let mut replies = self.replies.lock().unwrap();
        if let Some((_, queue)) = replies.iter_mut().find(|(p, _)| p == prefix) {
            queue.push_back(reply);
        } else {
            replies.push((prefix.to_string(), VecDeque::from([reply])));
        }
    }

    /// Shorthand for a failing command
    pub fn fail(&self, prefix: &str, output: &str) {
        self.respond(prefix, Err(output.to_string()));
    }

    /// Marks a binary as installed for [`CommandRunner::binary_exists`]
    pub fn install(&self, binary: &str) {
        self.binaries.lock().unwrap().insert(binary.to_string());
    }

    /// Every command line seen, in order
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Whether any command starting with `prefix` ran
    pub fn ran(&self, prefix: &str) -> bool {
        self.count(prefix) > 0
    }

    /// Number of commands starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn reply_for(&self, command: &str) -> Reply {
        let mut replies = self.replies.lock().unwrap();
        let best = replies
            .iter_mut()
            .filter(|(prefix, _)| command.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len());
        match best {
            Some((_, queue)) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some((_, queue)) => queue.front().cloned().unwrap(),
            None => Ok(String::new()),
        }
    }
}

impl CommandRunner for MockRunner {
    async fn run(&self, command: &str, _timeout: Duration) -> Result<String> {
        self.commands.lock().unwrap().push(command.to_string());
        self.reply_for(command).map_err(|output| Error::Command {
            command: command.to_string(),
            output,
            exit_code: Some(1),
        })
    }

    fn binary_exists(&self, name: &str) -> bool {
        self.binaries.lock().unwrap().contains(name)
    }
}

/// Port rule on the basic chain
pub fn port_rule(port: &str, protocol: Protocol, strategy: Strategy) -> RuleSpec {
    RuleSpec {
        chain: ChainKind::Basic,
        port: port.to_string(),
        protocol: Some(protocol),
        strategy,
        ..Default::default()
    }
}

/// Address-only rule on `chain`
pub fn address_rule(chain: ChainKind, address: &str, strategy: Strategy) -> RuleSpec {
    RuleSpec {
        chain,
        address: address.to_string(),
        strategy,
        ..Default::default()
    }
}

/// TCP forward `external -> target:target_port`
pub fn forward(external: &str, target: &str, target_port: &str) -> ForwardSpec {
    ForwardSpec {
        protocol: Protocol::Tcp,
        external_port: external.to_string(),
        target_address: target.to_string(),
        target_port: target_port.to_string(),
        inbound_interface: None,
        sequence_number: None,
    }
}
