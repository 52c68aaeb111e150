//! fwgate - unified firewall management
//!
//! Drives either iptables (through a set of dedicated `FWGATE_*` chains) or
//! firewalld (through `firewall-cmd` in one zone) behind one idempotent
//! interface: open and close ports, allow or block addresses, and publish
//! port forwards.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, parsers, both backends and backend detection
//! - [`runner`] - Shell command execution with timeouts
//! - [`elevation`] - sudo prefixing for unprivileged callers
//! - [`audit`] - JSON-lines trail of every mutating call
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Configuration persistence
//! - [`utils`] - XDG directories and atomic file writes
//!
//! # Safety Features
//!
//! - DROP rules that would lock every host out are refused
//! - Management ports stay reachable ahead of user rules
//! - Input sanitization before anything reaches a shell
//! - Atomic chain rule files with restrictive permissions

#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod runner;
pub mod utils;
pub mod validators;

pub use core::client::{Backend, Firewall, FirewallClient};
pub use core::error::{Error, Result};
pub use core::rule::{Family, ForwardSpec, Operation, PortRange, Protocol, RuleSpec, Strategy};
pub use runner::{CommandRunner, ShellRunner};
