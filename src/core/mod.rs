//! Core firewall management functionality
//!
//! - [`rule`]: rule and forward specifications, port ranges, protocols
//! - [`chain`]: the managed chain catalog and low-level iptables verbs
//! - [`parsers`]: scrapers for iptables and firewall-cmd listings
//! - [`safety`]: lockout detection for DROP rules
//! - [`persistence`]: per-chain rule files
//! - [`iptables`] and [`firewalld`]: the two backends
//! - [`client`]: backend detection and the common capability surface
//! - [`error`]: error types

pub mod chain;
pub mod client;
pub mod error;
pub mod firewalld;
pub mod iptables;
pub mod parsers;
pub mod persistence;
pub mod rule;
pub mod safety;

#[cfg(test)]
pub mod test_helpers;
