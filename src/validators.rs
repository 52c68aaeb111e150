//! Input validation for values interpolated into firewall command lines
//!
//! Every string that ends up in an `iptables` or `firewall-cmd` invocation
//! passes through here first. Command lines run under `bash -c`, so anything
//! that could break out of a single argument is rejected outright rather
//! than escaped.

use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// Characters with meaning to the shell or to rich-rule quoting
const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '$', '`', '<', '>', '\\', '\'', '"', '(', ')', '{', '}', '*', '?', '!', '#',
    '~', '\n', '\r', '\0',
];

/// Rejects strings that could alter the shape of a command line.
///
/// # Errors
///
/// Returns `Err` naming the first offending character.
pub fn check_shell_safe(input: &str) -> Result<(), String> {
    if let Some(c) = input.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(format!("contains forbidden character {c:?}"));
    }
    if input.chars().any(char::is_control) {
        return Err("contains control characters".to_string());
    }
    Ok(())
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a port range.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either port is 0
/// - Start port is greater than end port
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    validate_port(start)?;
    validate_port(end)?;

    if start > end {
        Err("Start port must be less than or equal to end port".to_string())
    } else {
        Ok((start, end))
    }
}

/// Validates an IP address or CIDR network.
///
/// # Errors
///
/// Returns `Err` when the input is neither.
pub fn validate_address(address: &str) -> Result<(), String> {
    let address = address.trim();
    if address.parse::<IpAddr>().is_ok() || address.parse::<IpNetwork>().is_ok() {
        Ok(())
    } else {
        Err(format!("'{address}' is not an IP address or CIDR network"))
    }
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Ok(String::new());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Checks if an IP is in a reserved range and returns informational warning.
///
/// Informational only; used to annotate address rules in logs.
pub fn check_reserved_ip(address: &str) -> Option<String> {
    let ip = address.trim().parse::<IpNetwork>().ok()?.ip();
    match ip {
        IpAddr::V4(v4) if v4.is_loopback() => Some("Loopback address (local only)".to_string()),
        IpAddr::V4(v4) if v4.is_private() => Some("Private network range".to_string()),
        IpAddr::V4(v4) if v4.is_link_local() => Some("Link-local address".to_string()),
        IpAddr::V4(v4) if v4.is_multicast() => Some("Multicast address".to_string()),
        IpAddr::V6(v6) if v6.is_loopback() => Some("IPv6 loopback (local only)".to_string()),
        IpAddr::V6(v6) if v6.is_multicast() => Some("IPv6 multicast address".to_string()),
        _ => None,
    }
}
