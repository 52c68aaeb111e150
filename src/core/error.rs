use std::path::PathBuf;
use thiserror::Error;

/// Core error types for fwgate
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Neither firewall-cmd nor iptables could be found
    #[error("No supported firewall found (install firewalld or iptables)")]
    NoBackend,

    /// Both backends are installed; the operator has to remove one
    #[error(
        "Both firewalld and iptables are installed. To avoid conflicting rules, uninstall one of them and try again"
    )]
    ConflictingBackends,

    /// Input validation failed before any command was issued
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Rule would cut off all traffic, management access included
    #[error("Unsafe rule rejected: {0}")]
    UnsafeRule(String),

    /// Firewall tool exited non-zero; `output` is its stdout+stderr verbatim
    #[error("command `{command}` failed: {output}")]
    Command {
        command: String,
        output: String,
        exit_code: Option<i32>,
    },

    /// Command did not finish in time; its effect on the system is unknown
    #[error("command `{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    /// Rule or forward to remove does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Chain rule file could not be written or read
    #[error("Persistence error for {}: {message}", path.display())]
    Persistence { path: PathBuf, message: String },

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// True for errors raised before any command ran.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::UnsafeRule(_))
    }

    /// Raw tool output, when the error came from a failed command.
    pub fn tool_output(&self) -> Option<&str> {
        match self {
            Self::Command { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Known iptables / firewall-cmd diagnostics and their translations
pub struct ToolErrorPattern;

impl ToolErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("you must be root")
            || lower.contains("a password is required")
        {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run fwgate as root or configure passwordless sudo")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        if lower.contains("command not found") || lower.contains("no such file") {
            return ErrorTranslation::new("Firewall tool is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or firewalld: sudo dnf install firewalld  (Fedora/RHEL)");
        }

        if lower.contains("not running") {
            return ErrorTranslation::new("firewalld is not running")
                .with_suggestion("Start it: sudo systemctl start firewalld")
                .with_suggestion("Or run: fwgate start");
        }

        if lower.contains("already_enabled") {
            return ErrorTranslation::new("The rule is already present")
                .with_suggestion("Nothing to do; list rules to confirm");
        }

        if lower.contains("not_enabled") || lower.contains("does a matching rule exist") {
            return ErrorTranslation::new("The rule to remove does not exist")
                .with_suggestion("List current rules and remove using the exact same fields");
        }

        if lower.contains("no chain/target/match by that name") {
            return ErrorTranslation::new("Firewall chain not found")
                .with_suggestion("Run `fwgate restore` to recreate the managed chains")
                .with_suggestion("Check that the iptables kernel modules are loaded");
        }

        if lower.contains("invalid_port") || lower.contains("invalid port") {
            return ErrorTranslation::new("Invalid port or port range")
                .with_suggestion("Port numbers must be between 1 and 65535")
                .with_suggestion("For port ranges, ensure start <= end (e.g. 8000-9000)");
        }

        if lower.contains("invalid_addr")
            || lower.contains("host/network")
            || (lower.contains("invalid") && lower.contains("address"))
        {
            return ErrorTranslation::new("Invalid IP address or network")
                .with_suggestion("Use 192.168.1.1 or 192.168.1.0/24")
                .with_suggestion("For IPv6: 2001:db8::1 or 2001:db8::/32");
        }

        if lower.contains("bad rule")
            || lower.contains("invalid_rule")
            || lower.contains("bad argument")
        {
            return ErrorTranslation::new("Invalid firewall rule syntax")
                .with_suggestion("Ports require a tcp or udp protocol")
                .with_suggestion("Check the address and port fields for typos");
        }

        if lower.contains("resource temporarily unavailable") || lower.contains("xtables lock") {
            return ErrorTranslation::new("Firewall tables are locked by another process")
                .with_suggestion("Wait a moment and try again");
        }

        if lower.contains("timed out") || lower.contains("timeout") {
            return ErrorTranslation::new("Operation timed out")
                .with_suggestion("The change may or may not have been applied")
                .with_suggestion("List rules to check the current state before retrying");
        }

        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
