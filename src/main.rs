//! fwgate - unified firewall management
//!
//! Command-line front end over the iptables and firewalld backends. The
//! backend is detected on every invocation.
//!
//! # Usage
//!
//! ```bash
//! fwgate status                                  # Backend and whether it is active
//! fwgate restore                                 # Replay saved chains (iptables, at boot)
//! fwgate ports                                   # List port rules
//! fwgate port add 8080 --protocol tcp            # Open a port
//! fwgate port remove 3000-3100 --protocol udp    # Close a range
//! fwgate address add 203.0.113.7 --strategy drop # Block a host
//! fwgate forward add 8081 10.0.0.5 80            # DNAT 8081 to a container
//! fwgate forwards --json                         # Machine-readable listing
//! ```

use clap::{Args, Parser, Subcommand};
use fwgate::config::{self, Config};
use fwgate::core::chain::ChainKind;
use fwgate::core::error::ToolErrorPattern;
use fwgate::utils;
use fwgate::{
    Family, Firewall, FirewallClient, ForwardSpec, Operation, Protocol, RuleSpec, ShellRunner,
    Strategy,
};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "fwgate")]
#[command(about = "Unified firewall management over iptables and firewalld", long_about = None)]
struct Cli {
    /// Config file (default: $FWGATE_CONFIG or the XDG config path)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Write logs to this file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,
    /// Print listings as JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the detected backend and whether it is active
    Status,
    /// Show fwgate build info and the backend tool version
    Version,
    /// Start the firewall (bind chains / start firewalld)
    Start,
    /// Stop the firewall (unbind chains / stop firewalld)
    Stop,
    Restart,
    /// Reload persisted configuration
    Reload,
    /// Restore saved chains and bootstrap them (iptables)
    Restore,
    /// List port rules
    Ports,
    /// List address rules
    Addresses,
    /// List port forwards
    Forwards,
    /// Add or remove a port rule
    Port {
        #[command(subcommand)]
        action: PortAction,
    },
    /// Add or remove an address rule
    Address {
        #[command(subcommand)]
        action: AddressAction,
    },
    /// Add or remove a port forward
    Forward {
        #[command(subcommand)]
        action: ForwardAction,
    },
    /// Turn on forwarding (masquerade / ip_forward)
    EnableForwarding,
}

#[derive(Subcommand)]
enum PortAction {
    Add(PortArgs),
    Remove(PortArgs),
}

#[derive(Subcommand)]
enum AddressAction {
    Add(AddressArgs),
    Remove(AddressArgs),
}

#[derive(Subcommand)]
enum ForwardAction {
    Add(ForwardArgs),
    Remove(ForwardArgs),
}

#[derive(Args)]
struct PortArgs {
    /// Port or range (`8000-9000`)
    port: String,
    #[arg(short, long, default_value = "tcp")]
    protocol: Protocol,
    #[arg(short, long, default_value = "accept")]
    strategy: Strategy,
    /// Restrict to a source address or CIDR
    #[arg(short, long, default_value = "")]
    address: String,
    #[arg(long, default_value = "basic")]
    chain: ChainKind,
}

#[derive(Args)]
struct AddressArgs {
    /// Address or CIDR
    address: String,
    #[arg(short, long, default_value = "drop")]
    strategy: Strategy,
    #[arg(long, default_value = "basic")]
    chain: ChainKind,
}

#[derive(Args)]
struct ForwardArgs {
    external_port: String,
    /// Target host; empty or 127.0.0.1 redirects locally
    target_address: String,
    target_port: String,
    #[arg(short, long, default_value = "tcp")]
    protocol: Protocol,
    /// Only forward traffic arriving on this interface (iptables)
    #[arg(short, long)]
    interface: Option<String>,
}

impl PortArgs {
    fn into_rule(self) -> RuleSpec {
        RuleSpec {
            chain: self.chain,
            family: Family::of_address(&self.address),
            address: self.address,
            port: self.port,
            protocol: Some(self.protocol),
            strategy: self.strategy,
            ..Default::default()
        }
    }
}

impl AddressArgs {
    fn into_rule(self) -> RuleSpec {
        RuleSpec {
            chain: self.chain,
            family: Family::of_address(&self.address),
            address: self.address,
            strategy: self.strategy,
            ..Default::default()
        }
    }
}

impl ForwardArgs {
    fn into_forward(self) -> ForwardSpec {
        ForwardSpec {
            protocol: self.protocol,
            external_port: self.external_port,
            target_address: self.target_address,
            target_port: self.target_port,
            inbound_interface: self.interface,
            sequence_number: None,
        }
    }
}

fn init_logging(log_file: Option<&PathBuf>) {
    if let Some(path) = log_file
        && let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(path)
    {
        tracing_subscriber::fmt().with_writer(file).init();
    } else {
        tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_ref());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            let translation = ToolErrorPattern::match_error(&e.to_string());
            if !translation.suggestions.is_empty() {
                eprintln!("{}", translation.user_message);
                for suggestion in &translation.suggestions {
                    eprintln!("  - {suggestion}");
                }
            }
            ExitCode::FAILURE
        }
    }
}

async fn handle_cli(cli: Cli) -> fwgate::Result<()> {
    let config_path = cli.config.unwrap_or_else(utils::default_config_path);
    let config = config::load_config(&config_path).await;

    if matches!(cli.command, Commands::Version) {
        println!(
            "fwgate {} ({} {}, built {})",
            build::PKG_VERSION,
            build::SHORT_COMMIT,
            if build::GIT_CLEAN { "clean" } else { "dirty" },
            build::BUILD_TIME
        );
    }

    let firewall = connect(&config)?;
    let json = cli.json;

    match cli.command {
        Commands::Status => {
            let active = firewall.status().await?;
            println!(
                "{}: {}",
                firewall.name(),
                if active { "active" } else { "inactive" }
            );
        }
        Commands::Version => println!("{}: {}", firewall.name(), firewall.version().await?),
        Commands::Start => firewall.start().await?,
        Commands::Stop => firewall.stop().await?,
        Commands::Restart => firewall.restart().await?,
        Commands::Reload => firewall.reload().await?,
        Commands::Restore => {
            let restored = firewall.restore().await?;
            println!("Restored {restored} rules");
        }
        Commands::Ports => print_rules(&firewall.list_port().await?, json)?,
        Commands::Addresses => print_rules(&firewall.list_address().await?, json)?,
        Commands::Forwards => print_forwards(&firewall.list_forward().await?, json)?,
        Commands::Port { action } => {
            let (args, op) = match action {
                PortAction::Add(args) => (args, Operation::Add),
                PortAction::Remove(args) => (args, Operation::Remove),
            };
            firewall.apply_port_rule(&args.into_rule(), op).await?;
        }
        Commands::Address { action } => {
            let (args, op) = match action {
                AddressAction::Add(args) => (args, Operation::Add),
                AddressAction::Remove(args) => (args, Operation::Remove),
            };
            firewall.apply_address_rule(&args.into_rule(), op).await?;
        }
        Commands::Forward { action } => {
            let (args, op) = match action {
                ForwardAction::Add(args) => (args, Operation::Add),
                ForwardAction::Remove(args) => (args, Operation::Remove),
            };
            firewall.apply_forward(&args.into_forward(), op).await?;
        }
        Commands::EnableForwarding => firewall.enable_forwarding().await?,
    }
    Ok(())
}

fn connect(config: &Config) -> fwgate::Result<Firewall<ShellRunner>> {
    Firewall::detect(Arc::new(ShellRunner::new()), config)
}

fn print_json<T: Serialize>(value: &T) -> fwgate::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_rules(rules: &[RuleSpec], json: bool) -> fwgate::Result<()> {
    if json {
        return print_json(&rules);
    }
    if rules.is_empty() {
        println!("No rules");
        return Ok(());
    }
    println!("{:<4} {:<13} {:<20} {:<12} {:<8} STRATEGY", "#", "CHAIN", "ADDRESS", "PORT", "PROTO");
    for (i, rule) in rules.iter().enumerate() {
        let number = rule.sequence_number.map_or(i + 1, |n| n as usize);
        let address = if rule.has_address() { rule.address.as_str() } else { "anywhere" };
        let protocol = rule.protocol.map_or_else(|| "all".to_string(), |p| p.to_string());
        println!(
            "{:<4} {:<13} {:<20} {:<12} {:<8} {}",
            number, rule.chain, address, rule.port, protocol, rule.strategy
        );
    }
    Ok(())
}

fn print_forwards(forwards: &[ForwardSpec], json: bool) -> fwgate::Result<()> {
    if json {
        return print_json(&forwards);
    }
    if forwards.is_empty() {
        println!("No forwards");
        return Ok(());
    }
    println!("{:<6} {:<10} {:<22} IFACE", "PROTO", "PORT", "TARGET");
    for forward in forwards {
        println!(
            "{:<6} {:<10} {:<22} {}",
            forward.protocol,
            forward.external_port,
            format!("{}:{}", forward.resolved_target(), forward.target_port),
            forward.inbound_interface.as_deref().unwrap_or("*")
        );
    }
    Ok(())
}
