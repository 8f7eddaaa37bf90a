//! proxywall - fail-closed iptables policy compiler
//!
//! Every subcommand is one intent, compiled into an ordered list of iptables
//! directives and applied through the privileged channel.
//!
//! # Usage
//!
//! ```bash
//! proxywall boot                          # Default-deny, configure, release locks
//! proxywall deactivate --ipv6             # Remove all chains, reopen IPv6
//! proxywall app 10123 nat on              # Route one app through the proxy
//! proxywall service ssh on                # Accept inbound SSH
//! proxywall service sip on --uid 10050    # Let a SIP client bypass the proxy
//! proxywall captive on --browser-uid 10100
//! proxywall tether rndis0 usb0            # Currently tethered interfaces
//! proxywall lan                           # Re-detect the LAN subnet
//! proxywall plan boot                     # Print directives without applying
//! proxywall status
//! proxywall probe --force
//! ```
//!
//! Logs go to `<state dir>/proxywall.log`, the audit trail to
//! `<state dir>/audit.log`.

use clap::{Parser, Subcommand, ValueEnum};
use ipnetwork::IpNetwork;
use proxywall::audit::AuditLog;
use proxywall::config::FileSettingsStore;
use proxywall::core::apps::{AppFeature, JsonAppRuleProvider};
use proxywall::core::compiler::Toggle;
use proxywall::core::executor::SystemRunner;
use proxywall::core::firewall::Outcome;
use proxywall::core::lockdown::LockdownState;
use proxywall::utils::SystemNetworks;
use proxywall::{Firewall, Intent, Service};
use std::collections::BTreeSet;
use std::process::ExitCode;

shadow_rs::shadow!(build);

type SystemFirewall = Firewall<SystemRunner, FileSettingsStore, JsonAppRuleProvider, SystemNetworks>;

#[derive(Parser)]
#[command(name = "proxywall")]
#[command(about = "Force device traffic through a local proxy with iptables", long_about = None)]
#[command(version = build::PKG_VERSION)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Intent(IntentCommand),
    /// Print the directives an intent would apply, without applying them
    Plan {
        #[command(subcommand)]
        intent: IntentCommand,
    },
    /// Show lockdown state, capabilities and recorded network state
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Probe iptables capabilities and store the result
    Probe {
        /// Ignore cached results
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand, Clone)]
enum IntentCommand {
    /// Lock down, build all chains, then release the boot locks
    Boot,
    /// Remove every proxywall chain and restore ACCEPT policies
    Deactivate {
        /// Also undo the IPv6 lockdown
        #[arg(long)]
        ipv6: bool,
    },
    /// Undo the IPv6 lockdown only
    ReleaseIpv6,
    /// Switch one per-app feature (nat, bypass, localhost, lan)
    App {
        uid: u32,
        feature: AppFeature,
        switch: Switch,
    },
    /// Switch a service (adb, ssh, sip)
    Service {
        service: Service,
        switch: Switch,
        /// SIP client UID
        #[arg(long)]
        uid: Option<u32>,
    },
    /// Widen the captive-portal browser
    Captive {
        switch: Switch,
        #[arg(long)]
        browser_uid: Option<u32>,
    },
    /// Set the currently tethered interfaces (none clears tethering)
    Tether { interfaces: Vec<String> },
    /// Reconcile the LAN exemption with the current subnet
    Lan {
        /// Use this subnet instead of detecting it
        #[arg(long, conflicts_with = "none")]
        subnet: Option<IpNetwork>,
        /// Treat the device as having no LAN
        #[arg(long)]
        none: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

impl From<Switch> for Toggle {
    fn from(switch: Switch) -> Self {
        match switch {
            Switch::On => Toggle::Enable,
            Switch::Off => Toggle::Disable,
        }
    }
}

fn main() -> ExitCode {
    let _ = proxywall::utils::ensure_dirs();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: Failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(handle_cli(cli.command)) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    let file = proxywall::utils::get_state_dir().and_then(|mut log_path| {
        log_path.push("proxywall.log");
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .ok()
    });

    match file {
        Some(file) => tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer(file)
            .init(),
        None => tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .init(),
    }
}

async fn open_firewall() -> proxywall::Result<SystemFirewall> {
    let store = FileSettingsStore::default_location()?;
    let apps = JsonAppRuleProvider::default_location()?;
    let firewall = Firewall::open(SystemRunner, store, apps, SystemNetworks).await?;

    Ok(match AuditLog::new() {
        Ok(audit) => firewall.with_audit(audit),
        Err(e) => {
            tracing::warn!("Audit log unavailable: {e}");
            firewall
        }
    })
}

async fn to_intent(command: IntentCommand, firewall: &SystemFirewall) -> proxywall::Result<Intent> {
    Ok(match command {
        IntentCommand::Boot => Intent::Boot,
        IntentCommand::Deactivate { ipv6 } => Intent::Deactivate { release_ipv6: ipv6 },
        IntentCommand::ReleaseIpv6 => Intent::ReleaseIpv6,
        IntentCommand::App {
            uid,
            feature,
            switch,
        } => Intent::App {
            uid,
            feature,
            toggle: switch.into(),
        },
        IntentCommand::Service {
            service,
            switch,
            uid,
        } => Intent::Service {
            service,
            toggle: switch.into(),
            uid,
        },
        IntentCommand::Captive {
            switch,
            browser_uid,
        } => Intent::CaptivePortal {
            toggle: switch.into(),
            browser_uid,
        },
        IntentCommand::Tether { interfaces } => Intent::TetherChanged {
            interfaces: interfaces.into_iter().collect::<BTreeSet<_>>(),
        },
        IntentCommand::Lan { subnet, none } => {
            let subnet = if none {
                None
            } else if subnet.is_some() {
                subnet
            } else {
                firewall.observed_subnet().await?
            };
            Intent::LanChanged { subnet }
        }
    })
}

async fn handle_cli(command: Commands) -> proxywall::Result<ExitCode> {
    let mut firewall = open_firewall().await?;

    match command {
        Commands::Intent(command) => {
            let intent = to_intent(command, &firewall).await?;
            let outcome = firewall.apply(intent).await?;
            Ok(print_outcome(&outcome))
        }
        Commands::Plan { intent } => {
            let intent = to_intent(intent, &firewall).await?;
            let plan = firewall.plan(intent).await?;
            for line in plan.rules.render_lines(&plan.flags) {
                println!("{line}");
            }
            eprintln!(
                "{} directives, fingerprint {}",
                plan.rules.len(),
                plan.rules.fingerprint(&plan.flags)
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status { json } => {
            let status = firewall.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!(
                    "proxywall {} ({}{}, built {})",
                    build::PKG_VERSION,
                    build::SHORT_COMMIT,
                    if build::GIT_CLEAN { "" } else { "-dirty" },
                    build::BUILD_TIME
                );
                println!("Enabled:   {}", status.enabled);
                println!("Lockdown:  {}", status.lockdown.state());
                println!(
                    "Boot lock: {}",
                    if status.lockdown.witness {
                        "installed"
                    } else {
                        "absent"
                    }
                );
                println!("IPv6:      {}", status.ipv6);
                match status.feature_flags {
                    Some(flags) => println!(
                        "Features:  comment={} wait={}",
                        flags.supports_comment, flags.supports_wait
                    ),
                    None => println!("Features:  not probed"),
                }
                match status.state.subnet {
                    Some(subnet) => println!("LAN:       {subnet}"),
                    None => println!("LAN:       none"),
                }
                if !status.state.tethered_interfaces.is_empty() {
                    let ifaces: Vec<_> = status.state.tethered_interfaces.iter().cloned().collect();
                    println!("Tethered:  {}", ifaces.join(", "));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Probe { force } => {
            let flags = firewall.probe(force).await?;
            println!(
                "comment support: {}\nwait support:    {}",
                flags.supports_comment, flags.supports_wait
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_outcome(outcome: &Outcome) -> ExitCode {
    let report = &outcome.report;
    println!(
        "Applied {}/{} directives ({} soft failures)",
        report.succeeded(),
        report.attempted(),
        report.soft_failures()
    );
    for line in report.failure_summary() {
        println!("  ✗ {line}");
    }

    if outcome.lockdown.is_some_and(LockdownState::is_fail_closed) {
        eprintln!("Lock chains still installed: all traffic remains blocked");
        return ExitCode::FAILURE;
    }
    if !report.is_success() {
        eprintln!("State not saved; rerun boot once the failures are fixed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
