//! Policy compiler
//!
//! Pure translation of intents into ordered [`RuleSet`]s. No function here
//! touches the filter engine, reads settings or fails: an intent that cannot
//! be fully satisfied (no proxy UID, no browser UID, an invalid interface
//! name) compiles to a smaller RuleSet that is still safe to apply.
//!
//! # Chains
//!
//! | Chain | Table | Role |
//! |---|---|---|
//! | `ow_OUTPUT` | filter | allow rules for outgoing traffic |
//! | `ow_INPUT` | filter | allow rules for incoming traffic |
//! | `ow_OUTPUT` | nat | proxy redirection and RETURN exemptions |
//! | `ow_LAN` | filter | per-app LAN access, reached through subnet jumps |
//! | `ow_OUTPUT_LOCK`, `ow_INPUT_LOCK` | filter | reject-all chains installed by the init script |
//!
//! # Ordering contract
//!
//! Within [`compile_boot`], every directive that allows traffic on a chain
//! comes before the directive removing that chain's lock jump, so the device
//! is never open while only half configured. [`compile_deactivate`] removes
//! each jump before flushing its chain and flushes before deleting.

use crate::config::{AccountingChains, ServiceSettings, Settings};
use crate::core::apps::{AppFeature, AppRule};
use crate::core::capability::{FeatureFlags, Ipv6State};
use crate::core::directive::{Action, Directive, MatchSpec, RuleSet, Table};
use crate::core::reconcile::{diff_interfaces, diff_subnet};
use crate::validators::{sanitize_annotation, validate_interface};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

pub const OUTPUT_CHAIN: &str = "ow_OUTPUT";
pub const INPUT_CHAIN: &str = "ow_INPUT";
pub const LAN_CHAIN: &str = "ow_LAN";
pub const OUTPUT_LOCK_CHAIN: &str = "ow_OUTPUT_LOCK";
pub const INPUT_LOCK_CHAIN: &str = "ow_INPUT_LOCK";
pub const ACCOUNTING_OUTPUT_CHAIN: &str = "accounting_OUT";
pub const ACCOUNTING_INPUT_CHAIN: &str = "accounting_IN";

/// UID of system services (the kernel resolver issues DNS as root)
pub const SYSTEM_UID: u32 = 0;
pub const ADB_PORT: u16 = 5555;
pub const SSH_PORT: u16 = 22;
const DHCP_PORT: u16 = 67;
const DNS_PORT: u16 = 53;
const LOOPBACK: &str = "127.0.0.1/32";
const LOOPBACK_HOST: &str = "127.0.0.1";
/// Group of the tethering DNS relay
const RELAY_GROUP: &str = "nobody";

/// Whether an intent installs or removes its rules
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Toggle {
    Enable,
    Disable,
}

impl Toggle {
    pub fn from_bool(enabled: bool) -> Self {
        if enabled { Toggle::Enable } else { Toggle::Disable }
    }

    pub fn is_enable(self) -> bool {
        self == Toggle::Enable
    }

    /// `-I` on enable, `-D` on disable
    fn insert(self) -> Action {
        match self {
            Toggle::Enable => Action::Insert,
            Toggle::Disable => Action::Delete,
        }
    }

    /// `-A` on enable, `-D` on disable
    fn append(self) -> Action {
        match self {
            Toggle::Enable => Action::Append,
            Toggle::Disable => Action::Delete,
        }
    }
}

/// Proxy listening ports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyPorts {
    pub transparent: u16,
    pub dns: u16,
    pub directory: u16,
}

/// Everything a compile function may depend on besides its own arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileContext {
    pub flags: FeatureFlags,
    pub proxy_uid: Option<u32>,
    pub ports: ProxyPorts,
    pub ipv6: Ipv6State,
    pub accounting: Option<AccountingChains>,
}

impl CompileContext {
    pub fn from_settings(settings: &Settings, flags: FeatureFlags, ipv6: Ipv6State) -> Self {
        Self {
            flags,
            proxy_uid: settings.proxy.uid,
            ports: ProxyPorts {
                transparent: settings.proxy.transparent_port,
                dns: settings.proxy.dns_port,
                directory: settings.proxy.directory_port,
            },
            ipv6,
            accounting: settings.engine.accounting.clone(),
        }
    }

    /// Annotation text, or `None` when comments are unsupported
    fn note(&self, text: &str) -> Option<String> {
        self.flags
            .supports_comment
            .then(|| sanitize_annotation(text))
    }

    fn output_accept_target(&self) -> &'static str {
        if self.accounting.is_some() {
            ACCOUNTING_OUTPUT_CHAIN
        } else {
            "ACCEPT"
        }
    }

    fn input_accept_target(&self) -> &'static str {
        if self.accounting.is_some() {
            ACCOUNTING_INPUT_CHAIN
        } else {
            "ACCEPT"
        }
    }
}

/// Network and preference inputs to [`compile_boot`]
#[derive(Debug, Clone, Copy)]
pub struct BootInputs<'a> {
    /// Subnet persisted by the previous run
    pub previous_subnet: Option<IpNetwork>,
    /// Subnet observed now
    pub current_subnet: Option<IpNetwork>,
    pub services: &'a ServiceSettings,
    pub apps: &'a [AppRule],
}

/// The directive removing the OUTPUT lock jump
pub fn output_lock_release() -> Directive {
    Directive::delete(Table::Filter, "OUTPUT", MatchSpec::new().jump(OUTPUT_LOCK_CHAIN))
}

/// The directive removing the INPUT lock jump
pub fn input_lock_release() -> Directive {
    Directive::delete(Table::Filter, "INPUT", MatchSpec::new().jump(INPUT_LOCK_CHAIN))
}

/// Bootstrap, in this fixed order:
///
/// 1. IPv6 lockdown, when an IPv6 engine is present and not yet rejecting
/// 2. OUTPUT chains, ending with the OUTPUT lock release
/// 3. INPUT chains, ending with the INPUT lock release
/// 4. LAN subnet reconciliation
/// 5. SIP, ADB and SSH per stored preference
/// 6. Per-app rules, in provider order
pub fn compile_boot(ctx: &CompileContext, inputs: &BootInputs<'_>) -> RuleSet {
    let mut rules = compile_ipv6_lockdown(ctx);
    rules.append(boot_output(ctx));
    rules.append(boot_input(ctx));

    if inputs.previous_subnet == inputs.current_subnet {
        // Chains were just created, so an unchanged subnet still needs its jumps
        if let Some(subnet) = inputs.current_subnet {
            rules.append(lan_exemption(ctx, subnet, Toggle::Enable));
        }
    } else {
        rules.append(compile_lan_diff(
            ctx,
            inputs.previous_subnet,
            inputs.current_subnet,
        ));
    }

    if let Some(uid) = inputs.services.sip_uid {
        rules.append(compile_sip(ctx, uid, Toggle::Enable));
    }
    if inputs.services.adb {
        rules.append(compile_adb(ctx, Toggle::Enable));
    }
    if inputs.services.ssh {
        rules.append(compile_ssh(ctx, Toggle::Enable));
    }

    for app in inputs.apps {
        for feature in app.enabled_features() {
            rules.append(compile_app_feature(ctx, app, feature, Toggle::Enable));
        }
    }

    debug!(directives = rules.len(), "Compiled boot");
    rules
}

fn boot_output(ctx: &CompileContext) -> RuleSet {
    let mut rules = RuleSet::new();
    rules.push(Directive::policy("OUTPUT", "DROP"));
    if let Some(acct) = &ctx.accounting {
        rules.push(Directive::delete(
            Table::Filter,
            "OUTPUT",
            MatchSpec::new().jump(&acct.output),
        ));
    }
    rules.push(Directive::new_chain(Table::Filter, OUTPUT_CHAIN));
    rules.push(Directive::append(
        Table::Filter,
        "OUTPUT",
        MatchSpec::new().jump(OUTPUT_CHAIN),
    ));
    if let Some(acct) = &ctx.accounting {
        rules.extend(accounting_chain(ACCOUNTING_OUTPUT_CHAIN, &acct.output));
    }

    match ctx.proxy_uid {
        Some(uid) => {
            rules.push(
                Directive::append(
                    Table::Filter,
                    OUTPUT_CHAIN,
                    MatchSpec::new()
                        .uid_owner(uid)
                        .proto("tcp")
                        .dport(ctx.ports.directory)
                        .jump(ctx.output_accept_target()),
                )
                .annotated(ctx.note("Allow proxy directory traffic")),
            );
            rules.push(
                Directive::append(
                    Table::Filter,
                    OUTPUT_CHAIN,
                    MatchSpec::new()
                        .uid_owner(uid)
                        .ctstate("NEW,RELATED,ESTABLISHED")
                        .jump("ACCEPT"),
                )
                .annotated(ctx.note("Allow proxy outputs")),
            );
            rules.push(
                Directive::append(
                    Table::Filter,
                    OUTPUT_CHAIN,
                    MatchSpec::new()
                        .uid_owner(SYSTEM_UID)
                        .dest(LOOPBACK)
                        .ctstate("NEW,RELATED,ESTABLISHED")
                        .proto("udp")
                        .module("udp")
                        .dport(ctx.ports.dns)
                        .jump("ACCEPT"),
                )
                .annotated(ctx.note("Allow system DNS to DNS proxy")),
            );
        }
        None => {
            rules.push(
                Directive::append(
                    Table::Filter,
                    OUTPUT_CHAIN,
                    MatchSpec::new()
                        .uid_owner(SYSTEM_UID)
                        .proto("udp")
                        .module("udp")
                        .dport(DNS_PORT)
                        .jump("ACCEPT"),
                )
                .annotated(ctx.note("Allow system DNS")),
            );
        }
    }

    rules.push(Directive::new_chain(Table::Nat, OUTPUT_CHAIN));
    rules.push(Directive::append(
        Table::Nat,
        OUTPUT_CHAIN,
        MatchSpec::new().dest(LOOPBACK).jump("RETURN"),
    ));
    if let Some(uid) = ctx.proxy_uid {
        rules.push(
            Directive::append(
                Table::Nat,
                OUTPUT_CHAIN,
                MatchSpec::new().uid_owner(uid).jump("RETURN"),
            )
            .annotated(ctx.note("Proxy bypasses itself")),
        );
        rules.push(
            Directive::append(
                Table::Nat,
                OUTPUT_CHAIN,
                MatchSpec::new()
                    .uid_owner(SYSTEM_UID)
                    .proto("udp")
                    .module("udp")
                    .dport(DNS_PORT)
                    .redirect_to(ctx.ports.dns),
            )
            .annotated(ctx.note("Redirect system DNS to DNS proxy")),
        );
    }
    rules.push(Directive::append(
        Table::Nat,
        "OUTPUT",
        MatchSpec::new().jump(OUTPUT_CHAIN),
    ));
    rules.push(Directive::new_chain(Table::Filter, LAN_CHAIN));
    rules.push(output_lock_release());
    rules
}

fn boot_input(ctx: &CompileContext) -> RuleSet {
    let mut rules = RuleSet::new();
    rules.push(Directive::policy("INPUT", "DROP"));
    if let Some(acct) = &ctx.accounting {
        rules.push(Directive::delete(
            Table::Filter,
            "INPUT",
            MatchSpec::new().jump(&acct.input),
        ));
    }
    rules.push(Directive::new_chain(Table::Filter, INPUT_CHAIN));
    rules.push(Directive::append(
        Table::Filter,
        "INPUT",
        MatchSpec::new().jump(INPUT_CHAIN),
    ));
    if let Some(acct) = &ctx.accounting {
        rules.extend(accounting_chain(ACCOUNTING_INPUT_CHAIN, &acct.input));
    }

    if let Some(uid) = ctx.proxy_uid {
        rules.push(
            Directive::append(
                Table::Filter,
                INPUT_CHAIN,
                MatchSpec::new()
                    .uid_owner(uid)
                    .ctstate("NEW,RELATED,ESTABLISHED")
                    .jump("ACCEPT"),
            )
            .annotated(ctx.note("Allow proxy inputs")),
        );
    }
    rules.push(
        Directive::append(
            Table::Filter,
            INPUT_CHAIN,
            MatchSpec::new().ctstate("RELATED,ESTABLISHED").jump("ACCEPT"),
        )
        .annotated(ctx.note("Allow related inputs")),
    );
    rules.push(input_lock_release());
    rules
}

/// Wrapper chain counting accepted traffic in `counter` before accepting it
fn accounting_chain(chain: &str, counter: &str) -> [Directive; 3] {
    [
        Directive::new_chain(Table::Filter, chain),
        Directive::append(Table::Filter, chain, MatchSpec::new().jump(counter)),
        Directive::append(Table::Filter, chain, MatchSpec::new().jump("ACCEPT")),
    ]
}

/// Teardown: policies back to ACCEPT, jumps removed, every boot chain flushed
/// then deleted, accounting jumps restored when configured.
///
/// Lock chains are never restored; only the init script installs them.
pub fn compile_deactivate(ctx: &CompileContext) -> RuleSet {
    let mut rules = RuleSet::new();

    for (builtin, chain, acct_chain, counter) in [
        (
            "OUTPUT",
            OUTPUT_CHAIN,
            ACCOUNTING_OUTPUT_CHAIN,
            ctx.accounting.as_ref().map(|a| a.output.as_str()),
        ),
        (
            "INPUT",
            INPUT_CHAIN,
            ACCOUNTING_INPUT_CHAIN,
            ctx.accounting.as_ref().map(|a| a.input.as_str()),
        ),
    ] {
        rules.push(Directive::policy(builtin, "ACCEPT"));
        rules.push(Directive::delete(
            Table::Filter,
            builtin,
            MatchSpec::new().jump(chain),
        ));
        rules.push(Directive::flush(Table::Filter, chain));
        rules.push(Directive::delete_chain(Table::Filter, chain));
        if let Some(counter) = counter {
            rules.push(Directive::flush(Table::Filter, acct_chain));
            rules.push(Directive::delete_chain(Table::Filter, acct_chain));
            rules.push(Directive::append(
                Table::Filter,
                builtin,
                MatchSpec::new().jump(counter),
            ));
        }
    }

    rules.push(Directive::delete(
        Table::Nat,
        "OUTPUT",
        MatchSpec::new().jump(OUTPUT_CHAIN),
    ));
    rules.push(Directive::flush(Table::Nat, OUTPUT_CHAIN));
    rules.push(Directive::delete_chain(Table::Nat, OUTPUT_CHAIN));
    rules.push(Directive::flush(Table::Filter, LAN_CHAIN));
    rules.push(Directive::delete_chain(Table::Filter, LAN_CHAIN));
    rules
}

const IPV6_CHAINS: [&str; 3] = ["INPUT", "OUTPUT", "FORWARD"];

/// DROP policies and a leading REJECT on every IPv6 built-in chain.
///
/// Empty when ip6tables is absent or already rejecting.
pub fn compile_ipv6_lockdown(ctx: &CompileContext) -> RuleSet {
    if ctx.ipv6 != Ipv6State::Open {
        return RuleSet::new();
    }

    let mut rules = RuleSet::new();
    for chain in IPV6_CHAINS {
        rules.push(Directive::policy(chain, "DROP").ipv6());
    }
    for chain in IPV6_CHAINS {
        rules.push(Directive::insert(Table::Filter, chain, MatchSpec::new().jump("REJECT")).ipv6());
    }
    rules
}

/// Reverses [`compile_ipv6_lockdown`]; empty when ip6tables is absent
pub fn compile_ipv6_release(ctx: &CompileContext) -> RuleSet {
    if ctx.ipv6 == Ipv6State::Absent {
        return RuleSet::new();
    }

    let mut rules = RuleSet::new();
    for chain in IPV6_CHAINS {
        rules.push(Directive::policy(chain, "ACCEPT").ipv6());
    }
    for chain in IPV6_CHAINS {
        rules.push(Directive::delete(Table::Filter, chain, MatchSpec::new().jump("REJECT")).ipv6());
    }
    rules
}

/// Routes one app's TCP and DNS through the proxy.
///
/// Four directives: nat SYN redirect to the transparent port, nat UDP 53
/// redirect to the DNS port, then filter accepts towards both ports on
/// loopback. Empty without a proxy UID.
pub fn compile_app_nat(ctx: &CompileContext, uid: u32, name: &str, toggle: Toggle) -> RuleSet {
    if ctx.proxy_uid.is_none() {
        debug!(uid, "No proxy UID, skipping NAT for {name}");
        return RuleSet::new();
    }

    let action = toggle.append();
    let ports = ctx.ports;
    [
        Directive::new(
            Table::Nat,
            action,
            OUTPUT_CHAIN,
            MatchSpec::new()
                .proto("tcp")
                .module("tcp")
                .tcp_flags("FIN,SYN,RST,ACK", "SYN")
                .uid_owner(uid)
                .redirect_to(ports.transparent),
        )
        .annotated(ctx.note(&format!("Force {name} through transparent proxy"))),
        Directive::new(
            Table::Nat,
            action,
            OUTPUT_CHAIN,
            MatchSpec::new()
                .proto("udp")
                .dport(DNS_PORT)
                .uid_owner(uid)
                .redirect_to(ports.dns),
        )
        .annotated(ctx.note(&format!("Force {name} through DNS proxy"))),
        Directive::new(
            Table::Filter,
            action,
            OUTPUT_CHAIN,
            MatchSpec::new()
                .dest(LOOPBACK_HOST)
                .ctstate("NEW,ESTABLISHED")
                .uid_owner(uid)
                .module("tcp")
                .proto("tcp")
                .dport(ports.transparent)
                .jump("ACCEPT"),
        )
        .annotated(ctx.note(&format!("Allow {name} to transparent proxy"))),
        Directive::new(
            Table::Filter,
            action,
            OUTPUT_CHAIN,
            MatchSpec::new()
                .dest(LOOPBACK_HOST)
                .ctstate("NEW,ESTABLISHED")
                .uid_owner(uid)
                .proto("udp")
                .dport(ports.dns)
                .jump("ACCEPT"),
        )
        .annotated(ctx.note(&format!("Allow {name} to DNS proxy"))),
    ]
    .into_iter()
    .collect()
}

/// Lets one app reach the network directly, around the proxy
pub fn compile_bypass(ctx: &CompileContext, uid: u32, name: &str, toggle: Toggle) -> RuleSet {
    [Directive::new(
        Table::Filter,
        toggle.insert(),
        OUTPUT_CHAIN,
        MatchSpec::new()
            .ctstate("NEW,ESTABLISHED,RELATED")
            .uid_owner(uid)
            .jump("ACCEPT"),
    )
    .annotated(ctx.note(&format!("Allow {name} to bypass proxy")))]
    .into_iter()
    .collect()
}

/// Lets one app talk over loopback
pub fn compile_localhost(ctx: &CompileContext, uid: u32, name: &str, toggle: Toggle) -> RuleSet {
    let note = ctx.note(&format!("Allow {name} on localhost"));
    [
        Directive::new(
            Table::Filter,
            toggle.insert(),
            OUTPUT_CHAIN,
            MatchSpec::new().out_iface("lo").uid_owner(uid).jump("ACCEPT"),
        )
        .annotated(note.clone()),
        Directive::new(
            Table::Filter,
            toggle.insert(),
            INPUT_CHAIN,
            MatchSpec::new().in_iface("lo").uid_owner(uid).jump("ACCEPT"),
        )
        .annotated(note),
    ]
    .into_iter()
    .collect()
}

/// Lets one app reach the LAN through the `ow_LAN` chain
pub fn compile_local_network(
    ctx: &CompileContext,
    uid: u32,
    name: &str,
    toggle: Toggle,
) -> RuleSet {
    [Directive::new(
        Table::Filter,
        toggle.insert(),
        LAN_CHAIN,
        MatchSpec::new().uid_owner(uid).jump("ACCEPT"),
    )
    .annotated(ctx.note(&format!("Local network {name}")))]
    .into_iter()
    .collect()
}

/// Dispatches one per-app feature to its compile function
pub fn compile_app_feature(
    ctx: &CompileContext,
    app: &AppRule,
    feature: AppFeature,
    toggle: Toggle,
) -> RuleSet {
    let name = app.package_name.as_str();
    match feature {
        AppFeature::Nat => compile_app_nat(ctx, app.uid, name, toggle),
        AppFeature::Bypass => compile_bypass(ctx, app.uid, name, toggle),
        AppFeature::Localhost => compile_localhost(ctx, app.uid, name, toggle),
        AppFeature::Lan => compile_local_network(ctx, app.uid, name, toggle),
    }
}

/// Inbound service on a fixed TCP port, answered but never proxied
fn service_port(ctx: &CompileContext, port: u16, label: &str, toggle: Toggle) -> RuleSet {
    let action = toggle.insert();
    [
        Directive::new(
            Table::Filter,
            action,
            INPUT_CHAIN,
            MatchSpec::new()
                .proto("tcp")
                .dport(port)
                .ctstate("NEW,ESTABLISHED")
                .jump("ACCEPT"),
        )
        .annotated(ctx.note(&format!("Allow {label} inputs"))),
        Directive::new(
            Table::Filter,
            action,
            OUTPUT_CHAIN,
            MatchSpec::new()
                .proto("tcp")
                .sport(port)
                .ctstate("ESTABLISHED")
                .jump("ACCEPT"),
        )
        .annotated(ctx.note(&format!("Allow {label} replies"))),
        Directive::new(
            Table::Nat,
            action,
            OUTPUT_CHAIN,
            MatchSpec::new().proto("tcp").sport(port).jump("RETURN"),
        )
        .annotated(ctx.note(&format!("{label} replies skip proxy"))),
    ]
    .into_iter()
    .collect()
}

/// ADB over network, TCP 5555
pub fn compile_adb(ctx: &CompileContext, toggle: Toggle) -> RuleSet {
    service_port(ctx, ADB_PORT, "ADB", toggle)
}

/// SSH server, TCP 22
pub fn compile_ssh(ctx: &CompileContext, toggle: Toggle) -> RuleSet {
    service_port(ctx, SSH_PORT, "SSH", toggle)
}

/// Lets a SIP client's UDP traffic bypass the proxy
pub fn compile_sip(ctx: &CompileContext, uid: u32, toggle: Toggle) -> RuleSet {
    let action = toggle.insert();
    [
        Directive::new(
            Table::Filter,
            action,
            INPUT_CHAIN,
            MatchSpec::new()
                .uid_owner(uid)
                .ctstate("RELATED,ESTABLISHED")
                .proto("udp")
                .jump(ctx.input_accept_target()),
        )
        .annotated(ctx.note("Allow SIP inputs")),
        Directive::new(
            Table::Filter,
            action,
            OUTPUT_CHAIN,
            MatchSpec::new()
                .uid_owner(uid)
                .proto("udp")
                .jump(ctx.output_accept_target()),
        )
        .annotated(ctx.note("Allow SIP outputs")),
        Directive::new(
            Table::Nat,
            action,
            OUTPUT_CHAIN,
            MatchSpec::new().uid_owner(uid).proto("udp").jump("RETURN"),
        )
        .annotated(ctx.note("SIP skips proxy")),
    ]
    .into_iter()
    .collect()
}

/// Widens the captive-portal browser so a network login page can load.
///
/// The last directive puts a RETURN for system DNS at the head of nat
/// `ow_OUTPUT`, shadowing the DNS-proxy redirect while enabled. Empty when no
/// browser UID is known.
pub fn compile_captive_browser(
    ctx: &CompileContext,
    browser_uid: Option<u32>,
    toggle: Toggle,
) -> RuleSet {
    let Some(uid) = browser_uid else {
        warn!("No captive-portal browser configured, nothing to {toggle}");
        return RuleSet::new();
    };

    let action = toggle.insert();
    let note = ctx.note("Captive portal login");
    [
        Directive::new(
            Table::Filter,
            action,
            INPUT_CHAIN,
            MatchSpec::new()
                .uid_owner(uid)
                .ctstate("RELATED,ESTABLISHED")
                .proto("udp")
                .sport(DNS_PORT)
                .jump("ACCEPT"),
        ),
        Directive::new(
            Table::Filter,
            action,
            INPUT_CHAIN,
            MatchSpec::new()
                .ctstate("RELATED,ESTABLISHED")
                .uid_owner(uid)
                .jump("ACCEPT"),
        ),
        Directive::new(
            Table::Filter,
            action,
            OUTPUT_CHAIN,
            MatchSpec::new().uid_owner(uid).jump("ACCEPT"),
        ),
        Directive::new(
            Table::Filter,
            action,
            OUTPUT_CHAIN,
            MatchSpec::new().uid_owner(uid).ctstate("ESTABLISHED").jump("ACCEPT"),
        ),
        Directive::new(
            Table::Nat,
            action,
            OUTPUT_CHAIN,
            MatchSpec::new().uid_owner(uid).jump("RETURN"),
        ),
        Directive::new(
            Table::Nat,
            action,
            OUTPUT_CHAIN,
            MatchSpec::new()
                .uid_owner(SYSTEM_UID)
                .proto("udp")
                .module("udp")
                .dport(DNS_PORT)
                .jump("RETURN"),
        ),
    ]
    .into_iter()
    .map(|d| d.annotated(note.clone()))
    .collect()
}

/// The three LAN exemption directives for one subnet
fn lan_exemption(ctx: &CompileContext, subnet: IpNetwork, toggle: Toggle) -> RuleSet {
    let action = toggle.insert();
    let note = ctx.note("LAN exemption");
    [
        Directive::new(
            Table::Filter,
            action,
            OUTPUT_CHAIN,
            MatchSpec::new().dest(subnet).jump(LAN_CHAIN),
        ),
        Directive::new(
            Table::Filter,
            action,
            INPUT_CHAIN,
            MatchSpec::new().source(subnet).jump(LAN_CHAIN),
        ),
        Directive::new(
            Table::Nat,
            action,
            OUTPUT_CHAIN,
            MatchSpec::new().dest(subnet).jump("RETURN"),
        ),
    ]
    .into_iter()
    .map(|d| d.annotated(note.clone()))
    .collect()
}

/// Moves the LAN exemption from `old` to `new`: removals first, then insertions.
///
/// Empty when the subnet is unchanged.
pub fn compile_lan_diff(
    ctx: &CompileContext,
    old: Option<IpNetwork>,
    new: Option<IpNetwork>,
) -> RuleSet {
    let delta = diff_subnet(old, new);
    let mut rules = RuleSet::new();
    if let Some(subnet) = delta.remove {
        rules.append(lan_exemption(ctx, subnet, Toggle::Disable));
    }
    if let Some(subnet) = delta.add {
        rules.append(lan_exemption(ctx, subnet, Toggle::Enable));
    }
    rules
}

/// Enable or disable directives for one tethered interface
fn tether_interface(
    ctx: &CompileContext,
    iface: &str,
    network: Option<IpNetwork>,
    toggle: Toggle,
) -> RuleSet {
    if let Err(e) = validate_interface(iface) {
        warn!("Skipping tethered interface {iface:?}: {e}");
        return RuleSet::new();
    }

    let action = toggle.append();
    let dhcp = ctx.note("Allow DHCP tethering");
    let dns = ctx.note("Allow DNS tethering");
    let mut rules: RuleSet = [
        Directive::new(
            Table::Filter,
            action,
            INPUT_CHAIN,
            MatchSpec::new()
                .in_iface(iface)
                .proto("udp")
                .module("udp")
                .dport(DHCP_PORT)
                .jump("ACCEPT"),
        )
        .annotated(dhcp.clone()),
        Directive::new(
            Table::Filter,
            action,
            OUTPUT_CHAIN,
            MatchSpec::new()
                .out_iface(iface)
                .proto("udp")
                .module("udp")
                .sport(DHCP_PORT)
                .jump("ACCEPT"),
        )
        .annotated(dhcp),
        Directive::new(
            Table::Filter,
            action,
            INPUT_CHAIN,
            MatchSpec::new()
                .in_iface(iface)
                .proto("udp")
                .dport(DNS_PORT)
                .jump("ACCEPT"),
        )
        .annotated(dns.clone()),
        Directive::new(
            Table::Filter,
            action,
            OUTPUT_CHAIN,
            MatchSpec::new()
                .out_iface(iface)
                .proto("udp")
                .sport(DNS_PORT)
                .jump("ACCEPT"),
        )
        .annotated(dns),
        Directive::new(
            Table::Filter,
            action,
            OUTPUT_CHAIN,
            MatchSpec::new()
                .gid_owner(RELAY_GROUP)
                .proto("udp")
                .dport(DNS_PORT)
                .jump("ACCEPT"),
        )
        .annotated(ctx.note("Allow tethered DNS relay")),
    ]
    .into_iter()
    .collect();

    match network {
        Some(network) => rules.append(lan_exemption(ctx, network, toggle)),
        None => debug!("No network known for {iface}, no LAN exemption to {toggle}"),
    }
    rules
}

/// Reconciles tethering: removed interfaces are disabled, then added ones are
/// enabled. Both sides are processed in sorted order; unchanged interfaces
/// produce nothing.
///
/// `networks` supplies each interface's network: the recorded one for
/// removals, the observed one for additions.
pub fn compile_tether_diff(
    ctx: &CompileContext,
    before: &BTreeSet<String>,
    after: &BTreeSet<String>,
    networks: &BTreeMap<String, IpNetwork>,
) -> RuleSet {
    let delta = diff_interfaces(before, after);
    let mut rules = RuleSet::new();
    for iface in &delta.removals {
        rules.append(tether_interface(
            ctx,
            iface,
            networks.get(iface).copied(),
            Toggle::Disable,
        ));
    }
    for iface in &delta.additions {
        rules.append(tether_interface(
            ctx,
            iface,
            networks.get(iface).copied(),
            Toggle::Enable,
        ));
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(proxy_uid: Option<u32>, supports_comment: bool) -> CompileContext {
        CompileContext {
            flags: FeatureFlags {
                supports_comment,
                supports_wait: false,
            },
            proxy_uid,
            ports: ProxyPorts {
                transparent: 9040,
                dns: 5400,
                directory: 9030,
            },
            ipv6: Ipv6State::Absent,
            accounting: None,
        }
    }

    fn lines(ctx: &CompileContext, rules: &RuleSet) -> Vec<String> {
        rules
            .iter()
            .map(|d| d.to_args(&ctx.flags).join(" "))
            .collect()
    }

    fn boot(ctx: &CompileContext) -> RuleSet {
        let services = ServiceSettings::default();
        compile_boot(
            ctx,
            &BootInputs {
                previous_subnet: None,
                current_subnet: None,
                services: &services,
                apps: &[],
            },
        )
    }

    #[test]
    fn test_boot_with_proxy_exact_sequence() {
        let ctx = ctx_with(Some(1000), false);
        assert_eq!(
            lines(&ctx, &boot(&ctx)),
            [
                "-t filter -P OUTPUT DROP",
                "-t filter -N ow_OUTPUT",
                "-t filter -A OUTPUT -j ow_OUTPUT",
                "-t filter -A ow_OUTPUT -m owner --uid-owner 1000 -p tcp --dport 9030 -j ACCEPT",
                "-t filter -A ow_OUTPUT -m owner --uid-owner 1000 -m conntrack --ctstate NEW,RELATED,ESTABLISHED -j ACCEPT",
                "-t filter -A ow_OUTPUT -m owner --uid-owner 0 -d 127.0.0.1/32 -m conntrack --ctstate NEW,RELATED,ESTABLISHED -p udp -m udp --dport 5400 -j ACCEPT",
                "-t nat -N ow_OUTPUT",
                "-t nat -A ow_OUTPUT -d 127.0.0.1/32 -j RETURN",
                "-t nat -A ow_OUTPUT -m owner --uid-owner 1000 -j RETURN",
                "-t nat -A ow_OUTPUT -m owner --uid-owner 0 -p udp -m udp --dport 53 -j REDIRECT --to-ports 5400",
                "-t nat -A OUTPUT -j ow_OUTPUT",
                "-t filter -N ow_LAN",
                "-t filter -D OUTPUT -j ow_OUTPUT_LOCK",
                "-t filter -P INPUT DROP",
                "-t filter -N ow_INPUT",
                "-t filter -A INPUT -j ow_INPUT",
                "-t filter -A ow_INPUT -m owner --uid-owner 1000 -m conntrack --ctstate NEW,RELATED,ESTABLISHED -j ACCEPT",
                "-t filter -A ow_INPUT -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT",
                "-t filter -D INPUT -j ow_INPUT_LOCK",
            ]
        );
    }

    #[test]
    fn test_boot_without_proxy_accepts_system_dns() {
        let ctx = ctx_with(None, false);
        let lines = lines(&ctx, &boot(&ctx));

        assert!(lines.contains(
            &"-t filter -A ow_OUTPUT -m owner --uid-owner 0 -p udp -m udp --dport 53 -j ACCEPT"
                .to_string()
        ));
        assert!(!lines.iter().any(|l| l.contains("REDIRECT")));
        assert!(!lines.iter().any(|l| l.contains("9030")));
    }

    #[test]
    fn test_boot_with_accounting() {
        let mut ctx = ctx_with(Some(1000), false);
        ctx.accounting = Some(AccountingChains::default());
        let lines = lines(&ctx, &boot(&ctx));

        assert_eq!(lines[1], "-t filter -D OUTPUT -j bw_OUTPUT");
        assert_eq!(lines[4], "-t filter -N accounting_OUT");
        assert_eq!(lines[5], "-t filter -A accounting_OUT -j bw_OUTPUT");
        assert_eq!(lines[6], "-t filter -A accounting_OUT -j ACCEPT");
        assert!(lines[7].ends_with("--dport 9030 -j accounting_OUT"));
    }

    #[test]
    fn test_boot_ipv6_lockdown_comes_first_when_open() {
        let mut ctx = ctx_with(Some(1000), false);
        ctx.ipv6 = Ipv6State::Open;
        let rules = boot(&ctx);

        let v6: Vec<_> = rules.iter().take(6).collect();
        assert!(v6.iter().all(|d| d.family() == crate::core::directive::Family::Ipv6));
        assert_eq!(v6[0].to_args(&ctx.flags).join(" "), "-t filter -P INPUT DROP");
        assert_eq!(v6[3].to_args(&ctx.flags).join(" "), "-t filter -I INPUT -j REJECT");

        ctx.ipv6 = Ipv6State::Locked;
        assert!(compile_ipv6_lockdown(&ctx).is_empty());
    }

    #[test]
    fn test_boot_annotations_follow_comment_support() {
        let with = ctx_with(Some(1000), true);
        let rules = boot(&with);
        assert!(rules.iter().any(|d| d.annotation() == Some("Allow proxy outputs")));

        let without = ctx_with(Some(1000), false);
        let rules = boot(&without);
        assert!(rules.iter().all(|d| d.annotation().is_none()));
    }

    #[test]
    fn test_boot_includes_services_lan_and_apps_after_locks() {
        let ctx = ctx_with(Some(1000), false);
        let services = ServiceSettings {
            adb: true,
            ssh: true,
            sip_uid: Some(10_050),
            ..ServiceSettings::default()
        };
        let apps = crate::core::test_helpers::sample_app_rules();
        let rules = compile_boot(
            &ctx,
            &BootInputs {
                previous_subnet: None,
                current_subnet: Some("192.168.1.0/24".parse().unwrap()),
                services: &services,
                apps: &apps,
            },
        );
        let lines = lines(&ctx, &rules);
        let input_release = lines
            .iter()
            .position(|l| l == "-t filter -D INPUT -j ow_INPUT_LOCK")
            .unwrap();

        assert_eq!(lines[input_release + 1], "-t filter -I ow_OUTPUT -d 192.168.1.0/24 -j ow_LAN");
        assert!(lines.iter().any(|l| l.contains("--uid-owner 10050 -p udp -j ACCEPT")));
        assert!(lines.iter().any(|l| l.contains("--dport 5555")));
        assert!(lines.iter().any(|l| l.contains("--dport 22 ")));
        // browser: nat + localhost, updater: bypass + lan
        assert_eq!(lines.iter().filter(|l| l.contains("--uid-owner 10200")).count(), 6);
        assert_eq!(lines.iter().filter(|l| l.contains("--uid-owner 10201")).count(), 2);
    }

    #[test]
    fn test_boot_reinserts_unchanged_subnet() {
        let ctx = ctx_with(None, false);
        let services = ServiceSettings::default();
        let subnet: IpNetwork = "10.0.0.0/24".parse().unwrap();
        let rules = compile_boot(
            &ctx,
            &BootInputs {
                previous_subnet: Some(subnet),
                current_subnet: Some(subnet),
                services: &services,
                apps: &[],
            },
        );
        let lines = lines(&ctx, &rules);
        assert!(lines.contains(&"-t filter -I ow_INPUT -s 10.0.0.0/24 -j ow_LAN".to_string()));
        assert!(!lines.iter().any(|l| l.contains("-D ow_OUTPUT -d 10.0.0.0/24")));
    }

    #[test]
    fn test_lock_release_is_last_for_each_chain() {
        for proxy in [None, Some(1000)] {
            let ctx = ctx_with(proxy, true);
            let rules = boot(&ctx);
            let directives = rules.directives();
            let out = directives.iter().position(|d| *d == output_lock_release()).unwrap();
            let inp = directives.iter().position(|d| *d == input_lock_release()).unwrap();

            let boot_output_chain = |d: &&Directive| {
                d.table() == Table::Nat || d.chain() == "OUTPUT" || d.chain() == OUTPUT_CHAIN
            };
            assert!(directives[..out].iter().filter(boot_output_chain).count() > 0);
            assert!(!directives[out + 1..inp].iter().any(|d| d.chain() == OUTPUT_CHAIN));
            assert!(directives[..inp].iter().any(|d| d.chain() == INPUT_CHAIN));
            assert_eq!(inp, directives.len() - 1);
        }
    }

    #[test]
    fn test_deactivate_sequence() {
        let ctx = ctx_with(Some(1000), false);
        assert_eq!(
            lines(&ctx, &compile_deactivate(&ctx)),
            [
                "-t filter -P OUTPUT ACCEPT",
                "-t filter -D OUTPUT -j ow_OUTPUT",
                "-t filter -F ow_OUTPUT",
                "-t filter -X ow_OUTPUT",
                "-t filter -P INPUT ACCEPT",
                "-t filter -D INPUT -j ow_INPUT",
                "-t filter -F ow_INPUT",
                "-t filter -X ow_INPUT",
                "-t nat -D OUTPUT -j ow_OUTPUT",
                "-t nat -F ow_OUTPUT",
                "-t nat -X ow_OUTPUT",
                "-t filter -F ow_LAN",
                "-t filter -X ow_LAN",
            ]
        );
    }

    #[test]
    fn test_deactivate_restores_accounting() {
        let mut ctx = ctx_with(Some(1000), false);
        ctx.accounting = Some(AccountingChains::default());
        let lines = lines(&ctx, &compile_deactivate(&ctx));
        assert_eq!(lines[4], "-t filter -F accounting_OUT");
        assert_eq!(lines[5], "-t filter -X accounting_OUT");
        assert_eq!(lines[6], "-t filter -A OUTPUT -j bw_OUTPUT");
        assert!(lines.contains(&"-t filter -A INPUT -j bw_INPUT".to_string()));
    }

    #[test]
    fn test_app_nat_four_directives() {
        let ctx = ctx_with(Some(1000), false);
        assert_eq!(
            lines(&ctx, &compile_app_nat(&ctx, 10_200, "org.example", Toggle::Enable)),
            [
                "-t nat -A ow_OUTPUT -p tcp -m tcp --tcp-flags FIN,SYN,RST,ACK SYN -m owner --uid-owner 10200 -j REDIRECT --to-ports 9040",
                "-t nat -A ow_OUTPUT -p udp --dport 53 -m owner --uid-owner 10200 -j REDIRECT --to-ports 5400",
                "-t filter -A ow_OUTPUT -d 127.0.0.1 -m conntrack --ctstate NEW,ESTABLISHED -m owner --uid-owner 10200 -m tcp -p tcp --dport 9040 -j ACCEPT",
                "-t filter -A ow_OUTPUT -d 127.0.0.1 -m conntrack --ctstate NEW,ESTABLISHED -m owner --uid-owner 10200 -p udp --dport 5400 -j ACCEPT",
            ]
        );
    }

    #[test]
    fn test_app_nat_skipped_without_proxy() {
        let ctx = ctx_with(None, true);
        assert!(compile_app_nat(&ctx, 10_200, "org.example", Toggle::Enable).is_empty());
    }

    #[test]
    fn test_app_annotation_is_sanitized() {
        let ctx = ctx_with(Some(1000), true);
        let rules = compile_bypass(&ctx, 10_200, "evil\"; rm -rf /", Toggle::Enable);
        assert_eq!(
            rules.directives()[0].annotation(),
            Some("Allow evil rm -rf  to bypass proxy")
        );
    }

    #[test]
    fn test_exemptions_insert_and_delete() {
        let ctx = ctx_with(Some(1000), false);
        let on = compile_localhost(&ctx, 10_300, "app", Toggle::Enable);
        let off = compile_localhost(&ctx, 10_300, "app", Toggle::Disable);
        assert!(on.iter().all(|d| d.action() == Action::Insert));
        assert!(off.iter().all(|d| d.action() == Action::Delete));
        assert_eq!(
            lines(&ctx, &compile_local_network(&ctx, 10_300, "app", Toggle::Enable)),
            ["-t filter -I ow_LAN -m owner --uid-owner 10300 -j ACCEPT"]
        );
    }

    #[test]
    fn test_adb_rules() {
        let ctx = ctx_with(None, false);
        assert_eq!(
            lines(&ctx, &compile_adb(&ctx, Toggle::Disable)),
            [
                "-t filter -D ow_INPUT -p tcp --dport 5555 -m conntrack --ctstate NEW,ESTABLISHED -j ACCEPT",
                "-t filter -D ow_OUTPUT -p tcp --sport 5555 -m conntrack --ctstate ESTABLISHED -j ACCEPT",
                "-t nat -D ow_OUTPUT -p tcp --sport 5555 -j RETURN",
            ]
        );
    }

    #[test]
    fn test_sip_uses_accounting_when_configured() {
        let mut ctx = ctx_with(None, false);
        ctx.accounting = Some(AccountingChains::default());
        let lines = lines(&ctx, &compile_sip(&ctx, 10_050, Toggle::Enable));
        assert!(lines[0].ends_with("-j accounting_IN"));
        assert!(lines[1].ends_with("-j accounting_OUT"));
        assert!(lines[2].ends_with("-j RETURN"));
    }

    #[test]
    fn test_captive_browser() {
        let ctx = ctx_with(Some(1000), false);
        let rules = compile_captive_browser(&ctx, Some(10_100), Toggle::Enable);
        let lines = lines(&ctx, &rules);
        assert_eq!(lines.len(), 6);
        assert_eq!(
            lines[5],
            "-t nat -I ow_OUTPUT -m owner --uid-owner 0 -p udp -m udp --dport 53 -j RETURN"
        );

        let off = compile_captive_browser(&ctx, Some(10_100), Toggle::Disable);
        assert!(off.iter().all(|d| d.action() == Action::Delete));
        assert!(compile_captive_browser(&ctx, None, Toggle::Enable).is_empty());
    }

    #[test]
    fn test_lan_diff() {
        let ctx = ctx_with(None, false);
        let rules = compile_lan_diff(
            &ctx,
            Some("10.0.0.0/24".parse().unwrap()),
            Some("10.0.1.0/24".parse().unwrap()),
        );
        assert_eq!(
            lines(&ctx, &rules),
            [
                "-t filter -D ow_OUTPUT -d 10.0.0.0/24 -j ow_LAN",
                "-t filter -D ow_INPUT -s 10.0.0.0/24 -j ow_LAN",
                "-t nat -D ow_OUTPUT -d 10.0.0.0/24 -j RETURN",
                "-t filter -I ow_OUTPUT -d 10.0.1.0/24 -j ow_LAN",
                "-t filter -I ow_INPUT -s 10.0.1.0/24 -j ow_LAN",
                "-t nat -I ow_OUTPUT -d 10.0.1.0/24 -j RETURN",
            ]
        );

        let same: Option<IpNetwork> = Some("10.0.0.0/24".parse().unwrap());
        assert!(compile_lan_diff(&ctx, same, same).is_empty());
    }

    #[test]
    fn test_tether_diff() {
        let ctx = ctx_with(None, false);
        let before: BTreeSet<String> = ["A", "B"].iter().map(|s| (*s).to_string()).collect();
        let after: BTreeSet<String> = ["B", "C"].iter().map(|s| (*s).to_string()).collect();
        let rules = compile_tether_diff(&ctx, &before, &after, &BTreeMap::new());
        let lines = lines(&ctx, &rules);

        assert_eq!(lines.len(), 10);
        assert!(lines[..5].iter().all(|l| l.contains(" -D ")));
        assert!(lines[5..].iter().all(|l| l.contains(" -A ")));
        assert_eq!(lines[0], "-t filter -D ow_INPUT -i A -p udp -m udp --dport 67 -j ACCEPT");
        assert_eq!(lines[6], "-t filter -A ow_OUTPUT -o C -p udp -m udp --sport 67 -j ACCEPT");
        assert_eq!(
            lines[9],
            "-t filter -A ow_OUTPUT -m owner --gid-owner nobody -p udp --dport 53 -j ACCEPT"
        );
        assert!(!lines.iter().any(|l| l.contains(" B ")));
    }

    #[test]
    fn test_tether_network_gets_lan_exemption() {
        let ctx = ctx_with(None, false);
        let after: BTreeSet<String> = std::iter::once("rndis0".to_string()).collect();
        let networks: BTreeMap<String, IpNetwork> =
            std::iter::once(("rndis0".to_string(), "192.168.42.0/24".parse().unwrap())).collect();
        let lines = lines(&ctx, &compile_tether_diff(&ctx, &BTreeSet::new(), &after, &networks));

        assert_eq!(lines.len(), 8);
        assert_eq!(lines[5], "-t filter -I ow_OUTPUT -d 192.168.42.0/24 -j ow_LAN");
        assert_eq!(lines[7], "-t nat -I ow_OUTPUT -d 192.168.42.0/24 -j RETURN");
    }

    #[test]
    fn test_tether_invalid_interface_skipped() {
        let ctx = ctx_with(None, false);
        let after: BTreeSet<String> = std::iter::once("usb0 -j ACCEPT".to_string()).collect();
        assert!(compile_tether_diff(&ctx, &BTreeSet::new(), &after, &BTreeMap::new()).is_empty());
    }

    #[test]
    fn test_ipv6_release() {
        let mut ctx = ctx_with(None, false);
        ctx.ipv6 = Ipv6State::Locked;
        let lines = lines(&ctx, &compile_ipv6_release(&ctx));
        assert_eq!(lines[0], "-t filter -P INPUT ACCEPT");
        assert_eq!(lines[5], "-t filter -D FORWARD -j REJECT");

        ctx.ipv6 = Ipv6State::Absent;
        assert!(compile_ipv6_release(&ctx).is_empty());
    }
}
