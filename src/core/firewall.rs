//! Intent layer
//!
//! [`Firewall`] ties the pieces together for one intent at a time:
//!
//! 1. Load and validate settings
//! 2. Resolve [`FeatureFlags`] (cached) and, when the intent touches IPv6, the
//!    IPv6 engine state
//! 3. Compile the intent into a [`Plan`]
//! 4. Apply the plan's RuleSet
//! 5. Persist the new settings only if no non-removal directive failed
//! 6. Write one audit event
//!
//! Intents other than boot and teardown only record the preference while the
//! firewall is not enabled; boot picks the preference up later, recorded
//! tethered interfaces included.
//!
//! `&mut self` on every operation keeps the privileged channel strictly
//! sequential. Callers queue intents.

use crate::audit::{AuditEvent, AuditLog, EventType};
use crate::config::{ServiceSettings, Settings, SettingsStore};
use crate::core::apps::{AppFeature, AppRule, AppRuleError, AppRuleProvider};
use crate::core::capability::{CapabilityDetector, FeatureFlags, Ipv6State};
use crate::core::compiler::{
    BootInputs, CompileContext, Toggle, compile_adb, compile_app_feature, compile_boot,
    compile_captive_browser, compile_deactivate, compile_ipv6_release, compile_lan_diff,
    compile_sip, compile_ssh, compile_tether_diff,
};
use crate::core::directive::RuleSet;
use crate::core::error::{Error, Result};
use crate::core::executor::{CommandRunner, ExecutionReport, Executor};
use crate::core::lockdown::{self, LockdownObservation, LockdownState, witness_check};
use crate::core::reconcile::NetworkSnapshot;
use crate::utils::{NetworkInspector, SystemNetworks};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{error, info, warn};

/// Inbound or bypass service with a stored on/off preference
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Service {
    Adb,
    Ssh,
    Sip,
}

/// A high-level request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "intent")]
pub enum Intent {
    /// Default-deny, configure, then release the locks
    Boot,
    /// Remove every proxywall chain
    Deactivate { release_ipv6: bool },
    /// Undo the IPv6 lockdown only
    ReleaseIpv6,
    App {
        uid: u32,
        feature: AppFeature,
        toggle: Toggle,
    },
    /// `uid` selects the SIP client and is ignored for other services
    Service {
        service: Service,
        toggle: Toggle,
        uid: Option<u32>,
    },
    CaptivePortal {
        toggle: Toggle,
        browser_uid: Option<u32>,
    },
    /// The complete set of currently tethered interfaces
    TetherChanged { interfaces: BTreeSet<String> },
    /// The currently observed LAN subnet
    LanChanged { subnet: Option<IpNetwork> },
}

impl Intent {
    fn event_type(&self) -> EventType {
        match self {
            Intent::Boot => EventType::Boot,
            Intent::Deactivate { .. } => EventType::Deactivate,
            Intent::ReleaseIpv6 => EventType::ReleaseIpv6,
            Intent::App { .. } => EventType::AppRule,
            Intent::Service { .. } => EventType::Service,
            Intent::CaptivePortal { .. } => EventType::CaptivePortal,
            Intent::TetherChanged { .. } => EventType::Tether,
            Intent::LanChanged { .. } => EventType::Lan,
        }
    }

    fn touches_ipv6(&self) -> bool {
        matches!(
            self,
            Intent::Boot
                | Intent::ReleaseIpv6
                | Intent::Deactivate {
                    release_ipv6: true
                }
        )
    }

    /// Boot and teardown run whether or not the firewall is enabled
    fn needs_live_chains(&self) -> bool {
        !matches!(
            self,
            Intent::Boot | Intent::Deactivate { .. } | Intent::ReleaseIpv6
        )
    }
}

/// A compiled intent and the settings to store once it is applied
#[derive(Debug, Clone)]
pub struct Plan {
    pub intent: Intent,
    pub flags: FeatureFlags,
    pub rules: RuleSet,
    next: Settings,
    app_update: Option<AppRule>,
}

impl Plan {
    /// Settings that will be persisted after a successful apply
    pub fn next_settings(&self) -> &Settings {
        &self.next
    }
}

/// Result of one applied intent
#[derive(Debug, Clone)]
pub struct Outcome {
    pub report: ExecutionReport,
    /// Lockdown state after boot; `None` for other intents
    pub lockdown: Option<LockdownState>,
    /// New settings were stored
    pub persisted: bool,
}

/// Snapshot for `proxywall status`
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub enabled: bool,
    pub feature_flags: Option<FeatureFlags>,
    pub ipv6: Ipv6State,
    pub lockdown: LockdownObservation,
    pub state: NetworkSnapshot,
}

/// The intent executor
pub struct Firewall<R, S, P, N = SystemNetworks> {
    executor: Executor<R>,
    detector: CapabilityDetector,
    store: S,
    apps: P,
    networks: N,
    audit: Option<AuditLog>,
}

async fn load_validated<S: SettingsStore>(store: &S) -> Result<Settings> {
    let settings = store.load().await?;
    settings.validate()?;
    Ok(settings)
}

impl<R, S, P, N> Firewall<R, S, P, N>
where
    R: CommandRunner,
    S: SettingsStore,
    P: AppRuleProvider,
    N: NetworkInspector,
{
    /// Binds the collaborators, using the filter binaries from stored settings
    ///
    /// # Errors
    ///
    /// Returns `Err` when settings cannot be loaded or are invalid.
    pub async fn open(runner: R, store: S, apps: P, networks: N) -> Result<Self> {
        let settings = load_validated(&store).await?;
        Ok(Self {
            executor: Executor::new(
                runner,
                &settings.engine.iptables,
                &settings.engine.ip6tables,
            ),
            detector: CapabilityDetector::new(
                &settings.engine.iptables,
                &settings.engine.ip6tables,
            )
            .with_cached(settings.feature_flags),
            store,
            apps,
            networks,
            audit: None,
        })
    }

    /// Records one audit event per applied intent
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn executor(&self) -> &Executor<R> {
        &self.executor
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn apps(&self) -> &P {
        &self.apps
    }

    /// Compiles and applies `intent`
    ///
    /// # Errors
    ///
    /// Returns `Err` for invalid settings or intent arguments, an unavailable
    /// privileged channel (nothing applied), or a failure to persist.
    /// Individual directive failures are reported in [`Outcome::report`].
    pub async fn apply(&mut self, intent: Intent) -> Result<Outcome> {
        let plan = self.plan(intent).await?;
        self.execute(plan).await
    }

    /// Compiles `intent` without changing the filter tables.
    ///
    /// Capability and IPv6 probes still run; they only read.
    ///
    /// # Errors
    ///
    /// Returns `Err` for invalid settings or intent arguments.
    pub async fn plan(&mut self, intent: Intent) -> Result<Plan> {
        let settings = load_validated(&self.store).await?;
        let flags = self.detector.feature_flags(self.executor.runner()).await;
        let ipv6 = if intent.touches_ipv6() {
            self.detector.probe_ipv6(self.executor.runner()).await
        } else {
            // Not consulted by any other compile function
            Ipv6State::Absent
        };

        let ctx = CompileContext::from_settings(&settings, flags, ipv6);
        let mut next = settings.clone();
        next.feature_flags = Some(flags);
        let mut app_update = None;

        let live = settings.enabled || !intent.needs_live_chains();
        let rules = self
            .compile(&intent, &ctx, &settings, &mut next, &mut app_update)
            .await?;
        let rules = if live {
            rules
        } else {
            info!(intent = ?intent.event_type(), "Firewall not enabled, recording preference only");
            RuleSet::new()
        };

        Ok(Plan {
            intent,
            flags,
            rules,
            next,
            app_update,
        })
    }

    async fn compile(
        &self,
        intent: &Intent,
        ctx: &CompileContext,
        settings: &Settings,
        next: &mut Settings,
        app_update: &mut Option<AppRule>,
    ) -> Result<RuleSet> {
        let rules = match intent {
            Intent::Boot => {
                let apps = match self.apps.rules().await {
                    Ok(apps) => apps,
                    Err(e) => {
                        warn!("App rules unavailable, booting without them: {e}");
                        Vec::new()
                    }
                };
                let mut observed = self.observed_networks();
                let current_subnet = observed.remove(&settings.lan_interface);
                // Fresh chains carry no tether rules, so every recorded interface is new
                let tethered = settings.state.tethered_interfaces.clone();
                observed.retain(|iface, _| tethered.contains(iface));

                next.state = NetworkSnapshot {
                    subnet: current_subnet,
                    tethered_interfaces: tethered.clone(),
                    tether_networks: observed.clone(),
                };
                next.services.captive_portal = false;
                next.enabled = true;

                let mut rules = compile_boot(
                    ctx,
                    &BootInputs {
                        previous_subnet: settings.state.subnet,
                        current_subnet,
                        services: &settings.services,
                        apps: &apps,
                    },
                );
                if !tethered.is_empty() {
                    info!(interfaces = ?tethered, "Restoring tethered interfaces");
                    rules.append(compile_tether_diff(ctx, &BTreeSet::new(), &tethered, &observed));
                }
                rules
            }

            Intent::Deactivate { release_ipv6 } => {
                next.state = NetworkSnapshot::default();
                next.services.captive_portal = false;
                next.enabled = false;

                let mut rules = compile_deactivate(ctx);
                if *release_ipv6 {
                    rules.append(compile_ipv6_release(ctx));
                }
                rules
            }

            Intent::ReleaseIpv6 => compile_ipv6_release(ctx),

            Intent::App {
                uid,
                feature,
                toggle,
            } => {
                let mut rule = self
                    .apps
                    .rules()
                    .await?
                    .into_iter()
                    .find(|r| r.uid == *uid)
                    .ok_or(AppRuleError::NotFound(*uid))?;

                if rule.is_enabled(*feature) == toggle.is_enable() {
                    info!("{feature} already {toggle}d for {}", rule.package_name);
                    return Ok(RuleSet::new());
                }
                rule.set_enabled(*feature, toggle.is_enable());
                let rules = compile_app_feature(ctx, &rule, *feature, *toggle);
                *app_update = Some(rule);
                rules
            }

            Intent::Service {
                service,
                toggle,
                uid,
            } => match service {
                Service::Adb | Service::Ssh => {
                    let (current, build): (bool, fn(&CompileContext, Toggle) -> RuleSet) =
                        if *service == Service::Adb {
                            next.services.adb = toggle.is_enable();
                            (settings.services.adb, compile_adb)
                        } else {
                            next.services.ssh = toggle.is_enable();
                            (settings.services.ssh, compile_ssh)
                        };
                    if current == toggle.is_enable() {
                        info!("{service} already {toggle}d");
                        RuleSet::new()
                    } else {
                        build(ctx, *toggle)
                    }
                }
                Service::Sip => sip_rules(ctx, settings.services.sip_uid, *uid, *toggle, next),
            },

            Intent::CaptivePortal {
                toggle,
                browser_uid,
            } => captive_rules(ctx, &settings.services, *browser_uid, *toggle, next),

            Intent::TetherChanged { interfaces } => {
                for iface in interfaces {
                    crate::validators::validate_interface(iface).map_err(|message| {
                        Error::Validation {
                            field: "interfaces".to_string(),
                            message: format!("{iface:?}: {message}"),
                        }
                    })?;
                }

                let before = &settings.state.tethered_interfaces;
                // Recorded networks for interfaces going away, observed ones for new
                let mut networks: BTreeMap<String, IpNetwork> = self
                    .observed_networks()
                    .into_iter()
                    .filter(|(iface, _)| !before.contains(iface))
                    .collect();
                networks.extend(
                    settings
                        .state
                        .tether_networks
                        .iter()
                        .filter(|(iface, _)| before.contains(*iface))
                        .map(|(iface, net)| (iface.clone(), *net)),
                );

                next.state.tethered_interfaces = interfaces.clone();
                next.state.tether_networks = interfaces
                    .iter()
                    .filter_map(|iface| networks.get(iface).map(|net| (iface.clone(), *net)))
                    .collect();

                compile_tether_diff(ctx, before, interfaces, &networks)
            }

            Intent::LanChanged { subnet } => {
                next.state.subnet = *subnet;
                compile_lan_diff(ctx, settings.state.subnet, *subnet)
            }
        };
        Ok(rules)
    }

    /// Applies a compiled plan
    ///
    /// # Errors
    ///
    /// See [`apply`](Self::apply).
    pub async fn execute(&mut self, plan: Plan) -> Result<Outcome> {
        if plan.intent == Intent::Boot {
            self.check_witness(&plan).await;
        }

        let report = match self.executor.apply(&plan.rules, &plan.flags).await {
            Ok(report) => report,
            Err(e) => {
                self.record(&AuditEvent::new(
                    plan.intent.event_type(),
                    false,
                    intent_details(&plan.intent),
                    Some(e.to_string()),
                ))
                .await;
                return Err(e);
            }
        };

        let lockdown = if plan.intent == Intent::Boot {
            Some(LockdownState::after_boot(
                &report,
                plan.next.init_script.present,
            )?)
        } else {
            None
        };
        if lockdown.is_some_and(LockdownState::is_fail_closed) {
            error!(
                execution_id = %report.id,
                "Lock chains were not released, all traffic stays blocked"
            );
        }

        let persisted = if report.is_success() {
            if let Some(rule) = plan.app_update.clone() {
                self.apps.upsert(rule).await?;
            }
            self.store.save(&plan.next).await?;
            true
        } else {
            warn!(
                execution_id = %report.id,
                hard_failures = report.hard_failures(),
                "Not persisting state after failed apply"
            );
            false
        };

        let mut details = intent_details(&plan.intent);
        if let Some(map) = details.as_object_mut() {
            map.insert("persisted".to_string(), persisted.into());
            if let Some(state) = lockdown {
                map.insert("lockdown".to_string(), state.to_string().into());
            }
        }
        self.record(&AuditEvent::from_report(
            plan.intent.event_type(),
            &report,
            details,
        ))
        .await;

        Ok(Outcome {
            report,
            lockdown,
            persisted,
        })
    }

    /// Probes capabilities again (or returns the cached flags) and stores them
    ///
    /// # Errors
    ///
    /// Returns `Err` when settings cannot be loaded or saved.
    pub async fn probe(&mut self, force: bool) -> Result<FeatureFlags> {
        let mut settings = load_validated(&self.store).await?;
        if force {
            self.detector.reprobe();
        }
        let flags = self.detector.feature_flags(self.executor.runner()).await;
        settings.feature_flags = Some(flags);
        self.store.save(&settings).await?;

        self.record(&AuditEvent::new(
            EventType::Probe,
            true,
            serde_json::to_value(flags).unwrap_or_default(),
            None,
        ))
        .await;
        Ok(flags)
    }

    /// Live lockdown state, IPv6 state and the stored snapshot
    ///
    /// # Errors
    ///
    /// Returns `Err` when settings cannot be loaded.
    pub async fn status(&mut self) -> Result<Status> {
        let settings = load_validated(&self.store).await?;
        let flags = settings.feature_flags.unwrap_or_default();
        let lockdown = lockdown::observe(&self.executor, &flags).await;
        let ipv6 = self.detector.probe_ipv6(self.executor.runner()).await;

        Ok(Status {
            enabled: settings.enabled,
            feature_flags: settings.feature_flags,
            ipv6,
            lockdown,
            state: settings.state,
        })
    }

    /// Current network of the configured LAN interface
    ///
    /// # Errors
    ///
    /// Returns `Err` when settings cannot be loaded.
    pub async fn observed_subnet(&self) -> Result<Option<IpNetwork>> {
        let settings = load_validated(&self.store).await?;
        Ok(self.observed_networks().remove(&settings.lan_interface))
    }

    fn observed_networks(&self) -> BTreeMap<String, IpNetwork> {
        self.networks.networks().unwrap_or_else(|e| {
            warn!("Could not enumerate interfaces: {e}");
            BTreeMap::new()
        })
    }

    async fn check_witness(&self, plan: &Plan) {
        if !plan.next.init_script.enforced {
            return;
        }
        if !self.executor.probe(&witness_check(), &plan.flags).await {
            warn!(
                "Init script is enforced but {} is missing; the device was not locked before boot",
                crate::core::compiler::OUTPUT_LOCK_CHAIN
            );
        }
    }

    async fn record(&self, event: &AuditEvent) {
        if let Some(audit) = &self.audit {
            audit.record(event).await;
        }
    }
}

fn intent_details(intent: &Intent) -> serde_json::Value {
    serde_json::to_value(intent).unwrap_or_default()
}

/// SIP directives for a stored client UID `stored` and a requested one
fn sip_rules(
    ctx: &CompileContext,
    stored: Option<u32>,
    requested: Option<u32>,
    toggle: Toggle,
    next: &mut Settings,
) -> RuleSet {
    match toggle {
        Toggle::Enable => {
            let Some(uid) = requested.or(stored) else {
                warn!("No SIP client UID configured, nothing to enable");
                return RuleSet::new();
            };
            next.services.sip_uid = Some(uid);
            match stored {
                Some(old) if old == uid => {
                    info!("SIP already enabled for UID {uid}");
                    RuleSet::new()
                }
                Some(old) => {
                    let mut rules = compile_sip(ctx, old, Toggle::Disable);
                    rules.append(compile_sip(ctx, uid, Toggle::Enable));
                    rules
                }
                None => compile_sip(ctx, uid, Toggle::Enable),
            }
        }
        Toggle::Disable => {
            next.services.sip_uid = None;
            stored.map_or_else(RuleSet::new, |old| compile_sip(ctx, old, Toggle::Disable))
        }
    }
}

/// Captive-portal directives; the stored browser UID is always the one installed
fn captive_rules(
    ctx: &CompileContext,
    services: &ServiceSettings,
    requested: Option<u32>,
    toggle: Toggle,
    next: &mut Settings,
) -> RuleSet {
    let stored = services.captive_browser_uid;
    match (toggle, services.captive_portal) {
        (Toggle::Enable, true) => match requested {
            Some(uid) if Some(uid) != stored => {
                info!("Moving captive-portal access to UID {uid}");
                next.services.captive_browser_uid = Some(uid);
                let mut rules = compile_captive_browser(ctx, stored, Toggle::Disable);
                rules.append(compile_captive_browser(ctx, Some(uid), Toggle::Enable));
                rules
            }
            _ => {
                info!("Captive portal already enabled");
                RuleSet::new()
            }
        },
        (Toggle::Enable, false) => {
            let uid = requested.or(stored);
            next.services.captive_browser_uid = uid;
            next.services.captive_portal = uid.is_some();
            compile_captive_browser(ctx, uid, Toggle::Enable)
        }
        (Toggle::Disable, true) => {
            next.services.captive_browser_uid = requested.or(stored);
            next.services.captive_portal = false;
            compile_captive_browser(ctx, stored, Toggle::Disable)
        }
        (Toggle::Disable, false) => {
            info!("Captive portal already disabled");
            next.services.captive_browser_uid = requested.or(stored);
            RuleSet::new()
        }
    }
}
