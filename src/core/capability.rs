//! Capability detection for the packet-filter engine
//!
//! Optional engine features are probed once and cached. A probe that fails for
//! any reason, non-zero exit or a binary that cannot be started, means the
//! feature is treated as absent. Probe errors are never propagated.

use crate::core::executor::CommandRunner;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Optional iptables features.
///
/// Passed explicitly to the compiler and renderer; there is no global copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// `-m comment --comment` is accepted
    pub supports_comment: bool,
    /// `-w` (wait for the xtables lock) is accepted
    pub supports_wait: bool,
}

/// State of the IPv6 filter engine
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
)]
#[serde(rename_all = "snake_case")]
pub enum Ipv6State {
    /// No ip6tables binary on this device
    #[strum(serialize = "absent")]
    Absent,
    /// ip6tables present, IPv6 not yet rejected
    #[default]
    #[strum(serialize = "open")]
    Open,
    /// ip6tables already rejects on INPUT
    #[strum(serialize = "locked")]
    Locked,
}

/// Probes and caches engine capabilities
#[derive(Debug, Clone)]
pub struct CapabilityDetector {
    iptables: String,
    ip6tables: String,
    cached: Option<FeatureFlags>,
}

impl CapabilityDetector {
    pub fn new(iptables: impl Into<String>, ip6tables: impl Into<String>) -> Self {
        Self {
            iptables: iptables.into(),
            ip6tables: ip6tables.into(),
            cached: None,
        }
    }

    /// Seeds the cache, typically with flags persisted by an earlier run
    pub fn with_cached(mut self, flags: Option<FeatureFlags>) -> Self {
        self.cached = flags;
        self
    }

    pub fn cached(&self) -> Option<FeatureFlags> {
        self.cached
    }

    /// `iptables -m comment --help` exits 0 when the comment match is available
    pub async fn detect_comment_support<R: CommandRunner>(&self, runner: &R) -> bool {
        self.probe(runner, &self.iptables, &["-m", "comment", "--help"])
            .await
    }

    /// `iptables -w -n -L OUTPUT` exits 0 when `--wait` is understood
    pub async fn detect_wait_support<R: CommandRunner>(&self, runner: &R) -> bool {
        self.probe(runner, &self.iptables, &["-w", "-n", "-L", "OUTPUT"])
            .await
    }

    /// Returns cached flags, probing only on the first call
    pub async fn feature_flags<R: CommandRunner>(&mut self, runner: &R) -> FeatureFlags {
        if let Some(flags) = self.cached {
            return flags;
        }

        let flags = FeatureFlags {
            supports_comment: self.detect_comment_support(runner).await,
            supports_wait: self.detect_wait_support(runner).await,
        };
        info!(
            supports_comment = flags.supports_comment,
            supports_wait = flags.supports_wait,
            "Probed iptables capabilities"
        );
        self.cached = Some(flags);
        flags
    }

    /// Determines whether IPv6 needs locking down.
    ///
    /// Not cached: the answer changes as soon as the boot lockdown runs.
    pub async fn probe_ipv6<R: CommandRunner>(&self, runner: &R) -> Ipv6State {
        if !runner.program_exists(&self.ip6tables) {
            debug!("{} not found, IPv6 engine absent", self.ip6tables);
            return Ipv6State::Absent;
        }

        if self
            .probe(runner, &self.ip6tables, &["-C", "INPUT", "-j", "REJECT"])
            .await
        {
            Ipv6State::Locked
        } else {
            Ipv6State::Open
        }
    }

    /// Forgets cached flags so the next [`feature_flags`](Self::feature_flags) call probes again
    pub fn reprobe(&mut self) {
        self.cached = None;
    }

    async fn probe<R: CommandRunner>(&self, runner: &R, program: &str, args: &[&str]) -> bool {
        let args: Vec<String> = args.iter().map(|a| (*a).to_string()).collect();
        match runner.run(program, &args).await {
            Ok(output) => {
                debug!("{program} {} -> {:?}", args.join(" "), output.status);
                output.success()
            }
            Err(e) => {
                debug!("{program} {} could not run: {e}", args.join(" "));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::MockRunner;

    #[tokio::test]
    async fn test_probes_success_means_supported() {
        let runner = MockRunner::new();
        let mut detector = CapabilityDetector::new("iptables", "ip6tables");

        let flags = detector.feature_flags(&runner).await;
        assert!(flags.supports_comment);
        assert!(flags.supports_wait);
        assert_eq!(
            runner.calls(),
            vec![
                ("iptables".to_string(), vec!["-m".into(), "comment".into(), "--help".into()]),
                (
                    "iptables".to_string(),
                    vec!["-w".into(), "-n".into(), "-L".into(), "OUTPUT".into()]
                ),
            ]
        );
    }

    #[tokio::test]
    async fn test_probe_failure_means_unsupported() {
        let runner = MockRunner::new().fail_when(|args| args.iter().any(|a| a == "comment"));
        let detector = CapabilityDetector::new("iptables", "ip6tables");

        assert!(!detector.detect_comment_support(&runner).await);
        assert!(detector.detect_wait_support(&runner).await);
    }

    #[tokio::test]
    async fn test_spawn_failure_means_unsupported() {
        let runner = MockRunner::new().spawn_fail_when(|_| true);
        let detector = CapabilityDetector::new("iptables", "ip6tables");

        assert!(!detector.detect_wait_support(&runner).await);
    }

    #[tokio::test]
    async fn test_flags_are_cached_until_reprobe() {
        let runner = MockRunner::new();
        let mut detector = CapabilityDetector::new("iptables", "ip6tables");

        detector.feature_flags(&runner).await;
        detector.feature_flags(&runner).await;
        assert_eq!(runner.calls().len(), 2);

        detector.reprobe();
        detector.feature_flags(&runner).await;
        assert_eq!(runner.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_seeded_cache_skips_probing() {
        let runner = MockRunner::new();
        let seeded = FeatureFlags {
            supports_comment: false,
            supports_wait: true,
        };
        let mut detector = CapabilityDetector::new("iptables", "ip6tables").with_cached(Some(seeded));

        assert_eq!(detector.feature_flags(&runner).await, seeded);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_ipv6_states() {
        let detector = CapabilityDetector::new("iptables", "ip6tables");

        let absent = MockRunner::new().missing_program("ip6tables");
        assert_eq!(detector.probe_ipv6(&absent).await, Ipv6State::Absent);
        assert!(absent.calls().is_empty());

        let locked = MockRunner::new();
        assert_eq!(detector.probe_ipv6(&locked).await, Ipv6State::Locked);

        let open = MockRunner::new().fail_when(|args| args.iter().any(|a| a == "-C"));
        assert_eq!(detector.probe_ipv6(&open).await, Ipv6State::Open);
    }
}
