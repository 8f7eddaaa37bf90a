//! Default-deny lockdown protocol
//!
//! The init script installs `ow_OUTPUT_LOCK` and `ow_INPUT_LOCK` (each a
//! single REJECT) and jumps to them from OUTPUT and INPUT before any network
//! comes up. Boot configures the real chains behind that wall and only then
//! deletes the lock jumps. Teardown removes the real chains but never puts
//! the locks back; only the next init-script run does.
//!
//! ```text
//! Unconfigured --InitScriptRan--> Locked --BootStarted--> Configuring --LockReleased--> Committed
//!                                                              ^                           |
//!                                                              +-------BootStarted---------+
//! ```

use crate::core::capability::FeatureFlags;
use crate::core::compiler::{
    INPUT_CHAIN, INPUT_LOCK_CHAIN, OUTPUT_CHAIN, OUTPUT_LOCK_CHAIN, input_lock_release,
    output_lock_release,
};
use crate::core::directive::{Directive, MatchSpec, Table};
use crate::core::error::LockdownError;
use crate::core::executor::{CommandRunner, ExecutionReport, Executor};
use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum LockdownState {
    /// No lock chains and no proxywall chains
    #[default]
    Unconfigured,
    /// Lock jumps installed, nothing configured behind them
    Locked,
    /// Chains being built; the lock still rejects everything
    Configuring,
    /// Locks released, proxywall chains in force
    Committed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum LockdownEvent {
    InitScriptRan,
    BootStarted,
    LockReleased,
    TornDown,
}

impl LockdownState {
    /// # Errors
    ///
    /// Returns [`LockdownError::InvalidTransition`] when `event` cannot occur
    /// in this state, most importantly a lock release before configuration.
    pub fn next(self, event: LockdownEvent) -> Result<LockdownState, LockdownError> {
        use LockdownEvent as E;
        use LockdownState as S;

        match (self, event) {
            // A device boot wipes the kernel tables whatever came before
            (_, E::InitScriptRan) => Ok(S::Locked),
            (S::Unconfigured | S::Locked | S::Committed, E::BootStarted) => Ok(S::Configuring),
            (S::Configuring, E::LockReleased) => Ok(S::Committed),
            // Teardown leaves lock jumps that were never released in place
            (S::Locked | S::Configuring, E::TornDown) => Ok(S::Locked),
            (S::Unconfigured | S::Committed, E::TornDown) => Ok(S::Unconfigured),
            (from, event) => Err(LockdownError::InvalidTransition {
                from: from.to_string(),
                event: event.to_string(),
            }),
        }
    }

    /// State after applying a boot RuleSet, replayed through [`next`](Self::next).
    ///
    /// With lock chains installed, boot commits only if both lock-release
    /// directives were applied; otherwise the device stays behind the lock.
    /// Without lock chains the release directives are expected to fail and
    /// boot always commits.
    ///
    /// # Errors
    ///
    /// Returns [`LockdownError::InvalidTransition`] if the boot sequence is
    /// not accepted by the transition table.
    pub fn after_boot(
        report: &ExecutionReport,
        lock_installed: bool,
    ) -> Result<LockdownState, LockdownError> {
        let start = if lock_installed {
            LockdownState::Unconfigured.next(LockdownEvent::InitScriptRan)?
        } else {
            LockdownState::Unconfigured
        };
        let configuring = start.next(LockdownEvent::BootStarted)?;

        let released = !lock_installed
            || (report.applied(&output_lock_release()) && report.applied(&input_lock_release()));
        if released {
            configuring.next(LockdownEvent::LockReleased)
        } else {
            Ok(configuring)
        }
    }

    /// Whether every packet not explicitly allowed is still rejected
    pub fn is_fail_closed(self) -> bool {
        matches!(self, LockdownState::Locked | LockdownState::Configuring)
    }
}

/// Raw answers of the lockdown Check directives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockdownObservation {
    pub output_lock: bool,
    pub input_lock: bool,
    pub output_jump: bool,
    pub input_jump: bool,
    /// `ow_OUTPUT_LOCK` exists and rejects
    pub witness: bool,
}

impl LockdownObservation {
    pub fn state(&self) -> LockdownState {
        let locked = self.output_lock || self.input_lock;
        let configured = self.output_jump && self.input_jump;
        match (locked, configured) {
            (true, true) => LockdownState::Configuring,
            (true, false) => LockdownState::Locked,
            (false, true) => LockdownState::Committed,
            (false, false) => LockdownState::Unconfigured,
        }
    }
}

fn check_jump(from: &str, to: &str) -> Directive {
    Directive::check(Table::Filter, from, MatchSpec::new().jump(to))
}

/// `-C ow_OUTPUT_LOCK -j REJECT`, present once the init script has run
pub fn witness_check() -> Directive {
    check_jump(OUTPUT_LOCK_CHAIN, "REJECT")
}

/// Derives the lockdown state from the live filter tables
pub async fn observe<R: CommandRunner>(
    executor: &Executor<R>,
    flags: &FeatureFlags,
) -> LockdownObservation {
    let observation = LockdownObservation {
        output_lock: executor
            .probe(&check_jump("OUTPUT", OUTPUT_LOCK_CHAIN), flags)
            .await,
        input_lock: executor
            .probe(&check_jump("INPUT", INPUT_LOCK_CHAIN), flags)
            .await,
        output_jump: executor.probe(&check_jump("OUTPUT", OUTPUT_CHAIN), flags).await,
        input_jump: executor.probe(&check_jump("INPUT", INPUT_CHAIN), flags).await,
        witness: executor.probe(&witness_check(), flags).await,
    };
    tracing::debug!(?observation, state = %observation.state(), "Observed lockdown");
    observation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::directive::RuleSet;
    use crate::core::test_helpers::MockRunner;

    #[test]
    fn test_full_lifecycle() {
        let state = LockdownState::Unconfigured
            .next(LockdownEvent::InitScriptRan)
            .and_then(|s| s.next(LockdownEvent::BootStarted))
            .and_then(|s| s.next(LockdownEvent::LockReleased))
            .unwrap();
        assert_eq!(state, LockdownState::Committed);
        assert_eq!(
            state.next(LockdownEvent::TornDown).unwrap(),
            LockdownState::Unconfigured
        );
    }

    #[test]
    fn test_release_requires_configuring() {
        for from in [
            LockdownState::Unconfigured,
            LockdownState::Locked,
            LockdownState::Committed,
        ] {
            let err = from.next(LockdownEvent::LockReleased).unwrap_err();
            assert!(err.to_string().contains("lock-released"));
        }
    }

    #[test]
    fn test_teardown_never_unlocks() {
        assert_eq!(
            LockdownState::Configuring
                .next(LockdownEvent::TornDown)
                .unwrap(),
            LockdownState::Locked
        );
        assert!(LockdownState::Locked.is_fail_closed());
        assert!(!LockdownState::Committed.is_fail_closed());
    }

    #[test]
    fn test_observation_states() {
        let mut obs = LockdownObservation::default();
        assert_eq!(obs.state(), LockdownState::Unconfigured);
        obs.output_lock = true;
        assert_eq!(obs.state(), LockdownState::Locked);
        obs.output_jump = true;
        obs.input_jump = true;
        assert_eq!(obs.state(), LockdownState::Configuring);
        obs.output_lock = false;
        assert_eq!(obs.state(), LockdownState::Committed);
    }

    #[tokio::test]
    async fn test_after_boot_requires_both_releases() {
        let flags = FeatureFlags::default();
        let rules: RuleSet = [output_lock_release(), input_lock_release()]
            .into_iter()
            .collect();

        let runner = MockRunner::new();
        let executor = Executor::new(runner, "iptables", "ip6tables");
        let report = executor.apply(&rules, &flags).await.unwrap();
        assert_eq!(LockdownState::after_boot(&report, true).unwrap(), LockdownState::Committed);

        let runner = MockRunner::new().fail_when(|args| args.iter().any(|a| a == INPUT_LOCK_CHAIN));
        let executor = Executor::new(runner, "iptables", "ip6tables");
        let report = executor.apply(&rules, &flags).await.unwrap();
        assert_eq!(LockdownState::after_boot(&report, true).unwrap(), LockdownState::Configuring);
        assert_eq!(LockdownState::after_boot(&report, false).unwrap(), LockdownState::Committed);
    }

    #[tokio::test]
    async fn test_observe_uses_check_directives() {
        let runner = MockRunner::new().fail_when(|args| {
            args.iter()
                .any(|a| a == OUTPUT_LOCK_CHAIN || a == INPUT_LOCK_CHAIN)
        });
        let executor = Executor::new(runner, "iptables", "ip6tables");
        let obs = observe(&executor, &FeatureFlags::default()).await;

        assert_eq!(obs.state(), LockdownState::Committed);
        assert!(!obs.witness);
        let lines = executor.runner().lines();
        assert_eq!(lines.len(), 5);
        assert!(lines.iter().all(|l| l.contains(" -C ")));
        assert_eq!(lines[4], "iptables -t filter -C ow_OUTPUT_LOCK -j REJECT");
    }
}
