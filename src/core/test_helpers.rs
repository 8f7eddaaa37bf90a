//! Shared test utilities for core module tests
//!
//! This module is only compiled in test mode.

use crate::core::executor::{CommandOutput, CommandRunner, RunnerError};
use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("PROXYWALL_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("PROXYWALL_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

type Predicate = Box<dyn Fn(&[String]) -> bool + Send + Sync>;

/// Recording command runner.
///
/// Every invocation is recorded as `(program, args)`. By default every command
/// exits 0; predicates make selected commands exit 1 or fail to spawn.
pub struct MockRunner {
    calls: Mutex<Vec<(String, Vec<String>)>>,
    channel_checks: Mutex<Vec<String>>,
    fail: Option<Predicate>,
    spawn_fail: Option<Predicate>,
    channel: bool,
    missing: Vec<String>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            channel_checks: Mutex::new(Vec::new()),
            fail: None,
            spawn_fail: None,
            channel: true,
            missing: Vec::new(),
        }
    }

    /// Commands matching `predicate` exit with status 1
    pub fn fail_when(mut self, predicate: impl Fn(&[String]) -> bool + Send + Sync + 'static) -> Self {
        self.fail = Some(Box::new(predicate));
        self
    }

    /// Commands matching `predicate` fail to spawn
    pub fn spawn_fail_when(
        mut self,
        predicate: impl Fn(&[String]) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.spawn_fail = Some(Box::new(predicate));
        self
    }

    /// `ensure_channel` fails
    pub fn without_channel(mut self) -> Self {
        self.channel = false;
        self
    }

    /// `program_exists` reports `program` as missing
    pub fn missing_program(mut self, program: &str) -> Self {
        self.missing.push(program.to_string());
        self
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    /// Programs passed to `ensure_channel`, in order
    pub fn channel_checks(&self) -> Vec<String> {
        self.channel_checks.lock().unwrap().clone()
    }

    /// Recorded calls joined into `program arg arg ...` lines
    pub fn lines(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|(program, args)| format!("{program} {}", args.join(" ")))
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRunner")
            .field("calls", &self.calls.lock().map(|c| c.len()).unwrap_or_default())
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl CommandRunner for MockRunner {
    async fn ensure_channel(&self, program: &str) -> Result<(), RunnerError> {
        self.channel_checks.lock().unwrap().push(program.to_string());
        if self.channel {
            Ok(())
        } else {
            Err(RunnerError::Denied {
                program: program.to_string(),
                status: Some(1),
                stderr: "authentication failed".to_string(),
            })
        }
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, RunnerError> {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));

        if self.spawn_fail.as_ref().is_some_and(|p| p(args)) {
            return Err(RunnerError::Spawn {
                program: program.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "mock spawn failure"),
            });
        }

        if self.fail.as_ref().is_some_and(|p| p(args)) {
            return Ok(CommandOutput {
                status: Some(1),
                stdout: String::new(),
                stderr: "iptables: Bad rule (does a matching rule exist in that chain?).".to_string(),
            });
        }

        Ok(CommandOutput {
            status: Some(0),
            ..CommandOutput::default()
        })
    }

    fn program_exists(&self, program: &str) -> bool {
        !self.missing.iter().any(|m| m == program)
    }
}

/// Settings with a proxy UID and no persisted network state
pub fn proxied_settings() -> crate::config::Settings {
    let mut settings = crate::config::Settings::default();
    settings.proxy.uid = Some(10_123);
    settings
}

/// A small ordered set of app rules covering every per-app flag
pub fn sample_app_rules() -> Vec<crate::core::apps::AppRule> {
    use crate::core::apps::AppRule;
    vec![
        AppRule {
            uid: 10_200,
            package_name: "org.example.browser".to_string(),
            nat_enabled: true,
            bypass_enabled: false,
            localhost_enabled: true,
            lan_enabled: false,
        },
        AppRule {
            uid: 10_201,
            package_name: "org.example.updater".to_string(),
            nat_enabled: false,
            bypass_enabled: true,
            localhost_enabled: false,
            lan_enabled: true,
        },
    ]
}
