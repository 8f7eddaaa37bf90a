//! Rule execution against the packet-filter engine
//!
//! The [`Executor`] runs a [`RuleSet`] one directive at a time, in order, over a
//! single [`CommandRunner`]. A failing directive is logged and recorded, and
//! execution continues with the next one. Only an unavailable privileged
//! channel aborts an apply, and that is detected before the first directive.

use crate::core::capability::FeatureFlags;
use crate::core::directive::{Directive, Family, RuleSet};
use crate::core::error::{Error, IptablesErrorPattern, Result};
use crate::elevation::ElevationError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::process::Stdio;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Raw result of one external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Failure to run a command at all (as opposed to a non-zero exit)
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("privilege elevation failed: {0}")]
    Elevation(#[from] ElevationError),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The elevated check command ran but was refused
    #[error("{program} could not be run with privileges (status {status:?}): {stderr}")]
    Denied {
        program: String,
        status: Option<i32>,
        stderr: String,
    },
}

/// The privileged command channel
#[allow(async_fn_in_trait)]
pub trait CommandRunner {
    /// Verifies that privileged commands can be issued at all.
    ///
    /// Called once per apply, before the first directive, with the binary
    /// that directive runs. Any authentication happens here.
    async fn ensure_channel(&self, program: &str) -> std::result::Result<(), RunnerError>;

    /// Runs `program` with `args`, no shell involved
    async fn run(&self, program: &str, args: &[String])
    -> std::result::Result<CommandOutput, RunnerError>;

    /// Whether `program` can be located on this system
    fn program_exists(&self, program: &str) -> bool {
        crate::elevation::binary_exists(program)
    }
}

/// Runs iptables/ip6tables through the elevation layer using `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    /// Runs `<program> -n -L OUTPUT` through the elevation prefix.
    ///
    /// stdin is inherited so sudo can prompt once; its cached credentials then
    /// cover the directives that follow.
    async fn ensure_channel(&self, program: &str) -> std::result::Result<(), RunnerError> {
        let args = ["-n", "-L", "OUTPUT"].map(String::from);
        let mut cmd = crate::elevation::create_elevated_filter_command(program, &args)?;
        let output = cmd
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| RunnerError::Spawn {
                program: program.to_string(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(RunnerError::Denied {
                program: program.to_string(),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn run(
        &self,
        program: &str,
        args: &[String],
    ) -> std::result::Result<CommandOutput, RunnerError> {
        let mut cmd = crate::elevation::create_elevated_filter_command(program, args)?;
        let output = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| RunnerError::Spawn {
                program: program.to_string(),
                source,
            })?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Why a single directive did not take effect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DirectiveFailure {
    /// The engine ran and rejected the directive
    #[error("exited with status {code:?}: {stderr}")]
    ExitStatus { code: Option<i32>, stderr: String },

    /// The engine could not be started
    #[error("could not be started: {0}")]
    Spawn(String),
}

/// Outcome of one directive within an apply
#[derive(Debug, Clone)]
pub struct DirectiveResult {
    pub directive: Directive,
    pub outcome: std::result::Result<(), DirectiveFailure>,
}

impl DirectiveResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Failed removals are soft: the rule or chain may simply not exist
    pub fn is_soft_failure(&self) -> bool {
        self.outcome.is_err() && self.directive.action().is_removal()
    }

    pub fn is_hard_failure(&self) -> bool {
        self.outcome.is_err() && !self.directive.action().is_removal()
    }
}

/// Aggregated result of applying one RuleSet
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fingerprint: String,
    pub results: Vec<DirectiveResult>,
}

impl ExecutionReport {
    fn start(fingerprint: String, capacity: usize) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            fingerprint,
            results: Vec::with_capacity(capacity),
        }
    }

    pub fn attempted(&self) -> usize {
        self.results.len()
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &DirectiveResult> {
        self.results.iter().filter(|r| !r.is_ok())
    }

    pub fn soft_failures(&self) -> usize {
        self.results.iter().filter(|r| r.is_soft_failure()).count()
    }

    pub fn hard_failures(&self) -> usize {
        self.results.iter().filter(|r| r.is_hard_failure()).count()
    }

    /// True when every non-removal directive took effect
    pub fn is_success(&self) -> bool {
        self.hard_failures() == 0
    }

    /// Whether a directive equal to `directive` was applied successfully
    pub fn applied(&self, directive: &Directive) -> bool {
        self.results
            .iter()
            .any(|r| r.is_ok() && &r.directive == directive)
    }

    /// One line per failed directive, for audit records and CLI output
    pub fn failure_summary(&self) -> Vec<String> {
        self.failures()
            .map(|r| match &r.outcome {
                Err(failure) => format!("{}: {failure}", r.directive),
                Ok(()) => r.directive.to_string(),
            })
            .collect()
    }
}

/// Sequential directive executor bound to one command channel
#[derive(Debug)]
pub struct Executor<R> {
    runner: R,
    iptables: String,
    ip6tables: String,
}

impl<R: CommandRunner> Executor<R> {
    pub fn new(runner: R, iptables: impl Into<String>, ip6tables: impl Into<String>) -> Self {
        Self {
            runner,
            iptables: iptables.into(),
            ip6tables: ip6tables.into(),
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn program(&self, family: Family) -> &str {
        match family {
            Family::Ipv4 => &self.iptables,
            Family::Ipv6 => &self.ip6tables,
        }
    }

    /// Applies every directive of `rules` in order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Channel`] when the privileged channel is unavailable.
    /// Nothing has been applied in that case. Individual directive failures are
    /// never errors; they are recorded in the returned report.
    pub async fn apply(&self, rules: &RuleSet, flags: &FeatureFlags) -> Result<ExecutionReport> {
        let fingerprint = rules.fingerprint(flags);

        if rules.is_empty() {
            debug!("Empty rule set, nothing to apply");
            return Ok(ExecutionReport::start(fingerprint, 0));
        }

        let program = rules
            .iter()
            .next()
            .map_or(self.iptables.as_str(), |first| self.program(first.family()));
        self.runner.ensure_channel(program).await.map_err(|e| {
            error!("Privileged channel unavailable: {e}");
            Error::Channel(e.to_string())
        })?;

        let mut report = ExecutionReport::start(fingerprint, rules.len());
        info!(
            execution_id = %report.id,
            directives = rules.len(),
            fingerprint = %report.fingerprint,
            "Applying rule set"
        );

        for directive in rules {
            let outcome = self.run_directive(directive, flags).await;
            if let Err(failure) = &outcome {
                log_failure(directive, failure);
            }
            report.results.push(DirectiveResult {
                directive: directive.clone(),
                outcome,
            });
        }

        report.finished_at = Utc::now();
        if report.is_success() {
            info!(
                execution_id = %report.id,
                succeeded = report.succeeded(),
                soft_failures = report.soft_failures(),
                "Rule set applied"
            );
        } else {
            warn!(
                execution_id = %report.id,
                succeeded = report.succeeded(),
                hard_failures = report.hard_failures(),
                soft_failures = report.soft_failures(),
                "Rule set applied with failures"
            );
        }

        Ok(report)
    }

    /// Runs a single directive without logging failures above debug level.
    ///
    /// Used for `-C` checks, where a non-zero exit is an answer, not an error.
    pub async fn probe(&self, directive: &Directive, flags: &FeatureFlags) -> bool {
        match self.run_directive(directive, flags).await {
            Ok(()) => true,
            Err(failure) => {
                debug!("Probe {directive} negative: {failure}");
                false
            }
        }
    }

    async fn run_directive(
        &self,
        directive: &Directive,
        flags: &FeatureFlags,
    ) -> std::result::Result<(), DirectiveFailure> {
        let program = self.program(directive.family());
        let args = directive.to_args(flags);
        debug!("{program} {}", args.join(" "));

        match self.runner.run(program, &args).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(DirectiveFailure::ExitStatus {
                code: output.status,
                stderr: output.stderr.trim().to_string(),
            }),
            Err(e) => Err(DirectiveFailure::Spawn(e.to_string())),
        }
    }
}

fn log_failure(directive: &Directive, failure: &DirectiveFailure) {
    let hint = match failure {
        DirectiveFailure::ExitStatus { stderr, .. } => {
            IptablesErrorPattern::match_error(stderr).user_message
        }
        DirectiveFailure::Spawn(msg) => IptablesErrorPattern::match_error(msg).user_message,
    };

    if directive.action().is_removal() {
        warn!(
            family = %directive.family(),
            table = %directive.table(),
            chain = directive.chain(),
            action = %directive.action(),
            spec = %directive.spec(),
            "Removal directive failed ({hint}): {failure}"
        );
    } else {
        error!(
            family = %directive.family(),
            table = %directive.table(),
            chain = directive.chain(),
            action = %directive.action(),
            spec = %directive.spec(),
            "Directive failed ({hint}): {failure}"
        );
    }
}
