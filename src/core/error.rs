use thiserror::Error;

/// Core error types for proxywall
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The privileged command channel could not be obtained at all.
    ///
    /// Fatal for the current intent: no directive of the RuleSet was attempted.
    #[error("Privileged channel unavailable: {0}")]
    Channel(String),

    /// A single iptables invocation failed outside the executor
    #[error("iptables error: {message}")]
    Iptables {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Lockdown state machine was driven through an impossible transition
    #[error("Lockdown error: {0}")]
    Lockdown(#[from] LockdownError),

    /// App-rule provider failed
    #[error("App rules error: {0}")]
    AppRules(#[from] crate::core::apps::AppRuleError),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Lockdown-protocol errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockdownError {
    #[error("cannot apply {event} while {from}")]
    InvalidTransition { from: String, event: String },
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

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches iptables stderr against known patterns and returns a readable translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("you must be root") {
            return ErrorTranslation::new("Insufficient permissions to modify packet filter rules")
                .with_suggestion("Run proxywall as root or configure sudo/run0/pkexec")
                .with_suggestion("Set PROXYWALL_ELEVATION_METHOD to force an elevation method");
        }

        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("Another process is holding the xtables lock")
                .with_suggestion("Re-probe capabilities so commands are issued with --wait")
                .with_suggestion("Check for other firewall managers touching iptables");
        }

        if lower.contains("does a matching rule exist") || lower.contains("bad rule") {
            return ErrorTranslation::new("Rule not present in chain")
                .with_suggestion("Removing a rule that was never installed is harmless")
                .with_suggestion("Re-run boot to rebuild chains from scratch");
        }

        if lower.contains("chain already exists") {
            return ErrorTranslation::new("Chain already exists")
                .with_suggestion("Boot was already run on this device")
                .with_suggestion("Deactivate first if a clean rebuild is needed");
        }

        if lower.contains("too many links") || lower.contains("directory not empty") {
            return ErrorTranslation::new("Chain is still referenced or not empty")
                .with_suggestion("Jumps into the chain must be removed and the chain flushed before deletion");
        }

        if lower.contains("no chain/target/match by that name") {
            return ErrorTranslation::new("Chain, target or match module not found")
                .with_suggestion("The chain may not have been created yet")
                .with_suggestion("The kernel may lack the required xt_* module (owner, conntrack, comment)");
        }

        if lower.contains("can't initialize") && lower.contains("table") {
            return ErrorTranslation::new("Packet filter table unavailable")
                .with_suggestion("Check kernel modules: lsmod | grep ip_tables")
                .with_suggestion("The nat table requires iptable_nat");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Set engine.iptables in settings.json to the binary path")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)");
        }

        if lower.contains("unknown option") || lower.contains("bad argument") {
            return ErrorTranslation::new("iptables rejected an option")
                .with_suggestion("Re-probe capabilities: proxywall probe --force");
        }

        ErrorTranslation::new(format!("Packet filter error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Inspect current rules: iptables -S; iptables -t nat -S")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
