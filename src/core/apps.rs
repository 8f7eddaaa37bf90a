//! Per-application routing rules
//!
//! An [`AppRule`] says how one application UID is treated: redirected through
//! the proxy (NAT), allowed around it (bypass), or given loopback/LAN access.
//! Rules are owned by an [`AppRuleProvider`]; boot consumes them once, in the
//! order the provider yields them.
//!
//! [`JsonAppRuleProvider`] keeps the rules in `<data dir>/apps.json` next to a
//! `.sha256` checksum. A checksum mismatch is logged and the file is still
//! used, since hand edits are expected.

use crate::utils::get_data_dir;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Upper bound on stored rules, guards against runaway files
pub const MAX_APP_RULES: usize = 4096;

/// Error type for app-rule operations
#[derive(Debug, thiserror::Error)]
pub enum AppRuleError {
    #[error("Invalid package name '{name}': {reason}")]
    InvalidPackage { name: String, reason: String },

    #[error("Duplicate rule for UID {0}")]
    DuplicateUid(u32),

    #[error("No rule for UID {0}")]
    NotFound(u32),

    #[error("Too many app rules ({0}, max {max})", max = MAX_APP_RULES)]
    TooMany(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Data directory not available")]
    DataDirUnavailable,
}

/// Routing rule for one application UID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRule {
    pub uid: u32,
    pub package_name: String,
    /// Redirect TCP and DNS through the proxy
    #[serde(default)]
    pub nat_enabled: bool,
    /// Accept all traffic, bypassing the proxy
    #[serde(default)]
    pub bypass_enabled: bool,
    /// Allow loopback traffic
    #[serde(default)]
    pub localhost_enabled: bool,
    /// Allow LAN traffic
    #[serde(default)]
    pub lan_enabled: bool,
}

impl AppRule {
    pub fn new(uid: u32, package_name: impl Into<String>) -> Self {
        Self {
            uid,
            package_name: package_name.into(),
            nat_enabled: false,
            bypass_enabled: false,
            localhost_enabled: false,
            lan_enabled: false,
        }
    }

    pub fn is_enabled(&self, feature: AppFeature) -> bool {
        match feature {
            AppFeature::Nat => self.nat_enabled,
            AppFeature::Bypass => self.bypass_enabled,
            AppFeature::Localhost => self.localhost_enabled,
            AppFeature::Lan => self.lan_enabled,
        }
    }

    pub fn set_enabled(&mut self, feature: AppFeature, enabled: bool) {
        match feature {
            AppFeature::Nat => self.nat_enabled = enabled,
            AppFeature::Bypass => self.bypass_enabled = enabled,
            AppFeature::Localhost => self.localhost_enabled = enabled,
            AppFeature::Lan => self.lan_enabled = enabled,
        }
    }

    /// Features switched on, in compile order
    pub fn enabled_features(&self) -> impl Iterator<Item = AppFeature> + '_ {
        AppFeature::ALL.into_iter().filter(|f| self.is_enabled(*f))
    }

    /// # Errors
    ///
    /// Returns `Err` if the package name or UID is malformed.
    pub fn validate(&self) -> Result<(), AppRuleError> {
        let invalid = |reason: String| AppRuleError::InvalidPackage {
            name: self.package_name.clone(),
            reason,
        };
        crate::validators::validate_package_name(&self.package_name).map_err(invalid)?;
        crate::validators::validate_uid(self.uid).map_err(invalid)?;
        Ok(())
    }
}

/// One switchable per-app treatment
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AppFeature {
    Nat,
    Bypass,
    Localhost,
    Lan,
}

impl AppFeature {
    pub const ALL: [AppFeature; 4] = [
        AppFeature::Nat,
        AppFeature::Bypass,
        AppFeature::Localhost,
        AppFeature::Lan,
    ];
}

/// The app-rule collaborator
#[allow(async_fn_in_trait)]
pub trait AppRuleProvider {
    /// All rules, in the order boot compiles them
    async fn rules(&self) -> Result<Vec<AppRule>, AppRuleError>;

    /// Replaces the rule with the same UID, or adds it
    async fn upsert(&self, rule: AppRule) -> Result<(), AppRuleError>;
}

/// App rules stored as a JSON array
#[derive(Debug, Clone)]
pub struct JsonAppRuleProvider {
    path: PathBuf,
}

impl JsonAppRuleProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/apps.json`
    ///
    /// # Errors
    ///
    /// Returns `Err` when no data directory can be determined.
    pub fn default_location() -> Result<Self, AppRuleError> {
        let mut path = get_data_dir().ok_or(AppRuleError::DataDirUnavailable)?;
        path.push("apps.json");
        Ok(Self { path })
    }

    fn checksum_path(&self) -> PathBuf {
        let mut path = self.path.clone();
        path.set_extension("json.sha256");
        path
    }

    async fn save(&self, rules: &[AppRule]) -> Result<(), AppRuleError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(rules)?;
        crate::utils::write_atomic(&self.path, json.as_bytes()).await?;
        tokio::fs::write(self.checksum_path(), checksum(&json)).await?;
        Ok(())
    }
}

fn checksum(json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl AppRuleProvider for JsonAppRuleProvider {
    async fn rules(&self) -> Result<Vec<AppRule>, AppRuleError> {
        let json = match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        if let Ok(expected) = tokio::fs::read_to_string(self.checksum_path()).await {
            let actual = checksum(&json);
            if expected.trim() != actual {
                tracing::warn!(
                    "App rules checksum mismatch (expected: {}, got: {})",
                    expected.trim(),
                    actual
                );
            }
        }

        let rules: Vec<AppRule> = serde_json::from_str(&json)?;
        if rules.len() > MAX_APP_RULES {
            return Err(AppRuleError::TooMany(rules.len()));
        }

        let mut seen = std::collections::HashSet::new();
        for rule in &rules {
            rule.validate()?;
            if !seen.insert(rule.uid) {
                return Err(AppRuleError::DuplicateUid(rule.uid));
            }
        }

        Ok(rules)
    }

    async fn upsert(&self, rule: AppRule) -> Result<(), AppRuleError> {
        rule.validate()?;
        let mut rules = self.rules().await?;
        match rules.iter_mut().find(|r| r.uid == rule.uid) {
            Some(existing) => *existing = rule,
            None => {
                if rules.len() >= MAX_APP_RULES {
                    return Err(AppRuleError::TooMany(rules.len() + 1));
                }
                rules.push(rule);
            }
        }
        self.save(&rules).await
    }
}

/// Fixed rule list, for dry runs and tests
#[derive(Debug, Default)]
pub struct StaticAppRules {
    rules: std::sync::Mutex<Vec<AppRule>>,
}

impl StaticAppRules {
    pub fn new(rules: Vec<AppRule>) -> Self {
        Self {
            rules: std::sync::Mutex::new(rules),
        }
    }
}

impl AppRuleProvider for StaticAppRules {
    async fn rules(&self) -> Result<Vec<AppRule>, AppRuleError> {
        Ok(self
            .rules
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone()))
    }

    async fn upsert(&self, rule: AppRule) -> Result<(), AppRuleError> {
        let mut rules = self
            .rules
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match rules.iter_mut().find(|r| r.uid == rule.uid) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }
        Ok(())
    }
}
