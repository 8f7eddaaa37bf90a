//! Persisted settings
//!
//! Everything proxywall remembers between invocations lives in one JSON file,
//! `<data dir>/settings.json`: proxy identity and ports, filter binaries,
//! per-service toggles, the cached [`FeatureFlags`] and the [`NetworkSnapshot`]
//! the installed rules were compiled against.

use crate::core::capability::FeatureFlags;
use crate::core::reconcile::NetworkSnapshot;
use crate::utils::get_data_dir;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;

/// Default transparent-proxy port
pub const DEFAULT_TRANSPARENT_PORT: u16 = 9040;
/// Default DNS-proxy port
pub const DEFAULT_DNS_PORT: u16 = 5400;
/// Default directory port the proxy must reach
pub const DEFAULT_DIRECTORY_PORT: u16 = 9030;

/// The designated proxy process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// UID the proxy runs as; proxy-specific directives are skipped without it
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default = "default_transparent_port")]
    pub transparent_port: u16,
    #[serde(default = "default_dns_port")]
    pub dns_port: u16,
    #[serde(default = "default_directory_port")]
    pub directory_port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            uid: None,
            transparent_port: DEFAULT_TRANSPARENT_PORT,
            dns_port: DEFAULT_DNS_PORT,
            directory_port: DEFAULT_DIRECTORY_PORT,
        }
    }
}

/// Traffic-accounting chains owned by another component.
///
/// When configured, boot detaches `<chain>` from OUTPUT/INPUT and routes
/// accepted traffic through wrapper chains that jump to it; teardown restores
/// the direct jump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountingChains {
    #[serde(default = "default_accounting_output")]
    pub output: String,
    #[serde(default = "default_accounting_input")]
    pub input: String,
}

impl Default for AccountingChains {
    fn default() -> Self {
        Self {
            output: default_accounting_output(),
            input: default_accounting_input(),
        }
    }
}

/// Filter engine binaries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_iptables")]
    pub iptables: String,
    #[serde(default = "default_ip6tables")]
    pub ip6tables: String,
    /// Optional accounting integration, off by default
    #[serde(default)]
    pub accounting: Option<AccountingChains>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            iptables: default_iptables(),
            ip6tables: default_ip6tables(),
            accounting: None,
        }
    }
}

/// Stored per-service preferences
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSettings {
    #[serde(default)]
    pub adb: bool,
    #[serde(default)]
    pub ssh: bool,
    /// UID of the SIP client to exempt, if any
    #[serde(default)]
    pub sip_uid: Option<u32>,
    /// UID of the browser used for captive-portal sign-in
    #[serde(default)]
    pub captive_browser_uid: Option<u32>,
    /// Whether captive-portal probing is currently widened
    #[serde(default)]
    pub captive_portal: bool,
}

/// What the boot-time init-script installer reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitScriptStatus {
    /// The lock script is installed
    #[serde(default)]
    pub present: bool,
    /// The lock script runs on every boot
    #[serde(default)]
    pub enforced: bool,
}

/// Complete persisted settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub services: ServiceSettings,
    /// Interface whose subnet is exempted as LAN
    #[serde(default = "default_lan_interface")]
    pub lan_interface: String,
    /// Network state the installed rules were compiled against
    #[serde(default)]
    pub state: NetworkSnapshot,
    /// Cached probe results, cleared by `probe --force`
    #[serde(default)]
    pub feature_flags: Option<FeatureFlags>,
    #[serde(default)]
    pub init_script: InitScriptStatus,
    /// Boot has been applied and not torn down since
    #[serde(default)]
    pub enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            engine: EngineConfig::default(),
            services: ServiceSettings::default(),
            lan_interface: default_lan_interface(),
            state: NetworkSnapshot::default(),
            feature_flags: None,
            init_script: InitScriptStatus::default(),
            enabled: false,
        }
    }
}

impl Settings {
    /// Checks values that would otherwise produce malformed directives.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::Error::Validation`] naming the offending field.
    pub fn validate(&self) -> crate::Result<()> {
        use crate::validators::{validate_interface, validate_proxy_ports, validate_uid};

        let invalid = |field: &str, message: String| crate::Error::Validation {
            field: field.to_string(),
            message,
        };

        validate_proxy_ports(
            self.proxy.transparent_port,
            self.proxy.dns_port,
            self.proxy.directory_port,
        )
        .map_err(|m| invalid("proxy", m))?;

        for (field, uid) in [
            ("proxy.uid", self.proxy.uid),
            ("services.sip_uid", self.services.sip_uid),
            ("services.captive_browser_uid", self.services.captive_browser_uid),
        ] {
            if let Some(uid) = uid {
                validate_uid(uid).map_err(|m| invalid(field, m))?;
            }
        }

        validate_interface(&self.lan_interface).map_err(|m| invalid("lan_interface", m))?;
        for iface in &self.state.tethered_interfaces {
            validate_interface(iface).map_err(|m| invalid("state.tethered_interfaces", m))?;
        }

        if self.engine.iptables.is_empty() || self.engine.ip6tables.is_empty() {
            return Err(invalid("engine", "Filter binary paths cannot be empty".into()));
        }

        Ok(())
    }
}

fn default_transparent_port() -> u16 {
    DEFAULT_TRANSPARENT_PORT
}

fn default_dns_port() -> u16 {
    DEFAULT_DNS_PORT
}

fn default_directory_port() -> u16 {
    DEFAULT_DIRECTORY_PORT
}

fn default_iptables() -> String {
    option_env!("PROXYWALL_IPTABLES_PATH")
        .unwrap_or("iptables")
        .to_string()
}

fn default_ip6tables() -> String {
    option_env!("PROXYWALL_IP6TABLES_PATH")
        .unwrap_or("ip6tables")
        .to_string()
}

fn default_accounting_output() -> String {
    "bw_OUTPUT".to_string()
}

fn default_accounting_input() -> String {
    "bw_INPUT".to_string()
}

fn default_lan_interface() -> String {
    "wlan0".to_string()
}

/// The configuration-store collaborator
#[allow(async_fn_in_trait)]
pub trait SettingsStore {
    /// Loads settings, falling back to defaults when none are stored
    async fn load(&self) -> crate::Result<Settings>;

    async fn save(&self, settings: &Settings) -> crate::Result<()>;
}

/// Settings stored as pretty JSON in a single file
#[derive(Debug, Clone)]
pub struct FileSettingsStore {
    path: PathBuf,
}

impl FileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/settings.json`
    ///
    /// # Errors
    ///
    /// Returns `Err` when no data directory can be determined.
    pub fn default_location() -> crate::Result<Self> {
        let mut path = get_data_dir()
            .ok_or_else(|| crate::Error::Internal("Data directory not found".to_string()))?;
        path.push("settings.json");
        Ok(Self { path })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl SettingsStore for FileSettingsStore {
    async fn load(&self) -> crate::Result<Settings> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No settings at {}, using defaults", self.path.display());
                Ok(Settings::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, settings: &Settings) -> crate::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(settings)?;
        crate::utils::write_atomic(&self.path, json.as_bytes()).await?;
        Ok(())
    }
}

/// In-memory store for dry runs and tests
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    settings: Mutex<Settings>,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Mutex::new(settings),
        }
    }

    /// Copy of the currently stored settings
    pub fn snapshot(&self) -> Settings {
        self.settings
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl SettingsStore for MemorySettingsStore {
    async fn load(&self) -> crate::Result<Settings> {
        Ok(self.snapshot())
    }

    async fn save(&self, settings: &Settings) -> crate::Result<()> {
        let mut guard = self
            .settings
            .lock()
            .map_err(|_| crate::Error::Internal("settings lock poisoned".to_string()))?;
        *guard = settings.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.proxy.transparent_port, 9040);
        assert_eq!(settings.proxy.dns_port, 5400);
        assert_eq!(settings.proxy.directory_port, 9030);
        assert!(settings.proxy.uid.is_none());
        assert!(settings.engine.accounting.is_none());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"proxy": {"uid": 10123}, "services": {"ssh": true}}"#).unwrap();
        assert_eq!(settings.proxy.uid, Some(10_123));
        assert_eq!(settings.proxy.dns_port, 5400);
        assert!(settings.services.ssh);
        assert!(!settings.services.adb);
        assert_eq!(settings.lan_interface, "wlan0");
    }

    #[test]
    fn test_validation_rejects_port_collision() {
        let mut settings = Settings::default();
        settings.proxy.dns_port = settings.proxy.transparent_port;
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, crate::Error::Validation { ref field, .. } if field == "proxy"));
    }

    #[test]
    fn test_validation_rejects_bad_interface() {
        let mut settings = Settings::default();
        settings.state.tethered_interfaces.insert("usb0; reboot".to_string());
        assert!(settings.validate().is_err());
    }

    #[tokio::test]
    async fn test_file_store_roundtrip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSettingsStore::new(dir.path().join("nested").join("settings.json"));

        assert_eq!(store.load().await.unwrap(), Settings::default());

        let mut settings = Settings::default();
        settings.proxy.uid = Some(10_123);
        settings.state.subnet = Some("192.168.1.0/24".parse().unwrap());
        store.save(&settings).await.unwrap();

        assert_eq!(store.load().await.unwrap(), settings);
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = FileSettingsStore::new(path);
        assert!(matches!(store.load().await, Err(crate::Error::Serialization(_))));
    }
}
