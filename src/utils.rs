//! Directory management, atomic file writes and network discovery
//!
//! # Directory Structure
//!
//! - Data: `~/.local/share/proxywall/` - settings and app rules
//! - State: `~/.local/state/proxywall/` - log file and audit log
//!
//! # Example
//!
//! ```
//! use proxywall::utils::{get_data_dir, ensure_dirs};
//!
//! ensure_dirs().expect("Failed to create directories");
//!
//! if let Some(data_path) = get_data_dir() {
//!     // Load settings from data_path
//! }
//! ```

use directories::ProjectDirs;
use ipnetwork::{IpNetwork, Ipv4Network};
use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

pub fn get_data_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "proxywall", "proxywall").map(|pd| pd.data_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "proxywall", "proxywall")
        .and_then(|pd| pd.state_dir().map(Path::to_path_buf))
}

pub fn ensure_dirs() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700);
        builder.recursive(true);

        if let Some(dir) = get_data_dir() {
            builder.create(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            builder.create(dir)?;
        }
    }

    #[cfg(not(unix))]
    {
        if let Some(dir) = get_data_dir() {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            std::fs::create_dir_all(dir)?;
        }
    }

    Ok(())
}

/// Writes `contents` to `path` atomically.
///
/// 1. Writes to `<path>.tmp`, created with mode 0o600.
/// 2. Syncs the file.
/// 3. Renames over the target.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);

    #[cfg(unix)]
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(&temp_path)
        .await?;

    #[cfg(not(unix))]
    let mut file = tokio::fs::File::create(&temp_path).await?;

    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save settings. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

/// IPv4 networks per interface, loopback excluded.
///
/// An interface with several addresses keeps the first one reported.
pub fn interface_networks() -> std::io::Result<BTreeMap<String, IpNetwork>> {
    let interfaces = NetworkInterface::show().map_err(std::io::Error::other)?;
    let addresses = interfaces.iter().flat_map(|iface| {
        iface.addr.iter().filter_map(move |addr| match addr {
            Addr::V4(v4) => Some((iface.name.as_str(), v4.ip, v4.netmask)),
            Addr::V6(_) => None,
        })
    });
    Ok(networks_from(addresses))
}

fn networks_from<'a>(
    addresses: impl IntoIterator<Item = (&'a str, Ipv4Addr, Option<Ipv4Addr>)>,
) -> BTreeMap<String, IpNetwork> {
    let mut networks = BTreeMap::new();
    for (name, ip, netmask) in addresses {
        if ip.is_loopback() {
            continue;
        }
        let Some(netmask) = netmask else { continue };
        let Ok(prefix) = ipnetwork::ipv4_mask_to_prefix(netmask) else {
            continue;
        };
        let Ok(host) = Ipv4Network::new(ip, prefix) else {
            continue;
        };
        let Ok(network) = Ipv4Network::new(host.network(), prefix) else {
            continue;
        };
        networks
            .entry(name.to_string())
            .or_insert(IpNetwork::V4(network));
    }
    networks
}

/// Source of the current interface networks
pub trait NetworkInspector {
    fn networks(&self) -> std::io::Result<BTreeMap<String, IpNetwork>>;
}

/// Reads networks from the running system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemNetworks;

impl NetworkInspector for SystemNetworks {
    fn networks(&self) -> std::io::Result<BTreeMap<String, IpNetwork>> {
        interface_networks()
    }
}

/// A fixed map, for dry runs and tests
impl NetworkInspector for BTreeMap<String, IpNetwork> {
    fn networks(&self) -> std::io::Result<BTreeMap<String, IpNetwork>> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
        Ipv4Addr::new(a, b, c, d)
    }

    #[test]
    fn test_networks_are_masked() {
        let networks = networks_from([
            ("wlan0", v4(192, 168, 1, 42), Some(v4(255, 255, 255, 0))),
            ("wlan0", v4(192, 168, 7, 3), Some(v4(255, 255, 255, 0))),
            ("rndis0", v4(10, 42, 0, 1), Some(v4(255, 255, 0, 0))),
            ("usb0", v4(10, 0, 0, 1), None),
            ("lo", v4(127, 0, 0, 1), Some(v4(255, 0, 0, 0))),
        ]);

        assert_eq!(networks["wlan0"], "192.168.1.0/24".parse::<IpNetwork>().unwrap());
        assert_eq!(networks["rndis0"], "10.42.0.0/16".parse::<IpNetwork>().unwrap());
        assert!(!networks.contains_key("lo"));
        assert!(!networks.contains_key("usb0"));
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert!(!dir.path().join("settings.json.tmp").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
