//! Privilege elevation for packet-filter commands
//!
//! proxywall may run unprivileged and only elevates the filter binaries
//! themselves (`iptables`, `ip6tables` and their `-legacy`/`-nft` variants).
//!
//! # Elevation Strategy
//!
//! 1. `PROXYWALL_TEST_NO_ELEVATION` set: run the program directly
//! 2. Running as root: run the program directly
//! 3. `PROXYWALL_ELEVATION_METHOD` set: use `sudo`, `run0` or `pkexec` as requested
//! 4. Otherwise `sudo` on a terminal, then `run0`, then `pkexec`
//!
//! Every apply first runs one read-only command through the chosen prefix, so
//! a refused authentication fails the whole apply before any rule changes.
//!
//! # Environment Variables
//!
//! - `PROXYWALL_ELEVATION_METHOD`: Force a specific elevation method (`sudo`, `run0`, or `pkexec`).
//!   Useful for init scripts with sudoers NOPASSWD rules.
//!   Example: `PROXYWALL_ELEVATION_METHOD=sudo proxywall boot`
//!
//! - `PROXYWALL_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Example
//!
//! ```no_run
//! use proxywall::elevation::create_elevated_filter_command;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let args = vec!["-n".to_string(), "-L".to_string(), "OUTPUT".to_string()];
//! let mut cmd = create_elevated_filter_command("iptables", &args)?;
//! let output = cmd.output().await?;
//! # Ok(())
//! # }
//! ```

use std::io;
use std::path::Path;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Neither sudo, run0 nor pkexec can be used
    #[error("No elevation method available - install sudo, run0 or PolicyKit")]
    NoMethod,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `PROXYWALL_ELEVATION_METHOD`
    #[error("Invalid PROXYWALL_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Only packet-filter binaries may be elevated
    #[error("Refusing to elevate '{0}': not an iptables binary")]
    UnapprovedProgram(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How privileged commands are issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ElevationMethod {
    /// Already privileged or in test mode
    #[strum(serialize = "direct")]
    Direct,
    #[strum(serialize = "sudo")]
    Sudo,
    #[strum(serialize = "run0")]
    Run0,
    #[strum(serialize = "pkexec")]
    Pkexec,
}

impl ElevationMethod {
    fn prefix(self) -> Option<&'static str> {
        match self {
            ElevationMethod::Direct => None,
            ElevationMethod::Sudo => Some("sudo"),
            ElevationMethod::Run0 => Some("run0"),
            ElevationMethod::Pkexec => Some("pkexec"),
        }
    }
}

/// Checks if a binary exists.
///
/// Names containing a `/` are checked as paths; bare names are searched in `PATH`.
pub fn binary_exists(name: &str) -> bool {
    if name.contains('/') {
        return Path::new(name).is_file();
    }

    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Decides how privileged commands will be run in the current environment.
///
/// # Errors
///
/// Returns `Err` when the forced method is invalid or unavailable, or when no
/// method can be used at all.
pub fn elevation_method() -> Result<ElevationMethod, ElevationError> {
    use std::os::fd::AsFd;

    if std::env::var("PROXYWALL_TEST_NO_ELEVATION").is_ok() {
        return Ok(ElevationMethod::Direct);
    }

    if nix::unistd::getuid().is_root() {
        return Ok(ElevationMethod::Direct);
    }

    if let Ok(method) = std::env::var("PROXYWALL_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            let chosen = match method.as_str() {
                "sudo" => ElevationMethod::Sudo,
                "run0" => ElevationMethod::Run0,
                "pkexec" => ElevationMethod::Pkexec,
                _ => return Err(ElevationError::InvalidMethod(method)),
            };
            let binary = chosen.prefix().unwrap_or_default();
            if !binary_exists(binary) {
                return Err(ElevationError::MethodNotAvailable(binary.into()));
            }
            return Ok(chosen);
        }
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    automatic_method(is_atty, binary_exists).ok_or(ElevationError::NoMethod)
}

/// Picks a method when none is forced.
///
/// sudo caches credentials after the channel check, so one prompt covers a
/// whole boot. run0 and pkexec authenticate per invocation unless polkit keeps
/// the authorization, so they are used only where sudo cannot prompt.
fn automatic_method(is_atty: bool, exists: impl Fn(&str) -> bool) -> Option<ElevationMethod> {
    if is_atty && exists("sudo") {
        Some(ElevationMethod::Sudo)
    } else if exists("run0") {
        Some(ElevationMethod::Run0)
    } else if exists("pkexec") {
        Some(ElevationMethod::Pkexec)
    } else {
        None
    }
}

fn is_filter_binary(program: &str) -> bool {
    let name = Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    name.starts_with("iptables") || name.starts_with("ip6tables")
}

/// Creates an elevated iptables/ip6tables command.
///
/// Arguments are passed directly without shell interpretation.
///
/// # Errors
///
/// Returns `Err` if `program` is not a packet-filter binary or no elevation
/// method is usable.
pub fn create_elevated_filter_command(
    program: &str,
    args: &[String],
) -> Result<Command, ElevationError> {
    if !is_filter_binary(program) {
        return Err(ElevationError::UnapprovedProgram(program.to_string()));
    }

    let mut cmd = match elevation_method()?.prefix() {
        None => Command::new(program),
        Some(prefix) => {
            let mut cmd = Command::new(prefix);
            cmd.arg(program);
            cmd
        }
    };
    cmd.args(args);
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::ENV_VAR_MUTEX;

    #[test]
    fn test_binary_exists() {
        assert!(binary_exists("sh"));
        assert!(binary_exists("/bin/sh"));
        assert!(!binary_exists("proxywall_nonexistent_binary_xyz"));
        assert!(!binary_exists("/nonexistent/iptables"));
    }

    #[test]
    fn test_only_filter_binaries_are_approved() {
        assert!(is_filter_binary("iptables"));
        assert!(is_filter_binary("/system/bin/ip6tables"));
        assert!(is_filter_binary("iptables-legacy"));
        assert!(!is_filter_binary("sh"));
        assert!(!is_filter_binary("/tmp/iptables/sh"));
    }

    #[test]
    fn test_unapproved_program_rejected() {
        let result = create_elevated_filter_command("rm", &["-rf".to_string()]);
        assert!(matches!(result, Err(ElevationError::UnapprovedProgram(_))));
    }

    #[test]
    fn test_test_mode_runs_directly() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var("PROXYWALL_TEST_NO_ELEVATION", "1");
        }

        assert_eq!(elevation_method().unwrap(), ElevationMethod::Direct);
        let cmd = create_elevated_filter_command("iptables", &["-S".to_string()]).unwrap();
        assert_eq!(cmd.as_std().get_program(), "iptables");
    }

    #[test]
    fn test_invalid_elevation_method() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        if nix::unistd::getuid().is_root() {
            // Root short-circuits before the method is read
            return;
        }

        unsafe {
            std::env::remove_var("PROXYWALL_TEST_NO_ELEVATION");
            std::env::set_var("PROXYWALL_ELEVATION_METHOD", "invalid_method");
        }

        let result = elevation_method();

        unsafe {
            std::env::set_var("PROXYWALL_TEST_NO_ELEVATION", "1");
            std::env::remove_var("PROXYWALL_ELEVATION_METHOD");
        }

        assert!(matches!(result, Err(ElevationError::InvalidMethod(_))));
    }

    #[test]
    fn test_sudo_preferred_on_terminal() {
        let all = |_: &str| true;
        assert_eq!(automatic_method(true, all), Some(ElevationMethod::Sudo));
        assert_eq!(automatic_method(false, all), Some(ElevationMethod::Run0));

        let no_sudo = |name: &str| name != "sudo";
        assert_eq!(automatic_method(true, no_sudo), Some(ElevationMethod::Run0));

        let pkexec_only = |name: &str| name == "pkexec";
        assert_eq!(automatic_method(false, pkexec_only), Some(ElevationMethod::Pkexec));
        assert_eq!(automatic_method(true, |_: &str| false), None);
    }

    #[test]
    fn test_elevation_method_case_insensitive() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();

        unsafe {
            std::env::remove_var("PROXYWALL_TEST_NO_ELEVATION");
            std::env::set_var("PROXYWALL_ELEVATION_METHOD", "SUDO");
        }

        let result = elevation_method();

        unsafe {
            std::env::set_var("PROXYWALL_TEST_NO_ELEVATION", "1");
            std::env::remove_var("PROXYWALL_ELEVATION_METHOD");
        }

        // Either sudo exists or it doesn't, but the name itself is valid
        assert!(!matches!(result, Err(ElevationError::InvalidMethod(_))));
    }
}
