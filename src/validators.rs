//! Input validation and sanitization for values that end up in iptables argv
//!
//! Nothing here is passed through a shell, but interface names, package names
//! and annotations still come from outside the process (settings, app-rule
//! files, interface enumeration) and are checked before they reach the engine.

/// Maximum annotation length kept in `--comment`
pub const MAX_ANNOTATION_LEN: usize = 64;

/// Sanitizes free text for use as a rule annotation.
///
/// Keeps ASCII alphanumerics and `space - _ . :`, truncated to
/// [`MAX_ANNOTATION_LEN`] characters.
///
/// # Examples
///
/// ```
/// use proxywall::validators::sanitize_annotation;
///
/// assert_eq!(sanitize_annotation("Allow proxy outputs"), "Allow proxy outputs");
///
/// let safe = sanitize_annotation("org.example\n\"app\"");
/// assert_eq!(safe, "org.exampleapp");
/// ```
pub fn sanitize_annotation(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | ':'))
        .take(MAX_ANNOTATION_LEN)
        .collect()
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates the three proxy ports together.
///
/// # Errors
///
/// Returns `Err` if any port is 0 or two ports collide.
pub fn validate_proxy_ports(transparent: u16, dns: u16, directory: u16) -> Result<(), String> {
    validate_port(transparent)?;
    validate_port(dns)?;
    validate_port(directory)?;

    if transparent == dns || transparent == directory || dns == directory {
        return Err(format!(
            "Proxy ports must be distinct (transparent {transparent}, DNS {dns}, directory {directory})"
        ));
    }
    Ok(())
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - 1 to 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Interface name cannot be empty".to_string());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Validates an application package name (`org.example.app`).
///
/// Dot-separated segments, each starting with an ASCII letter and containing
/// only ASCII alphanumerics and underscores; at most 255 bytes.
///
/// # Errors
///
/// Returns `Err` describing the first violated constraint.
pub fn validate_package_name(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Package name cannot be empty".to_string());
    }

    if name.len() > 255 {
        return Err("Package name too long (max 255 characters)".to_string());
    }

    for segment in name.split('.') {
        let Some(first) = segment.chars().next() else {
            return Err("Package name contains an empty segment".to_string());
        };
        if !first.is_ascii_alphabetic() {
            return Err(format!("Segment '{segment}' must start with a letter"));
        }
        if !segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(format!("Segment '{segment}' contains invalid characters"));
        }
    }

    Ok(name.to_string())
}

/// Rejects the `(uid_t)-1` sentinel, which the owner match cannot express
///
/// # Errors
///
/// Returns `Err` for `u32::MAX`.
pub fn validate_uid(uid: u32) -> Result<u32, String> {
    if uid == u32::MAX {
        Err("UID 4294967295 is reserved".to_string())
    } else {
        Ok(uid)
    }
}
