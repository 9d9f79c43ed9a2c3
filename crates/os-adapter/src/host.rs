//! Host identity: platform tags and the stable machine identifier.

use serde::Serialize;
use sha2::{Digest, Sha256};
use sysinfo::{Networks, System};

/// Platform tag as the controller understands it.
pub fn platform() -> &'static str {
    if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else {
        "linux"
    }
}

pub fn arch() -> &'static str {
    std::env::consts::ARCH
}

pub fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".into())
}

pub fn username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".into())
}

/// Model string of the first CPU, or `"unknown"`.
fn cpu_model() -> String {
    // Derived once per process (the machine id is cached), so the full
    // refresh cost is acceptable.
    let sys = System::new_all();
    sys.cpus()
        .first()
        .map(|c| c.brand().trim().to_owned())
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| "unknown".into())
}

/// First non-internal, non-zero MAC address, in interface-name order so the
/// result is stable across runs.
fn primary_mac() -> String {
    let networks = Networks::new_with_refreshed_list();
    let mut interfaces: Vec<_> = networks.iter().collect();
    interfaces.sort_by(|a, b| a.0.cmp(b.0));
    for (name, data) in interfaces {
        let lower = name.to_ascii_lowercase();
        if lower == "lo" || lower.starts_with("lo0") || lower.starts_with("docker") {
            continue;
        }
        let mac = data.mac_address();
        if mac.0.iter().any(|b| *b != 0) {
            return mac.to_string();
        }
    }
    "00:00:00:00:00:00".into()
}

/// Stable machine identifier: SHA-256 over
/// `hostname:platform:arch:cpu_model:mac`, hex-truncated to 32 characters.
///
/// Derived once at startup and cached in the config store; the controller
/// uses it for first-contact identification before an `agent_id` exists.
pub fn machine_id() -> String {
    let material = format!(
        "{}:{}:{}:{}:{}",
        hostname(),
        platform(),
        arch(),
        cpu_model(),
        primary_mac()
    );
    let digest = Sha256::digest(material.as_bytes());
    hex::encode(digest)[..32].to_string()
}

/// A user account visible on this host, for the helper's status view.
#[derive(Debug, Clone, Serialize)]
pub struct PlatformUser {
    pub name: String,
    pub uid: String,
}

pub fn platform_users() -> Vec<PlatformUser> {
    sysinfo::Users::new_with_refreshed_list()
        .iter()
        .map(|u| PlatformUser {
            name: u.name().to_owned(),
            uid: u.id().to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_id_is_stable_and_32_hex() {
        let a = machine_id();
        let b = machine_id();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn platform_is_a_known_tag() {
        assert!(["windows", "macos", "linux"].contains(&platform()));
    }

    #[test]
    fn hostname_is_nonempty() {
        assert!(!hostname().is_empty());
    }
}
