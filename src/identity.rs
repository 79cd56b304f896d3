//! Node identity: machine id, display name, capability hash, nonces.
//!
//! Identity is derived once at boot and never mutated afterwards. The unique
//! suffix comes from the first non-loopback interface MAC when
//! `use_mac_for_unique_id` is set, with the hostname as fallback.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::IdentityConfig;

/// Stable identity facts sent in hello/registration bodies.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub machine_id: String,
    pub node_name: String,
    pub firmware_version: String,
    pub capabilities_hash: String,
}

/// Platform string reported to the hub.
pub const PLATFORM: &str = "linux";

impl NodeIdentity {
    pub fn derive(cfg: &IdentityConfig) -> Self {
        let suffix = if cfg.append_unique_suffix {
            unique_suffix(cfg.use_mac_for_unique_id)
        } else {
            String::new()
        };

        let machine_id = if cfg.machine_id.is_empty() {
            format!("{}{}", cfg.machine_id_prefix, suffix)
        } else {
            cfg.machine_id.clone()
        };
        let node_name = if cfg.node_name.is_empty() {
            format!("{}{}", cfg.node_name_prefix, suffix)
        } else {
            cfg.node_name.clone()
        };

        Self {
            machine_id,
            node_name,
            firmware_version: cfg.firmware_version.clone(),
            capabilities_hash: capabilities_hash(&cfg.capabilities),
        }
    }
}

/// 32-bit multiplicative hash over the ordered capability list, rendered as
/// eight uppercase hex digits. Deterministic for a given ordered set.
pub fn capabilities_hash(capabilities: &[String]) -> String {
    let mut hash: u32 = 0;
    for cap in capabilities {
        for byte in cap.bytes() {
            hash = hash.wrapping_mul(31).wrapping_add(u32::from(byte));
        }
    }
    format!("{hash:08X}")
}

/// Fresh 64-bit nonce as two dash-separated hex halves. Entropy from the
/// OS RNG folded with the microsecond clock so consecutive calls differ even
/// under a stubbed RNG.
pub fn create_nonce() -> String {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    #[allow(clippy::cast_possible_truncation)]
    let a = rand::random::<u32>() ^ (micros as u32);
    #[allow(clippy::cast_possible_truncation)]
    let b = rand::random::<u32>() ^ ((micros >> 16) as u32);
    format!("{a:08X}-{b:08X}")
}

/// Short hex suffix identifying this machine.
fn unique_suffix(use_mac: bool) -> String {
    if use_mac {
        if let Some(mac) = first_interface_mac() {
            return mac;
        }
    }
    hostname_suffix()
}

/// MAC of the first non-loopback interface under `/sys/class/net`, colons
/// stripped, lowercase.
fn first_interface_mac() -> Option<String> {
    let mut names: Vec<String> = std::fs::read_dir("/sys/class/net")
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n != "lo")
        .collect();
    names.sort();
    for name in names {
        let path = format!("/sys/class/net/{name}/address");
        if let Ok(raw) = std::fs::read_to_string(&path) {
            let mac: String = raw.trim().chars().filter(|c| *c != ':').collect();
            if !mac.is_empty() && mac.chars().any(|c| c != '0') {
                return Some(mac);
            }
        }
    }
    None
}

fn hostname_suffix() -> String {
    let hostname = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    // Hash rather than embed: hostnames can exceed the id caps.
    let mut hash: u32 = 0;
    for byte in hostname.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(u32::from(byte));
    }
    format!("{hash:08x}")
}

/// `MemAvailable` from `/proc/meminfo` in bytes, `0` when unreadable.
pub fn free_memory_bytes() -> u64 {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return 0;
    };
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches(" kB")
                .trim()
                .parse()
                .unwrap_or(0);
            return kb * 1024;
        }
    }
    0
}
