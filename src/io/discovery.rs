//! Capture adapter discovery
//!
//! Wireless interfaces expose a `wireless` or `phy80211` entry under
//! `/sys/class/net/<iface>`. Among those matching the configured prefix the
//! last in name order wins: add-on USB adapters enumerate after the onboard
//! radio, and the onboard radio usually cannot monitor.

use std::path::PathBuf;
use tracing::debug;

/// Adapter-discovery collaborator
pub trait AdapterDiscovery: Send + Sync {
    /// Logical name of a capture-capable adapter, if one exists
    fn discover(&self) -> Option<String>;
}

pub struct SysfsDiscovery {
    root: PathBuf,
    prefix: String,
}

impl SysfsDiscovery {
    pub fn new(prefix: &str) -> Self {
        Self::with_root("/sys/class/net", prefix)
    }

    pub fn with_root<P: Into<PathBuf>>(root: P, prefix: &str) -> Self {
        Self { root: root.into(), prefix: prefix.to_string() }
    }

    fn wireless_interfaces(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            debug!(root = %self.root.display(), "discovery_root_unreadable");
            return Vec::new();
        };

        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|entry| {
                let path = entry.path();
                path.join("wireless").exists() || path.join("phy80211").exists()
            })
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        names
    }
}

impl AdapterDiscovery for SysfsDiscovery {
    fn discover(&self) -> Option<String> {
        let candidates = self.wireless_interfaces();
        debug!(candidates = ?candidates, "discovery_candidates");
        candidates.into_iter().rev().find(|name| name.starts_with(&self.prefix))
    }
}
