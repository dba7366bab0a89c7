//! Vendor classification of observed identifiers
//!
//! The first three octets of a hardware address (the OUI) name the vendor.
//! Lookup is case-insensitive and accepts `:`, `-` or `.` separators. Anything
//! not in the table, including randomised private addresses, resolves to
//! `"unknown"`.

use crate::domain::types::{Entry, UNKNOWN_MANUFACTURER};
use crate::infra::supervisor::Liveness;
use crate::services::stage::{forward, killed, Forward};
use rustc_hash::FxHashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Classified output of one capture cycle
pub type Entries = FxHashMap<String, Entry>;

const BUILTIN_VENDORS: &[(&str, &str)] = &[
    ("00000C", "Cisco"),
    ("000393", "Apple"),
    ("000A95", "Apple"),
    ("3C0754", "Apple"),
    ("F01898", "Apple"),
    ("001247", "Samsung"),
    ("5C0A5B", "Samsung"),
    ("3C5AB4", "Google"),
    ("001B21", "Intel"),
    ("0050F2", "Microsoft"),
    ("00E0FC", "Huawei"),
    ("B827EB", "Raspberry Pi"),
    ("DCA632", "Raspberry Pi"),
];

/// Normalised six-hex-digit OUI of an identifier
fn oui_key(identifier: &str) -> Option<String> {
    let mut key = String::with_capacity(6);
    for c in identifier.chars() {
        match c {
            ':' | '-' | '.' => continue,
            c if c.is_ascii_hexdigit() => {
                key.push(c.to_ascii_uppercase());
                if key.len() == 6 {
                    return Some(key);
                }
            }
            _ => return None,
        }
    }
    None
}

/// Count repeated sightings in a raw snapshot
pub fn tally(identifiers: &[String]) -> FxHashMap<String, u32> {
    let mut counts = FxHashMap::default();
    for identifier in identifiers {
        *counts.entry(identifier.clone()).or_insert(0) += 1;
    }
    counts
}

/// OUI table
#[derive(Debug, Clone)]
pub struct IdentifierResolver {
    vendors: FxHashMap<String, String>,
}

impl Default for IdentifierResolver {
    fn default() -> Self {
        Self::builtin()
    }
}

impl IdentifierResolver {
    pub fn builtin() -> Self {
        let vendors = BUILTIN_VENDORS
            .iter()
            .map(|(prefix, vendor)| (prefix.to_string(), vendor.to_string()))
            .collect();
        Self { vendors }
    }

    /// Built-in table extended from an OUI file
    ///
    /// One `PREFIX<TAB>Vendor[<TAB>long name]` or `PREFIX,Vendor` per line;
    /// `#` starts a comment. Lines without a plain 24-bit prefix are skipped.
    pub fn with_manufacturers_file<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut resolver = Self::builtin();
        let mut loaded = 0usize;
        let mut skipped = 0usize;

        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = if line.contains('\t') { line.split('\t') } else { line.split(',') };
            let prefix = fields.next().map(str::trim).unwrap_or_default();
            let vendor = fields.next().map(str::trim).unwrap_or_default();

            match oui_key(prefix) {
                Some(key) if !vendor.is_empty() && prefix.len() <= 8 => {
                    resolver.vendors.insert(key, vendor.to_string());
                    loaded += 1;
                }
                _ => {
                    debug!(path = %path.display(), line = line_no + 1, "manufacturer_line_skipped");
                    skipped += 1;
                }
            }
        }

        info!(
            path = %path.display(),
            loaded = loaded,
            skipped = skipped,
            vendors = resolver.vendors.len(),
            "manufacturers_loaded"
        );
        Ok(resolver)
    }

    /// Resolver for the configured file, or the built-in table
    pub fn load(path: Option<&str>) -> Self {
        match path {
            None => Self::builtin(),
            Some(path) => Self::with_manufacturers_file(path).unwrap_or_else(|e| {
                warn!(path = %path, error = %e, "manufacturers_load_failed_using_builtin");
                Self::builtin()
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.vendors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vendors.is_empty()
    }

    pub fn manufacturer(&self, identifier: &str) -> &str {
        oui_key(identifier)
            .and_then(|key| self.vendors.get(&key))
            .map(String::as_str)
            .unwrap_or(UNKNOWN_MANUFACTURER)
    }

    /// One entry per input identifier
    pub fn resolve(&self, counts: &FxHashMap<String, u32>) -> Entries {
        counts
            .iter()
            .map(|(identifier, &count)| {
                let entry = Entry {
                    identifier: identifier.clone(),
                    manufacturer: self.manufacturer(identifier).to_string(),
                    count,
                };
                (identifier.clone(), entry)
            })
            .collect()
    }

    /// Stage loop: one snapshot in, one batch of entries out
    pub async fn run(
        self: Arc<Self>,
        mut snapshots: mpsc::Receiver<Vec<String>>,
        entries_tx: mpsc::Sender<Entries>,
        mut liveness: Liveness,
        mut kill: watch::Receiver<bool>,
    ) {
        info!(vendors = self.len(), "resolver_started");

        loop {
            tokio::select! {
                _ = killed(&mut kill) => break,
                _ = liveness.probed() => liveness.reply(),
                snapshot = snapshots.recv() => {
                    let Some(identifiers) = snapshot else {
                        debug!("resolver_input_closed");
                        break;
                    };
                    let entries = self.resolve(&tally(&identifiers));
                    debug!(sightings = identifiers.len(), unique = entries.len(), "snapshot_resolved");

                    if forward(&entries_tx, entries, &mut liveness, &mut kill).await != Forward::Sent {
                        break;
                    }
                }
            }
        }

        info!("resolver_stopped");
    }
}
