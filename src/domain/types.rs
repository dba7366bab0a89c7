//! Shared types for the presence pipeline

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Length of a colon-separated hardware address ("AA:BB:CC:DD:EE:FF")
pub const MAC_LENGTH: usize = 17;

/// Manufacturer label for prefixes the resolver does not know
pub const UNKNOWN_MANUFACTURER: &str = "unknown";

/// Newtype wrapper for session IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SessionId(pub i64);

impl SessionId {
    #[inline]
    pub fn next(self) -> Self {
        SessionId(self.0 + 1)
    }

    /// Queue token form of this session
    pub fn token(&self) -> String {
        self.0.to_string()
    }

    /// Parse a queue token back into a session id
    pub fn from_token(token: &str) -> Option<Self> {
        token.trim().parse::<i64>().ok().map(SessionId)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One identifier as seen during a single capture cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub identifier: String,
    pub manufacturer: String,
    pub count: u32,
}

/// A continuous presence interval for one identifier (unix seconds)
///
/// `end` advances while the interval is open and is frozen once a scan misses
/// the identifier. `start <= end` always holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralDuration {
    pub id: i64,
    pub identifier: String,
    pub manufacturer: String,
    pub start: i64,
    pub end: i64,
    pub open: bool,
}

impl EphemeralDuration {
    #[inline]
    pub fn length_secs(&self) -> i64 {
        self.end - self.start
    }
}

/// Frozen interval inside a completed session
///
/// The hardware address is dropped when the session closes; patrons are
/// numbered by the order their intervals started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDuration {
    pub session_id: SessionId,
    pub patron_index: i64,
    pub manufacturer: String,
    pub start: i64,
    pub end: i64,
}

/// Flat string-keyed record as posted to the analytics endpoint
pub type Record = BTreeMap<String, String>;

/// Labels attached to every exported record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLabels {
    pub fcfs_seq_id: String,
    pub device_tag: String,
}

impl SessionDuration {
    /// Convert to the flat record shape used by the batch exporter
    pub fn to_record(&self, labels: &SessionLabels) -> Record {
        let mut record = Record::new();
        record.insert("session_id".to_string(), self.session_id.to_string());
        record.insert("fcfs_seq_id".to_string(), labels.fcfs_seq_id.clone());
        record.insert("device_tag".to_string(), labels.device_tag.clone());
        record.insert("patron_index".to_string(), self.patron_index.to_string());
        record.insert("manufacturer".to_string(), self.manufacturer.clone());
        record.insert("start".to_string(), self.start.to_string());
        record.insert("end".to_string(), self.end.to_string());
        record
    }
}
