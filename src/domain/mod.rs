//! Domain models - core presence types
//!
//! This module contains the canonical data types used throughout the system:
//! - `Entry` - an identifier enriched with its vendor classification
//! - `EphemeralDuration` - a live presence interval keyed by hardware address
//! - `SessionDuration` - an anonymised interval inside a completed session
//! - `SessionId` - persisted session counter

pub mod types;

pub use types::{
    Entry, EphemeralDuration, Record, SessionDuration, SessionId, SessionLabels, MAC_LENGTH,
    UNKNOWN_MANUFACTURER,
};
