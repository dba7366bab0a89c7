//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `capture` - Packet capture subprocess (tshark)
//! - `discovery` - Capture adapter discovery from sysfs
//! - `export` - Chunked JSON export to the analytics endpoint
//! - `chart` - Session chart rendering (PNG)
//! - `mock_collector` - Local stand-in for the analytics endpoint

pub mod capture;
pub mod chart;
pub mod discovery;
pub mod export;
pub mod mock_collector;

// Re-export commonly used types
pub use capture::{Capture, CaptureError, TsharkCapture};
pub use discovery::{AdapterDiscovery, SysfsDiscovery};
pub use export::{BatchExporter, ExportError};
