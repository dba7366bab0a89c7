//! Services - pipeline stages and their state
//!
//! This module contains the presence pipeline:
//! - `scheduler` - Capture cycles and adapter rediscovery
//! - `resolver` - Vendor classification of identifiers
//! - `sessionizer` - Presence interval reconstruction and session rotation
//! - `queue` - Durable at-least-once queue of completed sessions
//! - `consumer` - Periodic queue consumers
//! - `image_exporter` - Session charts
//! - `session_sender` - Remote export of sessions
//! - `stage` - Probe and kill plumbing shared by the stage loops

pub mod consumer;
pub mod image_exporter;
pub mod queue;
pub mod resolver;
pub mod scheduler;
pub mod session_sender;
pub mod sessionizer;
pub mod stage;

// Re-export commonly used types
pub use consumer::{ConsumerStage, QueueConsumer};
pub use image_exporter::ImageExporter;
pub use queue::DurableQueue;
pub use resolver::IdentifierResolver;
pub use scheduler::{CaptureScheduler, SchedulerSettings};
pub use session_sender::SessionSender;
pub use sessionizer::Sessionizer;
