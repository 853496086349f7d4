//! Transparency module for the sensor telemetry streamer.
//!
//! Tracks what left the device: how many pings were built and which sensor
//! fields they carried. Field values are never recorded.

pub mod log;

pub use log::{create_shared_log, create_shared_log_with_persistence, SharedStreamLog, StreamLog, StreamStats};
