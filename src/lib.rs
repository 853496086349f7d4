//! Sensor Telemetry Streamer - periodic sensor sampling shipped to a collector.
//!
//! Independent sensor producers feed a snapshot store; a periodic scheduler
//! assembles one ping per tick from the latest readings and hands it to a
//! transport session that keeps delivering across failures.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    Sensor Telemetry Streamer                     │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐   ┌────────────┐   ┌────────────┐   ┌─────────┐  │
//! │  │ Producers  │──▶│ SensorHub  │──▶│  Snapshot  │◀──│Scheduler│  │
//! │  │ (location, │   │ (mailbox)  │   │   Store    │   │ (timer) │  │
//! │  │  camera)   │   └────────────┘   └────────────┘   └────┬────┘  │
//! │  └────────────┘                                          │       │
//! │                   ┌────────────┐   ┌────────────┐        ▼       │
//! │                   │ Transport  │◀──│  Payload   │◀── motion,     │
//! │                   │ (socket or │   │  Builder   │    brightness  │
//! │                   │  request)  │   └────────────┘                │
//! │                   └────────────┘                                 │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use sensor_telemetry_streamer::{Collaborators, Config, StreamEngine};
//!
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! let engine = StreamEngine::new(
//!     Config::default(),
//!     Collaborators::default(),
//!     runtime.handle().clone(),
//! )
//! .expect("valid config");
//!
//! engine.start();
//! engine.update_interval(0.05).expect("positive interval");
//! engine.stop();
//! ```

pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod payload;
pub mod scheduler;
pub mod sensors;
pub mod store;
pub mod transparency;
pub mod transport;

// Re-export key types at crate root for convenience
pub use config::{Config, ConfigError, IntervalPreset, OptionsCell, StreamOptions, TransportMode};
pub use engine::{Collaborators, StreamEngine};
pub use lifecycle::{ExtendedExecution, LifecycleGuard};
pub use payload::{PayloadBuilder, Ping};
pub use scheduler::{StreamScheduler, StreamState};
pub use store::{Snapshot, SnapshotStore};
pub use transparency::{SharedStreamLog, StreamLog, StreamStats};
pub use transport::{Endpoint, Transport, TransportError, TransportFactory, TransportStatus};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Data declaration that can be displayed to users.
pub const DATA_DECLARATION: &str = r#"
╔══════════════════════════════════════════════════════════════════╗
║         SENSOR TELEMETRY STREAMER - DATA DECLARATION             ║
╠══════════════════════════════════════════════════════════════════╣
║                                                                  ║
║  This streamer sends sensor readings to the configured           ║
║  collector at a fixed rate.                                      ║
║                                                                  ║
║  ✓ WHAT MAY BE SENT (only for sensors you enable):               ║
║    • Rotation rate of the device (gyroscope x/y/z)               ║
║    • Location with its accuracy radius                           ║
║    • Camera brightness and, at most once a second, a picture     ║
║    • Screen brightness level                                     ║
║    • Device model, OS version and app version                    ║
║    • Random install and session identifiers                      ║
║                                                                  ║
║  ✗ WHAT IS NEVER SENT:                                           ║
║    • Readings of sensors you did not enable                      ║
║    • Old readings once a sensor is disabled or access revoked    ║
║    • Anything while streaming is stopped or paused               ║
║                                                                  ║
║  You can view emission statistics anytime with:                  ║
║    sensor-stream status                                          ║
║                                                                  ║
╚══════════════════════════════════════════════════════════════════╝
"#;
