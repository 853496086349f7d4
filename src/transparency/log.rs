//! Counters of emitted pings.
//!
//! Only counts are kept. No sensor value, picture or location ever reaches
//! this log.

use crate::payload::Extra;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Emission statistics, shared between the scheduler and the CLI.
#[derive(Debug)]
pub struct StreamLog {
    /// Pings the transport accepted for delivery
    pings_sent: AtomicU64,
    /// Ticks whose ping could not be serialized or was refused by the
    /// transport (not connected, queue full)
    pings_dropped: AtomicU64,
    /// One-shot pings sent from the CLI
    manual_sends: AtomicU64,
    with_gyroscope: AtomicU64,
    with_light_level: AtomicU64,
    with_camera_light: AtomicU64,
    with_picture: AtomicU64,
    with_location: AtomicU64,
    /// Session start time
    session_start: DateTime<Utc>,
    /// Path for persisting stats
    persist_path: Option<PathBuf>,
}

impl StreamLog {
    pub fn new() -> Self {
        Self {
            pings_sent: AtomicU64::new(0),
            pings_dropped: AtomicU64::new(0),
            manual_sends: AtomicU64::new(0),
            with_gyroscope: AtomicU64::new(0),
            with_light_level: AtomicU64::new(0),
            with_camera_light: AtomicU64::new(0),
            with_picture: AtomicU64::new(0),
            with_location: AtomicU64::new(0),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a log that continues the counts stored at `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            tracing::warn!("Could not load previous stream stats: {e}");
        }

        log
    }

    /// Record a ping the transport accepted, noting which fields it carried.
    pub fn record_ping(&self, extra: &Extra) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
        let fields = [
            (extra.gyroscope.is_some(), &self.with_gyroscope),
            (extra.light_level.is_some(), &self.with_light_level),
            (extra.camera_light_level.is_some(), &self.with_camera_light),
            (extra.picture_data.is_some(), &self.with_picture),
            (extra.location.is_some(), &self.with_location),
        ];
        for (present, counter) in fields {
            if present {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record a tick whose ping was dropped.
    pub fn record_dropped(&self) {
        self.pings_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_manual_send(&self) {
        self.manual_sends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            pings_dropped: self.pings_dropped.load(Ordering::Relaxed),
            manual_sends: self.manual_sends.load(Ordering::Relaxed),
            with_gyroscope: self.with_gyroscope.load(Ordering::Relaxed),
            with_light_level: self.with_light_level.load(Ordering::Relaxed),
            with_camera_light: self.with_camera_light.load(Ordering::Relaxed),
            with_picture: self.with_picture.load(Ordering::Relaxed),
            with_location: self.with_location.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Stream Statistics:\n\
             - Pings sent: {}\n\
             - Pings dropped: {}\n\
             - Manual sends: {}\n\
             - Session duration: {} seconds\n\
             \n\
             Fields shipped:\n\
             - gyroscope: {}\n\
             - lightLevel: {}\n\
             - cameraLightLevel: {}\n\
             - pictureData: {}\n\
             - location: {}",
            stats.pings_sent,
            stats.pings_dropped,
            stats.manual_sends,
            stats.session_duration_secs,
            stats.with_gyroscope,
            stats.with_light_level,
            stats.with_camera_light,
            stats.with_picture,
            stats.with_location,
        )
    }

    /// Save stats to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.stats();
            let persisted = PersistedStats {
                pings_sent: stats.pings_sent,
                pings_dropped: stats.pings_dropped,
                manual_sends: stats.manual_sends,
                with_gyroscope: stats.with_gyroscope,
                with_light_level: stats.with_light_level,
                with_camera_light: stats.with_camera_light,
                with_picture: stats.with_picture,
                with_location: stats.with_location,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;

            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                let counters = [
                    (&self.pings_sent, persisted.pings_sent),
                    (&self.pings_dropped, persisted.pings_dropped),
                    (&self.manual_sends, persisted.manual_sends),
                    (&self.with_gyroscope, persisted.with_gyroscope),
                    (&self.with_light_level, persisted.with_light_level),
                    (&self.with_camera_light, persisted.with_camera_light),
                    (&self.with_picture, persisted.with_picture),
                    (&self.with_location, persisted.with_location),
                ];
                for (counter, value) in counters {
                    counter.store(value, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }
}

impl Default for StreamLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of stream statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStats {
    pub pings_sent: u64,
    pub pings_dropped: u64,
    pub manual_sends: u64,
    pub with_gyroscope: u64,
    pub with_light_level: u64,
    pub with_camera_light: u64,
    pub with_picture: u64,
    pub with_location: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    pings_sent: u64,
    pings_dropped: u64,
    #[serde(default)]
    manual_sends: u64,
    with_gyroscope: u64,
    with_light_level: u64,
    with_camera_light: u64,
    with_picture: u64,
    with_location: u64,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared stream log.
pub type SharedStreamLog = Arc<StreamLog>;

pub fn create_shared_log() -> SharedStreamLog {
    Arc::new(StreamLog::new())
}

pub fn create_shared_log_with_persistence(path: PathBuf) -> SharedStreamLog {
    Arc::new(StreamLog::with_persistence(path))
}
