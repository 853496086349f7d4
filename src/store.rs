//! Latest-value cache for the push-driven sensors.
//!
//! Every sensor kind sits behind its own lock, so a location write never
//! waits on a camera write and a reader only ever sees complete values.

use crate::sensors::types::{
    AmbientLightSample, ImageSample, LocationSample, Reading, SensorKind,
};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

/// Point-in-time view of every cached sensor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub location: Option<LocationSample>,
    pub ambient_light: Option<AmbientLightSample>,
    pub image: Option<ImageSample>,
}

/// Latest picture plus the monotonic time it was taken.
#[derive(Debug, Default)]
struct ImageSlot {
    latest: Option<ImageSample>,
    last_capture: Option<Instant>,
}

/// Concurrency-safe cache of the most recent reading per sensor kind.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    location: RwLock<Option<LocationSample>>,
    ambient_light: RwLock<Option<AmbientLightSample>>,
    image: Mutex<ImageSlot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached value for the reading's kind.
    pub fn write(&self, reading: Reading) {
        match reading {
            Reading::Location(sample) => {
                *self.location.write().unwrap_or_else(|e| e.into_inner()) = Some(sample);
            }
            Reading::AmbientLight(sample) => {
                *self.ambient_light.write().unwrap_or_else(|e| e.into_inner()) = Some(sample);
            }
            Reading::Image(sample) => {
                self.image.lock().unwrap_or_else(|e| e.into_inner()).latest = Some(sample);
            }
        }
    }

    /// Forget the cached value for one kind.
    pub fn clear(&self, kind: SensorKind) {
        match kind {
            SensorKind::Location => {
                *self.location.write().unwrap_or_else(|e| e.into_inner()) = None;
            }
            SensorKind::AmbientLight => {
                *self.ambient_light.write().unwrap_or_else(|e| e.into_inner()) = None;
            }
            SensorKind::Image => {
                self.image.lock().unwrap_or_else(|e| e.into_inner()).latest = None;
            }
        }
    }

    pub fn location(&self) -> Option<LocationSample> {
        *self.location.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ambient_light(&self) -> Option<AmbientLightSample> {
        *self.ambient_light.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn image(&self) -> Option<ImageSample> {
        self.image
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .latest
            .clone()
    }

    /// Read every kind. Each field is internally consistent; different
    /// kinds may come from slightly different moments.
    pub fn read_all(&self) -> Snapshot {
        Snapshot {
            location: self.location(),
            ambient_light: self.ambient_light(),
            image: self.image(),
        }
    }

    /// Whether at least `min_interval` has passed since the last capture.
    pub fn image_capture_due(&self, now: Instant, min_interval: Duration) -> bool {
        let slot = self.image.lock().unwrap_or_else(|e| e.into_inner());
        match slot.last_capture {
            Some(last) => now.saturating_duration_since(last) >= min_interval,
            None => true,
        }
    }

    /// Store a captured picture and advance the throttle clock.
    pub fn record_image(&self, sample: ImageSample, captured: Instant) {
        let mut slot = self.image.lock().unwrap_or_else(|e| e.into_inner());
        slot.latest = Some(sample);
        slot.last_capture = Some(captured);
    }
}
