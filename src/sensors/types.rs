//! Sensor reading types shared by producers, the snapshot store and the
//! payload builder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Angular velocity in radians per second, as of query time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl MotionSample {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// A location fix. Always replaced wholesale, never field by field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in meters
    pub accuracy_meters: f64,
}

/// Camera-derived brightness in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AmbientLightSample {
    pub level: f64,
}

impl AmbientLightSample {
    /// Create a sample, clamping the level into `[0, 1]`.
    pub fn new(level: f64) -> Self {
        Self {
            level: level.clamp(0.0, 1.0),
        }
    }
}

/// An encoded camera thumbnail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSample {
    /// Encoded image (base64 text as produced by the frame analyzer)
    pub encoded: String,
    pub captured_at: DateTime<Utc>,
}

/// Raw camera frame as pushed by a camera provider.
///
/// Pixels are tightly packed RGBA8 rows.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl CameraFrame {
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Self {
        Self {
            width,
            height,
            rgba,
        }
    }

    /// A frame filled with a single colour.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixels = (width as usize) * (height as usize);
        let mut rgba = Vec::with_capacity(pixels * 4);
        for _ in 0..pixels {
            rgba.extend_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
        }
        Self::new(width, height, rgba)
    }

    /// Average red, green and blue over the whole frame.
    pub fn average_rgb(&self) -> Option<[f64; 3]> {
        let pixels = self.rgba.len() / 4;
        if pixels == 0 {
            return None;
        }
        let mut sums = [0u64; 3];
        for px in self.rgba.chunks_exact(4) {
            sums[0] += px[0] as u64;
            sums[1] += px[1] as u64;
            sums[2] += px[2] as u64;
        }
        let n = pixels as f64;
        Some([
            sums[0] as f64 / n,
            sums[1] as f64 / n,
            sums[2] as f64 / n,
        ])
    }
}

/// Host permission state for a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Authorization {
    /// The user has not been asked yet
    NotDetermined,
    Granted,
    Denied,
}

impl Authorization {
    pub fn permits(&self) -> bool {
        matches!(self, Authorization::Granted)
    }
}

/// Sensor kinds held by the snapshot store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorKind {
    Location,
    AmbientLight,
    Image,
}

/// One value for one cached sensor kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Location(LocationSample),
    AmbientLight(AmbientLightSample),
    Image(ImageSample),
}

impl Reading {
    pub fn kind(&self) -> SensorKind {
        match self {
            Reading::Location(_) => SensorKind::Location,
            Reading::AmbientLight(_) => SensorKind::AmbientLight,
            Reading::Image(_) => SensorKind::Image,
        }
    }
}

/// Messages pushed by asynchronous producers into the sensor hub.
#[derive(Debug, Clone)]
pub enum SensorUpdate {
    Location(LocationSample),
    LocationAuthorization(Authorization),
    Frame(CameraFrame),
    CameraAuthorization(Authorization),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_light_level_clamped() {
        assert_eq!(AmbientLightSample::new(1.7).level, 1.0);
        assert_eq!(AmbientLightSample::new(-0.2).level, 0.0);
        assert_eq!(AmbientLightSample::new(0.4).level, 0.4);
    }

    #[test]
    fn test_frame_average() {
        let frame = CameraFrame::solid(4, 2, [255, 0, 51]);
        let avg = frame.average_rgb().unwrap();
        assert_eq!(avg, [255.0, 0.0, 51.0]);

        let empty = CameraFrame::new(0, 0, Vec::new());
        assert!(empty.average_rgb().is_none());
    }

    #[test]
    fn test_reading_kind() {
        let reading = Reading::AmbientLight(AmbientLightSample::new(0.5));
        assert_eq!(reading.kind(), SensorKind::AmbientLight);
        assert!(Authorization::Granted.permits());
        assert!(!Authorization::NotDetermined.permits());
    }
}
