//! Stand-in collaborators for hosts without mobile sensors.
//!
//! This exists so the engine (and binary) run on desktop and server targets
//! where there is no gyroscope, location service or camera.

use super::hub::ProducerHandle;
use super::types::{Authorization, CameraFrame, MotionSample};
use super::{BrightnessSource, CameraProvider, FrameAnalyzer, LocationProvider, MotionSensor};
use std::path::{Path, PathBuf};

/// Motion sensor that never has a reading.
#[derive(Debug, Default)]
pub struct NoMotion;

impl MotionSensor for NoMotion {
    fn current_reading(&self) -> Option<MotionSample> {
        None
    }
}

/// Location provider for hosts without a location service.
#[derive(Debug, Default)]
pub struct NoLocation;

impl LocationProvider for NoLocation {
    fn authorization(&self) -> Authorization {
        Authorization::Denied
    }

    fn request_authorization(&self, sink: ProducerHandle) {
        sink.location_authorization(Authorization::Denied);
    }

    fn start_updates(&self, _sink: ProducerHandle) {}

    fn stop_updates(&self) {}
}

/// Camera provider for hosts without a camera.
#[derive(Debug, Default)]
pub struct NoCamera;

impl CameraProvider for NoCamera {
    fn authorization(&self) -> Authorization {
        Authorization::Denied
    }

    fn request_authorization(&self, sink: ProducerHandle) {
        sink.camera_authorization(Authorization::Denied);
    }

    fn start_capture(&self, _sink: ProducerHandle) {}

    fn stop_capture(&self) {}
}

/// Frame analyzer computing Rec.601 luma of the frame's average colour.
///
/// It does not encode pictures; hosts that stream images inject their own
/// analyzer.
#[derive(Debug, Default)]
pub struct LumaFrameAnalyzer;

impl FrameAnalyzer for LumaFrameAnalyzer {
    fn brightness(&self, frame: &CameraFrame) -> Option<f64> {
        let [r, g, b] = frame.average_rgb()?;
        Some(((0.299 * r + 0.587 * g + 0.114 * b) / 255.0).clamp(0.0, 1.0))
    }

    fn encode(&self, _frame: &CameraFrame) -> Option<String> {
        None
    }
}

/// Brightness source returning a constant.
#[derive(Debug, Clone, Copy)]
pub struct FixedBrightness(pub Option<f64>);

impl BrightnessSource for FixedBrightness {
    fn read(&self) -> Option<f64> {
        self.0
    }
}

/// Screen backlight level read from `/sys/class/backlight`.
#[derive(Debug, Clone)]
pub struct SysfsBacklight {
    device: Option<PathBuf>,
}

impl SysfsBacklight {
    /// Use the first backlight device found, if any.
    pub fn detect() -> Self {
        Self::detect_in(Path::new("/sys/class/backlight"))
    }

    /// Use the first backlight device under `root`.
    pub fn detect_in(root: &Path) -> Self {
        let device = std::fs::read_dir(root).ok().and_then(|entries| {
            let mut devices: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.join("max_brightness").exists())
                .collect();
            devices.sort();
            devices.into_iter().next()
        });
        Self { device }
    }

    pub fn is_available(&self) -> bool {
        self.device.is_some()
    }
}

impl BrightnessSource for SysfsBacklight {
    fn read(&self) -> Option<f64> {
        let device = self.device.as_ref()?;
        let read_value = |name: &str| -> Option<f64> {
            std::fs::read_to_string(device.join(name))
                .ok()?
                .trim()
                .parse::<f64>()
                .ok()
        };
        let max = read_value("max_brightness")?;
        if max <= 0.0 {
            return None;
        }
        let current = read_value("actual_brightness").or_else(|| read_value("brightness"))?;
        Some((current / max).clamp(0.0, 1.0))
    }
}
