//! Sensor producers for the telemetry streamer.
//!
//! The platform sensors are external collaborators. This module defines the
//! narrow interfaces the engine drives them through, the hub that turns
//! their pushes into snapshot-store writes, and stand-ins for hosts that
//! lack the sensors.

pub mod desktop;
pub mod hub;
pub mod types;

pub use desktop::{
    FixedBrightness, LumaFrameAnalyzer, NoCamera, NoLocation, NoMotion, SysfsBacklight,
};
pub use hub::{ProducerHandle, SensorHub};
pub use types::{
    AmbientLightSample, Authorization, CameraFrame, ImageSample, LocationSample, MotionSample,
    Reading, SensorKind, SensorUpdate,
};

/// Gyroscope-style sensor read synchronously at tick time.
pub trait MotionSensor: Send + Sync {
    /// Begin hardware updates.
    fn start(&self) {}

    /// Stop hardware updates.
    fn stop(&self) {}

    /// The sensor's current reading, if it has one.
    fn current_reading(&self) -> Option<MotionSample>;
}

/// Push-based location subsystem.
pub trait LocationProvider: Send + Sync {
    fn authorization(&self) -> Authorization;

    /// Ask the host for access. The outcome arrives later through
    /// [`ProducerHandle::location_authorization`].
    fn request_authorization(&self, sink: ProducerHandle);

    /// Start delivering fixes through [`ProducerHandle::location`].
    fn start_updates(&self, sink: ProducerHandle);

    fn stop_updates(&self);
}

/// Push-based camera subsystem.
pub trait CameraProvider: Send + Sync {
    fn authorization(&self) -> Authorization;

    /// Ask the host for access. The outcome arrives later through
    /// [`ProducerHandle::camera_authorization`].
    fn request_authorization(&self, sink: ProducerHandle);

    /// Start delivering frames through [`ProducerHandle::frame`].
    fn start_capture(&self, sink: ProducerHandle);

    fn stop_capture(&self);
}

/// Turns camera frames into the values a ping carries.
pub trait FrameAnalyzer: Send + Sync {
    /// Brightness scalar in `[0, 1]`.
    fn brightness(&self, frame: &CameraFrame) -> Option<f64>;

    /// Encoded thumbnail, e.g. base64 JPEG.
    fn encode(&self, frame: &CameraFrame) -> Option<String>;
}

/// Display brightness accessor.
///
/// Implementations must return within a few milliseconds; the scheduler
/// gives up on reads slower than its bounded wait and omits the value.
pub trait BrightnessSource: Send + Sync {
    fn read(&self) -> Option<f64>;
}
