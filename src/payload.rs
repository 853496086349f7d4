//! Ping construction and serialization.
//!
//! A ping is built fresh on every tick from the current options, the sensor
//! readings, the session identity and the tick's sequence number, then
//! serialized once and never touched again.

use crate::config::StreamOptions;
use crate::sensors::types::MotionSample;
use crate::store::Snapshot;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event category recorded in every ping.
pub const EVENT_CATEGORY: &str = "TELEMETRY";

/// Event name recorded in every ping.
pub const EVENT_NAME: &str = "IPHONE-DATA";

/// `ping_info.reason` for scheduler-driven pings.
pub const STREAM_REASON: &str = "sensor_stream";

/// `ping_info.reason` for pings sent by hand from the CLI.
pub const MANUAL_REASON: &str = "manual_cli";

// ============================================================================
// Wire types
// ============================================================================

/// One emitted telemetry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub metrics: Metrics,
    pub events: Vec<Event>,
    pub ping_info: PingInfo,
    pub client_info: ClientInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub uuid: UuidMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UuidMetrics {
    #[serde(rename = "glean.page_id")]
    pub page_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub category: String,
    pub name: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub extra: Extra,
}

/// Event payload. Sensor fields are omitted when disabled or unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extra {
    pub id: String,
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gyroscope: Option<Gyro>,
    #[serde(rename = "lightLevel", skip_serializing_if = "Option::is_none")]
    pub light_level: Option<f64>,
    #[serde(rename = "cameraLightLevel", skip_serializing_if = "Option::is_none")]
    pub camera_light_level: Option<f64>,
    #[serde(rename = "pictureData", skip_serializing_if = "Option::is_none")]
    pub picture_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationInfo>,
    pub endpoint: String,
    pub device_model: String,
    pub system_name: String,
    pub system_version: String,
    pub app_build: String,
    pub app_version: String,
    /// Free text attached to hand-sent pings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gyro {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationInfo {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingInfo {
    pub seq: u64,
    pub start_time: String,
    pub end_time: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub telemetry_sdk_build: String,
    pub session_id: String,
    pub client_id: String,
    pub session_count: u64,
    pub first_run_date: String,
    pub os: String,
    pub os_version: String,
    pub architecture: String,
    pub locale: String,
    pub app_build: String,
    pub app_display_version: String,
    pub app_channel: String,
}

// ============================================================================
// Identity
// ============================================================================

/// Identity created once per process.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    session_id: String,
    client_id: String,
    first_run: DateTime<Utc>,
}

impl SessionIdentity {
    /// Fresh session for this process, tied to an install-stable client id.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            client_id: client_id.into(),
            first_run: Utc::now(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn first_run(&self) -> DateTime<Utc> {
        self.first_run
    }
}

/// Host description reported in every ping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_model: String,
    pub system_name: String,
    pub system_version: String,
    pub architecture: String,
    pub locale: String,
    pub app_build: String,
    pub app_version: String,
    pub app_channel: String,
}

impl DeviceInfo {
    /// Describe the current host.
    pub fn detect(app_channel: impl Into<String>) -> Self {
        let device_model = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            device_model,
            system_name: system_name().to_string(),
            system_version: system_version(),
            architecture: architecture().to_string(),
            locale: locale_from_env(),
            app_build: option_env!("SENSOR_STREAM_BUILD").unwrap_or("1").to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            app_channel: app_channel.into(),
        }
    }
}

fn system_name() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "macOS",
        "ios" => "iOS",
        "windows" => "Windows",
        "android" => "Android",
        other => other,
    }
}

fn architecture() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "arm64",
        "x86_64" => "x86_64",
        _ => "unknown",
    }
}

fn system_version() -> String {
    std::fs::read_to_string("/etc/os-release")
        .ok()
        .and_then(|content| {
            content.lines().find_map(|line| {
                line.strip_prefix("VERSION_ID=")
                    .map(|v| v.trim_matches('"').to_string())
            })
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn locale_from_env() -> String {
    ["LC_ALL", "LC_MESSAGES", "LANG"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|v| !v.is_empty() && v != "C" && v != "POSIX")
        .map(|v| normalize_locale(&v))
        .unwrap_or_else(|| "en-US".to_string())
}

/// `en_US.UTF-8` becomes `en-US`.
fn normalize_locale(raw: &str) -> String {
    let base = raw.split(['.', '@']).next().unwrap_or(raw);
    base.replace('_', "-")
}

// ============================================================================
// Builder
// ============================================================================

/// Everything one tick contributes to a ping.
#[derive(Debug, Clone)]
pub struct TickInput<'a> {
    pub options: &'a StreamOptions,
    pub motion: Option<MotionSample>,
    pub snapshot: Snapshot,
    pub screen_brightness: Option<f64>,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub endpoint: &'a str,
    pub reason: &'a str,
    pub message: Option<&'a str>,
}

/// Payload errors.
#[derive(Debug)]
pub enum PayloadError {
    Serialization(String),
}

impl std::fmt::Display for PayloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadError::Serialization(e) => write!(f, "Ping serialization error: {e}"),
        }
    }
}

impl std::error::Error for PayloadError {}

/// Builds pings for one session.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    telemetry_id: String,
    identity: SessionIdentity,
    device: DeviceInfo,
}

impl PayloadBuilder {
    pub fn new(telemetry_id: impl Into<String>, identity: SessionIdentity, device: DeviceInfo) -> Self {
        Self {
            telemetry_id: telemetry_id.into(),
            identity,
            device,
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// Build the ping for one tick. Only enabled sensors with a value
    /// contribute a field.
    pub fn build(&self, input: &TickInput<'_>) -> Ping {
        let options = input.options;
        let snapshot = &input.snapshot;

        let gyroscope = input
            .motion
            .filter(|_| options.include_motion)
            .map(|m| Gyro {
                x: m.x,
                y: m.y,
                z: m.z,
            });
        let camera_light_level = snapshot
            .ambient_light
            .filter(|_| options.include_ambient_light)
            .map(|l| l.level);
        let picture_data = snapshot
            .image
            .as_ref()
            .filter(|_| options.include_image)
            .map(|i| i.encoded.clone());
        let location = snapshot
            .location
            .filter(|_| options.include_location)
            .map(|l| LocationInfo {
                latitude: l.latitude,
                longitude: l.longitude,
                accuracy: l.accuracy_meters,
            });

        let device = &self.device;
        let iso_now = input.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);

        Ping {
            metrics: Metrics {
                uuid: UuidMetrics {
                    page_id: self.telemetry_id.clone(),
                },
            },
            events: vec![Event {
                category: EVENT_CATEGORY.to_string(),
                name: EVENT_NAME.to_string(),
                timestamp: input.timestamp.timestamp_millis(),
                extra: Extra {
                    id: self.telemetry_id.clone(),
                    uuid: self.telemetry_id.clone(),
                    gyroscope,
                    light_level: input.screen_brightness,
                    camera_light_level,
                    picture_data,
                    location,
                    endpoint: input.endpoint.to_string(),
                    device_model: device.device_model.clone(),
                    system_name: device.system_name.clone(),
                    system_version: device.system_version.clone(),
                    app_build: device.app_build.clone(),
                    app_version: device.app_version.clone(),
                    message: input.message.map(str::to_string),
                },
            }],
            ping_info: PingInfo {
                seq: input.seq,
                start_time: iso_now.clone(),
                end_time: iso_now,
                reason: input.reason.to_string(),
            },
            client_info: ClientInfo {
                telemetry_sdk_build: format!("rust-{}", env!("CARGO_PKG_VERSION")),
                session_id: self.identity.session_id.clone(),
                client_id: self.identity.client_id.clone(),
                session_count: input.seq,
                first_run_date: self
                    .identity
                    .first_run
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
                os: device.system_name.clone(),
                os_version: device.system_version.clone(),
                architecture: device.architecture.clone(),
                locale: device.locale.clone(),
                app_build: device.app_build.clone(),
                app_display_version: device.app_version.clone(),
                app_channel: device.app_channel.clone(),
            },
        }
    }

    /// Serialize a ping as compact UTF-8 JSON. Forward slashes are not escaped.
    pub fn serialize(ping: &Ping) -> Result<String, PayloadError> {
        serde_json::to_string(ping).map_err(|e| PayloadError::Serialization(e.to_string()))
    }

    /// Build and serialize in one step.
    pub fn build_json(&self, input: &TickInput<'_>) -> Result<String, PayloadError> {
        Self::serialize(&self.build(input))
    }
}
