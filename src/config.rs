//! Configuration for the sensor telemetry streamer.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

/// Default collector endpoint used until the user configures one.
pub const DEFAULT_ENDPOINT: &str = "tcp://127.0.0.1:7878/telemetry";

/// Default parameter segment appended to the endpoint.
pub const DEFAULT_ENDPOINT_SEGMENT: &str = "IPHONE-DATA";

/// Main configuration for the streamer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the collector
    pub endpoint: String,

    /// Optional parameter segment appended to `endpoint`
    pub endpoint_segment: Option<String>,

    /// How pings are shipped
    pub transport: TransportMode,

    /// Time between two pings
    #[serde(with = "duration_serde")]
    pub interval: Duration,

    /// Which sensors feed a ping
    pub options: StreamOptions,

    /// Whether streaming may continue briefly after the host is backgrounded
    pub allow_background: bool,

    /// Whether streaming is currently paused
    pub paused: bool,

    /// Fixed delay before a persistent connection is re-established
    #[serde(with = "duration_serde")]
    pub reconnect_backoff: Duration,

    /// Minimum time between two captured pictures
    #[serde(with = "duration_serde")]
    pub image_capture_interval: Duration,

    /// Timeout for a single request-mode POST
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,

    /// Identifier recorded as page id, `id` and `uuid` in every ping
    pub telemetry_id: String,

    /// Install-stable client identifier
    pub client_id: String,

    /// Release channel reported in `client_info`
    pub app_channel: String,

    /// Path for storing stream statistics
    pub data_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sensor-telemetry-streamer");

        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            endpoint_segment: Some(DEFAULT_ENDPOINT_SEGMENT.to_string()),
            transport: TransportMode::Persistent,
            interval: IntervalPreset::Hz10.interval(),
            options: StreamOptions::default(),
            allow_background: false,
            paused: false,
            reconnect_backoff: Duration::from_secs(2),
            image_capture_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
            telemetry_id: Uuid::new_v4().to_string(),
            client_id: Uuid::new_v4().to_string(),
            app_channel: "prod".to_string(),
            data_path: data_dir,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration, writing a fresh one on first run so the
    /// generated identifiers stay stable for this install.
    pub fn load_or_init() -> Result<Self, ConfigError> {
        let path = Self::config_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Self::default();
            config.save_to(&path)?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit path, falling back to defaults
    /// when the file does not exist.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
            let config: Config =
                serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to an explicit path.
    pub fn save_to(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sensor-telemetry-streamer")
            .join("config.json")
    }

    /// Ensure the data directory exists.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path).map_err(|e| ConfigError::Io(e.to_string()))
    }

    /// The full target URL: `endpoint` plus the optional segment.
    pub fn target_url(&self) -> Result<String, ConfigError> {
        match self.endpoint_segment.as_deref() {
            Some(segment) => join_segment(&self.endpoint, segment),
            None => Ok(self.endpoint.trim().to_string()),
        }
    }

    /// Check every value a running stream depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_interval(self.interval)?;
        validate_interval(self.reconnect_backoff)?;
        crate::transport::Endpoint::parse(&self.target_url()?, self.transport)
            .map_err(|e| ConfigError::InvalidEndpoint(e.to_string()))?;
        Ok(())
    }
}

/// Append a parameter segment to a base URL, inserting a `/` only when the
/// base does not already end with one.
pub fn join_segment(base: &str, segment: &str) -> Result<String, ConfigError> {
    let base = base.trim();
    let segment = segment.trim();
    if base.is_empty() {
        return Err(ConfigError::InvalidEndpoint("empty base URL".to_string()));
    }
    if segment.is_empty() {
        return Err(ConfigError::InvalidEndpoint(
            "empty endpoint parameter".to_string(),
        ));
    }
    let separator = if base.ends_with('/') { "" } else { "/" };
    Ok(format!("{base}{separator}{segment}"))
}

/// Longest accepted emission interval.
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Reject zero, sub-microsecond and longer-than-a-day intervals.
pub fn validate_interval(interval: Duration) -> Result<Duration, ConfigError> {
    if interval < Duration::from_micros(1) || interval > MAX_INTERVAL {
        return Err(ConfigError::InvalidInterval(interval.as_secs_f64()));
    }
    Ok(interval)
}

/// Convert caller-supplied seconds into a validated interval.
pub fn interval_from_secs(secs: f64) -> Result<Duration, ConfigError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ConfigError::InvalidInterval(secs));
    }
    let interval =
        Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidInterval(secs))?;
    validate_interval(interval)
}

/// Which sensors feed a ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    pub include_motion: bool,
    pub include_location: bool,
    pub include_ambient_light: bool,
    pub include_image: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            include_motion: true,
            include_location: false,
            include_ambient_light: false,
            include_image: false,
        }
    }
}

impl StreamOptions {
    /// Options with every sensor switched off.
    pub fn none() -> Self {
        Self {
            include_motion: false,
            include_location: false,
            include_ambient_light: false,
            include_image: false,
        }
    }

    /// Parse sensor selection from a comma-separated string.
    pub fn from_csv(s: &str) -> Self {
        let sensors: Vec<String> = s.split(',').map(|s| s.trim().to_lowercase()).collect();
        let has = |names: &[&str]| sensors.iter().any(|s| s == "all" || names.contains(&s.as_str()));

        Self {
            include_motion: has(&["motion", "gyro", "gyroscope"]),
            include_location: has(&["location"]),
            include_ambient_light: has(&["light", "camera-light"]),
            include_image: has(&["image", "picture"]),
        }
    }

    /// Whether the camera has to run for these options.
    pub fn needs_camera(&self) -> bool {
        self.include_ambient_light || self.include_image
    }

    /// Comma-separated list of enabled sensors, for display.
    pub fn describe(&self) -> String {
        let mut enabled = Vec::new();
        if self.include_motion {
            enabled.push("motion");
        }
        if self.include_location {
            enabled.push("location");
        }
        if self.include_ambient_light {
            enabled.push("light");
        }
        if self.include_image {
            enabled.push("image");
        }
        if enabled.is_empty() {
            "none".to_string()
        } else {
            enabled.join(",")
        }
    }
}

/// Shared, wholesale-replaced options.
///
/// Readers take a cheap `Arc` clone and never observe a half-updated set.
#[derive(Debug)]
pub struct OptionsCell(RwLock<Arc<StreamOptions>>);

impl OptionsCell {
    pub fn new(options: StreamOptions) -> Self {
        Self(RwLock::new(Arc::new(options)))
    }

    /// The latest committed options.
    pub fn load(&self) -> Arc<StreamOptions> {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Atomically replace the options.
    pub fn replace(&self, options: StreamOptions) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(options);
    }
}

impl Default for OptionsCell {
    fn default() -> Self {
        Self::new(StreamOptions::default())
    }
}

/// How pings reach the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// One long-lived bidirectional connection reused across ticks
    Persistent,
    /// One independent request per tick
    Request,
}

impl TransportMode {
    /// URL schemes this mode can talk to.
    pub fn schemes(&self) -> &'static [&'static str] {
        match self {
            TransportMode::Persistent => &["tcp", "ws", "wss"],
            TransportMode::Request => &["http", "https"],
        }
    }
}

impl std::str::FromStr for TransportMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "persistent" | "socket" => Ok(TransportMode::Persistent),
            "request" | "http" => Ok(TransportMode::Request),
            other => Err(ConfigError::Parse(format!("unknown transport mode '{other}'"))),
        }
    }
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportMode::Persistent => write!(f, "persistent"),
            TransportMode::Request => write!(f, "request"),
        }
    }
}

/// Common sampling rates offered to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalPreset {
    Hz60,
    Hz20,
    Hz10,
    Hz4,
}

impl IntervalPreset {
    pub fn interval(&self) -> Duration {
        match self {
            IntervalPreset::Hz60 => Duration::from_secs_f64(1.0 / 60.0),
            IntervalPreset::Hz20 => Duration::from_millis(50),
            IntervalPreset::Hz10 => Duration::from_millis(100),
            IntervalPreset::Hz4 => Duration::from_millis(250),
        }
    }

    /// Parse labels such as `60hz` or `4`.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().trim_end_matches("hz") {
            "60" => Some(IntervalPreset::Hz60),
            "20" => Some(IntervalPreset::Hz20),
            "10" => Some(IntervalPreset::Hz10),
            "4" => Some(IntervalPreset::Hz4),
            _ => None,
        }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Serialize(String),
    InvalidInterval(f64),
    InvalidEndpoint(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {e}"),
            ConfigError::Parse(e) => write!(f, "Parse error: {e}"),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {e}"),
            ConfigError::InvalidInterval(secs) => {
                write!(f, "Invalid interval: {secs}s (must be positive)")
            }
            ConfigError::InvalidEndpoint(e) => write!(f, "Invalid endpoint: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde support for Duration as fractional seconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_options_parsing() {
        let options = StreamOptions::from_csv("motion,location");
        assert!(options.include_motion);
        assert!(options.include_location);
        assert!(!options.include_ambient_light);
        assert!(!options.include_image);

        let options = StreamOptions::from_csv("light, picture");
        assert!(!options.include_motion);
        assert!(options.include_ambient_light);
        assert!(options.include_image);
        assert!(options.needs_camera());

        let options = StreamOptions::from_csv("all");
        assert_eq!(options.describe(), "motion,location,light,image");
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.interval, Duration::from_millis(100));
        assert_eq!(config.reconnect_backoff, Duration::from_secs(2));
        assert_eq!(config.image_capture_interval, Duration::from_secs(1));
        assert_eq!(config.transport, TransportMode::Persistent);
        assert!(config.options.include_motion);
        assert!(!config.options.include_location);
        assert!(!config.paused);
        assert_ne!(config.telemetry_id, config.client_id);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_interval_validation() {
        assert!(interval_from_secs(0.0).is_err());
        assert!(interval_from_secs(-1.0).is_err());
        assert!(interval_from_secs(f64::NAN).is_err());
        assert!(interval_from_secs(f64::INFINITY).is_err());
        assert_eq!(
            interval_from_secs(0.25).unwrap(),
            IntervalPreset::Hz4.interval()
        );
        assert!(validate_interval(Duration::ZERO).is_err());

        assert!(matches!(
            interval_from_secs(1e19),
            Err(ConfigError::InvalidInterval(_))
        ));
        assert!(interval_from_secs(MAX_INTERVAL.as_secs_f64() + 1.0).is_err());
        assert_eq!(interval_from_secs(MAX_INTERVAL.as_secs_f64()).unwrap(), MAX_INTERVAL);
    }

    #[test]
    fn test_huge_interval_in_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut value = serde_json::to_value(Config::default()).unwrap();
        value["interval"] = serde_json::json!(1e19);
        std::fs::write(&path, value.to_string()).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert!(matches!(
            loaded.validate(),
            Err(ConfigError::InvalidInterval(_))
        ));
    }

    #[test]
    fn test_interval_presets() {
        assert_eq!(IntervalPreset::from_label("60Hz"), Some(IntervalPreset::Hz60));
        assert_eq!(IntervalPreset::from_label("20"), Some(IntervalPreset::Hz20));
        assert_eq!(IntervalPreset::from_label("7hz"), None);
        let hz60 = IntervalPreset::Hz60.interval().as_secs_f64();
        assert!((hz60 - 1.0 / 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_join_segment() {
        assert_eq!(
            join_segment("tcp://host:1/telemetry", "IPHONE-DATA").unwrap(),
            "tcp://host:1/telemetry/IPHONE-DATA"
        );
        assert_eq!(
            join_segment(" tcp://host:1/telemetry/ ", " KEY ").unwrap(),
            "tcp://host:1/telemetry/KEY"
        );
        assert!(join_segment("tcp://host:1", "  ").is_err());
        assert!(join_segment("", "KEY").is_err());
    }

    #[test]
    fn test_transport_mode_parsing() {
        assert_eq!(
            "request".parse::<TransportMode>().unwrap(),
            TransportMode::Request
        );
        assert_eq!(
            "Persistent".parse::<TransportMode>().unwrap(),
            TransportMode::Persistent
        );
        assert!("carrier-pigeon".parse::<TransportMode>().is_err());
    }

    #[test]
    fn test_config_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.interval = Duration::from_millis(50);
        config.transport = TransportMode::Request;
        config.endpoint = "https://collector.example/submit".to_string();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.interval, Duration::from_millis(50));
        assert_eq!(loaded.transport, TransportMode::Request);
        assert_eq!(loaded.client_id, config.client_id);
        assert_eq!(
            loaded.target_url().unwrap(),
            "https://collector.example/submit/IPHONE-DATA"
        );
    }

    #[test]
    fn test_mismatched_endpoint_rejected() {
        let mut config = Config::default();
        config.endpoint = "https://collector.example".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEndpoint(_))
        ));
    }
}
