//! The streaming engine: one object wiring store, hub, scheduler, transport
//! and lifecycle guard together, with explicit construction and teardown.

use crate::config::{join_segment, Config, ConfigError, OptionsCell, StreamOptions};
use crate::lifecycle::{ExtendedExecution, LifecycleGuard, UnmanagedExecution};
use crate::payload::{DeviceInfo, PayloadBuilder, SessionIdentity};
use crate::scheduler::{SchedulerParts, StreamScheduler, StreamState};
use crate::sensors::hub::{Producers, SensorHub};
use crate::sensors::{BrightnessSource, ProducerHandle, SysfsBacklight};
use crate::store::SnapshotStore;
use crate::transparency::{create_shared_log_with_persistence, SharedStreamLog};
use crate::transport::{DefaultTransportFactory, Endpoint, TransportFactory, TransportStatus};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;

/// File under `data_path` holding the stream statistics.
pub const STATS_FILE: &str = "stream_stats.json";

/// Host-provided collaborators.
pub struct Collaborators {
    pub producers: Producers,
    pub brightness: Arc<dyn BrightnessSource>,
    /// Overrides the transport chosen from the config
    pub transports: Option<Arc<dyn TransportFactory>>,
    pub extended_execution: Arc<dyn ExtendedExecution>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            producers: Producers::default(),
            brightness: Arc::new(SysfsBacklight::detect()),
            transports: None,
            extended_execution: Arc::new(UnmanagedExecution),
        }
    }
}

impl Collaborators {
    pub fn with_producers(mut self, producers: Producers) -> Self {
        self.producers = producers;
        self
    }

    pub fn with_brightness(mut self, brightness: Arc<dyn BrightnessSource>) -> Self {
        self.brightness = brightness;
        self
    }

    pub fn with_transports(mut self, transports: Arc<dyn TransportFactory>) -> Self {
        self.transports = Some(transports);
        self
    }

    pub fn with_extended_execution(mut self, host: Arc<dyn ExtendedExecution>) -> Self {
        self.extended_execution = host;
        self
    }
}

/// Process-wide streaming service.
pub struct StreamEngine {
    scheduler: StreamScheduler,
    hub: Arc<SensorHub>,
    lifecycle: LifecycleGuard,
    log: SharedStreamLog,
    /// Last applied configuration
    applied: Mutex<Config>,
}

impl StreamEngine {
    /// Validate `config` and build the engine. Nothing streams until
    /// [`start`](Self::start).
    pub fn new(
        config: Config,
        collaborators: Collaborators,
        runtime: Handle,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let endpoint = Endpoint::parse(&config.target_url()?, config.transport)
            .map_err(|e| ConfigError::InvalidEndpoint(e.to_string()))?;
        let transports = collaborators.transports.unwrap_or_else(|| {
            Arc::new(DefaultTransportFactory::new(
                config.transport,
                config.reconnect_backoff,
                config.request_timeout,
            ))
        });
        transports
            .check(&endpoint)
            .map_err(|e| ConfigError::InvalidEndpoint(e.to_string()))?;

        let options = Arc::new(OptionsCell::new(config.options));
        let hub = Arc::new(SensorHub::new(
            Arc::new(SnapshotStore::new()),
            options.clone(),
            collaborators.producers,
            config.image_capture_interval,
        ));
        let log = create_shared_log_with_persistence(config.data_path.join(STATS_FILE));

        let builder = PayloadBuilder::new(
            config.telemetry_id.clone(),
            SessionIdentity::new(config.client_id.clone()),
            DeviceInfo::detect(config.app_channel.clone()),
        );

        let scheduler = StreamScheduler::new(
            SchedulerParts {
                hub: hub.clone(),
                options,
                brightness: collaborators.brightness,
                builder,
                transports,
                log: log.clone(),
                mode: config.transport,
                endpoint,
                interval: config.interval,
            },
            runtime,
        );
        let lifecycle = LifecycleGuard::new(collaborators.extended_execution, config.allow_background);

        Ok(Self {
            scheduler,
            hub,
            lifecycle,
            log,
            applied: Mutex::new(config),
        })
    }

    pub fn start(&self) {
        self.scheduler.start();
    }

    /// Stop streaming and give back any background grant.
    pub fn stop(&self) {
        self.scheduler.stop();
        self.lifecycle.release();
        if let Err(e) = self.log.save() {
            tracing::warn!("Failed to save stream stats: {e}");
        }
    }

    pub fn update_options(&self, options: StreamOptions) {
        self.scheduler.update_options(options);
        self.lock_applied().options = options;
    }

    pub fn update_interval(&self, secs: f64) -> Result<(), ConfigError> {
        self.scheduler.update_interval(secs)?;
        self.lock_applied().interval = self.scheduler.interval();
        Ok(())
    }

    /// Replace the whole target URL.
    pub fn update_endpoint(&self, url: &str) -> Result<(), ConfigError> {
        self.scheduler.update_endpoint(url)?;
        let mut applied = self.lock_applied();
        applied.endpoint = url.trim().to_string();
        applied.endpoint_segment = None;
        Ok(())
    }

    /// Keep the base URL and append a new parameter segment to it.
    pub fn update_endpoint_parameter(&self, segment: &str) -> Result<(), ConfigError> {
        let base = self.lock_applied().endpoint.clone();
        self.scheduler.update_endpoint(&join_segment(&base, segment)?)?;
        self.lock_applied().endpoint_segment = Some(segment.trim().to_string());
        Ok(())
    }

    pub fn set_background_streaming_allowed(&self, allowed: bool) {
        self.lifecycle.set_allowed(allowed);
        self.lock_applied().allow_background = allowed;
    }

    /// The host is about to be backgrounded.
    pub fn enter_background(&self) {
        self.lifecycle
            .enter_background(self.state() == StreamState::Streaming);
    }

    /// The host returned to the foreground.
    pub fn enter_foreground(&self) {
        self.lifecycle.enter_foreground();
    }

    /// Bring the running engine in line with a (re)loaded config file.
    ///
    /// The transport mode and the identity fields only take effect on the
    /// next engine construction.
    pub fn apply_config(&self, config: &Config) -> Result<(), ConfigError> {
        let current = self.lock_applied().clone();

        if config.transport != current.transport {
            tracing::warn!(
                "Transport mode change to {} needs a restart, ignoring",
                config.transport
            );
        }
        if config.options != current.options {
            self.update_options(config.options);
        }
        if config.interval != current.interval {
            self.update_interval(config.interval.as_secs_f64())?;
        }
        if config.endpoint != current.endpoint || config.endpoint_segment != current.endpoint_segment
        {
            let target = config.target_url()?;
            self.scheduler.update_endpoint(&target)?;
            let mut applied = self.lock_applied();
            applied.endpoint = config.endpoint.clone();
            applied.endpoint_segment = config.endpoint_segment.clone();
        }
        if config.allow_background != current.allow_background {
            self.set_background_streaming_allowed(config.allow_background);
        }

        match (config.paused, self.state()) {
            (true, StreamState::Streaming) => {
                tracing::info!("Paused via config");
                self.stop();
            }
            (false, StreamState::Idle) => {
                tracing::info!("Resumed via config");
                self.start();
            }
            _ => {}
        }
        self.lock_applied().paused = config.paused;
        Ok(())
    }

    pub fn state(&self) -> StreamState {
        self.scheduler.state()
    }

    pub fn status(&self) -> TransportStatus {
        self.scheduler.status()
    }

    pub fn endpoint(&self) -> Endpoint {
        self.scheduler.endpoint()
    }

    pub fn interval(&self) -> Duration {
        self.scheduler.interval()
    }

    pub fn options(&self) -> StreamOptions {
        self.scheduler.options()
    }

    pub fn log(&self) -> &SharedStreamLog {
        &self.log
    }

    /// Handle platform producers push their updates through.
    pub fn producer_handle(&self) -> ProducerHandle {
        self.hub.handle()
    }

    pub fn is_background_grant_held(&self) -> bool {
        self.lifecycle.is_held()
    }

    /// Stop everything and persist the statistics.
    pub fn shutdown(&self) {
        self.stop();
        tracing::info!("Engine shut down");
    }

    fn lock_applied(&self) -> std::sync::MutexGuard<'_, Config> {
        self.applied.lock().unwrap_or_else(|e| e.into_inner())
    }
}
