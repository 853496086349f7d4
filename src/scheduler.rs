//! Periodic assembly and shipping of pings.
//!
//! While streaming, a single timer task owns the cadence. Each tick reads the
//! options, pulls motion, reads the snapshot store and the brightness proxy,
//! stamps the sequence number and time, builds the ping and hands it to the
//! transport without waiting for delivery. Ticks run one after another on
//! that task, so they never overlap.

use crate::config::{
    interval_from_secs, ConfigError, OptionsCell, StreamOptions, TransportMode, MAX_INTERVAL,
};
use crate::payload::{PayloadBuilder, TickInput, STREAM_REASON};
use crate::sensors::hub::SensorHub;
use crate::sensors::BrightnessSource;
use crate::transparency::SharedStreamLog;
use crate::transport::{Endpoint, Transport, TransportFactory, TransportStatus};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Upper bound on the brightness read; a slower read is left out of the ping.
pub const BRIGHTNESS_READ_LIMIT: Duration = Duration::from_millis(50);

/// Externally visible scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Streaming,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamState::Idle => write!(f, "Idle"),
            StreamState::Streaming => write!(f, "Streaming"),
        }
    }
}

/// Everything the scheduler is wired to.
pub struct SchedulerParts {
    pub hub: Arc<SensorHub>,
    pub options: Arc<OptionsCell>,
    pub brightness: Arc<dyn BrightnessSource>,
    pub builder: PayloadBuilder,
    pub transports: Arc<dyn TransportFactory>,
    pub log: SharedStreamLog,
    pub mode: TransportMode,
    pub endpoint: Endpoint,
    pub interval: Duration,
}

/// Transport of one streaming session. Emptied on stop, so a tick racing
/// with stop can no longer reach the closed session.
struct SessionLink {
    transport: Mutex<Option<Arc<dyn Transport>>>,
}

impl SessionLink {
    /// `None` once the session has been stopped, otherwise whether the
    /// transport accepted the frame.
    fn send(&self, frame: String) -> Option<bool> {
        let transport = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        transport.as_ref().map(|transport| transport.send(frame))
    }
}

struct Session {
    timer: JoinHandle<()>,
    interval: watch::Sender<Duration>,
    link: Arc<SessionLink>,
    transport: Arc<dyn Transport>,
}

enum SchedulerState {
    Idle,
    Streaming(Session),
}

/// Per-tick work shared with the timer task.
struct TickContext {
    options: Arc<OptionsCell>,
    hub: Arc<SensorHub>,
    brightness: Arc<dyn BrightnessSource>,
    builder: PayloadBuilder,
    endpoint: RwLock<Endpoint>,
    log: SharedStreamLog,
    /// Next sequence number. Lives as long as the scheduler; stop and start
    /// never reset it.
    next_seq: AtomicU64,
    /// Brightness read still running from an earlier tick
    brightness_read: Mutex<Option<JoinHandle<Option<f64>>>>,
}

/// The start/stop/reconfigure state machine.
pub struct StreamScheduler {
    ticks: Arc<TickContext>,
    transports: Arc<dyn TransportFactory>,
    mode: TransportMode,
    interval: Mutex<Duration>,
    state: Mutex<SchedulerState>,
    runtime: Handle,
}

impl StreamScheduler {
    pub fn new(parts: SchedulerParts, runtime: Handle) -> Self {
        let ticks = Arc::new(TickContext {
            options: parts.options,
            hub: parts.hub,
            brightness: parts.brightness,
            builder: parts.builder,
            endpoint: RwLock::new(parts.endpoint),
            log: parts.log,
            next_seq: AtomicU64::new(1),
            brightness_read: Mutex::new(None),
        });

        Self {
            ticks,
            transports: parts.transports,
            mode: parts.mode,
            interval: Mutex::new(parts.interval),
            state: Mutex::new(SchedulerState::Idle),
            runtime,
        }
    }

    /// Begin streaming. No-op while already streaming.
    pub fn start(&self) {
        let mut state = self.lock_state();
        if matches!(*state, SchedulerState::Streaming(_)) {
            tracing::debug!("start() ignored, already streaming");
            return;
        }

        let options = self.ticks.options.load();
        self.ticks.hub.apply_options(&options);

        let endpoint = self.endpoint();
        let transport = self.transports.open(endpoint.clone(), &self.runtime);
        let link = Arc::new(SessionLink {
            transport: Mutex::new(Some(transport.clone())),
        });

        let interval = *self.interval.lock().unwrap_or_else(|e| e.into_inner());
        let (interval_tx, interval_rx) = watch::channel(interval);
        let timer = self
            .runtime
            .spawn(run_timer(self.ticks.clone(), link.clone(), interval_rx));

        tracing::info!(
            "Streaming to {endpoint} every {interval:?} ({})",
            options.describe()
        );
        *state = SchedulerState::Streaming(Session {
            timer,
            interval: interval_tx,
            link,
            transport,
        });
    }

    /// Stop streaming: cancel the timer, stop producers, close the transport.
    pub fn stop(&self) {
        let mut state = self.lock_state();
        let SchedulerState::Streaming(session) = std::mem::replace(&mut *state, SchedulerState::Idle)
        else {
            return;
        };

        session.timer.abort();
        session
            .link
            .transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.ticks.hub.stop_all();
        session.transport.close();
        tracing::info!("Streaming stopped");
    }

    /// Replace the options. While streaming, producers are reconfigured and
    /// the next tick uses the new options; while idle they are only stored.
    pub fn update_options(&self, options: StreamOptions) {
        let state = self.lock_state();
        self.ticks.options.replace(options);
        if matches!(*state, SchedulerState::Streaming(_)) {
            self.ticks.hub.apply_options(&options);
            tracing::info!("Options updated: {}", options.describe());
        }
    }

    /// Change the emission interval. Rejected without side effects unless
    /// `secs` is a positive, finite number.
    pub fn update_interval(&self, secs: f64) -> Result<(), ConfigError> {
        let interval = interval_from_secs(secs)?;
        let state = self.lock_state();
        *self.interval.lock().unwrap_or_else(|e| e.into_inner()) = interval;
        if let SchedulerState::Streaming(session) = &*state {
            session.interval.send_replace(interval);
            tracing::info!("Interval changed to {interval:?}");
        }
        Ok(())
    }

    /// Point subsequent pings at a new endpoint. The cadence is unaffected.
    pub fn update_endpoint(&self, raw: &str) -> Result<(), ConfigError> {
        let endpoint = Endpoint::parse(raw, self.mode)
            .map_err(|e| ConfigError::InvalidEndpoint(e.to_string()))?;
        self.transports
            .check(&endpoint)
            .map_err(|e| ConfigError::InvalidEndpoint(e.to_string()))?;
        let state = self.lock_state();
        *self
            .ticks
            .endpoint
            .write()
            .unwrap_or_else(|e| e.into_inner()) = endpoint.clone();
        if let SchedulerState::Streaming(session) = &*state {
            session.transport.retarget(endpoint);
        }
        Ok(())
    }

    pub fn state(&self) -> StreamState {
        match *self.lock_state() {
            SchedulerState::Idle => StreamState::Idle,
            SchedulerState::Streaming(_) => StreamState::Streaming,
        }
    }

    /// Latest transport outcome, `Idle` when not streaming.
    pub fn status(&self) -> TransportStatus {
        match &*self.lock_state() {
            SchedulerState::Idle => TransportStatus::Idle,
            SchedulerState::Streaming(session) => session.transport.status(),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.ticks
            .endpoint
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn interval(&self) -> Duration {
        *self.interval.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn options(&self) -> StreamOptions {
        *self.ticks.options.load()
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// Sequence number the next tick will carry.
    pub fn next_sequence(&self) -> u64 {
        self.ticks.next_seq.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for StreamScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_timer(
    ticks: Arc<TickContext>,
    link: Arc<SessionLink>,
    mut interval_rx: watch::Receiver<Duration>,
) {
    let period = *interval_rx.borrow_and_update();
    let mut timer = tokio::time::interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_tick: Option<Instant> = None;

    loop {
        tokio::select! {
            fired = timer.tick() => {
                last_tick = Some(fired);
                ticks.tick(&link).await;
            }
            changed = interval_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let period = *interval_rx.borrow_and_update();
                let now = Instant::now();
                let next = match last_tick {
                    Some(t) => t
                        .checked_add(period)
                        .or_else(|| now.checked_add(MAX_INTERVAL))
                        .unwrap_or(now),
                    None => now,
                }
                .max(now);
                timer = tokio::time::interval_at(next, period);
                timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            }
        }
    }
}

impl TickContext {
    async fn tick(&self, link: &SessionLink) {
        let options = self.options.load();
        let motion = if options.include_motion {
            self.hub.current_motion()
        } else {
            None
        };
        let snapshot = self.hub.store().read_all();
        let screen_brightness = self.read_brightness().await;

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let timestamp = Utc::now();
        let endpoint = self
            .endpoint
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .to_string();

        let ping = self.builder.build(&TickInput {
            options: &options,
            motion,
            snapshot,
            screen_brightness,
            seq,
            timestamp,
            endpoint: &endpoint,
            reason: STREAM_REASON,
            message: None,
        });

        match PayloadBuilder::serialize(&ping) {
            Ok(json) => match link.send(json) {
                Some(true) => {
                    if let Some(event) = ping.events.first() {
                        self.log.record_ping(&event.extra);
                    }
                    tracing::trace!("Ping {seq} handed to transport");
                }
                Some(false) => {
                    self.log.record_dropped();
                    tracing::trace!("Ping {seq} not accepted by transport");
                }
                None => {}
            },
            Err(e) => {
                self.log.record_dropped();
                tracing::warn!("Dropping ping {seq}: {e}");
            }
        }
    }

    /// At most one read is in flight. A read that outlives its tick is picked
    /// up again by the following ticks instead of starting another one.
    async fn read_brightness(&self) -> Option<f64> {
        let pending = self
            .brightness_read
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let mut read = match pending {
            Some(read) => read,
            None => {
                let source = self.brightness.clone();
                tokio::task::spawn_blocking(move || source.read())
            }
        };

        let outcome = tokio::time::timeout(BRIGHTNESS_READ_LIMIT, &mut read).await;
        match outcome {
            Ok(Ok(level)) => level.map(|l| l.clamp(0.0, 1.0)),
            Ok(Err(e)) => {
                tracing::debug!("Brightness read failed: {e}");
                None
            }
            Err(_) => {
                tracing::debug!("Brightness read exceeded {BRIGHTNESS_READ_LIMIT:?}");
                *self
                    .brightness_read
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some(read);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{DeviceInfo, SessionIdentity};
    use crate::sensors::desktop::FixedBrightness;
    use crate::sensors::hub::Producers;
    use crate::store::SnapshotStore;
    use crate::transparency::create_shared_log;

    #[derive(Default)]
    struct NullTransport;

    impl Transport for NullTransport {
        fn send(&self, _frame: String) -> bool {
            true
        }
        fn retarget(&self, _endpoint: Endpoint) {}
        fn close(&self) {}
        fn status(&self) -> TransportStatus {
            TransportStatus::Idle
        }
    }

    struct NullFactory;

    impl TransportFactory for NullFactory {
        fn open(&self, _endpoint: Endpoint, _runtime: &Handle) -> Arc<dyn Transport> {
            Arc::new(NullTransport)
        }
    }

    /// Transport that never accepts a frame, like a session still connecting.
    struct RefusingTransport;

    impl Transport for RefusingTransport {
        fn send(&self, _frame: String) -> bool {
            false
        }
        fn retarget(&self, _endpoint: Endpoint) {}
        fn close(&self) {}
        fn status(&self) -> TransportStatus {
            TransportStatus::Connecting {
                endpoint: "tcp://127.0.0.1:7878/t".to_string(),
                attempt: 1,
            }
        }
    }

    struct RefusingFactory;

    impl TransportFactory for RefusingFactory {
        fn open(&self, _endpoint: Endpoint, _runtime: &Handle) -> Arc<dyn Transport> {
            Arc::new(RefusingTransport)
        }
    }

    /// Brightness source that blocks until released.
    #[derive(Default)]
    struct HungBrightness {
        released: std::sync::atomic::AtomicBool,
        reads: std::sync::atomic::AtomicUsize,
    }

    impl BrightnessSource for HungBrightness {
        fn read(&self) -> Option<f64> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            while !self.released.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            Some(0.5)
        }
    }

    struct SlowBrightness;

    impl BrightnessSource for SlowBrightness {
        fn read(&self) -> Option<f64> {
            std::thread::sleep(Duration::from_millis(300));
            Some(0.5)
        }
    }

    fn scheduler(brightness: Arc<dyn BrightnessSource>) -> StreamScheduler {
        scheduler_with(brightness, Arc::new(NullFactory))
    }

    fn scheduler_with(
        brightness: Arc<dyn BrightnessSource>,
        transports: Arc<dyn TransportFactory>,
    ) -> StreamScheduler {
        let options = Arc::new(OptionsCell::default());
        let hub = SensorHub::new(
            Arc::new(SnapshotStore::new()),
            options.clone(),
            Producers::default(),
            Duration::from_secs(1),
        );
        let parts = SchedulerParts {
            hub: Arc::new(hub),
            options,
            brightness,
            builder: PayloadBuilder::new(
                "page",
                SessionIdentity::new("client"),
                DeviceInfo::detect("test"),
            ),
            transports,
            log: create_shared_log(),
            mode: TransportMode::Persistent,
            endpoint: Endpoint::parse("tcp://127.0.0.1:7878/t", TransportMode::Persistent)
                .unwrap(),
            interval: Duration::from_millis(100),
        };
        StreamScheduler::new(parts, Handle::current())
    }

    #[tokio::test]
    async fn test_invalid_reconfiguration_leaves_state() {
        let scheduler = scheduler(Arc::new(FixedBrightness(None)));

        assert!(scheduler.update_interval(0.0).is_err());
        assert!(scheduler.update_interval(-1.0).is_err());
        assert!(scheduler.update_interval(f64::NAN).is_err());
        assert_eq!(scheduler.interval(), Duration::from_millis(100));

        assert!(scheduler.update_endpoint("https://elsewhere/x").is_err());
        assert!(scheduler.update_endpoint("").is_err());
        assert_eq!(scheduler.endpoint().as_str(), "tcp://127.0.0.1:7878/t");

        scheduler.update_interval(0.25).unwrap();
        assert_eq!(scheduler.interval(), Duration::from_millis(250));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_huge_interval_rejected_while_streaming() {
        let scheduler = scheduler(Arc::new(FixedBrightness(None)));
        scheduler.start();

        assert!(matches!(
            scheduler.update_interval(1e19),
            Err(ConfigError::InvalidInterval(_))
        ));
        assert!(scheduler.update_interval(MAX_INTERVAL.as_secs_f64() * 2.0).is_err());
        assert_eq!(scheduler.interval(), Duration::from_millis(100));

        // The timer is still armed and keeps ticking
        let before = scheduler.next_sequence();
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(scheduler.next_sequence() >= before + 2);

        scheduler.update_interval(0.05).unwrap();
        let before = scheduler.next_sequence();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(scheduler.next_sequence() >= before + 3);
        assert_eq!(scheduler.state(), StreamState::Streaming);
        scheduler.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_max_interval_keeps_timer_alive() {
        let scheduler = scheduler(Arc::new(FixedBrightness(None)));
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(30)).await;

        scheduler.update_interval(MAX_INTERVAL.as_secs_f64()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.update_interval(0.05).unwrap();

        let before = scheduler.next_sequence();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(scheduler.next_sequence() >= before + 3);
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_idle_option_update_is_stored() {
        let scheduler = scheduler(Arc::new(FixedBrightness(None)));
        scheduler.update_options(StreamOptions::none());
        assert_eq!(scheduler.options(), StreamOptions::none());
        assert_eq!(scheduler.state(), StreamState::Idle);
        assert_eq!(scheduler.status(), TransportStatus::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_brightness_is_bounded() {
        let slow = scheduler(Arc::new(SlowBrightness));
        let started = std::time::Instant::now();
        assert_eq!(slow.ticks.read_brightness().await, None);
        assert!(started.elapsed() < Duration::from_millis(250));

        let fixed = scheduler(Arc::new(FixedBrightness(Some(1.7))));
        assert_eq!(fixed.ticks.read_brightness().await, Some(1.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hung_brightness_keeps_one_read_in_flight() {
        let source = Arc::new(HungBrightness::default());
        let scheduler = scheduler(source.clone());

        for _ in 0..8 {
            assert_eq!(scheduler.ticks.read_brightness().await, None);
        }
        assert_eq!(source.reads.load(Ordering::SeqCst), 1);

        // The stuck read finishes and its value is used by the next tick
        source.released.store(true, Ordering::SeqCst);
        assert_eq!(scheduler.ticks.read_brightness().await, Some(0.5));
        assert_eq!(source.reads.load(Ordering::SeqCst), 1);

        assert_eq!(scheduler.ticks.read_brightness().await, Some(0.5));
        assert_eq!(source.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_refused_pings_count_as_dropped() {
        let scheduler = scheduler_with(
            Arc::new(FixedBrightness(None)),
            Arc::new(RefusingFactory),
        );
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(250)).await;
        scheduler.stop();

        let stats = scheduler.ticks.log.stats();
        assert_eq!(stats.pings_sent, 0);
        assert!(stats.pings_dropped >= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_stop_cycles() {
        let scheduler = scheduler(Arc::new(FixedBrightness(None)));
        for _ in 0..3 {
            scheduler.start();
            scheduler.start();
            assert_eq!(scheduler.state(), StreamState::Streaming);
            tokio::time::sleep(Duration::from_millis(30)).await;
            scheduler.stop();
            assert_eq!(scheduler.state(), StreamState::Idle);
        }
        // One immediate tick per session at least, never reset between sessions
        assert!(scheduler.next_sequence() >= 4);
    }
}
