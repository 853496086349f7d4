//! Fan-in of asynchronous sensor producers into the snapshot store.
//!
//! Producers push [`SensorUpdate`]s through a bounded mailbox. A single pump
//! thread drains it, so writes for one kind are applied in arrival order,
//! and producers never share a thread with the scheduler.

use super::types::{
    AmbientLightSample, Authorization, CameraFrame, ImageSample, LocationSample, MotionSample,
    Reading, SensorKind, SensorUpdate,
};
use super::{CameraProvider, FrameAnalyzer, LocationProvider, MotionSensor};
use super::desktop::{LumaFrameAnalyzer, NoCamera, NoLocation, NoMotion};
use crate::config::{OptionsCell, StreamOptions};
use crate::store::SnapshotStore;
use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Mailbox capacity. Frames beyond this are dropped rather than queued.
const MAILBOX_CAPACITY: usize = 256;

/// How often the pump checks whether it should exit.
const PUMP_POLL: Duration = Duration::from_millis(100);

/// Sending side of the hub mailbox, handed to push producers.
#[derive(Debug, Clone)]
pub struct ProducerHandle {
    sender: Sender<SensorUpdate>,
}

impl ProducerHandle {
    pub fn location(&self, sample: LocationSample) {
        self.push(SensorUpdate::Location(sample));
    }

    pub fn location_authorization(&self, authorization: Authorization) {
        self.push(SensorUpdate::LocationAuthorization(authorization));
    }

    pub fn frame(&self, frame: CameraFrame) {
        self.push(SensorUpdate::Frame(frame));
    }

    pub fn camera_authorization(&self, authorization: Authorization) {
        self.push(SensorUpdate::CameraAuthorization(authorization));
    }

    /// Push without blocking the producer's thread.
    pub fn push(&self, update: SensorUpdate) {
        match self.sender.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                tracing::debug!("Sensor mailbox full, dropping {:?}", update_name(&update));
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::trace!("Sensor hub gone, dropping update");
            }
        }
    }
}

fn update_name(update: &SensorUpdate) -> &'static str {
    match update {
        SensorUpdate::Location(_) => "location",
        SensorUpdate::LocationAuthorization(_) => "location authorization",
        SensorUpdate::Frame(_) => "frame",
        SensorUpdate::CameraAuthorization(_) => "camera authorization",
    }
}

/// The sensor collaborators the engine drives.
#[derive(Clone)]
pub struct Producers {
    pub motion: Arc<dyn MotionSensor>,
    pub location: Arc<dyn LocationProvider>,
    pub camera: Arc<dyn CameraProvider>,
    pub analyzer: Arc<dyn FrameAnalyzer>,
}

impl Default for Producers {
    fn default() -> Self {
        Self {
            motion: Arc::new(NoMotion),
            location: Arc::new(NoLocation),
            camera: Arc::new(NoCamera),
            analyzer: Arc::new(LumaFrameAnalyzer),
        }
    }
}

struct HubShared {
    store: Arc<SnapshotStore>,
    options: Arc<OptionsCell>,
    producers: Producers,
    handle: ProducerHandle,
    image_capture_interval: Duration,
    /// Producers should be running (the scheduler is streaming)
    active: AtomicBool,
    location_running: AtomicBool,
    camera_running: AtomicBool,
    /// Serializes producer reconfiguration against mailbox writes
    control: Mutex<()>,
}

/// Owns the producer lifecycle and the mailbox pump.
pub struct SensorHub {
    shared: Arc<HubShared>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl SensorHub {
    /// Create the hub and start its pump thread.
    pub fn new(
        store: Arc<SnapshotStore>,
        options: Arc<OptionsCell>,
        producers: Producers,
        image_capture_interval: Duration,
    ) -> Self {
        let (sender, receiver) = bounded(MAILBOX_CAPACITY);
        let shared = Arc::new(HubShared {
            store,
            options,
            producers,
            handle: ProducerHandle { sender },
            image_capture_interval,
            active: AtomicBool::new(false),
            location_running: AtomicBool::new(false),
            camera_running: AtomicBool::new(false),
            control: Mutex::new(()),
        });

        let running = Arc::new(AtomicBool::new(true));
        let pump_shared = shared.clone();
        let pump_running = running.clone();
        let handle = thread::Builder::new()
            .name("sensor-hub".to_string())
            .spawn(move || run_pump(receiver, pump_shared, pump_running))
            .map_err(|e| tracing::error!("Could not spawn sensor hub thread: {e}"))
            .ok();

        Self {
            shared,
            running,
            thread_handle: handle,
        }
    }

    /// Handle for producers to push updates.
    pub fn handle(&self) -> ProducerHandle {
        self.shared.handle.clone()
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.shared.store
    }

    /// Synchronous motion pull.
    pub fn current_motion(&self) -> Option<MotionSample> {
        self.shared.producers.motion.current_reading()
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Start or stop each producer to match `options`.
    pub fn apply_options(&self, options: &StreamOptions) {
        let _guard = self.shared.control.lock().unwrap_or_else(|e| e.into_inner());
        self.shared.active.store(true, Ordering::SeqCst);

        let producers = &self.shared.producers;
        if options.include_motion {
            producers.motion.start();
        } else {
            producers.motion.stop();
        }

        let location_auth = producers.location.authorization();
        self.shared.apply_location_access(options, location_auth, true);

        let camera_auth = producers.camera.authorization();
        self.shared.apply_camera_access(options, camera_auth, true);
    }

    /// Stop every producer and drop cached readings.
    pub fn stop_all(&self) {
        let _guard = self.shared.control.lock().unwrap_or_else(|e| e.into_inner());
        self.shared.active.store(false, Ordering::SeqCst);

        self.shared.producers.motion.stop();
        self.shared.stop_location();
        self.shared.stop_camera();
        let store = &self.shared.store;
        store.clear(SensorKind::Location);
        store.clear(SensorKind::AmbientLight);
        store.clear(SensorKind::Image);
    }

    /// Stop the pump thread.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SensorHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl HubShared {
    fn apply_location_access(
        &self,
        options: &StreamOptions,
        authorization: Authorization,
        may_request: bool,
    ) {
        if !options.include_location {
            self.stop_location();
            self.store.clear(SensorKind::Location);
            return;
        }

        match authorization {
            Authorization::Granted => {
                if !self.location_running.swap(true, Ordering::SeqCst) {
                    tracing::info!("Starting location updates");
                    self.producers.location.start_updates(self.handle.clone());
                }
            }
            Authorization::NotDetermined => {
                if may_request {
                    self.producers
                        .location
                        .request_authorization(self.handle.clone());
                }
            }
            Authorization::Denied => {
                tracing::info!("Location access denied, clearing cached location");
                self.stop_location();
                self.store.clear(SensorKind::Location);
            }
        }
    }

    fn apply_camera_access(
        &self,
        options: &StreamOptions,
        authorization: Authorization,
        may_request: bool,
    ) {
        if !options.include_ambient_light {
            self.store.clear(SensorKind::AmbientLight);
        }
        if !options.include_image {
            self.store.clear(SensorKind::Image);
        }
        if !options.needs_camera() {
            self.stop_camera();
            return;
        }

        match authorization {
            Authorization::Granted => {
                if !self.camera_running.swap(true, Ordering::SeqCst) {
                    tracing::info!("Starting camera capture");
                    self.producers.camera.start_capture(self.handle.clone());
                }
            }
            Authorization::NotDetermined => {
                if may_request {
                    self.producers
                        .camera
                        .request_authorization(self.handle.clone());
                }
            }
            Authorization::Denied => {
                tracing::info!("Camera access denied, clearing camera data");
                self.stop_camera();
                self.store.clear(SensorKind::AmbientLight);
                self.store.clear(SensorKind::Image);
            }
        }
    }

    fn stop_location(&self) {
        if self.location_running.swap(false, Ordering::SeqCst) {
            self.producers.location.stop_updates();
        }
    }

    fn stop_camera(&self) {
        if self.camera_running.swap(false, Ordering::SeqCst) {
            self.producers.camera.stop_capture();
        }
    }

    fn handle_update(&self, update: SensorUpdate) {
        let _guard = self.control.lock().unwrap_or_else(|e| e.into_inner());
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        let options = self.options.load();

        match update {
            SensorUpdate::Location(sample) => {
                if options.include_location {
                    self.store.write(Reading::Location(sample));
                }
            }
            SensorUpdate::LocationAuthorization(authorization) => {
                self.apply_location_access(&options, authorization, false);
            }
            SensorUpdate::Frame(frame) => self.handle_frame(&options, &frame),
            SensorUpdate::CameraAuthorization(authorization) => {
                self.apply_camera_access(&options, authorization, false);
            }
        }
    }

    fn handle_frame(&self, options: &StreamOptions, frame: &CameraFrame) {
        if options.include_ambient_light {
            if let Some(level) = self.producers.analyzer.brightness(frame) {
                self.store
                    .write(Reading::AmbientLight(AmbientLightSample::new(level)));
            }
        }

        if options.include_image {
            let now = Instant::now();
            if !self.store.image_capture_due(now, self.image_capture_interval) {
                return;
            }
            if let Some(encoded) = self.producers.analyzer.encode(frame) {
                self.store.record_image(
                    ImageSample {
                        encoded,
                        captured_at: Utc::now(),
                    },
                    now,
                );
            }
        }
    }
}

fn run_pump(receiver: Receiver<SensorUpdate>, shared: Arc<HubShared>, running: Arc<AtomicBool>) {
    tracing::debug!("Sensor hub pump started");
    while running.load(Ordering::SeqCst) {
        match receiver.recv_timeout(PUMP_POLL) {
            Ok(update) => shared.handle_update(update),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!("Sensor hub pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Location provider whose authorization is set by the test.
    struct ScriptedLocation {
        authorization: Mutex<Authorization>,
        starts: AtomicUsize,
        stops: AtomicUsize,
        requests: AtomicUsize,
    }

    impl ScriptedLocation {
        fn new(authorization: Authorization) -> Self {
            Self {
                authorization: Mutex::new(authorization),
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                requests: AtomicUsize::new(0),
            }
        }
    }

    impl LocationProvider for ScriptedLocation {
        fn authorization(&self) -> Authorization {
            *self.authorization.lock().unwrap()
        }

        fn request_authorization(&self, _sink: ProducerHandle) {
            self.requests.fetch_add(1, Ordering::SeqCst);
        }

        fn start_updates(&self, _sink: ProducerHandle) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn stop_updates(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct GrantedCamera;

    impl CameraProvider for GrantedCamera {
        fn authorization(&self) -> Authorization {
            Authorization::Granted
        }

        fn request_authorization(&self, _sink: ProducerHandle) {}

        fn start_capture(&self, _sink: ProducerHandle) {}

        fn stop_capture(&self) {}
    }

    /// Analyzer that counts encodings.
    #[derive(Default)]
    struct CountingAnalyzer {
        encoded: AtomicUsize,
    }

    impl FrameAnalyzer for CountingAnalyzer {
        fn brightness(&self, frame: &CameraFrame) -> Option<f64> {
            LumaFrameAnalyzer.brightness(frame)
        }

        fn encode(&self, _frame: &CameraFrame) -> Option<String> {
            let n = self.encoded.fetch_add(1, Ordering::SeqCst);
            Some(format!("img-{n}"))
        }
    }

    fn fix(v: f64) -> LocationSample {
        LocationSample {
            latitude: v,
            longitude: v,
            accuracy_meters: 10.0,
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn hub_with(
        options: StreamOptions,
        location: Arc<ScriptedLocation>,
        analyzer: Arc<CountingAnalyzer>,
        image_interval: Duration,
    ) -> (SensorHub, Arc<OptionsCell>) {
        let cell = Arc::new(OptionsCell::new(options));
        let producers = Producers {
            motion: Arc::new(NoMotion),
            location,
            camera: Arc::new(GrantedCamera),
            analyzer,
        };
        let hub = SensorHub::new(
            Arc::new(SnapshotStore::new()),
            cell.clone(),
            producers,
            image_interval,
        );
        (hub, cell)
    }

    #[test]
    fn test_location_flow_and_disable() {
        let mut options = StreamOptions::none();
        options.include_location = true;
        let location = Arc::new(ScriptedLocation::new(Authorization::Granted));
        let (hub, cell) = hub_with(
            options,
            location.clone(),
            Arc::new(CountingAnalyzer::default()),
            Duration::from_secs(1),
        );

        hub.apply_options(&options);
        assert_eq!(location.starts.load(Ordering::SeqCst), 1);

        hub.handle().location(fix(1.0));
        assert!(wait_for(|| hub.store().location() == Some(fix(1.0))));

        // Disabling clears the cache and ignores later pushes
        let disabled = StreamOptions::none();
        cell.replace(disabled);
        hub.apply_options(&disabled);
        assert_eq!(location.stops.load(Ordering::SeqCst), 1);
        assert!(hub.store().location().is_none());
        hub.handle().location(fix(2.0));
        thread::sleep(Duration::from_millis(150));
        assert!(hub.store().location().is_none());

        // Re-enabling resumes once new data arrives
        cell.replace(options);
        hub.apply_options(&options);
        assert_eq!(location.starts.load(Ordering::SeqCst), 2);
        hub.handle().location(fix(3.0));
        assert!(wait_for(|| hub.store().location() == Some(fix(3.0))));
    }

    #[test]
    fn test_authorization_revoked_clears_location() {
        let mut options = StreamOptions::none();
        options.include_location = true;
        let location = Arc::new(ScriptedLocation::new(Authorization::Granted));
        let (hub, _cell) = hub_with(
            options,
            location.clone(),
            Arc::new(CountingAnalyzer::default()),
            Duration::from_secs(1),
        );
        hub.apply_options(&options);

        hub.handle().location(fix(5.0));
        assert!(wait_for(|| hub.store().location().is_some()));

        hub.handle().location_authorization(Authorization::Denied);
        assert!(wait_for(|| hub.store().location().is_none()));
        assert_eq!(location.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_not_determined_requests_authorization() {
        let mut options = StreamOptions::none();
        options.include_location = true;
        let location = Arc::new(ScriptedLocation::new(Authorization::NotDetermined));
        let (hub, _cell) = hub_with(
            options,
            location.clone(),
            Arc::new(CountingAnalyzer::default()),
            Duration::from_secs(1),
        );
        hub.apply_options(&options);
        assert_eq!(location.requests.load(Ordering::SeqCst), 1);
        assert_eq!(location.starts.load(Ordering::SeqCst), 0);

        hub.handle().location_authorization(Authorization::Granted);
        assert!(wait_for(|| location.starts.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_image_capture_throttled() {
        let mut options = StreamOptions::none();
        options.include_ambient_light = true;
        options.include_image = true;
        let analyzer = Arc::new(CountingAnalyzer::default());
        let (hub, _cell) = hub_with(
            options,
            Arc::new(ScriptedLocation::new(Authorization::Denied)),
            analyzer.clone(),
            Duration::from_millis(300),
        );
        hub.apply_options(&options);

        let start = Instant::now();
        for _ in 0..40 {
            hub.handle().frame(CameraFrame::solid(2, 2, [255, 255, 255]));
            thread::sleep(Duration::from_millis(10));
        }
        assert!(wait_for(|| hub.store().ambient_light().is_some()));

        let captured = analyzer.encoded.load(Ordering::SeqCst);
        let elapsed = start.elapsed();
        let allowed = (elapsed.as_millis() / 300) as usize + 1;
        assert!(captured >= 1);
        assert!(
            captured <= allowed,
            "captured {captured} pictures in {elapsed:?}"
        );
        assert!(hub.store().image().is_some());
        assert!((hub.store().ambient_light().unwrap().level - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_stop_all_ignores_late_pushes() {
        let mut options = StreamOptions::none();
        options.include_ambient_light = true;
        let (hub, _cell) = hub_with(
            options,
            Arc::new(ScriptedLocation::new(Authorization::Denied)),
            Arc::new(CountingAnalyzer::default()),
            Duration::from_secs(1),
        );
        hub.apply_options(&options);
        hub.handle().frame(CameraFrame::solid(1, 1, [10, 10, 10]));
        assert!(wait_for(|| hub.store().ambient_light().is_some()));

        hub.stop_all();
        assert!(!hub.is_active());
        assert!(hub.store().ambient_light().is_none());

        hub.handle().frame(CameraFrame::solid(1, 1, [10, 10, 10]));
        thread::sleep(Duration::from_millis(150));
        assert!(hub.store().ambient_light().is_none());
    }
}
