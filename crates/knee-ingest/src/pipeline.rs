use crate::events::ErrorKind;
use crate::{
    AnalyticsConfig, AnalyticsRequest, AnalyticsSink, IngestConfig, IngestError, LinkStatus,
    LiveEvent, LiveHub, MetricsHub, ReadingStore, Result, SessionCoordinator, SessionState,
    StatusReport, StoredReading, Subscription,
};
use imu_fusion::ExerciseMode;
use knee_protocol::{parse_line, tags, Command, DeviceMessage, DeviceStatus, ProtocolError, TelemetryFrame};
use link_transport::{LinkDriver, LinkEvent, LinkTransport, PortInfo, PortRegistry, TransportError};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

pub const MAX_SESSION_ID_LEN: usize = 64;

/// Reject session ids the device could not echo back intact.
pub fn validate_session_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(IngestError::Validation("session id is empty".into()));
    }
    if id.chars().count() > MAX_SESSION_ID_LEN {
        return Err(IngestError::Validation(format!(
            "session id longer than {MAX_SESSION_ID_LEN} characters"
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(IngestError::Validation(
            "session id contains control characters".into(),
        ));
    }
    if id.trim() != id {
        return Err(IngestError::Validation(
            "session id has leading or trailing whitespace".into(),
        ));
    }
    Ok(())
}

pub fn validate_mode(code: u8) -> Result<ExerciseMode> {
    ExerciseMode::from_code(code)
        .ok_or_else(|| IngestError::Validation(format!("exercise mode {code} not in 0..=2")))
}

/// Everything the pipeline needs that is chosen at startup.
pub struct PipelineDeps {
    pub driver: Arc<dyn LinkDriver>,
    pub registry: Arc<dyn PortRegistry>,
    pub store: Arc<dyn ReadingStore>,
    pub analytics: Option<Arc<dyn AnalyticsSink>>,
    pub metrics: MetricsHub,
}

/// Acknowledgements the device still owes for commands the host sent, so a
/// late ack is not mistaken for a device-initiated change.
#[derive(Default)]
struct PendingAcks {
    starts: VecDeque<String>,
    stops: u32,
}

const MAX_PENDING_STARTS: usize = 8;

impl PendingAcks {
    fn expect_start(&mut self, id: &str) {
        if self.starts.len() == MAX_PENDING_STARTS {
            self.starts.pop_front();
        }
        self.starts.push_back(id.to_string());
    }

    fn take_start(&mut self, id: &str) -> bool {
        match self.starts.iter().position(|s| s == id) {
            Some(pos) => {
                self.starts.remove(pos);
                true
            }
            None => false,
        }
    }

    fn expect_stop(&mut self) {
        self.stops += 1;
    }

    fn take_stop(&mut self) -> bool {
        if self.stops > 0 {
            self.stops -= 1;
            true
        } else {
            false
        }
    }
}

enum PersistJob {
    Reading(TelemetryFrame),
    Session(SessionState),
}

/// Host-side ingestion service.
///
/// Each line from the link is parsed and dispatched without waiting on any
/// downstream: the live hub is a non-blocking broadcast, while persistence and
/// analytics sit behind bounded queues drained by their own tasks. A full
/// queue drops the item and counts it.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

struct Shared {
    transport: LinkTransport,
    hub: LiveHub,
    sessions: SessionCoordinator,
    store: Arc<dyn ReadingStore>,
    analytics: Option<Arc<dyn AnalyticsSink>>,
    analytics_cfg: AnalyticsConfig,
    analytics_reachable: AtomicBool,
    persist_tx: mpsc::Sender<PersistJob>,
    analytics_tx: Option<mpsc::Sender<AnalyticsRequest>>,
    metrics: MetricsHub,
    device: RwLock<Option<DeviceStatus>>,
    mode: Mutex<ExerciseMode>,
    acks: Mutex<PendingAcks>,
    recent: Mutex<VecDeque<TelemetryFrame>>,
    frames_seen: AtomicU64,
}

impl Pipeline {
    /// Build the pipeline and spawn its workers on the current runtime.
    pub fn launch(config: &IngestConfig, deps: PipelineDeps) -> Self {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let transport = LinkTransport::new(deps.driver, deps.registry, config.link.clone(), link_tx);
        let (persist_tx, persist_rx) = mpsc::channel(config.persist_queue.max(1));
        let (analytics_tx, analytics_rx) = match deps.analytics {
            Some(_) => {
                let (tx, rx) = mpsc::channel(config.analytics.queue_capacity.max(1));
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        let shared = Arc::new(Shared {
            transport,
            hub: LiveHub::new(config.hub.capacity),
            sessions: SessionCoordinator::new(),
            store: Arc::clone(&deps.store),
            analytics: deps.analytics.clone(),
            analytics_cfg: config.analytics.clone(),
            analytics_reachable: AtomicBool::new(false),
            persist_tx,
            analytics_tx,
            metrics: deps.metrics,
            device: RwLock::new(None),
            mode: Mutex::new(ExerciseMode::default()),
            acks: Mutex::new(PendingAcks::default()),
            recent: Mutex::new(VecDeque::with_capacity(config.analytics.recent_window)),
            frames_seen: AtomicU64::new(0),
        });

        let mut tasks = vec![
            tokio::spawn(run_link_events(Arc::clone(&shared), link_rx)),
            tokio::spawn(run_persist(deps.store, persist_rx)),
        ];
        if let (Some(sink), Some(rx)) = (deps.analytics, analytics_rx) {
            tasks.push(tokio::spawn(run_analytics(Arc::clone(&shared), sink, rx)));
        }
        info!(
            driver = shared.transport.driver_name(),
            analytics = shared.analytics.is_some(),
            "ingest pipeline started"
        );
        Self {
            shared,
            tasks: Arc::new(Mutex::new(tasks)),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.shared.hub.subscribe()
    }

    pub fn metrics(&self) -> &MetricsHub {
        &self.shared.metrics
    }

    pub async fn list_ports(&self) -> Vec<PortInfo> {
        self.shared.transport.list_available_ports().await
    }

    pub async fn connect(&self, path: &str, baud_rate: Option<u32>) -> Result<()> {
        self.shared.transport.connect(path, baud_rate).await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.shared.transport.disconnect().await?;
        Ok(())
    }

    /// Open a session on the host and the device.
    ///
    /// With `replace` an active session is closed first; without it an active
    /// session yields `Conflict`. If the commands cannot be sent the host
    /// session is rolled back.
    pub async fn start_session(&self, session_id: &str, mode: u8, replace: bool) -> Result<SessionState> {
        validate_session_id(session_id)?;
        let mode = validate_mode(mode)?;
        if !self.shared.transport.is_connected() {
            return Err(TransportError::NotConnected.into());
        }
        if replace {
            if let Some(prev) = self.shared.sessions.stop() {
                info!(previous = %prev.session_id, next = session_id, "replacing active session");
                self.shared.finish_session(prev);
            }
        }
        let state = self.shared.sessions.start(session_id, mode)?;
        self.shared.begin_session();

        self.shared.acks.lock().expect_start(session_id);
        let sent = async {
            self.send(&Command::SetExercise(mode.code())).await?;
            self.send(&Command::StartSession(session_id.to_string())).await
        }
        .await;
        if let Err(e) = sent {
            warn!(session = session_id, error = %e, "start_session failed; rolling back");
            self.shared.acks.lock().take_start(session_id);
            self.shared.sessions.abort(session_id);
            self.shared.hub.publish(LiveEvent::error(
                ErrorKind::Transport,
                format!("session {session_id} not started: {e}"),
                None,
            ));
            return Err(e);
        }
        *self.shared.mode.lock() = mode;
        self.shared.hub.publish(LiveEvent::SessionStarted(state.clone()));
        Ok(state)
    }

    /// Stop the active session and return its summary. The device is told
    /// to stop even if the host had no session open.
    pub async fn stop_session(&self) -> Result<Option<SessionState>> {
        if self.shared.transport.is_connected() {
            // The device may answer before send returns.
            self.shared.acks.lock().expect_stop();
            if let Err(e) = self.send(&Command::StopSession).await {
                self.shared.acks.lock().take_stop();
                warn!(error = %e, "could not send STOP_SESSION; closing host session anyway");
            }
        }
        Ok(self.shared.sessions.stop().map(|s| {
            self.shared.finish_session(s.clone());
            s
        }))
    }

    /// Change the exercise mode without interrupting an active session.
    pub async fn set_exercise(&self, mode: u8) -> Result<ExerciseMode> {
        let mode = validate_mode(mode)?;
        self.send(&Command::SetExercise(mode.code())).await?;
        *self.shared.mode.lock() = mode;
        Ok(mode)
    }

    pub async fn calibrate(&self) -> Result<()> {
        self.send(&Command::Calibrate).await
    }

    /// Ask the device for its state; the reply arrives as a `status` event.
    pub async fn request_device_status(&self) -> Result<()> {
        self.send(&Command::GetStatus).await
    }

    pub fn status(&self) -> StatusReport {
        self.shared.status_report()
    }

    pub fn active_session(&self) -> Option<SessionState> {
        self.shared.sessions.active()
    }

    pub async fn recent_readings(&self, limit: usize) -> Result<Vec<StoredReading>> {
        self.shared.store.recent_readings(limit).await
    }

    pub async fn readings_by_session(&self, session_id: &str) -> Result<Vec<StoredReading>> {
        self.shared.store.readings_by_session(session_id).await
    }

    pub async fn session_summary(&self, session_id: &str) -> Result<Option<SessionState>> {
        self.shared.store.session(session_id).await
    }

    /// Probe the analytics endpoint and record whether it answered.
    pub async fn check_analytics(&self) -> bool {
        let Some(sink) = self.shared.analytics.as_ref() else {
            return false;
        };
        let ok = match self
            .shared
            .post_bounded(sink.as_ref(), &AnalyticsRequest::health_check())
            .await
        {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "analytics health check failed");
                false
            }
        };
        self.shared.analytics_reachable.store(ok, Ordering::Relaxed);
        ok
    }

    /// Close the active session, drop the link, and stop the workers once the
    /// persistence queue has drained (bounded by `grace`).
    pub async fn shutdown(&self, grace: Duration) {
        if let Err(e) = self.stop_session().await {
            warn!(error = %e, "stop on shutdown failed");
        }
        if let Err(e) = self.shared.transport.disconnect().await {
            warn!(error = %e, "disconnect on shutdown failed");
        }
        let drained = tokio::time::timeout(grace, async {
            while self.shared.persist_tx.capacity() < self.shared.persist_tx.max_capacity() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("persistence queue not drained before shutdown");
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("ingest pipeline stopped");
    }

    async fn send(&self, cmd: &Command) -> Result<()> {
        let line = cmd.encode()?;
        self.shared.transport.send_line(&line).await?;
        debug!(?cmd, "command sent");
        Ok(())
    }
}

impl Shared {
    fn status_report(&self) -> StatusReport {
        let link = self.transport.status();
        StatusReport {
            link: LinkStatus {
                connected: link.connected,
                port: link.path,
                analytics_enabled: self.analytics.is_some(),
                analytics_reachable: self.analytics_reachable.load(Ordering::Relaxed),
            },
            session: self.sessions.active(),
            device: self.device.read().clone(),
        }
    }

    fn handle_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Connected { path } => {
                self.metrics.ingest.link_connected.set(1);
                self.hub.publish(LiveEvent::ArduinoConnected { port: path });
            }
            LinkEvent::Disconnected { path, reason } => {
                self.metrics.ingest.link_connected.set(0);
                *self.device.write() = None;
                *self.acks.lock() = PendingAcks::default();
                self.hub.publish(LiveEvent::ArduinoDisconnected {
                    port: path,
                    reason: reason.to_string(),
                });
                if let Some(state) = self.sessions.stop() {
                    info!(session = %state.session_id, "link lost; session closed");
                    self.finish_session(state);
                }
            }
            LinkEvent::Error(message) => {
                self.hub
                    .publish(LiveEvent::error(ErrorKind::Transport, message, None));
            }
            LinkEvent::Line(line) => self.handle_line(line),
        }
    }

    fn handle_line(&self, line: String) {
        let msg = match parse_line(&line) {
            Ok(msg) => msg,
            Err(ProtocolError::Empty) => return,
            Err(e) => {
                self.metrics.ingest.parse_errors.inc();
                warn!(error = %e, line = %line, "dropping malformed device line");
                self.hub
                    .publish(LiveEvent::error(ErrorKind::Parse, e.to_string(), Some(line)));
                return;
            }
        };
        match msg {
            DeviceMessage::Telemetry(frame) => self.handle_frame(frame),
            DeviceMessage::SessionStarted(id) => self.on_session_started(id),
            DeviceMessage::SessionStopped => {
                if self.acks.lock().take_stop() {
                    debug!("SESSION_STOPPED acknowledged");
                } else if let Some(state) = self.sessions.stop() {
                    info!(session = %state.session_id, "device stopped the session");
                    self.finish_session(state);
                } else {
                    debug!("SESSION_STOPPED with no session open");
                }
            }
            DeviceMessage::Calibrating => info!("device calibrating"),
            DeviceMessage::CalibrationComplete => {
                info!("device calibration complete");
                self.hub.publish(LiveEvent::CalibrationComplete);
            }
            DeviceMessage::SystemReady => info!("device ready"),
            DeviceMessage::Status(status) => {
                *self.mode.lock() = status.exercise_mode;
                *self.device.write() = Some(status);
                self.hub.publish(LiveEvent::Status(self.status_report()));
            }
            DeviceMessage::Diagnostic(text) => match text.strip_prefix(tags::CALIBRATION_FAILED) {
                Some(reason) => {
                    warn!(reason, "device calibration failed");
                    self.hub.publish(LiveEvent::error(
                        ErrorKind::Calibration,
                        reason.to_string(),
                        Some(text.clone()),
                    ));
                }
                None => {
                    debug!(line = %text, "device diagnostic");
                    self.hub.publish(LiveEvent::Diagnostic { line: text });
                }
            },
        }
    }

    fn handle_frame(&self, frame: TelemetryFrame) {
        self.metrics.ingest.frames_received.inc();
        trace!(session = %frame.session_id, angle = frame.knee_angle, "frame");
        if let Some(mode) = frame.mode() {
            *self.mode.lock() = mode;
        }

        self.hub.publish(LiveEvent::KneeData(frame.clone()));

        if let Some(count) = self.sessions.record_reading(&frame) {
            let window = {
                let mut recent = self.recent.lock();
                recent.push_back(frame.clone());
                while recent.len() > self.analytics_cfg.recent_window {
                    recent.pop_front();
                }
                let every = self.analytics_cfg.recommendation_every;
                (every > 0 && count % every == 0).then(|| recent.iter().cloned().collect::<Vec<_>>())
            };
            if let (Some(window), Some(session)) = (window, self.sessions.active()) {
                self.enqueue_analytics(AnalyticsRequest::recommendation(&session, window));
            }
        }

        self.enqueue_persist(PersistJob::Reading(frame.clone()));

        let n = self.frames_seen.fetch_add(1, Ordering::Relaxed) + 1;
        let every = self.analytics_cfg.sensor_data_every;
        if every > 0 && n % every == 0 {
            self.enqueue_analytics(AnalyticsRequest::sensor_data(frame));
        }
    }

    fn on_session_started(&self, id: String) {
        let expected = self.acks.lock().take_start(&id);
        match self.sessions.active_id() {
            Some(active) if active == id => debug!(session = %id, "SESSION_STARTED acknowledged"),
            _ if expected => debug!(session = %id, "ignoring late ack for a replaced session"),
            other => {
                if other.is_some() {
                    if let Some(prev) = self.sessions.stop() {
                        info!(previous = %prev.session_id, next = %id, "device switched sessions");
                        self.finish_session(prev);
                    }
                }
                let mode = *self.mode.lock();
                match self.sessions.start(&id, mode) {
                    Ok(state) => {
                        info!(session = %id, "adopted device-initiated session");
                        self.begin_session();
                        self.hub.publish(LiveEvent::SessionStarted(state));
                    }
                    Err(e) => warn!(session = %id, error = %e, "could not adopt session"),
                }
            }
        }
    }

    fn begin_session(&self) {
        self.metrics.ingest.sessions_started.inc();
        self.recent.lock().clear();
    }

    fn finish_session(&self, state: SessionState) {
        self.recent.lock().clear();
        self.hub.publish(LiveEvent::SessionStopped(state.clone()));
        self.enqueue_persist(PersistJob::Session(state.clone()));
        self.enqueue_analytics(AnalyticsRequest::session_complete(state));
    }

    fn enqueue_persist(&self, job: PersistJob) {
        match self.persist_tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.metrics.ingest.persist_dropped.inc();
                debug!("persistence queue full; dropping");
            }
            Err(TrySendError::Closed(_)) => warn!("persistence worker has stopped"),
        }
    }

    fn enqueue_analytics(&self, request: AnalyticsRequest) {
        let Some(tx) = self.analytics_tx.as_ref() else {
            return;
        };
        match tx.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(req)) => {
                self.metrics.ingest.analytics_dropped.inc();
                debug!(kind = req.kind(), "analytics queue full; dropping");
            }
            Err(TrySendError::Closed(_)) => warn!("analytics worker has stopped"),
        }
    }

    async fn post_bounded(
        &self,
        sink: &dyn AnalyticsSink,
        request: &AnalyticsRequest,
    ) -> Result<Vec<crate::Recommendation>> {
        let limit = Duration::from_millis(self.analytics_cfg.timeout_ms.max(1));
        match tokio::time::timeout(limit, sink.post(request)).await {
            Ok(res) => res,
            Err(_) => Err(IngestError::Analytics(format!(
                "{} timed out after {} ms",
                request.kind(),
                limit.as_millis()
            ))),
        }
    }
}

async fn run_link_events(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(event) = rx.recv().await {
        shared.handle_link_event(event);
    }
    debug!("link event stream ended");
}

async fn run_persist(store: Arc<dyn ReadingStore>, mut rx: mpsc::Receiver<PersistJob>) {
    while let Some(job) = rx.recv().await {
        let res = match &job {
            PersistJob::Reading(frame) => store.create_reading(frame).await.map(|_| ()),
            PersistJob::Session(state) => store.save_session(state).await,
        };
        if let Err(e) = res {
            warn!(error = %e, "persistence failed");
        }
    }
}

async fn run_analytics(
    shared: Arc<Shared>,
    sink: Arc<dyn AnalyticsSink>,
    mut rx: mpsc::Receiver<AnalyticsRequest>,
) {
    while let Some(request) = rx.recv().await {
        match shared.post_bounded(sink.as_ref(), &request).await {
            Ok(recommendations) => {
                shared.analytics_reachable.store(true, Ordering::Relaxed);
                if !recommendations.is_empty() {
                    info!(
                        count = recommendations.len(),
                        kind = request.kind(),
                        "recommendations received"
                    );
                    shared.hub.publish(LiveEvent::RecommendationsReceived {
                        session_id: request.session_id().map(str::to_string),
                        recommendations,
                    });
                }
            }
            Err(e) => {
                shared.analytics_reachable.store(false, Ordering::Relaxed);
                shared.metrics.ingest.analytics_failures.inc();
                warn!(kind = request.kind(), error = %e, "analytics request failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryStore, Recommendation};
    use async_trait::async_trait;
    use device_engine::EngineConfig;
    use link_transport::{LinkConfig, LinkPort, MemoryPortRegistry, MockDriver};

    #[derive(Default)]
    struct FakeSink {
        seen: Mutex<Vec<AnalyticsRequest>>,
        fail: bool,
    }

    #[async_trait]
    impl AnalyticsSink for FakeSink {
        async fn post(&self, request: &AnalyticsRequest) -> Result<Vec<Recommendation>> {
            self.seen.lock().push(request.clone());
            if self.fail {
                return Err(IngestError::Analytics("connection refused".into()));
            }
            Ok(match request {
                AnalyticsRequest::RecommendationRequest { .. } => vec![Recommendation {
                    kind: "range_of_motion".into(),
                    title: "Keep going".into(),
                    description: "Hold the stretch a little longer".into(),
                    progress: Some(0.5),
                    status: "active".into(),
                    priority: "medium".into(),
                }],
                _ => Vec::new(),
            })
        }
    }

    impl FakeSink {
        fn kinds(&self) -> Vec<&'static str> {
            self.seen.lock().iter().map(|r| r.kind()).collect()
        }
    }

    /// A store whose writes take a long time.
    struct SlowStore(MemoryStore);

    #[async_trait]
    impl ReadingStore for SlowStore {
        async fn create_reading(&self, frame: &TelemetryFrame) -> Result<StoredReading> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.0.create_reading(frame).await
        }
        async fn save_session(&self, session: &SessionState) -> Result<()> {
            self.0.save_session(session).await
        }
        async fn session(&self, id: &str) -> Result<Option<SessionState>> {
            self.0.session(id).await
        }
        async fn readings_by_session(&self, id: &str) -> Result<Vec<StoredReading>> {
            self.0.readings_by_session(id).await
        }
        async fn recent_readings(&self, limit: usize) -> Result<Vec<StoredReading>> {
            self.0.recent_readings(limit).await
        }
    }

    fn config() -> IngestConfig {
        let mut cfg = IngestConfig::default();
        cfg.link = LinkConfig {
            connect_timeout_ms: 1_000,
            read_timeout_ms: 20,
            ..LinkConfig::default()
        };
        cfg.analytics.recommendation_every = 5;
        cfg.analytics.recent_window = 3;
        cfg.analytics.timeout_ms = 500;
        cfg
    }

    fn launch_with(
        cfg: &IngestConfig,
        store: Arc<dyn ReadingStore>,
        sink: Option<Arc<FakeSink>>,
    ) -> (Pipeline, Arc<MockDriver>) {
        let driver = Arc::new(MockDriver::default().with_engine_config(EngineConfig {
            tick_ms: 5,
            calibration_samples: 20,
            ..EngineConfig::default()
        }));
        (launch_on(cfg, driver.clone(), store, sink), driver)
    }

    fn launch_on(
        cfg: &IngestConfig,
        driver: Arc<dyn LinkDriver>,
        store: Arc<dyn ReadingStore>,
        sink: Option<Arc<FakeSink>>,
    ) -> Pipeline {
        Pipeline::launch(
            cfg,
            PipelineDeps {
                driver,
                registry: Arc::new(MemoryPortRegistry::new()),
                store,
                analytics: sink.map(|s| s as Arc<dyn AnalyticsSink>),
                metrics: MetricsHub::new().unwrap(),
            },
        )
    }

    /// A device that acknowledges session commands from inside `write_all`,
    /// before the write returns, then stalls for `write_delay`.
    struct BenchDriver {
        answer: bool,
        write_delay: Duration,
    }

    struct BenchPort {
        rx: Arc<Mutex<VecDeque<u8>>>,
        answer: bool,
        write_delay: Duration,
    }

    impl LinkDriver for BenchDriver {
        fn name(&self) -> &str {
            "bench"
        }

        fn list(&self) -> link_transport::Result<Vec<PortInfo>> {
            Ok(vec![PortInfo::new("bench0", "bench")])
        }

        fn open(
            &self,
            _path: &str,
            _baud_rate: u32,
            _read_timeout: Duration,
        ) -> link_transport::Result<Box<dyn LinkPort>> {
            Ok(Box::new(BenchPort {
                rx: Arc::new(Mutex::new(VecDeque::new())),
                answer: self.answer,
                write_delay: self.write_delay,
            }))
        }
    }

    impl LinkPort for BenchPort {
        fn read(&mut self, buf: &mut [u8]) -> link_transport::Result<usize> {
            let mut rx = self.rx.lock();
            if rx.is_empty() {
                drop(rx);
                std::thread::sleep(Duration::from_millis(2));
                return Err(TransportError::Timeout);
            }
            let n = buf.len().min(rx.len());
            for (slot, b) in buf.iter_mut().zip(rx.drain(..n)) {
                *slot = b;
            }
            Ok(n)
        }

        fn write_all(&mut self, data: &[u8]) -> link_transport::Result<()> {
            if self.answer {
                let text = String::from_utf8_lossy(data);
                for cmd in text.lines().filter_map(|l| Command::parse(l).ok()) {
                    let reply = match cmd {
                        Command::StartSession(id) => DeviceMessage::SessionStarted(id),
                        Command::StopSession => DeviceMessage::SessionStopped,
                        _ => continue,
                    };
                    let encoded = reply.encode().unwrap();
                    self.rx.lock().extend(encoded.bytes());
                }
            }
            std::thread::sleep(self.write_delay);
            Ok(())
        }

        fn try_clone(&self) -> link_transport::Result<Box<dyn LinkPort>> {
            Ok(Box::new(BenchPort {
                rx: Arc::clone(&self.rx),
                answer: self.answer,
                write_delay: self.write_delay,
            }))
        }
    }

    fn frame(session: &str, ts: u64, angle: f32) -> TelemetryFrame {
        TelemetryFrame {
            session_id: session.to_string(),
            timestamp: ts,
            exercise_mode: 0,
            accel_x: 0.0,
            accel_y: 0.0,
            accel_z: 1.0,
            gyro_x: 0.0,
            gyro_y: 0.0,
            gyro_z: 0.0,
            roll: 0.0,
            pitch: 180.0 - angle,
            yaw: 0.0,
            knee_angle: angle,
            temperature: 30.0,
        }
    }

    fn line(frame: &TelemetryFrame) -> LinkEvent {
        let encoded = DeviceMessage::Telemetry(frame.clone()).encode().unwrap();
        LinkEvent::Line(encoded.trim_end().to_string())
    }

    async fn next_of(sub: &mut Subscription, kind: &str) -> LiveEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let ev = sub.recv().await.expect("hub closed");
                if ev.kind() == kind {
                    return ev;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {kind} event"))
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn saved_summary(p: &Pipeline, id: &str) -> SessionState {
        for _ in 0..200 {
            if let Some(s) = p.session_summary(id).await.unwrap() {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("summary for {id} never persisted");
    }

    #[test]
    fn test_validation_rules() {
        assert!(validate_session_id("rehab-2024-01").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id(&"x".repeat(65)).is_err());
        assert!(validate_session_id("a\nb").is_err());
        assert!(validate_session_id(" padded").is_err());
        assert_eq!(validate_mode(2).unwrap(), ExerciseMode::Lateral);
        assert!(matches!(validate_mode(3), Err(IngestError::Validation(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_end_to_end_session() {
        let sink = Arc::new(FakeSink::default());
        let store = Arc::new(MemoryStore::new(1_000));
        let (p, _) = launch_with(&config(), store.clone(), Some(sink.clone()));
        let mut sub = p.subscribe();

        p.connect("sim0", None).await.unwrap();
        next_of(&mut sub, "arduino_connected").await;
        next_of(&mut sub, "calibration_complete").await;
        assert!(p.status().link.connected);

        let started = p.start_session("e2e", 1, false).await.unwrap();
        assert_eq!(started.exercise_mode, ExerciseMode::Extension);
        next_of(&mut sub, "session_started").await;
        for _ in 0..6 {
            match next_of(&mut sub, "knee_data").await {
                LiveEvent::KneeData(f) => {
                    assert_eq!(f.session_id, "e2e");
                    assert_eq!(f.exercise_mode, 1);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        match next_of(&mut sub, "recommendations_received").await {
            LiveEvent::RecommendationsReceived { session_id, recommendations } => {
                assert_eq!(session_id.as_deref(), Some("e2e"));
                assert_eq!(recommendations.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }

        let summary = p.stop_session().await.unwrap().unwrap();
        assert!(!summary.is_active);
        assert!(summary.reading_count >= 5);
        assert!(summary.mean_angle >= 0.0 && summary.mean_angle <= 160.0);
        next_of(&mut sub, "session_stopped").await;
        assert!(p.active_session().is_none());

        assert_eq!(saved_summary(&p, "e2e").await.reading_count, summary.reading_count);
        let s = store.clone();
        eventually(|| s.len() as u64 >= summary.reading_count).await;
        assert!(p.readings_by_session("e2e").await.unwrap().len() as u64 >= summary.reading_count);
        eventually(|| sink.kinds().contains(&"session_complete")).await;
        let kinds = sink.kinds();
        assert!(kinds.contains(&"sensor_data"));
        assert!(kinds.contains(&"recommendation_request"));
        assert!(p.status().link.analytics_reachable);

        p.shutdown(Duration::from_secs(1)).await;
        assert!(!p.status().link.connected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_conflict_and_replace() {
        let (p, _) = launch_with(&config(), Arc::new(MemoryStore::new(100)), None);
        let mut sub = p.subscribe();
        p.connect("sim0", None).await.unwrap();

        p.start_session("first", 0, false).await.unwrap();
        let err = p.start_session("second", 0, false).await.unwrap_err();
        assert!(matches!(err, IngestError::Conflict { ref active } if active == "first"));
        assert_eq!(p.active_session().unwrap().session_id, "first");

        p.start_session("second", 2, true).await.unwrap();
        match next_of(&mut sub, "session_stopped").await {
            LiveEvent::SessionStopped(s) => assert_eq!(s.session_id, "first"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(p.active_session().unwrap().session_id, "second");
        assert_eq!(p.metrics().ingest.sessions_started.get(), 2);
        p.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_start_requires_link_and_valid_input() {
        let (p, _) = launch_with(&config(), Arc::new(MemoryStore::new(10)), None);
        assert!(matches!(
            p.start_session("s", 9, false).await,
            Err(IngestError::Validation(_))
        ));
        assert!(matches!(
            p.start_session("", 0, false).await,
            Err(IngestError::Validation(_))
        ));
        assert!(matches!(
            p.start_session("s", 0, false).await,
            Err(IngestError::Transport(TransportError::NotConnected))
        ));
        assert!(p.active_session().is_none());
        assert!(matches!(
            p.calibrate().await,
            Err(IngestError::Transport(TransportError::NotConnected))
        ));
    }

    #[tokio::test]
    async fn test_malformed_line_then_valid() {
        let (p, _) = launch_with(&config(), Arc::new(MemoryStore::new(10)), None);
        let mut sub = p.subscribe();
        p.shared
            .handle_link_event(LinkEvent::Line(r#"KNEE_DATA:{"sessionId":"s1","timestamp":5}"#.into()));
        p.shared.handle_link_event(line(&frame("s1", 6, 40.0)));

        match sub.try_recv() {
            Some(LiveEvent::Error(e)) => {
                assert_eq!(e.kind, ErrorKind::Parse);
                assert!(e.raw.unwrap().starts_with("KNEE_DATA:"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(sub.try_recv(), Some(LiveEvent::KneeData(f)) if f.timestamp == 6));
        assert_eq!(p.metrics().ingest.parse_errors.get(), 1);
        assert_eq!(p.metrics().ingest.frames_received.get(), 1);
    }

    #[tokio::test]
    async fn test_device_session_adopted_and_closed_on_disconnect() {
        let store = Arc::new(MemoryStore::new(100));
        let (p, _) = launch_with(&config(), store.clone(), None);
        let mut sub = p.subscribe();
        p.shared.handle_link_event(LinkEvent::Connected { path: "sim0".into() });
        p.shared
            .handle_link_event(LinkEvent::Line("SESSION_STARTED:dev-1".into()));
        for (i, a) in [10.0, 20.0, 30.0].into_iter().enumerate() {
            p.shared.handle_link_event(line(&frame("dev-1", i as u64, a)));
        }
        // A frame from some other session does not touch the aggregates.
        p.shared.handle_link_event(line(&frame("stale", 9, 150.0)));
        let active = p.active_session().unwrap();
        assert_eq!(active.reading_count, 3);
        assert_eq!(active.max_angle, 30.0);

        p.shared.handle_link_event(LinkEvent::Disconnected {
            path: "sim0".into(),
            reason: link_transport::DisconnectReason::Fault("unplugged".into()),
        });
        assert!(p.active_session().is_none());
        next_of(&mut sub, "arduino_disconnected").await;
        match next_of(&mut sub, "session_stopped").await {
            LiveEvent::SessionStopped(s) => {
                assert_eq!(s.session_id, "dev-1");
                assert!((s.mean_angle - 20.0).abs() < 1e-9);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(saved_summary(&p, "dev-1").await.reading_count, 3);
        let s = store.clone();
        eventually(|| s.len() == 4).await;
    }

    #[tokio::test]
    async fn test_zero_subscribers_still_persist_and_forward() {
        let sink = Arc::new(FakeSink::default());
        let store = Arc::new(MemoryStore::new(100));
        let (p, _) = launch_with(&config(), store.clone(), Some(sink.clone()));
        for i in 0..4 {
            p.shared.handle_link_event(line(&frame("nobody", i, 12.0)));
        }
        let s = store.clone();
        eventually(|| s.len() == 4).await;
        eventually(|| sink.kinds().len() == 4).await;
        assert!(sink.kinds().iter().all(|k| *k == "sensor_data"));
    }

    #[tokio::test]
    async fn test_slow_store_does_not_stall_dispatch() {
        let mut cfg = config();
        cfg.persist_queue = 2;
        let (p, _) = launch_with(&cfg, Arc::new(SlowStore(MemoryStore::new(100))), None);
        let mut sub = p.subscribe();
        let started = std::time::Instant::now();
        for i in 0..20 {
            p.shared.handle_link_event(line(&frame("busy", i, 5.0)));
        }
        assert!(started.elapsed() < Duration::from_millis(200));
        let mut live = 0;
        while sub.try_recv().is_some() {
            live += 1;
        }
        assert_eq!(live, 20);
        assert!(p.metrics().ingest.persist_dropped.get() >= 17);
    }

    #[tokio::test]
    async fn test_unreachable_analytics() {
        let sink = Arc::new(FakeSink {
            fail: true,
            ..FakeSink::default()
        });
        let (p, _) = launch_with(&config(), Arc::new(MemoryStore::new(10)), Some(sink.clone()));
        assert!(!p.check_analytics().await);
        p.shared.handle_link_event(line(&frame("s", 1, 1.0)));
        let m = p.metrics().clone();
        eventually(|| m.ingest.analytics_failures.get() >= 1).await;
        let status = p.status();
        assert!(status.link.analytics_enabled);
        assert!(!status.link.analytics_reachable);
    }

    #[tokio::test]
    async fn test_health_check_and_diagnostics() {
        let sink = Arc::new(FakeSink::default());
        let (p, _) = launch_with(&config(), Arc::new(MemoryStore::new(10)), Some(sink.clone()));
        assert!(p.check_analytics().await);
        assert_eq!(sink.kinds(), vec!["health_check"]);
        assert!(p.status().link.analytics_reachable);

        let mut sub = p.subscribe();
        p.shared
            .handle_link_event(LinkEvent::Line("CALIBRATION_FAILED:sensor not responding".into()));
        p.shared.handle_link_event(LinkEvent::Line("MPU6050 init ok".into()));
        p.shared
            .handle_link_event(LinkEvent::Line("STATUS:RECORDING:abc:2".into()));
        match sub.try_recv() {
            Some(LiveEvent::Error(e)) => assert_eq!(e.kind, ErrorKind::Calibration),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(sub.try_recv(), Some(LiveEvent::Diagnostic { .. })));
        match sub.try_recv() {
            Some(LiveEvent::Status(report)) => {
                let device = report.device.unwrap();
                assert!(device.recording);
                assert_eq!(device.exercise_mode, ExerciseMode::Lateral);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_analytics_configured() {
        let (p, _) = launch_with(&config(), Arc::new(MemoryStore::new(10)), None);
        assert!(!p.check_analytics().await);
        assert!(!p.status().link.analytics_enabled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_ack_before_send_returns_keeps_summary() {
        let driver = Arc::new(BenchDriver {
            answer: true,
            write_delay: Duration::from_millis(100),
        });
        let p = launch_on(&config(), driver, Arc::new(MemoryStore::new(100)), None);
        let mut sub = p.subscribe();
        p.connect("bench0", None).await.unwrap();

        p.start_session("s1", 0, false).await.unwrap();
        p.shared.handle_link_event(line(&frame("s1", 1, 40.0)));
        p.shared.handle_link_event(line(&frame("s1", 2, 60.0)));

        let summary = p.stop_session().await.unwrap().unwrap();
        assert_eq!(summary.session_id, "s1");
        assert_eq!(summary.reading_count, 2);
        assert!(!summary.is_active);
        match next_of(&mut sub, "session_stopped").await {
            LiveEvent::SessionStopped(s) => assert_eq!(s.session_id, "s1"),
            other => panic!("unexpected {other:?}"),
        }

        // Both acks were consumed, none are left owing.
        let shared = Arc::clone(&p.shared);
        eventually(move || {
            let acks = shared.acks.lock();
            acks.stops == 0 && acks.starts.is_empty()
        })
        .await;

        // So a stop the device initiates later still closes its session.
        p.shared
            .handle_link_event(LinkEvent::Line("SESSION_STARTED:dev2".into()));
        assert_eq!(p.active_session().unwrap().session_id, "dev2");
        p.shared.handle_link_event(LinkEvent::Line("SESSION_STOPPED".into()));
        assert!(p.active_session().is_none());
        p.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_stop_send_does_not_leave_ack_owed() {
        let driver = Arc::new(BenchDriver {
            answer: false,
            write_delay: Duration::from_millis(300),
        });
        let mut cfg = config();
        cfg.link.send_timeout_ms = 50;
        let p = launch_on(&cfg, driver, Arc::new(MemoryStore::new(10)), None);
        p.connect("bench0", None).await.unwrap();
        p.shared
            .handle_link_event(LinkEvent::Line("SESSION_STARTED:dev1".into()));

        let summary = p.stop_session().await.unwrap().unwrap();
        assert_eq!(summary.session_id, "dev1");
        assert_eq!(p.shared.acks.lock().stops, 0);
        p.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_late_start_ack_for_replaced_session_is_absorbed() {
        let driver = Arc::new(BenchDriver {
            answer: false,
            write_delay: Duration::ZERO,
        });
        let p = launch_on(&config(), driver, Arc::new(MemoryStore::new(10)), None);
        p.connect("bench0", None).await.unwrap();
        let mut sub = p.subscribe();

        p.start_session("first", 0, false).await.unwrap();
        p.start_session("second", 2, true).await.unwrap();
        assert_eq!(p.active_session().unwrap().session_id, "second");

        // The device acknowledges both starts only now, oldest first.
        p.shared
            .handle_link_event(LinkEvent::Line("SESSION_STARTED:first".into()));
        assert_eq!(p.active_session().unwrap().session_id, "second");
        p.shared
            .handle_link_event(LinkEvent::Line("SESSION_STARTED:second".into()));
        assert_eq!(p.active_session().unwrap().session_id, "second");
        assert!(p.shared.acks.lock().starts.is_empty());
        assert_eq!(p.metrics().ingest.sessions_started.get(), 2);

        let mut started = Vec::new();
        let mut stopped = Vec::new();
        while let Some(ev) = sub.try_recv() {
            match ev {
                LiveEvent::SessionStarted(s) => started.push(s.session_id),
                LiveEvent::SessionStopped(s) => stopped.push(s.session_id),
                _ => {}
            }
        }
        assert_eq!(started, vec!["first".to_string(), "second".to_string()]);
        assert_eq!(stopped, vec!["first".to_string()]);
        p.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_shutdown_without_link() {
        let (p, _) = launch_with(&config(), Arc::new(MemoryStore::new(10)), None);
        p.shared.handle_link_event(line(&frame("solo", 1, 5.0)));
        p.shutdown(Duration::from_secs(1)).await;
        assert!(!p.status().link.connected);
        assert!(p.tasks.lock().is_empty());
    }
}
