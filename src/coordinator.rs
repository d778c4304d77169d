//! Multi-monitor capture coordination
//!
//! The coordinator owns one session per enumerated monitor, serves
//! synchronous `capture_all` aggregation, and optionally runs a single
//! producer worker that pushes aggregated frames through an installed
//! callback while adapting per-monitor rates to observed latency.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::capture::{share, CaptureBackend, PlatformBackend, SharedBackend};
use crate::error::{CaptureError, CaptureResult};
use crate::session::MonitorSession;
use crate::tracker::merge_regions;
use crate::types::{
    monotonic_micros, validate_fps, AdaptiveRatePolicy, BackendOptions, CoordinatorOptions,
    DirtyRect, MonitorDescriptor, MultiMonitorFrame, SessionState, SessionStats,
};

/// Callback receiving each aggregated frame; owns the frame for the call
pub type FrameCallback = Box<dyn FnMut(MultiMonitorFrame) + Send>;

/// Observer for coordinator-level errors
pub type ErrorObserver = Box<dyn FnMut(&CaptureError) + Send>;

/// Aggregation order and enablement for one monitor
#[derive(Debug, Clone)]
struct PlanEntry {
    id: u32,
    priority: i32,
    enabled: bool,
}

/// State shared between the owning thread and the producer worker.
///
/// Scalars are atomics read without locking; the session map and plan are
/// locked, which also enforces that sessions have a single consumer at any
/// instant.
struct Engine {
    backend: SharedBackend,
    sessions: Mutex<BTreeMap<u32, MonitorSession>>,
    plan: Mutex<Vec<PlanEntry>>,
    policy: Mutex<AdaptiveRatePolicy>,
    running: AtomicBool,
    global_fps_bits: AtomicU64,
    adaptive: AtomicBool,
    dirty_optimization: AtomicBool,
    /// Rolling average aggregation latency in microseconds
    latency_avg_us: AtomicU64,
    total_frames: AtomicU64,
    total_bytes: AtomicU64,
    error_observer: Mutex<Option<ErrorObserver>>,
    last_error: Mutex<Option<String>>,
}

impl Engine {
    fn global_fps(&self) -> f64 {
        f64::from_bits(self.global_fps_bits.load(Ordering::Relaxed))
    }

    fn plan_snapshot(&self) -> Vec<PlanEntry> {
        let mut entries: Vec<PlanEntry> =
            self.plan.lock().iter().filter(|e| e.enabled).cloned().collect();
        entries.sort_by_key(|e| (e.priority, e.id));
        entries
    }

    fn record_error(&self, err: &CaptureError) {
        *self.last_error.lock() = Some(err.to_string());
        if let Some(observer) = self.error_observer.lock().as_mut() {
            observer(err);
        }
    }

    /// Capture every enabled monitor in (priority, id) order.
    ///
    /// Per-monitor failures never fail the aggregate; they are recorded on
    /// the frame and the monitor is omitted. In the worker (`blocking =
    /// false`) a throttled session is simply skipped for the round.
    fn aggregate(&self, blocking: bool) -> MultiMonitorFrame {
        let mut aggregate = MultiMonitorFrame {
            timestamp_us: monotonic_micros(),
            ..Default::default()
        };

        let order = self.plan_snapshot();
        let mut sessions = self.sessions.lock();

        for entry in order {
            let Some(session) = sessions.get_mut(&entry.id) else {
                continue;
            };

            let result = if blocking {
                session.capture()
            } else {
                session.poll_capture()
            };

            match result {
                Ok(frame) => {
                    aggregate.total_bytes += frame.size_bytes();
                    aggregate.monitors.push(session.monitor().clone());
                    aggregate.frames.push(frame);
                    self.total_frames.fetch_add(1, Ordering::Relaxed);
                }
                Err(CaptureError::Throttled { .. }) if !blocking => {}
                Err(err @ CaptureError::Fatal(_)) => {
                    aggregate.errors.push((entry.id, err.to_string()));
                    self.recover_session(&mut sessions, entry.id, &err);
                }
                Err(err) => {
                    warn!("monitor {}: capture skipped: {}", entry.id, err);
                    aggregate.errors.push((entry.id, err.to_string()));
                }
            }
        }

        self.total_bytes
            .fetch_add(aggregate.total_bytes as u64, Ordering::Relaxed);
        aggregate
    }

    /// Session-scoped reopen after a fatal failure, without disturbing
    /// siblings; one automatic re-enumeration before the error surfaces.
    fn recover_session(
        &self,
        sessions: &mut BTreeMap<u32, MonitorSession>,
        monitor_id: u32,
        err: &CaptureError,
    ) {
        let reopened = sessions
            .get_mut(&monitor_id)
            .map(|session| session.reopen().is_ok())
            .unwrap_or(false);

        if reopened {
            debug!("monitor {}: reopened after fatal failure", monitor_id);
            return;
        }

        warn!(
            "monitor {}: reopen failed, re-enumerating displays",
            monitor_id
        );
        if let Err(rescan_err) = self.rescan(sessions) {
            error!("display re-enumeration failed: {}", rescan_err);
        }
        self.record_error(err);
    }

    /// Re-enumerate displays and rebuild sessions, keeping plan entries of
    /// surviving monitor ids
    fn rescan(&self, sessions: &mut BTreeMap<u32, MonitorSession>) -> CaptureResult<()> {
        let monitors = self.backend.lock().enumerate()?;
        let mut plan = self.plan.lock();

        sessions.clear();
        let old_plan = std::mem::take(&mut *plan);

        for monitor in monitors {
            let previous = old_plan.iter().find(|e| e.id == monitor.id);
            plan.push(PlanEntry {
                id: monitor.id,
                priority: previous.map(|e| e.priority).unwrap_or(monitor.id as i32),
                enabled: previous.map(|e| e.enabled).unwrap_or(true),
            });
            sessions.insert(
                monitor.id,
                MonitorSession::new(monitor, Arc::clone(&self.backend)),
            );
        }

        if self.running.load(Ordering::Relaxed) {
            let global_fps = self.global_fps();
            let dirty = self.dirty_optimization.load(Ordering::Relaxed);
            for entry in plan.iter().filter(|e| e.enabled) {
                if let Some(session) = sessions.get_mut(&entry.id) {
                    session.set_dirty_optimization(dirty);
                    let _ = session.set_target_fps(global_fps);
                    if let Err(err) = session.reopen() {
                        warn!("monitor {}: restart after rescan failed: {}", entry.id, err);
                    }
                }
            }
        }

        Ok(())
    }

    fn update_latency(&self, sample: Duration) {
        let sample_us = sample.as_micros() as u64;
        let previous = self.latency_avg_us.load(Ordering::Relaxed);
        let next = if previous == 0 {
            sample_us
        } else {
            // Rolling average weighted 0.9 toward history.
            (previous * 9 + sample_us) / 10
        };
        self.latency_avg_us.store(next, Ordering::Relaxed);
    }

    /// Apply the adaptive policy to every session's target rate
    fn optimize_rates(&self) {
        let latency_ms = self.latency_avg_us.load(Ordering::Relaxed) as f64 / 1000.0;
        let policy = self.policy.lock().clone();
        let mut sessions = self.sessions.lock();

        for session in sessions.values_mut() {
            let adjusted = policy.adjust(latency_ms, session.target_fps());
            if adjusted != session.target_fps() {
                let _ = session.set_target_fps(adjusted);
            }
        }
    }
}

/// Top-level capture object owning all monitor sessions
pub struct MultiMonitorCapture {
    engine: Arc<Engine>,
    options: CoordinatorOptions,
    callback: Option<FrameCallback>,
    worker: Option<JoinHandle<()>>,
    stop_tx: Option<Sender<()>>,
}

impl MultiMonitorCapture {
    /// Coordinator over the native platform backend
    pub fn new() -> CaptureResult<Self> {
        Ok(Self::with_backend(PlatformBackend::new()?))
    }

    /// Coordinator over an explicit backend
    pub fn with_backend(backend: Box<dyn CaptureBackend>) -> Self {
        let options = CoordinatorOptions::default();
        Self {
            engine: Arc::new(Engine {
                backend: share(backend),
                sessions: Mutex::new(BTreeMap::new()),
                plan: Mutex::new(Vec::new()),
                policy: Mutex::new(AdaptiveRatePolicy::default()),
                running: AtomicBool::new(false),
                global_fps_bits: AtomicU64::new(options.global_fps.to_bits()),
                adaptive: AtomicBool::new(options.adaptive),
                dirty_optimization: AtomicBool::new(options.dirty_optimization),
                latency_avg_us: AtomicU64::new(0),
                total_frames: AtomicU64::new(0),
                total_bytes: AtomicU64::new(0),
                error_observer: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
            options,
            callback: None,
            worker: None,
            stop_tx: None,
        }
    }

    /// Enumerate displays and create one session per monitor.
    ///
    /// All monitors start enabled, with priority equal to their id and the
    /// global target rate.
    pub fn initialize(&mut self) -> CaptureResult<()> {
        let mut sessions = self.engine.sessions.lock();
        self.engine.rescan(&mut sessions)?;
        if sessions.is_empty() {
            warn!("no displays found during enumeration");
        }
        Ok(())
    }

    /// Descriptor snapshots, ordered by ascending (priority, id)
    pub fn monitors(&self) -> Vec<MonitorDescriptor> {
        let order = self.engine.plan_snapshot();
        let sessions = self.engine.sessions.lock();
        order
            .iter()
            .filter_map(|e| sessions.get(&e.id).map(|s| s.monitor().clone()))
            .collect()
    }

    pub fn set_monitor_enabled(&mut self, monitor_id: u32, enabled: bool) -> CaptureResult<()> {
        let mut plan = self.engine.plan.lock();
        let entry = plan
            .iter_mut()
            .find(|e| e.id == monitor_id)
            .ok_or_else(|| unknown_monitor(monitor_id))?;
        entry.enabled = enabled;
        drop(plan);

        if self.is_capturing() {
            let mut sessions = self.engine.sessions.lock();
            if let Some(session) = sessions.get_mut(&monitor_id) {
                if enabled {
                    self.start_session(session)?;
                } else {
                    session.stop();
                }
            }
        }
        Ok(())
    }

    /// Lower priority sorts earlier in aggregation
    pub fn set_monitor_priority(&mut self, monitor_id: u32, priority: i32) -> CaptureResult<()> {
        let mut plan = self.engine.plan.lock();
        let entry = plan
            .iter_mut()
            .find(|e| e.id == monitor_id)
            .ok_or_else(|| unknown_monitor(monitor_id))?;
        entry.priority = priority;
        Ok(())
    }

    /// Set the worker rate and reset every monitor to it
    pub fn set_global_fps(&mut self, fps: f64) -> CaptureResult<()> {
        validate_fps(fps)?;
        self.options.global_fps = fps;
        self.engine
            .global_fps_bits
            .store(fps.to_bits(), Ordering::Relaxed);
        let mut sessions = self.engine.sessions.lock();
        for session in sessions.values_mut() {
            session.set_target_fps(fps)?;
        }
        Ok(())
    }

    pub fn set_monitor_fps(&mut self, monitor_id: u32, fps: f64) -> CaptureResult<()> {
        validate_fps(fps)?;
        let mut sessions = self.engine.sessions.lock();
        let session = sessions
            .get_mut(&monitor_id)
            .ok_or_else(|| unknown_monitor(monitor_id))?;
        session.set_target_fps(fps)
    }

    /// Replace one monitor's backend options; takes effect when its
    /// session next opens
    pub fn set_monitor_options(
        &mut self,
        monitor_id: u32,
        options: BackendOptions,
    ) -> CaptureResult<()> {
        options.validate()?;
        let mut sessions = self.engine.sessions.lock();
        let session = sessions
            .get_mut(&monitor_id)
            .ok_or_else(|| unknown_monitor(monitor_id))?;
        if session.state() == SessionState::Running {
            return Err(CaptureError::InvalidArgument(format!(
                "monitor {} is capturing, stop before reconfiguring",
                monitor_id
            )));
        }
        session.configure(options)
    }

    /// Configured target rate of one monitor
    pub fn monitor_fps(&self, monitor_id: u32) -> CaptureResult<f64> {
        let sessions = self.engine.sessions.lock();
        sessions
            .get(&monitor_id)
            .map(|s| s.target_fps())
            .ok_or_else(|| unknown_monitor(monitor_id))
    }

    pub fn set_adaptive(&mut self, enabled: bool) {
        self.options.adaptive = enabled;
        self.engine.adaptive.store(enabled, Ordering::Relaxed);
    }

    pub fn set_dirty_optimization(&mut self, enabled: bool) {
        self.options.dirty_optimization = enabled;
        self.engine
            .dirty_optimization
            .store(enabled, Ordering::Relaxed);
        let mut sessions = self.engine.sessions.lock();
        for session in sessions.values_mut() {
            session.set_dirty_optimization(enabled);
        }
    }

    pub fn set_adaptive_policy(&mut self, policy: AdaptiveRatePolicy) -> CaptureResult<()> {
        policy.validate()?;
        *self.engine.policy.lock() = policy;
        Ok(())
    }

    /// Install the asynchronous frame callback; takes effect at `start`
    pub fn set_frame_callback(&mut self, callback: impl FnMut(MultiMonitorFrame) + Send + 'static) {
        self.callback = Some(Box::new(callback));
    }

    /// Install the observer that receives coordinator-level errors
    pub fn set_error_observer(&mut self, observer: impl FnMut(&CaptureError) + Send + 'static) {
        *self.engine.error_observer.lock() = Some(Box::new(observer));
    }

    /// Most recent coordinator-level error, if any
    pub fn last_error(&self) -> Option<String> {
        self.engine.last_error.lock().clone()
    }

    /// Open sessions for every enabled monitor and, when a callback is
    /// installed, spawn the producer worker
    pub fn start(&mut self) -> CaptureResult<()> {
        if self.is_capturing() {
            return Ok(());
        }

        {
            let order = self.engine.plan_snapshot();
            let mut sessions = self.engine.sessions.lock();
            for entry in &order {
                if let Some(session) = sessions.get_mut(&entry.id) {
                    if let Err(err) = self.start_session(session) {
                        // Roll back the monitors opened so far.
                        for opened in sessions.values_mut() {
                            opened.stop();
                        }
                        return Err(err);
                    }
                }
            }
        }

        self.engine.running.store(true, Ordering::Relaxed);

        if let Some(callback) = self.callback.take() {
            let (stop_tx, stop_rx) = bounded::<()>(1);
            let engine = Arc::clone(&self.engine);
            self.stop_tx = Some(stop_tx);
            self.worker = Some(std::thread::spawn(move || {
                producer_loop(engine, callback, stop_rx);
            }));
        }

        Ok(())
    }

    fn start_session(&self, session: &mut MonitorSession) -> CaptureResult<()> {
        if session.state() == SessionState::Running {
            return Ok(());
        }
        session.set_dirty_optimization(self.options.dirty_optimization);
        session.reopen()
    }

    /// Cooperative shutdown: flag the worker, wake its sleep, join it, then
    /// stop every session
    pub fn stop(&mut self) {
        self.engine.running.store(false, Ordering::Relaxed);

        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                let err = CaptureError::Fatal("producer worker panicked".to_string());
                error!("{}", err);
                self.engine.record_error(&err);
            }
        }

        let mut sessions = self.engine.sessions.lock();
        for session in sessions.values_mut() {
            session.stop();
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.engine.running.load(Ordering::Relaxed)
    }

    /// Synchronously capture every enabled monitor.
    ///
    /// An empty aggregate is still returned when no monitors are enabled.
    pub fn capture_all(&self) -> CaptureResult<MultiMonitorFrame> {
        if !self.is_capturing() {
            return Err(CaptureError::NotRunning);
        }
        Ok(self.engine.aggregate(true))
    }

    /// Regions detected on the monitor's most recent frame
    pub fn dirty_regions(&self, monitor_id: u32) -> CaptureResult<Vec<DirtyRect>> {
        let sessions = self.engine.sessions.lock();
        sessions
            .get(&monitor_id)
            .map(|s| s.dirty_regions().to_vec())
            .ok_or_else(|| unknown_monitor(monitor_id))
    }

    /// Sort an arbitrary rectangle list by (x, y) and merge touching
    /// rectangles to a fixed point.
    ///
    /// Independent of any session's tracker; intended for consumers that
    /// combine rectangles across monitors.
    pub fn merge_dirty_regions(regions: Vec<DirtyRect>) -> Vec<DirtyRect> {
        merge_regions(regions)
    }

    /// Rolling average aggregation latency
    pub fn average_latency(&self) -> Duration {
        Duration::from_micros(self.engine.latency_avg_us.load(Ordering::Relaxed))
    }

    pub fn total_frames_captured(&self) -> u64 {
        self.engine.total_frames.load(Ordering::Relaxed)
    }

    pub fn total_bytes_transferred(&self) -> u64 {
        self.engine.total_bytes.load(Ordering::Relaxed)
    }

    pub fn session_stats(&self, monitor_id: u32) -> CaptureResult<SessionStats> {
        let sessions = self.engine.sessions.lock();
        sessions
            .get(&monitor_id)
            .map(|s| s.stats())
            .ok_or_else(|| unknown_monitor(monitor_id))
    }
}

impl Drop for MultiMonitorCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The producer worker: aggregate, deliver, adapt, sleep.
///
/// The stop channel doubles as the inter-frame sleep so `stop()` wakes the
/// worker immediately; frames are moved into the callback, which the worker
/// serialises with the next acquisition.
fn producer_loop(engine: Arc<Engine>, mut callback: FrameCallback, stop_rx: Receiver<()>) {
    debug!("producer worker started");

    while engine.running.load(Ordering::Relaxed) {
        let round_start = Instant::now();

        let frame = engine.aggregate(false);
        engine.update_latency(round_start.elapsed());

        callback(frame);

        if engine.adaptive.load(Ordering::Relaxed) {
            engine.optimize_rates();
        }

        let interval = Duration::from_secs_f64(1.0 / engine.global_fps());
        let gap = interval.saturating_sub(round_start.elapsed());
        match stop_rx.recv_timeout(gap) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    debug!("producer worker exited");
}

fn unknown_monitor(monitor_id: u32) -> CaptureError {
    CaptureError::InvalidArgument(format!("unknown monitor id {}", monitor_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::SyntheticBackend;

    fn coordinator(sizes: &[(u32, u32)]) -> MultiMonitorCapture {
        let backend = SyntheticBackend::new(sizes);
        let mut capture = MultiMonitorCapture::with_backend(Box::new(backend));
        capture.initialize().unwrap();
        capture
    }

    #[test]
    fn test_initialize_builds_sessions() {
        let capture = coordinator(&[(640, 480), (800, 600)]);
        let monitors = capture.monitors();
        assert_eq!(monitors.len(), 2);
        assert_eq!(monitors[0].id, 0);
        assert!(monitors[0].is_primary);
    }

    #[test]
    fn test_capture_all_requires_start() {
        let capture = coordinator(&[(640, 480)]);
        assert!(matches!(
            capture.capture_all(),
            Err(CaptureError::NotRunning)
        ));
    }

    #[test]
    fn test_unknown_monitor_is_invalid_argument() {
        let mut capture = coordinator(&[(640, 480)]);
        assert!(matches!(
            capture.set_monitor_priority(9, 1),
            Err(CaptureError::InvalidArgument(_))
        ));
        assert!(matches!(
            capture.set_monitor_fps(9, 60.0),
            Err(CaptureError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_fps_setters_reject_out_of_range() {
        let mut capture = coordinator(&[(640, 480)]);
        assert!(capture.set_global_fps(0.0).is_err());
        assert!(capture.set_global_fps(500.0).is_err());
        assert!(capture.set_monitor_fps(0, -1.0).is_err());
        assert!(capture.set_global_fps(120.0).is_ok());
        assert_eq!(capture.monitor_fps(0).unwrap(), 120.0);
    }

    #[test]
    fn test_priority_orders_aggregate() {
        let mut capture = coordinator(&[(320, 200), (320, 200)]);
        capture.set_monitor_priority(0, 1).unwrap();
        capture.set_monitor_priority(1, 0).unwrap();
        capture.start().unwrap();

        let frame = capture.capture_all().unwrap();
        let ids: Vec<u32> = frame.frames.iter().map(|f| f.monitor_id).collect();
        assert_eq!(ids, vec![1, 0]);
    }

    #[test]
    fn test_disabled_monitor_is_omitted() {
        let mut capture = coordinator(&[(320, 200), (320, 200)]);
        capture.start().unwrap();
        capture.set_monitor_enabled(1, false).unwrap();

        let frame = capture.capture_all().unwrap();
        assert_eq!(frame.frames.len(), 1);
        assert_eq!(frame.frames[0].monitor_id, 0);
    }

    #[test]
    fn test_empty_aggregate_when_all_disabled() {
        let mut capture = coordinator(&[(320, 200)]);
        capture.start().unwrap();
        capture.set_monitor_enabled(0, false).unwrap();

        let frame = capture.capture_all().unwrap();
        assert!(frame.is_empty());
        assert!(frame.errors.is_empty());
        assert_eq!(frame.total_bytes, 0);
    }

    #[test]
    fn test_merge_helper_is_order_independent() {
        let rects = vec![
            DirtyRect::new(64, 0, 32, 32, 0),
            DirtyRect::new(0, 0, 32, 32, 0),
            DirtyRect::new(32, 0, 32, 32, 0),
        ];
        let merged = MultiMonitorCapture::merge_dirty_regions(rects);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].width, 96);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut capture = coordinator(&[(320, 200)]);
        capture.start().unwrap();
        capture.stop();
        capture.stop();
        assert!(!capture.is_capturing());
    }
}
