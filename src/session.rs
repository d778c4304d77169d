//! Per-monitor capture session
//!
//! A session couples one backend acquisition resource to one dirty-region
//! tracker and enforces the monitor's target frame rate. Lifecycle:
//! `Idle → Configured → Running → Stopping → Idle`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::capture::{AcquireOutcome, BackendFrame, BackendSession, SharedBackend};
use crate::error::{CaptureError, CaptureResult};
use crate::tracker::{merge_regions, DirtyRegionTracker};
use crate::types::{
    monotonic_micros, validate_fps, BackendOptions, CaptureFrame, DirtyRect, MonitorDescriptor,
    PixelFormat, SessionState, SessionStats, TrackerOptions,
};

/// Default acquisition timeout, matching a 60 fps budget
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(16);

/// Lifecycle object coupling one backend session and one tracker for one
/// monitor
pub struct MonitorSession {
    monitor: MonitorDescriptor,
    backend: SharedBackend,
    options: BackendOptions,
    state: SessionState,
    link: Option<Box<dyn BackendSession>>,
    tracker: DirtyRegionTracker,
    target_fps: f64,
    dirty_optimization: bool,
    last_capture: Option<Instant>,
    last_dirty: Vec<DirtyRect>,
    frames_captured: AtomicU64,
    bytes_transferred: AtomicU64,
    last_capture_us: AtomicU64,
}

impl MonitorSession {
    pub fn new(monitor: MonitorDescriptor, backend: SharedBackend) -> Self {
        let tracker = DirtyRegionTracker::new(monitor.id, TrackerOptions::default());
        Self {
            monitor,
            backend,
            options: BackendOptions::default(),
            state: SessionState::Idle,
            link: None,
            tracker,
            target_fps: 60.0,
            dirty_optimization: true,
            last_capture: None,
            last_dirty: Vec::new(),
            frames_captured: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            last_capture_us: AtomicU64::new(0),
        }
    }

    pub fn monitor(&self) -> &MonitorDescriptor {
        &self.monitor
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn target_fps(&self) -> f64 {
        self.target_fps
    }

    pub fn set_target_fps(&mut self, fps: f64) -> CaptureResult<()> {
        validate_fps(fps)?;
        self.target_fps = fps;
        Ok(())
    }

    pub fn set_dirty_optimization(&mut self, enabled: bool) {
        self.dirty_optimization = enabled;
    }

    pub fn set_tracker_options(&mut self, options: TrackerOptions) -> CaptureResult<()> {
        options.validate()?;
        self.tracker.set_options(options);
        Ok(())
    }

    /// Regions detected on the most recent frame
    pub fn dirty_regions(&self) -> &[DirtyRect] {
        &self.last_dirty
    }

    pub fn stats(&self) -> SessionStats {
        let last = self.last_capture_us.load(Ordering::Relaxed);
        SessionStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            last_capture_us: (last != 0).then_some(last),
        }
    }

    /// Fast paths the backend degraded away from, if any
    pub fn degradations(&self) -> Vec<String> {
        self.link
            .as_ref()
            .map(|l| l.degradations().to_vec())
            .unwrap_or_default()
    }

    /// Store options; allowed while no backend session is open
    pub fn configure(&mut self, options: BackendOptions) -> CaptureResult<()> {
        options.validate()?;
        match self.state {
            SessionState::Idle | SessionState::Configured => {
                self.target_fps = options.target_fps;
                self.options = options;
                self.state = SessionState::Configured;
                Ok(())
            }
            _ => Err(CaptureError::InvalidArgument(format!(
                "cannot configure a {} session",
                self.state
            ))),
        }
    }

    pub fn options(&self) -> &BackendOptions {
        &self.options
    }

    /// Configure with the stored options (keeping the current target rate)
    /// and start; used after a fatal failure returned the session to `Idle`
    pub fn reopen(&mut self) -> CaptureResult<()> {
        let mut options = self.options.clone();
        options.target_fps = self.target_fps;
        self.configure(options)?;
        self.start()
    }

    /// Open the backend session and reset the tracker
    pub fn start(&mut self) -> CaptureResult<()> {
        match self.state {
            SessionState::Configured => {
                let link = self
                    .backend
                    .lock()
                    .open(&self.monitor, &self.options)?;
                for degradation in link.degradations() {
                    warn!("monitor {}: {}", self.monitor.id, degradation);
                }
                self.link = Some(link);
                self.tracker.reset();
                self.last_capture = None;
                self.state = SessionState::Running;
                debug!("monitor {}: session running", self.monitor.id);
                Ok(())
            }
            SessionState::Running => Ok(()),
            _ => Err(CaptureError::InvalidArgument(format!(
                "cannot start a {} session",
                self.state
            ))),
        }
    }

    /// Release outstanding resources and return to `Idle`
    pub fn stop(&mut self) {
        if self.state != SessionState::Running {
            return;
        }
        self.state = SessionState::Stopping;
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.tracker.reset();
        self.last_dirty.clear();
        self.state = SessionState::Idle;
        debug!("monitor {}: session idle", self.monitor.id);
    }

    /// Capture one frame, sleeping out the rate-limit remainder first
    pub fn capture(&mut self) -> CaptureResult<CaptureFrame> {
        if self.state != SessionState::Running {
            return Err(CaptureError::NotRunning);
        }
        if let Some(remaining) = self.throttle_remaining() {
            std::thread::sleep(remaining);
        }
        self.acquire_frame()
    }

    /// Capture one frame, or report `Throttled` with the remaining delay.
    ///
    /// The coordinator's producer worker uses this signal to schedule its
    /// next wake instead of sleeping inside the session.
    pub fn poll_capture(&mut self) -> CaptureResult<CaptureFrame> {
        if self.state != SessionState::Running {
            return Err(CaptureError::NotRunning);
        }
        if let Some(remaining) = self.throttle_remaining() {
            return Err(CaptureError::Throttled {
                retry_after: remaining,
            });
        }
        self.acquire_frame()
    }

    fn throttle_remaining(&self) -> Option<Duration> {
        let last = self.last_capture?;
        let interval = Duration::from_secs_f64(1.0 / self.target_fps);
        interval.checked_sub(last.elapsed())
    }

    fn acquire_frame(&mut self) -> CaptureResult<CaptureFrame> {
        let link = self.link.as_mut().ok_or(CaptureError::NotRunning)?;

        match link.acquire(ACQUIRE_TIMEOUT) {
            AcquireOutcome::Frame(frame) => {
                debug_assert!(frame.stride >= frame.width as usize * 4);
                debug_assert_eq!(frame.stride % 4, 0);
                let frame = self.finish_frame(frame);
                Ok(frame)
            }
            AcquireOutcome::Timeout | AcquireOutcome::NoChange => Err(CaptureError::Throttled {
                retry_after: Duration::ZERO,
            }),
            AcquireOutcome::Transient(reason) => Err(CaptureError::Transient(reason)),
            AcquireOutcome::Fatal(reason) => {
                warn!(
                    "monitor {}: fatal acquisition failure: {}",
                    self.monitor.id, reason
                );
                self.fail_fatal();
                Err(CaptureError::Fatal(reason))
            }
        }
    }

    /// Populate dirty regions, stamp metadata and update counters
    fn finish_frame(&mut self, frame: BackendFrame) -> CaptureFrame {
        let timestamp_us = monotonic_micros();
        let dirty = self.dirty_for(&frame);

        self.last_capture = Some(Instant::now());
        self.last_dirty = dirty.clone();
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred
            .fetch_add(frame.buffer.len() as u64, Ordering::Relaxed);
        self.last_capture_us.store(timestamp_us, Ordering::Relaxed);

        CaptureFrame {
            buffer: frame.buffer,
            width: frame.width,
            height: frame.height,
            stride: frame.stride,
            format: PixelFormat::Bgra8,
            monitor_id: self.monitor.id,
            timestamp_us,
            dirty,
        }
    }

    fn dirty_for(&mut self, frame: &BackendFrame) -> Vec<DirtyRect> {
        if !frame.change_hints.is_empty() {
            // Backend hints bypass pixel comparison; merging keeps the
            // pairwise-disjoint invariant.
            let rects: Vec<DirtyRect> = frame
                .change_hints
                .iter()
                .filter_map(|h| h.into_dirty(frame.width, frame.height, self.monitor.id))
                .collect();
            return merge_regions(rects);
        }

        if self.dirty_optimization {
            self.tracker
                .track(frame.buffer.bytes(), frame.width, frame.height, frame.stride)
        } else {
            vec![DirtyRect::new(
                0,
                0,
                frame.width,
                frame.height,
                self.monitor.id,
            )]
        }
    }

    fn fail_fatal(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.tracker.reset();
        self.last_dirty.clear();
        self.state = SessionState::Idle;
    }
}

impl Drop for MonitorSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::{SyntheticBackend, SyntheticFailure};
    use crate::capture::traits::CaptureBackend;
    use crate::capture::{share, HintRect};

    fn session_with_control(
        sizes: &[(u32, u32)],
    ) -> (MonitorSession, crate::capture::synthetic::SyntheticControl) {
        let mut backend = SyntheticBackend::new(sizes);
        let control = backend.controller();
        let monitor = backend.enumerate().unwrap().remove(0);
        let session = MonitorSession::new(monitor, share(Box::new(backend)));
        (session, control)
    }

    fn running_session(sizes: &[(u32, u32)]) -> (MonitorSession, crate::capture::synthetic::SyntheticControl) {
        let (mut session, control) = session_with_control(sizes);
        session.configure(BackendOptions::default()).unwrap();
        session.start().unwrap();
        (session, control)
    }

    #[test]
    fn test_capture_requires_running_state() {
        let (mut session, _control) = session_with_control(&[(64, 32)]);
        assert!(matches!(
            session.capture(),
            Err(CaptureError::NotRunning)
        ));
    }

    #[test]
    fn test_state_machine_walk() {
        let (mut session, _control) = session_with_control(&[(64, 32)]);
        assert_eq!(session.state(), SessionState::Idle);

        session.configure(BackendOptions::default()).unwrap();
        assert_eq!(session.state(), SessionState::Configured);

        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Running);

        session.stop();
        assert_eq!(session.state(), SessionState::Idle);

        // Starting from idle requires configuring again.
        assert!(session.start().is_err());
    }

    #[test]
    fn test_first_frame_is_fully_dirty() {
        let (mut session, _control) = running_session(&[(64, 32)]);
        let frame = session.capture().unwrap();

        assert_eq!(frame.width, 64);
        assert_eq!(frame.dirty.len(), 1);
        assert_eq!(frame.dirty[0].width, 64);
        assert_eq!(frame.dirty[0].height, 32);
    }

    #[test]
    fn test_unchanged_frames_have_no_dirty_regions() {
        let (mut session, _control) = running_session(&[(64, 32)]);
        session.set_target_fps(240.0).unwrap();
        session.capture().unwrap();
        let second = session.capture().unwrap();
        assert!(second.dirty.is_empty());
    }

    #[test]
    fn test_change_hints_bypass_tracker() {
        let (mut session, control) = running_session(&[(640, 480)]);
        session.set_target_fps(240.0).unwrap();
        control.set_change_hints(vec![HintRect::new(100, 100, 200, 200)]);

        let frame = session.capture().unwrap();
        assert_eq!(frame.dirty.len(), 1);
        let r = &frame.dirty[0];
        assert_eq!((r.x, r.y, r.width, r.height), (100, 100, 200, 200));
    }

    #[test]
    fn test_fatal_moves_session_to_idle() {
        let (mut session, control) = running_session(&[(64, 32)]);
        control.inject_failure(0, SyntheticFailure::Fatal("device lost".to_string()));

        let err = session.capture().unwrap_err();
        assert!(matches!(err, CaptureError::Fatal(_)));
        assert_eq!(session.state(), SessionState::Idle);

        // Reconfigure and the next capture succeeds.
        session.configure(BackendOptions::default()).unwrap();
        session.start().unwrap();
        assert!(session.capture().is_ok());
    }

    #[test]
    fn test_poll_capture_reports_throttled() {
        let (mut session, _control) = running_session(&[(64, 32)]);
        session.set_target_fps(1.0).unwrap();

        session.poll_capture().unwrap();
        match session.poll_capture() {
            Err(CaptureError::Throttled { retry_after }) => {
                assert!(retry_after <= Duration::from_secs(1));
                assert!(retry_after > Duration::ZERO);
            }
            other => panic!("expected throttled, got {:?}", other.map(|f| f.timestamp_us)),
        }
    }

    #[test]
    fn test_timestamps_are_monotonic() {
        let (mut session, _control) = running_session(&[(64, 32)]);
        session.set_target_fps(240.0).unwrap();
        let a = session.capture().unwrap().timestamp_us;
        let b = session.capture().unwrap().timestamp_us;
        assert!(b >= a);
    }

    #[test]
    fn test_counters_track_frames_and_bytes() {
        let (mut session, _control) = running_session(&[(64, 32)]);
        session.set_target_fps(240.0).unwrap();
        session.capture().unwrap();
        session.capture().unwrap();

        let stats = session.stats();
        assert_eq!(stats.frames_captured, 2);
        assert_eq!(stats.bytes_transferred, 2 * 64 * 32 * 4);
        assert!(stats.last_capture_us.is_some());
    }
}
