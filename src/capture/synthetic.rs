//! Synthetic capture backend
//!
//! Generates frames without touching any display server, for headless
//! operation and for driving the integration tests. A [`SyntheticControl`]
//! handle, cloned before the backend is handed to a coordinator, scripts
//! fills, change hints, acquisition latency and failures per monitor.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::buffer::global_pool;
use crate::capture::traits::{
    normalize_primary, AcquireOutcome, BackendFrame, BackendSession, CaptureBackend, HintRect,
};
use crate::error::CaptureResult;
use crate::types::{BackendOptions, MonitorDescriptor, MonitorHandle};

/// A scripted acquisition failure, consumed in FIFO order
#[derive(Debug, Clone)]
pub enum SyntheticFailure {
    Timeout,
    NoChange,
    Transient(String),
    Fatal(String),
}

#[derive(Debug)]
struct ControlInner {
    /// BGRA fill for generated frames
    fill: [u8; 4],
    /// Hints attached to every frame; `None` leaves detection to the tracker
    change_hints: Option<Vec<HintRect>>,
    /// Artificial delay per acquisition
    acquire_latency: Duration,
    /// Pending failures per monitor id
    failures: HashMap<u32, VecDeque<SyntheticFailure>>,
    frames_generated: u64,
}

/// Shared handle that scripts the backend's behaviour
#[derive(Clone)]
pub struct SyntheticControl {
    inner: Arc<Mutex<ControlInner>>,
}

impl SyntheticControl {
    /// Solid BGRA fill used for every generated frame
    pub fn set_fill(&self, bgra: [u8; 4]) {
        self.inner.lock().fill = bgra;
    }

    /// Attach fixed change hints to every frame, bypassing the tracker
    pub fn set_change_hints(&self, hints: Vec<HintRect>) {
        self.inner.lock().change_hints = Some(hints);
    }

    pub fn clear_change_hints(&self) {
        self.inner.lock().change_hints = None;
    }

    /// Delay every acquisition, to simulate capture latency
    pub fn set_acquire_latency(&self, latency: Duration) {
        self.inner.lock().acquire_latency = latency;
    }

    /// Queue a failure for the next acquisition on `monitor_id`
    pub fn inject_failure(&self, monitor_id: u32, failure: SyntheticFailure) {
        self.inner
            .lock()
            .failures
            .entry(monitor_id)
            .or_default()
            .push_back(failure);
    }

    pub fn frames_generated(&self) -> u64 {
        self.inner.lock().frames_generated
    }
}

/// Capture backend producing generated frames
pub struct SyntheticBackend {
    layouts: Vec<(u32, u32)>,
    control: SyntheticControl,
}

impl SyntheticBackend {
    /// One synthetic monitor per `(width, height)` entry, laid out left to
    /// right starting at the desktop origin
    pub fn new(sizes: &[(u32, u32)]) -> Self {
        Self {
            layouts: sizes.to_vec(),
            control: SyntheticControl {
                inner: Arc::new(Mutex::new(ControlInner {
                    fill: [0, 0, 0, 255],
                    change_hints: None,
                    acquire_latency: Duration::ZERO,
                    failures: HashMap::new(),
                    frames_generated: 0,
                })),
            },
        }
    }

    /// Clone the scripting handle before handing the backend away
    pub fn controller(&self) -> SyntheticControl {
        self.control.clone()
    }
}

impl CaptureBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn enumerate(&mut self) -> CaptureResult<Vec<MonitorDescriptor>> {
        let mut monitors = Vec::with_capacity(self.layouts.len());
        let mut x = 0i32;
        for (id, &(width, height)) in self.layouts.iter().enumerate() {
            monitors.push(MonitorDescriptor {
                id: id as u32,
                x,
                y: 0,
                width,
                height,
                is_primary: false,
                scale_factor: 1.0,
                name: format!("Synthetic {}", id),
                handle: MonitorHandle::Index(id as u32),
            });
            x += width as i32;
        }
        normalize_primary(&mut monitors);
        Ok(monitors)
    }

    fn open(
        &mut self,
        monitor: &MonitorDescriptor,
        options: &BackendOptions,
    ) -> CaptureResult<Box<dyn BackendSession>> {
        options.validate()?;
        Ok(Box::new(SyntheticSession {
            monitor_id: monitor.id,
            width: monitor.width,
            height: monitor.height,
            control: self.control.clone(),
        }))
    }
}

struct SyntheticSession {
    monitor_id: u32,
    width: u32,
    height: u32,
    control: SyntheticControl,
}

impl BackendSession for SyntheticSession {
    fn acquire(&mut self, _timeout: Duration) -> AcquireOutcome {
        let (latency, scripted) = {
            let mut inner = self.control.inner.lock();
            let scripted = inner
                .failures
                .get_mut(&self.monitor_id)
                .and_then(VecDeque::pop_front);
            (inner.acquire_latency, scripted)
        };

        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        if let Some(failure) = scripted {
            return match failure {
                SyntheticFailure::Timeout => AcquireOutcome::Timeout,
                SyntheticFailure::NoChange => AcquireOutcome::NoChange,
                SyntheticFailure::Transient(reason) => AcquireOutcome::Transient(reason),
                SyntheticFailure::Fatal(reason) => AcquireOutcome::Fatal(reason),
            };
        }

        let (fill, hints) = {
            let mut inner = self.control.inner.lock();
            inner.frames_generated += 1;
            (inner.fill, inner.change_hints.clone().unwrap_or_default())
        };

        let stride = self.width as usize * 4;
        let mut buffer = global_pool().acquire(stride * self.height as usize);
        for pixel in buffer.bytes_mut().chunks_exact_mut(4) {
            pixel.copy_from_slice(&fill);
        }

        AcquireOutcome::Frame(BackendFrame {
            buffer: buffer.into(),
            width: self.width,
            height: self.height,
            stride,
            change_hints: hints,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumeration_layout() {
        let mut backend = SyntheticBackend::new(&[(1920, 1080), (1280, 720)]);
        let monitors = backend.enumerate().unwrap();

        assert_eq!(monitors.len(), 2);
        assert_eq!(monitors[0].x, 0);
        assert_eq!(monitors[1].x, 1920);
        assert!(monitors[0].is_primary);
        assert!(!monitors[1].is_primary);
    }

    #[test]
    fn test_acquire_generates_filled_frame() {
        let mut backend = SyntheticBackend::new(&[(64, 32)]);
        backend.controller().set_fill([10, 20, 30, 255]);

        let monitors = backend.enumerate().unwrap();
        let mut session = backend
            .open(&monitors[0], &BackendOptions::default())
            .unwrap();

        match session.acquire(Duration::from_millis(16)) {
            AcquireOutcome::Frame(frame) => {
                assert_eq!(frame.width, 64);
                assert_eq!(frame.stride, 64 * 4);
                assert_eq!(&frame.buffer.bytes()[..4], &[10, 20, 30, 255]);
                assert!(frame.change_hints.is_empty());
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_scripted_failures_consume_in_order() {
        let mut backend = SyntheticBackend::new(&[(64, 32)]);
        let control = backend.controller();
        control.inject_failure(0, SyntheticFailure::Fatal("gone".to_string()));

        let monitors = backend.enumerate().unwrap();
        let mut session = backend
            .open(&monitors[0], &BackendOptions::default())
            .unwrap();

        assert!(matches!(
            session.acquire(Duration::from_millis(16)),
            AcquireOutcome::Fatal(_)
        ));
        assert!(matches!(
            session.acquire(Duration::from_millis(16)),
            AcquireOutcome::Frame(_)
        ));
    }
}
