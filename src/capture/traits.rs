//! The backend contract every capture source implements

use std::time::Duration;

use crate::buffer::FrameBuffer;
use crate::error::CaptureResult;
use crate::types::{BackendOptions, DirtyRect, MonitorDescriptor};

/// A rectangle reported by a backend as changed, before clamping to the
/// frame bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HintRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl HintRect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Clamp to `[0,width) × [0,height)` and stamp monitor metadata
    pub fn into_dirty(self, frame_w: u32, frame_h: u32, monitor_id: u32) -> Option<DirtyRect> {
        DirtyRect::new(self.x, self.y, self.width, self.height, monitor_id)
            .clamped(frame_w, frame_h)
    }
}

/// One raw frame handed up by a backend
#[derive(Debug)]
pub struct BackendFrame {
    pub buffer: FrameBuffer,
    pub width: u32,
    pub height: u32,
    /// Bytes per row of `buffer`
    pub stride: usize,
    /// Regions the backend itself reported as changed; when non-empty the
    /// session skips pixel comparison entirely
    pub change_hints: Vec<HintRect>,
}

/// Result of a single acquisition
#[derive(Debug)]
pub enum AcquireOutcome {
    /// A new frame
    Frame(BackendFrame),
    /// No frame arrived within the timeout
    Timeout,
    /// The source is alive but nothing changed since the last acquisition
    NoChange,
    /// Recoverable failure; the caller may retry on the same session
    Transient(String),
    /// The acquisition resource is gone; the caller must reopen
    Fatal(String),
}

/// A platform capture source
///
/// One backend serves enumeration and opens per-monitor sessions; each
/// session owns exactly one acquisition resource.
pub trait CaptureBackend: Send {
    /// Short identifier for logs and capability reports
    fn name(&self) -> &'static str;

    /// List attached displays
    ///
    /// Implementations guarantee unique ids and exactly one primary
    /// monitor when at least one is present.
    fn enumerate(&mut self) -> CaptureResult<Vec<MonitorDescriptor>>;

    /// Create a per-monitor acquisition resource
    fn open(
        &mut self,
        monitor: &MonitorDescriptor,
        options: &BackendOptions,
    ) -> CaptureResult<Box<dyn BackendSession>>;
}

/// A per-monitor acquisition resource
///
/// Backend-owned memory referenced by a returned frame is released
/// through the frame's drop; it must be released before the next
/// `acquire` on the same session.
pub trait BackendSession: Send {
    /// Obtain the next frame, waiting up to `timeout`
    fn acquire(&mut self, timeout: Duration) -> AcquireOutcome;

    /// Fast paths that failed to initialise and were degraded
    fn degradations(&self) -> &[String] {
        &[]
    }

    /// Tear down the acquisition resource; also runs on drop
    fn close(&mut self) {}
}

/// Ensure exactly one primary monitor: the one at the desktop origin when
/// present, the first otherwise
pub(crate) fn normalize_primary(monitors: &mut [MonitorDescriptor]) {
    if monitors.is_empty() {
        return;
    }
    for m in monitors.iter_mut() {
        m.is_primary = false;
    }
    let at_origin = monitors.iter().position(|m| m.x == 0 && m.y == 0);
    monitors[at_origin.unwrap_or(0)].is_primary = true;
}
