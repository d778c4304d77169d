//! Core types and structures for monitor enumeration, captured frames and
//! dirty-region bookkeeping

use std::fmt;
use std::sync::OnceLock;
use std::time::Instant;

use crate::buffer::FrameBuffer;
use crate::error::{CaptureError, CaptureResult};

/// Microseconds since the first call in this process, from a monotonic clock.
///
/// All frame and region timestamps share this epoch so they are comparable
/// across monitors and never go backwards.
pub fn monotonic_micros() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// Opaque handle a backend uses to find its capture source again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorHandle {
    #[default]
    None,
    /// Plain index into the backend's own enumeration order
    Index(u32),
    /// DXGI adapter/output pair
    Output { adapter: u32, output: u32 },
    /// CoreGraphics display id
    Display(u32),
}

/// Information about an attached display
///
/// Ids are stable between enumerations of the same coordinator; a rescan
/// may invalidate them.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorDescriptor {
    /// Numeric identifier assigned at enumeration
    pub id: u32,
    /// Desktop-space origin (signed, secondary monitors may be negative)
    pub x: i32,
    pub y: i32,
    /// Extent in pixels
    pub width: u32,
    pub height: u32,
    /// Whether this is the primary display
    pub is_primary: bool,
    /// Logical-to-physical scale factor
    pub scale_factor: f64,
    /// Human-readable name
    pub name: String,
    /// Backend handle used to reopen the capture source
    pub handle: MonitorHandle,
}

impl Default for MonitorDescriptor {
    fn default() -> Self {
        Self {
            id: 0,
            x: 0,
            y: 0,
            width: 1920,
            height: 1080,
            is_primary: true,
            scale_factor: 1.0,
            name: "Primary Monitor".to_string(),
            handle: MonitorHandle::None,
        }
    }
}

impl MonitorDescriptor {
    /// Total pixel count
    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Check whether a desktop-space point falls on this monitor
    pub fn contains_point(&self, px: i32, py: i32) -> bool {
        px >= self.x
            && py >= self.y
            && px < self.x + self.width as i32
            && py < self.y + self.height as i32
    }
}

/// Pixel format of captured frames
///
/// The capture contract is fixed to 32-bit BGRA, little-endian channel
/// order in memory, row-major top-down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    #[default]
    Bgra8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        4
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Bgra8 => write!(f, "BGRA8"),
        }
    }
}

/// A region of a frame known to differ from the previous frame
///
/// Half-open: covers `[x, x+width) × [y, y+height)` in monitor-local
/// coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    /// Monitor the region belongs to
    pub monitor_id: u32,
    /// Detection timestamp, see [`monotonic_micros`]
    pub timestamp_us: u64,
    /// Whether this rectangle resulted from a merge step
    pub merged: bool,
}

impl DirtyRect {
    pub fn new(x: i32, y: i32, width: u32, height: u32, monitor_id: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            monitor_id,
            timestamp_us: monotonic_micros(),
            merged: false,
        }
    }

    /// Exclusive right edge
    pub fn right(&self) -> i32 {
        self.x + self.width as i32
    }

    /// Exclusive bottom edge
    pub fn bottom(&self) -> i32 {
        self.y + self.height as i32
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Check whether two rectangles touch or overlap on both axes
    pub fn touches(&self, other: &DirtyRect) -> bool {
        self.right() >= other.x
            && self.x <= other.right()
            && self.bottom() >= other.y
            && self.y <= other.bottom()
    }

    /// Check whether two half-open rectangles share at least one pixel
    pub fn overlaps(&self, other: &DirtyRect) -> bool {
        self.right() > other.x
            && self.x < other.right()
            && self.bottom() > other.y
            && self.y < other.bottom()
    }

    /// Bounding box of the two rectangles, flagged as merged
    pub fn union_with(&self, other: &DirtyRect) -> DirtyRect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        DirtyRect {
            x,
            y,
            width: (right - x) as u32,
            height: (bottom - y) as u32,
            monitor_id: self.monitor_id,
            timestamp_us: self.timestamp_us.max(other.timestamp_us),
            merged: true,
        }
    }

    /// Intersect with `[0,width) × [0,height)`; `None` when nothing remains
    pub fn clamped(&self, width: u32, height: u32) -> Option<DirtyRect> {
        let x = self.x.max(0);
        let y = self.y.max(0);
        let right = self.right().min(width as i32);
        let bottom = self.bottom().min(height as i32);
        if right <= x || bottom <= y {
            return None;
        }
        Some(DirtyRect {
            x,
            y,
            width: (right - x) as u32,
            height: (bottom - y) as u32,
            ..*self
        })
    }
}

/// One captured frame of a single monitor
pub struct CaptureFrame {
    /// Pixel storage; may reference backend-owned memory, in which case a
    /// release token runs when the frame is dropped
    pub buffer: FrameBuffer,
    pub width: u32,
    pub height: u32,
    /// Bytes per row; at least `width * 4` and a multiple of 4
    pub stride: usize,
    pub format: PixelFormat,
    /// Monitor this frame was captured from
    pub monitor_id: u32,
    /// Capture timestamp, see [`monotonic_micros`]
    pub timestamp_us: u64,
    /// Regions that changed since the previous frame, pairwise
    /// non-overlapping after merging
    pub dirty: Vec<DirtyRect>,
}

impl CaptureFrame {
    pub fn bytes(&self) -> &[u8] {
        self.buffer.bytes()
    }

    pub fn size_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// One row of pixels, without any stride padding past `width * 4`
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let start = y as usize * self.stride;
        let row_bytes = self.width as usize * self.format.bytes_per_pixel();
        self.buffer.bytes().get(start..start + row_bytes)
    }
}

impl fmt::Debug for CaptureFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureFrame")
            .field("monitor_id", &self.monitor_id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("format", &self.format)
            .field("timestamp_us", &self.timestamp_us)
            .field("dirty", &self.dirty.len())
            .finish()
    }
}

/// Aggregate of per-monitor frames for one capture round
///
/// Frames are ordered by ascending monitor priority, then id.
#[derive(Debug, Default)]
pub struct MultiMonitorFrame {
    pub frames: Vec<CaptureFrame>,
    /// Descriptor snapshots matching `frames` by position
    pub monitors: Vec<MonitorDescriptor>,
    /// Set once when the coordinator begins the round
    pub timestamp_us: u64,
    /// Total pixel payload across all frames
    pub total_bytes: usize,
    /// Monitors omitted from this round, with the failure reason
    pub errors: Vec<(u32, String)>,
}

impl MultiMonitorFrame {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame_for(&self, monitor_id: u32) -> Option<&CaptureFrame> {
        self.frames.iter().find(|f| f.monitor_id == monitor_id)
    }
}

/// Lifecycle state of a monitor session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Configured,
    Running,
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Configured => "configured",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
        };
        write!(f, "{}", name)
    }
}

/// Counters maintained by a session
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub frames_captured: u64,
    pub bytes_transferred: u64,
    /// Timestamp of the last successful acquisition
    pub last_capture_us: Option<u64>,
}

/// Per-monitor backend options
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Target frame rate, in `(0, 240]`
    pub target_fps: f64,
    /// Composite the cursor into captured frames where the platform allows
    pub include_cursor: bool,
    /// Prefer zero-copy transport (shared memory, GPU handoff)
    pub prefer_zero_copy: bool,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            target_fps: 60.0,
            include_cursor: false,
            prefer_zero_copy: true,
        }
    }
}

impl BackendOptions {
    pub fn validate(&self) -> CaptureResult<()> {
        validate_fps(self.target_fps)
    }
}

/// Dirty-region tracker options
#[derive(Debug, Clone)]
pub struct TrackerOptions {
    /// Per-block difference ratio above which the block is dirty, in `[0, 1]`
    pub threshold: f64,
    /// Merge touching regions into bounding boxes
    pub merge_enabled: bool,
    /// Regions narrower than this are dropped before merging
    pub min_width: u32,
    /// Regions shorter than this are dropped before merging
    pub min_height: u32,
    /// Hard cap on emitted regions; the excess is truncated, never collapsed
    /// into a full-screen rectangle
    pub max_region_count: usize,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            threshold: 0.02,
            merge_enabled: true,
            min_width: 16,
            min_height: 16,
            max_region_count: 64,
        }
    }
}

impl TrackerOptions {
    pub fn validate(&self) -> CaptureResult<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(CaptureError::InvalidArgument(format!(
                "threshold must be within [0, 1], got {}",
                self.threshold
            )));
        }
        if self.max_region_count == 0 {
            return Err(CaptureError::InvalidArgument(
                "max_region_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Coordinator-level options
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Producer worker rate, in `(0, 240]`
    pub global_fps: f64,
    /// Adjust per-monitor rates from observed latency
    pub adaptive: bool,
    /// Run the dirty-region tracker when backends report no change hints
    pub dirty_optimization: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            global_fps: 60.0,
            adaptive: true,
            dirty_optimization: true,
        }
    }
}

impl CoordinatorOptions {
    pub fn validate(&self) -> CaptureResult<()> {
        validate_fps(self.global_fps)
    }
}

/// Bounds and ratios for adaptive rate adjustment
#[derive(Debug, Clone)]
pub struct AdaptiveRatePolicy {
    /// Average latency above which rates are lowered, in milliseconds
    pub lower_above_ms: f64,
    /// Average latency below which rates are raised, in milliseconds
    pub raise_below_ms: f64,
    /// Multiplier applied when lowering
    pub lower_ratio: f64,
    /// Multiplier applied when raising
    pub raise_ratio: f64,
    pub min_fps: f64,
    pub max_fps: f64,
}

impl Default for AdaptiveRatePolicy {
    fn default() -> Self {
        Self {
            lower_above_ms: 16.0,
            raise_below_ms: 8.0,
            lower_ratio: 0.9,
            raise_ratio: 1.1,
            min_fps: 30.0,
            max_fps: 120.0,
        }
    }
}

impl AdaptiveRatePolicy {
    pub fn validate(&self) -> CaptureResult<()> {
        if self.min_fps <= 0.0 || self.max_fps < self.min_fps {
            return Err(CaptureError::InvalidArgument(format!(
                "rate bounds [{}, {}] are not ordered",
                self.min_fps, self.max_fps
            )));
        }
        if self.lower_ratio <= 0.0 || self.lower_ratio >= 1.0 {
            return Err(CaptureError::InvalidArgument(format!(
                "lower ratio must be within (0, 1), got {}",
                self.lower_ratio
            )));
        }
        if self.raise_ratio <= 1.0 {
            return Err(CaptureError::InvalidArgument(format!(
                "raise ratio must exceed 1, got {}",
                self.raise_ratio
            )));
        }
        Ok(())
    }

    /// New rate for a monitor given the rolling average latency
    pub fn adjust(&self, latency_ms: f64, fps: f64) -> f64 {
        if latency_ms > self.lower_above_ms {
            (fps * self.lower_ratio).max(self.min_fps)
        } else if latency_ms < self.raise_below_ms {
            (fps * self.raise_ratio).min(self.max_fps)
        } else {
            fps
        }
    }
}

pub(crate) fn validate_fps(fps: f64) -> CaptureResult<()> {
    if !fps.is_finite() || fps <= 0.0 || fps > 240.0 {
        return Err(CaptureError::InvalidArgument(format!(
            "frame rate must be within (0, 240], got {}",
            fps
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_micros_is_monotonic() {
        let a = monotonic_micros();
        let b = monotonic_micros();
        assert!(b >= a);
    }

    #[test]
    fn test_rect_touches_and_overlaps() {
        let a = DirtyRect::new(0, 0, 32, 32, 0);
        let adjacent = DirtyRect::new(32, 0, 32, 32, 0);
        let apart = DirtyRect::new(65, 0, 32, 32, 0);

        assert!(a.touches(&adjacent));
        assert!(!a.overlaps(&adjacent));
        assert!(!a.touches(&apart));
    }

    #[test]
    fn test_rect_union() {
        let a = DirtyRect::new(0, 0, 32, 32, 0);
        let b = DirtyRect::new(32, 16, 32, 32, 0);
        let u = a.union_with(&b);
        assert_eq!((u.x, u.y, u.width, u.height), (0, 0, 64, 48));
        assert!(u.merged);
    }

    #[test]
    fn test_rect_clamped() {
        let r = DirtyRect::new(-10, 1070, 30, 30, 0);
        let c = r.clamped(1920, 1080).unwrap();
        assert_eq!((c.x, c.y, c.width, c.height), (0, 1070, 20, 10));

        let outside = DirtyRect::new(2000, 0, 10, 10, 0);
        assert!(outside.clamped(1920, 1080).is_none());
    }

    #[test]
    fn test_fps_validation() {
        assert!(BackendOptions::default().validate().is_ok());
        assert!(BackendOptions {
            target_fps: 0.0,
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(BackendOptions {
            target_fps: 241.0,
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_tracker_options_validation() {
        assert!(TrackerOptions::default().validate().is_ok());
        assert!(TrackerOptions {
            threshold: 1.5,
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_adaptive_policy_adjust() {
        let policy = AdaptiveRatePolicy::default();
        assert!((policy.adjust(20.0, 60.0) - 54.0).abs() < 1e-9);
        assert!((policy.adjust(5.0, 60.0) - 66.0).abs() < 1e-9);
        assert_eq!(policy.adjust(12.0, 60.0), 60.0);
        assert_eq!(policy.adjust(20.0, 30.0), 30.0);
        assert_eq!(policy.adjust(5.0, 120.0), 120.0);
    }
}
