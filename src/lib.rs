//! Station Capture
//!
//! The frame-capture core of a low-latency desktop-streaming station:
//! continuous multi-monitor pixel acquisition with dirty-region
//! annotation, delivered synchronously on demand or asynchronously
//! through a callback.
//!
//! # Example
//!
//! ```no_run
//! use station_capture::MultiMonitorCapture;
//!
//! # fn main() -> station_capture::CaptureResult<()> {
//! let mut capture = MultiMonitorCapture::new()?;
//! capture.initialize()?;
//! capture.start()?;
//!
//! let aggregate = capture.capture_all()?;
//! for frame in &aggregate.frames {
//!     println!(
//!         "monitor {}: {}x{}, {} dirty regions",
//!         frame.monitor_id,
//!         frame.width,
//!         frame.height,
//!         frame.dirty.len()
//!     );
//! }
//!
//! capture.stop();
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod capture;
pub mod coordinator;
pub mod error;
pub mod session;
pub mod tracker;
pub mod types;

// Re-export main types
pub use buffer::{BufferPool, FrameBuffer, PooledBuffer, ReleaseToken, SharedSlice};
pub use capture::synthetic::{SyntheticBackend, SyntheticControl, SyntheticFailure};
pub use capture::{
    AcquireOutcome, BackendFrame, BackendSession, CaptureBackend, HintRect, PlatformBackend,
};
pub use coordinator::{FrameCallback, MultiMonitorCapture};
pub use error::{CaptureError, CaptureResult, ErrorKind};
pub use session::MonitorSession;
pub use tracker::{merge_regions, DirtyRegionTracker, TrackerStats, BLOCK_SIZE};
pub use types::{
    monotonic_micros, AdaptiveRatePolicy, BackendOptions, CaptureFrame, CoordinatorOptions,
    DirtyRect, MonitorDescriptor, MonitorHandle, MultiMonitorFrame, PixelFormat, SessionState,
    SessionStats, TrackerOptions,
};

/// Enumerate attached displays with the native backend
pub fn enumerate_monitors() -> CaptureResult<Vec<MonitorDescriptor>> {
    let mut backend = PlatformBackend::new()?;
    backend.enumerate()
}

/// Library version information
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Capabilities of this build
pub fn capabilities() -> String {
    let mut caps = Vec::new();

    #[cfg(target_os = "windows")]
    caps.push("Windows/DXGI");
    #[cfg(target_os = "macos")]
    caps.push("macOS/DisplayStream");
    #[cfg(target_os = "linux")]
    caps.push("Linux/X11");

    caps.push("Synthetic");
    caps.push("DirtyRegions");
    caps.push("MultiMonitor");

    caps.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }

    #[test]
    fn test_capabilities() {
        let caps = capabilities();
        assert!(caps.contains("DirtyRegions"));
        assert!(caps.contains("MultiMonitor"));
    }
}
