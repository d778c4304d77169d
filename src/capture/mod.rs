//! Screen capture backends with platform-specific implementations

pub mod synthetic;
pub mod traits;

#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "linux")]
pub mod linux;

pub use traits::{AcquireOutcome, BackendFrame, BackendSession, CaptureBackend, HintRect};

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::CaptureResult;

/// A backend shared between the coordinator and its sessions
pub type SharedBackend = Arc<Mutex<Box<dyn CaptureBackend>>>;

pub(crate) fn share(backend: Box<dyn CaptureBackend>) -> SharedBackend {
    Arc::new(Mutex::new(backend))
}

/// Platform-specific backend factory
pub struct PlatformBackend;

impl PlatformBackend {
    /// Create the native capture backend for this platform
    pub fn new() -> CaptureResult<Box<dyn CaptureBackend>> {
        #[cfg(target_os = "windows")]
        {
            Ok(Box::new(windows::DxgiBackend::new()?))
        }

        #[cfg(target_os = "linux")]
        {
            Ok(Box::new(linux::X11Backend::new()?))
        }

        #[cfg(target_os = "macos")]
        {
            Ok(Box::new(macos::DisplayStreamBackend::new()?))
        }

        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            Err(crate::error::CaptureError::Unsupported(
                "no capture backend for this platform".to_string(),
            ))
        }
    }
}
