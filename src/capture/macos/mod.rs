//! macOS capture backend, built on CGDisplayStream

mod display_stream;

pub use display_stream::DisplayStreamSession;

use core_graphics::display::CGDisplay;

use crate::capture::traits::{normalize_primary, BackendSession, CaptureBackend};
use crate::error::{CaptureError, CaptureResult};
use crate::types::{BackendOptions, MonitorDescriptor, MonitorHandle};

/// Display-stream capture backend
pub struct DisplayStreamBackend;

impl DisplayStreamBackend {
    pub fn new() -> CaptureResult<Self> {
        Ok(Self)
    }
}

impl CaptureBackend for DisplayStreamBackend {
    fn name(&self) -> &'static str {
        "display-stream"
    }

    fn enumerate(&mut self) -> CaptureResult<Vec<MonitorDescriptor>> {
        let display_ids = CGDisplay::active_displays().map_err(|code| {
            CaptureError::Fatal(format!("CGGetActiveDisplayList failed: {code}"))
        })?;

        let mut monitors = Vec::with_capacity(display_ids.len());
        for (index, &display_id) in display_ids.iter().enumerate() {
            let display = CGDisplay::new(display_id);
            let bounds = display.bounds();
            let scale_factor = if bounds.size.width > 0.0 {
                display.pixels_wide() as f64 / bounds.size.width
            } else {
                1.0
            };

            monitors.push(MonitorDescriptor {
                id: index as u32,
                x: bounds.origin.x as i32,
                y: bounds.origin.y as i32,
                width: bounds.size.width as u32,
                height: bounds.size.height as u32,
                is_primary: false,
                scale_factor,
                name: format!("Display {}", index + 1),
                handle: MonitorHandle::Display(display_id),
            });
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
        let MonitorHandle::Display(display_id) = monitor.handle else {
            return Err(CaptureError::InvalidArgument(format!(
                "monitor {} carries no display handle",
                monitor.id
            )));
        };
        let session = DisplayStreamSession::open(display_id, monitor, options)?;
        Ok(Box::new(session))
    }
}
