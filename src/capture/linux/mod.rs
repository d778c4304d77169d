//! Linux capture backend, built on X11

mod x11;

pub use x11::X11Session;

use anyhow::Context;
use x11rb::connection::Connection;
use x11rb::protocol::randr::{self, ConnectionExt as _};
use x11rb::rust_connection::RustConnection;

use crate::capture::traits::{normalize_primary, BackendSession, CaptureBackend};
use crate::error::{CaptureError, CaptureResult};
use crate::types::{BackendOptions, MonitorDescriptor, MonitorHandle};

/// X11 capture backend
///
/// Enumeration runs over this connection; every open session makes its
/// own connection so damage notifications are not shared between
/// monitors.
pub struct X11Backend {
    connection: RustConnection,
    screen_num: usize,
}

impl X11Backend {
    pub fn new() -> CaptureResult<Self> {
        let (connection, screen_num) = RustConnection::connect(None)
            .context("failed to connect to the X server")
            .map_err(CaptureError::Other)?;
        Ok(Self {
            connection,
            screen_num,
        })
    }
}

impl CaptureBackend for X11Backend {
    fn name(&self) -> &'static str {
        "x11"
    }

    fn enumerate(&mut self) -> CaptureResult<Vec<MonitorDescriptor>> {
        let setup = self.connection.setup();
        let screen = &setup.roots[self.screen_num];
        let root = screen.root;

        let mut monitors = Vec::new();

        let resources = self
            .connection
            .randr_get_screen_resources(root)
            .ok()
            .and_then(|cookie| cookie.reply().ok());

        if let Some(resources) = resources {
            for &crtc in resources.crtcs.iter() {
                let info = match randr::get_crtc_info(
                    &self.connection,
                    crtc,
                    resources.config_timestamp,
                )
                .ok()
                .and_then(|cookie| cookie.reply().ok())
                {
                    Some(info) => info,
                    None => continue,
                };

                // Skip disabled CRTCs.
                if info.mode == 0 || info.outputs.is_empty() {
                    continue;
                }

                monitors.push(MonitorDescriptor {
                    id: monitors.len() as u32,
                    x: info.x as i32,
                    y: info.y as i32,
                    width: info.width as u32,
                    height: info.height as u32,
                    is_primary: false,
                    scale_factor: 1.0,
                    name: format!("Display {}", monitors.len() + 1),
                    handle: MonitorHandle::Index(crtc),
                });
            }
        }

        if monitors.is_empty() {
            // Root window geometry covers the whole virtual screen.
            monitors.push(MonitorDescriptor {
                id: 0,
                x: 0,
                y: 0,
                width: screen.width_in_pixels as u32,
                height: screen.height_in_pixels as u32,
                is_primary: false,
                scale_factor: 1.0,
                name: "Display 1".to_string(),
                handle: MonitorHandle::Index(0),
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
        let session = X11Session::open(monitor, options)?;
        Ok(Box::new(session))
    }
}
