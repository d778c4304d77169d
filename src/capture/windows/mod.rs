//! Windows capture backend, built on DXGI desktop duplication

mod duplication;

pub use duplication::DuplicationSession;

use anyhow::Context;
use windows::Win32::Graphics::Dxgi::{CreateDXGIFactory1, IDXGIFactory1};

use crate::capture::traits::{normalize_primary, BackendSession, CaptureBackend};
use crate::error::{CaptureError, CaptureResult};
use crate::types::{BackendOptions, MonitorDescriptor, MonitorHandle};

/// DXGI-based capture backend
///
/// Enumeration walks every adapter's outputs; each open session owns its
/// own D3D11 device and output duplication.
pub struct DxgiBackend {
    factory: IDXGIFactory1,
}

impl DxgiBackend {
    pub fn new() -> CaptureResult<Self> {
        let factory: IDXGIFactory1 = unsafe { CreateDXGIFactory1() }
            .context("CreateDXGIFactory1 failed")
            .map_err(CaptureError::Other)?;
        Ok(Self { factory })
    }
}

impl CaptureBackend for DxgiBackend {
    fn name(&self) -> &'static str {
        "dxgi-duplication"
    }

    fn enumerate(&mut self) -> CaptureResult<Vec<MonitorDescriptor>> {
        let mut monitors = Vec::new();

        let mut adapter_index = 0u32;
        while let Ok(adapter) = unsafe { self.factory.EnumAdapters1(adapter_index) } {
            let mut output_index = 0u32;
            while let Ok(output) = unsafe { adapter.EnumOutputs(output_index) } {
                let desc = unsafe { output.GetDesc() }
                    .context("IDXGIOutput::GetDesc failed")
                    .map_err(CaptureError::Other)?;

                let bounds = desc.DesktopCoordinates;
                let name_len = desc
                    .DeviceName
                    .iter()
                    .position(|&c| c == 0)
                    .unwrap_or(desc.DeviceName.len());
                let name = String::from_utf16_lossy(&desc.DeviceName[..name_len]);

                monitors.push(MonitorDescriptor {
                    id: monitors.len() as u32,
                    x: bounds.left,
                    y: bounds.top,
                    width: (bounds.right - bounds.left) as u32,
                    height: (bounds.bottom - bounds.top) as u32,
                    is_primary: false,
                    scale_factor: 1.0,
                    name,
                    handle: MonitorHandle::Output {
                        adapter: adapter_index,
                        output: output_index,
                    },
                });

                output_index += 1;
            }
            adapter_index += 1;
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
        let session = DuplicationSession::open(monitor, options)?;
        Ok(Box::new(session))
    }
}
