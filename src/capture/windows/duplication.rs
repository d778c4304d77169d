//! DXGI desktop duplication session
//!
//! Wraps the `IDXGIOutputDuplication` pipeline: a D3D11 device, the
//! duplicated output located by desktop coordinates, and a CPU-readable
//! staging texture. Each acquisition waits for a new frame, copies the
//! desktop texture to staging, maps it and row-copies the pixels into a
//! pooled buffer, releasing the mapped view and the acquisition before
//! returning. Device-reported dirty rectangles are surfaced as change
//! hints.

use std::time::Duration;

use anyhow::{anyhow, Context};
use log::{debug, warn};
use windows::core::Interface;
use windows::Win32::Foundation::RECT;
use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_HARDWARE;
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D,
    D3D11_CPU_ACCESS_READ, D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_MAPPED_SUBRESOURCE,
    D3D11_MAP_READ, D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::{
    IDXGIAdapter, IDXGIDevice, IDXGIOutput, IDXGIOutput1, IDXGIOutputDuplication, IDXGIResource,
    DXGI_ERROR_ACCESS_DENIED, DXGI_ERROR_ACCESS_LOST, DXGI_ERROR_WAIT_TIMEOUT,
    DXGI_OUTDUPL_FRAME_INFO,
};

use crate::buffer::global_pool;
use crate::capture::traits::{AcquireOutcome, BackendFrame, BackendSession, HintRect};
use crate::error::{CaptureError, CaptureResult};
use crate::types::{BackendOptions, MonitorDescriptor};

/// One monitor's desktop-duplication resource
pub struct DuplicationSession {
    /// Kept alive for the duplication and staging resources
    _device: ID3D11Device,
    context: ID3D11DeviceContext,
    duplication: Option<IDXGIOutputDuplication>,
    staging: ID3D11Texture2D,
    width: u32,
    height: u32,
    degradations: Vec<String>,
}

impl DuplicationSession {
    pub fn open(monitor: &MonitorDescriptor, options: &BackendOptions) -> CaptureResult<Self> {
        let (device, context) = create_device()?;
        let output = find_output(&device, monitor)?;

        let output1: IDXGIOutput1 = output
            .cast()
            .context("cast to IDXGIOutput1 failed")
            .map_err(CaptureError::Other)?;
        let duplication = unsafe { output1.DuplicateOutput(&device) }.map_err(|e| {
            if e.code() == DXGI_ERROR_ACCESS_DENIED {
                CaptureError::Fatal(format!("desktop duplication denied: {e}"))
            } else {
                CaptureError::Other(anyhow!("DuplicateOutput failed: {e}"))
            }
        })?;

        let dup_desc = unsafe { duplication.GetDesc() };
        let width = dup_desc.ModeDesc.Width;
        let height = dup_desc.ModeDesc.Height;

        let staging_desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags: 0,
        };

        let mut staging = None;
        unsafe { device.CreateTexture2D(&staging_desc, None, Some(&mut staging)) }
            .context("staging texture creation failed")
            .map_err(CaptureError::Other)?;
        let staging =
            staging.ok_or_else(|| CaptureError::Other(anyhow!("staging texture is null")))?;

        let mut degradations = Vec::new();
        if options.include_cursor {
            // The duplicated desktop image excludes the pointer shape.
            degradations.push("cursor compositing unavailable on this path".to_string());
        }

        debug!("duplication open for monitor {} ({}x{})", monitor.id, width, height);

        Ok(Self {
            _device: device,
            context,
            duplication: Some(duplication),
            staging,
            width,
            height,
            degradations,
        })
    }

    fn dirty_hints(
        &self,
        duplication: &IDXGIOutputDuplication,
        frame_info: &DXGI_OUTDUPL_FRAME_INFO,
    ) -> Vec<HintRect> {
        if frame_info.TotalMetadataSize == 0 {
            return Vec::new();
        }

        let capacity = frame_info.TotalMetadataSize as usize / std::mem::size_of::<RECT>();
        let mut rects = vec![RECT::default(); capacity.max(1)];
        let mut used_bytes = 0u32;

        let result = unsafe {
            duplication.GetFrameDirtyRects(
                (rects.len() * std::mem::size_of::<RECT>()) as u32,
                rects.as_mut_ptr(),
                &mut used_bytes,
            )
        };
        if let Err(e) = result {
            debug!("GetFrameDirtyRects failed: {e}");
            return Vec::new();
        }

        rects.truncate(used_bytes as usize / std::mem::size_of::<RECT>());
        rects
            .into_iter()
            .map(|r| {
                HintRect::new(
                    r.left,
                    r.top,
                    (r.right - r.left).max(0) as u32,
                    (r.bottom - r.top).max(0) as u32,
                )
            })
            .collect()
    }
}

impl BackendSession for DuplicationSession {
    fn acquire(&mut self, timeout: Duration) -> AcquireOutcome {
        let Some(duplication) = self.duplication.as_ref() else {
            return AcquireOutcome::Fatal("duplication already closed".to_string());
        };

        let mut frame_info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource: Option<IDXGIResource> = None;

        match unsafe {
            duplication.AcquireNextFrame(timeout.as_millis() as u32, &mut frame_info, &mut resource)
        } {
            Ok(()) => {}
            Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => return AcquireOutcome::Timeout,
            Err(e)
                if e.code() == DXGI_ERROR_ACCESS_LOST || e.code() == DXGI_ERROR_ACCESS_DENIED =>
            {
                self.duplication = None;
                return AcquireOutcome::Fatal(format!(
                    "duplication access lost, reopen required: {e}"
                ));
            }
            Err(e) => return AcquireOutcome::Transient(format!("AcquireNextFrame failed: {e}")),
        }

        // A pure mouse-move update carries no new desktop image.
        if frame_info.LastPresentTime == 0 {
            let _ = unsafe { duplication.ReleaseFrame() };
            return AcquireOutcome::NoChange;
        }

        let Some(resource) = resource else {
            let _ = unsafe { duplication.ReleaseFrame() };
            return AcquireOutcome::Transient("acquired resource is null".to_string());
        };

        let texture: ID3D11Texture2D = match resource.cast() {
            Ok(t) => t,
            Err(e) => {
                let _ = unsafe { duplication.ReleaseFrame() };
                return AcquireOutcome::Transient(format!("texture cast failed: {e}"));
            }
        };

        let hints = self.dirty_hints(duplication, &frame_info);

        unsafe { self.context.CopyResource(&self.staging, &texture) };

        // The GPU frame is no longer needed once staging holds the copy.
        let _ = unsafe { duplication.ReleaseFrame() };

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        if let Err(e) = unsafe {
            self.context
                .Map(&self.staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
        } {
            return AcquireOutcome::Transient(format!("staging map failed: {e}"));
        }

        let src_stride = mapped.RowPitch as usize;
        let row_bytes = self.width as usize * 4;
        let mut buffer = global_pool().acquire(row_bytes * self.height as usize);

        unsafe {
            let src = mapped.pData as *const u8;
            let dst = buffer.bytes_mut();
            for row in 0..self.height as usize {
                std::ptr::copy_nonoverlapping(
                    src.add(row * src_stride),
                    dst[row * row_bytes..].as_mut_ptr(),
                    row_bytes,
                );
            }
            self.context.Unmap(&self.staging, 0);
        }

        AcquireOutcome::Frame(BackendFrame {
            buffer: buffer.into(),
            width: self.width,
            height: self.height,
            stride: row_bytes,
            change_hints: hints,
        })
    }

    fn degradations(&self) -> &[String] {
        &self.degradations
    }

    fn close(&mut self) {
        self.duplication = None;
    }
}

fn create_device() -> CaptureResult<(ID3D11Device, ID3D11DeviceContext)> {
    let mut device = None;
    let mut context = None;

    unsafe {
        D3D11CreateDevice(
            None,
            D3D_DRIVER_TYPE_HARDWARE,
            None,
            D3D11_CREATE_DEVICE_BGRA_SUPPORT,
            None,
            D3D11_SDK_VERSION,
            Some(&mut device),
            None,
            Some(&mut context),
        )
    }
    .context("D3D11CreateDevice failed")
    .map_err(CaptureError::Other)?;

    Ok((
        device.ok_or_else(|| CaptureError::Other(anyhow!("D3D11 device is null")))?,
        context.ok_or_else(|| CaptureError::Other(anyhow!("D3D11 context is null")))?,
    ))
}

/// Locate the adapter output whose desktop coordinates match the monitor
fn find_output(device: &ID3D11Device, monitor: &MonitorDescriptor) -> CaptureResult<IDXGIOutput> {
    let dxgi_device: IDXGIDevice = device
        .cast()
        .context("cast to IDXGIDevice failed")
        .map_err(CaptureError::Other)?;
    let adapter: IDXGIAdapter = unsafe { dxgi_device.GetAdapter() }
        .context("GetAdapter failed")
        .map_err(CaptureError::Other)?;

    let mut output_index = 0u32;
    while let Ok(output) = unsafe { adapter.EnumOutputs(output_index) } {
        if let Ok(desc) = unsafe { output.GetDesc() } {
            if desc.DesktopCoordinates.left == monitor.x && desc.DesktopCoordinates.top == monitor.y
            {
                return Ok(output);
            }
        }
        output_index += 1;
    }

    warn!("no output matches monitor {} at ({}, {})", monitor.id, monitor.x, monitor.y);
    Err(CaptureError::Fatal(format!(
        "display for monitor {} not found, re-enumeration required",
        monitor.id
    )))
}
