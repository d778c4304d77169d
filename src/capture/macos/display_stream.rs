//! CGDisplayStream capture session
//!
//! The stream pushes frames and update rectangles onto a private dispatch
//! queue; the handler copies each IOSurface and its dirty rects into a
//! bounded channel, and `acquire` is a bounded-wait pop from that channel.

use std::ffi::c_void;
use std::time::Duration;

use block::ConcreteBlock;
use core_foundation::base::{CFRelease, CFTypeRef, TCFType};
use core_foundation::boolean::CFBoolean;
use core_foundation::dictionary::CFDictionary;
use core_foundation::string::CFString;
use core_graphics::geometry::CGRect;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use log::debug;

use crate::buffer::FrameBuffer;
use crate::capture::traits::{AcquireOutcome, BackendFrame, BackendSession, HintRect};
use crate::error::{CaptureError, CaptureResult};
use crate::types::{BackendOptions, MonitorDescriptor};

// 'BGRA' four-character code
const PIXEL_FORMAT_BGRA: i32 = 0x42475241;

const FRAME_STATUS_COMPLETE: i32 = 0;
const FRAME_STATUS_STOPPED: i32 = 3;

const UPDATE_DIRTY_RECTS: i32 = 2;

const SURFACE_LOCK_READ_ONLY: u32 = 1;

/// One frame copied off the dispatch queue
struct StreamFrame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    stride: usize,
    hints: Vec<HintRect>,
}

enum StreamEvent {
    Frame(StreamFrame),
    Stopped,
}

/// One display's stream resource
pub struct DisplayStreamSession {
    stream: *mut c_void,
    queue: *mut c_void,
    /// Hardware device handle for zero-copy handoff when available
    accel_device: *mut c_void,
    rx: Receiver<StreamEvent>,
    degradations: Vec<String>,
}

// The stream and queue handles are only messaged through thread-safe
// CoreGraphics and libdispatch entry points.
unsafe impl Send for DisplayStreamSession {}

impl DisplayStreamSession {
    pub fn open(
        display_id: u32,
        monitor: &MonitorDescriptor,
        options: &BackendOptions,
    ) -> CaptureResult<Self> {
        let mut degradations = Vec::new();

        let accel_device = if options.prefer_zero_copy {
            let device = unsafe { MTLCreateSystemDefaultDevice() };
            if device.is_null() {
                degradations
                    .push("hardware-acceleration device unavailable".to_string());
            }
            device
        } else {
            std::ptr::null_mut()
        };

        let width = (monitor.width as f64 * monitor.scale_factor) as usize;
        let height = (monitor.height as f64 * monitor.scale_factor) as usize;

        let (tx, rx) = bounded::<StreamEvent>(4);

        let handler = ConcreteBlock::new(
            move |status: i32, _display_time: u64, surface: *mut c_void, update: *mut c_void| {
                if status == FRAME_STATUS_STOPPED {
                    let _ = tx.try_send(StreamEvent::Stopped);
                    return;
                }
                if status != FRAME_STATUS_COMPLETE || surface.is_null() {
                    return;
                }

                unsafe {
                    IOSurfaceLock(surface, SURFACE_LOCK_READ_ONLY, std::ptr::null_mut());
                    let base = IOSurfaceGetBaseAddress(surface) as *const u8;
                    let stride = IOSurfaceGetBytesPerRow(surface);
                    let surf_w = IOSurfaceGetWidth(surface) as u32;
                    let surf_h = IOSurfaceGetHeight(surface);

                    let mut data = vec![0u8; stride * surf_h];
                    std::ptr::copy_nonoverlapping(base, data.as_mut_ptr(), data.len());
                    IOSurfaceUnlock(surface, SURFACE_LOCK_READ_ONLY, std::ptr::null_mut());

                    let mut rect_count = 0usize;
                    let rects =
                        CGDisplayStreamUpdateGetRects(update, UPDATE_DIRTY_RECTS, &mut rect_count);
                    let hints = if rects.is_null() {
                        Vec::new()
                    } else {
                        std::slice::from_raw_parts(rects, rect_count)
                            .iter()
                            .map(|r| {
                                HintRect::new(
                                    r.origin.x as i32,
                                    r.origin.y as i32,
                                    r.size.width as u32,
                                    r.size.height as u32,
                                )
                            })
                            .collect()
                    };

                    // Drop the frame when the consumer is behind; the next
                    // one carries the accumulated dirty rects.
                    let _ = tx.try_send(StreamEvent::Frame(StreamFrame {
                        data,
                        width: surf_w,
                        height: surf_h as u32,
                        stride,
                        hints,
                    }));
                }
            },
        )
        .copy();

        let queue_label = b"station-capture.display-stream\0";
        let queue = unsafe {
            dispatch_queue_create(queue_label.as_ptr() as *const i8, std::ptr::null_mut())
        };

        // The stream copies the properties dictionary during creation.
        let cursor_properties = options.include_cursor.then(|| unsafe {
            CFDictionary::from_CFType_pairs(&[(
                CFString::wrap_under_get_rule(kCGDisplayStreamShowCursor).as_CFType(),
                CFBoolean::true_value().as_CFType(),
            )])
        });
        let properties: CFTypeRef = cursor_properties
            .as_ref()
            .map(|d| d.as_concrete_TypeRef() as CFTypeRef)
            .unwrap_or(std::ptr::null());

        let stream = unsafe {
            CGDisplayStreamCreateWithDispatchQueue(
                display_id,
                width,
                height,
                PIXEL_FORMAT_BGRA,
                properties,
                queue,
                &*handler as *const _ as *mut c_void,
            )
        };
        drop(cursor_properties);

        if stream.is_null() {
            unsafe { dispatch_release(queue) };
            return Err(CaptureError::Fatal(format!(
                "display stream creation failed for display {display_id}"
            )));
        }

        let start_result = unsafe { CGDisplayStreamStart(stream) };
        if start_result != 0 {
            unsafe {
                CFRelease(stream as CFTypeRef);
                dispatch_release(queue);
            }
            return Err(CaptureError::Fatal(format!(
                "display stream start failed: {start_result}"
            )));
        }

        debug!("display stream running for display {display_id}");

        Ok(Self {
            stream,
            queue,
            accel_device,
            rx,
            degradations,
        })
    }
}

impl BackendSession for DisplayStreamSession {
    fn acquire(&mut self, timeout: Duration) -> AcquireOutcome {
        match self.rx.recv_timeout(timeout) {
            Ok(StreamEvent::Frame(frame)) => AcquireOutcome::Frame(BackendFrame {
                width: frame.width,
                height: frame.height,
                stride: frame.stride,
                buffer: FrameBuffer::Owned(frame.data),
                change_hints: frame.hints,
            }),
            Ok(StreamEvent::Stopped) => {
                AcquireOutcome::Fatal("display stream stopped, reopen required".to_string())
            }
            Err(RecvTimeoutError::Timeout) => AcquireOutcome::Timeout,
            Err(RecvTimeoutError::Disconnected) => {
                AcquireOutcome::Fatal("display stream handler gone".to_string())
            }
        }
    }

    fn degradations(&self) -> &[String] {
        &self.degradations
    }

    fn close(&mut self) {
        if !self.stream.is_null() {
            unsafe {
                CGDisplayStreamStop(self.stream);
                CFRelease(self.stream as CFTypeRef);
            }
            self.stream = std::ptr::null_mut();
        }
        if !self.queue.is_null() {
            unsafe { dispatch_release(self.queue) };
            self.queue = std::ptr::null_mut();
        }
        if !self.accel_device.is_null() {
            unsafe { CFRelease(self.accel_device as CFTypeRef) };
            self.accel_device = std::ptr::null_mut();
        }
    }
}

impl Drop for DisplayStreamSession {
    fn drop(&mut self) {
        self.close();
    }
}

// FFI declarations for the display-stream, IOSurface, Metal and
// libdispatch entry points not covered by the core-graphics crate
#[link(name = "IOSurface", kind = "framework")]
#[link(name = "Metal", kind = "framework")]
extern "C" {
    fn CGDisplayStreamCreateWithDispatchQueue(
        display: u32,
        output_width: usize,
        output_height: usize,
        pixel_format: i32,
        properties: CFTypeRef,
        queue: *mut c_void,
        handler: *mut c_void,
    ) -> *mut c_void;
    fn CGDisplayStreamStart(stream: *mut c_void) -> i32;
    fn CGDisplayStreamStop(stream: *mut c_void) -> i32;
    fn CGDisplayStreamUpdateGetRects(
        update: *mut c_void,
        rect_type: i32,
        rect_count: *mut usize,
    ) -> *const CGRect;

    fn IOSurfaceLock(surface: *mut c_void, options: u32, seed: *mut u32) -> i32;
    fn IOSurfaceUnlock(surface: *mut c_void, options: u32, seed: *mut u32) -> i32;
    fn IOSurfaceGetBaseAddress(surface: *mut c_void) -> *mut c_void;
    fn IOSurfaceGetBytesPerRow(surface: *mut c_void) -> usize;
    fn IOSurfaceGetWidth(surface: *mut c_void) -> usize;
    fn IOSurfaceGetHeight(surface: *mut c_void) -> usize;

    fn MTLCreateSystemDefaultDevice() -> *mut c_void;

    fn dispatch_queue_create(label: *const i8, attr: *mut c_void) -> *mut c_void;
    fn dispatch_release(object: *mut c_void);

    static kCGDisplayStreamShowCursor: core_foundation::string::CFStringRef;
}
