//! X11 capture session
//!
//! Pixel transport prefers MIT-SHM: the server writes the image straight
//! into a shared segment, which the frame either leases zero-copy (with a
//! release token) or copies out of. Without SHM the session falls back to
//! a synchronous `GetImage`. When the DAMAGE extension is present the
//! root window is subscribed with non-empty reporting and the notify
//! queue is drained into change hints on every acquisition.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::debug;
use x11rb::connection::Connection;
use x11rb::connection::RequestConnection;
use x11rb::protocol::damage::{self, ReportLevel};
use x11rb::protocol::shm;
use x11rb::protocol::xproto::{self, ImageFormat, Window};
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

use crate::buffer::{global_pool, FrameBuffer, ReleaseToken, SharedSlice};
use crate::capture::traits::{AcquireOutcome, BackendFrame, BackendSession, HintRect};
use crate::error::{CaptureError, CaptureResult};
use crate::types::{BackendOptions, MonitorDescriptor};

static ERROR_SLOT_REFS: AtomicUsize = AtomicUsize::new(0);

/// Scoped hold on the process-wide display error-handler slot.
///
/// The slot is shared by every session in the process; the hook is
/// installed with the first acquisition and released with the last.
pub(crate) struct ErrorSlotGuard;

impl ErrorSlotGuard {
    pub(crate) fn acquire() -> Self {
        if ERROR_SLOT_REFS.fetch_add(1, Ordering::SeqCst) == 0 {
            debug!("display error hook installed");
        }
        Self
    }
}

impl Drop for ErrorSlotGuard {
    fn drop(&mut self) {
        if ERROR_SLOT_REFS.fetch_sub(1, Ordering::SeqCst) == 1 {
            debug!("display error hook released");
        }
    }
}

/// A System V shared-memory segment attached on both sides
struct ShmSegment {
    addr: *mut libc::c_void,
    len: usize,
}

// The segment address is stable for the segment's lifetime and access is
// serialised by the lease flag.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.addr);
        }
    }
}

struct ShmTransport {
    seg: shm::Seg,
    segment: Arc<ShmSegment>,
    /// Set while a zero-copy frame still references the segment
    busy: Arc<AtomicBool>,
}

/// One monitor's X11 acquisition resource
pub struct X11Session {
    conn: RustConnection,
    root: Window,
    origin_x: i32,
    origin_y: i32,
    width: u32,
    height: u32,
    zero_copy: bool,
    shm: Option<ShmTransport>,
    damage: Option<damage::Damage>,
    frames_acquired: u64,
    degradations: Vec<String>,
    _error_slot: ErrorSlotGuard,
}

impl X11Session {
    pub fn open(monitor: &MonitorDescriptor, options: &BackendOptions) -> CaptureResult<Self> {
        let (conn, screen_num) = RustConnection::connect(None)
            .context("failed to connect to the X server")
            .map_err(CaptureError::Other)?;
        let root = conn.setup().roots[screen_num].root;

        let mut degradations = Vec::new();

        let shm_transport = match negotiate_shm(&conn, monitor.width, monitor.height) {
            Ok(transport) => Some(transport),
            Err(reason) => {
                degradations.push(format!("shared-memory transport unavailable: {reason}"));
                None
            }
        };

        let damage_handle = match subscribe_damage(&conn, root) {
            Ok(handle) => Some(handle),
            Err(reason) => {
                degradations.push(format!("damage notifications unavailable: {reason}"));
                None
            }
        };

        if options.include_cursor {
            degradations.push("cursor compositing unavailable on this path".to_string());
        }

        debug!(
            "x11 session open for monitor {} (shm: {}, damage: {})",
            monitor.id,
            shm_transport.is_some(),
            damage_handle.is_some()
        );

        Ok(Self {
            conn,
            root,
            origin_x: monitor.x,
            origin_y: monitor.y,
            width: monitor.width,
            height: monitor.height,
            zero_copy: options.prefer_zero_copy,
            shm: shm_transport,
            damage: damage_handle,
            frames_acquired: 0,
            degradations,
            _error_slot: ErrorSlotGuard::acquire(),
        })
    }

    /// Drain pending damage notifications into monitor-local hints
    fn drain_damage(&mut self) -> Result<Vec<HintRect>, String> {
        let Some(damage_handle) = self.damage else {
            return Ok(Vec::new());
        };

        let mut hints = Vec::new();
        loop {
            let event = self
                .conn
                .poll_for_event()
                .map_err(|e| format!("connection lost: {e}"))?;
            let Some(event) = event else { break };

            if let Event::DamageNotify(notify) = event {
                if notify.damage != damage_handle {
                    continue;
                }
                // Damage is reported in root coordinates; keep the part
                // that falls on this monitor.
                let local_x = notify.area.x as i32 - self.origin_x;
                let local_y = notify.area.y as i32 - self.origin_y;
                hints.push(HintRect::new(
                    local_x,
                    local_y,
                    notify.area.width as u32,
                    notify.area.height as u32,
                ));
            }
        }

        if !hints.is_empty() {
            damage::subtract(&self.conn, damage_handle, x11rb::NONE, x11rb::NONE)
                .map_err(|e| format!("damage subtract failed: {e}"))?;
        }

        Ok(hints)
    }

    fn acquire_shm(&mut self, hints: Vec<HintRect>) -> AcquireOutcome {
        let transport = self.shm.as_ref().expect("shm transport present");

        if self.zero_copy && transport.busy.load(Ordering::Acquire) {
            return AcquireOutcome::Transient(
                "previous shared-memory frame still held".to_string(),
            );
        }

        let reply = match shm::get_image(
            &self.conn,
            self.root,
            self.origin_x as i16,
            self.origin_y as i16,
            self.width as u16,
            self.height as u16,
            !0,
            ImageFormat::Z_PIXMAP.into(),
            transport.seg,
            0,
        )
        .map_err(|e| format!("shm get-image failed: {e}"))
        .and_then(|cookie| cookie.reply().map_err(|e| format!("shm reply failed: {e}")))
        {
            Ok(reply) => reply,
            Err(reason) => return AcquireOutcome::Transient(reason),
        };

        if reply.depth != 24 && reply.depth != 32 {
            return AcquireOutcome::Transient(format!("unsupported depth {}", reply.depth));
        }

        let stride = self.width as usize * 4;
        let len = transport.segment.len;

        let buffer = if self.zero_copy {
            transport.busy.store(true, Ordering::Release);
            let busy = Arc::clone(&transport.busy);
            let segment = Arc::clone(&transport.segment);
            let release = ReleaseToken::new(move || {
                busy.store(false, Ordering::Release);
                drop(segment);
            });
            let slice =
                unsafe { SharedSlice::new(transport.segment.addr as *const u8, len, release) };
            FrameBuffer::Shared(slice)
        } else {
            // Copy out so the next get-image may overwrite the segment.
            let mut pooled = global_pool().acquire(len);
            unsafe {
                ptr::copy_nonoverlapping(
                    transport.segment.addr as *const u8,
                    pooled.bytes_mut().as_mut_ptr(),
                    len,
                );
            }
            FrameBuffer::Pooled(pooled)
        };

        AcquireOutcome::Frame(BackendFrame {
            buffer,
            width: self.width,
            height: self.height,
            stride,
            change_hints: hints,
        })
    }

    fn acquire_get_image(&mut self, hints: Vec<HintRect>) -> AcquireOutcome {
        let reply = match xproto::get_image(
            &self.conn,
            ImageFormat::Z_PIXMAP,
            self.root,
            self.origin_x as i16,
            self.origin_y as i16,
            self.width as u16,
            self.height as u16,
            !0,
        )
        .map_err(|e| format!("get-image failed: {e}"))
        .and_then(|cookie| cookie.reply().map_err(|e| format!("get-image reply failed: {e}")))
        {
            Ok(reply) => reply,
            Err(reason) => return AcquireOutcome::Transient(reason),
        };

        if reply.depth != 24 && reply.depth != 32 {
            return AcquireOutcome::Transient(format!("unsupported depth {}", reply.depth));
        }

        let stride = self.width as usize * 4;
        AcquireOutcome::Frame(BackendFrame {
            buffer: FrameBuffer::Owned(reply.data),
            width: self.width,
            height: self.height,
            stride,
            change_hints: hints,
        })
    }
}

impl BackendSession for X11Session {
    fn acquire(&mut self, _timeout: Duration) -> AcquireOutcome {
        let hints = match self.drain_damage() {
            Ok(hints) => hints,
            // Losing the connection loses damage and the shm attachment.
            Err(reason) => return AcquireOutcome::Fatal(reason),
        };

        // With damage available, an empty queue means the desktop has not
        // changed since the previous frame.
        if self.damage.is_some() && hints.is_empty() && self.frames_acquired > 0 {
            return AcquireOutcome::NoChange;
        }

        let outcome = if self.shm.is_some() {
            self.acquire_shm(hints)
        } else {
            self.acquire_get_image(hints)
        };

        if matches!(outcome, AcquireOutcome::Frame(_)) {
            self.frames_acquired += 1;
        }
        outcome
    }

    fn degradations(&self) -> &[String] {
        &self.degradations
    }

    fn close(&mut self) {
        if let Some(damage_handle) = self.damage.take() {
            let _ = damage::destroy(&self.conn, damage_handle);
        }
        if let Some(transport) = self.shm.take() {
            let _ = shm::detach(&self.conn, transport.seg);
        }
        let _ = self.conn.flush();
    }
}

impl Drop for X11Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Negotiate MIT-SHM transport: query the extension, create and attach a
/// frame-sized segment on both sides
fn negotiate_shm(
    conn: &RustConnection,
    width: u32,
    height: u32,
) -> Result<ShmTransport, String> {
    conn.extension_information(shm::X11_EXTENSION_NAME)
        .map_err(|e| format!("extension query failed: {e}"))?
        .ok_or_else(|| "MIT-SHM extension not present".to_string())?;

    shm::query_version(conn)
        .map_err(|e| format!("version query failed: {e}"))?
        .reply()
        .map_err(|e| format!("version reply failed: {e}"))?;

    let len = width as usize * height as usize * 4;
    let shmid = unsafe { libc::shmget(libc::IPC_PRIVATE, len, libc::IPC_CREAT | 0o600) };
    if shmid == -1 {
        return Err("shmget failed".to_string());
    }

    let addr = unsafe { libc::shmat(shmid, ptr::null(), 0) };
    if addr == (-1isize) as *mut libc::c_void {
        unsafe { libc::shmctl(shmid, libc::IPC_RMID, ptr::null_mut()) };
        return Err("shmat failed".to_string());
    }

    let seg: shm::Seg = match conn.generate_id() {
        Ok(id) => id,
        Err(e) => {
            unsafe {
                libc::shmdt(addr);
                libc::shmctl(shmid, libc::IPC_RMID, ptr::null_mut());
            }
            return Err(format!("id allocation failed: {e}"));
        }
    };

    let attach = shm::attach(conn, seg, shmid as u32, false)
        .map_err(|e| format!("attach failed: {e}"))
        .and_then(|cookie| cookie.check().map_err(|e| format!("attach rejected: {e}")));

    // Mark for removal; the segment disappears once both sides detach.
    unsafe { libc::shmctl(shmid, libc::IPC_RMID, ptr::null_mut()) };

    if let Err(reason) = attach {
        unsafe { libc::shmdt(addr) };
        return Err(reason);
    }

    Ok(ShmTransport {
        seg,
        segment: Arc::new(ShmSegment { addr, len }),
        busy: Arc::new(AtomicBool::new(false)),
    })
}

/// Subscribe the root window to non-empty damage reports
fn subscribe_damage(conn: &RustConnection, root: Window) -> Result<damage::Damage, String> {
    conn.extension_information(damage::X11_EXTENSION_NAME)
        .map_err(|e| format!("extension query failed: {e}"))?
        .ok_or_else(|| "DAMAGE extension not present".to_string())?;

    damage::query_version(conn, 1, 1)
        .map_err(|e| format!("version query failed: {e}"))?
        .reply()
        .map_err(|e| format!("version reply failed: {e}"))?;

    let handle: damage::Damage = conn
        .generate_id()
        .map_err(|e| format!("id allocation failed: {e}"))?;
    damage::create(conn, handle, root, ReportLevel::NON_EMPTY)
        .map_err(|e| format!("create failed: {e}"))?
        .check()
        .map_err(|e| format!("create rejected: {e}"))?;

    Ok(handle)
}
