// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The presentation backend boundary: a uniform
//! `init`/`create_output`/`destroy_output`/`commit` contract implemented
//! once against a parent Wayland compositor (`wayland`) and once against
//! bare KMS/DRM+libinput (`direct`). `Output` (see `crate::output`) owns
//! image lifecycle and calls back into whichever backend is running
//! through this trait; neither backend knows about the other.

pub mod direct;
pub mod wayland;

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::config::{BackendKind, Config};
use crate::event_loop::EventLoop;
use crate::output::CommitFlags;
use crate::seat::{ButtonState, KeyState};
use crate::vulkan::{commands::Syncpoint, timeline::VkTimelineSemaphore, DrmDevice, Image, VkContext};

slotmap::new_key_type! { pub struct OutputId; }

/// Raw input, not yet hit-tested against the scene: both backends funnel
/// whatever they read from their own source (the parent seat, or
/// libinput) through this and leave focus/routing to whoever owns the
/// `Seat`, treating it as the opaque scene boundary.
#[derive(Debug, Clone, Copy)]
pub enum InputEvent {
    PointerMotion { dx: f64, dy: f64 },
    PointerMotionAbsolute { x: f64, y: f64 },
    PointerButton { code: u32, state: ButtonState },
    PointerAxis { horizontal: f64, vertical: f64 },
    KeyboardKey { scancode: u32, state: KeyState },
}

/// What a backend needs to know to create one output: the hint geometry
/// from config (consumed verbatim by the direct backend when no KMS mode
/// is already active; used as the initial window size by the nested
/// backend) plus a human-readable label for logging.
#[derive(Debug, Clone, Copy)]
pub struct OutputRequest {
    pub width: u32,
    pub height: u32,
    pub refresh_mhz: u32,
}

pub trait Backend {
    /// Registers whatever file descriptors the backend needs polled
    /// (the parent Wayland connection's fd, or the DRM/libinput fds) and
    /// starts accepting input, before the first output is created.
    fn start(&mut self, event_loop: &mut EventLoop) -> Result<()>;

    fn create_output(&mut self, request: OutputRequest) -> Result<OutputId>;

    fn destroy_output(&mut self, id: OutputId);

    /// Presents `image`, which the backend may only read from after
    /// `acquire` is reached, and must signal `release` on once it's safe
    /// to reuse. `flags` carries presentation hints (currently just
    /// vsync-or-not).
    fn commit(&mut self, id: OutputId, image: &Image, acquire: Syncpoint, release: Syncpoint, flags: CommitFlags) -> Result<()>;

    /// Drains whatever input has arrived since the last call. Called once
    /// per event loop tick; never blocks.
    fn poll_input(&mut self) -> Vec<InputEvent>;

    /// Drains the outputs whose most recently committed frame has finished
    /// presenting since the last call (a parent `wl_callback.done`, or a
    /// KMS page-flip event). The caller re-arms that output's
    /// `Output::commit_available` on receipt, which is how the redraw
    /// gate in `crate::output::Output::try_redraw` closes after a commit
    /// and reopens once the backend is ready for the next one.
    fn poll_frame_done(&mut self) -> Vec<OutputId>;
}

/// Bridges our internal (non-exportable) GPU timelines to the syncfiles
/// every external sync primitive actually speaks: KMS's `IN_FENCE_FD`/
/// out-fence, and the parent compositor's `wp_linux_drm_syncobj_timeline_v1`.
///
/// Queue and output-release semaphores (see `vulkan::queue`,
/// `vulkan::output`) are plain timeline semaphores with no
/// `ExportSemaphoreCreateInfo`, since they never need to leave the
/// process in the normal GPU-only path. To hand one of their points to a
/// backend, this relays it onto a semaphore of our own that *was* created
/// exportable (`VkTimelineSemaphore`, shadowed by a DRM syncobj per
/// `vulkan::timeline`) via a zero-command-buffer submit that just waits on
/// one semaphore and signals the other — and the same in reverse to bring
/// an external fence back onto a real internal semaphore.
pub struct SyncBridge {
    vk: Arc<VkContext>,
    export: VkTimelineSemaphore,
    export_next: u64,
    import: VkTimelineSemaphore,
    import_next: u64,
}

impl SyncBridge {
    pub fn new(vk: Arc<VkContext>) -> Result<Self> {
        let export = VkTimelineSemaphore::new(vk.clone(), DrmDevice::new(vk.device_info.drm_node)?)?;
        let import = VkTimelineSemaphore::new(vk.clone(), DrmDevice::new(vk.device_info.drm_node)?)?;

        Ok(Self {
            vk,
            export,
            export_next: 0,
            import,
            import_next: 0,
        })
    }

    fn relay(&self, wait: (vk::Semaphore, u64), signal: (vk::Semaphore, u64)) -> Result<()> {
        unsafe {
            self.vk.device.queue_submit(
                self.vk.graphics_queue.queue,
                &[vk::SubmitInfo::default()
                    .wait_semaphores(std::slice::from_ref(&wait.0))
                    .wait_dst_stage_mask(&[vk::PipelineStageFlags::ALL_COMMANDS])
                    .signal_semaphores(std::slice::from_ref(&signal.0))
                    .push_next(
                        &mut vk::TimelineSemaphoreSubmitInfo::default()
                            .wait_semaphore_values(std::slice::from_ref(&wait.1))
                            .signal_semaphore_values(std::slice::from_ref(&signal.1)),
                    )],
                vk::Fence::null(),
            )?;
        }

        Ok(())
    }

    /// Waits internally on `point`, then exports a syncfile fd usable as a
    /// KMS `IN_FENCE_FD` or an acquire point on a `wp_linux_drm_syncobj_timeline_v1`.
    pub fn export_fence(&mut self, point: Syncpoint) -> Result<OwnedFd> {
        self.export_next += 1;
        let target = self.export_next;

        self.relay((point.semaphore, point.value), (self.export.as_semaphore(), target))?;
        self.export.export_syncfile(target)
    }

    /// Imports an external syncfile (a KMS page-flip out-fence, or a
    /// parent-compositor release point) and relays it onto `signal` once
    /// it completes.
    pub fn import_fence(&mut self, fd: OwnedFd, signal: Syncpoint) -> Result<()> {
        self.import_next += 1;
        let point = self.import_next;

        self.import.import_syncfile(fd.as_raw_fd(), point)?;
        self.relay((self.import.as_semaphore(), point), (signal.semaphore, signal.value))
    }

    /// A persistent (non-one-shot) handle to the export-direction
    /// timeline's syncobj, importable once by a peer that then addresses
    /// it by point value forever after (e.g. the nested backend's
    /// per-window acquire timeline).
    pub fn export_syncobj_fd(&self) -> Result<OwnedFd> {
        self.export.export_syncobj_fd()
    }

    /// Same, for the import-direction timeline (a peer's release timeline).
    pub fn import_syncobj_fd(&self) -> Result<OwnedFd> {
        self.import.export_syncobj_fd()
    }

    /// Relays `wait` onto the next point of the shared export timeline and
    /// returns that point's value, without producing a one-shot syncfile —
    /// for a peer that already imported the export timeline's syncobj once
    /// (see `export_syncobj_fd`) and just needs to know which value to wait
    /// for on this commit.
    pub fn next_export_point(&mut self, wait: Syncpoint) -> Result<u64> {
        self.export_next += 1;
        let target = self.export_next;
        self.relay((wait.semaphore, wait.value), (self.export.as_semaphore(), target))?;
        Ok(target)
    }

    /// Picks the next point of the shared import timeline, relays it onto
    /// `signal` once reached, and returns the value for a peer to signal
    /// (see `import_syncobj_fd`).
    pub fn next_import_point(&mut self, signal: Syncpoint) -> Result<u64> {
        self.import_next += 1;
        let target = self.import_next;
        self.relay((self.import.as_semaphore(), target), (signal.semaphore, signal.value))?;
        Ok(target)
    }
}

/// Constructs whichever backend `cfg.backend` selects. Both variants are
/// boxed behind the same trait object so `Server`/`main` don't need to
/// know which one is live.
pub fn create(cfg: &Config, vk: std::sync::Arc<VkContext>) -> Result<Box<dyn Backend>> {
    match cfg.backend {
        BackendKind::Wayland => Ok(Box::new(wayland::NestedWaylandBackend::new(vk)?)),
        BackendKind::Direct => Ok(Box::new(direct::DirectBackend::new(vk, cfg.socket_name.as_deref())?)),
    }
}
