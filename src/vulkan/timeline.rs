// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::collections::VecDeque;
use std::os::fd::{AsFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use ash::vk;
use drm::control::{syncobj, Device as _};
use tracing::instrument;

use super::{DrmDevice, VkContext};

/// A timeline-capable GPU semaphore, shadowed by a DRM syncobj so it can
/// round-trip through syncfiles without disturbing the Vulkan timeline
/// itself (syncfiles are consumed exactly once; the shadow lets us produce
/// or consume any number of them via a scratch syncobj).
#[derive(Clone)]
pub struct VkTimelineSemaphore(Arc<Inner>);

struct Inner {
    vk: Arc<VkContext>,
    sema: vk::Semaphore,
    syncobj: syncobj::Handle,
    drm: DrmDevice,
    waiters: Mutex<Waiters>,
}

#[derive(Default)]
struct Waiters {
    // Sorted ascending by target value; `wait_value_async` inserts in
    // order so draining only ever pops a contiguous prefix.
    queue: VecDeque<(u64, Box<dyn FnOnce(u64) + Send>)>,
    wait_skips: u64,
}

#[derive(Clone)]
pub struct VkTimelinePoint(Arc<Inner>, u64);

impl From<VkTimelinePoint> for u64 {
    fn from(value: VkTimelinePoint) -> Self {
        value.1
    }
}

impl std::ops::Add<u64> for VkTimelinePoint {
    type Output = Self;

    fn add(self, rhs: u64) -> Self {
        Self(self.0, self.1 + rhs)
    }
}

impl std::ops::AddAssign<u64> for VkTimelinePoint {
    fn add_assign(&mut self, rhs: u64) {
        self.1 += rhs
    }
}

impl VkTimelineSemaphore {
    pub fn new(vk: Arc<VkContext>, drm: DrmDevice) -> Result<Self> {
        let export_info = vk::ExportSemaphoreCreateInfo::default()
            .handle_types(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD);

        let sema = unsafe {
            vk.device.create_semaphore(
                &vk::SemaphoreCreateInfo::default()
                    .push_next(
                        &mut vk::SemaphoreTypeCreateInfo::default()
                            .semaphore_type(vk::SemaphoreType::TIMELINE)
                            .initial_value(0),
                    )
                    .push_next(&mut export_info.clone()),
                None,
            )?
        };

        let fd = unsafe {
            vk.external_semaphore_api
                .get_semaphore_fd(
                    &vk::SemaphoreGetFdInfoKHR::default()
                        .semaphore(sema)
                        .handle_type(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD),
                )
                .context("exporting semaphore fd")?
        };
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let syncobj = drm
            .fd_to_syncobj(fd.as_fd(), false)
            .context("importing semaphore fd as syncobj")?;

        Ok(Self(Arc::new(Inner {
            vk,
            sema,
            syncobj,
            drm,
            waiters: Mutex::new(Waiters::default()),
        })))
    }

    pub fn new_point(&self, value: u64) -> VkTimelinePoint {
        VkTimelinePoint(self.0.clone(), value)
    }

    pub fn as_semaphore(&self) -> vk::Semaphore {
        self.0.sema
    }

    pub fn get_value(&self) -> Result<u64> {
        Ok(unsafe { self.0.vk.device.get_semaphore_counter_value(self.0.sema)? })
    }

    pub fn signal_value(&self, value: u64) -> Result<()> {
        unsafe {
            self.0.vk.device.signal_semaphore(
                &vk::SemaphoreSignalInfo::default()
                    .semaphore(self.0.sema)
                    .value(value),
            )?
        };

        self.dispatch_ready(value);
        Ok(())
    }

    pub fn wait_value_blocking(&self, value: u64) -> Result<()> {
        unsafe {
            self.0.vk.device.wait_semaphores(
                &vk::SemaphoreWaitInfo::default()
                    .semaphores(&[self.0.sema])
                    .values(&[value]),
                1_000_000_000,
            )?
        };

        let mut waiters = self.0.waiters.lock().unwrap();
        waiters.wait_skips += 1;
        Ok(())
    }

    /// Registers `callback` to fire once the timeline reaches `value`. The
    /// caller is responsible for driving `poll_ready` from the event loop
    /// (e.g. on a per-semaphore eventfd wake); this module does not own an
    /// event loop itself.
    pub fn wait_value_async(&self, value: u64, callback: impl FnOnce(u64) + Send + 'static) {
        let mut waiters = self.0.waiters.lock().unwrap();
        let pos = waiters
            .queue
            .iter()
            .position(|(v, _)| *v > value)
            .unwrap_or(waiters.queue.len());
        waiters.queue.insert(pos, (value, Box::new(callback)));
    }

    /// Pops and runs every queued async waiter whose target has been
    /// reached, given the latest observed timeline value.
    pub fn dispatch_ready(&self, current_value: u64) {
        let ready = {
            let mut waiters = self.0.waiters.lock().unwrap();
            let mut ready = Vec::new();
            while let Some((v, _)) = waiters.queue.front() {
                if *v > current_value {
                    break;
                }
                let (v, cb) = waiters.queue.pop_front().unwrap();
                ready.push((v, cb));
            }
            ready
        };

        for (v, cb) in ready {
            cb(v);
        }
    }

    /// Converts an existing syncfile into a wait on this timeline at
    /// `target_point`, by importing it into a scratch syncobj and
    /// transferring that point onto the real (shadowed) timeline.
    pub fn import_syncfile(&self, fd: RawFd, target_point: u64) -> Result<()> {
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        let scratch = self
            .0
            .drm
            .fd_to_syncobj(borrowed, true)
            .context("importing sync file as scratch syncobj")?;
        scopeguard::defer! { let _ = self.0.drm.destroy_syncobj(scratch); }

        self.0
            .drm
            .syncobj_timeline_transfer(scratch, self.0.syncobj, 0, target_point)
            .context("transferring scratch syncobj onto timeline shadow")?;

        Ok(())
    }

    /// Exports a persistent handle to this timeline's own syncobj (as
    /// opposed to a one-shot syncfile snapshot), suitable for a peer to
    /// import once and then address by point value on every future
    /// `set_acquire_point`/`set_release_point`-style request, the way
    /// `wp_linux_drm_syncobj_manager_v1.import_timeline` expects.
    pub fn export_syncobj_fd(&self) -> Result<OwnedFd> {
        self.0.drm.syncobj_to_fd(self.0.syncobj, false).context("exporting persistent syncobj fd")
    }

    /// Exports the timeline's value at `source_point` as a consumable
    /// syncfile fd, via the same scratch-syncobj transfer in reverse.
    pub fn export_syncfile(&self, source_point: u64) -> Result<OwnedFd> {
        let scratch = self.0.drm.create_syncobj(false)?;
        scopeguard::defer! { let _ = self.0.drm.destroy_syncobj(scratch); }

        self.0
            .drm
            .syncobj_timeline_transfer(self.0.syncobj, scratch, source_point, 0)
            .context("transferring timeline shadow into scratch syncobj")?;

        let fd = self
            .0
            .drm
            .syncobj_to_fd(scratch, true)
            .context("exporting scratch syncobj as sync file")?;

        Ok(fd)
    }
}

impl VkTimelinePoint {
    pub fn value(&self) -> u64 {
        self.1
    }

    pub fn timeline(&self) -> VkTimelineSemaphore {
        VkTimelineSemaphore(self.0.clone())
    }

    #[instrument(level = "trace", skip_all)]
    pub fn wait(&self) -> Result<()> {
        VkTimelineSemaphore(self.0.clone()).wait_value_blocking(self.1)
    }

    #[instrument(level = "trace", skip_all)]
    pub fn signal(&self) -> Result<()> {
        VkTimelineSemaphore(self.0.clone()).signal_value(self.1)
    }

    pub fn poll(&self) -> Result<bool> {
        Ok(VkTimelineSemaphore(self.0.clone()).get_value()? >= self.1)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        unsafe {
            self.vk.device.device_wait_idle().ok();
            self.vk.device.destroy_semaphore(self.sema, None);
        }

        let _ = self.drm.destroy_syncobj(self.syncobj);
    }
}
