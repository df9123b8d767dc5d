// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Client-provided pixel sources: shm pools/buffers, and the lock guard
//! that mediates ownership between a client (who may mutate a released
//! buffer) and the compositor (who holds content while it's locked).

use std::os::fd::{AsFd, AsRawFd as _, FromRawFd as _, OwnedFd};
use std::sync::{Arc, Mutex, RwLock, Weak};

use anyhow::bail;
use drm_fourcc::{DrmFourcc, DrmModifier};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use wayland_server::protocol::{wl_buffer, wl_shm, wl_shm_pool};

use crate::vulkan::Image;

slotmap::new_key_type! { pub struct BufferKey; }
slotmap::new_key_type! { pub struct ShmPoolKey; }

/// An mmap'd region backing a pool. Owns the mapping independently of the
/// `ShmPool` handle so buffers that reference it via `ShmMapping` keep it
/// alive even if the pool itself is destroyed first.
#[derive(Debug)]
pub struct ShmMapping {
    fd: OwnedFd,
    ptr: *mut u8,
    size: usize,
}

unsafe impl Send for ShmMapping {}
unsafe impl Sync for ShmMapping {}

impl ShmMapping {
    fn new(fd: OwnedFd, size: usize) -> anyhow::Result<Self> {
        let ptr = unsafe { map(&fd, size)? };
        Ok(Self { fd, ptr, size })
    }

    pub fn data(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.size, "shm read out of bounds");
        unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for ShmMapping {
    fn drop(&mut self) {
        unsafe { munmap(self.ptr as *mut _, self.size).expect("munmap failed") };
    }
}

unsafe fn map(fd: impl AsFd, size: usize) -> anyhow::Result<*mut u8> {
    if size == 0 {
        bail!("zero-sized mmap");
    }

    let ptr = mmap(
        None,
        size.try_into()?,
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        MapFlags::MAP_SHARED,
        Some(fd),
        0,
    )?;

    Ok(ptr as *mut u8)
}

/// A client-shared pool of shm memory. Resizing replaces the mapping
/// atomically by swapping in a fresh `ShmMapping`; existing buffers hold
/// their own `Arc` clone of the old mapping and keep working until
/// dropped.
pub struct ShmPool {
    pub wl_shm_pool: wl_shm_pool::WlShmPool,
    mapping: Arc<RwLock<ShmMapping>>,
}

impl ShmPool {
    pub fn new(fd: OwnedFd, size: usize, wl_shm_pool: wl_shm_pool::WlShmPool) -> anyhow::Result<Self> {
        Ok(Self {
            wl_shm_pool,
            mapping: Arc::new(RwLock::new(ShmMapping::new(fd, size)?)),
        })
    }

    /// `wl_shm_pool.resize` carries only the new size: the client grows
    /// the same file it already handed us via `ftruncate`, so the fresh
    /// mapping reopens that file rather than receiving a new one.
    pub fn resize(&self, new_size: usize) -> anyhow::Result<()> {
        let mut guard = self.mapping.write().unwrap();
        let dup_fd = nix::unistd::dup(guard.fd.as_raw_fd())?;
        let dup_fd = unsafe { OwnedFd::from_raw_fd(dup_fd) };
        *guard = ShmMapping::new(dup_fd, new_size)?;
        Ok(())
    }

    pub fn mapping(&self) -> Arc<RwLock<ShmMapping>> {
        self.mapping.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmBufferParams {
    pub format: DrmFourcc,
    pub bpp: usize,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub offset: u32,
}

/// Validates offset/stride/size constraints for a `wl_shm_pool.create_buffer`
/// request, rejecting with `WL_SHM_ERROR_INVALID_STRIDE` and friends.
pub fn validate_shm_params(
    offset: i32,
    width: i32,
    height: i32,
    stride: i32,
    bpp: usize,
    pool_size: usize,
) -> Result<(), wl_shm::Error> {
    if offset < 0 || width <= 0 || height <= 0 {
        return Err(wl_shm::Error::InvalidStride);
    }

    if stride <= 0 || (stride as usize) / bpp < width as usize {
        return Err(wl_shm::Error::InvalidStride);
    }

    let Some(span) = (stride as i64).checked_mul(height as i64) else {
        return Err(wl_shm::Error::InvalidStride);
    };

    let Some(end) = (offset as i64).checked_add(span) else {
        return Err(wl_shm::Error::InvalidStride);
    };

    if end as usize > pool_size {
        return Err(wl_shm::Error::InvalidStride);
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmabufParams {
    pub format: DrmFourcc,
    pub modifier: DrmModifier,
    pub width: u32,
    pub height: u32,
}

pub enum BufferBacking {
    Shm {
        params: ShmBufferParams,
        mapping: Arc<RwLock<ShmMapping>>,
        /// Set once the pending host→GPU transfer has been issued and is
        /// no longer needed to be re-issued on the next flush attempt.
        upload_submitted: Mutex<bool>,
        image: Mutex<Option<Image>>,
    },
    /// Already GPU-resident at import time (see `Buffer::new_dmabuf`), so
    /// there's no staged upload to track, unlike `Shm`.
    Dmabuf {
        params: DmabufParams,
        image: Image,
    },
}

pub struct Buffer {
    pub wl_buffer: wl_buffer::WlBuffer,
    pub backing: BufferBacking,
    lock: Mutex<Option<Weak<()>>>,

    /// Set whenever `lock()` hands out a fresh token; cleared once
    /// `wl_buffer.release()` has actually been sent for that hold. Lets
    /// `poll_releases` tell "never locked" (no release owed) from "locked,
    /// then dropped, release still pending".
    needs_release: Mutex<bool>,

    /// The client destroyed this buffer's `wl_buffer` object while it was
    /// still locked; the slotmap entry is removed the next time it's
    /// released instead of immediately, per the data-model ordering rule
    /// that a buffer can't be released before every lock guard drops.
    needs_destruction: Mutex<bool>,
}

impl Buffer {
    pub fn new_shm(wl_buffer: wl_buffer::WlBuffer, params: ShmBufferParams, mapping: Arc<RwLock<ShmMapping>>) -> Self {
        Self {
            wl_buffer,
            backing: BufferBacking::Shm {
                params,
                mapping,
                upload_submitted: Mutex::new(false),
                image: Mutex::new(None),
            },
            lock: Mutex::new(None),
            needs_release: Mutex::new(false),
            needs_destruction: Mutex::new(false),
        }
    }

    /// Wraps an already-imported dma-buf image (see
    /// `vulkan::Image::import_dmabuf`) as a buffer. Unlike `new_shm`, there's
    /// no deferred upload: the image is GPU-resident the moment the client's
    /// `zwp_linux_buffer_params_v1.create`/`create_immed` succeeds.
    pub fn new_dmabuf(wl_buffer: wl_buffer::WlBuffer, params: DmabufParams, image: Image) -> Self {
        Self {
            wl_buffer,
            backing: BufferBacking::Dmabuf { params, image },
            lock: Mutex::new(None),
            needs_release: Mutex::new(false),
            needs_destruction: Mutex::new(false),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        match &self.backing {
            BufferBacking::Shm { params, .. } => (params.width, params.height),
            BufferBacking::Dmabuf { params, .. } => (params.width, params.height),
        }
    }

    pub fn is_released(&self) -> bool {
        match self.lock.lock().unwrap().as_ref() {
            Some(weak) => weak.strong_count() == 0,
            None => true,
        }
    }

    /// Transitions the buffer from released to locked, returning a guard.
    /// Subsequent calls before the guard (or a clone of it) is dropped
    /// return a cloned guard over the same token rather than a fresh lock,
    /// matching the invariant that a buffer has at most one outstanding
    /// lock at a time.
    pub fn lock(&self) -> BufferLock {
        let mut slot = self.lock.lock().unwrap();
        *self.needs_release.lock().unwrap() = true;

        if let Some(weak) = slot.as_ref() {
            if let Some(strong) = weak.upgrade() {
                return BufferLock(strong);
            }
        }

        let strong = Arc::new(());
        *slot = Some(Arc::downgrade(&strong));
        BufferLock(strong)
    }

    /// Whether this buffer has been locked since its last release and is
    /// now fully released (every guard dropped), i.e. `wl_buffer.release()`
    /// is owed to the client.
    pub fn release_due(&self) -> bool {
        *self.needs_release.lock().unwrap() && self.is_released()
    }

    pub fn mark_released(&self) {
        *self.needs_release.lock().unwrap() = false;
    }

    pub fn mark_for_destruction(&self) {
        *self.needs_destruction.lock().unwrap() = true;
    }

    pub fn needs_destruction(&self) -> bool {
        *self.needs_destruction.lock().unwrap()
    }

    /// Readiness for shm buffers performs the staged host→GPU copy (via
    /// the caller-supplied closure) exactly once per commit and reports
    /// ready as soon as the transfer has been submitted.
    pub fn is_ready(&self, mut stage_upload: impl FnMut() -> anyhow::Result<()>) -> anyhow::Result<bool> {
        match &self.backing {
            BufferBacking::Shm {
                upload_submitted, ..
            } => {
                let mut submitted = upload_submitted.lock().unwrap();
                if !*submitted {
                    stage_upload()?;
                    *submitted = true;
                }
                Ok(true)
            }
            BufferBacking::Dmabuf { .. } => Ok(true),
        }
    }
}

/// An owned guard representing one hold on a buffer's content. Cloning a
/// guard shares the same underlying token (so `strong_count` on the
/// buffer's weak handle answers "is this buffer still held?" correctly);
/// dropping the last clone releases the buffer.
#[derive(Clone)]
pub struct BufferLock(Arc<()>);

impl BufferLock {
    pub fn is_expired(&self) -> bool {
        Arc::strong_count(&self.0) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_validation_rejects_overflow() {
        assert!(validate_shm_params(0, 100, 100, 10, 4, 10_000).is_err());
    }

    #[test]
    fn stride_validation_rejects_short_stride() {
        assert!(validate_shm_params(0, 100, 10, 100, 4, 10_000).is_err());
    }

    #[test]
    fn stride_validation_accepts_exact_fit() {
        assert!(validate_shm_params(0, 100, 10, 400, 4, 4_000).is_ok());
    }

    #[test]
    fn stride_validation_rejects_out_of_bounds_offset() {
        assert!(validate_shm_params(3_900, 100, 10, 400, 4, 4_000).is_err());
    }

    #[test]
    fn release_due_only_after_lock_and_drop() {
        let lock: Mutex<Option<Weak<()>>> = Mutex::new(None);
        let needs_release = Mutex::new(false);

        let is_released = || match lock.lock().unwrap().as_ref() {
            Some(weak) => weak.strong_count() == 0,
            None => true,
        };

        assert!(!(*needs_release.lock().unwrap() && is_released()));

        let guard = {
            let mut slot = lock.lock().unwrap();
            *needs_release.lock().unwrap() = true;
            let strong = Arc::new(());
            *slot = Some(Arc::downgrade(&strong));
            strong
        };

        assert!(!(*needs_release.lock().unwrap() && is_released()));
        drop(guard);
        assert!(*needs_release.lock().unwrap() && is_released());
    }
}
