// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The swapchain of client-invisible render targets backing one output,
//! and the acquire/present/release bookkeeping that paces redraws against
//! the backend's own vsync signal.

use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::vulkan::{Image, ImageUsage, Syncpoint, VkContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageConfig {
    pub extent: (u32, u32),
    pub usage: ImageUsage,
}

/// A release fence: a timeline semaphore the backend signals once the
/// image most recently committed through this slot is safe to reuse.
struct ReleaseSlot {
    semaphore: vk::Semaphore,
    release_point: u64,
    /// The image currently committed through this slot, taken back once
    /// the backend signals `release_point`.
    in_flight: Option<Image>,
}

pub const DEFAULT_MAX_IMAGES: usize = 3;

/// One output's pool of render targets plus the gating state for
/// `try_redraw`. Owns no presentation logic itself — that's the backend's
/// job — only the image lifecycle and the four redraw preconditions.
pub struct Output {
    vk: Arc<VkContext>,
    config: ImageConfig,
    max_images: usize,

    free: Vec<Image>,
    images_in_flight: usize,
    release_slots: Vec<ReleaseSlot>,

    pub frame_requested: bool,
    pub commit_available: bool,
    pub size: (u32, u32),
}

impl Output {
    pub fn new(vk: Arc<VkContext>, config: ImageConfig) -> Self {
        Self {
            vk,
            size: config.extent,
            config,
            max_images: DEFAULT_MAX_IMAGES,
            free: Vec::new(),
            images_in_flight: 0,
            release_slots: Vec::new(),
            frame_requested: false,
            commit_available: true,
        }
    }

    /// Updates the target extent; images already allocated at the old
    /// extent are dropped lazily on the next `acquire`, not eagerly here.
    pub fn resize(&mut self, size: (u32, u32)) {
        self.size = size;
        self.config.extent = size;
    }

    /// Runs the acquire algorithm: reclaims stale free images, trims the
    /// free pool to `max_images`, and either hands back a free image or
    /// allocates a fresh one. Returns `None` if the in-flight count is
    /// already at the cap; the caller must wait for a release.
    pub fn acquire(&mut self) -> Result<Option<Image>> {
        self.free.retain(|img| img.extent == self.config.extent);

        while self.images_in_flight + self.free.len() > self.max_images {
            // Drop newest first: the oldest free image is more likely to
            // already be warm in backend-side caches (e.g. the nested
            // backend's wl_buffer proxy cache).
            self.free.pop();
        }

        if self.free.is_empty() {
            if self.images_in_flight >= self.max_images {
                return Ok(None);
            }

            let image = Image::create(self.vk.clone(), self.config.extent, vk::Format::R8G8B8A8_UNORM, self.config.usage)?;
            self.images_in_flight += 1;
            return Ok(Some(image));
        }

        self.images_in_flight += 1;
        Ok(self.free.pop())
    }

    fn find_or_create_release_slot(&mut self) -> Result<usize> {
        if let Some(idx) = self.release_slots.iter().position(|s| s.in_flight.is_none()) {
            return Ok(idx);
        }

        let semaphore = unsafe {
            let mut type_info = vk::SemaphoreTypeCreateInfo::default()
                .semaphore_type(vk::SemaphoreType::TIMELINE)
                .initial_value(0);

            self.vk
                .device
                .create_semaphore(&vk::SemaphoreCreateInfo::default().push_next(&mut type_info), None)?
        };

        self.release_slots.push(ReleaseSlot {
            semaphore,
            release_point: 0,
            in_flight: None,
        });

        Ok(self.release_slots.len() - 1)
    }

    /// Hands `image` to `commit` for presentation, bumping the chosen
    /// release slot's target value. The caller is responsible for polling
    /// `poll_releases` (typically once per event loop tick) to return
    /// released images to the free pool.
    pub fn present(
        &mut self,
        image: Image,
        acquire: Syncpoint,
        mut commit: impl FnMut(&Image, Syncpoint, Syncpoint, CommitFlags) -> Result<()>,
    ) -> Result<()> {
        let slot_idx = self.find_or_create_release_slot()?;
        let slot = &mut self.release_slots[slot_idx];
        slot.release_point += 1;

        let release = Syncpoint {
            semaphore: slot.semaphore,
            value: slot.release_point,
        };

        commit(&image, acquire, release, CommitFlags::VSYNC)?;

        self.release_slots[slot_idx].in_flight = Some(image);
        self.commit_available = false;
        Ok(())
    }

    /// Reaps any release slots whose semaphore has reached its target
    /// value, returning their images to the free pool and decrementing
    /// the in-flight count. Returns the number of images released.
    pub fn poll_releases(&mut self) -> Result<usize> {
        let mut released = 0;

        for slot in &mut self.release_slots {
            if slot.in_flight.is_none() {
                continue;
            }

            let reached = unsafe { self.vk.device.get_semaphore_counter_value(slot.semaphore)? };

            if reached >= slot.release_point {
                if let Some(image) = slot.in_flight.take() {
                    self.free.push(image);
                    self.images_in_flight -= 1;
                    released += 1;
                }
            }
        }

        Ok(released)
    }

    /// The four preconditions for redrawing: a frame was requested, the
    /// backend has room for another commit, the output has nonzero size,
    /// and an image is actually available. Returns the acquired image on
    /// success, leaving `frame_requested`/`commit_available` untouched so
    /// the caller can clear them once it has actually scheduled the draw.
    pub fn try_redraw(&mut self) -> Result<Option<Image>> {
        if !self.frame_requested || !self.commit_available {
            return Ok(None);
        }

        if self.size.0 == 0 || self.size.1 == 0 {
            return Ok(None);
        }

        self.acquire()
    }
}

impl Drop for Output {
    fn drop(&mut self) {
        for slot in &self.release_slots {
            unsafe { self.vk.device.destroy_semaphore(slot.semaphore, None) };
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommitFlags: u32 {
        const VSYNC = 1 << 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_flags_compose() {
        let flags = CommitFlags::VSYNC;
        assert!(flags.contains(CommitFlags::VSYNC));
        assert!(!CommitFlags::empty().contains(CommitFlags::VSYNC));
    }

    #[test]
    fn redraw_gating_requires_frame_request_and_commit_availability() {
        // Exercise the pure gating logic without a live VkContext: mirror
        // `try_redraw`'s precondition checks directly.
        struct Gate {
            frame_requested: bool,
            commit_available: bool,
            size: (u32, u32),
        }

        let gate = Gate {
            frame_requested: false,
            commit_available: true,
            size: (1920, 1080),
        };
        assert!(!(gate.frame_requested && gate.commit_available && gate.size.0 != 0 && gate.size.1 != 0));

        let gate = Gate {
            frame_requested: true,
            commit_available: true,
            size: (0, 1080),
        };
        assert!(!(gate.frame_requested && gate.commit_available && gate.size.0 != 0 && gate.size.1 != 0));

        let gate = Gate {
            frame_requested: true,
            commit_available: true,
            size: (1920, 1080),
        };
        assert!(gate.frame_requested && gate.commit_available && gate.size.0 != 0 && gate.size.1 != 0);
    }
}
