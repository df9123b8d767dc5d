// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use ash::vk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Transfer,
}

/// A typed submission queue with its own command pool and monotonic
/// timeline semaphore ("queue sema"). Submission values are assigned on
/// the event-loop thread, before the submit call, so waiters always see a
/// consistent (queue_sema, value) pair.
///
/// The queue sema is a raw semaphore rather than a `VkTimelineSemaphore`:
/// queues are constructed while the owning `VkContext` is still being
/// built, before an `Arc<VkContext>` exists to hand to the public wrapper.
#[derive(Clone)]
pub struct VkQueue {
    pub family: u32,
    pub kind: QueueKind,
    pub queue: vk::Queue,
    pub command_pool: vk::CommandPool,
    pub queue_sema: vk::Semaphore,
    submitted: Arc<AtomicU64>,
}

impl VkQueue {
    pub fn new(device: &ash::Device, family: u32, kind: QueueKind) -> Result<Self> {
        let queue = unsafe { device.get_device_queue(family, 0) };

        let command_pool = unsafe {
            let create_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(family)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

            device.create_command_pool(&create_info, None)?
        };

        let queue_sema = unsafe {
            device.create_semaphore(
                &vk::SemaphoreCreateInfo::default().push_next(
                    &mut vk::SemaphoreTypeCreateInfo::default()
                        .semaphore_type(vk::SemaphoreType::TIMELINE)
                        .initial_value(0),
                ),
                None,
            )?
        };

        Ok(Self {
            family,
            kind,
            queue,
            command_pool,
            queue_sema,
            submitted: Arc::new(AtomicU64::new(0)),
        })
    }

    /// # Safety
    /// Must only be called from `VkContext::drop`, after `device_wait_idle`.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.queue_sema, None);
    }

    /// Assigns the next submission value. Must be called on the event-loop
    /// thread before the corresponding `queue_submit`.
    pub fn next_value(&self) -> u64 {
        self.submitted.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn submitted_count(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }
}
