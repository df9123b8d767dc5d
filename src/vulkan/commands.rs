// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use ash::vk;

use super::{QueueKind, VkContext};

/// Anything that must stay alive until a batch's submission completes.
/// Images and staging buffers implement this by holding an `Arc` to their
/// own backing resources internally; the recorder only needs to keep a
/// type-erased handle around.
pub trait Protected: Send + Sync {}
impl<T: Send + Sync> Protected for T {}

/// A single wait the batch's submission must honor: a timeline semaphore,
/// the value to wait for, and the pipeline stage it gates.
pub struct Wait {
    pub semaphore: vk::Semaphore,
    pub value: u64,
    pub stage_mask: vk::PipelineStageFlags,
}

/// A syncpoint on a queue's timeline: reaching `value` on `semaphore` means
/// the submission that produced this point has completed.
#[derive(Debug, Clone, Copy)]
pub struct Syncpoint {
    pub semaphore: vk::Semaphore,
    pub value: u64,
}

/// A queue-bound recording of GPU operations, carrying the objects that
/// must outlive it until the submission it's part of completes.
pub struct Batch {
    pub queue: QueueKind,
    pub command_buffer: vk::CommandBuffer,
    protected: Vec<Arc<dyn Protected>>,
}

impl Batch {
    pub fn protect(&mut self, obj: Arc<dyn Protected>) {
        self.protected.push(obj);
    }
}

/// An in-flight submission awaiting completion: its command buffer and
/// protected objects are released once the queue's timeline reaches
/// `value`.
struct Pending {
    queue: QueueKind,
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    value: u64,
    protected: Vec<Arc<dyn Protected>>,
}

/// Owns the command-buffer lifecycle for a `VkContext`: begins batches,
/// tracks protected objects, and submits them against a queue's timeline.
/// Since queue semaphores are raw (not wrapped `VkTimelineSemaphore`s),
/// this keeps its own queue of pending submissions sorted by value and
/// reaps them with `poll`, which the event loop calls once per tick.
pub struct CommandRecorder {
    vk: Arc<VkContext>,
    pending: Mutex<VecDeque<Pending>>,
}

impl CommandRecorder {
    pub fn new(vk: Arc<VkContext>) -> Self {
        Self {
            vk,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Frees the command buffer and drops the protected objects of every
    /// submission whose queue has reached its assigned value.
    pub fn poll(&self) -> Result<()> {
        let mut pending = self.pending.lock().unwrap();

        let mut i = 0;
        while i < pending.len() {
            let reached = unsafe {
                self.vk
                    .device
                    .get_semaphore_counter_value(self.vk.queue(pending[i].queue).queue_sema)?
            };

            if reached >= pending[i].value {
                let done = pending.remove(i).unwrap();
                unsafe {
                    self.vk
                        .device
                        .free_command_buffers(done.pool, &[done.command_buffer]);
                }
                drop(done.protected);
            } else {
                i += 1;
            }
        }

        Ok(())
    }

    /// Allocates a primary command buffer from `queue`'s pool and begins
    /// recording into it.
    pub fn begin(&self, queue: QueueKind) -> Result<Batch> {
        let pool = self.vk.queue(queue).command_pool;

        let command_buffer = unsafe {
            self.vk.device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1),
            )?[0]
        };

        unsafe {
            self.vk.device.begin_command_buffer(
                command_buffer,
                &vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?
        };

        Ok(Batch {
            queue,
            command_buffer,
            protected: Vec::new(),
        })
    }

    /// Ends recording and submits `batch`, waiting on `waits` before
    /// execution begins. Returns a syncpoint reached once the submission
    /// completes, and registers an async wait that frees the batch's
    /// protected objects (and its command buffer) once that happens.
    pub fn submit(&self, batch: Batch, waits: &[Wait]) -> Result<Syncpoint> {
        let queue = self.vk.queue(batch.queue);

        unsafe { self.vk.device.end_command_buffer(batch.command_buffer)? };

        let value = queue.next_value();

        let wait_semaphores = waits.iter().map(|w| w.semaphore).collect::<Vec<_>>();
        let wait_values = waits.iter().map(|w| w.value).collect::<Vec<_>>();
        let wait_stages = waits.iter().map(|w| w.stage_mask).collect::<Vec<_>>();

        let signal_semaphores = [queue.queue_sema];
        let signal_values = [value];

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);

        let command_buffers = [batch.command_buffer];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        unsafe {
            self.vk
                .device
                .queue_submit(queue.queue, &[submit_info], vk::Fence::null())?
        };

        self.pending.lock().unwrap().push_back(Pending {
            queue: batch.queue,
            pool: queue.command_pool,
            command_buffer: batch.command_buffer,
            value,
            protected: batch.protected,
        });

        Ok(Syncpoint {
            semaphore: queue.queue_sema,
            value,
        })
    }
}

/// A transient host-visible buffer used to stage data (texture uploads,
/// readbacks) through a one-off memory allocation. Freed on drop; callers
/// protect it on the batch that references it so it outlives the copy.
pub struct StagingBuffer {
    vk: Arc<VkContext>,
    pub buffer: vk::Buffer,
    memory: vk::DeviceMemory,
}

impl StagingBuffer {
    pub fn new(vk: Arc<VkContext>, data: &[u8]) -> Result<Self> {
        let size = data.len() as vk::DeviceSize;

        let buffer = unsafe {
            vk.device.create_buffer(
                &vk::BufferCreateInfo::default()
                    .size(size)
                    .usage(vk::BufferUsageFlags::TRANSFER_SRC)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE),
                None,
            )?
        };

        let reqs = unsafe { vk.device.get_buffer_memory_requirements(buffer) };
        let type_index = super::select_memory_type(
            &vk.device_info.memory_props,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            Some(reqs.memory_type_bits),
        )
        .ok_or_else(|| anyhow::anyhow!("no host visible memory type for staging buffer"))?;

        let memory = unsafe {
            vk.device.allocate_memory(
                &vk::MemoryAllocateInfo::default()
                    .allocation_size(reqs.size)
                    .memory_type_index(type_index),
                None,
            )?
        };

        unsafe {
            vk.device.bind_buffer_memory(buffer, memory, 0)?;

            let ptr = vk
                .device
                .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, data.len());
            vk.device.unmap_memory(memory);
        }

        Ok(Self { vk, buffer, memory })
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        unsafe {
            self.vk.device.destroy_buffer(self.buffer, None);
            self.vk.device.free_memory(self.memory, None);
        }
    }
}
