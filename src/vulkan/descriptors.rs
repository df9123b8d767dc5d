// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use anyhow::Result;
use ash::vk;
use tracing::warn;

/// A bindless descriptor id. Zero is reserved as the "invalid" sentinel,
/// matching shader-side indexing conventions: an uninitialized id reads as
/// invalid rather than aliasing slot zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorId(u32);

impl DescriptorId {
    pub const INVALID: DescriptorId = DescriptorId(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    SampledImage,
    StorageImage,
    Sampler,
}

const SAMPLED_IMAGE_CAPACITY: u32 = 65_536;
const STORAGE_IMAGE_CAPACITY: u32 = 65_536;
const SAMPLER_CAPACITY: u32 = 16;

/// A freelist-backed allocator over one descriptor binding. Ids are drawn
/// from the freelist first, falling back to a bump counter; freed ids
/// return to the freelist. Exhaustion is non-fatal: it logs and yields
/// `DescriptorId::INVALID`, so callers degrade (typically: skip this
/// object rather than abort the compositor).
struct Allocator {
    capacity: u32,
    next: u32,
    free: Vec<u32>,
}

impl Allocator {
    fn new(capacity: u32) -> Self {
        Self {
            capacity,
            next: 1,
            free: Vec::new(),
        }
    }

    fn alloc(&mut self, kind: DescriptorKind) -> DescriptorId {
        if let Some(id) = self.free.pop() {
            return DescriptorId(id);
        }

        if self.next >= self.capacity {
            warn!(?kind, capacity = self.capacity, "descriptor table exhausted");
            return DescriptorId::INVALID;
        }

        let id = self.next;
        self.next += 1;
        DescriptorId(id)
    }

    fn free(&mut self, id: DescriptorId) {
        if id.is_valid() {
            self.free.push(id.0);
        }
    }
}

/// The two bindless descriptor set layouts (sampled + storage images) plus
/// a small sampler table, all update-after-bind and partially-bound so
/// images can be hot-swapped without invalidating in-flight command
/// buffers that reference other slots.
pub struct DescriptorTables {
    pub set_layout: vk::DescriptorSetLayout,
    pub pool: vk::DescriptorPool,
    pub set: vk::DescriptorSet,

    sampled_images: std::sync::Mutex<Allocator>,
    storage_images: std::sync::Mutex<Allocator>,
    samplers: std::sync::Mutex<Allocator>,
}

const BINDING_SAMPLED_IMAGE: u32 = 0;
const BINDING_STORAGE_IMAGE: u32 = 1;
const BINDING_SAMPLER: u32 = 2;

impl DescriptorTables {
    pub fn new(device: &ash::Device) -> Result<Self> {
        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(BINDING_SAMPLED_IMAGE)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(SAMPLED_IMAGE_CAPACITY)
                .stage_flags(vk::ShaderStageFlags::ALL),
            vk::DescriptorSetLayoutBinding::default()
                .binding(BINDING_STORAGE_IMAGE)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(STORAGE_IMAGE_CAPACITY)
                .stage_flags(vk::ShaderStageFlags::ALL),
            vk::DescriptorSetLayoutBinding::default()
                .binding(BINDING_SAMPLER)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .descriptor_count(SAMPLER_CAPACITY)
                .stage_flags(vk::ShaderStageFlags::ALL),
        ];

        let binding_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING; 3];

        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default()
            .binding_flags(&binding_flags);

        let set_layout = unsafe {
            device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::default()
                    .bindings(&bindings)
                    .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
                    .push_next(&mut flags_info),
                None,
            )?
        };

        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(SAMPLED_IMAGE_CAPACITY),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(STORAGE_IMAGE_CAPACITY),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::SAMPLER)
                .descriptor_count(SAMPLER_CAPACITY),
        ];

        let pool = unsafe {
            device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default()
                    .pool_sizes(&pool_sizes)
                    .max_sets(1)
                    .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND),
                None,
            )?
        };

        let set = unsafe {
            device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(pool)
                    .set_layouts(std::slice::from_ref(&set_layout)),
            )?[0]
        };

        Ok(Self {
            set_layout,
            pool,
            set,
            sampled_images: std::sync::Mutex::new(Allocator::new(SAMPLED_IMAGE_CAPACITY)),
            storage_images: std::sync::Mutex::new(Allocator::new(STORAGE_IMAGE_CAPACITY)),
            samplers: std::sync::Mutex::new(Allocator::new(SAMPLER_CAPACITY)),
        })
    }

    pub fn alloc(&self, kind: DescriptorKind) -> DescriptorId {
        match kind {
            DescriptorKind::SampledImage => self.sampled_images.lock().unwrap().alloc(kind),
            DescriptorKind::StorageImage => self.storage_images.lock().unwrap().alloc(kind),
            DescriptorKind::Sampler => self.samplers.lock().unwrap().alloc(kind),
        }
    }

    pub fn free(&self, kind: DescriptorKind, id: DescriptorId) {
        match kind {
            DescriptorKind::SampledImage => self.sampled_images.lock().unwrap().free(id),
            DescriptorKind::StorageImage => self.storage_images.lock().unwrap().free(id),
            DescriptorKind::Sampler => self.samplers.lock().unwrap().free(id),
        }
    }

    pub fn write_sampled_image(&self, device: &ash::Device, id: DescriptorId, view: vk::ImageView) {
        let image_info = vk::DescriptorImageInfo::default()
            .image_view(view)
            .image_layout(vk::ImageLayout::GENERAL);

        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(BINDING_SAMPLED_IMAGE)
            .dst_array_element(id.as_u32())
            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
            .image_info(std::slice::from_ref(&image_info));

        unsafe { device.update_descriptor_sets(&[write], &[]) };
    }

    pub fn write_storage_image(&self, device: &ash::Device, id: DescriptorId, view: vk::ImageView) {
        let image_info = vk::DescriptorImageInfo::default()
            .image_view(view)
            .image_layout(vk::ImageLayout::GENERAL);

        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(BINDING_STORAGE_IMAGE)
            .dst_array_element(id.as_u32())
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .image_info(std::slice::from_ref(&image_info));

        unsafe { device.update_descriptor_sets(&[write], &[]) };
    }

    pub fn write_sampler(&self, device: &ash::Device, id: DescriptorId, sampler: vk::Sampler) {
        let image_info = vk::DescriptorImageInfo::default().sampler(sampler);

        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(BINDING_SAMPLER)
            .dst_array_element(id.as_u32())
            .descriptor_type(vk::DescriptorType::SAMPLER)
            .image_info(std::slice::from_ref(&image_info));

        unsafe { device.update_descriptor_sets(&[write], &[]) };
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_descriptor_pool(self.pool, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freelist_reuses_before_bumping() {
        let mut alloc = Allocator::new(4);

        let a = alloc.alloc(DescriptorKind::SampledImage);
        let b = alloc.alloc(DescriptorKind::SampledImage);
        assert_ne!(a, b);
        assert!(a.is_valid() && b.is_valid());

        alloc.free(a);
        let c = alloc.alloc(DescriptorKind::SampledImage);
        assert_eq!(a, c, "freed id should be reused before bumping the counter");
    }

    #[test]
    fn zero_is_never_allocated() {
        let mut alloc = Allocator::new(2);
        let id = alloc.alloc(DescriptorKind::Sampler);
        assert_ne!(id, DescriptorId::INVALID);
    }

    #[test]
    fn exhaustion_returns_invalid() {
        let mut alloc = Allocator::new(2);
        let _ = alloc.alloc(DescriptorKind::Sampler); // id 1
        let exhausted = alloc.alloc(DescriptorKind::Sampler); // capacity reached
        assert_eq!(exhausted, DescriptorId::INVALID);
    }
}
