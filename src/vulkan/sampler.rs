// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use super::descriptors::{DescriptorId, DescriptorKind};
use super::VkContext;

/// A sampler bound into the bindless sampler table. Clamp-to-transparent-
/// black, no anisotropy: surfaces never tile or wrap, so out-of-bounds
/// reads should composite as nothing rather than edge-smear or repeat.
pub struct Sampler {
    vk: Arc<VkContext>,
    pub sampler: vk::Sampler,
    pub descriptor: DescriptorId,
}

impl Sampler {
    pub fn create(vk: Arc<VkContext>, mag: vk::Filter, min: vk::Filter) -> Result<Self> {
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(mag)
            .min_filter(min)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK)
            .anisotropy_enable(false)
            .unnormalized_coordinates(false);

        let sampler = unsafe { vk.device.create_sampler(&create_info, None)? };

        let descriptor = vk.descriptors.alloc(DescriptorKind::Sampler);
        if descriptor.is_valid() {
            vk.descriptors.write_sampler(&vk.device, descriptor, sampler);
        }

        Ok(Self {
            vk,
            sampler,
            descriptor,
        })
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe { self.vk.device.destroy_sampler(self.sampler, None) };
        self.vk.descriptors.free(DescriptorKind::Sampler, self.descriptor);
    }
}
