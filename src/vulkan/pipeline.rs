// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Graphics and compute pipeline creation. Every pipeline shares one
//! layout: the bindless descriptor set plus a small push-constant block,
//! since the compositor only ever draws textured quads (the output
//! composite pass) or runs small compute passes (format conversion,
//! format-modifier detiling) against bindless image ids.

use std::ffi::CString;
use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;

use super::VkContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blend {
    None,
    PremultipliedAlpha,
}

pub struct Pipeline {
    vk: Arc<VkContext>,
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl Pipeline {
    fn make_layout(vk: &VkContext, push_constant_size: u32) -> Result<vk::PipelineLayout> {
        let push_constant_ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::ALL)
            .offset(0)
            .size(push_constant_size)];

        let set_layouts = [vk.descriptors.set_layout];
        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);

        Ok(unsafe { vk.device.create_pipeline_layout(&create_info, None)? })
    }

    fn shader_module(vk: &VkContext, spirv: &[u8]) -> Result<vk::ShaderModule> {
        let words = ash::util::read_spv(&mut std::io::Cursor::new(spirv))
            .context("spir-v blob is not 4-byte aligned / valid")?;

        let create_info = vk::ShaderModuleCreateInfo::default().code(&words);
        Ok(unsafe { vk.device.create_shader_module(&create_info, None)? })
    }

    /// Builds a single-subpass-equivalent graphics pipeline via dynamic
    /// rendering (no `VkRenderPass`/`VkFramebuffer`), targeting `format`
    /// with the given blend mode. `spirv` holds both stages back to back
    /// isn't supported; callers pass the vertex and fragment SPIR-V blobs
    /// compiled at build time (see `build.rs`) along with their entry
    /// point names.
    pub fn create_graphics(
        vk: Arc<VkContext>,
        blend: Blend,
        format: vk::Format,
        vs_spirv: &[u8],
        fs_spirv: &[u8],
        vs_entry: &str,
        fs_entry: &str,
    ) -> Result<Self> {
        let vs_module = Self::shader_module(&vk, vs_spirv)?;
        let fs_module = Self::shader_module(&vk, fs_spirv)?;

        let vs_entry = CString::new(vs_entry)?;
        let fs_entry = CString::new(fs_entry)?;

        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vs_module)
                .name(&vs_entry),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fs_module)
                .name(&fs_entry),
        ];

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_STRIP);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let (blend_enable, src, dst) = match blend {
            Blend::None => (false, vk::BlendFactor::ONE, vk::BlendFactor::ZERO),
            Blend::PremultipliedAlpha => (
                true,
                vk::BlendFactor::ONE,
                vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            ),
        };

        let attachments = [vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(blend_enable)
            .src_color_blend_factor(src)
            .dst_color_blend_factor(dst)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(src)
            .dst_alpha_blend_factor(dst)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA)];

        let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats = [format];
        let mut rendering_info =
            vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);

        let layout = Self::make_layout(&vk, 24)?;

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let pipeline = unsafe {
            vk.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
                .map_err(|(_, e)| e)?[0]
        };

        unsafe {
            vk.device.destroy_shader_module(vs_module, None);
            vk.device.destroy_shader_module(fs_module, None);
        }

        Ok(Self {
            vk,
            pipeline,
            layout,
        })
    }

    pub fn create_compute(vk: Arc<VkContext>, spirv: &[u8], entry: &str) -> Result<Self> {
        let module = Self::shader_module(&vk, spirv)?;
        let entry = CString::new(entry)?;

        let layout = Self::make_layout(&vk, 16)?;

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry);

        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        let pipeline = unsafe {
            vk.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
                .map_err(|(_, e)| e)?[0]
        };

        unsafe { vk.device.destroy_shader_module(module, None) };

        Ok(Self {
            vk,
            pipeline,
            layout,
        })
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.vk.device.destroy_pipeline(self.pipeline, None);
            self.vk.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}
