// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The composite pass an output's acquired image goes through before
//! `Output::present` hands it to the backend. Layout and input hit-testing
//! belong to the opaque scene/window-manager collaborator
//! (`crate::scene::Scene`) this core embeds but doesn't implement; what the
//! core owns is the GPU mechanics of turning whatever the scene decides
//! into draw calls against the bindless descriptor tables, plus a correct
//! default when no scene opinion exists.
//!
//! `NullScene` never hits-tests or focuses anything, so the composite
//! pass for a standalone run (no window manager attached) just clears
//! the output to black: an always-valid image the backend can present,
//! with every mapped surface's GPU image already uploaded and ready for
//! a real scene implementation to draw whenever it supplies actual
//! placement.

use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::vulkan::commands::{CommandRecorder, Syncpoint};
use crate::vulkan::{Image, QueueKind, VkContext};

/// Transitions `image` into `new_layout` from whatever layout it's
/// currently in, assumed `UNDEFINED`/`GENERAL` (the only two states an
/// `Output`-owned swapchain image is ever in between frames, since
/// nothing outside this module writes to it).
fn transition(
    vk: &VkContext,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        );

    unsafe {
        vk.device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// Clears `image` to opaque black and leaves it in `GENERAL` layout,
/// matching the layout every other `Gpu` image entry point
/// (`image_create`/`image_import_dmabuf`) settles on. Returns the
/// syncpoint the backend must wait on before reading the image's
/// contents (the `Output::present` acquire point).
pub fn clear(vk: &Arc<VkContext>, recorder: &CommandRecorder, image: &Image) -> Result<Syncpoint> {
    let mut batch = recorder.begin(QueueKind::Graphics)?;
    let cmd = batch.command_buffer;

    transition(
        vk,
        cmd,
        image.image,
        vk::AccessFlags::empty(),
        vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::GENERAL,
    );

    let clear_color = vk::ClearColorValue {
        float32: [0.0, 0.0, 0.0, 1.0],
    };
    let ranges = [vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)];

    unsafe {
        vk.device
            .cmd_clear_color_image(cmd, image.image, vk::ImageLayout::GENERAL, &clear_color, &ranges);
    }

    recorder.submit(batch, &[])
}
