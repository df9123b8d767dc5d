// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

#![allow(clippy::too_many_arguments)]

pub mod commands;
pub mod descriptors;
mod drm;
pub mod format;
pub mod image;
pub mod pipeline;
pub mod queue;
pub mod sampler;
pub mod timeline;

pub use commands::{Batch, CommandRecorder, Syncpoint};
pub use descriptors::{DescriptorId, DescriptorKind};
pub use drm::DrmDevice;
pub use image::{Image, ImageUsage};
pub use pipeline::{Blend, Pipeline};
pub use queue::{QueueKind, VkQueue};
pub use sampler::Sampler;
pub use timeline::{VkTimelinePoint, VkTimelineSemaphore};

use std::ffi::{c_void, CStr};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ash::extensions::{
    ext,
    khr::{ExternalMemoryFd as ExternalMemoryFdExt, ExternalSemaphoreFd as ExternalSemaphoreFdExt},
};
use ash::vk;
use cstr::cstr;
use tracing::{debug, error, info, warn};

bitflags::bitflags! {
    /// Feature toggles requested at context creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        const VALIDATION = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Amd,
    Nvidia,
    Other,
}

/// Process-wide GPU context: instance, device, queues, and the bindless
/// descriptor tables shared by every allocated image and sampler.
pub struct VkContext {
    pub entry: ash::Entry,
    pub external_mem_loader: ExternalMemoryFdExt,
    pub external_semaphore_api: ExternalSemaphoreFdExt,

    pub instance: ash::Instance,
    pub debug: Option<VkDebugContext>,
    pub device: ash::Device,
    pub device_info: VkDeviceInfo,
    pub graphics_queue: VkQueue,
    pub transfer_queue: VkQueue,

    pub descriptors: descriptors::DescriptorTables,
}

pub struct VkDebugContext {
    debug: ext::DebugUtils,
    messenger: vk::DebugUtilsMessengerEXT,
}

pub struct VkDeviceInfo {
    pub pdevice: vk::PhysicalDevice,
    pub device_name: std::ffi::CString,
    pub device_type: vk::PhysicalDeviceType,
    pub device_vendor: Vendor,
    pub limits: vk::PhysicalDeviceLimits,
    pub drm_node: libc::dev_t,
    pub graphics_family: u32,
    pub transfer_family: u32,
    pub memory_props: vk::PhysicalDeviceMemoryProperties,
    pub host_visible_mem_type_index: u32,
    pub host_mem_is_cached: bool,
    pub selected_extensions: Vec<std::ffi::CString>,
}

impl VkDeviceInfo {
    fn query(instance: &ash::Instance, device: vk::PhysicalDevice) -> Result<Self> {
        let mut drm_props = vk::PhysicalDeviceDrmPropertiesEXT::default();
        let mut props = vk::PhysicalDeviceProperties2::default().push_next(&mut drm_props);
        unsafe { instance.get_physical_device_properties2(device, &mut props) };

        let limits = props.properties.limits;
        let device_type = props.properties.device_type;
        let device_name =
            unsafe { CStr::from_ptr(props.properties.device_name.as_ptr()).to_owned() };
        let device_vendor = match props.properties.vendor_id {
            0x1002 => Vendor::Amd,
            0x10de => Vendor::Nvidia,
            _ => Vendor::Other,
        };

        if drm_props.render_major != 226 || drm_props.render_minor < 128 {
            bail!("device {:?} is not a render node", device_name);
        }

        let drm_node = libc::makedev(drm_props.render_major as u32, drm_props.render_minor as u32);

        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(device) };

        let graphics_family = queue_families
            .iter()
            .enumerate()
            .find(|(_, properties)| {
                properties.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                    && properties.queue_flags.contains(vk::QueueFlags::COMPUTE)
            })
            .map(|(index, _)| index as u32)
            .ok_or_else(|| anyhow::anyhow!("no graphics queue found"))?;

        let transfer_family = queue_families
            .iter()
            .enumerate()
            .find(|(index, properties)| {
                *index as u32 != graphics_family
                    && properties.queue_flags.contains(vk::QueueFlags::TRANSFER)
            })
            .map(|(index, _)| index as u32)
            .unwrap_or(graphics_family);

        let available_extensions = unsafe {
            instance
                .enumerate_device_extension_properties(device)?
                .into_iter()
                .map(|properties| CStr::from_ptr(properties.extension_name.as_ptr()).to_owned())
                .collect::<Vec<_>>()
        };

        let selected_extensions = vec![
            vk::KhrExternalMemoryFdFn::NAME.to_owned(),
            vk::ExtExternalMemoryDmaBufFn::NAME.to_owned(),
            vk::ExtImageDrmFormatModifierFn::NAME.to_owned(),
            vk::ExtPhysicalDeviceDrmFn::NAME.to_owned(),
            vk::KhrExternalSemaphoreFdFn::NAME.to_owned(),
        ];

        for ext in selected_extensions.iter() {
            if !contains_extension(&available_extensions, ext) {
                return Err(anyhow::anyhow!("extension {:?} not available", ext));
            }
        }

        let memory_props = unsafe { instance.get_physical_device_memory_properties(device) };

        let (host_visible_mem_type_index, host_mem_is_cached) = {
            let mut cached = true;
            let mut idx = select_memory_type(
                &memory_props,
                vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_CACHED
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                None,
            );

            if idx.is_none() {
                idx = select_memory_type(
                    &memory_props,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                    None,
                );

                if idx.is_none() {
                    bail!("no host visible memory type found");
                }

                cached = false;
            }

            (idx.unwrap(), cached)
        };

        Ok(Self {
            pdevice: device,
            device_name,
            device_type,
            device_vendor,
            limits,
            drm_node,
            graphics_family,
            transfer_family,
            memory_props,
            host_visible_mem_type_index,
            host_mem_is_cached,
            selected_extensions,
        })
    }
}

pub(crate) fn select_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    flags: vk::MemoryPropertyFlags,
    type_bits: Option<u32>,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&i| {
        let allowed = type_bits.map(|bits| bits & (1 << i) != 0).unwrap_or(true);
        allowed && props.memory_types[i as usize].property_flags.contains(flags)
    })
}

fn contains_extension(haystack: &[std::ffi::CString], needle: &CStr) -> bool {
    haystack.iter().any(|ext| ext.as_c_str() == needle)
}

impl VkContext {
    pub fn new(features: Features) -> Result<Arc<Self>> {
        let entry = unsafe { ash::Entry::load().context("failed to load vulkan libraries")? };
        debug!("creating vulkan instance");

        let (major, minor) = match unsafe { entry.try_enumerate_instance_version()? } {
            Some(version) => (
                vk::api_version_major(version),
                vk::api_version_minor(version),
            ),
            None => (1, 0),
        };

        if major < 1 || (major == 1 && minor < 3) {
            bail!("vulkan 1.3 or higher is required");
        }

        let app_info = vk::ApplicationInfo::default()
            .application_name(cstr!("waycore"))
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(cstr!("waycore"))
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::make_api_version(0, major, minor, 0));

        let available_extensions = unsafe {
            entry
                .enumerate_instance_extension_properties(None)?
                .into_iter()
                .map(|properties| CStr::from_ptr(properties.extension_name.as_ptr()).to_owned())
                .collect::<Vec<_>>()
        };

        let mut extensions = Vec::new();
        let mut layers = Vec::new();

        let enable_debug = features.contains(Features::VALIDATION);
        if enable_debug {
            if !available_extensions
                .iter()
                .any(|ext| ext.as_c_str() == ext::DebugUtils::NAME)
            {
                bail!("debug utils extension requested, but not available");
            }

            warn!("vulkan validation enabled");
            extensions.push(ext::DebugUtils::NAME.as_ptr());

            unsafe {
                let validation_layer = cstr!("VK_LAYER_KHRONOS_validation");
                if entry
                    .enumerate_instance_layer_properties()?
                    .into_iter()
                    .map(|properties| CStr::from_ptr(properties.layer_name.as_ptr()).to_owned())
                    .any(|layer| layer.as_c_str() == validation_layer)
                {
                    layers.push(validation_layer.as_ptr());
                } else {
                    warn!("validation layers requested, but not available!");
                }
            }
        }

        let instance_create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions);

        let instance = unsafe { entry.create_instance(&instance_create_info, None)? };

        let debug_utils = if enable_debug {
            let debug_utils = ext::DebugUtils::new(&entry, &instance);

            let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
                )
                .pfn_user_callback(Some(vulkan_debug_utils_callback));

            let messenger =
                unsafe { debug_utils.create_debug_utils_messenger(&create_info, None)? };

            Some(VkDebugContext {
                debug: debug_utils,
                messenger,
            })
        } else {
            None
        };

        let devices = unsafe { instance.enumerate_physical_devices()? };
        let mut devices = devices
            .into_iter()
            .enumerate()
            .flat_map(|(index, dev)| match VkDeviceInfo::query(&instance, dev) {
                Ok(device) => Some((index as u32, device)),
                Err(err) => {
                    let device_name = unsafe {
                        CStr::from_ptr(
                            instance
                                .get_physical_device_properties(dev)
                                .device_name
                                .as_ptr(),
                        )
                        .to_owned()
                    };

                    info!("gpu {device_name:?} ineligible: {err}");
                    None
                }
            })
            .collect::<Vec<_>>();

        if devices.is_empty() {
            bail!("no suitable gpu found");
        }

        devices.sort_by_key(|(_, dev)| match dev.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 0,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 10,
            _ => 20,
        });

        let (index, device_info) = devices.remove(0);
        info!("selected gpu: {:?} ({index})", device_info.device_name);

        let device = {
            let queue_priorities = &[1.0];
            let mut queue_indices = vec![device_info.graphics_family, device_info.transfer_family];
            queue_indices.dedup();

            let queue_create_infos = queue_indices
                .iter()
                .map(|&index| {
                    vk::DeviceQueueCreateInfo::default()
                        .queue_family_index(index)
                        .queue_priorities(queue_priorities)
                })
                .collect::<Vec<_>>();

            let mut enabled_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
                .timeline_semaphore(true)
                .descriptor_indexing(true)
                .descriptor_binding_partially_bound(true)
                .descriptor_binding_update_unused_while_pending(true)
                .shader_sampled_image_array_non_uniform_indexing(true)
                .runtime_descriptor_array(true)
                .host_query_reset(true);

            let mut enabled_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
                .dynamic_rendering(true)
                .synchronization2(true);

            let extension_names = device_info
                .selected_extensions
                .iter()
                .map(|v| v.as_c_str().as_ptr())
                .collect::<Vec<_>>();

            let device_create_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(&queue_create_infos)
                .enabled_extension_names(&extension_names)
                .push_next(&mut enabled_1_2_features)
                .push_next(&mut enabled_1_3_features);

            unsafe { instance.create_device(device_info.pdevice, &device_create_info, None)? }
        };

        let graphics_queue = VkQueue::new(&device, device_info.graphics_family, QueueKind::Graphics)?;
        let transfer_queue = if device_info.transfer_family == device_info.graphics_family {
            graphics_queue.clone()
        } else {
            VkQueue::new(&device, device_info.transfer_family, QueueKind::Transfer)?
        };

        if !device_info.host_mem_is_cached {
            warn!("no cache-coherent host memory type found on device!");
        }

        let external_mem_loader = ExternalMemoryFdExt::new(&instance, &device);
        let external_semaphore_api = ExternalSemaphoreFdExt::new(&instance, &device);
        let descriptors = descriptors::DescriptorTables::new(&device)?;

        Ok(Arc::new(Self {
            entry,
            external_mem_loader,
            external_semaphore_api,
            instance,
            device,
            device_info,
            graphics_queue,
            transfer_queue,
            debug: debug_utils,
            descriptors,
        }))
    }

    pub fn queue(&self, kind: QueueKind) -> &VkQueue {
        match kind {
            QueueKind::Graphics => &self.graphics_queue,
            QueueKind::Transfer => &self.transfer_queue,
        }
    }

    /// Allocates a bindless sampler. Every surface texture samples through
    /// one of these; there's no per-surface sampler state in the protocol,
    /// so a handful of (mag, min) combinations cover every client.
    pub fn sampler_create(
        self: &Arc<Self>,
        mag: vk::Filter,
        min: vk::Filter,
    ) -> Result<sampler::Sampler> {
        sampler::Sampler::create(self.clone(), mag, min)
    }

    /// Builds the composite pass's graphics pipeline against `format`,
    /// loading the SPIR-V `build.rs` compiled from `shaders/composite_*.glsl`.
    pub fn pipeline_create_graphics(
        self: &Arc<Self>,
        blend: pipeline::Blend,
        format: vk::Format,
        vs_spirv: &[u8],
        fs_spirv: &[u8],
        vs_entry: &str,
        fs_entry: &str,
    ) -> Result<pipeline::Pipeline> {
        pipeline::Pipeline::create_graphics(
            self.clone(),
            blend,
            format,
            vs_spirv,
            fs_spirv,
            vs_entry,
            fs_entry,
        )
    }

    pub fn pipeline_create_compute(
        self: &Arc<Self>,
        spirv: &[u8],
        entry: &str,
    ) -> Result<pipeline::Pipeline> {
        pipeline::Pipeline::create_compute(self.clone(), spirv, entry)
    }
}

unsafe extern "system" fn vulkan_debug_utils_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _userdata: *mut c_void,
) -> vk::Bool32 {
    let _ = std::panic::catch_unwind(|| {
        let message = unsafe { CStr::from_ptr((*p_callback_data).p_message) }.to_string_lossy();
        let ty = format!("{:?}", message_type).to_lowercase();

        match message_severity {
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => tracing::trace!(ty, "{}", message),
            vk::DebugUtilsMessageSeverityFlagsEXT::INFO => info!(ty, "{}", message),
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => warn!(ty, "{}", message),
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => error!(ty, "{}", message),
            _ => (),
        }
    });

    vk::FALSE
}

impl Drop for VkContext {
    fn drop(&mut self) {
        debug!("destroying vulkan instance");

        unsafe {
            self.device.device_wait_idle().ok();

            if let Some(debug) = self.debug.as_ref() {
                debug
                    .debug
                    .destroy_debug_utils_messenger(debug.messenger, None);
            }

            self.graphics_queue.destroy(&self.device);
            self.device
                .destroy_command_pool(self.graphics_queue.command_pool, None);

            if self.transfer_queue.family != self.graphics_queue.family {
                self.transfer_queue.destroy(&self.device);
                self.device
                    .destroy_command_pool(self.transfer_queue.command_pool, None);
            }

            self.descriptors.destroy(&self.device);

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}
