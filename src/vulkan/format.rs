// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use anyhow::{anyhow, Result};
use ash::vk;
use drm_fourcc::{DrmFormat, DrmFourcc, DrmModifier};
use tracing::debug;

use super::VkContext;

/// (fourcc, vk format, ignore-alpha, bytes-per-pixel). Mesa drops a format
/// if either its opaque or alpha sibling is missing, so the two are always
/// listed as a pair.
pub const SUPPORTED_DRM_FORMATS: &[(DrmFourcc, vk::Format, bool, usize)] = &[
    (DrmFourcc::Argb8888, vk::Format::B8G8R8A8_UNORM, false, 4),
    (DrmFourcc::Xrgb8888, vk::Format::B8G8R8A8_UNORM, true, 4),
    (DrmFourcc::Abgr8888, vk::Format::R8G8B8A8_UNORM, false, 4),
    (DrmFourcc::Xbgr8888, vk::Format::R8G8B8A8_UNORM, true, 4),
];

pub fn fourcc_to_vk(fourcc: DrmFourcc) -> Option<(vk::Format, bool)> {
    SUPPORTED_DRM_FORMATS
        .iter()
        .find(|(f, ..)| *f == fourcc)
        .map(|(_, vk, ignore_alpha, _)| (*vk, *ignore_alpha))
}

pub fn fourcc_bpp(fourcc: DrmFourcc) -> Option<usize> {
    SUPPORTED_DRM_FORMATS
        .iter()
        .find(|(f, ..)| *f == fourcc)
        .map(|(.., bpp)| *bpp)
}

/// The alpha-carrying fourcc for a Vulkan format we allocate images with,
/// for handing to protocols (`zwp_linux_dmabuf_v1`, `addfb2`) that want a
/// DRM fourcc rather than a Vulkan enum. Picks the non-`ignore_alpha`
/// sibling of the pair in [`SUPPORTED_DRM_FORMATS`].
pub fn vk_to_fourcc(format: vk::Format) -> Option<DrmFourcc> {
    SUPPORTED_DRM_FORMATS
        .iter()
        .find(|(_, vk, ignore_alpha, _)| *vk == format && !ignore_alpha)
        .map(|(fourcc, ..)| *fourcc)
}

/// The per-plane-count-one modifiers the device supports for a given
/// format and usage, queried once at startup and reused for every
/// `image_create_dmabuf`/`image_import_dmabuf` modifier intersection.
pub fn supported_modifiers(
    vk: &VkContext,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
) -> Vec<DrmModifier> {
    unsafe { query_drm_format_modifiers(&vk.instance, vk.device_info.pdevice, format) }
        .into_iter()
        .filter(|props| props.drm_format_modifier_plane_count == 1)
        .map(|props| DrmModifier::from(props.drm_format_modifier))
        .filter(|modifier| verify_dmabuf_support(vk, format, *modifier, usage))
        .collect()
}

/// Intersects the modifiers a client offered with those the device
/// supports for `format`/`usage`. Returns the first mutually supported
/// modifier, or `None` if there is no overlap (caller must then fail the
/// import/allocation per spec §4.1).
pub fn intersect_modifiers(
    vk: &VkContext,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    requested: &[DrmModifier],
) -> Option<DrmModifier> {
    let supported = supported_modifiers(vk, format, usage);
    requested.iter().find(|m| supported.contains(m)).copied()
}

unsafe fn query_drm_format_modifiers(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    format: vk::Format,
) -> Vec<vk::DrmFormatModifierPropertiesEXT> {
    let count = {
        let mut modifiers = vk::DrmFormatModifierPropertiesListEXT::default();
        let mut format_props = vk::FormatProperties2::default().push_next(&mut modifiers);

        instance.get_physical_device_format_properties2(device, format, &mut format_props);
        modifiers.drm_format_modifier_count
    };

    let mut res = vec![vk::DrmFormatModifierPropertiesEXT::default(); count as usize];
    let mut modifiers =
        vk::DrmFormatModifierPropertiesListEXT::default().drm_format_modifier_properties(&mut res);
    let mut format_props = vk::FormatProperties2::default().push_next(&mut modifiers);
    instance.get_physical_device_format_properties2(device, format, &mut format_props);

    res
}

pub fn verify_dmabuf_support(
    vk: &VkContext,
    format: vk::Format,
    modifier: DrmModifier,
    usage: vk::ImageUsageFlags,
) -> bool {
    let mut drm_props = vk::ExternalImageFormatProperties::default();
    let mut props = vk::ImageFormatProperties2::default().push_next(&mut drm_props);

    let mut modifier_info = vk::PhysicalDeviceImageDrmFormatModifierInfoEXT::default()
        .drm_format_modifier(modifier.into());

    let mut external_format_info = vk::PhysicalDeviceExternalImageFormatInfo::default()
        .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

    let format_info = vk::PhysicalDeviceImageFormatInfo2::default()
        .format(format)
        .ty(vk::ImageType::TYPE_2D)
        .usage(usage)
        .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
        .push_next(&mut external_format_info)
        .push_next(&mut modifier_info);

    match unsafe {
        vk.instance
            .get_physical_device_image_format_properties2(vk.device_info.pdevice, &format_info, &mut props)
    } {
        Ok(_) => (),
        Err(_) => {
            debug!(?format, ?modifier, "format not supported for dma import");
            return false;
        }
    }

    drm_props
        .external_memory_properties
        .compatible_handle_types
        .contains(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
}

/// The wire format code `zwp_linux_dmabuf_v1`/`wl_buffer` expect: unlike
/// `wl_shm`, dmabuf's format field is the raw DRM fourcc code, not a
/// distinct enum, so this is just `vk_to_fourcc` cast to its `u32` code.
pub fn fourcc_to_wl(format: vk::Format) -> Result<u32> {
    vk_to_fourcc(format)
        .map(|fourcc| fourcc as u32)
        .ok_or_else(|| anyhow!("no dmabuf fourcc for vulkan format {format:?}"))
}

/// Returns a stand-in `DrmFormat` list entry, used for protocol feedback
/// tables (`zwp_linux_dmabuf_v1`/syncobj advertisement).
pub fn to_drm_format(fourcc: DrmFourcc, modifier: DrmModifier) -> DrmFormat {
    DrmFormat {
        code: fourcc,
        modifier,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argb_and_xrgb_share_vk_format() {
        let (argb, argb_ignore) = fourcc_to_vk(DrmFourcc::Argb8888).unwrap();
        let (xrgb, xrgb_ignore) = fourcc_to_vk(DrmFourcc::Xrgb8888).unwrap();

        assert_eq!(argb, xrgb);
        assert!(!argb_ignore);
        assert!(xrgb_ignore);
    }

    #[test]
    fn unknown_fourcc_is_unsupported() {
        assert!(fourcc_to_vk(DrmFourcc::Nv12).is_none());
        assert!(fourcc_bpp(DrmFourcc::Nv12).is_none());
    }
}
