//! Stateless helpers: extension/layer filtering, queue family selection,
//! memory type selection, and format/extent mappings.

use ash::vk;
use std::ffi::CStr;

/// Check whether a device or instance extension is present.
pub fn extension_available(available: &[vk::ExtensionProperties], name: &CStr) -> bool {
    available
        .iter()
        .any(|props| props.extension_name_as_c_str() == Ok(name))
}

/// Check whether an instance layer is present.
pub fn layer_available(available: &[vk::LayerProperties], name: &CStr) -> bool {
    available
        .iter()
        .any(|props| props.layer_name_as_c_str() == Ok(name))
}

/// Keep only the requested extensions that are actually available,
/// logging each one that gets dropped.
pub fn filter_available_extensions<'a>(
    requested: &[&'a CStr],
    available: &[vk::ExtensionProperties],
) -> Vec<&'a CStr> {
    let mut out = Vec::with_capacity(requested.len());
    for &name in requested {
        if extension_available(available, name) {
            out.push(name);
        } else {
            tracing::warn!("Extension {} not available, dropping", name.to_string_lossy());
        }
    }
    out
}

/// Keep only the requested layers that are actually available,
/// logging each one that gets dropped.
pub fn filter_available_layers<'a>(
    requested: &[&'a CStr],
    available: &[vk::LayerProperties],
) -> Vec<&'a CStr> {
    let mut out = Vec::with_capacity(requested.len());
    for &name in requested {
        if layer_available(available, name) {
            out.push(name);
        } else {
            tracing::warn!("Layer {} not available, dropping", name.to_string_lossy());
        }
    }
    out
}

/// Find a queue family supporting all of `flags`, skipping families listed
/// in `ignore`.
///
/// Among the candidates the family with the fewest total capability bits
/// wins, so a dedicated transfer family beats the do-everything graphics
/// family when plain `TRANSFER` is requested.
pub fn find_queue_family_index(
    families: &[vk::QueueFamilyProperties],
    flags: vk::QueueFlags,
    ignore: &[u32],
) -> Option<u32> {
    let mut best: Option<(u32, u32)> = None;
    for (i, family) in families.iter().enumerate() {
        let i = i as u32;
        if ignore.contains(&i) {
            continue;
        }
        if !family.queue_flags.contains(flags) {
            continue;
        }
        let score = family.queue_flags.as_raw().count_ones();
        match best {
            Some((_, best_score)) if score >= best_score => {}
            _ => best = Some((i, score)),
        }
    }
    best.map(|(i, _)| i)
}

/// Find the first memory type allowed by `requirements` whose property
/// flags are a superset of `flags`.
///
/// First match wins; Vulkan orders memory types so that earlier types are
/// preferable when multiple match.
pub fn find_memory_type_index(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    requirements: &vk::MemoryRequirements,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        requirements.memory_type_bits & (1 << i) != 0
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(flags)
    })
}

/// Derive the image dimensionality from a raw extent.
///
/// A zero depth/height means "this axis does not exist", so {w, h, 0} is a
/// 2D image and {w, 0, 0} a 1D one.
pub fn extent_to_image_type(extent: vk::Extent3D) -> vk::ImageType {
    if extent.depth > 0 {
        vk::ImageType::TYPE_3D
    } else if extent.height > 0 {
        vk::ImageType::TYPE_2D
    } else {
        vk::ImageType::TYPE_1D
    }
}

/// Derive the image view dimensionality from a raw extent.
pub fn extent_to_image_view_type(extent: vk::Extent3D) -> vk::ImageViewType {
    if extent.depth > 0 {
        vk::ImageViewType::TYPE_3D
    } else if extent.height > 0 {
        vk::ImageViewType::TYPE_2D
    } else {
        vk::ImageViewType::TYPE_1D
    }
}

/// Bytes per texel for the uncompressed single-plane formats this layer
/// works with; compressed and multi-plane formats return `None`.
pub fn format_texel_size(format: vk::Format) -> Option<u32> {
    match format {
        vk::Format::R8_UNORM
        | vk::Format::R8_SNORM
        | vk::Format::R8_UINT
        | vk::Format::R8_SINT
        | vk::Format::S8_UINT => Some(1),
        vk::Format::R8G8_UNORM
        | vk::Format::R8G8_SNORM
        | vk::Format::R8G8_UINT
        | vk::Format::R8G8_SINT
        | vk::Format::R16_SFLOAT
        | vk::Format::R16_UNORM
        | vk::Format::R16_UINT
        | vk::Format::R16_SINT
        | vk::Format::D16_UNORM => Some(2),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SNORM
        | vk::Format::R8G8B8A8_UINT
        | vk::Format::R8G8B8A8_SINT
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::B10G11R11_UFLOAT_PACK32
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R16G16_UNORM
        | vk::Format::R16G16_UINT
        | vk::Format::R16G16_SINT
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::R32_SINT
        | vk::Format::D32_SFLOAT => Some(4),
        vk::Format::R16G16B16_SFLOAT => Some(6),
        vk::Format::R16G16B16A16_SFLOAT
        | vk::Format::R16G16B16A16_UNORM
        | vk::Format::R16G16B16A16_UINT
        | vk::Format::R16G16B16A16_SINT
        | vk::Format::R32G32_SFLOAT
        | vk::Format::R32G32_UINT
        | vk::Format::R32G32_SINT => Some(8),
        vk::Format::R32G32B32_SFLOAT | vk::Format::R32G32B32_UINT | vk::Format::R32G32B32_SINT => {
            Some(12)
        }
        vk::Format::R32G32B32A32_SFLOAT
        | vk::Format::R32G32B32A32_UINT
        | vk::Format::R32G32B32A32_SINT => Some(16),
        _ => None,
    }
}

/// Map a format to the aspect mask its subresources use.
pub fn format_to_aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT => vk::ImageAspectFlags::DEPTH,
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[(vk::MemoryPropertyFlags, u32)]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, &(flags, heap)) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: flags,
                heap_index: heap,
            };
        }
        props
    }

    #[test]
    fn memory_type_first_match_wins() {
        let device_local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let props = memory_properties(&[
            (vk::MemoryPropertyFlags::HOST_VISIBLE, 1),
            (device_local, 0),
            (device_local, 0),
        ]);
        // type bits 0b0110: types 1 and 2 allowed, both device local
        let requirements = vk::MemoryRequirements {
            size: 1024,
            alignment: 256,
            memory_type_bits: 0b0110,
        };
        assert_eq!(
            find_memory_type_index(&props, &requirements, device_local),
            Some(1)
        );
    }

    #[test]
    fn memory_type_requires_flag_superset() {
        let props = memory_properties(&[
            (vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
            (
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                1,
            ),
        ]);
        let requirements = vk::MemoryRequirements {
            size: 64,
            alignment: 64,
            memory_type_bits: 0b11,
        };
        assert_eq!(
            find_memory_type_index(
                &props,
                &requirements,
                vk::MemoryPropertyFlags::HOST_VISIBLE
            ),
            Some(1)
        );
        assert_eq!(
            find_memory_type_index(
                &props,
                &requirements,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED
            ),
            None
        );
    }

    #[test]
    fn memory_type_respects_type_bits() {
        let props = memory_properties(&[(vk::MemoryPropertyFlags::DEVICE_LOCAL, 0)]);
        let requirements = vk::MemoryRequirements {
            size: 64,
            alignment: 64,
            memory_type_bits: 0b10,
        };
        assert_eq!(
            find_memory_type_index(&props, &requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            None
        );
    }

    #[test]
    fn queue_family_prefers_dedicated() {
        let families = [
            vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::GRAPHICS
                    | vk::QueueFlags::COMPUTE
                    | vk::QueueFlags::TRANSFER,
                queue_count: 1,
                ..Default::default()
            },
            vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::TRANSFER,
                queue_count: 2,
                ..Default::default()
            },
        ];
        assert_eq!(
            find_queue_family_index(&families, vk::QueueFlags::TRANSFER, &[]),
            Some(1)
        );
        assert_eq!(
            find_queue_family_index(&families, vk::QueueFlags::GRAPHICS, &[]),
            Some(0)
        );
        assert_eq!(
            find_queue_family_index(&families, vk::QueueFlags::TRANSFER, &[1]),
            Some(0)
        );
        assert_eq!(
            find_queue_family_index(&families, vk::QueueFlags::SPARSE_BINDING, &[]),
            None
        );
    }

    #[test]
    fn queue_family_tie_goes_to_lower_index() {
        // Both families carry two capability bits; the earlier one wins.
        let families = [
            vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                queue_count: 1,
                ..Default::default()
            },
            vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER,
                queue_count: 1,
                ..Default::default()
            },
        ];
        assert_eq!(
            find_queue_family_index(&families, vk::QueueFlags::TRANSFER, &[]),
            Some(0)
        );
        // Ignoring the winner falls through to the tied runner-up.
        assert_eq!(
            find_queue_family_index(&families, vk::QueueFlags::TRANSFER, &[0]),
            Some(1)
        );
    }

    #[test]
    fn extent_dimensionality() {
        let e = |w, h, d| vk::Extent3D {
            width: w,
            height: h,
            depth: d,
        };
        assert_eq!(extent_to_image_type(e(10, 10, 10)), vk::ImageType::TYPE_3D);
        assert_eq!(extent_to_image_type(e(10, 10, 0)), vk::ImageType::TYPE_2D);
        assert_eq!(extent_to_image_type(e(10, 0, 0)), vk::ImageType::TYPE_1D);
        assert_eq!(
            extent_to_image_view_type(e(10, 0, 0)),
            vk::ImageViewType::TYPE_1D
        );
    }

    #[test]
    fn texel_sizes() {
        assert_eq!(format_texel_size(vk::Format::R8_UNORM), Some(1));
        assert_eq!(format_texel_size(vk::Format::D16_UNORM), Some(2));
        assert_eq!(format_texel_size(vk::Format::R8G8B8A8_UNORM), Some(4));
        assert_eq!(format_texel_size(vk::Format::R16G16B16A16_SFLOAT), Some(8));
        assert_eq!(format_texel_size(vk::Format::R32G32B32A32_SFLOAT), Some(16));
        assert_eq!(format_texel_size(vk::Format::BC1_RGB_UNORM_BLOCK), None);
    }

    #[test]
    fn aspect_masks() {
        assert_eq!(
            format_to_aspect_mask(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            format_to_aspect_mask(vk::Format::S8_UINT),
            vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            format_to_aspect_mask(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            format_to_aspect_mask(vk::Format::R8G8B8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
    }
}
