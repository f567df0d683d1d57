//! Memory-backed image resource with host-side layout tracking.

use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::utils;
use ash::vk;
use std::sync::Arc;

/// An image plus its view and raw device-memory allocation.
///
/// The current layout is tracked host-side and mutated only by
/// [`Image::transition_layout`]; a layout changed through a command-buffer
/// barrier diverges from the tracked value, and it is the caller's job to
/// re-transition through this API before using the host copy paths again.
pub struct Image {
    device: Arc<Device>,
    image: vk::Image,
    view: vk::ImageView,
    memory: vk::DeviceMemory,
    format: vk::Format,
    aspect_mask: vk::ImageAspectFlags,
    layout: vk::ImageLayout,
    extent: vk::Extent3D,
    tiling: vk::ImageTiling,
    usage: vk::ImageUsageFlags,
    memory_property_flags: vk::MemoryPropertyFlags,
}

impl Image {
    /// Create an image, its memory, and a full-subresource view.
    ///
    /// Dimensionality is derived from the extent: zero depth means 2D, zero
    /// depth and height means 1D. Requires a device created with the
    /// `host_image_copy` feature for the transition/copy operations.
    pub fn new(
        device: Arc<Device>,
        extent: vk::Extent3D,
        format: vk::Format,
        tiling: vk::ImageTiling,
        usage: vk::ImageUsageFlags,
        memory_property_flags: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        if extent.width == 0 {
            return Err(GpuError::InvalidArgument(
                "image width must be non-zero".to_string(),
            ));
        }
        let mut image = Self {
            device,
            image: vk::Image::null(),
            view: vk::ImageView::null(),
            memory: vk::DeviceMemory::null(),
            format,
            aspect_mask: utils::format_to_aspect_mask(format),
            layout: vk::ImageLayout::UNDEFINED,
            extent: vk::Extent3D::default(),
            tiling,
            usage,
            memory_property_flags,
        };
        image.recreate(extent)?;
        Ok(image)
    }

    /// Recreate image, view, and memory at a new extent.
    ///
    /// The tracked layout resets to `UNDEFINED`; contents are not preserved.
    pub fn resize(&mut self, extent: vk::Extent3D) -> Result<()> {
        self.destroy_handles();
        self.recreate(extent)
    }

    fn recreate(&mut self, extent: vk::Extent3D) -> Result<()> {
        let raw = self.device.handle();

        // Dimensionality comes from the raw extent, before the zero axes
        // are clamped for the create info.
        let image_type = utils::extent_to_image_type(extent);
        let view_type = utils::extent_to_image_view_type(extent);
        let extent = vk::Extent3D {
            width: extent.width,
            height: extent.height.max(1),
            depth: extent.depth.max(1),
        };

        let create_info = vk::ImageCreateInfo::default()
            .image_type(image_type)
            .format(self.format)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(self.tiling)
            .usage(self.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { raw.create_image(&create_info, None)? };

        let requirements = unsafe { raw.get_image_memory_requirements(image) };
        let Some(memory_type_index) = self
            .device
            .find_memory_type_index(&requirements, self.memory_property_flags)
        else {
            unsafe { raw.destroy_image(image, None) };
            return Err(GpuError::ResourceExhausted(format!(
                "no memory type for image with flags {:?}",
                self.memory_property_flags
            )));
        };

        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        let memory = match unsafe { raw.allocate_memory(&allocate_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { raw.destroy_image(image, None) };
                return Err(e.into());
            }
        };
        if let Err(e) = unsafe { raw.bind_image_memory(image, memory, 0) } {
            unsafe {
                raw.destroy_image(image, None);
                raw.free_memory(memory, None);
            }
            return Err(e.into());
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type)
            .format(self.format)
            .subresource_range(self.subresource_range());
        let view = match unsafe { raw.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                unsafe {
                    raw.destroy_image(image, None);
                    raw.free_memory(memory, None);
                }
                return Err(e.into());
            }
        };

        self.image = image;
        self.view = view;
        self.memory = memory;
        self.extent = extent;
        self.layout = vk::ImageLayout::UNDEFINED;
        Ok(())
    }

    fn destroy_handles(&mut self) {
        let raw = self.device.handle();
        unsafe {
            if self.view != vk::ImageView::null() {
                raw.destroy_image_view(self.view, None);
                self.view = vk::ImageView::null();
            }
            if self.image != vk::Image::null() {
                raw.destroy_image(self.image, None);
                self.image = vk::Image::null();
            }
            if self.memory != vk::DeviceMemory::null() {
                raw.free_memory(self.memory, None);
                self.memory = vk::DeviceMemory::null();
            }
        }
        self.layout = vk::ImageLayout::UNDEFINED;
    }

    fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect_mask,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    fn subresource_layers(&self) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers {
            aspect_mask: self.aspect_mask,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    /// Transition from the tracked layout to `new_layout` on the host.
    pub fn transition_layout(&mut self, new_layout: vk::ImageLayout) -> Result<()> {
        let transition = vk::HostImageLayoutTransitionInfoEXT::default()
            .image(self.image)
            .old_layout(self.layout)
            .new_layout(new_layout)
            .subresource_range(self.subresource_range());
        unsafe {
            self.device
                .host_image_copy_loader()
                .transition_image_layout(std::slice::from_ref(&transition))?;
        }
        self.layout = new_layout;
        Ok(())
    }

    /// Copy tightly packed host memory into the whole image.
    ///
    /// Issued against the tracked layout; `data` must cover the full extent
    /// at the image's texel size, checked before anything is handed to the
    /// runtime.
    pub fn copy_memory_to_image(&self, data: &[u8]) -> Result<()> {
        let required = required_copy_bytes(self.format, self.extent)?;
        if data.len() < required {
            return Err(GpuError::InvalidArgument(format!(
                "image copy needs {required} bytes, slice has {}",
                data.len()
            )));
        }
        let region = vk::MemoryToImageCopyEXT::default()
            .host_pointer(data.as_ptr().cast())
            .image_subresource(self.subresource_layers())
            .image_extent(self.extent);
        let info = vk::CopyMemoryToImageInfoEXT::default()
            .dst_image(self.image)
            .dst_image_layout(self.layout)
            .regions(std::slice::from_ref(&region));
        unsafe {
            self.device
                .host_image_copy_loader()
                .copy_memory_to_image(&info)?;
        }
        Ok(())
    }

    /// Copy the whole image into tightly packed host memory.
    ///
    /// `out` must cover the full extent at the image's texel size.
    pub fn copy_image_to_memory(&self, out: &mut [u8]) -> Result<()> {
        let required = required_copy_bytes(self.format, self.extent)?;
        if out.len() < required {
            return Err(GpuError::InvalidArgument(format!(
                "image copy needs {required} bytes, slice has {}",
                out.len()
            )));
        }
        let region = vk::ImageToMemoryCopyEXT::default()
            .host_pointer(out.as_mut_ptr().cast())
            .image_subresource(self.subresource_layers())
            .image_extent(self.extent);
        let info = vk::CopyImageToMemoryInfoEXT::default()
            .src_image(self.image)
            .src_image_layout(self.layout)
            .regions(std::slice::from_ref(&region));
        unsafe {
            self.device
                .host_image_copy_loader()
                .copy_image_to_memory(&info)?;
        }
        Ok(())
    }

    /// Get the raw image handle.
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// Get the image view.
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Get the format.
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Get the aspect mask derived from the format.
    pub fn aspect_mask(&self) -> vk::ImageAspectFlags {
        self.aspect_mask
    }

    /// Get the tracked layout.
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    /// Get the extent (zero axes clamped to 1).
    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    /// Get the owning device.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        self.destroy_handles();
    }
}

/// Bytes needed to cover `extent` with tightly packed texels of `format`.
fn required_copy_bytes(format: vk::Format, extent: vk::Extent3D) -> Result<usize> {
    let texel = utils::format_texel_size(format).ok_or_else(|| {
        GpuError::Unsupported(format!("no known texel size for format {format:?}"))
    })?;
    Ok(texel as usize * extent.width as usize * extent.height as usize * extent.depth as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(width: u32, height: u32, depth: u32) -> vk::Extent3D {
        vk::Extent3D {
            width,
            height,
            depth,
        }
    }

    #[test]
    fn copy_size_covers_full_extent() {
        let size = required_copy_bytes(vk::Format::R8G8B8A8_UNORM, extent(256, 256, 1)).unwrap();
        assert_eq!(size, 256 * 256 * 4);

        let volume = required_copy_bytes(vk::Format::R32_SFLOAT, extent(8, 8, 8)).unwrap();
        assert_eq!(volume, 8 * 8 * 8 * 4);
    }

    #[test]
    fn copy_size_rejects_unknown_texel_layout() {
        assert!(matches!(
            required_copy_bytes(vk::Format::BC7_UNORM_BLOCK, extent(16, 16, 1)),
            Err(GpuError::Unsupported(_))
        ));
    }
}
