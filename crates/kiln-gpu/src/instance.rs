//! Vulkan instance ownership and physical device selection.

use crate::error::{GpuError, Result};
use crate::utils;
use ash::vk;
use std::ffi::{CStr, CString};
use std::sync::Arc;

/// Validation layers to enable when requested.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Owns the Vulkan entry point and instance.
///
/// Window-system surface extensions are not added here; callers that need
/// them pass the names through `extensions`.
pub struct Instance {
    // Entry must be kept alive for the lifetime of the instance
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
}

impl Instance {
    /// Create an instance with the given extra extensions.
    ///
    /// Unavailable extensions and layers are dropped with a warning rather
    /// than failing instance creation.
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        extensions: &[&CStr],
    ) -> Result<Arc<Self>> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::InvalidArgument(format!("failed to load Vulkan: {e}")))?;

        let app_name = CString::new(app_name)
            .map_err(|_| GpuError::InvalidArgument("app name contains NUL".to_string()))?;
        let engine_name = c"kiln";

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let available_extensions =
            unsafe { entry.enumerate_instance_extension_properties(None)? };
        let extensions = utils::filter_available_extensions(extensions, &available_extensions);
        let extension_names: Vec<*const std::ffi::c_char> =
            extensions.iter().map(|ext| ext.as_ptr()).collect();

        let requested_layers = if enable_validation {
            validation_layers()
        } else {
            vec![]
        };
        let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
        let layers = utils::filter_available_layers(&requested_layers, &available_layers);
        let layer_names: Vec<*const std::ffi::c_char> =
            layers.iter().map(|l| l.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None)? };

        Ok(Arc::new(Self { entry, instance }))
    }

    /// Get the Vulkan instance handle.
    pub fn handle(&self) -> &ash::Instance {
        &self.instance
    }

    /// Enumerate all physical devices.
    pub fn enumerate_physical_devices(&self) -> Result<Vec<vk::PhysicalDevice>> {
        Ok(unsafe { self.instance.enumerate_physical_devices()? })
    }

    /// Select the best physical device.
    pub fn select_physical_device(&self) -> Result<vk::PhysicalDevice> {
        let devices = self.enumerate_physical_devices()?;
        if devices.is_empty() {
            return Err(GpuError::NoSuitableDevice);
        }

        let mut best_device = None;
        let mut best_score = 0i32;
        for device in devices {
            let score = unsafe { score_physical_device(&self.instance, device) };
            if score > best_score {
                best_score = score;
                best_device = Some(device);
            }
        }

        best_device.ok_or(GpuError::NoSuitableDevice)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            self.instance.destroy_instance(None);
        }
    }
}

/// Score a physical device for selection.
unsafe fn score_physical_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> i32 {
    let properties = unsafe { instance.get_physical_device_properties(device) };

    // Vulkan 1.3 is the floor
    let api_version = properties.api_version;
    if vk::api_version_major(api_version) < 1
        || (vk::api_version_major(api_version) == 1 && vk::api_version_minor(api_version) < 3)
    {
        return -1;
    }

    let mut score = 0;

    // Prefer discrete GPUs
    match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => score += 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => score += 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => score += 50,
        _ => {}
    }

    // Prefer more VRAM
    let memory = unsafe { instance.get_physical_device_memory_properties(device) };
    let vram_mb: u64 = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size / (1024 * 1024))
        .sum();
    score += (vram_mb / 1024) as i32; // +1 per GB

    score
}
