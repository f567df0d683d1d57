//! Logical device creation, cached physical-device properties, and queues.

use crate::error::{GpuError, Result};
use crate::instance::Instance;
use crate::utils;
use ash::vk;
use std::collections::BTreeMap;
use std::ffi::CStr;
use std::sync::Arc;

/// Optional device features toggled at device creation.
///
/// This is the recognized-options view of the Vulkan feature chain; the
/// actual `pNext` chain of feature structs is assembled from it at the
/// `vkCreateDevice` boundary.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceFeatures {
    pub acceleration_structure: bool,
    pub ray_tracing_pipeline: bool,
    pub ray_query: bool,
    pub shader_object: bool,
    pub host_image_copy: bool,
    pub descriptor_buffer: bool,
}

/// Subgroup properties mirrored out of the property chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubgroupProperties {
    pub subgroup_size: u32,
    pub supported_stages: vk::ShaderStageFlags,
    pub supported_operations: vk::SubgroupFeatureFlags,
}

/// Ray tracing pipeline properties mirrored out of the property chain.
///
/// The three alignment fields drive the shader binding table layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct RayTracingPipelineProperties {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
}

/// Acceleration structure properties mirrored out of the property chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccelerationStructureProperties {
    pub max_geometry_count: u64,
    pub max_instance_count: u64,
    pub max_primitive_count: u64,
    pub min_scratch_offset_alignment: u32,
}

/// Descriptor buffer properties mirrored out of the property chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct DescriptorBufferProperties {
    pub descriptor_buffer_offset_alignment: u64,
    pub max_descriptor_buffer_bindings: u32,
    pub max_resource_descriptor_buffer_range: u64,
}

/// A device queue with blocking submit conveniences.
///
/// The `*_and_wait_idle` variants drain the whole queue before returning;
/// they are meant for setup/teardown paths, not per-frame work.
pub struct Queue {
    queue: vk::Queue,
    device: ash::Device,
}

impl Queue {
    /// Get the raw queue handle.
    pub fn raw(&self) -> vk::Queue {
        self.queue
    }

    /// Submit work to the queue.
    pub fn submit(&self, submits: &[vk::SubmitInfo<'_>], fence: vk::Fence) -> Result<()> {
        unsafe { self.device.queue_submit(self.queue, submits, fence)? };
        Ok(())
    }

    /// Submit work to the queue using the synchronization2 path.
    pub fn submit2(&self, submits: &[vk::SubmitInfo2<'_>], fence: vk::Fence) -> Result<()> {
        unsafe { self.device.queue_submit2(self.queue, submits, fence)? };
        Ok(())
    }

    /// Block until the queue drains.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.queue_wait_idle(self.queue)? };
        Ok(())
    }

    /// Submit and block until the queue drains.
    pub fn submit_and_wait_idle(
        &self,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<()> {
        self.submit(submits, fence)?;
        self.wait_idle()
    }

    /// Submit via synchronization2 and block until the queue drains.
    pub fn submit2_and_wait_idle(
        &self,
        submits: &[vk::SubmitInfo2<'_>],
        fence: vk::Fence,
    ) -> Result<()> {
        self.submit2(submits, fence)?;
        self.wait_idle()
    }
}

/// Logical device plus everything queried once at creation: property
/// mirrors, the memory type table, the queue table, and extension loaders.
///
/// Resources hold an `Arc<Device>`, so the device outlives every object
/// constructed from it.
pub struct Device {
    instance: Arc<Instance>,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,

    properties: vk::PhysicalDeviceProperties,
    subgroup_properties: SubgroupProperties,
    ray_tracing_pipeline_properties: RayTracingPipelineProperties,
    acceleration_structure_properties: AccelerationStructureProperties,
    descriptor_buffer_properties: DescriptorBufferProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    features: DeviceFeatures,

    // queues[family][index], one row per physical queue family
    queues: Vec<Vec<Queue>>,

    acceleration_structure_loader: ash::khr::acceleration_structure::Device,
    ray_tracing_pipeline_loader: ash::khr::ray_tracing_pipeline::Device,
    shader_object_loader: ash::ext::shader_object::Device,
    host_image_copy_loader: ash::ext::host_image_copy::Device,
}

impl Device {
    /// Create a logical device.
    ///
    /// `queue_counts` maps queue family index to the number of queues to
    /// create for that family; it must be non-empty and must stay within
    /// what each family exposes. `extensions` are enabled verbatim;
    /// `features` selects the feature structs chained into device creation.
    pub fn new(
        instance: &Arc<Instance>,
        physical_device: vk::PhysicalDevice,
        extensions: &[&CStr],
        queue_counts: &BTreeMap<u32, u32>,
        features: DeviceFeatures,
    ) -> Result<Arc<Self>> {
        if queue_counts.is_empty() {
            return Err(GpuError::InvalidArgument(
                "no queue families requested".to_string(),
            ));
        }

        let raw_instance = instance.handle();
        let family_properties = unsafe {
            raw_instance.get_physical_device_queue_family_properties(physical_device)
        };
        for (&family, &count) in queue_counts {
            let available = family_properties
                .get(family as usize)
                .map(|f| f.queue_count)
                .ok_or_else(|| {
                    GpuError::InvalidArgument(format!("queue family {family} does not exist"))
                })?;
            if count == 0 || count > available {
                return Err(GpuError::InvalidArgument(format!(
                    "queue family {family} supports {available} queues, {count} requested"
                )));
            }
        }

        let properties = unsafe { raw_instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { raw_instance.get_physical_device_memory_properties(physical_device) };

        // Property chain, mirrored into plain structs so nothing here
        // carries dangling pNext pointers around.
        let mut subgroup = vk::PhysicalDeviceSubgroupProperties::default();
        let mut ray_tracing = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut acceleration = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut descriptor_buffer = vk::PhysicalDeviceDescriptorBufferPropertiesEXT::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut subgroup)
            .push_next(&mut ray_tracing)
            .push_next(&mut acceleration)
            .push_next(&mut descriptor_buffer);
        unsafe {
            raw_instance.get_physical_device_properties2(physical_device, &mut properties2);
        }

        let subgroup_properties = SubgroupProperties {
            subgroup_size: subgroup.subgroup_size,
            supported_stages: subgroup.supported_stages,
            supported_operations: subgroup.supported_operations,
        };
        let ray_tracing_pipeline_properties = RayTracingPipelineProperties {
            shader_group_handle_size: ray_tracing.shader_group_handle_size,
            shader_group_handle_alignment: ray_tracing.shader_group_handle_alignment,
            shader_group_base_alignment: ray_tracing.shader_group_base_alignment,
            max_ray_recursion_depth: ray_tracing.max_ray_recursion_depth,
        };
        let acceleration_structure_properties = AccelerationStructureProperties {
            max_geometry_count: acceleration.max_geometry_count,
            max_instance_count: acceleration.max_instance_count,
            max_primitive_count: acceleration.max_primitive_count,
            min_scratch_offset_alignment: acceleration
                .min_acceleration_structure_scratch_offset_alignment,
        };
        let descriptor_buffer_properties = DescriptorBufferProperties {
            descriptor_buffer_offset_alignment: descriptor_buffer
                .descriptor_buffer_offset_alignment,
            max_descriptor_buffer_bindings: descriptor_buffer.max_descriptor_buffer_bindings,
            max_resource_descriptor_buffer_range: descriptor_buffer
                .max_resource_descriptor_buffer_range,
        };

        // One priority entry per queue; Vulkan reads queue_count floats.
        let priority_storage: Vec<Vec<f32>> = queue_counts
            .values()
            .map(|&count| vec![1.0_f32; count as usize])
            .collect();
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = queue_counts
            .keys()
            .zip(priority_storage.iter())
            .map(|(&family, priorities)| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(priorities)
            })
            .collect();

        let extension_names: Vec<*const std::ffi::c_char> =
            extensions.iter().map(|ext| ext.as_ptr()).collect();

        // Baseline Vulkan 1.2/1.3 features plus the requested extension
        // feature structs, chained the way the runtime expects.
        let base_features = vk::PhysicalDeviceFeatures::default();
        let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_variable_descriptor_count(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .scalar_block_layout(true);
        let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(true)
            .dynamic_rendering(true)
            .maintenance4(true);

        let mut acceleration_structure_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
                .acceleration_structure(true);
        let mut ray_tracing_pipeline_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);
        let mut ray_query_features =
            vk::PhysicalDeviceRayQueryFeaturesKHR::default().ray_query(true);
        let mut shader_object_features =
            vk::PhysicalDeviceShaderObjectFeaturesEXT::default().shader_object(true);
        let mut host_image_copy_features =
            vk::PhysicalDeviceHostImageCopyFeaturesEXT::default().host_image_copy(true);
        let mut descriptor_buffer_features =
            vk::PhysicalDeviceDescriptorBufferFeaturesEXT::default().descriptor_buffer(true);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .features(base_features)
            .push_next(&mut vulkan_1_2_features)
            .push_next(&mut vulkan_1_3_features);
        if features.acceleration_structure {
            features2 = features2.push_next(&mut acceleration_structure_features);
        }
        if features.ray_tracing_pipeline {
            features2 = features2.push_next(&mut ray_tracing_pipeline_features);
        }
        if features.ray_query {
            features2 = features2.push_next(&mut ray_query_features);
        }
        if features.shader_object {
            features2 = features2.push_next(&mut shader_object_features);
        }
        if features.host_image_copy {
            features2 = features2.push_next(&mut host_image_copy_features);
        }
        if features.descriptor_buffer {
            features2 = features2.push_next(&mut descriptor_buffer_features);
        }

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .push_next(&mut features2);

        let device = unsafe {
            raw_instance.create_device(physical_device, &device_create_info, None)?
        };

        tracing::info!(
            device = %device_name(&properties),
            extensions = extensions.len(),
            "created logical device"
        );

        // Eager queue table: one row per physical family, filled only for
        // the requested ones, so lookups are O(1) afterwards.
        let mut queues: Vec<Vec<Queue>> = (0..family_properties.len())
            .map(|_| Vec::new())
            .collect();
        for (&family, &count) in queue_counts {
            queues[family as usize] = (0..count)
                .map(|index| Queue {
                    queue: unsafe { device.get_device_queue(family, index) },
                    device: device.clone(),
                })
                .collect();
        }

        let acceleration_structure_loader =
            ash::khr::acceleration_structure::Device::new(raw_instance, &device);
        let ray_tracing_pipeline_loader =
            ash::khr::ray_tracing_pipeline::Device::new(raw_instance, &device);
        let shader_object_loader = ash::ext::shader_object::Device::new(raw_instance, &device);
        let host_image_copy_loader =
            ash::ext::host_image_copy::Device::new(raw_instance, &device);

        Ok(Arc::new(Self {
            instance: instance.clone(),
            physical_device,
            device,
            properties,
            subgroup_properties,
            ray_tracing_pipeline_properties,
            acceleration_structure_properties,
            descriptor_buffer_properties,
            memory_properties,
            features,
            queues,
            acceleration_structure_loader,
            ray_tracing_pipeline_loader,
            shader_object_loader,
            host_image_copy_loader,
        }))
    }

    /// Get the Vulkan device handle.
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    /// Get the owning instance.
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the base physical-device properties.
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    /// Get the subgroup properties.
    pub fn subgroup_properties(&self) -> &SubgroupProperties {
        &self.subgroup_properties
    }

    /// Get the ray tracing pipeline properties.
    pub fn ray_tracing_pipeline_properties(&self) -> &RayTracingPipelineProperties {
        &self.ray_tracing_pipeline_properties
    }

    /// Get the acceleration structure properties.
    pub fn acceleration_structure_properties(&self) -> &AccelerationStructureProperties {
        &self.acceleration_structure_properties
    }

    /// Get the descriptor buffer properties.
    pub fn descriptor_buffer_properties(&self) -> &DescriptorBufferProperties {
        &self.descriptor_buffer_properties
    }

    /// Get the physical-device memory properties.
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// Get the features this device was created with.
    pub fn features(&self) -> DeviceFeatures {
        self.features
    }

    /// Look up a queue created at device construction.
    pub fn queue(&self, family: u32, index: u32) -> Result<&Queue> {
        let row = self.queues.get(family as usize).ok_or_else(|| {
            GpuError::OutOfRange(format!("queue family {family}"))
        })?;
        row.get(index as usize).ok_or_else(|| {
            GpuError::OutOfRange(format!("queue {index} in family {family}"))
        })
    }

    /// Find the first memory type matching the requirements and flags.
    pub fn find_memory_type_index(
        &self,
        requirements: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        utils::find_memory_type_index(&self.memory_properties, requirements, flags)
    }

    /// Probe whether a format/usage/tiling combination is supported.
    ///
    /// An unsupported combination is a normal negative result, not an
    /// error; any other runtime failure propagates.
    pub fn image_format_supported(
        &self,
        format: vk::Format,
        ty: vk::ImageType,
        tiling: vk::ImageTiling,
        usage: vk::ImageUsageFlags,
        flags: vk::ImageCreateFlags,
    ) -> Result<bool> {
        let result = unsafe {
            self.instance
                .handle()
                .get_physical_device_image_format_properties(
                    self.physical_device,
                    format,
                    ty,
                    tiling,
                    usage,
                    flags,
                )
        };
        match result {
            Ok(_) => Ok(true),
            Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Block until the whole device is idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    /// Get the acceleration structure extension fn table.
    pub fn acceleration_structure_loader(&self) -> &ash::khr::acceleration_structure::Device {
        &self.acceleration_structure_loader
    }

    /// Get the ray tracing pipeline extension fn table.
    pub fn ray_tracing_pipeline_loader(&self) -> &ash::khr::ray_tracing_pipeline::Device {
        &self.ray_tracing_pipeline_loader
    }

    /// Get the shader object extension fn table.
    pub fn shader_object_loader(&self) -> &ash::ext::shader_object::Device {
        &self.shader_object_loader
    }

    /// Get the host image copy extension fn table.
    pub fn host_image_copy_loader(&self) -> &ash::ext::host_image_copy::Device {
        &self.host_image_copy_loader
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

fn device_name(properties: &vk::PhysicalDeviceProperties) -> String {
    properties
        .device_name_as_c_str()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}
