//! Pipeline-less shader objects and specialization constants.

use crate::device::Device;
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::CString;
use std::sync::Arc;

/// Specialization constant data for shader creation.
///
/// The backing blob is sized to the furthest byte any map entry reaches, so
/// callers may pass a larger scratch buffer and only the referenced span is
/// kept.
pub struct ShaderSpecialization {
    entries: Vec<vk::SpecializationMapEntry>,
    data: Vec<u8>,
}

impl ShaderSpecialization {
    pub fn new(entries: Vec<vk::SpecializationMapEntry>, data: &[u8]) -> Result<Self> {
        let size = entries
            .iter()
            .map(|e| e.offset as usize + e.size)
            .max()
            .unwrap_or(0);
        if data.len() < size {
            return Err(GpuError::InvalidArgument(format!(
                "specialization data is {} bytes but entries reach {size}",
                data.len()
            )));
        }
        Ok(Self {
            entries,
            data: data[..size].to_vec(),
        })
    }

    pub fn info(&self) -> vk::SpecializationInfo<'_> {
        vk::SpecializationInfo::default()
            .map_entries(&self.entries)
            .data(&self.data)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// One shader stage: its stage bit, SPIR-V words, and entry point.
pub struct ShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub code: Vec<u32>,
    pub entry_point: CString,
}

impl ShaderStage {
    pub fn new(stage: vk::ShaderStageFlags, code: Vec<u32>, entry_point: &str) -> Result<Self> {
        let entry_point = CString::new(entry_point)
            .map_err(|_| GpuError::InvalidArgument("entry point contains NUL".to_string()))?;
        Ok(Self {
            stage,
            code,
            entry_point,
        })
    }
}

/// Linked shader-object stages sharing one pipeline layout.
///
/// With more than one stage the stages are created linked, each carrying a
/// next-stage hint, so they can be bound together without a monolithic
/// pipeline.
pub struct ShaderObject {
    device: Arc<Device>,
    shaders: Vec<vk::ShaderEXT>,
    stage_flags: Vec<vk::ShaderStageFlags>,
    pipeline_layout: vk::PipelineLayout,
}

impl ShaderObject {
    pub fn new(
        device: Arc<Device>,
        stages: Vec<ShaderStage>,
        push_constant_ranges: &[vk::PushConstantRange],
        specialization: Option<&ShaderSpecialization>,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Self> {
        if stages.is_empty() {
            return Err(GpuError::InvalidArgument(
                "shader object needs at least one stage".to_string(),
            ));
        }

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);
        let pipeline_layout =
            unsafe { device.handle().create_pipeline_layout(&layout_info, None)? };

        let flags = if stages.len() > 1 {
            vk::ShaderCreateFlagsEXT::LINK_STAGE
        } else {
            vk::ShaderCreateFlagsEXT::empty()
        };
        let spec_info = specialization.map(ShaderSpecialization::info);

        let mut create_infos = Vec::with_capacity(stages.len());
        for (i, stage) in stages.iter().enumerate() {
            let mut info = vk::ShaderCreateInfoEXT::default()
                .flags(flags)
                .stage(stage.stage)
                .code_type(vk::ShaderCodeTypeEXT::SPIRV)
                .code(bytemuck::cast_slice(&stage.code))
                .name(&stage.entry_point)
                .set_layouts(set_layouts)
                .push_constant_ranges(push_constant_ranges);
            if let Some(spec) = &spec_info {
                info = info.specialization_info(spec);
            }
            if let Some(next) = stages.get(i + 1) {
                info = info.next_stage(next.stage);
            }
            create_infos.push(info);
        }

        let shaders = match unsafe {
            device
                .shader_object_loader()
                .create_shaders(&create_infos, None)
        } {
            Ok(shaders) => shaders,
            Err((partial, e)) => {
                unsafe {
                    for shader in partial {
                        if shader != vk::ShaderEXT::null() {
                            device.shader_object_loader().destroy_shader(shader, None);
                        }
                    }
                    device.handle().destroy_pipeline_layout(pipeline_layout, None);
                }
                return Err(e.into());
            }
        };

        let stage_flags = stages.iter().map(|s| s.stage).collect();
        Ok(Self {
            device,
            shaders,
            stage_flags,
            pipeline_layout,
        })
    }

    /// Bind all stages on a command buffer.
    ///
    /// # Safety
    /// The command buffer must be in the recording state and belong to this
    /// device.
    pub unsafe fn bind(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device.shader_object_loader().cmd_bind_shaders(
                command_buffer,
                &self.stage_flags,
                &self.shaders,
            );
        }
    }

    pub fn shaders(&self) -> &[vk::ShaderEXT] {
        &self.shaders
    }

    pub fn stages(&self) -> &[vk::ShaderStageFlags] {
        &self.stage_flags
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for ShaderObject {
    fn drop(&mut self) {
        unsafe {
            for &shader in &self.shaders {
                self.device.shader_object_loader().destroy_shader(shader, None);
            }
            self.device
                .handle()
                .destroy_pipeline_layout(self.pipeline_layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specialization_sizes_to_furthest_entry() {
        let entries = vec![
            vk::SpecializationMapEntry {
                constant_id: 0,
                offset: 0,
                size: 4,
            },
            vk::SpecializationMapEntry {
                constant_id: 1,
                offset: 4,
                size: 8,
            },
        ];
        let data = [0u8; 16];
        let spec = ShaderSpecialization::new(entries, &data).unwrap();
        assert_eq!(spec.data().len(), 12);
    }

    #[test]
    fn specialization_rejects_short_data() {
        let entries = vec![vk::SpecializationMapEntry {
            constant_id: 0,
            offset: 8,
            size: 4,
        }];
        let data = [0u8; 8];
        assert!(matches!(
            ShaderSpecialization::new(entries, &data),
            Err(GpuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn specialization_without_entries_is_empty() {
        let spec = ShaderSpecialization::new(vec![], &[1, 2, 3]).unwrap();
        assert!(spec.data().is_empty());
        assert_eq!(spec.info().data_size, 0);
    }
}
