//! Shader binding table layout and storage.
//!
//! The table is a single buffer holding four ordered regions: ray
//! generation, miss, hit, callable. Ray-generation entries each occupy a
//! full base-aligned block because their region must report stride equal to
//! size; the other regions pack handle-aligned entries and round only the
//! region total up to the base alignment.

use ash::vk;
use kiln_gpu::device::Device;
use kiln_gpu::{Buffer, GpuError, Result};
use std::sync::Arc;

// Vulkan reports all SBT alignments as powers of two.
fn align_up(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// A ray-generation, miss, or callable group: one general shader index.
#[derive(Clone, Copy, Debug)]
pub struct GeneralGroup {
    pub shader: u32,
}

impl GeneralGroup {
    pub fn new(shader: u32) -> Self {
        Self { shader }
    }
}

/// Hit group sub-type, selecting how the intersection is found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HitGroupKind {
    Triangles,
    Procedural,
}

/// A hit group: up to three shader indices, unused slots left unset.
#[derive(Clone, Copy, Debug)]
pub struct HitGroup {
    pub kind: HitGroupKind,
    pub closest_hit: u32,
    pub any_hit: u32,
    pub intersection: u32,
}

impl HitGroup {
    pub fn triangles(closest_hit: u32) -> Self {
        Self {
            kind: HitGroupKind::Triangles,
            closest_hit,
            any_hit: vk::SHADER_UNUSED_KHR,
            intersection: vk::SHADER_UNUSED_KHR,
        }
    }

    pub fn procedural(intersection: u32, closest_hit: u32) -> Self {
        Self {
            kind: HitGroupKind::Procedural,
            closest_hit,
            any_hit: vk::SHADER_UNUSED_KHR,
            intersection,
        }
    }

    pub fn with_any_hit(mut self, any_hit: u32) -> Self {
        self.any_hit = any_hit;
        self
    }

    fn group_type(&self) -> vk::RayTracingShaderGroupTypeKHR {
        match self.kind {
            HitGroupKind::Triangles => vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
            HitGroupKind::Procedural => vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP,
        }
    }
}

/// One region of the table, in bytes relative to the buffer start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub offset: u32,
    pub stride: u32,
    pub size: u32,
}

/// The pure byte layout of a shader binding table.
#[derive(Clone, Debug)]
pub struct SbtLayout {
    pub handle_size: u32,
    pub handle_size_aligned: u32,
    pub base_aligned: u32,
    pub rgen_regions: Vec<Region>,
    pub miss_region: Region,
    pub hit_region: Region,
    pub callable_region: Region,
    pub total_size: u32,
}

impl SbtLayout {
    /// Compute the layout from device alignment properties and group counts.
    pub fn compute(
        handle_size: u32,
        handle_alignment: u32,
        base_alignment: u32,
        rgen_count: u32,
        miss_count: u32,
        hit_count: u32,
        callable_count: u32,
    ) -> Self {
        let handle_size_aligned = align_up(handle_size, handle_alignment);
        let base_aligned = align_up(handle_size_aligned, base_alignment);

        let mut offset = 0u32;
        let rgen_regions = (0..rgen_count)
            .map(|i| Region {
                offset: i * base_aligned,
                stride: base_aligned,
                size: base_aligned,
            })
            .collect();
        offset += rgen_count * base_aligned;

        let mut class_region = |count: u32| {
            let size = if count > 0 {
                align_up(count * handle_size_aligned, base_alignment)
            } else {
                0
            };
            let region = Region {
                offset,
                stride: handle_size_aligned,
                size,
            };
            offset += size;
            region
        };
        let miss_region = class_region(miss_count);
        let hit_region = class_region(hit_count);
        let callable_region = class_region(callable_count);

        Self {
            handle_size,
            handle_size_aligned,
            base_aligned,
            rgen_regions,
            miss_region,
            hit_region,
            callable_region,
            total_size: offset,
        }
    }
}

/// A shader binding table: layout, group descriptions, and backing buffer.
///
/// Group create infos are appended in the fixed order ray-generation, miss,
/// hit, callable; [`ShaderBindingTable::load_handles`] relies on the pipeline
/// having been created from exactly that list.
pub struct ShaderBindingTable {
    layout: SbtLayout,
    group_create_infos: Vec<vk::RayTracingShaderGroupCreateInfoKHR<'static>>,
    rgen_count: u32,
    miss_count: u32,
    hit_count: u32,
    callable_count: u32,
    buffer: Buffer,
}

impl ShaderBindingTable {
    pub fn new(
        device: &Arc<Device>,
        rgen: &[GeneralGroup],
        miss: &[GeneralGroup],
        hit: &[HitGroup],
        callable: &[GeneralGroup],
    ) -> Result<Self> {
        if rgen.is_empty() {
            return Err(GpuError::InvalidArgument(
                "shader binding table needs at least one ray-generation group".to_string(),
            ));
        }

        let properties = device.ray_tracing_pipeline_properties();
        let layout = SbtLayout::compute(
            properties.shader_group_handle_size,
            properties.shader_group_handle_alignment,
            properties.shader_group_base_alignment,
            rgen.len() as u32,
            miss.len() as u32,
            hit.len() as u32,
            callable.len() as u32,
        );

        let mut group_create_infos =
            Vec::with_capacity(rgen.len() + miss.len() + hit.len() + callable.len());
        for group in rgen.iter().chain(miss) {
            group_create_infos.push(general_group_info(group.shader));
        }
        for group in hit {
            group_create_infos.push(
                vk::RayTracingShaderGroupCreateInfoKHR::default()
                    .ty(group.group_type())
                    .general_shader(vk::SHADER_UNUSED_KHR)
                    .closest_hit_shader(group.closest_hit)
                    .any_hit_shader(group.any_hit)
                    .intersection_shader(group.intersection),
            );
        }
        for group in callable {
            group_create_infos.push(general_group_info(group.shader));
        }

        let usage = vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        let preferred = vk::MemoryPropertyFlags::DEVICE_LOCAL
            | vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT;
        let buffer = match Buffer::new(
            device.clone(),
            vk::DeviceSize::from(layout.total_size),
            usage,
            preferred,
        ) {
            Ok(buffer) => buffer,
            Err(GpuError::ResourceExhausted(_)) => {
                tracing::debug!("no device-local host-visible memory, using host memory for SBT");
                Buffer::new(
                    device.clone(),
                    vk::DeviceSize::from(layout.total_size),
                    usage,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                )?
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            layout,
            group_create_infos,
            rgen_count: rgen.len() as u32,
            miss_count: miss.len() as u32,
            hit_count: hit.len() as u32,
            callable_count: callable.len() as u32,
            buffer,
        })
    }

    /// Fetch the pipeline's group handles and scatter them into the buffer.
    ///
    /// The pipeline must have been created with
    /// [`ShaderBindingTable::group_create_infos`], in order.
    pub fn load_handles(&self, pipeline: vk::Pipeline) -> Result<()> {
        let handle_size = self.layout.handle_size as usize;
        let group_count = self.group_count();
        let handles = unsafe {
            self.buffer
                .device()
                .ray_tracing_pipeline_loader()
                .get_ray_tracing_shader_group_handles(
                    pipeline,
                    0,
                    group_count,
                    handle_size * group_count as usize,
                )?
        };

        let mut staging = vec![0u8; self.layout.total_size as usize];
        let mut group = 0usize;
        let mut place = |dst_offset: u32| {
            let src = group * handle_size;
            let dst = dst_offset as usize;
            staging[dst..dst + handle_size].copy_from_slice(&handles[src..src + handle_size]);
            group += 1;
        };
        for region in &self.layout.rgen_regions {
            place(region.offset);
        }
        for i in 0..self.miss_count {
            place(self.layout.miss_region.offset + i * self.layout.handle_size_aligned);
        }
        for i in 0..self.hit_count {
            place(self.layout.hit_region.offset + i * self.layout.handle_size_aligned);
        }
        for i in 0..self.callable_count {
            place(self.layout.callable_region.offset + i * self.layout.handle_size_aligned);
        }

        self.buffer.write_bytes(0, &staging)
    }

    pub fn group_create_infos(&self) -> &[vk::RayTracingShaderGroupCreateInfoKHR<'static>] {
        &self.group_create_infos
    }

    pub fn group_count(&self) -> u32 {
        self.group_create_infos.len() as u32
    }

    pub fn layout(&self) -> &SbtLayout {
        &self.layout
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Device-address region for one ray-generation entry.
    pub fn raygen_region(&self, index: u32) -> Result<vk::StridedDeviceAddressRegionKHR> {
        let region = self
            .layout
            .rgen_regions
            .get(index as usize)
            .ok_or_else(|| {
                GpuError::OutOfRange(format!("no ray-generation entry {index}"))
            })?;
        Ok(self.strided_region(*region))
    }

    pub fn miss_region(&self) -> vk::StridedDeviceAddressRegionKHR {
        self.strided_region(self.layout.miss_region)
    }

    pub fn hit_region(&self) -> vk::StridedDeviceAddressRegionKHR {
        self.strided_region(self.layout.hit_region)
    }

    pub fn callable_region(&self) -> vk::StridedDeviceAddressRegionKHR {
        self.strided_region(self.layout.callable_region)
    }

    fn strided_region(&self, region: Region) -> vk::StridedDeviceAddressRegionKHR {
        let address = if region.size > 0 {
            self.buffer.device_address() + vk::DeviceAddress::from(region.offset)
        } else {
            0
        };
        vk::StridedDeviceAddressRegionKHR {
            device_address: address,
            stride: vk::DeviceSize::from(region.stride),
            size: vk::DeviceSize::from(region.size),
        }
    }
}

fn general_group_info(shader: u32) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
    vk::RayTracingShaderGroupCreateInfoKHR::default()
        .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
        .general_shader(shader)
        .closest_hit_shader(vk::SHADER_UNUSED_KHR)
        .any_hit_shader(vk::SHADER_UNUSED_KHR)
        .intersection_shader(vk::SHADER_UNUSED_KHR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(32, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(0, 64), 0);
    }

    #[test]
    #[should_panic(expected = "is_power_of_two")]
    fn align_up_rejects_zero_alignment() {
        align_up(32, 0);
    }

    #[test]
    fn layout_matches_reference_example() {
        // handle 32, handle alignment 32, base alignment 64;
        // 1 rgen, 2 miss, 1 hit, 0 callable.
        let layout = SbtLayout::compute(32, 32, 64, 1, 2, 1, 0);
        assert_eq!(layout.handle_size_aligned, 32);
        assert_eq!(layout.base_aligned, 64);
        assert_eq!(
            layout.rgen_regions,
            vec![Region {
                offset: 0,
                stride: 64,
                size: 64
            }]
        );
        assert_eq!(
            layout.miss_region,
            Region {
                offset: 64,
                stride: 32,
                size: 64
            }
        );
        assert_eq!(
            layout.hit_region,
            Region {
                offset: 128,
                stride: 32,
                size: 64
            }
        );
        assert_eq!(
            layout.callable_region,
            Region {
                offset: 192,
                stride: 32,
                size: 0
            }
        );
        assert_eq!(layout.total_size, 192);
    }

    #[test]
    fn rgen_entries_each_take_a_base_aligned_block() {
        let layout = SbtLayout::compute(32, 32, 64, 3, 0, 0, 0);
        assert_eq!(layout.rgen_regions.len(), 3);
        for (i, region) in layout.rgen_regions.iter().enumerate() {
            assert_eq!(region.offset, i as u32 * 64);
            assert_eq!(region.stride, region.size);
        }
        assert_eq!(layout.total_size, 192);
        assert_eq!(layout.miss_region.size, 0);
    }

    #[test]
    fn layout_is_deterministic() {
        let a = SbtLayout::compute(32, 64, 128, 2, 3, 4, 1);
        let b = SbtLayout::compute(32, 64, 128, 2, 3, 4, 1);
        assert_eq!(a.total_size, b.total_size);
        assert_eq!(a.rgen_regions, b.rgen_regions);
        assert_eq!(a.miss_region, b.miss_region);
        assert_eq!(a.hit_region, b.hit_region);
        assert_eq!(a.callable_region, b.callable_region);
    }

    #[test]
    fn hit_group_helpers_leave_unused_slots_unset() {
        let triangles = HitGroup::triangles(4);
        assert_eq!(triangles.kind, HitGroupKind::Triangles);
        assert_eq!(triangles.closest_hit, 4);
        assert_eq!(triangles.any_hit, vk::SHADER_UNUSED_KHR);
        assert_eq!(triangles.intersection, vk::SHADER_UNUSED_KHR);

        let procedural = HitGroup::procedural(7, 5).with_any_hit(6);
        assert_eq!(procedural.kind, HitGroupKind::Procedural);
        assert_eq!(procedural.intersection, 7);
        assert_eq!(procedural.any_hit, 6);
    }
}
