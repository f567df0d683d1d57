//! Acceleration structure geometry descriptors.

use ash::vk;
use kiln_gpu::{GpuError, Result};

/// Vertex stride implied by a position format, when the caller passes zero.
fn infer_vertex_stride(format: vk::Format) -> Option<vk::DeviceSize> {
    match format {
        vk::Format::R16G16B16_SFLOAT => Some(6),
        vk::Format::R16G16B16A16_SFLOAT => Some(8),
        vk::Format::R32G32B32_SFLOAT => Some(12),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        vk::Format::R64G64B64_SFLOAT => Some(24),
        vk::Format::R64G64B64A64_SFLOAT => Some(32),
        _ => None,
    }
}

/// Triangle mesh geometry for a bottom-level acceleration structure.
///
/// The triangle count follows the index buffer when one is attached;
/// otherwise it is derived from the vertex count, and only when that count is
/// a multiple of three.
pub struct TriangleGeometry {
    data: vk::AccelerationStructureGeometryTrianglesDataKHR<'static>,
    has_indices: bool,
    triangle_count: u32,
    vertex_byte_offset: u32,
    index_byte_offset: u32,
    transform_byte_offset: u32,
}

impl Default for TriangleGeometry {
    fn default() -> Self {
        Self::new()
    }
}

impl TriangleGeometry {
    pub fn new() -> Self {
        Self {
            data: vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                .index_type(vk::IndexType::NONE_KHR),
            has_indices: false,
            triangle_count: 0,
            vertex_byte_offset: 0,
            index_byte_offset: 0,
            transform_byte_offset: 0,
        }
    }

    /// Attach the vertex buffer.
    ///
    /// A zero `stride` is inferred from the format for the common position
    /// formats; other formats must state the stride explicitly.
    /// `byte_offset` is the start of the data within its backing buffer.
    pub fn vertices(
        mut self,
        address: vk::DeviceOrHostAddressConstKHR,
        format: vk::Format,
        vertex_count: u32,
        byte_offset: u32,
        stride: vk::DeviceSize,
    ) -> Result<Self> {
        let stride = if stride == 0 {
            infer_vertex_stride(format).ok_or_else(|| {
                GpuError::InvalidArgument(format!(
                    "stride must be specified for vertex format {format:?}"
                ))
            })?
        } else {
            stride
        };

        self.data.vertex_data = address;
        self.data.vertex_format = format;
        self.data.max_vertex = vertex_count;
        self.data.vertex_stride = stride;
        // Index data, once attached, owns the triangle count.
        if !self.has_indices && vertex_count % 3 == 0 {
            self.triangle_count = vertex_count / 3;
        }
        self.vertex_byte_offset = byte_offset;
        Ok(self)
    }

    /// Attach an index buffer; the index count must describe whole triangles.
    pub fn indices(
        mut self,
        address: vk::DeviceOrHostAddressConstKHR,
        index_type: vk::IndexType,
        index_count: u32,
        byte_offset: u32,
    ) -> Result<Self> {
        if index_count % 3 != 0 {
            return Err(GpuError::InvalidArgument(
                "index count must be a multiple of three".to_string(),
            ));
        }
        self.data.index_data = address;
        self.data.index_type = index_type;
        self.triangle_count = index_count / 3;
        self.index_byte_offset = byte_offset;
        self.has_indices = true;
        Ok(self)
    }

    /// Attach an optional 3x4 row-major transform.
    pub fn transform(
        mut self,
        address: vk::DeviceOrHostAddressConstKHR,
        byte_offset: u32,
    ) -> Self {
        self.data.transform_data = address;
        self.transform_byte_offset = byte_offset;
        self
    }

    pub fn triangle_count(&self) -> u32 {
        self.triangle_count
    }

    pub fn has_indices(&self) -> bool {
        self.has_indices
    }

    /// Pack into a build-input geometry description.
    pub fn geometry(&self, flags: vk::GeometryFlagsKHR) -> vk::AccelerationStructureGeometryKHR<'_> {
        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                triangles: self.data,
            })
            .flags(flags)
    }

    /// Pack the matching build range.
    ///
    /// With indices, the primitive offset addresses the index data; without,
    /// it addresses the vertex data.
    pub fn build_range(&self) -> vk::AccelerationStructureBuildRangeInfoKHR {
        vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: self.triangle_count,
            primitive_offset: if self.has_indices {
                self.index_byte_offset
            } else {
                self.vertex_byte_offset
            },
            first_vertex: 0,
            transform_offset: self.transform_byte_offset,
        }
    }
}

/// Axis-aligned bounding box geometry for procedural primitives.
pub struct AabbGeometry {
    data: vk::AccelerationStructureGeometryAabbsDataKHR<'static>,
    aabb_count: u32,
    byte_offset: u32,
}

impl Default for AabbGeometry {
    fn default() -> Self {
        Self::new()
    }
}

impl AabbGeometry {
    pub fn new() -> Self {
        Self {
            data: vk::AccelerationStructureGeometryAabbsDataKHR::default(),
            aabb_count: 0,
            byte_offset: 0,
        }
    }

    /// Attach the AABB array; a zero stride uses the packed min/max layout.
    pub fn aabbs(
        mut self,
        address: vk::DeviceOrHostAddressConstKHR,
        aabb_count: u32,
        byte_offset: u32,
        stride: vk::DeviceSize,
    ) -> Self {
        self.data.data = address;
        self.data.stride = if stride == 0 {
            std::mem::size_of::<vk::AabbPositionsKHR>() as vk::DeviceSize
        } else {
            stride
        };
        self.aabb_count = aabb_count;
        self.byte_offset = byte_offset;
        self
    }

    pub fn aabb_count(&self) -> u32 {
        self.aabb_count
    }

    pub fn geometry(&self, flags: vk::GeometryFlagsKHR) -> vk::AccelerationStructureGeometryKHR<'_> {
        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::AABBS)
            .geometry(vk::AccelerationStructureGeometryDataKHR { aabbs: self.data })
            .flags(flags)
    }

    pub fn build_range(&self) -> vk::AccelerationStructureBuildRangeInfoKHR {
        vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: self.aabb_count,
            primitive_offset: self.byte_offset,
            first_vertex: 0,
            transform_offset: 0,
        }
    }
}

/// Instance array geometry for a top-level acceleration structure.
pub struct AsInstanceGeometry {
    data: vk::AccelerationStructureGeometryInstancesDataKHR<'static>,
    instance_count: u32,
    byte_offset: u32,
}

impl Default for AsInstanceGeometry {
    fn default() -> Self {
        Self::new()
    }
}

impl AsInstanceGeometry {
    pub fn new() -> Self {
        Self {
            data: vk::AccelerationStructureGeometryInstancesDataKHR::default(),
            instance_count: 0,
            byte_offset: 0,
        }
    }

    /// Attach a tightly packed instance-descriptor array.
    pub fn instances(
        mut self,
        address: vk::DeviceOrHostAddressConstKHR,
        instance_count: u32,
        byte_offset: u32,
    ) -> Self {
        self.data.data = address;
        self.data.array_of_pointers = vk::FALSE;
        self.instance_count = instance_count;
        self.byte_offset = byte_offset;
        self
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn geometry(&self, flags: vk::GeometryFlagsKHR) -> vk::AccelerationStructureGeometryKHR<'_> {
        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: self.data,
            })
            .flags(flags)
    }

    pub fn build_range(&self) -> vk::AccelerationStructureBuildRangeInfoKHR {
        vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: self.instance_count,
            primitive_offset: self.byte_offset,
            first_vertex: 0,
            transform_offset: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_address() -> vk::DeviceOrHostAddressConstKHR {
        vk::DeviceOrHostAddressConstKHR { device_address: 0 }
    }

    #[test]
    fn stride_inference_covers_position_formats() {
        assert_eq!(infer_vertex_stride(vk::Format::R16G16B16_SFLOAT), Some(6));
        assert_eq!(infer_vertex_stride(vk::Format::R16G16B16A16_SFLOAT), Some(8));
        assert_eq!(infer_vertex_stride(vk::Format::R32G32B32_SFLOAT), Some(12));
        assert_eq!(infer_vertex_stride(vk::Format::R32G32B32A32_SFLOAT), Some(16));
        assert_eq!(infer_vertex_stride(vk::Format::R64G64B64_SFLOAT), Some(24));
        assert_eq!(infer_vertex_stride(vk::Format::R64G64B64A64_SFLOAT), Some(32));
        assert_eq!(infer_vertex_stride(vk::Format::R8G8B8A8_UNORM), None);
    }

    #[test]
    fn unknown_format_requires_explicit_stride() {
        let result = TriangleGeometry::new().vertices(
            host_address(),
            vk::Format::R8G8B8A8_UNORM,
            6,
            0,
            0,
        );
        assert!(matches!(result, Err(GpuError::InvalidArgument(_))));

        let geometry = TriangleGeometry::new()
            .vertices(host_address(), vk::Format::R8G8B8A8_UNORM, 6, 0, 4)
            .unwrap();
        assert_eq!(geometry.triangle_count(), 2);
    }

    #[test]
    fn triangle_count_from_vertices_needs_multiple_of_three() {
        let geometry = TriangleGeometry::new()
            .vertices(host_address(), vk::Format::R32G32B32_SFLOAT, 7, 0, 0)
            .unwrap();
        assert_eq!(geometry.triangle_count(), 0);
    }

    #[test]
    fn indices_own_the_triangle_count() {
        let geometry = TriangleGeometry::new()
            .indices(host_address(), vk::IndexType::UINT32, 9, 0)
            .unwrap()
            .vertices(host_address(), vk::Format::R32G32B32_SFLOAT, 300, 0, 0)
            .unwrap();
        assert_eq!(geometry.triangle_count(), 3);
        assert!(geometry.has_indices());
    }

    #[test]
    fn partial_triangle_indices_are_rejected() {
        let result = TriangleGeometry::new().indices(host_address(), vk::IndexType::UINT16, 8, 0);
        assert!(matches!(result, Err(GpuError::InvalidArgument(_))));
    }

    #[test]
    fn build_range_offset_follows_index_data() {
        let indexed = TriangleGeometry::new()
            .vertices(host_address(), vk::Format::R32G32B32_SFLOAT, 3, 16, 0)
            .unwrap()
            .indices(host_address(), vk::IndexType::UINT32, 3, 64)
            .unwrap();
        assert_eq!(indexed.build_range().primitive_offset, 64);

        let unindexed = TriangleGeometry::new()
            .vertices(host_address(), vk::Format::R32G32B32_SFLOAT, 3, 16, 0)
            .unwrap();
        assert_eq!(unindexed.build_range().primitive_offset, 16);
    }

    #[test]
    fn aabb_stride_defaults_to_packed_layout() {
        let geometry = AabbGeometry::new().aabbs(host_address(), 4, 0, 0);
        assert_eq!(geometry.aabb_count(), 4);
        assert_eq!(geometry.build_range().primitive_count, 4);
    }
}
