//! Descriptor set layouts and batched descriptor updates.

use crate::device::Device;
use crate::error::{GpuError, Result};
use ash::vk;
use std::sync::Arc;

/// One binding slot in a descriptor set layout.
#[derive(Clone, Debug)]
pub struct Binding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stage_flags: vk::ShaderStageFlags,
    pub binding_flags: vk::DescriptorBindingFlags,
    /// Allowed types for a `MUTABLE_EXT` binding; empty otherwise.
    pub mutable_types: Vec<vk::DescriptorType>,
}

/// Builder for a [`DescriptorSetLayout`].
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<Binding>,
}

impl DescriptorSetLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fully specified binding.
    pub fn binding(mut self, binding: Binding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn storage_buffer(self, binding: u32, count: u32, stages: vk::ShaderStageFlags) -> Self {
        self.simple(binding, vk::DescriptorType::STORAGE_BUFFER, count, stages)
    }

    pub fn uniform_buffer(self, binding: u32, count: u32, stages: vk::ShaderStageFlags) -> Self {
        self.simple(binding, vk::DescriptorType::UNIFORM_BUFFER, count, stages)
    }

    pub fn storage_image(self, binding: u32, count: u32, stages: vk::ShaderStageFlags) -> Self {
        self.simple(binding, vk::DescriptorType::STORAGE_IMAGE, count, stages)
    }

    pub fn combined_image_sampler(
        self,
        binding: u32,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.simple(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count,
            stages,
        )
    }

    pub fn acceleration_structure(
        self,
        binding: u32,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.simple(
            binding,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            count,
            stages,
        )
    }

    fn simple(
        self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.binding(Binding {
            binding,
            descriptor_type,
            count,
            stage_flags,
            binding_flags: vk::DescriptorBindingFlags::empty(),
            mutable_types: Vec::new(),
        })
    }

    pub fn build(self, device: Arc<Device>) -> Result<DescriptorSetLayout> {
        DescriptorSetLayout::new(device, self.bindings)
    }
}

/// A descriptor set layout plus the binding table it was built from.
pub struct DescriptorSetLayout {
    device: Arc<Device>,
    layout: vk::DescriptorSetLayout,
    bindings: Vec<Binding>,
}

impl DescriptorSetLayout {
    pub fn new(device: Arc<Device>, bindings: Vec<Binding>) -> Result<Self> {
        let layout_bindings: Vec<vk::DescriptorSetLayoutBinding<'_>> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.count)
                    .stage_flags(b.stage_flags)
            })
            .collect();
        let binding_flags: Vec<vk::DescriptorBindingFlags> =
            bindings.iter().map(|b| b.binding_flags).collect();

        let mutable_lists: Vec<vk::MutableDescriptorTypeListEXT<'_>> = bindings
            .iter()
            .map(|b| vk::MutableDescriptorTypeListEXT::default().descriptor_types(&b.mutable_types))
            .collect();
        let has_mutable = bindings
            .iter()
            .any(|b| b.descriptor_type == vk::DescriptorType::MUTABLE_EXT);

        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default()
            .binding_flags(&binding_flags);
        let mut mutable_info =
            vk::MutableDescriptorTypeCreateInfoEXT::default().mutable_descriptor_type_lists(&mutable_lists);

        let mut create_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&layout_bindings)
            .push_next(&mut flags_info);
        if has_mutable {
            create_info = create_info.push_next(&mut mutable_info);
        }

        let layout = unsafe { device.handle().create_descriptor_set_layout(&create_info, None)? };
        Ok(Self {
            device,
            layout,
            bindings,
        })
    }

    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// One descriptor payload, matching the binding's descriptor type.
#[derive(Clone, Copy, Debug)]
pub enum Descriptor {
    Image(vk::DescriptorImageInfo),
    Buffer(vk::DescriptorBufferInfo),
    TexelBuffer(vk::BufferView),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

impl Descriptor {
    fn matches_type(&self, descriptor_type: vk::DescriptorType) -> bool {
        match self {
            Self::Image(_) => matches!(
                descriptor_type,
                vk::DescriptorType::SAMPLER
                    | vk::DescriptorType::COMBINED_IMAGE_SAMPLER
                    | vk::DescriptorType::SAMPLED_IMAGE
                    | vk::DescriptorType::STORAGE_IMAGE
                    | vk::DescriptorType::INPUT_ATTACHMENT
            ),
            Self::Buffer(_) => matches!(
                descriptor_type,
                vk::DescriptorType::UNIFORM_BUFFER
                    | vk::DescriptorType::STORAGE_BUFFER
                    | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
                    | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
            ),
            Self::TexelBuffer(_) => matches!(
                descriptor_type,
                vk::DescriptorType::UNIFORM_TEXEL_BUFFER | vk::DescriptorType::STORAGE_TEXEL_BUFFER
            ),
            Self::AccelerationStructure(_) => {
                descriptor_type == vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
            }
        }
    }
}

type Slot = (vk::DescriptorType, Descriptor);

/// A descriptor set with a host-side slot table.
///
/// Slots are staged with [`DescriptorSet::set_descriptor`] and committed in
/// one native update call by [`DescriptorSet::update`]. Per binding, only the
/// contiguous run of populated slots from index zero is written; the first
/// empty slot terminates the count for that binding.
pub struct DescriptorSet {
    device: Arc<Device>,
    layout: Arc<DescriptorSetLayout>,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    slots: Vec<Vec<Option<Slot>>>,
}

impl DescriptorSet {
    /// Allocate a set from a dedicated pool sized for exactly this layout.
    pub fn new(device: Arc<Device>, layout: Arc<DescriptorSetLayout>) -> Result<Self> {
        let bindings = layout.bindings();
        if bindings.is_empty() {
            return Err(GpuError::InvalidArgument(
                "descriptor set layout has no bindings".to_string(),
            ));
        }

        let variable_count = variable_descriptor_count(bindings)?;

        let mut pool_sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for binding in bindings {
            match pool_sizes
                .iter_mut()
                .find(|s| s.ty == binding.descriptor_type)
            {
                Some(size) => size.descriptor_count += binding.count,
                None => pool_sizes.push(vk::DescriptorPoolSize {
                    ty: binding.descriptor_type,
                    descriptor_count: binding.count,
                }),
            }
        }

        let mut pool_flags = vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET;
        if bindings
            .iter()
            .any(|b| b.binding_flags.contains(vk::DescriptorBindingFlags::UPDATE_AFTER_BIND))
        {
            pool_flags |= vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND;
        }
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(pool_flags)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { device.handle().create_descriptor_pool(&pool_info, None)? };

        let set_layouts = [layout.handle()];
        let counts = [variable_count.unwrap_or(0)];
        let mut variable_info = vk::DescriptorSetVariableDescriptorCountAllocateInfo::default()
            .descriptor_counts(&counts);
        let mut allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);
        if variable_count.is_some() {
            allocate_info = allocate_info.push_next(&mut variable_info);
        }

        let set = match unsafe { device.handle().allocate_descriptor_sets(&allocate_info) } {
            Ok(sets) => sets[0],
            Err(e) => {
                unsafe { device.handle().destroy_descriptor_pool(pool, None) };
                return Err(e.into());
            }
        };

        let slots = bindings
            .iter()
            .map(|b| vec![None; b.count as usize])
            .collect();

        Ok(Self {
            device,
            layout,
            pool,
            set,
            slots,
        })
    }

    pub fn handle(&self) -> vk::DescriptorSet {
        self.set
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    /// Stage one descriptor into an array slot of a binding.
    ///
    /// The descriptor type is taken from the layout; mutable bindings must go
    /// through [`DescriptorSet::set_descriptor_with_type`].
    pub fn set_descriptor(&mut self, binding: u32, descriptor: Descriptor, index: u32) -> Result<()> {
        let descriptor_type = self.binding_entry(binding)?.descriptor_type;
        if descriptor_type == vk::DescriptorType::MUTABLE_EXT {
            return Err(GpuError::Unsupported(format!(
                "binding {binding} is mutable; a concrete descriptor type is required"
            )));
        }
        self.set_descriptor_with_type(binding, descriptor_type, descriptor, index)
    }

    /// Stage one descriptor with an explicit type, for mutable bindings.
    pub fn set_descriptor_with_type(
        &mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        descriptor: Descriptor,
        index: u32,
    ) -> Result<()> {
        if !descriptor.matches_type(descriptor_type) {
            return Err(GpuError::Unsupported(format!(
                "descriptor payload does not match type {descriptor_type:?}"
            )));
        }
        let entry = self.binding_entry(binding)?;
        if entry.descriptor_type != vk::DescriptorType::MUTABLE_EXT
            && entry.descriptor_type != descriptor_type
        {
            return Err(GpuError::Unsupported(format!(
                "binding {binding} holds {:?}, not {descriptor_type:?}",
                entry.descriptor_type
            )));
        }
        let position = self.binding_position(binding)?;
        let slots = &mut self.slots[position];
        let slot = slots.get_mut(index as usize).ok_or_else(|| {
            GpuError::OutOfRange(format!(
                "index {index} out of range for binding {binding}"
            ))
        })?;
        *slot = Some((descriptor_type, descriptor));
        Ok(())
    }

    /// Clear one array slot, terminating that binding's contiguous prefix.
    pub fn clear_descriptor(&mut self, binding: u32, index: u32) -> Result<()> {
        let position = self.binding_position(binding)?;
        let slots = &mut self.slots[position];
        let slot = slots.get_mut(index as usize).ok_or_else(|| {
            GpuError::OutOfRange(format!(
                "index {index} out of range for binding {binding}"
            ))
        })?;
        *slot = None;
        Ok(())
    }

    /// Commit all staged descriptors in a single native update call.
    ///
    /// Idempotent with respect to the current slot table; repeated calls
    /// re-issue the same write set.
    pub fn update(&self) {
        let mut runs: Vec<Run> = Vec::new();
        for (position, binding) in self.layout.bindings().iter().enumerate() {
            let prefix = contiguous_prefix(&self.slots[position]);
            for (start, len) in typed_runs(&self.slots[position][..prefix]) {
                let range = &self.slots[position][start as usize..start as usize + len];
                runs.extend(build_run(binding.binding, start, range));
            }
        }
        if runs.is_empty() {
            return;
        }

        // Payload storage is finalized before any pointer is taken.
        let mut as_infos: Vec<vk::WriteDescriptorSetAccelerationStructureKHR<'_>> = Vec::new();
        for run in &runs {
            if let RunPayload::AccelerationStructures(handles) = &run.payload {
                as_infos.push(
                    vk::WriteDescriptorSetAccelerationStructureKHR::default()
                        .acceleration_structures(handles),
                );
            }
        }

        let mut writes: Vec<vk::WriteDescriptorSet<'_>> = Vec::with_capacity(runs.len());
        let mut as_index = 0;
        for run in &runs {
            let mut write = vk::WriteDescriptorSet {
                dst_set: self.set,
                dst_binding: run.binding,
                dst_array_element: run.start,
                descriptor_type: run.descriptor_type,
                ..Default::default()
            };
            match &run.payload {
                RunPayload::Images(infos) => {
                    write.descriptor_count = infos.len() as u32;
                    write.p_image_info = infos.as_ptr();
                }
                RunPayload::Buffers(infos) => {
                    write.descriptor_count = infos.len() as u32;
                    write.p_buffer_info = infos.as_ptr();
                }
                RunPayload::TexelBuffers(views) => {
                    write.descriptor_count = views.len() as u32;
                    write.p_texel_buffer_view = views.as_ptr();
                }
                RunPayload::AccelerationStructures(handles) => {
                    write.descriptor_count = handles.len() as u32;
                    write.p_next = std::ptr::from_ref(&as_infos[as_index]).cast();
                    as_index += 1;
                }
            }
            writes.push(write);
        }

        unsafe {
            self.device.handle().update_descriptor_sets(&writes, &[]);
        }
    }

    fn binding_position(&self, binding: u32) -> Result<usize> {
        self.layout
            .bindings()
            .iter()
            .position(|b| b.binding == binding)
            .ok_or_else(|| GpuError::OutOfRange(format!("no binding {binding} in layout")))
    }

    fn binding_entry(&self, binding: u32) -> Result<&Binding> {
        let position = self.binding_position(binding)?;
        Ok(&self.layout.bindings()[position])
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_descriptor_pool(self.pool, None);
        }
    }
}

enum RunPayload {
    Images(Vec<vk::DescriptorImageInfo>),
    Buffers(Vec<vk::DescriptorBufferInfo>),
    TexelBuffers(Vec<vk::BufferView>),
    AccelerationStructures(Vec<vk::AccelerationStructureKHR>),
}

struct Run {
    binding: u32,
    start: u32,
    descriptor_type: vk::DescriptorType,
    payload: RunPayload,
}

/// Variable-count allocation size, if the layout declares one.
///
/// The count is taken from the binding itself, wherever it sits in the
/// binding list. Vulkan requires the variable-count binding to be unique and
/// to carry the highest binding number; a layout violating that would
/// allocate the binding with count zero, so it is rejected here instead.
fn variable_descriptor_count(bindings: &[Binding]) -> Result<Option<u32>> {
    let mut variable: Option<&Binding> = None;
    for binding in bindings {
        if binding
            .binding_flags
            .contains(vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT)
        {
            if variable.is_some() {
                return Err(GpuError::InvalidArgument(
                    "only one binding may be variable-count".to_string(),
                ));
            }
            variable = Some(binding);
        }
    }
    let Some(variable) = variable else {
        return Ok(None);
    };
    let highest = bindings.iter().map(|b| b.binding).max().unwrap_or(0);
    if variable.binding != highest {
        return Err(GpuError::InvalidArgument(format!(
            "variable-count binding {} must carry the highest binding number ({highest})",
            variable.binding
        )));
    }
    Ok(Some(variable.count))
}

/// Number of populated slots before the first empty one.
fn contiguous_prefix(slots: &[Option<Slot>]) -> usize {
    slots.iter().take_while(|s| s.is_some()).count()
}

/// Split a fully populated slot range into runs of equal descriptor type.
///
/// A fixed-type binding yields at most one run; a mutable binding yields one
/// run per stretch of same-typed slots, each becoming its own write.
fn typed_runs(slots: &[Option<Slot>]) -> Vec<(u32, usize)> {
    let mut runs = Vec::new();
    let mut start = 0usize;
    while start < slots.len() {
        let Some((ty, _)) = slots[start] else { break };
        let len = slots[start..]
            .iter()
            .take_while(|s| matches!(s, Some((t, _)) if *t == ty))
            .count();
        runs.push((start as u32, len));
        start += len;
    }
    runs
}

fn build_run(binding: u32, start: u32, slots: &[Option<Slot>]) -> Option<Run> {
    // Callers pass a non-empty same-typed run.
    let (descriptor_type, first) = slots.first().copied().flatten()?;
    let payload = match first {
        Descriptor::Image(_) => RunPayload::Images(
            slots
                .iter()
                .filter_map(|s| match s {
                    Some((_, Descriptor::Image(info))) => Some(*info),
                    _ => None,
                })
                .collect(),
        ),
        Descriptor::Buffer(_) => RunPayload::Buffers(
            slots
                .iter()
                .filter_map(|s| match s {
                    Some((_, Descriptor::Buffer(info))) => Some(*info),
                    _ => None,
                })
                .collect(),
        ),
        Descriptor::TexelBuffer(_) => RunPayload::TexelBuffers(
            slots
                .iter()
                .filter_map(|s| match s {
                    Some((_, Descriptor::TexelBuffer(view))) => Some(*view),
                    _ => None,
                })
                .collect(),
        ),
        Descriptor::AccelerationStructure(_) => RunPayload::AccelerationStructures(
            slots
                .iter()
                .filter_map(|s| match s {
                    Some((_, Descriptor::AccelerationStructure(handle))) => Some(*handle),
                    _ => None,
                })
                .collect(),
        ),
    };
    Some(Run {
        binding,
        start,
        descriptor_type,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_slot() -> Option<Slot> {
        Some((
            vk::DescriptorType::STORAGE_BUFFER,
            Descriptor::Buffer(vk::DescriptorBufferInfo::default()),
        ))
    }

    fn image_slot() -> Option<Slot> {
        Some((
            vk::DescriptorType::STORAGE_IMAGE,
            Descriptor::Image(vk::DescriptorImageInfo::default()),
        ))
    }

    #[test]
    fn prefix_stops_at_first_gap() {
        let slots = vec![buffer_slot(), buffer_slot(), None, buffer_slot()];
        assert_eq!(contiguous_prefix(&slots), 2);
    }

    #[test]
    fn prefix_of_empty_binding_is_zero() {
        let slots: Vec<Option<Slot>> = vec![None, None];
        assert_eq!(contiguous_prefix(&slots), 0);
    }

    #[test]
    fn fixed_type_binding_is_one_run() {
        let slots = vec![buffer_slot(), buffer_slot(), buffer_slot()];
        assert_eq!(typed_runs(&slots), vec![(0, 3)]);
    }

    #[test]
    fn mixed_types_split_into_runs() {
        let slots = vec![buffer_slot(), buffer_slot(), image_slot(), buffer_slot()];
        assert_eq!(typed_runs(&slots), vec![(0, 2), (2, 1), (3, 1)]);
    }

    fn plain_binding(binding: u32) -> Binding {
        Binding {
            binding,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            count: 1,
            stage_flags: vk::ShaderStageFlags::COMPUTE,
            binding_flags: vk::DescriptorBindingFlags::empty(),
            mutable_types: Vec::new(),
        }
    }

    fn variable_binding(binding: u32, count: u32) -> Binding {
        Binding {
            count,
            binding_flags: vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT,
            ..plain_binding(binding)
        }
    }

    #[test]
    fn variable_count_found_regardless_of_list_order() {
        let bindings = vec![variable_binding(2, 5), plain_binding(0), plain_binding(1)];
        assert_eq!(variable_descriptor_count(&bindings).unwrap(), Some(5));

        let none = vec![plain_binding(0), plain_binding(1)];
        assert_eq!(variable_descriptor_count(&none).unwrap(), None);
    }

    #[test]
    fn variable_count_must_be_highest_binding() {
        let bindings = vec![variable_binding(0, 5), plain_binding(1)];
        assert!(matches!(
            variable_descriptor_count(&bindings),
            Err(GpuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn at_most_one_variable_count_binding() {
        let bindings = vec![variable_binding(0, 2), variable_binding(1, 3)];
        assert!(matches!(
            variable_descriptor_count(&bindings),
            Err(GpuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn payload_kind_checks() {
        let buffer = Descriptor::Buffer(vk::DescriptorBufferInfo::default());
        assert!(buffer.matches_type(vk::DescriptorType::UNIFORM_BUFFER));
        assert!(!buffer.matches_type(vk::DescriptorType::STORAGE_IMAGE));

        let image = Descriptor::Image(vk::DescriptorImageInfo::default());
        assert!(image.matches_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER));
        assert!(!image.matches_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR));
    }
}
