//! Memory-backed buffer resource.

use crate::device::Device;
use crate::error::{GpuError, Result};
use ash::vk;
use std::sync::Arc;

/// A buffer with its own raw device-memory allocation.
///
/// Memory is selected with the first-match memory-type scan and bound at
/// offset zero; there is no sub-allocation in this layer. The cached device
/// address is non-zero only when the usage flags request
/// `SHADER_DEVICE_ADDRESS`; usage is taken exactly as given, never
/// auto-appended.
pub struct Buffer {
    device: Arc<Device>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    device_address: vk::DeviceAddress,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_property_flags: vk::MemoryPropertyFlags,
}

impl Buffer {
    /// Create a buffer of `size` bytes with its memory bound.
    pub fn new(
        device: Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_property_flags: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        if size == 0 {
            return Err(GpuError::InvalidArgument(
                "buffer size must be non-zero".to_string(),
            ));
        }
        let mut buffer = Self {
            device,
            buffer: vk::Buffer::null(),
            memory: vk::DeviceMemory::null(),
            device_address: 0,
            size: 0,
            usage,
            memory_property_flags,
        };
        buffer.recreate(size)?;
        Ok(buffer)
    }

    /// Recreate the buffer at a new size, keeping this wrapper's identity.
    ///
    /// The old contents are NOT copied; callers re-upload after a resize.
    pub fn resize(&mut self, size: vk::DeviceSize) -> Result<()> {
        if size == self.size {
            return Ok(());
        }
        if size == 0 {
            return Err(GpuError::InvalidArgument(
                "buffer size must be non-zero".to_string(),
            ));
        }
        self.destroy_handles();
        self.recreate(size)
    }

    fn recreate(&mut self, size: vk::DeviceSize) -> Result<()> {
        let raw = self.device.handle();

        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(self.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { raw.create_buffer(&create_info, None)? };

        let requirements = unsafe { raw.get_buffer_memory_requirements(buffer) };
        let Some(memory_type_index) = self
            .device
            .find_memory_type_index(&requirements, self.memory_property_flags)
        else {
            unsafe { raw.destroy_buffer(buffer, None) };
            return Err(GpuError::ResourceExhausted(format!(
                "no memory type for buffer with flags {:?}",
                self.memory_property_flags
            )));
        };

        let wants_address = self.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);
        let mut allocate_flags =
            vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        if wants_address {
            allocate_info = allocate_info.push_next(&mut allocate_flags);
        }

        let memory = match unsafe { raw.allocate_memory(&allocate_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { raw.destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };
        if let Err(e) = unsafe { raw.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                raw.destroy_buffer(buffer, None);
                raw.free_memory(memory, None);
            }
            return Err(e.into());
        }

        self.buffer = buffer;
        self.memory = memory;
        self.size = size;
        self.device_address = if wants_address {
            let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
            unsafe { raw.get_buffer_device_address(&info) }
        } else {
            0
        };
        Ok(())
    }

    fn destroy_handles(&mut self) {
        let raw = self.device.handle();
        unsafe {
            if self.buffer != vk::Buffer::null() {
                raw.destroy_buffer(self.buffer, None);
                self.buffer = vk::Buffer::null();
            }
            if self.memory != vk::DeviceMemory::null() {
                raw.free_memory(self.memory, None);
                self.memory = vk::DeviceMemory::null();
            }
        }
        self.device_address = 0;
        self.size = 0;
    }

    /// Get the raw buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Get the byte size.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Get the usage flags this buffer was created with.
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Get the cached device address.
    ///
    /// Zero when the usage flags do not include `SHADER_DEVICE_ADDRESS`.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    /// Get the owning device.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Write raw bytes at the given offset.
    ///
    /// The memory must be host-visible; with non-coherent memory the caller
    /// is responsible for flushing.
    pub fn write_bytes(&self, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= self.size)
            .ok_or_else(|| {
                GpuError::InvalidArgument("write range exceeds buffer size".to_string())
            })?;
        let ptr = self.map()?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }
        self.unmap();
        Ok(())
    }

    /// Read raw bytes from the given offset.
    pub fn read_bytes(&self, offset: vk::DeviceSize, out: &mut [u8]) -> Result<()> {
        offset
            .checked_add(out.len() as u64)
            .filter(|&end| end <= self.size)
            .ok_or_else(|| {
                GpuError::InvalidArgument("read range exceeds buffer size".to_string())
            })?;
        let ptr = self.map()?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset as usize), out.as_mut_ptr(), out.len());
        }
        self.unmap();
        Ok(())
    }

    /// Write a slice of plain-old-data values at offset zero.
    pub fn write<T: bytemuck::Pod>(&self, data: &[T]) -> Result<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }

    fn map(&self) -> Result<*mut u8> {
        if !self
            .memory_property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            return Err(GpuError::InvalidArgument(
                "buffer memory is not host visible".to_string(),
            ));
        }
        let ptr = unsafe {
            self.device.handle().map_memory(
                self.memory,
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )?
        };
        Ok(ptr.cast())
    }

    fn unmap(&self) {
        unsafe {
            self.device.handle().unmap_memory(self.memory);
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.destroy_handles();
    }
}
