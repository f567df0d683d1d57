//! Command pool and command buffer allocation.

use crate::device::Device;
use crate::error::Result;
use ash::vk;
use std::sync::Arc;

/// A command pool bound to one queue family.
pub struct CommandPool {
    device: Arc<Device>,
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a command pool for the given queue family.
    pub fn new(
        device: Arc<Device>,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .flags(flags)
            .queue_family_index(queue_family);
        let pool = unsafe { device.handle().create_command_pool(&create_info, None)? };
        Ok(Self {
            device,
            pool,
            queue_family,
        })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family this pool allocates for.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate a single command buffer at the given level.
    pub fn allocate_command_buffer(
        &self,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(level)
            .command_buffer_count(1);
        let buffers = unsafe {
            self.device
                .handle()
                .allocate_command_buffers(&allocate_info)?
        };
        Ok(buffers[0])
    }

    /// Allocate a single primary command buffer.
    pub fn allocate_primary(&self) -> Result<vk::CommandBuffer> {
        self.allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)
    }

    /// Reset the pool, recycling all command buffers allocated from it.
    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.device
                .handle()
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
        }
        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_command_pool(self.pool, None);
        }
    }
}
