//! Vulkan convenience layer for the Kiln toolkit.
//!
//! This crate provides:
//! - Vulkan instance and device management with queue tables
//! - Buffer and image resources with first-match memory-type selection
//! - Host-side image layout transitions and host image copies
//! - Descriptor set layouts and batched descriptor updates
//! - Pipeline-less shader objects with specialization constants

pub mod buffer;
pub mod command;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod image;
pub mod instance;
pub mod shader;
pub mod utils;

pub use buffer::Buffer;
pub use command::CommandPool;
pub use descriptors::{
    Binding, Descriptor, DescriptorSet, DescriptorSetLayout, DescriptorSetLayoutBuilder,
};
pub use device::{Device, DeviceFeatures, Queue};
pub use error::{GpuError, Result};
pub use image::Image;
pub use instance::Instance;
pub use shader::{ShaderObject, ShaderSpecialization, ShaderStage};
