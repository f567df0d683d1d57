//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
///
/// Everything here is fail-fast: nothing in this layer retries or recovers,
/// a setup step that errors is expected to abort higher-level initialization.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error, propagated verbatim from the runtime.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// Malformed construction parameters.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid index lookup (queue family/index, descriptor binding/slot).
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// No memory type satisfies the requested requirements and flags.
    #[error("no suitable memory type: {0}")]
    ResourceExhausted(String),

    /// Operation not supported by the dispatch (e.g. descriptor payload
    /// kind not matching the declared binding type).
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// No suitable GPU found.
    #[error("no suitable GPU found")]
    NoSuitableDevice,
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
