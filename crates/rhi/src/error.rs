//! RHI-specific error types.

use std::time::Duration;

use ash::vk;
use thiserror::Error;

/// RHI-specific error type.
///
/// Every variant is fatal to the operation that produced it. Recoverable
/// conditions (a stale swapchain, an exhausted descriptor pool that can be
/// replaced) are reported as values by the APIs that detect them.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] vk::Result),

    /// A named device operation returned an error code
    #[error("{operation} failed: {result}")]
    DeviceOperation {
        operation: &'static str,
        result: vk::Result,
    },

    /// Failed to load Vulkan
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// Surface creation error
    #[error("Surface error: {0}")]
    SurfaceError(String),

    /// Swapchain error
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// A bounded wait on the GPU expired
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// A freshly obtained descriptor pool could not satisfy an allocation
    #[error("descriptor pool of {pool_capacity} sets exhausted on retry: {result}")]
    DescriptorPoolExhausted {
        pool_capacity: u32,
        result: vk::Result,
    },

    /// A descriptor write targets a binding the layout does not declare
    #[error("binding {binding} is not declared by the descriptor set layout")]
    UnknownBinding { binding: u32 },

    /// A descriptor write's type differs from the layout's declaration
    #[error("binding {binding} is declared as {expected:?} but written as {found:?}")]
    BindingTypeMismatch {
        binding: u32,
        expected: vk::DescriptorType,
        found: vk::DescriptorType,
    },

    /// Caller passed a value outside the accepted range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation called out of protocol order
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// Invalid handle error
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
}

impl RhiError {
    /// Wrap a raw result code with the name of the failing operation.
    pub fn device(operation: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| Self::DeviceOperation { operation, result }
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;
