//! Vulkan resource lifecycle layer.
//!
//! This crate owns the parts of GPU resource management that do not depend
//! on what is being drawn:
//! - growable descriptor pool allocation
//! - deferred (fence-guarded) destruction
//! - blocking one-off submissions
//! - thin owning wrappers over fences, semaphores, command buffers, buffers
//!
//! Everything is written against the [`backend::GpuDevice`] seam. The ash
//! backed [`device::Device`] drives real hardware; with the `mock` feature
//! (always on in this crate's tests) [`mock::MockDevice`] stands in for it.

mod error;

pub mod backend;
pub mod buffer;
pub mod command;
pub mod deletion;
pub mod descriptor;
pub mod descriptor_allocator;
pub mod device;
pub mod immediate;
pub mod instance;
pub mod physical_device;
pub mod resource;
pub mod swapchain;
pub mod sync;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use error::{RhiError, RhiResult};

// Re-export ash types that users might need
pub use ash::vk;
