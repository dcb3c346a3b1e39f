//! GPU resources as owned values.
//!
//! A [`GpuResource`] is what gets handed to
//! [`GpuDevice::destroy`](crate::backend::GpuDevice::destroy), either
//! directly by an owning wrapper's `Drop` or later by a
//! [`DeletionQueue`](crate::deletion::DeletionQueue).

use std::fmt;

use ash::vk::{self, Handle};
use gpu_allocator::vulkan::Allocation;

/// A buffer handle together with the memory bound to it.
pub struct AllocatedBuffer {
    pub handle: vk::Buffer,
    pub size: vk::DeviceSize,
    /// `None` for buffers whose memory is not managed by gpu-allocator.
    pub allocation: Option<Allocation>,
}

/// An image handle together with the memory bound to it.
pub struct AllocatedImage {
    pub handle: vk::Image,
    pub allocation: Option<Allocation>,
}

/// Any resource the engine may need to destroy.
pub enum GpuResource {
    Buffer(AllocatedBuffer),
    Image(AllocatedImage),
    ImageView(vk::ImageView),
    Sampler(vk::Sampler),
    Pipeline(vk::Pipeline),
    PipelineLayout(vk::PipelineLayout),
    DescriptorPool(vk::DescriptorPool),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    Fence(vk::Fence),
    Semaphore(vk::Semaphore),
    CommandPool(vk::CommandPool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Image,
    ImageView,
    Sampler,
    Pipeline,
    PipelineLayout,
    DescriptorPool,
    DescriptorSetLayout,
    Fence,
    Semaphore,
    CommandPool,
}

impl GpuResource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Buffer(_) => ResourceKind::Buffer,
            Self::Image(_) => ResourceKind::Image,
            Self::ImageView(_) => ResourceKind::ImageView,
            Self::Sampler(_) => ResourceKind::Sampler,
            Self::Pipeline(_) => ResourceKind::Pipeline,
            Self::PipelineLayout(_) => ResourceKind::PipelineLayout,
            Self::DescriptorPool(_) => ResourceKind::DescriptorPool,
            Self::DescriptorSetLayout(_) => ResourceKind::DescriptorSetLayout,
            Self::Fence(_) => ResourceKind::Fence,
            Self::Semaphore(_) => ResourceKind::Semaphore,
            Self::CommandPool(_) => ResourceKind::CommandPool,
        }
    }

    /// Raw Vulkan handle value.
    pub fn raw(&self) -> u64 {
        match self {
            Self::Buffer(b) => b.handle.as_raw(),
            Self::Image(i) => i.handle.as_raw(),
            Self::ImageView(h) => h.as_raw(),
            Self::Sampler(h) => h.as_raw(),
            Self::Pipeline(h) => h.as_raw(),
            Self::PipelineLayout(h) => h.as_raw(),
            Self::DescriptorPool(h) => h.as_raw(),
            Self::DescriptorSetLayout(h) => h.as_raw(),
            Self::Fence(h) => h.as_raw(),
            Self::Semaphore(h) => h.as_raw(),
            Self::CommandPool(h) => h.as_raw(),
        }
    }
}

impl fmt::Debug for GpuResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:#x})", self.kind(), self.raw())
    }
}

impl fmt::Debug for AllocatedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatedBuffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("allocated", &self.allocation.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_raw() {
        let sampler = GpuResource::Sampler(vk::Sampler::from_raw(0x42));
        assert_eq!(sampler.kind(), ResourceKind::Sampler);
        assert_eq!(sampler.raw(), 0x42);

        let buffer = GpuResource::Buffer(AllocatedBuffer {
            handle: vk::Buffer::from_raw(7),
            size: 64,
            allocation: None,
        });
        assert_eq!(buffer.kind(), ResourceKind::Buffer);
        assert_eq!(format!("{buffer:?}"), "Buffer(0x7)");
    }
}
