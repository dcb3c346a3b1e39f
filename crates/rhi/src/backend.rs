//! Device and presentation seams.
//!
//! Everything above this module talks to the GPU through [`GpuDevice`] and
//! [`Presenter`]. The ash-backed [`Device`](crate::device::Device) and
//! [`Swapchain`](crate::swapchain::Swapchain) implement them for real
//! hardware; [`MockDevice`](crate::mock::MockDevice) implements them for
//! tests.
//!
//! The seam deliberately uses raw `vk::*` handles. Ownership lives in the
//! wrappers built on top ([`Fence`](crate::sync::Fence),
//! [`CommandBuffer`](crate::command::CommandBuffer), ...), which release
//! their handle through [`GpuDevice::destroy`] exactly once.

use std::time::Duration;

use ash::vk;

use crate::buffer::BufferUsage;
use crate::command::ImageBarrier;
use crate::error::RhiResult;
use crate::resource::{AllocatedBuffer, GpuResource};

/// Queue a submission is directed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Transfer,
    Compute,
}

impl QueueKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Graphics => "graphics",
            Self::Transfer => "transfer",
            Self::Compute => "compute",
        }
    }
}

/// Result of a bounded fence wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceWait {
    Signaled,
    TimedOut,
}

/// One queue submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitDesc<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    /// Semaphores to wait on, each with the stage that waits.
    pub wait_semaphores: &'a [(vk::Semaphore, vk::PipelineStageFlags)],
    pub signal_semaphores: &'a [vk::Semaphore],
    /// Fence signaled when the whole submission completes, or null.
    pub fence: vk::Fence,
}

/// Logical GPU device as seen by the resource lifecycle code.
///
/// All methods take `&self`; implementations synchronize internally where
/// they hold mutable state (the memory allocator, mock bookkeeping).
pub trait GpuDevice: Send + Sync + 'static {
    // ===== Fences and semaphores =====

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence>;

    /// Block until `fence` signals or `timeout` expires.
    fn wait_fence(&self, fence: vk::Fence, timeout: Duration) -> RhiResult<FenceWait>;

    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()>;

    fn fence_signaled(&self, fence: vk::Fence) -> RhiResult<bool>;

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore>;

    // ===== Queues =====

    /// Queue family serving `kind`, or `None` if the device has no such
    /// queue. Graphics is always available.
    fn queue_family(&self, kind: QueueKind) -> Option<u32>;

    fn submit(&self, kind: QueueKind, desc: &SubmitDesc<'_>) -> RhiResult<()>;

    fn wait_idle(&self) -> RhiResult<()>;

    // ===== Command recording =====

    fn create_command_pool(&self, queue_family: u32) -> RhiResult<vk::CommandPool>;

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> RhiResult<vk::CommandBuffer>;

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> RhiResult<()>;

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> RhiResult<()>;

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> RhiResult<()>;

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    fn cmd_image_barrier(&self, cmd: vk::CommandBuffer, barrier: &ImageBarrier);

    fn cmd_clear_color_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: [f32; 4],
    );

    // ===== Descriptors =====

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> RhiResult<vk::DescriptorSetLayout>;

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> RhiResult<vk::DescriptorPool>;

    /// Allocate one set. The raw result code is returned so callers can
    /// tell pool exhaustion apart from fatal failures.
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, vk::Result>;

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()>;

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]);

    // ===== Memory =====

    fn create_buffer(&self, name: &str, size: u64, usage: BufferUsage)
    -> RhiResult<AllocatedBuffer>;

    /// Copy `data` into a host-visible buffer at `offset`.
    fn write_buffer(&self, buffer: &mut AllocatedBuffer, offset: u64, data: &[u8])
    -> RhiResult<()>;

    // ===== Teardown =====

    /// Release a resource and any memory bound to it.
    fn destroy(&self, resource: GpuResource);
}

/// Outcome of acquiring a presentable image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    /// The swapchain no longer matches the surface and must be rebuilt.
    OutOfDate,
}

/// Outcome of presenting an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// Presentation engine: a swapchain, or a test double.
pub trait Presenter {
    /// Acquire the next image, arranging for `signal` to be signaled once
    /// the image is ready to be written.
    fn acquire_next_image(
        &self,
        timeout: Duration,
        signal: vk::Semaphore,
    ) -> RhiResult<AcquireOutcome>;

    /// Queue `image_index` for presentation once `wait` is signaled.
    fn present(&self, image_index: u32, wait: vk::Semaphore) -> RhiResult<PresentOutcome>;

    /// Image backing `image_index`, or `None` if the index is out of range.
    fn image(&self, image_index: u32) -> Option<vk::Image>;

    fn extent(&self) -> vk::Extent2D;
}
