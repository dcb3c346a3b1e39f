//! Command pools and command buffers.
//!
//! - [`CommandPool`] owns a `VkCommandPool` for one queue family
//! - [`CommandBuffer`] records into a buffer allocated from such a pool
//! - [`ImageBarrier`] describes a layout transition
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ember_rhi::backend::{GpuDevice, QueueKind};
//! use ember_rhi::command::{CommandBuffer, CommandPool};
//! use ember_rhi::device::Device;
//!
//! # fn example(device: Arc<Device>) -> Result<(), ember_rhi::RhiError> {
//! let family = device.queue_family(QueueKind::Graphics).unwrap_or(0);
//! let pool = CommandPool::new(device.clone(), family)?;
//! let cmd = CommandBuffer::new(device, &pool)?;
//!
//! cmd.begin_one_time()?;
//! // ... record ...
//! cmd.end()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, warn};

use crate::backend::GpuDevice;
use crate::error::RhiResult;
use crate::resource::GpuResource;

/// Command pool for one queue family.
///
/// Created with `RESET_COMMAND_BUFFER` so buffers can be reset one by one.
/// Destroying the pool frees every buffer allocated from it.
pub struct CommandPool<D: GpuDevice> {
    device: Arc<D>,
    pool: vk::CommandPool,
    queue_family_index: u32,
}

impl<D: GpuDevice> CommandPool<D> {
    /// Creates a new command pool for `queue_family_index`.
    ///
    /// # Errors
    ///
    /// Returns an error if command pool creation fails.
    pub fn new(device: Arc<D>, queue_family_index: u32) -> RhiResult<Self> {
        let pool = device.create_command_pool(queue_family_index)?;

        debug!(
            "Command pool created for queue family {}",
            queue_family_index
        );

        Ok(Self {
            device,
            pool,
            queue_family_index,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Allocates a primary command buffer from this pool.
    pub fn allocate_command_buffer(&self) -> RhiResult<vk::CommandBuffer> {
        self.device.allocate_command_buffer(self.pool)
    }
}

impl<D: GpuDevice> Drop for CommandPool<D> {
    fn drop(&mut self) {
        self.device.destroy(GpuResource::CommandPool(self.pool));
        debug!(
            "Command pool destroyed for queue family {}",
            self.queue_family_index
        );
    }
}

/// Command buffer wrapper.
///
/// Does not own its handle: the handle is freed with the [`CommandPool`]
/// it came from, so the pool must outlive it.
pub struct CommandBuffer<D: GpuDevice> {
    device: Arc<D>,
    buffer: vk::CommandBuffer,
}

impl<D: GpuDevice> CommandBuffer<D> {
    /// Allocates a new primary command buffer from `pool`.
    pub fn new(device: Arc<D>, pool: &CommandPool<D>) -> RhiResult<Self> {
        let buffer = pool.allocate_command_buffer()?;
        Ok(Self { device, buffer })
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    // =========================================================================
    // Recording Control
    // =========================================================================

    /// Begins recording for a single submission.
    pub fn begin_one_time(&self) -> RhiResult<()> {
        self.device
            .begin_command_buffer(self.buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
    }

    /// Finishes recording.
    pub fn end(&self) -> RhiResult<()> {
        self.device.end_command_buffer(self.buffer)
    }

    /// Returns the buffer to the initial state.
    ///
    /// The GPU must have finished executing any previous submission of
    /// this buffer; callers guarantee that by waiting on its fence first.
    pub fn reset(&self) -> RhiResult<()> {
        self.device.reset_command_buffer(self.buffer)
    }

    // =========================================================================
    // Transfer Commands
    // =========================================================================

    /// Copies `regions` from `src` to `dst`.
    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        self.device.cmd_copy_buffer(self.buffer, src, dst, regions);
    }

    /// Copies the first `size` bytes of `src` into `dst`.
    pub fn copy_buffer_whole(&self, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) {
        let region = vk::BufferCopy::default().size(size);
        self.copy_buffer(src, dst, std::slice::from_ref(&region));
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    /// Records an image layout transition.
    pub fn image_barrier(&self, barrier: &ImageBarrier) {
        self.device.cmd_image_barrier(self.buffer, barrier);
    }

    // =========================================================================
    // Clear Commands
    // =========================================================================

    /// Clears every mip level and layer of a color image.
    pub fn clear_color_image(&self, image: vk::Image, layout: vk::ImageLayout, color: [f32; 4]) {
        self.device
            .cmd_clear_color_image(self.buffer, image, layout, color);
    }
}

/// An image memory barrier for a layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub dst_access: vk::AccessFlags,
    pub aspect_mask: vk::ImageAspectFlags,
}

impl ImageBarrier {
    /// Color-image transition with stage and access masks derived from the
    /// layout pair.
    pub fn transition(
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Self {
        let (src_stage, src_access, dst_stage, dst_access) = match (old_layout, new_layout) {
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => (
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::AccessFlags::empty(),
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_WRITE,
            ),
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL) => (
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::AccessFlags::empty(),
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ),
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR) => (
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::AccessFlags::empty(),
            ),
            (vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR) => (
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::AccessFlags::empty(),
            ),
            _ => {
                warn!(
                    "Unhandled layout transition: {:?} -> {:?}",
                    old_layout, new_layout
                );
                (
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                )
            }
        };

        Self {
            image,
            old_layout,
            new_layout,
            src_stage,
            src_access,
            dst_stage,
            dst_access,
            aspect_mask: vk::ImageAspectFlags::COLOR,
        }
    }

    /// Subresource range covering every mip level and layer.
    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        full_range(self.aspect_mask)
    }
}

pub(crate) fn full_range(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(aspect_mask)
        .base_mip_level(0)
        .level_count(vk::REMAINING_MIP_LEVELS)
        .base_array_layer(0)
        .layer_count(vk::REMAINING_ARRAY_LAYERS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::QueueKind;
    use crate::mock::{MockDevice, MockEvent};
    use ash::vk::Handle;

    #[test]
    fn test_transfer_to_present_masks() {
        let image = vk::Image::from_raw(9);
        let to_dst = ImageBarrier::transition(
            image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert_eq!(to_dst.dst_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(to_dst.dst_access, vk::AccessFlags::TRANSFER_WRITE);

        let to_present = ImageBarrier::transition(
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        assert_eq!(to_present.src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(to_present.dst_stage, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
    }

    #[test]
    fn test_unhandled_transition_is_conservative() {
        let barrier = ImageBarrier::transition(
            vk::Image::null(),
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(barrier.src_stage, vk::PipelineStageFlags::ALL_COMMANDS);
        assert_eq!(barrier.dst_stage, vk::PipelineStageFlags::ALL_COMMANDS);
    }

    #[test]
    fn test_recording_goes_through_device() {
        let device = MockDevice::new();
        let family = device.queue_family(QueueKind::Graphics).unwrap();
        let pool = CommandPool::new(device.clone(), family).unwrap();
        let cmd = CommandBuffer::new(device.clone(), &pool).unwrap();

        cmd.begin_one_time().unwrap();
        cmd.copy_buffer_whole(vk::Buffer::from_raw(1), vk::Buffer::from_raw(2), 16);
        cmd.end().unwrap();

        let events = device.events();
        assert!(events.contains(&MockEvent::Begin(cmd.handle().as_raw())));
        assert!(events.contains(&MockEvent::End(cmd.handle().as_raw())));
        assert_eq!(device.recorded_commands(cmd.handle()), 1);

        drop(pool);
        assert!(
            device
                .events()
                .iter()
                .any(|e| matches!(e, MockEvent::Destroy(crate::resource::ResourceKind::CommandPool, _)))
        );
    }
}
