//! Per-frame resources.

use std::sync::Arc;
use std::time::Duration;

use ember_rhi::{RhiError, RhiResult};
use ember_rhi::backend::{GpuDevice, QueueKind};
use ember_rhi::command::{CommandBuffer, CommandPool};
use ember_rhi::deletion::DeletionQueue;
use ember_rhi::descriptor_allocator::{DescriptorAllocator, GrowthPolicy, PoolSizeRatio};
use ember_rhi::sync::{Fence, Semaphore};

/// Where a slot is in its submit cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Not recording and no unwaited submission.
    Idle,
    /// Command buffer is open for recording.
    Recording,
    /// Work is on the GPU; the fence has not been waited yet.
    Submitted,
}

/// One entry of the frame ring.
///
/// Everything a frame touches that must outlive its recording lives here,
/// so reusing the slot is gated by a single fence:
///
/// ```text
/// fence wait -> deletion flush -> descriptor reset -> command re-record
/// ```
pub struct FrameSlot<D: GpuDevice> {
    index: usize,
    state: SlotState,
    // Field order: the command buffer is freed with its pool.
    cmd: CommandBuffer<D>,
    _pool: CommandPool<D>,
    fence: Fence<D>,
    image_acquired: Semaphore<D>,
    render_complete: Semaphore<D>,
    descriptors: DescriptorAllocator<D>,
    deletion: DeletionQueue<D>,
}

impl<D: GpuDevice> FrameSlot<D> {
    pub(crate) fn new(
        device: Arc<D>,
        index: usize,
        descriptor_sets: u32,
        ratios: &[PoolSizeRatio],
        growth: GrowthPolicy,
        flush_timeout: Duration,
    ) -> RhiResult<Self> {
        let family = device
            .queue_family(QueueKind::Graphics)
            .ok_or(RhiError::InvalidState("device has no graphics queue"))?;
        let pool = CommandPool::new(device.clone(), family)?;
        let cmd = CommandBuffer::new(device.clone(), &pool)?;

        Ok(Self {
            index,
            state: SlotState::Idle,
            cmd,
            _pool: pool,
            // Signaled so the first wait on a fresh slot returns at once.
            fence: Fence::new(device.clone(), true)?,
            image_acquired: Semaphore::new(device.clone())?,
            render_complete: Semaphore::new(device.clone())?,
            descriptors: DescriptorAllocator::new(
                device.clone(),
                descriptor_sets,
                ratios,
                growth,
            )?,
            deletion: DeletionQueue::new(device, format!("frame {index}"), flush_timeout),
        })
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn state(&self) -> SlotState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SlotState) {
        self.state = state;
    }

    #[inline]
    pub fn command_buffer(&self) -> &CommandBuffer<D> {
        &self.cmd
    }

    #[inline]
    pub fn fence(&self) -> &Fence<D> {
        &self.fence
    }

    #[inline]
    pub fn image_acquired(&self) -> &Semaphore<D> {
        &self.image_acquired
    }

    #[inline]
    pub fn render_complete(&self) -> &Semaphore<D> {
        &self.render_complete
    }

    /// Slot-local descriptor allocator, reset each time the slot comes
    /// around.
    #[inline]
    pub fn descriptors(&mut self) -> &mut DescriptorAllocator<D> {
        &mut self.descriptors
    }

    /// Slot-local deletion queue, flushed after the slot's fence signals.
    #[inline]
    pub fn deletion_queue(&mut self) -> &mut DeletionQueue<D> {
        &mut self.deletion
    }

    /// Resources waiting for this slot's fence.
    #[inline]
    pub fn pending_deletions(&self) -> usize {
        self.deletion.len()
    }

    /// Replaces both semaphores. The device must be idle.
    pub(crate) fn renew_semaphores(&mut self, device: &Arc<D>) -> RhiResult<()> {
        self.image_acquired = Semaphore::new(device.clone())?;
        self.render_complete = Semaphore::new(device.clone())?;
        Ok(())
    }

    /// Waits for the slot's last submission, then releases everything that
    /// submission could reference.
    ///
    /// The fence is waited exactly once. It covers every entry in the slot
    /// queue, so the flush itself does not wait again.
    pub(crate) fn recycle(&mut self, fence_timeout: Duration) -> RhiResult<()> {
        self.fence.wait(fence_timeout)?;
        self.state = SlotState::Idle;
        self.deletion.flush(None)?;
        self.descriptors.reset_all()
    }
}
