//! Deferred destruction of GPU resources.
//!
//! A resource referenced by submitted GPU work cannot be destroyed until
//! that work completes. [`DeletionQueue`] holds such resources and releases
//! them in [`DeletionQueue::flush`], after waiting on a fence that covers
//! every submission that may still reference them.
//!
//! Two queues are used by the renderer:
//! - one per frame slot, flushed with that slot's fence when the slot is
//!   reused
//! - one global queue, flushed without a fence at shutdown after the
//!   device has gone idle
//!
//! Entries are released newest first, so a dependent resource queued after
//! the resource it depends on (a view after its image) goes first.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, trace};

use crate::backend::GpuDevice;
use crate::error::RhiResult;
use crate::resource::{GpuResource, ResourceKind};
use crate::sync::Fence;

/// LIFO queue of resources waiting for the GPU to finish with them.
pub struct DeletionQueue<D: GpuDevice> {
    device: Arc<D>,
    label: String,
    pending: Vec<GpuResource>,
    timeout: Duration,
}

impl<D: GpuDevice> DeletionQueue<D> {
    /// Creates an empty queue. `timeout` bounds the fence wait in
    /// [`flush`](Self::flush).
    pub fn new(device: Arc<D>, label: impl Into<String>, timeout: Duration) -> Self {
        Self {
            device,
            label: label.into(),
            pending: Vec::new(),
            timeout,
        }
    }

    /// Queues `resource` for destruction at the next flush.
    pub fn enqueue(&mut self, resource: GpuResource) {
        trace!("[{}] queued {:?}", self.label, resource);
        self.pending.push(resource);
    }

    /// Destroys every queued resource, newest first.
    ///
    /// With `Some(fence)`, blocks until the fence signals before destroying
    /// anything. The fence must cover every submission that may reference a
    /// queued resource. With `None` the caller guarantees the GPU is idle.
    ///
    /// Returns the number of resources destroyed.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::Timeout`](crate::RhiError::Timeout) if the fence
    /// does not signal in time. No resource is destroyed in that case and
    /// the queue keeps all its entries.
    pub fn flush(&mut self, fence: Option<&Fence<D>>) -> RhiResult<usize> {
        if let Some(fence) = fence {
            fence.wait(self.timeout).inspect_err(|e| {
                error!(
                    "[{}] not flushing {} resource(s): {}",
                    self.label,
                    self.pending.len(),
                    e
                );
            })?;
        }

        let count = self.pending.len();
        while let Some(resource) = self.pending.pop() {
            self.device.destroy(resource);
        }

        if count > 0 {
            debug!("[{}] destroyed {} deferred resource(s)", self.label, count);
        }
        Ok(count)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Kinds of the queued resources, oldest first.
    pub fn pending_kinds(&self) -> Vec<ResourceKind> {
        self.pending.iter().map(GpuResource::kind).collect()
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl<D: GpuDevice> Drop for DeletionQueue<D> {
    fn drop(&mut self) {
        // Without a fence there is no proof the GPU is done with these.
        if !self.pending.is_empty() {
            error!(
                "[{}] dropped with {} unflushed resource(s); leaking them",
                self.label,
                self.pending.len()
            );
            for resource in self.pending.drain(..) {
                std::mem::forget(resource);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use ash::vk::{self, Handle};

    use super::*;
    use crate::RhiError;
    use crate::backend::{QueueKind, SubmitDesc};
    use crate::mock::{GpuMode, MockDevice, MockEvent};

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn submit_with(device: &MockDevice, fence: &Fence<MockDevice>) {
        device
            .submit(
                QueueKind::Graphics,
                &SubmitDesc {
                    fence: fence.handle(),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    fn destroyed_order(device: &MockDevice) -> Vec<(ResourceKind, u64)> {
        device
            .events()
            .into_iter()
            .filter_map(|e| match e {
                MockEvent::Destroy(kind, raw) => Some((kind, raw)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_flush_releases_newest_first() {
        let device = MockDevice::new();
        let mut queue = DeletionQueue::new(device.clone(), "test", TIMEOUT);

        queue.enqueue(GpuResource::Image(crate::resource::AllocatedImage {
            handle: vk::Image::from_raw(0xA),
            allocation: None,
        }));
        queue.enqueue(GpuResource::ImageView(vk::ImageView::from_raw(0xB)));
        queue.enqueue(GpuResource::Sampler(vk::Sampler::from_raw(0xC)));
        assert_eq!(
            queue.pending_kinds(),
            vec![ResourceKind::Image, ResourceKind::ImageView, ResourceKind::Sampler]
        );

        assert_eq!(queue.flush(None).unwrap(), 3);
        assert!(queue.is_empty());
        assert_eq!(
            destroyed_order(&device),
            vec![
                (ResourceKind::Sampler, 0xC),
                (ResourceKind::ImageView, 0xB),
                (ResourceKind::Image, 0xA),
            ]
        );
    }

    #[test]
    fn test_unsignaled_fence_destroys_nothing() {
        let device = MockDevice::with_mode(GpuMode::Manual);
        let fence = Fence::new(device.clone(), false).unwrap();
        submit_with(&device, &fence);

        let mut queue = DeletionQueue::new(device.clone(), "frame", Duration::from_millis(10));
        queue.enqueue(GpuResource::Sampler(vk::Sampler::from_raw(1)));
        queue.enqueue(GpuResource::Pipeline(vk::Pipeline::from_raw(2)));

        let err = queue.flush(Some(&fence)).unwrap_err();
        assert!(matches!(err, RhiError::Timeout { .. }));
        assert_eq!(queue.len(), 2);
        assert!(destroyed_order(&device).is_empty());

        // Once the GPU catches up the same entries are released.
        device.complete_all();
        assert_eq!(queue.flush(Some(&fence)).unwrap(), 2);
        assert_eq!(destroyed_order(&device).len(), 2);
    }

    #[test]
    fn test_flush_waits_for_fence_signaled_from_another_thread() {
        let device = MockDevice::with_mode(GpuMode::Manual);
        let fence = Fence::new(device.clone(), false).unwrap();
        submit_with(&device, &fence);

        let mut queue = DeletionQueue::new(device.clone(), "frame", TIMEOUT);
        queue.enqueue(GpuResource::Buffer(crate::resource::AllocatedBuffer {
            handle: vk::Buffer::from_raw(0x10),
            size: 64,
            allocation: None,
        }));

        let gpu = {
            let device = device.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                device.complete_all();
            })
        };

        assert_eq!(queue.flush(Some(&fence)).unwrap(), 1);
        gpu.join().unwrap();

        // The destruction is logged after the fence signal.
        let events = device.events();
        let signaled = events
            .iter()
            .position(|e| *e == MockEvent::FenceSignaled(fence.handle().as_raw()))
            .unwrap();
        let destroyed = events
            .iter()
            .position(|e| *e == MockEvent::Destroy(ResourceKind::Buffer, 0x10))
            .unwrap();
        assert!(signaled < destroyed);
    }

    #[test]
    fn test_buffer_read_by_pending_copy_is_kept_until_fence() {
        use crate::buffer::{Buffer, BufferUsage};
        use crate::command::{CommandBuffer, CommandPool};

        let device = MockDevice::with_mode(GpuMode::Manual);
        let pool = CommandPool::new(device.clone(), 0).unwrap();
        let cmd = CommandBuffer::new(device.clone(), &pool).unwrap();
        let fence = Fence::new(device.clone(), false).unwrap();
        let staging = Buffer::new(device.clone(), "staging", BufferUsage::Staging, 16).unwrap();
        let target = Buffer::new(device.clone(), "target", BufferUsage::Storage, 16).unwrap();

        cmd.begin_one_time().unwrap();
        cmd.copy_buffer_whole(staging.handle(), target.handle(), 16);
        cmd.end().unwrap();
        device
            .submit(
                QueueKind::Graphics,
                &SubmitDesc {
                    command_buffers: &[cmd.handle()],
                    fence: fence.handle(),
                    ..Default::default()
                },
            )
            .unwrap();

        let mut queue = DeletionQueue::new(device.clone(), "frame", Duration::from_millis(10));
        queue.enqueue(staging.retire());
        assert!(queue.flush(Some(&fence)).is_err());

        device.complete_all();
        assert_eq!(queue.flush(Some(&fence)).unwrap(), 1);
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn test_flush_empty_queue() {
        let device = MockDevice::new();
        let fence = Fence::new(device.clone(), true).unwrap();
        let mut queue = DeletionQueue::new(device.clone(), "empty", TIMEOUT);
        assert_eq!(queue.flush(Some(&fence)).unwrap(), 0);
    }

    #[test]
    fn test_drop_without_flush_leaks() {
        let device = MockDevice::new();
        {
            let mut queue = DeletionQueue::new(device.clone(), "leaky", TIMEOUT);
            queue.enqueue(GpuResource::Sampler(vk::Sampler::from_raw(3)));
        }
        assert!(destroyed_order(&device).is_empty());
    }
}
