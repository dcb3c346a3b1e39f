//! Synchronous one-off GPU submissions.
//!
//! [`ImmediateSubmit`] records a short command sequence, submits it and
//! blocks until the GPU has finished. It is meant for start-up uploads and
//! similar work outside the frame loop; calling it every frame would stall
//! the pipeline.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::{debug, info, warn};

use crate::backend::{GpuDevice, QueueKind, SubmitDesc};
use crate::command::{CommandBuffer, CommandPool};
use crate::error::{RhiError, RhiResult};
use crate::sync::Fence;

/// Blocking submit channel bound to one queue.
///
/// Owns its command pool, command buffer and fence. None of them are
/// shared with frame slots, so an immediate submit never waits on or
/// disturbs frame work beyond sharing the queue.
pub struct ImmediateSubmit<D: GpuDevice> {
    device: Arc<D>,
    kind: QueueKind,
    timeout: Duration,
    // Field order matters: the command buffer is freed with its pool.
    cmd: CommandBuffer<D>,
    _pool: CommandPool<D>,
    fence: Fence<D>,
}

impl<D: GpuDevice> ImmediateSubmit<D> {
    /// Creates a channel for `requested` queue work.
    ///
    /// Falls back to the graphics queue if the device has no queue family
    /// for `requested`.
    ///
    /// # Errors
    ///
    /// Returns an error if the device reports no graphics queue, or if the
    /// pool, command buffer or fence cannot be created.
    pub fn new(device: Arc<D>, requested: QueueKind, timeout: Duration) -> RhiResult<Self> {
        let (kind, family) = match device.queue_family(requested) {
            Some(family) => (requested, family),
            None => {
                let family = device
                    .queue_family(QueueKind::Graphics)
                    .ok_or(RhiError::InvalidState("device has no graphics queue"))?;
                warn!(
                    "No {} queue available, immediate submits fall back to graphics",
                    requested.name()
                );
                (QueueKind::Graphics, family)
            }
        };

        let pool = CommandPool::new(device.clone(), family)?;
        let cmd = CommandBuffer::new(device.clone(), &pool)?;
        // Signaled: the first submit resets it anyway, and a wait before
        // any submit must not block.
        let fence = Fence::new(device.clone(), true)?;

        info!(
            "Immediate submit channel ready on {} queue (family {})",
            kind.name(),
            family
        );

        Ok(Self {
            device,
            kind,
            timeout,
            cmd,
            _pool: pool,
            fence,
        })
    }

    /// Records commands with `record`, submits them and waits for the GPU
    /// to finish. Returns whatever `record` returned.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::Timeout`] if the GPU does not finish within the
    /// channel's timeout, or any device error along the way.
    pub fn submit<R>(&self, record: impl FnOnce(&CommandBuffer<D>) -> R) -> RhiResult<R> {
        self.fence.reset()?;
        self.cmd.reset()?;

        self.cmd.begin_one_time()?;
        let output = record(&self.cmd);
        self.cmd.end()?;

        let command_buffers = [self.cmd.handle()];
        self.device.submit(
            self.kind,
            &SubmitDesc {
                command_buffers: &command_buffers,
                fence: self.fence.handle(),
                ..Default::default()
            },
        )?;

        self.fence.wait(self.timeout).map_err(|e| match e {
            RhiError::Timeout { timeout, .. } => RhiError::Timeout {
                operation: "immediate submit",
                timeout,
            },
            other => other,
        })?;

        debug!("Immediate submit on {} queue complete", self.kind.name());
        Ok(output)
    }

    /// Queue this channel actually submits to.
    #[inline]
    pub fn queue_kind(&self) -> QueueKind {
        self.kind
    }

    #[inline]
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.cmd.handle()
    }

    #[inline]
    pub fn fence(&self) -> &Fence<D> {
        &self.fence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Buffer, BufferUsage};
    use crate::mock::{GpuMode, MockDevice, MockEvent};
    use ash::vk::Handle;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn test_copy_completes_before_return() {
        let device = MockDevice::with_mode(GpuMode::CompleteOnWait);
        let channel = ImmediateSubmit::new(device.clone(), QueueKind::Graphics, TIMEOUT).unwrap();

        let staging =
            Buffer::new_with_data(device.clone(), "staging", BufferUsage::Staging, &[1, 2, 3, 4])
                .unwrap();
        let target = Buffer::new(device.clone(), "target", BufferUsage::Storage, 4).unwrap();

        let recorded = channel
            .submit(|cmd| {
                cmd.copy_buffer_whole(staging.handle(), target.handle(), 4);
                7
            })
            .unwrap();
        assert_eq!(recorded, 7);

        assert!(channel.fence().is_signaled().unwrap());
        assert!(!device.command_buffer_pending(channel.command_buffer()));
        assert_eq!(device.buffer_contents(target.handle()).unwrap(), vec![1, 2, 3, 4]);
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn test_repeated_submits_reuse_the_same_objects() {
        let device = MockDevice::new();
        let channel = ImmediateSubmit::new(device.clone(), QueueKind::Graphics, TIMEOUT).unwrap();
        for _ in 0..3 {
            channel.submit(|_| ()).unwrap();
        }

        let submits: Vec<_> = device
            .events()
            .into_iter()
            .filter(|e| matches!(e, MockEvent::Submit { .. }))
            .collect();
        assert_eq!(submits.len(), 3);
        assert!(submits.iter().all(|e| matches!(
            e,
            MockEvent::Submit { queue: QueueKind::Graphics, fence, .. }
                if *fence == channel.fence().handle().as_raw()
        )));
        assert!(device.violations().is_empty());
    }

    #[test]
    fn test_missing_transfer_queue_falls_back_to_graphics() {
        let device = MockDevice::builder().transfer_family(None).build();
        let channel = ImmediateSubmit::new(device.clone(), QueueKind::Transfer, TIMEOUT).unwrap();
        assert_eq!(channel.queue_kind(), QueueKind::Graphics);

        channel.submit(|_| ()).unwrap();
        assert!(device.events().iter().any(|e| matches!(
            e,
            MockEvent::Submit {
                queue: QueueKind::Graphics,
                ..
            }
        )));
    }

    #[test]
    fn test_dedicated_transfer_queue_is_used() {
        let device = MockDevice::builder().transfer_family(Some(2)).build();
        let channel = ImmediateSubmit::new(device.clone(), QueueKind::Transfer, TIMEOUT).unwrap();
        assert_eq!(channel.queue_kind(), QueueKind::Transfer);
        channel.submit(|_| ()).unwrap();
    }

    #[test]
    fn test_hung_gpu_is_fatal() {
        let device = MockDevice::with_mode(GpuMode::Manual);
        let channel =
            ImmediateSubmit::new(device.clone(), QueueKind::Graphics, Duration::from_millis(10))
                .unwrap();

        let err = channel.submit(|_| ()).unwrap_err();
        assert!(matches!(
            err,
            RhiError::Timeout {
                operation: "immediate submit",
                ..
            }
        ));
    }
}
