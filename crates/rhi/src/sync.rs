//! Synchronization primitives.
//!
//! - [`Semaphore`] - GPU-to-GPU ordering between queue operations
//! - [`Fence`] - GPU-to-CPU completion signal the host can wait on
//!
//! Both are owning wrappers: dropping one destroys the handle through the
//! device. Every host wait is bounded; an expired wait surfaces as
//! [`RhiError::Timeout`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ember_rhi::device::Device;
//! use ember_rhi::sync::{Fence, Semaphore};
//!
//! # fn example(device: Arc<Device>) -> Result<(), ember_rhi::RhiError> {
//! let image_acquired = Semaphore::new(device.clone())?;
//!
//! // Signaled so the first frame does not block.
//! let in_flight = Fence::new(device, true)?;
//! in_flight.wait(Duration::from_secs(1))?;
//! in_flight.reset()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::{debug, trace};

use crate::backend::{FenceWait, GpuDevice};
use crate::error::{RhiError, RhiResult};
use crate::resource::GpuResource;

/// GPU-to-GPU semaphore.
///
/// Created unsignaled. Used to order swapchain acquisition before
/// rendering, and rendering before presentation.
pub struct Semaphore<D: GpuDevice> {
    device: Arc<D>,
    semaphore: vk::Semaphore,
}

impl<D: GpuDevice> Semaphore<D> {
    /// Creates a new unsignaled semaphore.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn new(device: Arc<D>) -> RhiResult<Self> {
        let semaphore = device.create_semaphore()?;
        trace!("Created semaphore {:?}", semaphore);
        Ok(Self { device, semaphore })
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl<D: GpuDevice> Drop for Semaphore<D> {
    fn drop(&mut self) {
        self.device.destroy(GpuResource::Semaphore(self.semaphore));
        trace!("Destroyed semaphore");
    }
}

/// GPU-to-CPU fence.
pub struct Fence<D: GpuDevice> {
    device: Arc<D>,
    fence: vk::Fence,
}

impl<D: GpuDevice> Fence<D> {
    /// Creates a new fence.
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device
    /// * `signaled` - Create the fence already signaled. Frame fences start
    ///   signaled so the first wait on them returns at once.
    ///
    /// # Errors
    ///
    /// Returns an error if fence creation fails.
    pub fn new(device: Arc<D>, signaled: bool) -> RhiResult<Self> {
        let fence = device.create_fence(signaled)?;

        debug!(
            "Created fence {:?} ({})",
            fence,
            if signaled { "signaled" } else { "unsignaled" }
        );

        Ok(Self { device, fence })
    }

    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Blocks until the fence is signaled.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::Timeout`] if `timeout` expires first, or the
    /// device error if the wait itself fails.
    pub fn wait(&self, timeout: Duration) -> RhiResult<()> {
        match self.device.wait_fence(self.fence, timeout)? {
            FenceWait::Signaled => Ok(()),
            FenceWait::TimedOut => Err(RhiError::Timeout {
                operation: "fence wait",
                timeout,
            }),
        }
    }

    /// Resets the fence to the unsignaled state.
    ///
    /// The fence must not be pending on any queue.
    pub fn reset(&self) -> RhiResult<()> {
        self.device.reset_fence(self.fence)
    }

    /// Non-blocking status query.
    pub fn is_signaled(&self) -> RhiResult<bool> {
        self.device.fence_signaled(self.fence)
    }
}

impl<D: GpuDevice> Drop for Fence<D> {
    fn drop(&mut self) {
        self.device.destroy(GpuResource::Fence(self.fence));
        debug!("Destroyed fence");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::mock::{GpuMode, MockDevice};

    #[test]
    fn test_sync_objects_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Semaphore<Device>>();
        assert_send_sync::<Fence<Device>>();
        assert_send_sync::<Fence<MockDevice>>();
    }

    #[test]
    fn test_signaled_fence_wait_returns() {
        let device = MockDevice::new();
        let fence = Fence::new(device, true).unwrap();
        assert!(fence.is_signaled().unwrap());
        fence.wait(Duration::from_millis(1)).unwrap();
        fence.reset().unwrap();
        assert!(!fence.is_signaled().unwrap());
    }

    #[test]
    fn test_unsignaled_fence_wait_times_out() {
        let device = MockDevice::with_mode(GpuMode::Manual);
        let fence = Fence::new(device, false).unwrap();
        let err = fence.wait(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(
            err,
            RhiError::Timeout {
                operation: "fence wait",
                ..
            }
        ));
    }

    #[test]
    fn test_drop_destroys_handles() {
        let device = MockDevice::new();
        {
            let _fence = Fence::new(device.clone(), false).unwrap();
            let _semaphore = Semaphore::new(device.clone()).unwrap();
        }
        assert_eq!(device.destroyed_count(), 2);
        assert_eq!(device.live_fences(), 0);
    }
}
