//! GPU buffers.
//!
//! - [`BufferUsage`] picks Vulkan usage flags and a memory location
//! - [`Buffer`] owns a buffer and its memory; dropping it destroys both
//!   immediately, [`Buffer::retire`] hands them to a deletion queue instead
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ember_rhi::buffer::{Buffer, BufferUsage};
//! use ember_rhi::device::Device;
//!
//! # fn example(device: Arc<Device>) -> Result<(), ember_rhi::RhiError> {
//! let palette: [f32; 4] = [0.1, 0.2, 0.3, 1.0];
//! let staging = Buffer::new_with_data(
//!     device,
//!     "palette staging",
//!     BufferUsage::Staging,
//!     bytemuck::cast_slice(&palette),
//! )?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use tracing::debug;

use crate::backend::GpuDevice;
use crate::error::{RhiError, RhiResult};
use crate::resource::{AllocatedBuffer, GpuResource};

/// Buffer usage type.
///
/// Defines the intended use of the buffer, which affects
/// Vulkan usage flags and memory allocation strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    /// Uniform buffer, rewritten by the CPU every frame
    Uniform,
    /// Storage buffer, GPU-only and filled through a transfer
    Storage,
    /// Staging buffer, CPU-writable transfer source
    Staging,
}

impl BufferUsage {
    /// Converts to Vulkan buffer usage flags.
    pub fn to_vk_usage(self) -> vk::BufferUsageFlags {
        match self {
            BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            BufferUsage::Storage => {
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
        }
    }

    /// Returns the preferred memory location for this buffer type.
    pub fn memory_location(self) -> MemoryLocation {
        match self {
            BufferUsage::Uniform | BufferUsage::Staging => MemoryLocation::CpuToGpu,
            BufferUsage::Storage => MemoryLocation::GpuOnly,
        }
    }

    /// Whether the CPU can write the buffer's memory directly.
    pub fn host_visible(self) -> bool {
        self.memory_location() != MemoryLocation::GpuOnly
    }

    pub fn name(self) -> &'static str {
        match self {
            BufferUsage::Uniform => "uniform",
            BufferUsage::Storage => "storage",
            BufferUsage::Staging => "staging",
        }
    }
}

/// GPU buffer with managed memory.
pub struct Buffer<D: GpuDevice> {
    device: Arc<D>,
    /// `None` only after the buffer has been retired.
    inner: Option<AllocatedBuffer>,
    handle: vk::Buffer,
    size: vk::DeviceSize,
    usage: BufferUsage,
}

impl<D: GpuDevice> Buffer<D> {
    /// Creates a buffer of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero or if buffer or memory
    /// allocation fails.
    pub fn new(
        device: Arc<D>,
        name: &str,
        usage: BufferUsage,
        size: vk::DeviceSize,
    ) -> RhiResult<Self> {
        if size == 0 {
            return Err(RhiError::InvalidArgument(format!(
                "buffer '{name}' must have a non-zero size"
            )));
        }

        let inner = device.create_buffer(name, size, usage)?;
        debug!("Created {} buffer '{}': {} bytes", usage.name(), name, size);

        Ok(Self {
            device,
            handle: inner.handle,
            size,
            usage,
            inner: Some(inner),
        })
    }

    /// Creates a host-visible buffer holding `data`.
    pub fn new_with_data(
        device: Arc<D>,
        name: &str,
        usage: BufferUsage,
        data: &[u8],
    ) -> RhiResult<Self> {
        let mut buffer = Self::new(device, name, usage, data.len() as vk::DeviceSize)?;
        buffer.write_data(0, data)?;
        Ok(buffer)
    }

    /// Writes `data` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is not host-visible or the write
    /// would run past its end.
    pub fn write_data(&mut self, offset: vk::DeviceSize, data: &[u8]) -> RhiResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        if !self.usage.host_visible() {
            return Err(RhiError::InvalidArgument(format!(
                "{} buffers are not host-visible",
                self.usage.name()
            )));
        }

        let end = offset.checked_add(data.len() as vk::DeviceSize);
        if end.is_none_or(|end| end > self.size) {
            return Err(RhiError::InvalidArgument(format!(
                "write exceeds buffer size: offset {} + data {} > buffer {}",
                offset,
                data.len(),
                self.size
            )));
        }

        let inner = self
            .inner
            .as_mut()
            .ok_or(RhiError::InvalidState("buffer already retired"))?;
        self.device.write_buffer(inner, offset, data)
    }

    /// Gives up ownership so the buffer can be destroyed later, typically
    /// through a deletion queue guarded by the fence of the frame that
    /// last used it.
    pub fn retire(mut self) -> GpuResource {
        match self.inner.take() {
            Some(inner) => GpuResource::Buffer(inner),
            // `inner` is only taken here, and `self` is consumed.
            None => unreachable!("buffer retired twice"),
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }
}

impl<D: GpuDevice> Drop for Buffer<D> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            self.device.destroy(GpuResource::Buffer(inner));
            debug!("Destroyed {} buffer", self.usage.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockEvent};
    use crate::resource::ResourceKind;

    #[test]
    fn test_buffer_usage_to_vk_usage() {
        assert!(
            BufferUsage::Uniform
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::UNIFORM_BUFFER)
        );
        assert!(
            BufferUsage::Storage
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST)
        );
        assert!(
            BufferUsage::Staging
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::TRANSFER_SRC)
        );
    }

    #[test]
    fn test_buffer_usage_memory_location() {
        assert_eq!(
            BufferUsage::Uniform.memory_location(),
            MemoryLocation::CpuToGpu
        );
        assert_eq!(
            BufferUsage::Storage.memory_location(),
            MemoryLocation::GpuOnly
        );
        assert!(BufferUsage::Staging.host_visible());
        assert!(!BufferUsage::Storage.host_visible());
    }

    #[test]
    fn test_zero_size_rejected() {
        let device = MockDevice::new();
        let result = Buffer::new(device, "empty", BufferUsage::Uniform, 0);
        assert!(matches!(result, Err(RhiError::InvalidArgument(_))));
    }

    #[test]
    fn test_write_bounds_checked() {
        let device = MockDevice::new();
        let mut buffer = Buffer::new(device.clone(), "ubo", BufferUsage::Uniform, 8).unwrap();
        buffer.write_data(4, &[1, 2, 3, 4]).unwrap();
        assert!(buffer.write_data(6, &[1, 2, 3]).is_err());
        assert!(matches!(
            buffer.write_data(u64::MAX - 1, &[1, 2, 3]),
            Err(RhiError::InvalidArgument(_))
        ));
        assert_eq!(device.buffer_contents(buffer.handle()).unwrap()[4..], [1, 2, 3, 4]);
    }

    #[test]
    fn test_gpu_only_buffer_not_writable() {
        let device = MockDevice::new();
        let mut buffer = Buffer::new(device, "ssbo", BufferUsage::Storage, 16).unwrap();
        assert!(buffer.write_data(0, &[0; 4]).is_err());
    }

    #[test]
    fn test_drop_destroys_and_retire_defers() {
        let device = MockDevice::new();
        let dropped = Buffer::new(device.clone(), "a", BufferUsage::Uniform, 4).unwrap();
        let dropped_raw = dropped.handle();
        drop(dropped);
        assert!(device.events().contains(&MockEvent::Destroy(
            ResourceKind::Buffer,
            ash::vk::Handle::as_raw(dropped_raw)
        )));

        let retired = Buffer::new(device.clone(), "b", BufferUsage::Uniform, 4).unwrap();
        let before = device.destroyed_count();
        let resource = retired.retire();
        assert_eq!(device.destroyed_count(), before);
        assert_eq!(resource.kind(), ResourceKind::Buffer);
        device.destroy(resource);
        assert_eq!(device.destroyed_count(), before + 1);
    }
}
