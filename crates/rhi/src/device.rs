//! Vulkan logical device.
//!
//! [`Device`] owns the `VkDevice`, its queues and the gpu-allocator
//! instance, and implements [`GpuDevice`] on top of them.
//!
//! Queues are created for every distinct family reported by
//! [`QueueFamilyIndices`]. Transfer and compute queues exist only when the
//! GPU has dedicated families for them; otherwise
//! [`GpuDevice::queue_family`] answers `None` for those kinds and callers
//! use the graphics queue.

use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use gpu_allocator::vulkan::{
    AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::backend::{FenceWait, GpuDevice, QueueKind, SubmitDesc};
use crate::buffer::BufferUsage;
use crate::command::{ImageBarrier, full_range};
use crate::error::{RhiError, RhiResult};
use crate::instance::Instance;
use crate::physical_device::{PhysicalDeviceInfo, QueueFamilyIndices};
use crate::resource::{AllocatedBuffer, GpuResource};

const DEVICE_EXTENSIONS: &[&std::ffi::CStr] = &[ash::khr::swapchain::NAME];

/// Vulkan logical device with its queues and memory allocator.
///
/// Shared as `Arc<Device>`. Queue submission and allocator access are
/// serialized internally, so every method takes `&self`.
pub struct Device {
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    allocator: ManuallyDrop<Mutex<Allocator>>,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    transfer_queue: Option<vk::Queue>,
    compute_queue: Option<vk::Queue>,
    queue_families: QueueFamilyIndices,
    // vkQueueSubmit and vkQueuePresentKHR need external synchronization.
    queue_lock: Mutex<()>,
}

impl Device {
    /// Creates the logical device, its queues and the allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if device creation or allocator initialization
    /// fails.
    pub fn new(instance: &Instance, info: &PhysicalDeviceInfo) -> RhiResult<Arc<Self>> {
        let families = info.queue_families;
        let graphics_family = families
            .graphics_family
            .ok_or(RhiError::InvalidState("physical device has no graphics family"))?;
        let present_family = families
            .present_family
            .ok_or(RhiError::InvalidState("physical device has no present family"))?;

        let priorities = [1.0f32];
        let unique = families.unique_families();
        let queue_infos: Vec<_> = unique
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
            })
            .collect();
        debug!("Creating queues for families {:?}", unique);

        let extension_names: Vec<_> = DEVICE_EXTENSIONS.iter().map(|e| e.as_ptr()).collect();
        let features = vk::PhysicalDeviceFeatures::default();
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&features);

        // SAFETY: create_info only borrows locals that outlive the call.
        let device = unsafe {
            instance
                .handle()
                .create_device(info.device, &create_info, None)?
        };

        // SAFETY: one queue was requested for each of these families.
        let queue = |family: u32| unsafe { device.get_device_queue(family, 0) };
        let graphics_queue = queue(graphics_family);
        let present_queue = queue(present_family);
        let transfer_queue = families.transfer_family.map(queue);
        let compute_queue = families.compute_family.map(queue);

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.clone(),
            physical_device: info.device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                // SAFETY: nothing has been created from the device yet.
                unsafe { device.destroy_device(None) };
                return Err(e.into());
            }
        };

        info!(
            "Logical device ready: graphics family {}, present family {}, transfer {:?}, compute {:?}",
            graphics_family, present_family, families.transfer_family, families.compute_family
        );

        Ok(Arc::new(Self {
            device,
            physical_device: info.device,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            graphics_queue,
            present_queue,
            transfer_queue,
            compute_queue,
            queue_families: families,
            queue_lock: Mutex::new(()),
        }))
    }

    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    #[inline]
    pub fn queue_families(&self) -> &QueueFamilyIndices {
        &self.queue_families
    }

    /// Presents on the present queue under the queue lock.
    pub(crate) fn queue_present(
        &self,
        loader: &ash::khr::swapchain::Device,
        present_info: &vk::PresentInfoKHR<'_>,
    ) -> Result<bool, vk::Result> {
        let _guard = self.queue_lock.lock();
        // SAFETY: the queue is externally synchronized by queue_lock.
        unsafe { loader.queue_present(self.present_queue, present_info) }
    }

    fn queue(&self, kind: QueueKind) -> Option<vk::Queue> {
        match kind {
            QueueKind::Graphics => Some(self.graphics_queue),
            QueueKind::Transfer => self.transfer_queue,
            QueueKind::Compute => self.compute_queue,
        }
    }

    fn free_allocation(&self, allocation: Option<gpu_allocator::vulkan::Allocation>) {
        if let Some(allocation) = allocation
            && let Err(e) = self.allocator.lock().free(allocation)
        {
            error!("Failed to free GPU allocation: {}", e);
        }
    }
}

fn timeout_ns(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

impl GpuDevice for Device {
    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        // SAFETY: valid device, no external references.
        unsafe { self.device.create_fence(&info, None) }.map_err(RhiError::device("create fence"))
    }

    fn wait_fence(&self, fence: vk::Fence, timeout: Duration) -> RhiResult<FenceWait> {
        // SAFETY: the fence belongs to this device.
        match unsafe {
            self.device
                .wait_for_fences(&[fence], true, timeout_ns(timeout))
        } {
            Ok(()) => Ok(FenceWait::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceWait::TimedOut),
            Err(result) => Err(RhiError::DeviceOperation {
                operation: "wait for fence",
                result,
            }),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()> {
        // SAFETY: callers only reset fences with no pending submission.
        unsafe { self.device.reset_fences(&[fence]) }.map_err(RhiError::device("reset fence"))
    }

    fn fence_signaled(&self, fence: vk::Fence) -> RhiResult<bool> {
        // SAFETY: the fence belongs to this device.
        unsafe { self.device.get_fence_status(fence) }.map_err(RhiError::device("fence status"))
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        // SAFETY: valid device.
        unsafe { self.device.create_semaphore(&info, None) }
            .map_err(RhiError::device("create semaphore"))
    }

    fn queue_family(&self, kind: QueueKind) -> Option<u32> {
        match kind {
            QueueKind::Graphics => self.queue_families.graphics_family,
            QueueKind::Transfer => self.queue_families.transfer_family,
            QueueKind::Compute => self.queue_families.compute_family,
        }
    }

    fn submit(&self, kind: QueueKind, desc: &SubmitDesc<'_>) -> RhiResult<()> {
        let queue = self
            .queue(kind)
            .ok_or(RhiError::InvalidState("submit to a queue the device lacks"))?;

        let (wait_semaphores, wait_stages): (Vec<_>, Vec<_>) =
            desc.wait_semaphores.iter().copied().unzip();
        let submit = vk::SubmitInfo::default()
            .command_buffers(desc.command_buffers)
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(desc.signal_semaphores);

        let _guard = self.queue_lock.lock();
        // SAFETY: the queue is externally synchronized by queue_lock; the
        // command buffers are in the executable state.
        unsafe { self.device.queue_submit(queue, &[submit], desc.fence) }
            .map_err(RhiError::device("queue submit"))
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let _guard = self.queue_lock.lock();
        // SAFETY: holding queue_lock keeps every queue idle of new work.
        unsafe { self.device.device_wait_idle() }.map_err(RhiError::device("device wait idle"))
    }

    fn create_command_pool(&self, queue_family: u32) -> RhiResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);
        // SAFETY: valid device.
        unsafe { self.device.create_command_pool(&info, None) }
            .map_err(RhiError::device("create command pool"))
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> RhiResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        // SAFETY: the pool is only used from the thread that owns it.
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }
            .map_err(RhiError::device("allocate command buffer"))?;
        buffers
            .into_iter()
            .next()
            .ok_or(RhiError::InvalidState("driver returned no command buffer"))
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> RhiResult<()> {
        // SAFETY: callers reset only after the fence covering cmd signaled.
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        }
        .map_err(RhiError::device("reset command buffer"))
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> RhiResult<()> {
        let info = vk::CommandBufferBeginInfo::default().flags(flags);
        // SAFETY: cmd is in the initial state.
        unsafe { self.device.begin_command_buffer(cmd, &info) }
            .map_err(RhiError::device("begin command buffer"))
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> RhiResult<()> {
        // SAFETY: cmd is in the recording state.
        unsafe { self.device.end_command_buffer(cmd) }
            .map_err(RhiError::device("end command buffer"))
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: cmd is recording; regions are within both buffers.
        unsafe { self.device.cmd_copy_buffer(cmd, src, dst, regions) };
    }

    fn cmd_image_barrier(&self, cmd: vk::CommandBuffer, barrier: &ImageBarrier) {
        let image_barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(barrier.src_access)
            .dst_access_mask(barrier.dst_access)
            .old_layout(barrier.old_layout)
            .new_layout(barrier.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(barrier.image)
            .subresource_range(barrier.subresource_range());
        // SAFETY: cmd is recording.
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                barrier.src_stage,
                barrier.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[image_barrier],
            );
        }
    }

    fn cmd_clear_color_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: [f32; 4],
    ) {
        let value = vk::ClearColorValue { float32: color };
        let range = full_range(vk::ImageAspectFlags::COLOR);
        // SAFETY: cmd is recording and image is in `layout`.
        unsafe {
            self.device
                .cmd_clear_color_image(cmd, image, layout, &value, &[range]);
        }
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> RhiResult<vk::DescriptorSetLayout> {
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
        // SAFETY: valid device.
        unsafe { self.device.create_descriptor_set_layout(&info, None) }
            .map_err(RhiError::device("create descriptor set layout"))
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> RhiResult<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(sizes);
        // SAFETY: valid device.
        unsafe { self.device.create_descriptor_pool(&info, None) }
            .map_err(RhiError::device("create descriptor pool"))
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, vk::Result> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        // SAFETY: the pool is owned by a single allocator.
        let sets = unsafe { self.device.allocate_descriptor_sets(&info) }?;
        sets.into_iter().next().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()> {
        // SAFETY: no set from this pool is referenced by pending work.
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
        }
        .map_err(RhiError::device("reset descriptor pool"))
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        // SAFETY: the target sets are not in use by pending work.
        unsafe { self.device.update_descriptor_sets(writes, &[]) };
    }

    fn create_buffer(
        &self,
        name: &str,
        size: u64,
        usage: BufferUsage,
    ) -> RhiResult<AllocatedBuffer> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage.to_vk_usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        // SAFETY: valid device.
        let handle = unsafe { self.device.create_buffer(&info, None) }
            .map_err(RhiError::device("create buffer"))?;
        // SAFETY: handle was just created.
        let requirements = unsafe { self.device.get_buffer_memory_requirements(handle) };

        let allocation = self.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: usage.memory_location(),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                // SAFETY: the buffer has no memory bound and is unused.
                unsafe { self.device.destroy_buffer(handle, None) };
                return Err(e.into());
            }
        };

        // SAFETY: the allocation satisfies the buffer's requirements.
        if let Err(result) = unsafe {
            self.device
                .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        } {
            self.free_allocation(Some(allocation));
            // SAFETY: the buffer is unused.
            unsafe { self.device.destroy_buffer(handle, None) };
            return Err(RhiError::DeviceOperation {
                operation: "bind buffer memory",
                result,
            });
        }

        debug!("Created {} buffer '{}' ({} bytes)", usage.name(), name, size);
        Ok(AllocatedBuffer {
            handle,
            size,
            allocation: Some(allocation),
        })
    }

    fn write_buffer(
        &self,
        buffer: &mut AllocatedBuffer,
        offset: u64,
        data: &[u8],
    ) -> RhiResult<()> {
        let mapped = buffer
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or(RhiError::InvalidState("buffer memory is not host mapped"))?;
        let start = offset as usize;
        let target = mapped
            .get_mut(start..start + data.len())
            .ok_or_else(|| RhiError::InvalidArgument("write past end of mapping".into()))?;
        target.copy_from_slice(data);
        Ok(())
    }

    fn destroy(&self, resource: GpuResource) {
        let device = &self.device;
        // SAFETY: resources reach this point only once the GPU no longer
        // references them (owner drop after idle, or a fenced flush).
        unsafe {
            match resource {
                GpuResource::Buffer(buffer) => {
                    device.destroy_buffer(buffer.handle, None);
                    self.free_allocation(buffer.allocation);
                }
                GpuResource::Image(image) => {
                    device.destroy_image(image.handle, None);
                    self.free_allocation(image.allocation);
                }
                GpuResource::ImageView(h) => device.destroy_image_view(h, None),
                GpuResource::Sampler(h) => device.destroy_sampler(h, None),
                GpuResource::Pipeline(h) => device.destroy_pipeline(h, None),
                GpuResource::PipelineLayout(h) => device.destroy_pipeline_layout(h, None),
                GpuResource::DescriptorPool(h) => device.destroy_descriptor_pool(h, None),
                GpuResource::DescriptorSetLayout(h) => {
                    device.destroy_descriptor_set_layout(h, None)
                }
                GpuResource::Fence(h) => device.destroy_fence(h, None),
                GpuResource::Semaphore(h) => device.destroy_semaphore(h, None),
                GpuResource::CommandPool(h) => device.destroy_command_pool(h, None),
            }
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // SAFETY: this is the last reference to the device. The allocator
        // must release its memory blocks while the device still exists.
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Failed to wait for device idle during drop: {:?}", e);
            }
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
        info!("Logical device destroyed");
    }
}

// SAFETY: ash::Device is a table of function pointers plus a handle, queues
// are externally synchronized by queue_lock and the allocator by its mutex.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}
