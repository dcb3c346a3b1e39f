//! Main renderer orchestration.
//!
//! [`Renderer`] is the composition root: it brings Vulkan up for a window,
//! owns every long-lived GPU object, and drives one frame per
//! [`render_frame`](Renderer::render_frame) call.
//!
//! # Resource Destruction Order
//!
//! 1. Wait for the device to go idle
//! 2. Shut the frame manager down (slot deletion queues, slot pools)
//! 3. Flush the global deletion queue
//! 4. Drop the remaining owners: immediate channel, global allocator,
//!    swapchain, device, surface, instance
//!
//! ManuallyDrop is used to make that order explicit.

use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::{debug, error, info};

use ember_core::{EngineConfig, FrameTimer};
use ember_platform::{Surface, Window, get_required_extensions};
use ember_rhi::backend::{GpuDevice, Presenter, QueueKind};
use ember_rhi::deletion::DeletionQueue;
use ember_rhi::descriptor_allocator::DescriptorAllocator;
use ember_rhi::device::Device;
use ember_rhi::immediate::ImmediateSubmit;
use ember_rhi::instance::Instance;
use ember_rhi::physical_device::select_physical_device;
use ember_rhi::swapchain::Swapchain;
use ember_rhi::{RhiError, RhiResult};

use crate::clear_pass::{ClearPass, DEFAULT_PALETTE};
use crate::frame_manager::{FrameEnd, FrameManager, FrameManagerDesc, FrameStart};
use crate::settings::{growth_policy, pool_ratios};

/// How often average frame statistics are logged.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

pub struct Renderer {
    clear_pass: ManuallyDrop<ClearPass<Device>>,
    frames: ManuallyDrop<FrameManager<Device>>,
    immediate: ManuallyDrop<ImmediateSubmit<Device>>,
    global_descriptors: ManuallyDrop<DescriptorAllocator<Device>>,
    global_deletion: ManuallyDrop<DeletionQueue<Device>>,
    swapchain: ManuallyDrop<Swapchain>,
    device: ManuallyDrop<Arc<Device>>,
    surface: ManuallyDrop<Surface>,
    instance: ManuallyDrop<Instance>,

    timer: FrameTimer,
    width: u32,
    height: u32,
    /// Set when acquire or present reported the swapchain stale, or the
    /// window changed size.
    swapchain_stale: bool,
    minimized: bool,
}

impl Renderer {
    /// Brings Vulkan up for `window`.
    ///
    /// # Errors
    ///
    /// Returns an error if any part of the bring-up fails.
    pub fn new(window: &Window, config: &EngineConfig) -> RhiResult<Self> {
        let width = window.width();
        let height = window.height();
        info!("Initializing renderer ({}x{})", width, height);

        let display = window
            .display_handle()
            .map_err(|e| RhiError::SurfaceError(e.to_string()))?;
        let extensions = get_required_extensions(display.as_raw())
            .map_err(|e| RhiError::SurfaceError(e.to_string()))?;

        let instance = Instance::new(config.validation, &extensions)?;
        let surface = window
            .create_surface(instance.entry(), instance.handle())
            .map_err(|e| RhiError::SurfaceError(e.to_string()))?;

        let physical = select_physical_device(instance.handle(), surface.handle(), surface.loader())?;
        let device = Device::new(&instance, &physical)?;

        let swapchain = Swapchain::new(
            &instance,
            device.clone(),
            surface.handle(),
            surface.loader(),
            width,
            height,
            config.window.vsync,
        )?;

        let frames = FrameManager::new(device.clone(), FrameManagerDesc::from_config(config))?;
        // Uploads feed exclusive buffers read by graphics work.
        let immediate = ImmediateSubmit::new(
            device.clone(),
            QueueKind::Graphics,
            config.timeouts.immediate(),
        )?;

        let descriptors = &config.descriptors;
        let mut global_descriptors = DescriptorAllocator::new(
            device.clone(),
            descriptors.global.initial_sets,
            &pool_ratios(&descriptors.global),
            growth_policy(descriptors),
        )?;
        let global_deletion = DeletionQueue::new(device.clone(), "global", config.timeouts.flush());

        let clear_pass = ClearPass::new(
            device.clone(),
            &immediate,
            &mut global_descriptors,
            &DEFAULT_PALETTE,
        )?;

        info!(
            "Renderer initialized on {}: {} swapchain images, {} frames in flight",
            physical.device_name(),
            swapchain.image_count(),
            frames.frames_in_flight()
        );

        Ok(Self {
            clear_pass: ManuallyDrop::new(clear_pass),
            frames: ManuallyDrop::new(frames),
            immediate: ManuallyDrop::new(immediate),
            global_descriptors: ManuallyDrop::new(global_descriptors),
            global_deletion: ManuallyDrop::new(global_deletion),
            swapchain: ManuallyDrop::new(swapchain),
            device: ManuallyDrop::new(device),
            surface: ManuallyDrop::new(surface),
            instance: ManuallyDrop::new(instance),
            timer: FrameTimer::new(STATS_INTERVAL),
            width,
            height,
            swapchain_stale: false,
            minimized: false,
        })
    }

    /// Notifies the renderer that the window has been resized.
    ///
    /// The swapchain is rebuilt at the start of the next frame.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            debug!("Window minimized, pausing rendering");
            self.minimized = true;
            return;
        }

        self.minimized = false;
        if width != self.width || height != self.height {
            debug!(
                "Resize triggered: {}x{} -> {}x{}",
                self.width, self.height, width, height
            );
            self.width = width;
            self.height = height;
            self.swapchain_stale = true;
        }
    }

    /// Renders and presents one frame.
    ///
    /// A stale swapchain is not an error: the frame is skipped or
    /// presented as is, and the swapchain is rebuilt before the next one.
    ///
    /// # Errors
    ///
    /// Returns an error on any fatal device failure, including a timed out
    /// fence wait.
    pub fn render_frame(&mut self) -> RhiResult<()> {
        if self.minimized {
            return Ok(());
        }
        if self.swapchain_stale {
            self.rebuild_swapchain()?;
        }

        let info = match self.frames.begin_frame(&*self.swapchain)? {
            FrameStart::Ready(info) => info,
            FrameStart::SwapchainStale => {
                self.swapchain_stale = true;
                return Ok(());
            }
        };

        let time = self.timer.elapsed().as_secs_f32();
        let slot = self
            .frames
            .current_slot_mut()
            .ok_or(RhiError::InvalidState("frame began without a slot"))?;
        self.clear_pass.record(slot, &info, &*self.swapchain, time)?;

        if self.frames.end_frame(&*self.swapchain)? == FrameEnd::SwapchainStale {
            self.swapchain_stale = true;
        }

        self.timer.tick();
        if let Some(stats) = self.timer.take_report() {
            info!(
                "{:.1} fps ({:.2} ms/frame over {} frames)",
                stats.fps, stats.avg_frame_ms, stats.frames
            );
        }
        Ok(())
    }

    fn rebuild_swapchain(&mut self) -> RhiResult<()> {
        // Waits idle, so every slot fence has signaled afterwards.
        self.swapchain.recreate(self.width, self.height)?;
        self.frames.renew_semaphores()?;
        self.swapchain_stale = false;
        Ok(())
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    pub fn format(&self) -> vk::Format {
        self.swapchain.format()
    }

    /// Frames submitted so far.
    pub fn frame_count(&self) -> u64 {
        self.frames.frame_counter()
    }

    fn teardown(&mut self) -> RhiResult<()> {
        self.device.wait_idle()?;
        self.frames.shutdown()?;

        // SAFETY: `clear_pass` is not touched again after this take.
        let clear_pass = unsafe { ManuallyDrop::take(&mut self.clear_pass) };
        clear_pass.release(&mut self.global_deletion);
        let released = self.global_deletion.flush(None)?;
        debug!("Released {} global resource(s)", released);
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            // Resources still referenced by the GPU are leaked rather
            // than destroyed early.
            error!("Renderer teardown failed: {}", e);
            return;
        }

        // SAFETY: each field is dropped exactly once, in dependency order,
        // and never used afterwards. `clear_pass` was taken in teardown.
        unsafe {
            ManuallyDrop::drop(&mut self.frames);
            ManuallyDrop::drop(&mut self.immediate);
            ManuallyDrop::drop(&mut self.global_descriptors);
            ManuallyDrop::drop(&mut self.global_deletion);
            ManuallyDrop::drop(&mut self.swapchain);
            ManuallyDrop::drop(&mut self.device);
            ManuallyDrop::drop(&mut self.surface);
            ManuallyDrop::drop(&mut self.instance);
        }

        info!("Renderer destroyed");
    }
}
