//! Frame pacing.
//!
//! [`FrameManager`] keeps a ring of [`FrameSlot`]s so the CPU can record
//! frame `k` while the GPU still executes frames `k-1 .. k-N+1`. Slot
//! `k mod N` is reused only after its fence proves frame `k-N` finished.
//!
//! # Frame protocol
//!
//! ```text
//! begin_frame:  wait slot fence (once) -> flush slot deletion queue
//!               -> reset slot descriptors -> acquire image
//!               (out of date: return SwapchainStale, nothing else changes)
//!               -> reset fence -> reset + begin command buffer
//! (caller records into current_slot())
//! end_frame:    end command buffer -> submit (wait image_acquired,
//!               signal render_complete + fence) -> advance counter
//!               -> present (wait render_complete)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ember_renderer::frame_manager::{FrameEnd, FrameManager, FrameManagerDesc, FrameStart};
//! use ember_rhi::device::Device;
//! use ember_rhi::swapchain::Swapchain;
//!
//! # fn example(device: Arc<Device>, swapchain: &Swapchain) -> Result<(), ember_rhi::RhiError> {
//! let mut frames = FrameManager::new(device, FrameManagerDesc::default())?;
//! loop {
//!     let FrameStart::Ready(info) = frames.begin_frame(swapchain)? else {
//!         // rebuild the swapchain, then try again
//!         continue;
//!     };
//!     // record into frames.current_slot_mut() ...
//!     if frames.end_frame(swapchain)? == FrameEnd::SwapchainStale {
//!         // rebuild the swapchain
//!     }
//!     # let _ = info; break;
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::{debug, error, info, trace};

use ember_rhi::backend::{AcquireOutcome, GpuDevice, PresentOutcome, Presenter, QueueKind, SubmitDesc};
use ember_rhi::descriptor_allocator::{GrowthPolicy, PoolSizeRatio};
use ember_rhi::{RhiError, RhiResult};

use crate::frame::{FrameSlot, SlotState};

/// Pipeline stages that wait for the acquired image.
///
/// Frames write the image with transfer commands as well as attachments.
pub const ACQUIRE_WAIT_STAGES: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT.as_raw()
        | vk::PipelineStageFlags::TRANSFER.as_raw(),
);

/// Bounds on the blocking waits of the frame loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTimeouts {
    /// Slot fence wait in `begin_frame`
    pub fence: Duration,
    pub acquire: Duration,
    /// Fence wait when a slot deletion queue is flushed with a fence
    /// directly. `begin_frame` waits the slot fence itself and flushes
    /// without one.
    pub flush: Duration,
}

impl Default for FrameTimeouts {
    fn default() -> Self {
        Self {
            fence: Duration::from_secs(1),
            acquire: Duration::from_secs(1),
            flush: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameManagerDesc {
    pub frames_in_flight: usize,
    /// Initial capacity of each slot's descriptor allocator
    pub frame_descriptor_sets: u32,
    pub frame_pool_ratios: Vec<PoolSizeRatio>,
    pub growth: GrowthPolicy,
    pub timeouts: FrameTimeouts,
}

impl Default for FrameManagerDesc {
    fn default() -> Self {
        Self {
            frames_in_flight: 3,
            frame_descriptor_sets: 1000,
            frame_pool_ratios: vec![
                PoolSizeRatio::new(vk::DescriptorType::STORAGE_IMAGE, 3.0),
                PoolSizeRatio::new(vk::DescriptorType::STORAGE_BUFFER, 3.0),
                PoolSizeRatio::new(vk::DescriptorType::UNIFORM_BUFFER, 3.0),
                PoolSizeRatio::new(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 4.0),
            ],
            growth: GrowthPolicy::default(),
            timeouts: FrameTimeouts::default(),
        }
    }
}

/// The frame that [`FrameManager::begin_frame`] opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Value of the frame counter when the frame began
    pub frame_number: u64,
    pub slot: usize,
    pub image_index: u32,
    /// The acquire succeeded but the swapchain should be rebuilt soon
    pub suboptimal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStart {
    Ready(FrameInfo),
    /// No image could be acquired. Nothing was recorded or submitted and
    /// the frame counter did not advance.
    SwapchainStale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEnd {
    Presented,
    /// The frame was submitted, but the swapchain is out of date or
    /// suboptimal and should be rebuilt.
    SwapchainStale,
}

/// Ring of frame slots plus the per-frame protocol.
///
/// Driven from a single thread.
pub struct FrameManager<D: GpuDevice> {
    device: Arc<D>,
    slots: Vec<FrameSlot<D>>,
    frame_counter: u64,
    current: Option<FrameInfo>,
    timeouts: FrameTimeouts,
    shut_down: bool,
}

impl<D: GpuDevice> FrameManager<D> {
    /// Creates `desc.frames_in_flight` slots.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidArgument`] for a zero-sized ring, or the
    /// error of any slot resource creation.
    pub fn new(device: Arc<D>, desc: FrameManagerDesc) -> RhiResult<Self> {
        if desc.frames_in_flight == 0 {
            return Err(RhiError::InvalidArgument(
                "frames_in_flight must be at least 1".into(),
            ));
        }

        let slots = (0..desc.frames_in_flight)
            .map(|index| {
                FrameSlot::new(
                    device.clone(),
                    index,
                    desc.frame_descriptor_sets,
                    &desc.frame_pool_ratios,
                    desc.growth,
                    desc.timeouts.flush,
                )
            })
            .collect::<RhiResult<Vec<_>>>()?;

        info!("Frame manager created with {} frames in flight", slots.len());

        Ok(Self {
            device,
            slots,
            frame_counter: 0,
            current: None,
            timeouts: desc.timeouts,
            shut_down: false,
        })
    }

    /// Opens the next frame.
    ///
    /// # Errors
    ///
    /// - [`RhiError::InvalidState`] if a frame is already open or the
    ///   manager was shut down
    /// - [`RhiError::Timeout`] if the slot's previous frame does not finish
    ///   in time
    /// - any device or presentation error
    pub fn begin_frame(&mut self, presenter: &impl Presenter) -> RhiResult<FrameStart> {
        if self.shut_down {
            return Err(RhiError::InvalidState("begin_frame after shutdown"));
        }
        if self.current.is_some() {
            return Err(RhiError::InvalidState("begin_frame while a frame is open"));
        }

        let index = (self.frame_counter % self.slots.len() as u64) as usize;
        let slot = &mut self.slots[index];
        slot.recycle(self.timeouts.fence)?;

        let outcome =
            presenter.acquire_next_image(self.timeouts.acquire, slot.image_acquired().handle())?;
        let (image_index, suboptimal) = match outcome {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => (image_index, suboptimal),
            AcquireOutcome::OutOfDate => {
                debug!("Swapchain out of date at acquire (frame {})", self.frame_counter);
                return Ok(FrameStart::SwapchainStale);
            }
        };

        slot.fence().reset()?;
        let cmd = slot.command_buffer();
        cmd.reset()?;
        cmd.begin_one_time()?;
        slot.set_state(SlotState::Recording);

        let info = FrameInfo {
            frame_number: self.frame_counter,
            slot: index,
            image_index,
            suboptimal,
        };
        trace!("Frame {} began on slot {}", info.frame_number, index);
        self.current = Some(info);
        Ok(FrameStart::Ready(info))
    }

    /// The slot of the open frame, if any.
    pub fn current_slot(&self) -> Option<&FrameSlot<D>> {
        self.current.map(|info| &self.slots[info.slot])
    }

    pub fn current_slot_mut(&mut self) -> Option<&mut FrameSlot<D>> {
        self.current.map(|info| &mut self.slots[info.slot])
    }

    pub fn current_frame(&self) -> Option<FrameInfo> {
        self.current
    }

    /// Submits and presents the open frame.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] if no frame is open, or any
    /// device or presentation error.
    pub fn end_frame(&mut self, presenter: &impl Presenter) -> RhiResult<FrameEnd> {
        let info = self
            .current
            .take()
            .ok_or(RhiError::InvalidState("end_frame without an open frame"))?;
        let slot = &mut self.slots[info.slot];
        if slot.state() != SlotState::Recording {
            return Err(RhiError::InvalidState("end_frame on a slot that is not recording"));
        }

        let cmd = slot.command_buffer();
        cmd.end()?;

        let command_buffers = [cmd.handle()];
        let waits = [(slot.image_acquired().handle(), ACQUIRE_WAIT_STAGES)];
        let render_complete = slot.render_complete().handle();
        let signals = [render_complete];
        self.device.submit(
            QueueKind::Graphics,
            &SubmitDesc {
                command_buffers: &command_buffers,
                wait_semaphores: &waits,
                signal_semaphores: &signals,
                fence: slot.fence().handle(),
            },
        )?;
        slot.set_state(SlotState::Submitted);
        self.frame_counter += 1;

        let presented = presenter.present(info.image_index, render_complete)?;
        Ok(match presented {
            PresentOutcome::Presented if !info.suboptimal => FrameEnd::Presented,
            PresentOutcome::Presented | PresentOutcome::Suboptimal | PresentOutcome::OutOfDate => {
                debug!("Swapchain stale at present ({:?})", presented);
                FrameEnd::SwapchainStale
            }
        })
    }

    /// Blocks until every submitted slot has finished.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::Timeout`] if any slot does not finish in time.
    pub fn wait_all(&mut self, timeout: Duration) -> RhiResult<()> {
        for slot in &mut self.slots {
            if slot.state() == SlotState::Submitted {
                slot.fence().wait(timeout)?;
                slot.set_state(SlotState::Idle);
            }
        }
        Ok(())
    }

    /// Replaces every slot's semaphores.
    ///
    /// Called after a swapchain rebuild, with the device idle, so no
    /// semaphore is left signaled by an acquire whose frame never ran.
    pub fn renew_semaphores(&mut self) -> RhiResult<()> {
        for slot in &mut self.slots {
            slot.renew_semaphores(&self.device)?;
        }
        debug!("Frame semaphores renewed");
        Ok(())
    }

    /// Waits for all slots, then releases their deferred resources and
    /// descriptor pools. Idempotent.
    ///
    /// A frame that is still open is abandoned without being submitted.
    ///
    /// # Errors
    ///
    /// Returns an error if a slot does not finish in time; nothing is
    /// released in that case.
    pub fn shutdown(&mut self) -> RhiResult<()> {
        if self.shut_down {
            return Ok(());
        }

        if let Some(info) = self.current.take() {
            debug!("Abandoning open frame {}", info.frame_number);
            self.slots[info.slot].set_state(SlotState::Idle);
        }
        self.wait_all(self.timeouts.fence)?;

        let mut released = 0;
        for slot in &mut self.slots {
            released += slot.deletion_queue().flush(None)?;
            slot.descriptors().destroy_all();
        }
        self.shut_down = true;
        info!(
            "Frame manager shut down after {} frames ({} deferred resource(s) released)",
            self.frame_counter, released
        );
        Ok(())
    }

    /// Frames submitted so far.
    #[inline]
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> Option<&FrameSlot<D>> {
        self.slots.get(index)
    }

    #[inline]
    pub fn timeouts(&self) -> FrameTimeouts {
        self.timeouts
    }

    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }
}

impl<D: GpuDevice> Drop for FrameManager<D> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Frame manager shutdown failed during drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;
    use ember_rhi::buffer::{Buffer, BufferUsage};
    use ember_rhi::mock::{GpuMode, MockDevice, MockEvent, MockPresenter};
    use ember_rhi::resource::ResourceKind;

    use super::*;

    fn desc(frames_in_flight: usize) -> FrameManagerDesc {
        FrameManagerDesc {
            frames_in_flight,
            frame_descriptor_sets: 4,
            frame_pool_ratios: vec![PoolSizeRatio::new(vk::DescriptorType::UNIFORM_BUFFER, 1.0)],
            timeouts: FrameTimeouts {
                fence: Duration::from_millis(20),
                acquire: Duration::from_millis(20),
                flush: Duration::from_millis(20),
            },
            ..Default::default()
        }
    }

    fn ready(start: FrameStart) -> FrameInfo {
        match start {
            FrameStart::Ready(info) => info,
            FrameStart::SwapchainStale => panic!("unexpected stale swapchain"),
        }
    }

    #[test]
    fn test_slots_rotate_with_the_counter() {
        let device = MockDevice::with_mode(GpuMode::CompleteOnWait);
        let presenter = MockPresenter::new(device.clone(), 3);
        let mut frames = FrameManager::new(device.clone(), desc(2)).unwrap();

        for k in 0..6u64 {
            let info = ready(frames.begin_frame(&presenter).unwrap());
            assert_eq!(info.frame_number, k);
            assert_eq!(info.slot, (k % 2) as usize);
            assert_eq!(frames.end_frame(&presenter).unwrap(), FrameEnd::Presented);
        }

        assert_eq!(frames.frame_counter(), 6);
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn test_stale_acquire_changes_nothing() {
        let device = MockDevice::new();
        let presenter = MockPresenter::new(device.clone(), 2);
        let mut frames = FrameManager::new(device.clone(), desc(2)).unwrap();
        device.clear_events();

        presenter.script_acquire(AcquireOutcome::OutOfDate);
        assert_eq!(
            frames.begin_frame(&presenter).unwrap(),
            FrameStart::SwapchainStale
        );
        assert_eq!(frames.frame_counter(), 0);
        assert!(frames.current_slot().is_none());
        assert!(!device.events().iter().any(|e| matches!(
            e,
            MockEvent::ResetFence(_) | MockEvent::Submit { .. } | MockEvent::Begin(_)
        )));

        // The retry uses the same slot and frame number.
        let info = ready(frames.begin_frame(&presenter).unwrap());
        assert_eq!((info.frame_number, info.slot), (0, 0));
    }

    #[test]
    fn test_end_frame_without_begin_is_rejected() {
        let device = MockDevice::new();
        let presenter = MockPresenter::new(device.clone(), 2);
        let mut frames = FrameManager::new(device, desc(2)).unwrap();
        assert!(matches!(
            frames.end_frame(&presenter),
            Err(RhiError::InvalidState(_))
        ));
    }

    #[test]
    fn test_double_begin_is_rejected() {
        let device = MockDevice::new();
        let presenter = MockPresenter::new(device.clone(), 2);
        let mut frames = FrameManager::new(device, desc(2)).unwrap();
        ready(frames.begin_frame(&presenter).unwrap());
        assert!(matches!(
            frames.begin_frame(&presenter),
            Err(RhiError::InvalidState(_))
        ));
    }

    #[test]
    fn test_present_out_of_date_still_advances() {
        let device = MockDevice::new();
        let presenter = MockPresenter::new(device.clone(), 2);
        let mut frames = FrameManager::new(device.clone(), desc(2)).unwrap();

        ready(frames.begin_frame(&presenter).unwrap());
        presenter.script_present(PresentOutcome::OutOfDate);
        assert_eq!(
            frames.end_frame(&presenter).unwrap(),
            FrameEnd::SwapchainStale
        );
        assert_eq!(frames.frame_counter(), 1);
    }

    #[test]
    fn test_suboptimal_acquire_reports_stale_at_end() {
        let device = MockDevice::new();
        let presenter = MockPresenter::new(device.clone(), 2);
        let mut frames = FrameManager::new(device, desc(2)).unwrap();

        presenter.script_acquire(AcquireOutcome::Acquired {
            image_index: 1,
            suboptimal: true,
        });
        let info = ready(frames.begin_frame(&presenter).unwrap());
        assert!(info.suboptimal);
        assert_eq!(info.image_index, 1);
        assert_eq!(
            frames.end_frame(&presenter).unwrap(),
            FrameEnd::SwapchainStale
        );
    }

    #[test]
    fn test_slot_deletions_wait_for_the_slot_fence() {
        let device = MockDevice::with_mode(GpuMode::Manual);
        let presenter = MockPresenter::new(device.clone(), 2);
        let mut frames = FrameManager::new(device.clone(), desc(2)).unwrap();

        ready(frames.begin_frame(&presenter).unwrap());
        let ubo = Buffer::new(device.clone(), "ubo", BufferUsage::Uniform, 64).unwrap();
        let ubo_raw = ubo.handle().as_raw();
        let slot = frames.current_slot_mut().unwrap();
        slot.deletion_queue().enqueue(ubo.retire());
        let slot0_fence = slot.fence().handle().as_raw();
        frames.end_frame(&presenter).unwrap();

        ready(frames.begin_frame(&presenter).unwrap());
        frames.end_frame(&presenter).unwrap();

        // Slot 0 again: frame 0 has not completed.
        let err = frames.begin_frame(&presenter).unwrap_err();
        assert!(matches!(err, RhiError::Timeout { .. }));
        assert_eq!(device.destroyed_of_kind(ResourceKind::Buffer), 0);

        device.complete_all();
        ready(frames.begin_frame(&presenter).unwrap());

        let events = device.events();
        let signaled = events
            .iter()
            .position(|e| *e == MockEvent::FenceSignaled(slot0_fence))
            .unwrap();
        let destroyed = events
            .iter()
            .position(|e| *e == MockEvent::Destroy(ResourceKind::Buffer, ubo_raw))
            .unwrap();
        assert!(signaled < destroyed);
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn test_slot_descriptor_pools_reset_when_slot_returns() {
        let device = MockDevice::new();
        let presenter = MockPresenter::new(device.clone(), 2);
        let mut frames = FrameManager::new(device.clone(), desc(2)).unwrap();
        let layout = ember_rhi::descriptor::DescriptorLayoutBuilder::new()
            .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER)
            .build(device.clone(), vk::ShaderStageFlags::ALL)
            .unwrap();

        ready(frames.begin_frame(&presenter).unwrap());
        let slot = frames.current_slot_mut().unwrap();
        for _ in 0..10 {
            slot.descriptors().allocate(layout.handle()).unwrap();
        }
        let pools = slot.descriptors().pool_count();
        assert!(pools > 1);
        frames.end_frame(&presenter).unwrap();

        ready(frames.begin_frame(&presenter).unwrap());
        frames.end_frame(&presenter).unwrap();

        device.clear_events();
        ready(frames.begin_frame(&presenter).unwrap());
        let resets = device
            .events()
            .iter()
            .filter(|e| matches!(e, MockEvent::ResetDescriptorPool(_)))
            .count();
        assert_eq!(resets, pools);

        let slot = frames.current_slot_mut().unwrap();
        assert_eq!(slot.descriptors().full_pool_count(), 0);
        assert_eq!(slot.descriptors().ready_pool_count(), pools);
    }

    #[test]
    fn test_shutdown_releases_everything_once() {
        let device = MockDevice::with_mode(GpuMode::CompleteOnWait);
        let presenter = MockPresenter::new(device.clone(), 2);
        let mut frames = FrameManager::new(device.clone(), desc(3)).unwrap();
        assert_eq!(device.live_descriptor_pools(), 3);

        for _ in 0..4 {
            ready(frames.begin_frame(&presenter).unwrap());
            let ubo = Buffer::new(device.clone(), "ubo", BufferUsage::Uniform, 16).unwrap();
            frames
                .current_slot_mut()
                .unwrap()
                .deletion_queue()
                .enqueue(ubo.retire());
            frames.end_frame(&presenter).unwrap();
        }

        frames.shutdown().unwrap();
        assert_eq!(device.destroyed_of_kind(ResourceKind::Buffer), 4);
        assert_eq!(device.live_descriptor_pools(), 0);
        assert!(matches!(
            frames.begin_frame(&presenter),
            Err(RhiError::InvalidState(_))
        ));

        // Second shutdown (and the one in Drop) is a no-op.
        frames.shutdown().unwrap();
        drop(frames);
        assert_eq!(device.destroyed_of_kind(ResourceKind::Buffer), 4);
        assert_eq!(device.live_fences(), 0);
        assert_eq!(device.live_semaphores(), 0);
    }

    #[test]
    fn test_zero_frames_in_flight_is_rejected() {
        let device = MockDevice::new();
        assert!(matches!(
            FrameManager::new(device, desc(0)),
            Err(RhiError::InvalidArgument(_))
        ));
    }
}
