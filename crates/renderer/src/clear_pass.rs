//! The per-frame work the renderer records.
//!
//! There is no pipeline yet, so a frame clears the swapchain image to a
//! color picked from a palette. The pass still goes through the whole
//! resource lifecycle a real pass would:
//! - the palette lives in a GPU-only storage buffer uploaded once through
//!   an [`ImmediateSubmit`] on the graphics family and bound by a set from
//!   the global allocator
//! - each frame writes a fresh uniform buffer, binds it with a set from
//!   the slot allocator and retires it into the slot deletion queue

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use ember_rhi::backend::{GpuDevice, Presenter, QueueKind};
use ember_rhi::buffer::{Buffer, BufferUsage};
use ember_rhi::command::ImageBarrier;
use ember_rhi::deletion::DeletionQueue;
use ember_rhi::descriptor::{DescriptorLayoutBuilder, DescriptorSetLayout, DescriptorWriter};
use ember_rhi::descriptor_allocator::DescriptorAllocator;
use ember_rhi::immediate::ImmediateSubmit;
use ember_rhi::{RhiError, RhiResult};

use crate::frame::FrameSlot;
use crate::frame_manager::FrameInfo;
use crate::ubo::FrameUniforms;

pub const DEFAULT_PALETTE: [[f32; 4]; 4] = [
    [0.10, 0.10, 0.15, 1.0],
    [0.35, 0.12, 0.08, 1.0],
    [0.08, 0.25, 0.20, 1.0],
    [0.20, 0.18, 0.35, 1.0],
];

/// Frames each palette color stays on screen.
pub const FRAMES_PER_COLOR: u64 = 120;

pub struct ClearPass<D: GpuDevice> {
    device: Arc<D>,
    colors: Vec<[f32; 4]>,
    palette: Buffer<D>,
    palette_set: vk::DescriptorSet,
    global_layout: DescriptorSetLayout<D>,
    frame_layout: DescriptorSetLayout<D>,
}

impl<D: GpuDevice> ClearPass<D> {
    /// Uploads `colors` and binds them with a set from `global`.
    ///
    /// Blocks until the upload has finished.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidArgument`] for an empty palette, or any
    /// buffer, upload or descriptor error.
    pub fn new(
        device: Arc<D>,
        immediate: &ImmediateSubmit<D>,
        global: &mut DescriptorAllocator<D>,
        colors: &[[f32; 4]],
    ) -> RhiResult<Self> {
        if colors.is_empty() {
            return Err(RhiError::InvalidArgument("palette must not be empty".into()));
        }
        // The palette is an exclusive buffer read by graphics work. Writing it
        // from another family would need an ownership transfer.
        let graphics = device.queue_family(QueueKind::Graphics);
        if device.queue_family(immediate.queue_kind()) != graphics {
            return Err(RhiError::InvalidArgument(format!(
                "palette upload on the {:?} queue would leave it owned by another family",
                immediate.queue_kind()
            )));
        }

        let bytes: &[u8] = bytemuck::cast_slice(colors);
        let staging = Buffer::new_with_data(
            device.clone(),
            "palette staging",
            BufferUsage::Staging,
            bytes,
        )?;
        let palette = Buffer::new(
            device.clone(),
            "palette",
            BufferUsage::Storage,
            bytes.len() as vk::DeviceSize,
        )?;
        immediate.submit(|cmd| {
            cmd.copy_buffer_whole(staging.handle(), palette.handle(), palette.size());
        })?;
        // The copy has completed, so the staging buffer can go right away.
        drop(staging);

        let global_layout = DescriptorLayoutBuilder::new()
            .add_binding(0, vk::DescriptorType::STORAGE_BUFFER)
            .build(device.clone(), vk::ShaderStageFlags::ALL)?;
        let frame_layout = DescriptorLayoutBuilder::new()
            .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER)
            .build(device.clone(), vk::ShaderStageFlags::ALL)?;

        let palette_set = global.allocate(global_layout.handle())?;
        DescriptorWriter::new()
            .write_buffer(
                0,
                palette.handle(),
                palette.size(),
                0,
                vk::DescriptorType::STORAGE_BUFFER,
            )
            .update_set(device.as_ref(), &global_layout, palette_set)?;

        info!(
            "Palette of {} colors uploaded via the {} queue",
            colors.len(),
            immediate.queue_kind().name()
        );

        Ok(Self {
            device,
            colors: colors.to_vec(),
            palette,
            palette_set,
            global_layout,
            frame_layout,
        })
    }

    /// Palette index shown on frame `frame_number`.
    pub fn palette_index(&self, frame_number: u64) -> usize {
        ((frame_number / FRAMES_PER_COLOR) % self.colors.len() as u64) as usize
    }

    /// Records the frame described by `info` into `slot`.
    ///
    /// Returns the slot-local descriptor set holding the frame uniforms.
    pub fn record(
        &self,
        slot: &mut FrameSlot<D>,
        info: &FrameInfo,
        presenter: &impl Presenter,
        time: f32,
    ) -> RhiResult<vk::DescriptorSet> {
        let image = presenter.image(info.image_index).ok_or_else(|| {
            RhiError::InvalidArgument(format!(
                "swapchain has no image {}",
                info.image_index
            ))
        })?;
        let index = self.palette_index(info.frame_number);
        let color = self.colors[index];

        let uniforms = FrameUniforms::new(color, time, info.frame_number, index as u32);
        let ubo = Buffer::new_with_data(
            self.device.clone(),
            "frame uniforms",
            BufferUsage::Uniform,
            bytemuck::bytes_of(&uniforms),
        )?;

        let set = slot.descriptors().allocate(self.frame_layout.handle())?;
        DescriptorWriter::new()
            .write_buffer(
                0,
                ubo.handle(),
                FrameUniforms::SIZE as vk::DeviceSize,
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
            )
            .update_set(self.device.as_ref(), &self.frame_layout, set)?;
        slot.deletion_queue().enqueue(ubo.retire());

        let cmd = slot.command_buffer();

        let mut to_transfer = ImageBarrier::transition(
            image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        // Chain with the acquire semaphore, which is waited at TRANSFER.
        to_transfer.src_stage = vk::PipelineStageFlags::TRANSFER;
        cmd.image_barrier(&to_transfer);
        cmd.clear_color_image(image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, color);
        cmd.image_barrier(&ImageBarrier::transition(
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        ));

        debug!(
            "Frame {} cleared image {} with palette color {}",
            info.frame_number, info.image_index, index
        );
        Ok(set)
    }

    #[inline]
    pub fn palette_set(&self) -> vk::DescriptorSet {
        self.palette_set
    }

    #[inline]
    pub fn global_layout(&self) -> &DescriptorSetLayout<D> {
        &self.global_layout
    }

    #[inline]
    pub fn frame_layout(&self) -> &DescriptorSetLayout<D> {
        &self.frame_layout
    }

    #[inline]
    pub fn palette_buffer(&self) -> vk::Buffer {
        self.palette.handle()
    }

    /// Hands the palette buffer to `queue`. The layouts are destroyed
    /// here, so no set allocated from them may still be in use.
    pub fn release(self, queue: &mut DeletionQueue<D>) {
        queue.enqueue(self.palette.retire());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ash::vk::Handle;
    use ember_rhi::backend::QueueKind;
    use ember_rhi::descriptor_allocator::{GrowthPolicy, PoolSizeRatio};
    use ember_rhi::mock::{MockDevice, MockEvent};

    use super::*;

    fn global_allocator(device: &Arc<MockDevice>) -> DescriptorAllocator<MockDevice> {
        DescriptorAllocator::new(
            device.clone(),
            4,
            &[PoolSizeRatio::new(vk::DescriptorType::STORAGE_BUFFER, 1.0)],
            GrowthPolicy::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_palette_is_uploaded_before_new_returns() {
        let device = MockDevice::new();
        let immediate =
            ImmediateSubmit::new(device.clone(), QueueKind::Graphics, Duration::from_secs(1))
                .unwrap();
        let mut global = global_allocator(&device);

        let pass = ClearPass::new(device.clone(), &immediate, &mut global, &DEFAULT_PALETTE).unwrap();

        let contents = device.buffer_contents(pass.palette_buffer()).unwrap();
        assert_eq!(contents, bytemuck::cast_slice::<_, u8>(&DEFAULT_PALETTE));
        assert!(device.events().iter().any(|e| matches!(
            e,
            MockEvent::UpdateDescriptors { set, .. } if *set == pass.palette_set().as_raw()
        )));
    }

    #[test]
    fn test_empty_palette_is_rejected() {
        let device = MockDevice::new();
        let immediate =
            ImmediateSubmit::new(device.clone(), QueueKind::Graphics, Duration::from_secs(1))
                .unwrap();
        let mut global = global_allocator(&device);
        assert!(matches!(
            ClearPass::new(device, &immediate, &mut global, &[]),
            Err(RhiError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_palette_upload_stays_on_the_graphics_family() {
        let device = MockDevice::builder().transfer_family(Some(1)).build();
        let mut global = global_allocator(&device);

        let transfer =
            ImmediateSubmit::new(device.clone(), QueueKind::Transfer, Duration::from_secs(1))
                .unwrap();
        assert_eq!(transfer.queue_kind(), QueueKind::Transfer);
        assert!(matches!(
            ClearPass::new(device.clone(), &transfer, &mut global, &DEFAULT_PALETTE),
            Err(RhiError::InvalidArgument(_))
        ));
        assert!(
            !device
                .events()
                .iter()
                .any(|e| matches!(e, MockEvent::Submit { .. }))
        );

        let graphics =
            ImmediateSubmit::new(device.clone(), QueueKind::Graphics, Duration::from_secs(1))
                .unwrap();
        ClearPass::new(device.clone(), &graphics, &mut global, &DEFAULT_PALETTE).unwrap();
        let queues: Vec<_> = device
            .events()
            .iter()
            .filter_map(|e| match e {
                MockEvent::Submit { queue, .. } => Some(*queue),
                _ => None,
            })
            .collect();
        assert_eq!(queues, vec![QueueKind::Graphics]);
    }

    #[test]
    fn test_record_rejects_unknown_image_index() {
        use ember_rhi::mock::MockPresenter;

        use crate::frame_manager::{FrameManager, FrameManagerDesc, FrameStart};

        let device = MockDevice::new();
        let presenter = MockPresenter::new(device.clone(), 2);
        let immediate =
            ImmediateSubmit::new(device.clone(), QueueKind::Graphics, Duration::from_secs(1))
                .unwrap();
        let mut global = global_allocator(&device);
        let pass = ClearPass::new(device.clone(), &immediate, &mut global, &DEFAULT_PALETTE).unwrap();
        let mut frames = FrameManager::new(device.clone(), FrameManagerDesc::default()).unwrap();

        let FrameStart::Ready(mut info) = frames.begin_frame(&presenter).unwrap() else {
            panic!("unexpected stale swapchain");
        };
        info.image_index = 7;
        let slot = frames.current_slot_mut().unwrap();
        assert!(matches!(
            pass.record(slot, &info, &presenter, 0.0),
            Err(RhiError::InvalidArgument(_))
        ));
        assert_eq!(slot.pending_deletions(), 0);
        assert_eq!(
            device.recorded_commands(slot.command_buffer().handle()),
            0
        );
        frames.end_frame(&presenter).unwrap();
    }

    #[test]
    fn test_palette_index_cycles() {
        let device = MockDevice::new();
        let immediate =
            ImmediateSubmit::new(device.clone(), QueueKind::Graphics, Duration::from_secs(1))
                .unwrap();
        let mut global = global_allocator(&device);
        let pass = ClearPass::new(device, &immediate, &mut global, &DEFAULT_PALETTE[..2]).unwrap();

        assert_eq!(pass.palette_index(0), 0);
        assert_eq!(pass.palette_index(FRAMES_PER_COLOR - 1), 0);
        assert_eq!(pass.palette_index(FRAMES_PER_COLOR), 1);
        assert_eq!(pass.palette_index(2 * FRAMES_PER_COLOR), 0);
    }
}
