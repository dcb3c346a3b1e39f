//! Descriptor set layouts and descriptor writes.
//!
//! - [`DescriptorLayoutBuilder`] collects bindings into a [`DescriptorSetLayout`]
//! - [`DescriptorWriter`] batches buffer and image writes into one update
//!
//! A layout remembers its bindings, and the writer checks every write
//! against them before touching the device: a write to an undeclared
//! binding, or with a descriptor type other than the declared one, is
//! rejected instead of silently rebinding the slot.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use ember_rhi::descriptor::{DescriptorLayoutBuilder, DescriptorWriter};
//! use ember_rhi::device::Device;
//!
//! # fn example(device: Arc<Device>, set: vk::DescriptorSet, ubo: vk::Buffer) -> Result<(), ember_rhi::RhiError> {
//! let layout = DescriptorLayoutBuilder::new()
//!     .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER)
//!     .build(device.clone(), vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)?;
//!
//! let mut writer = DescriptorWriter::new();
//! writer.write_buffer(0, ubo, 256, 0, vk::DescriptorType::UNIFORM_BUFFER);
//! writer.update_set(device.as_ref(), &layout, set)?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::backend::GpuDevice;
use crate::error::{RhiError, RhiResult};
use crate::resource::GpuResource;

/// One binding of a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

impl LayoutBinding {
    fn to_vk(self) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(self.binding)
            .descriptor_type(self.ty)
            .descriptor_count(self.count)
            .stage_flags(self.stages)
    }
}

/// Descriptor set layout that remembers its bindings.
pub struct DescriptorSetLayout<D: GpuDevice> {
    device: Arc<D>,
    layout: vk::DescriptorSetLayout,
    bindings: Vec<LayoutBinding>,
}

impl<D: GpuDevice> DescriptorSetLayout<D> {
    /// Creates a layout from explicit bindings.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidArgument`] if two bindings share a number,
    /// or the device error if creation fails.
    pub fn new(device: Arc<D>, bindings: &[LayoutBinding]) -> RhiResult<Self> {
        for (i, b) in bindings.iter().enumerate() {
            if bindings[..i].iter().any(|other| other.binding == b.binding) {
                return Err(RhiError::InvalidArgument(format!(
                    "binding {} declared twice",
                    b.binding
                )));
            }
        }

        let vk_bindings: Vec<_> = bindings.iter().map(|b| b.to_vk()).collect();
        let layout = device.create_descriptor_set_layout(&vk_bindings)?;

        debug!(
            "Created descriptor set layout with {} binding(s)",
            bindings.len()
        );

        Ok(Self {
            device,
            layout,
            bindings: bindings.to_vec(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    #[inline]
    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }

    pub fn binding(&self, binding: u32) -> Option<&LayoutBinding> {
        self.bindings.iter().find(|b| b.binding == binding)
    }
}

impl<D: GpuDevice> Drop for DescriptorSetLayout<D> {
    fn drop(&mut self) {
        self.device
            .destroy(GpuResource::DescriptorSetLayout(self.layout));
        debug!("Destroyed descriptor set layout");
    }
}

/// Accumulates bindings for a [`DescriptorSetLayout`].
#[derive(Debug, Default, Clone)]
pub struct DescriptorLayoutBuilder {
    bindings: Vec<(u32, vk::DescriptorType)>,
}

impl DescriptorLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a single-descriptor binding.
    pub fn add_binding(mut self, binding: u32, ty: vk::DescriptorType) -> Self {
        self.bindings.push((binding, ty));
        self
    }

    pub fn add_bindings(
        mut self,
        bindings: impl IntoIterator<Item = (u32, vk::DescriptorType)>,
    ) -> Self {
        self.bindings.extend(bindings);
        self
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }

    /// Creates the layout with every binding visible to `stages`.
    pub fn build<D: GpuDevice>(
        &self,
        device: Arc<D>,
        stages: vk::ShaderStageFlags,
    ) -> RhiResult<DescriptorSetLayout<D>> {
        let bindings: Vec<_> = self
            .bindings
            .iter()
            .map(|&(binding, ty)| LayoutBinding {
                binding,
                ty,
                count: 1,
                stages,
            })
            .collect();
        DescriptorSetLayout::new(device, &bindings)
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteInfo {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
}

#[derive(Debug, Clone, Copy)]
struct PendingWrite {
    binding: u32,
    ty: vk::DescriptorType,
    info: WriteInfo,
}

/// Batches descriptor writes and applies them to a set in one update.
#[derive(Debug, Default, Clone)]
pub struct DescriptorWriter {
    writes: Vec<PendingWrite>,
}

impl DescriptorWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_buffer(
        &mut self,
        binding: u32,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
        offset: vk::DeviceSize,
        ty: vk::DescriptorType,
    ) -> &mut Self {
        let info = vk::DescriptorBufferInfo::default()
            .buffer(buffer)
            .offset(offset)
            .range(size);
        self.writes.push(PendingWrite {
            binding,
            ty,
            info: WriteInfo::Buffer(info),
        });
        self
    }

    pub fn write_image(
        &mut self,
        binding: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
        ty: vk::DescriptorType,
    ) -> &mut Self {
        let info = vk::DescriptorImageInfo::default()
            .image_view(view)
            .sampler(sampler)
            .image_layout(layout);
        self.writes.push(PendingWrite {
            binding,
            ty,
            info: WriteInfo::Image(info),
        });
        self
    }

    pub fn clear(&mut self) {
        self.writes.clear();
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Checks every pending write against `layout`.
    ///
    /// # Errors
    ///
    /// - [`RhiError::InvalidArgument`] if a buffer write uses an image
    ///   descriptor type or vice versa
    /// - [`RhiError::UnknownBinding`] if the layout does not declare the binding
    /// - [`RhiError::BindingTypeMismatch`] if the declared type differs
    pub fn validate<D: GpuDevice>(&self, layout: &DescriptorSetLayout<D>) -> RhiResult<()> {
        for write in &self.writes {
            let info_matches = match write.info {
                WriteInfo::Buffer(_) => is_buffer_type(write.ty),
                WriteInfo::Image(_) => is_image_type(write.ty),
            };
            if !info_matches {
                return Err(RhiError::InvalidArgument(format!(
                    "binding {}: {:?} cannot be written with {} info",
                    write.binding,
                    write.ty,
                    match write.info {
                        WriteInfo::Buffer(_) => "buffer",
                        WriteInfo::Image(_) => "image",
                    }
                )));
            }

            let declared = layout
                .binding(write.binding)
                .ok_or(RhiError::UnknownBinding {
                    binding: write.binding,
                })?;
            if declared.ty != write.ty {
                return Err(RhiError::BindingTypeMismatch {
                    binding: write.binding,
                    expected: declared.ty,
                    found: write.ty,
                });
            }
        }
        Ok(())
    }

    /// Validates, then writes every pending descriptor into `set`.
    ///
    /// Nothing is written if validation fails.
    pub fn update_set<D: GpuDevice>(
        &self,
        device: &D,
        layout: &DescriptorSetLayout<D>,
        set: vk::DescriptorSet,
    ) -> RhiResult<()> {
        self.validate(layout)?;

        let writes: Vec<_> = self
            .writes
            .iter()
            .map(|write| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(write.binding)
                    .dst_array_element(0)
                    .descriptor_type(write.ty);
                match &write.info {
                    WriteInfo::Buffer(info) => base.buffer_info(std::slice::from_ref(info)),
                    WriteInfo::Image(info) => base.image_info(std::slice::from_ref(info)),
                }
            })
            .collect();

        device.update_descriptor_sets(&writes);
        Ok(())
    }
}

fn is_buffer_type(ty: vk::DescriptorType) -> bool {
    matches!(
        ty,
        vk::DescriptorType::UNIFORM_BUFFER
            | vk::DescriptorType::STORAGE_BUFFER
            | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
            | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
    )
}

fn is_image_type(ty: vk::DescriptorType) -> bool {
    matches!(
        ty,
        vk::DescriptorType::SAMPLER
            | vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            | vk::DescriptorType::SAMPLED_IMAGE
            | vk::DescriptorType::STORAGE_IMAGE
            | vk::DescriptorType::INPUT_ATTACHMENT
    )
}
