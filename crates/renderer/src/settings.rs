//! Conversions from [`EngineConfig`] into RHI and frame manager settings.

use ash::vk;
use ember_core::EngineConfig;
use ember_core::config::{DescriptorConfig, DescriptorKind, PoolConfig};
use ember_rhi::descriptor_allocator::{GrowthPolicy, PoolSizeRatio};

use crate::frame_manager::{FrameManagerDesc, FrameTimeouts};

pub fn descriptor_type(kind: DescriptorKind) -> vk::DescriptorType {
    match kind {
        DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        DescriptorKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        DescriptorKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
        DescriptorKind::Sampler => vk::DescriptorType::SAMPLER,
    }
}

pub fn pool_ratios(pool: &PoolConfig) -> Vec<PoolSizeRatio> {
    pool.ratios
        .iter()
        .map(|r| PoolSizeRatio::new(descriptor_type(r.kind), r.ratio))
        .collect()
}

pub fn growth_policy(descriptors: &DescriptorConfig) -> GrowthPolicy {
    GrowthPolicy {
        factor: descriptors.growth_factor,
        max_sets_per_pool: descriptors.max_sets_per_pool,
    }
}

impl FrameManagerDesc {
    /// Frame ring settings for an already validated configuration.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            frames_in_flight: config.frames_in_flight as usize,
            frame_descriptor_sets: config.descriptors.frame.initial_sets,
            frame_pool_ratios: pool_ratios(&config.descriptors.frame),
            growth: growth_policy(&config.descriptors),
            timeouts: FrameTimeouts {
                fence: config.timeouts.frame_fence(),
                acquire: config.timeouts.acquire(),
                flush: config.timeouts.flush(),
            },
        }
    }
}
