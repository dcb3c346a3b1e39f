//! Growable descriptor set allocator.
//!
//! Hands out descriptor sets without the caller tracking pool capacity.
//! Pools live in one of two lists: *ready* (assumed to have room) and
//! *full* (an allocation from them has failed). When no ready pool is left
//! a new one is created, each new pool larger than the last by the growth
//! factor until the cap is reached.
//!
//! An allocation that exhausts a pool is retried exactly once against
//! another pool; a second exhaustion is returned as
//! [`RhiError::DescriptorPoolExhausted`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use ember_rhi::descriptor_allocator::{DescriptorAllocator, GrowthPolicy, PoolSizeRatio};
//! use ember_rhi::device::Device;
//!
//! # fn example(device: Arc<Device>, layout: vk::DescriptorSetLayout) -> Result<(), ember_rhi::RhiError> {
//! let ratios = [PoolSizeRatio::new(vk::DescriptorType::UNIFORM_BUFFER, 1.0)];
//! let mut allocator = DescriptorAllocator::new(device, 10, &ratios, GrowthPolicy::default())?;
//!
//! let set = allocator.allocate(layout)?;
//! // ... once the GPU is done with every set ...
//! allocator.reset_all()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, error, warn};

use crate::backend::GpuDevice;
use crate::error::{RhiError, RhiResult};
use crate::resource::GpuResource;

/// Relative weight of one descriptor type in a pool.
///
/// A pool sized for `n` sets receives `ceil(ratio * n)` descriptors of
/// type `ty` (at least one).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolSizeRatio {
    pub ty: vk::DescriptorType,
    pub ratio: f32,
}

impl PoolSizeRatio {
    pub const fn new(ty: vk::DescriptorType, ratio: f32) -> Self {
        Self { ty, ratio }
    }
}

/// How the capacity of successive pools grows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrowthPolicy {
    /// Multiplier applied to the capacity after each pool creation.
    pub factor: f32,
    /// No pool is ever created with more sets than this.
    pub max_sets_per_pool: u32,
}

impl GrowthPolicy {
    /// Capacity that follows a pool of `sets` sets.
    pub fn grow(&self, sets: u32) -> u32 {
        let grown = (f64::from(sets) * f64::from(self.factor)).floor();
        // `as` saturates for values past u32::MAX.
        (grown as u32).clamp(1, self.max_sets_per_pool)
    }
}

impl Default for GrowthPolicy {
    fn default() -> Self {
        Self {
            factor: 1.5,
            max_sets_per_pool: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PoolEntry {
    handle: vk::DescriptorPool,
    max_sets: u32,
}

/// Outcome of one allocation attempt against one pool.
enum PoolAttempt {
    Allocated(vk::DescriptorSet),
    /// The pool has no room left; another pool may succeed.
    Exhausted(vk::Result),
    /// Any other failure. Not retried.
    Failed(vk::Result),
}

impl PoolAttempt {
    fn classify(result: Result<vk::DescriptorSet, vk::Result>) -> Self {
        match result {
            Ok(set) => Self::Allocated(set),
            Err(
                code @ (vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL),
            ) => Self::Exhausted(code),
            Err(code) => Self::Failed(code),
        }
    }
}

/// Descriptor set allocator backed by a growing list of pools.
pub struct DescriptorAllocator<D: GpuDevice> {
    device: Arc<D>,
    ratios: Vec<PoolSizeRatio>,
    growth: GrowthPolicy,
    next_pool_capacity: u32,
    ready: Vec<PoolEntry>,
    full: Vec<PoolEntry>,
}

impl<D: GpuDevice> DescriptorAllocator<D> {
    /// Creates the allocator and its first pool of `initial_sets` sets.
    ///
    /// The next pool is sized `initial_sets * growth.factor`, capped at
    /// `growth.max_sets_per_pool`. An `initial_sets` above the cap is
    /// clamped to it.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidArgument`] for a zero capacity, an empty
    /// or non-positive ratio list, or a growth factor below 1; otherwise
    /// the device error if the first pool cannot be created.
    pub fn new(
        device: Arc<D>,
        initial_sets: u32,
        ratios: &[PoolSizeRatio],
        growth: GrowthPolicy,
    ) -> RhiResult<Self> {
        if initial_sets == 0 {
            return Err(RhiError::InvalidArgument(
                "descriptor allocator needs a non-zero initial capacity".into(),
            ));
        }
        if ratios.is_empty() {
            return Err(RhiError::InvalidArgument(
                "descriptor allocator needs at least one pool size ratio".into(),
            ));
        }
        if let Some(bad) = ratios.iter().find(|r| r.ratio.is_nan() || r.ratio <= 0.0) {
            return Err(RhiError::InvalidArgument(format!(
                "pool size ratio for {:?} must be positive, got {}",
                bad.ty, bad.ratio
            )));
        }
        if growth.factor.is_nan() || growth.factor < 1.0 || growth.max_sets_per_pool == 0 {
            return Err(RhiError::InvalidArgument(format!(
                "invalid growth policy: {growth:?}"
            )));
        }

        let initial_sets = if initial_sets > growth.max_sets_per_pool {
            warn!(
                "Initial descriptor capacity {} exceeds cap {}, clamping",
                initial_sets, growth.max_sets_per_pool
            );
            growth.max_sets_per_pool
        } else {
            initial_sets
        };

        let first = create_pool(device.as_ref(), initial_sets, ratios)?;

        Ok(Self {
            device,
            ratios: ratios.to_vec(),
            growth,
            next_pool_capacity: growth.grow(initial_sets),
            ready: vec![first],
            full: Vec::new(),
        })
    }

    /// Allocates one descriptor set of `layout`.
    ///
    /// # Errors
    ///
    /// - [`RhiError::DescriptorPoolExhausted`] if the retry pool is exhausted too
    /// - [`RhiError::DeviceOperation`] for any other allocation failure, or
    ///   if a new pool cannot be created
    pub fn allocate(&mut self, layout: vk::DescriptorSetLayout) -> RhiResult<vk::DescriptorSet> {
        let pool = self.get_pool()?;

        match self.attempt(pool, layout) {
            PoolAttempt::Allocated(set) => {
                self.ready.push(pool);
                Ok(set)
            }
            PoolAttempt::Failed(result) => {
                self.ready.push(pool);
                Err(RhiError::DeviceOperation {
                    operation: "descriptor set allocation",
                    result,
                })
            }
            PoolAttempt::Exhausted(result) => {
                debug!(
                    "Descriptor pool {:?} ({} sets) exhausted ({}), retrying",
                    pool.handle, pool.max_sets, result
                );
                self.full.push(pool);
                self.retry(layout)
            }
        }
    }

    fn retry(&mut self, layout: vk::DescriptorSetLayout) -> RhiResult<vk::DescriptorSet> {
        let pool = self.get_pool()?;

        match self.attempt(pool, layout) {
            PoolAttempt::Allocated(set) => {
                self.ready.push(pool);
                Ok(set)
            }
            PoolAttempt::Failed(result) => {
                self.ready.push(pool);
                Err(RhiError::DeviceOperation {
                    operation: "descriptor set allocation",
                    result,
                })
            }
            PoolAttempt::Exhausted(result) => {
                self.full.push(pool);
                error!(
                    "Descriptor allocation failed twice; pool of {} sets cannot fit layout {:?}",
                    pool.max_sets, layout
                );
                Err(RhiError::DescriptorPoolExhausted {
                    pool_capacity: pool.max_sets,
                    result,
                })
            }
        }
    }

    fn attempt(&self, pool: PoolEntry, layout: vk::DescriptorSetLayout) -> PoolAttempt {
        PoolAttempt::classify(self.device.allocate_descriptor_set(pool.handle, layout))
    }

    /// Pops a ready pool, or creates the next one and grows the capacity.
    fn get_pool(&mut self) -> RhiResult<PoolEntry> {
        if let Some(pool) = self.ready.pop() {
            return Ok(pool);
        }

        let pool = create_pool(self.device.as_ref(), self.next_pool_capacity, &self.ratios)?;
        self.next_pool_capacity = self.growth.grow(self.next_pool_capacity);
        debug!(
            "Descriptor allocator grew to {} pool(s), next capacity {}",
            self.pool_count() + 1,
            self.next_pool_capacity
        );
        Ok(pool)
    }

    /// Resets every pool, invalidating all sets allocated so far, and
    /// makes every pool ready again.
    pub fn reset_all(&mut self) -> RhiResult<()> {
        self.ready.append(&mut self.full);
        for pool in &self.ready {
            self.device.reset_descriptor_pool(pool.handle)?;
        }
        Ok(())
    }

    /// Destroys every pool. The allocator is empty afterwards; the next
    /// allocation creates a fresh pool.
    pub fn destroy_all(&mut self) {
        let count = self.pool_count();
        for pool in self.ready.drain(..).chain(self.full.drain(..)) {
            self.device.destroy(GpuResource::DescriptorPool(pool.handle));
        }
        if count > 0 {
            debug!("Destroyed {} descriptor pool(s)", count);
        }
    }

    /// Capacity of the next pool this allocator will create.
    #[inline]
    pub fn next_pool_capacity(&self) -> u32 {
        self.next_pool_capacity
    }

    #[inline]
    pub fn pool_count(&self) -> usize {
        self.ready.len() + self.full.len()
    }

    #[inline]
    pub fn ready_pool_count(&self) -> usize {
        self.ready.len()
    }

    #[inline]
    pub fn full_pool_count(&self) -> usize {
        self.full.len()
    }

    #[inline]
    pub fn growth(&self) -> GrowthPolicy {
        self.growth
    }
}

impl<D: GpuDevice> Drop for DescriptorAllocator<D> {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

fn create_pool<D: GpuDevice>(
    device: &D,
    max_sets: u32,
    ratios: &[PoolSizeRatio],
) -> RhiResult<PoolEntry> {
    let sizes = pool_sizes(max_sets, ratios);
    let handle = device.create_descriptor_pool(max_sets, &sizes)?;
    debug!("Created descriptor pool {:?} for {} sets", handle, max_sets);
    Ok(PoolEntry { handle, max_sets })
}

fn pool_sizes(max_sets: u32, ratios: &[PoolSizeRatio]) -> Vec<vk::DescriptorPoolSize> {
    ratios
        .iter()
        .map(|r| {
            let count = (f64::from(r.ratio) * f64::from(max_sets)).ceil() as u32;
            vk::DescriptorPoolSize::default()
                .ty(r.ty)
                .descriptor_count(count.max(1))
        })
        .collect()
}
