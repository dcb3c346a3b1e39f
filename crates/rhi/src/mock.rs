//! In-memory device and presenter for tests.
//!
//! [`MockDevice`] implements [`GpuDevice`] without a GPU. It mints fake
//! handles, keeps an ordered [`MockEvent`] log, enforces descriptor pool
//! capacity, executes recorded buffer copies when a submission completes,
//! and records protocol violations (resetting a command buffer that is
//! still pending, submitting with an already signaled fence, ...).
//!
//! When submissions complete is chosen with [`GpuMode`]. In
//! [`GpuMode::Manual`] the test drives completion with
//! [`MockDevice::complete_all`], possibly from another thread, and host
//! fence waits block until then or until their timeout.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ash::vk::{self, Handle};
use parking_lot::{Condvar, Mutex};

use crate::backend::{
    AcquireOutcome, FenceWait, GpuDevice, PresentOutcome, Presenter, QueueKind, SubmitDesc,
};
use crate::buffer::BufferUsage;
use crate::command::ImageBarrier;
use crate::error::{RhiError, RhiResult};
use crate::resource::{AllocatedBuffer, GpuResource, ResourceKind};

/// When submitted work completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuMode {
    /// Work completes during `submit`.
    CompleteOnSubmit,
    /// Work completes when the host waits on its fence (or idles the device).
    CompleteOnWait,
    /// Work completes only through [`MockDevice::complete_all`] or
    /// [`MockDevice::complete_next`].
    Manual,
}

/// Observable device and presentation activity, in call order.
///
/// Handles are recorded as raw values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    WaitFence(u64),
    FenceSignaled(u64),
    ResetFence(u64),
    ResetCommandBuffer(u64),
    Begin(u64),
    End(u64),
    Submit {
        queue: QueueKind,
        command_buffers: Vec<u64>,
        waits: Vec<u64>,
        signals: Vec<u64>,
        fence: u64,
    },
    CreateDescriptorPool {
        pool: u64,
        max_sets: u32,
    },
    ResetDescriptorPool(u64),
    UpdateDescriptors {
        set: u64,
        writes: usize,
    },
    Acquire {
        semaphore: u64,
        outcome: AcquireOutcome,
    },
    Present {
        image_index: u32,
        wait: u64,
        outcome: PresentOutcome,
    },
    WaitIdle,
    Destroy(ResourceKind, u64),
}

#[derive(Debug, Clone)]
enum Command {
    Copy {
        src: u64,
        dst: u64,
        regions: Vec<vk::BufferCopy>,
    },
    Barrier,
    Clear,
}

#[derive(Debug, Default)]
struct CommandBufferState {
    pool: u64,
    recording: bool,
    pending: bool,
    commands: Vec<Command>,
}

#[derive(Debug)]
struct PoolState {
    max_sets: u32,
    capacity: HashMap<vk::DescriptorType, u32>,
    sets: u32,
    used: HashMap<vk::DescriptorType, u32>,
}

#[derive(Debug)]
struct Submission {
    command_buffers: Vec<u64>,
    fence: u64,
}

#[derive(Debug, Default)]
struct State {
    next_handle: u64,
    fences: HashMap<u64, bool>,
    semaphores: HashSet<u64>,
    command_pools: HashSet<u64>,
    command_buffers: HashMap<u64, CommandBufferState>,
    layouts: HashMap<u64, Vec<(vk::DescriptorType, u32)>>,
    pools: HashMap<u64, PoolState>,
    buffers: HashMap<u64, Vec<u8>>,
    in_flight: VecDeque<Submission>,
    events: Vec<MockEvent>,
    violations: Vec<String>,
    fail_next_descriptor_allocation: Option<vk::Result>,
}

impl State {
    fn mint(&mut self) -> u64 {
        // Start well above the small literals tests use for foreign handles.
        self.next_handle += 1;
        0x1000 + self.next_handle
    }

    fn violation(&mut self, message: String) {
        self.violations.push(message);
    }

    fn complete_front(&mut self) -> bool {
        let Some(submission) = self.in_flight.pop_front() else {
            return false;
        };

        for cb in &submission.command_buffers {
            let commands = match self.command_buffers.get_mut(cb) {
                Some(state) => {
                    state.pending = false;
                    state.commands.clone()
                }
                None => Vec::new(),
            };
            for command in commands {
                if let Command::Copy { src, dst, regions } = command {
                    self.copy(src, dst, &regions);
                }
            }
        }

        if submission.fence != 0 {
            if let Some(signaled) = self.fences.get_mut(&submission.fence) {
                *signaled = true;
            }
            self.events.push(MockEvent::FenceSignaled(submission.fence));
        }
        true
    }

    fn complete_through(&mut self, fence: u64) {
        if self.in_flight.iter().any(|s| s.fence == fence) {
            while let Some(front) = self.in_flight.front() {
                let done = front.fence == fence;
                self.complete_front();
                if done {
                    break;
                }
            }
        }
    }

    fn copy(&mut self, src: u64, dst: u64, regions: &[vk::BufferCopy]) {
        let Some(source) = self.buffers.get(&src).cloned() else {
            return;
        };
        let Some(target) = self.buffers.get_mut(&dst) else {
            return;
        };
        for region in regions {
            let (s, d, n) = (
                region.src_offset as usize,
                region.dst_offset as usize,
                region.size as usize,
            );
            if s + n <= source.len() && d + n <= target.len() {
                target[d..d + n].copy_from_slice(&source[s..s + n]);
            }
        }
    }

    fn fence_pending(&self, fence: u64) -> bool {
        self.in_flight.iter().any(|s| s.fence == fence)
    }

    /// Whether a submission that has not completed copies from or to
    /// `buffer`.
    fn buffer_pending(&self, buffer: u64) -> bool {
        self.in_flight
            .iter()
            .flat_map(|s| &s.command_buffers)
            .filter_map(|cb| self.command_buffers.get(cb))
            .flat_map(|cb| &cb.commands)
            .any(|command| {
                matches!(command, Command::Copy { src, dst, .. } if *src == buffer || *dst == buffer)
            })
    }
}

/// Fake GPU device. See the module docs.
pub struct MockDevice {
    mode: GpuMode,
    graphics_family: u32,
    transfer_family: Option<u32>,
    compute_family: Option<u32>,
    state: Mutex<State>,
    signal: Condvar,
}

/// Configures queue families and completion mode of a [`MockDevice`].
#[derive(Debug, Clone)]
pub struct MockDeviceBuilder {
    mode: GpuMode,
    transfer_family: Option<u32>,
    compute_family: Option<u32>,
}

impl MockDeviceBuilder {
    pub fn mode(mut self, mode: GpuMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn transfer_family(mut self, family: Option<u32>) -> Self {
        self.transfer_family = family;
        self
    }

    pub fn compute_family(mut self, family: Option<u32>) -> Self {
        self.compute_family = family;
        self
    }

    pub fn build(self) -> Arc<MockDevice> {
        Arc::new(MockDevice {
            mode: self.mode,
            graphics_family: 0,
            transfer_family: self.transfer_family,
            compute_family: self.compute_family,
            state: Mutex::new(State::default()),
            signal: Condvar::new(),
        })
    }
}

impl MockDevice {
    /// Graphics-only device whose work completes on submit.
    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    pub fn with_mode(mode: GpuMode) -> Arc<Self> {
        Self::builder().mode(mode).build()
    }

    pub fn builder() -> MockDeviceBuilder {
        MockDeviceBuilder {
            mode: GpuMode::CompleteOnSubmit,
            transfer_family: None,
            compute_family: None,
        }
    }

    pub fn mode(&self) -> GpuMode {
        self.mode
    }

    /// Completes every in-flight submission, in order.
    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        while state.complete_front() {}
        self.signal.notify_all();
    }

    /// Completes the oldest in-flight submission. Returns false if none.
    pub fn complete_next(&self) -> bool {
        let done = self.state.lock().complete_front();
        self.signal.notify_all();
        done
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Makes the next descriptor set allocation fail with `result`.
    pub fn fail_next_descriptor_allocation(&self, result: vk::Result) {
        self.state.lock().fail_next_descriptor_allocation = Some(result);
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn destroyed_count(&self) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| matches!(e, MockEvent::Destroy(..)))
            .count()
    }

    pub fn destroyed_of_kind(&self, kind: ResourceKind) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| matches!(e, MockEvent::Destroy(k, _) if *k == kind))
            .count()
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn live_descriptor_pools(&self) -> usize {
        self.state.lock().pools.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Number of host waits issued on `fence`.
    pub fn fence_waits(&self, fence: vk::Fence) -> usize {
        let raw = fence.as_raw();
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| **e == MockEvent::WaitFence(raw))
            .count()
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer.as_raw()).cloned()
    }

    /// Whether `cmd` has been submitted and its work has not completed.
    pub fn command_buffer_pending(&self, cmd: vk::CommandBuffer) -> bool {
        self.state
            .lock()
            .command_buffers
            .get(&cmd.as_raw())
            .is_some_and(|cb| cb.pending)
    }

    pub fn recorded_commands(&self, cmd: vk::CommandBuffer) -> usize {
        self.state
            .lock()
            .command_buffers
            .get(&cmd.as_raw())
            .map_or(0, |cb| cb.commands.len())
    }

    pub(crate) fn record(&self, event: MockEvent) {
        self.state.lock().events.push(event);
    }

    fn record_command(&self, cmd: vk::CommandBuffer, command: Command) {
        let mut state = self.state.lock();
        let raw = cmd.as_raw();
        match state.command_buffers.get_mut(&raw) {
            Some(cb) if cb.recording => cb.commands.push(command),
            _ => state.violation(format!("command recorded into {raw:#x} outside begin/end")),
        }
    }
}

impl GpuDevice for MockDevice {
    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let mut state = self.state.lock();
        let raw = state.mint();
        state.fences.insert(raw, signaled);
        Ok(vk::Fence::from_raw(raw))
    }

    fn wait_fence(&self, fence: vk::Fence, timeout: Duration) -> RhiResult<FenceWait> {
        let raw = fence.as_raw();
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.events.push(MockEvent::WaitFence(raw));

        if self.mode == GpuMode::CompleteOnWait {
            state.complete_through(raw);
        }

        loop {
            match state.fences.get(&raw) {
                None => return Err(RhiError::InvalidHandle(format!("fence {raw:#x}"))),
                Some(true) => return Ok(FenceWait::Signaled),
                Some(false) => {}
            }
            if self.signal.wait_until(&mut state, deadline).timed_out() {
                return Ok(match state.fences.get(&raw) {
                    Some(true) => FenceWait::Signaled,
                    _ => FenceWait::TimedOut,
                });
            }
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()> {
        let raw = fence.as_raw();
        let mut state = self.state.lock();
        if state.fence_pending(raw) {
            state.violation(format!("fence {raw:#x} reset while pending"));
        }
        match state.fences.get_mut(&raw) {
            Some(signaled) => *signaled = false,
            None => return Err(RhiError::InvalidHandle(format!("fence {raw:#x}"))),
        }
        state.events.push(MockEvent::ResetFence(raw));
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> RhiResult<bool> {
        let raw = fence.as_raw();
        self.state
            .lock()
            .fences
            .get(&raw)
            .copied()
            .ok_or_else(|| RhiError::InvalidHandle(format!("fence {raw:#x}")))
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let mut state = self.state.lock();
        let raw = state.mint();
        state.semaphores.insert(raw);
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn queue_family(&self, kind: QueueKind) -> Option<u32> {
        match kind {
            QueueKind::Graphics => Some(self.graphics_family),
            QueueKind::Transfer => self.transfer_family,
            QueueKind::Compute => self.compute_family,
        }
    }

    fn submit(&self, kind: QueueKind, desc: &SubmitDesc<'_>) -> RhiResult<()> {
        if self.queue_family(kind).is_none() {
            return Err(RhiError::InvalidState("submit to a queue the device lacks"));
        }

        let mut state = self.state.lock();
        let fence = desc.fence.as_raw();
        if fence != 0 && state.fences.get(&fence) == Some(&true) {
            state.violation(format!("submit with signaled fence {fence:#x}"));
        }

        let mut command_buffers = Vec::with_capacity(desc.command_buffers.len());
        for cmd in desc.command_buffers {
            let raw = cmd.as_raw();
            let problem = match state.command_buffers.get_mut(&raw) {
                None => Some("unknown"),
                Some(cb) if cb.recording => Some("still recording"),
                Some(cb) if cb.pending => Some("already pending"),
                Some(cb) => {
                    cb.pending = true;
                    None
                }
            };
            if let Some(problem) = problem {
                state.violation(format!("submitted command buffer {raw:#x}: {problem}"));
            }
            command_buffers.push(raw);
        }

        state.events.push(MockEvent::Submit {
            queue: kind,
            command_buffers: command_buffers.clone(),
            waits: desc
                .wait_semaphores
                .iter()
                .map(|(s, _)| s.as_raw())
                .collect(),
            signals: desc.signal_semaphores.iter().map(|s| s.as_raw()).collect(),
            fence,
        });
        state.in_flight.push_back(Submission {
            command_buffers,
            fence,
        });

        if self.mode == GpuMode::CompleteOnSubmit {
            while state.complete_front() {}
            self.signal.notify_all();
        }
        Ok(())
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let mut state = self.state.lock();
        state.events.push(MockEvent::WaitIdle);
        while state.complete_front() {}
        self.signal.notify_all();
        Ok(())
    }

    fn create_command_pool(&self, _queue_family: u32) -> RhiResult<vk::CommandPool> {
        let mut state = self.state.lock();
        let raw = state.mint();
        state.command_pools.insert(raw);
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> RhiResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        let pool = pool.as_raw();
        if !state.command_pools.contains(&pool) {
            return Err(RhiError::InvalidHandle(format!("command pool {pool:#x}")));
        }
        let raw = state.mint();
        state.command_buffers.insert(
            raw,
            CommandBufferState {
                pool,
                ..Default::default()
            },
        );
        Ok(vk::CommandBuffer::from_raw(raw))
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> RhiResult<()> {
        let raw = cmd.as_raw();
        let mut state = self.state.lock();
        let pending = match state.command_buffers.get_mut(&raw) {
            Some(cb) => {
                cb.recording = false;
                cb.commands.clear();
                cb.pending
            }
            None => return Err(RhiError::InvalidHandle(format!("command buffer {raw:#x}"))),
        };
        if pending {
            state.violation(format!("command buffer {raw:#x} reset while pending"));
        }
        state.events.push(MockEvent::ResetCommandBuffer(raw));
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> RhiResult<()> {
        let raw = cmd.as_raw();
        let mut state = self.state.lock();
        let pending = match state.command_buffers.get_mut(&raw) {
            Some(cb) => {
                cb.recording = true;
                cb.commands.clear();
                cb.pending
            }
            None => return Err(RhiError::InvalidHandle(format!("command buffer {raw:#x}"))),
        };
        if pending {
            state.violation(format!("command buffer {raw:#x} re-recorded while pending"));
        }
        state.events.push(MockEvent::Begin(raw));
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> RhiResult<()> {
        let raw = cmd.as_raw();
        let mut state = self.state.lock();
        match state.command_buffers.get_mut(&raw) {
            Some(cb) if cb.recording => cb.recording = false,
            Some(_) => state.violation(format!("command buffer {raw:#x} ended without begin")),
            None => return Err(RhiError::InvalidHandle(format!("command buffer {raw:#x}"))),
        }
        state.events.push(MockEvent::End(raw));
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.record_command(
            cmd,
            Command::Copy {
                src: src.as_raw(),
                dst: dst.as_raw(),
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_image_barrier(&self, cmd: vk::CommandBuffer, _barrier: &ImageBarrier) {
        self.record_command(cmd, Command::Barrier);
    }

    fn cmd_clear_color_image(
        &self,
        cmd: vk::CommandBuffer,
        _image: vk::Image,
        _layout: vk::ImageLayout,
        _color: [f32; 4],
    ) {
        self.record_command(cmd, Command::Clear);
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> RhiResult<vk::DescriptorSetLayout> {
        let mut state = self.state.lock();
        let raw = state.mint();
        let demand = bindings
            .iter()
            .map(|b| (b.descriptor_type, b.descriptor_count))
            .collect();
        state.layouts.insert(raw, demand);
        Ok(vk::DescriptorSetLayout::from_raw(raw))
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> RhiResult<vk::DescriptorPool> {
        let mut state = self.state.lock();
        let raw = state.mint();
        let mut capacity = HashMap::new();
        for size in sizes {
            *capacity.entry(size.ty).or_insert(0) += size.descriptor_count;
        }
        state.pools.insert(
            raw,
            PoolState {
                max_sets,
                capacity,
                sets: 0,
                used: HashMap::new(),
            },
        );
        state
            .events
            .push(MockEvent::CreateDescriptorPool { pool: raw, max_sets });
        Ok(vk::DescriptorPool::from_raw(raw))
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, vk::Result> {
        let mut state = self.state.lock();
        if let Some(result) = state.fail_next_descriptor_allocation.take() {
            return Err(result);
        }

        let demand = state
            .layouts
            .get(&layout.as_raw())
            .cloned()
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        let pool_state = state
            .pools
            .get_mut(&pool.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;

        if pool_state.sets >= pool_state.max_sets {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        let fits = demand.iter().all(|(ty, count)| {
            let used = pool_state.used.get(ty).copied().unwrap_or(0);
            let capacity = pool_state.capacity.get(ty).copied().unwrap_or(0);
            used + count <= capacity
        });
        if !fits {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }

        pool_state.sets += 1;
        for (ty, count) in &demand {
            *pool_state.used.entry(*ty).or_insert(0) += count;
        }
        let raw = state.mint();
        Ok(vk::DescriptorSet::from_raw(raw))
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()> {
        let raw = pool.as_raw();
        let mut state = self.state.lock();
        match state.pools.get_mut(&raw) {
            Some(pool_state) => {
                pool_state.sets = 0;
                pool_state.used.clear();
            }
            None => return Err(RhiError::InvalidHandle(format!("descriptor pool {raw:#x}"))),
        }
        state.events.push(MockEvent::ResetDescriptorPool(raw));
        Ok(())
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        let set = writes.first().map_or(0, |w| w.dst_set.as_raw());
        self.record(MockEvent::UpdateDescriptors {
            set,
            writes: writes.len(),
        });
    }

    fn create_buffer(
        &self,
        _name: &str,
        size: u64,
        _usage: BufferUsage,
    ) -> RhiResult<AllocatedBuffer> {
        let mut state = self.state.lock();
        let raw = state.mint();
        state.buffers.insert(raw, vec![0; size as usize]);
        Ok(AllocatedBuffer {
            handle: vk::Buffer::from_raw(raw),
            size,
            allocation: None,
        })
    }

    fn write_buffer(
        &self,
        buffer: &mut AllocatedBuffer,
        offset: u64,
        data: &[u8],
    ) -> RhiResult<()> {
        let raw = buffer.handle.as_raw();
        let mut state = self.state.lock();
        let bytes = state
            .buffers
            .get_mut(&raw)
            .ok_or_else(|| RhiError::InvalidHandle(format!("buffer {raw:#x}")))?;
        let start = offset as usize;
        bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn destroy(&self, resource: GpuResource) {
        let kind = resource.kind();
        let raw = resource.raw();
        let mut state = self.state.lock();

        match kind {
            ResourceKind::Fence => {
                if state.fence_pending(raw) {
                    state.violation(format!("fence {raw:#x} destroyed while pending"));
                }
                state.fences.remove(&raw);
            }
            ResourceKind::Semaphore => {
                state.semaphores.remove(&raw);
            }
            ResourceKind::CommandPool => {
                state.command_pools.remove(&raw);
                let freed: Vec<u64> = state
                    .command_buffers
                    .iter()
                    .filter(|(_, cb)| cb.pool == raw)
                    .map(|(&handle, _)| handle)
                    .collect();
                for handle in freed {
                    if state.command_buffers.remove(&handle).is_some_and(|cb| cb.pending) {
                        state.violation(format!(
                            "command buffer {handle:#x} freed while pending"
                        ));
                    }
                }
            }
            ResourceKind::DescriptorPool => {
                state.pools.remove(&raw);
            }
            ResourceKind::DescriptorSetLayout => {
                state.layouts.remove(&raw);
            }
            ResourceKind::Buffer => {
                if state.buffer_pending(raw) {
                    state.violation(format!("buffer {raw:#x} destroyed while in use"));
                }
                state.buffers.remove(&raw);
            }
            _ => {}
        }

        state.events.push(MockEvent::Destroy(kind, raw));
    }
}

#[derive(Debug)]
struct PresenterState {
    next_image: u32,
    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
}

/// Presentation double that logs into its device's event log.
///
/// Acquires hand out images round-robin unless an outcome has been
/// scripted with [`script_acquire`](Self::script_acquire).
pub struct MockPresenter {
    device: Arc<MockDevice>,
    image_count: u32,
    extent: vk::Extent2D,
    state: Mutex<PresenterState>,
}

impl MockPresenter {
    pub fn new(device: Arc<MockDevice>, image_count: u32) -> Self {
        Self {
            device,
            image_count: image_count.max(1),
            extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            state: Mutex::new(PresenterState {
                next_image: 0,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
            }),
        }
    }

    /// Queues the outcome of a future acquire.
    pub fn script_acquire(&self, outcome: AcquireOutcome) {
        self.state.lock().acquire_script.push_back(outcome);
    }

    /// Queues the outcome of a future present.
    pub fn script_present(&self, outcome: PresentOutcome) {
        self.state.lock().present_script.push_back(outcome);
    }
}

impl Presenter for MockPresenter {
    fn acquire_next_image(
        &self,
        _timeout: Duration,
        signal: vk::Semaphore,
    ) -> RhiResult<AcquireOutcome> {
        let outcome = {
            let mut state = self.state.lock();
            match state.acquire_script.pop_front() {
                Some(outcome) => outcome,
                None => {
                    let image_index = state.next_image;
                    state.next_image = (state.next_image + 1) % self.image_count;
                    AcquireOutcome::Acquired {
                        image_index,
                        suboptimal: false,
                    }
                }
            }
        };
        self.device.record(MockEvent::Acquire {
            semaphore: signal.as_raw(),
            outcome,
        });
        Ok(outcome)
    }

    fn present(&self, image_index: u32, wait: vk::Semaphore) -> RhiResult<PresentOutcome> {
        let outcome = self
            .state
            .lock()
            .present_script
            .pop_front()
            .unwrap_or(PresentOutcome::Presented);
        self.device.record(MockEvent::Present {
            image_index,
            wait: wait.as_raw(),
            outcome,
        });
        Ok(outcome)
    }

    fn image(&self, image_index: u32) -> Option<vk::Image> {
        (image_index < self.image_count)
            .then(|| vk::Image::from_raw(0x9000 + u64::from(image_index)))
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}
